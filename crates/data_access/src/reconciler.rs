//! Local snapshot of a collection kept consistent with remote changes.
//!
//! The snapshot is the single source of truth for presentation code. It is
//! replaced wholesale by a fetch and then patched by change events, always
//! keeping one row per id in the record's standing order.

use std::{
    collections::{HashMap, hash_map::Entry},
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use api_types::{Record, change::ChangeEvent};
use uuid::Uuid;

use crate::{error::Result, query::Query, realtime::SubscriptionEvent, repository::Repository};

/// Immutable view of the rows at one point in time.
///
/// Later mutations of the reconciler never affect a view already taken.
#[derive(Debug)]
pub struct Snapshot<T>(Arc<Vec<T>>);

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Record> Snapshot<T> {
    pub fn get(&self, id: Uuid) -> Option<&T> {
        self.0.iter().find(|row| row.id() == id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.0.iter().map(Record::id).collect()
    }
}

struct Inner<T> {
    rows: Arc<Vec<T>>,
    /// Refreshes currently awaiting their fetch.
    refreshing: usize,
    /// Events applied while a refresh was in flight, replayed on top of its
    /// result.
    replay: Vec<ChangeEvent<T>>,
}

/// Owner of a collection snapshot. Clones share the same snapshot.
pub struct Reconciler<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Reconciler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Record> Default for Reconciler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> Reconciler<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rows: Arc::new(Vec::new()),
                refreshing: 0,
                replay: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn view(&self) -> Snapshot<T> {
        Snapshot(Arc::clone(&self.lock().rows))
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<T> {
        self.lock().rows.iter().find(|row| row.id() == id).cloned()
    }

    /// Replaces the snapshot with `rows`. Duplicate ids keep the last
    /// occurrence.
    pub fn replace_all(&self, rows: Vec<T>) {
        let rows = normalize(rows);
        self.lock().rows = Arc::new(rows);
    }

    /// Applies one change. Upserts keep the standing order and deleting an
    /// absent id does nothing.
    pub fn apply_event(&self, event: ChangeEvent<T>) {
        let mut inner = self.lock();
        if inner.refreshing > 0 {
            inner.replay.push(event.clone());
        }
        apply(Arc::make_mut(&mut inner.rows), event);
    }

    /// Feeds a subscription event in; status and error events are ignored.
    pub fn apply_subscription_event(&self, event: SubscriptionEvent<T>) {
        if let SubscriptionEvent::Change(change) = event {
            self.apply_event(change);
        }
    }

    /// Handler that keeps this reconciler in sync with a subscription.
    pub fn handler(&self) -> impl FnMut(SubscriptionEvent<T>) + Send + 'static {
        let reconciler = self.clone();
        move |event| reconciler.apply_subscription_event(event)
    }

    /// Fetches `query` and replaces the snapshot with the result.
    ///
    /// Changes applied while the fetch is in flight are replayed on top of
    /// the fetched rows, so a refresh never rolls back a newer event. On
    /// error, or if the future is dropped, the snapshot is left as it was.
    pub async fn refresh(&self, repository: &Repository<T>, query: &Query) -> Result<Snapshot<T>> {
        let refresh = RefreshGuard::begin(self);
        let rows = repository.fetch_all(query).await?;

        let mut inner = self.lock();
        let mut rows = normalize(rows);
        for event in inner.replay[refresh.start..].iter().cloned() {
            apply(&mut rows, event);
        }
        inner.rows = Arc::new(rows);
        let snapshot = Snapshot(Arc::clone(&inner.rows));
        drop(inner);
        drop(refresh);

        tracing::debug!(collection = %T::COLLECTION, rows = snapshot.len(), "snapshot refreshed");
        Ok(snapshot)
    }
}

struct RefreshGuard<'a, T> {
    reconciler: &'a Reconciler<T>,
    start: usize,
}

impl<'a, T: Record> RefreshGuard<'a, T> {
    fn begin(reconciler: &'a Reconciler<T>) -> Self {
        let mut inner = reconciler.lock();
        inner.refreshing += 1;
        let start = inner.replay.len();
        Self { reconciler, start }
    }
}

impl<T> Drop for RefreshGuard<'_, T> {
    fn drop(&mut self) {
        let mut inner = self
            .reconciler
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        inner.refreshing -= 1;
        if inner.refreshing == 0 {
            inner.replay.clear();
        }
    }
}

fn normalize<T: Record>(rows: Vec<T>) -> Vec<T> {
    let mut slots: HashMap<Uuid, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        match slots.entry(row.id()) {
            Entry::Occupied(slot) => unique[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(unique.len());
                unique.push(row);
            }
        }
    }
    unique.sort_by(T::snapshot_order);
    unique
}

fn apply<T: Record>(rows: &mut Vec<T>, event: ChangeEvent<T>) {
    match event {
        ChangeEvent::Inserted(mut row) | ChangeEvent::Updated(mut row) => {
            if let Some(index) = rows.iter().position(|kept| kept.id() == row.id()) {
                let previous = rows.remove(index);
                row.carry_relations(&previous);
            }
            let at = rows
                .binary_search_by(|kept| kept.snapshot_order(&row))
                .unwrap_or_else(|at| at);
            rows.insert(at, row);
        }
        ChangeEvent::Deleted { id, .. } => rows.retain(|kept| kept.id() != id),
    }
}
