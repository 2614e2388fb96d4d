//! Live change subscriptions with automatic reconnection.
//!
//! A [`Subscriptions`] manager opens change streams through a [`ChangeFeed`]
//! and runs each subscription as its own task:
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Reconnecting -> Connecting -> ...
//!                                          \-> Closed (cancelled or retries exhausted)
//! ```
//!
//! Handlers are called one event at a time, in arrival order. Once
//! [`CancelHandle::cancel`] returns, the handler is never called again.

mod protocol;
mod websocket;

use std::{
    cell::Cell,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use api_types::{Collection, Record, change::ChangeEvent};
use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::websocket::WebSocketFeed;
use crate::{error::SubscriptionError, retry::Backoff};

pub type ChangeStream<T> = BoxStream<'static, Result<ChangeEvent<T>, SubscriptionError>>;

/// Source of change streams.
///
/// A stream yields `Err` for failures; errors whose
/// [`ends_stream`](SubscriptionError::ends_stream) is true, or the end of the
/// stream, make the manager reconnect.
pub trait ChangeFeed<T>: Send + Sync + 'static {
    fn open(
        &self,
        collection: Collection,
    ) -> BoxFuture<'static, Result<ChangeStream<T>, SubscriptionError>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

/// What a subscription handler receives.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent<T> {
    Change(ChangeEvent<T>),
    Status(SubscriptionState),
    Error(SubscriptionError),
}

/// Opens subscriptions on one feed, reconnecting dropped streams with
/// bounded exponential backoff.
pub struct Subscriptions<F> {
    feed: Arc<F>,
    backoff: Backoff,
}

impl<F> Clone for Subscriptions<F> {
    fn clone(&self) -> Self {
        Self {
            feed: Arc::clone(&self.feed),
            backoff: self.backoff,
        }
    }
}

impl<F> Subscriptions<F> {
    pub fn new(feed: F) -> Self {
        Self {
            feed: Arc::new(feed),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Subscribes `handler` to every change of `T`'s collection.
    ///
    /// Must be called inside a tokio runtime. The subscription runs until the
    /// returned handle is cancelled or reconnection gives up; dropping the
    /// handle does not cancel it.
    #[must_use = "dropping the handle leaves the subscription running"]
    pub fn subscribe<T, H>(&self, handler: H) -> CancelHandle
    where
        T: Record,
        F: ChangeFeed<T>,
        H: FnMut(SubscriptionEvent<T>) + Send + 'static,
    {
        let delivery = Arc::new(Delivery {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            handler: Mutex::new(Some(handler)),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SubscriptionState::Idle),
        });
        let token = CancellationToken::new();

        tokio::spawn(run::<T, F, H>(
            Arc::clone(&self.feed),
            self.backoff,
            Arc::clone(&delivery),
            token.clone(),
        ));

        CancelHandle {
            token,
            control: delivery,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Subscription whose handler is running on this thread, 0 if none.
    static DELIVERING: Cell<u64> = const { Cell::new(0) };
}

struct DeliveringGuard {
    previous: u64,
}

impl DeliveringGuard {
    fn enter(id: u64) -> Self {
        Self {
            previous: DELIVERING.with(|current| current.replace(id)),
        }
    }
}

impl Drop for DeliveringGuard {
    fn drop(&mut self) {
        DELIVERING.with(|current| current.set(self.previous));
    }
}

struct Delivery<H> {
    id: u64,
    handler: Mutex<Option<H>>,
    cancelled: AtomicBool,
    state: Mutex<SubscriptionState>,
}

impl<H> Delivery<H> {
    /// Calls the handler unless the subscription was cancelled. The handler
    /// lock is held for the whole call so `cancel` can wait for it.
    fn deliver<T>(&self, event: SubscriptionEvent<T>)
    where
        H: FnMut(SubscriptionEvent<T>),
    {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if let Some(callback) = handler.as_mut() {
            let _guard = DeliveringGuard::enter(self.id);
            callback(event);
        }
        // Cancelled from inside the callback: release it now that it returned.
        if self.cancelled.load(Ordering::Acquire) {
            handler.take();
        }
    }

    fn transition<T>(&self, state: SubscriptionState)
    where
        H: FnMut(SubscriptionEvent<T>),
    {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.deliver(SubscriptionEvent::Status(state));
    }
}

trait Control: Send + Sync {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
    fn state(&self) -> SubscriptionState;
}

impl<H: Send> Control for Delivery<H> {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // From inside our own handler the lock is already held by this thread.
        if DELIVERING.with(Cell::get) == self.id {
            return;
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(handler);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stops one subscription. Clones control the same subscription.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    control: Arc<dyn Control>,
}

impl CancelHandle {
    /// Stops delivery and releases the stream.
    ///
    /// Idempotent. When it returns, no handler invocation is running (unless
    /// called from within the handler itself) and none will start.
    pub fn cancel(&self) {
        self.token.cancel();
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn state(&self) -> SubscriptionState {
        self.control.state()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

async fn run<T, F, H>(
    feed: Arc<F>,
    backoff: Backoff,
    delivery: Arc<Delivery<H>>,
    token: CancellationToken,
) where
    T: Record,
    F: ChangeFeed<T>,
    H: FnMut(SubscriptionEvent<T>) + Send + 'static,
{
    let collection = T::COLLECTION;
    let mut failures: u32 = 0;

    'session: loop {
        delivery.transition::<T>(SubscriptionState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => break 'session,
            opened = feed.open(collection) => opened,
        };

        match opened {
            Ok(mut stream) => {
                failures = 0;
                info!(%collection, "change stream open");
                delivery.transition::<T>(SubscriptionState::Streaming);

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => break 'session,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => delivery.deliver(SubscriptionEvent::Change(event)),
                        Some(Err(err)) if !err.ends_stream() => {
                            debug!(%collection, "skipping change: {err}");
                            delivery.deliver(SubscriptionEvent::<T>::Error(err));
                        }
                        Some(Err(err)) => {
                            warn!(%collection, "change stream lost: {err}");
                            delivery.deliver(SubscriptionEvent::<T>::Error(err));
                            break;
                        }
                        None => {
                            warn!(%collection, "change stream ended");
                            delivery.deliver(SubscriptionEvent::<T>::Error(
                                SubscriptionError::Dropped("stream ended".to_string()),
                            ));
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%collection, attempt = failures, "failed to open change stream: {err}");
                delivery.deliver(SubscriptionEvent::<T>::Error(err));
            }
        }

        failures += 1;
        if failures > backoff.max_attempts {
            warn!(%collection, attempts = backoff.max_attempts, "giving up on change stream");
            delivery.deliver(SubscriptionEvent::<T>::Error(SubscriptionError::Exhausted {
                attempts: backoff.max_attempts,
            }));
            break;
        }

        delivery.transition::<T>(SubscriptionState::Reconnecting);
        let delay = backoff.delay(failures);
        debug!(
            %collection,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    delivery.transition::<T>(SubscriptionState::Closed);
    debug!(%collection, "subscription closed");
}
