//! Typed CRUD over one remote collection.
//!
//! Nothing here retries: a failed read can be repeated by the caller
//! (see [`retry_read`]), a failed write is reported as-is because `create`
//! is not idempotent.
//!
//! [`retry_read`]: crate::retry_read

use std::marker::PhantomData;

use api_types::{
    Collection, Record,
    category::{Category, CategoryNew, CategoryPatch},
    expense::{Expense, ExpenseNew, ExpensePatch},
};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    client::{ClientHandle, expect_success},
    error::{Error, Result},
    query::Query,
};

const PREFER: &str = "Prefer";
const RETURN_REPRESENTATION: &str = "return=representation";
const RETURN_MINIMAL: &str = "return=minimal";

/// How `delete` treats an id that does not exist (anymore).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Absence is the goal of a delete, so a missing id is success. A 404
    /// from the service is swallowed.
    #[default]
    Idempotent,
    /// Missing ids are reported as [`Error::NotFound`].
    Strict,
}

/// Records that can be created and patched through a [`Repository`].
pub trait Writable: Record {
    type New: Serialize + Send + Sync;
    type Patch: Serialize + Send + Sync;

    /// Rejects a create payload before it is sent.
    fn check_new(new: &Self::New) -> Result<()>;

    /// Rejects an update payload before it is sent.
    fn check_patch(patch: &Self::Patch) -> Result<()>;
}

impl Writable for Expense {
    type New = ExpenseNew;
    type Patch = ExpensePatch;

    fn check_new(new: &ExpenseNew) -> Result<()> {
        let missing = new.missing_fields();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        if let Some(amount) = new.amount {
            if amount.is_zero() || amount.is_sign_negative() {
                return Err(Error::Validation(format!(
                    "amount must be positive, got {amount}"
                )));
            }
        }
        Ok(())
    }

    fn check_patch(patch: &ExpensePatch) -> Result<()> {
        if patch.is_empty() {
            return Err(Error::Validation("nothing to update".to_string()));
        }
        if let Some(amount) = patch.amount {
            if amount.is_zero() || amount.is_sign_negative() {
                return Err(Error::Validation(format!(
                    "amount must be positive, got {amount}"
                )));
            }
        }
        Ok(())
    }
}

impl Writable for Category {
    type New = CategoryNew;
    type Patch = CategoryPatch;

    fn check_new(new: &CategoryNew) -> Result<()> {
        let missing = new.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    fn check_patch(patch: &CategoryPatch) -> Result<()> {
        match patch.name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(()),
            _ => Err(Error::Validation("name is required".to_string())),
        }
    }
}

/// Access to the collection of `T`.
///
/// Calls on policy-protected collections (`users`, `expenses`) check for a
/// signed-in session first and fail with `AuthError::NoSession` without
/// touching the network.
#[derive(Clone)]
pub struct Repository<T> {
    client: ClientHandle,
    delete_policy: DeletePolicy,
    require_session: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Repository<T> {
    pub fn new(client: ClientHandle) -> Self {
        Self {
            client,
            delete_policy: DeletePolicy::default(),
            require_session: T::COLLECTION.is_protected(),
            _record: PhantomData,
        }
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Turns the signed-in precondition on or off, e.g. for a service
    /// credential that bypasses row-level policies.
    pub fn with_session_check(mut self, enabled: bool) -> Self {
        self.require_session = enabled;
        self
    }

    pub fn collection(&self) -> Collection {
        T::COLLECTION
    }

    fn precondition(&self) -> Result<()> {
        if self.require_session {
            self.client.require_session()?;
        }
        Ok(())
    }

    fn not_found(id: Uuid) -> Error {
        Error::NotFound {
            collection: T::COLLECTION,
            id,
        }
    }

    /// Reads every row visible to the caller, ordered and expanded as
    /// described by `query`.
    pub async fn fetch_all(&self, query: &Query) -> Result<Vec<T>> {
        self.precondition()?;

        let response = self
            .client
            .request(Method::GET, self.client.rest_url(T::COLLECTION)?)
            .query(&query.params())
            .send()
            .await?;
        let rows = expect_success(response).await?.json::<Vec<T>>().await?;

        tracing::debug!(collection = %T::COLLECTION, rows = rows.len(), "fetched rows");
        Ok(rows)
    }

    pub async fn fetch_one(&self, id: Uuid, query: &Query) -> Result<T> {
        let query = query.clone().eq("id", id);
        self.fetch_all(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Self::not_found(id))
    }

    /// Deletes the row with `id`.
    ///
    /// Under [`DeletePolicy::Idempotent`] deleting a missing id succeeds,
    /// including when the service answers 404; any other failure is
    /// returned.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.precondition()?;

        let prefer = match self.delete_policy {
            DeletePolicy::Idempotent => RETURN_MINIMAL,
            DeletePolicy::Strict => RETURN_REPRESENTATION,
        };
        let response = self
            .client
            .request(Method::DELETE, self.client.rest_url(T::COLLECTION)?)
            .query(&[("id", format!("eq.{id}"))])
            .header(PREFER, prefer)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return match self.delete_policy {
                DeletePolicy::Idempotent => {
                    tracing::debug!(collection = %T::COLLECTION, %id, "delete of absent row");
                    Ok(())
                }
                DeletePolicy::Strict => Err(Self::not_found(id)),
            };
        }

        let response = expect_success(response).await?;
        if self.delete_policy == DeletePolicy::Strict {
            let rows = response.json::<Vec<serde_json::Value>>().await?;
            if rows.is_empty() {
                return Err(Self::not_found(id));
            }
        }

        tracing::debug!(collection = %T::COLLECTION, %id, "deleted row");
        Ok(())
    }
}

impl<T: Writable> Repository<T> {
    /// Inserts a row and returns it as stored, with the id and defaults the
    /// service assigned.
    pub async fn create(&self, fields: &T::New) -> Result<T> {
        T::check_new(fields)?;
        self.precondition()?;

        let response = self
            .client
            .request(Method::POST, self.client.rest_url(T::COLLECTION)?)
            .header(PREFER, RETURN_REPRESENTATION)
            .json(fields)
            .send()
            .await?;
        let response = expect_success(response).await?;
        let status = response.status();

        // The service answers with an array even for a single insert.
        let created = response
            .json::<Vec<T>>()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Remote {
                status,
                message: "insert returned no row".to_string(),
            })?;

        tracing::debug!(collection = %T::COLLECTION, id = %created.id(), "created row");
        Ok(created)
    }

    /// Applies `patch` to the row with `id`; fields absent from the patch
    /// keep their value.
    pub async fn update(&self, id: Uuid, patch: &T::Patch) -> Result<T> {
        T::check_patch(patch)?;
        self.precondition()?;

        let response = self
            .client
            .request(Method::PATCH, self.client.rest_url(T::COLLECTION)?)
            .query(&[("id", format!("eq.{id}"))])
            .header(PREFER, RETURN_REPRESENTATION)
            .json(patch)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Self::not_found(id));
        }

        let updated = expect_success(response)
            .await?
            .json::<Vec<T>>()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Self::not_found(id))?;

        tracing::debug!(collection = %T::COLLECTION, %id, "updated row");
        Ok(updated)
    }
}
