//! Typed access to the hosted expenses backend.
//!
//! - [`ClientHandle`]: endpoint, credential and auth session shared by
//!   everything else.
//! - [`Repository`]: CRUD over one collection.
//! - [`Subscriptions`]: live change notifications with reconnection.
//! - [`Reconciler`]: local snapshot patched by those notifications.

pub use client::{ClientHandle, connect};
pub use config::ConnectionConfig;
pub use error::{AuthError, Error, Result, SubscriptionError};
pub use query::{Direction, Order, Query};
pub use realtime::{
    CancelHandle, ChangeFeed, ChangeStream, SubscriptionEvent, SubscriptionState, Subscriptions,
    WebSocketFeed,
};
pub use reconciler::{Reconciler, Snapshot};
pub use repository::{DeletePolicy, Repository, Writable};
pub use retry::{Backoff, retry_read};

mod auth;
mod client;
mod config;
mod error;
mod query;
mod realtime;
mod reconciler;
mod repository;
mod retry;
