//! Wire types shared by the data-access layer and its consumers.
//!
//! Field names follow the remote schema (`snake_case` columns), so the
//! structs can be sent to and read from the REST and realtime endpoints
//! without renaming.

use std::{cmp::Ordering, fmt};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Collections exposed by the remote store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Organizations,
    Users,
    ExpenseCategories,
    Expenses,
}

impl Collection {
    /// Returns the table name used in REST paths and realtime topics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organizations => "organizations",
            Self::Users => "users",
            Self::ExpenseCategories => "expense_categories",
            Self::Expenses => "expenses",
        }
    }

    /// Whether row-level policies on the collection require a signed-in user.
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Users | Self::Expenses)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of a remote collection.
///
/// `snapshot_order` defines the standing order of a local snapshot and must
/// be a total order consistent with `id` (two records compare `Equal` only
/// when they have the same id).
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> Uuid;

    fn snapshot_order(&self, other: &Self) -> Ordering {
        self.id().cmp(&other.id())
    }

    /// Keeps expanded relations of `previous` that a change notification
    /// cannot carry.
    fn carry_relations(&mut self, _previous: &Self) {}
}

pub mod organization {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Organization {
        pub id: Uuid,
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub created_at: Option<DateTime<Utc>>,
    }

    impl Record for Organization {
        const COLLECTION: Collection = Collection::Organizations;

        fn id(&self) -> Uuid {
            self.id
        }

        fn snapshot_order(&self, other: &Self) -> Ordering {
            self.name.cmp(&other.name).then(self.id.cmp(&other.id))
        }
    }
}

pub mod user {
    use super::*;

    /// Profile row of the `users` collection.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct User {
        pub id: Uuid,
        pub email: String,
        #[serde(default)]
        pub full_name: Option<String>,
        #[serde(default)]
        pub organization_id: Option<Uuid>,
    }

    impl Record for User {
        const COLLECTION: Collection = Collection::Users;

        fn id(&self) -> Uuid {
            self.id
        }

        fn snapshot_order(&self, other: &Self) -> Ordering {
            self.email.cmp(&other.email).then(self.id.cmp(&other.id))
        }
    }
}

pub mod category {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Category {
        pub id: Uuid,
        pub name: String,
        #[serde(default)]
        pub organization_id: Option<Uuid>,
    }

    impl Record for Category {
        const COLLECTION: Collection = Collection::ExpenseCategories;

        fn id(&self) -> Uuid {
            self.id
        }

        fn snapshot_order(&self, other: &Self) -> Ordering {
            self.name.cmp(&other.name).then(self.id.cmp(&other.id))
        }
    }

    /// Request body for creating a category.
    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct CategoryNew {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub organization_id: Option<Uuid>,
    }

    impl CategoryNew {
        pub fn missing_fields(&self) -> Vec<&'static str> {
            let mut missing = Vec::new();
            if self.name.as_deref().is_none_or(|name| name.trim().is_empty()) {
                missing.push("name");
            }
            if self.organization_id.is_none() {
                missing.push("organization_id");
            }
            missing
        }
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct CategoryPatch {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
    }
}

pub mod expense {
    use super::*;
    use crate::{category::Category, user::User};

    /// Approval state of an expense.
    ///
    /// Transitions are decided by the remote service; the client only
    /// reads and forwards them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ExpenseStatus {
        #[default]
        Pending,
        Approved,
        Rejected,
    }

    impl ExpenseStatus {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Pending => "pending",
                Self::Approved => "approved",
                Self::Rejected => "rejected",
            }
        }
    }

    impl std::str::FromStr for ExpenseStatus {
        type Err = String;

        fn from_str(raw: &str) -> Result<Self, Self::Err> {
            match raw.to_ascii_lowercase().as_str() {
                "pending" => Ok(Self::Pending),
                "approved" => Ok(Self::Approved),
                "rejected" => Ok(Self::Rejected),
                other => Err(format!("unknown expense status: {other}")),
            }
        }
    }

    /// A row of the `expenses` collection.
    ///
    /// `category` and `user` are only present when the fetch asked for the
    /// `expense_categories` / `users` expansion.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Expense {
        pub id: Uuid,
        pub amount: Decimal,
        pub category_id: Uuid,
        #[serde(default)]
        pub description: Option<String>,
        pub expense_date: NaiveDate,
        pub organization_id: Uuid,
        pub user_id: Uuid,
        #[serde(default)]
        pub status: ExpenseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub created_at: Option<DateTime<Utc>>,
        #[serde(
            rename = "expense_categories",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        pub category: Option<Category>,
        #[serde(rename = "users", default, skip_serializing_if = "Option::is_none")]
        pub user: Option<User>,
    }

    impl Record for Expense {
        const COLLECTION: Collection = Collection::Expenses;

        fn id(&self) -> Uuid {
            self.id
        }

        /// Newest expense first; same-day expenses ordered by id.
        fn snapshot_order(&self, other: &Self) -> Ordering {
            other
                .expense_date
                .cmp(&self.expense_date)
                .then(self.id.cmp(&other.id))
        }

        fn carry_relations(&mut self, previous: &Self) {
            if self.category.is_none() && previous.category_id == self.category_id {
                self.category = previous.category.clone();
            }
            if self.user.is_none() && previous.user_id == self.user_id {
                self.user = previous.user.clone();
            }
        }
    }

    /// Request body for creating an expense.
    ///
    /// Every field is optional on the wire so that a missing value is
    /// reported as a validation error instead of being rejected remotely.
    /// `status` is not writable here: the service defaults it to `pending`.
    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct ExpenseNew {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub amount: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub category_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub expense_date: Option<NaiveDate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub organization_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub user_id: Option<Uuid>,
    }

    impl ExpenseNew {
        /// Names of the required columns that are not set.
        pub fn missing_fields(&self) -> Vec<&'static str> {
            let mut missing = Vec::new();
            if self.amount.is_none() {
                missing.push("amount");
            }
            if self.category_id.is_none() {
                missing.push("category_id");
            }
            if self.expense_date.is_none() {
                missing.push("expense_date");
            }
            if self.organization_id.is_none() {
                missing.push("organization_id");
            }
            if self.user_id.is_none() {
                missing.push("user_id");
            }
            missing
        }
    }

    /// Partial update of an expense. Unset fields are left untouched.
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct ExpensePatch {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub amount: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub category_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub expense_date: Option<NaiveDate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub status: Option<ExpenseStatus>,
    }

    impl ExpensePatch {
        pub fn is_empty(&self) -> bool {
            self == &Self::default()
        }
    }
}

pub mod change {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ChangeKind {
        Inserted,
        Updated,
        Deleted,
    }

    /// A committed change of one remote row.
    ///
    /// Deletions carry the prior row when the service sends it; with the
    /// default replica identity only the primary key is known.
    #[derive(Clone, Debug, PartialEq)]
    pub enum ChangeEvent<T> {
        Inserted(T),
        Updated(T),
        Deleted { id: Uuid, prior: Option<T> },
    }

    impl<T: Record> ChangeEvent<T> {
        pub fn kind(&self) -> ChangeKind {
            match self {
                Self::Inserted(_) => ChangeKind::Inserted,
                Self::Updated(_) => ChangeKind::Updated,
                Self::Deleted { .. } => ChangeKind::Deleted,
            }
        }

        pub fn id(&self) -> Uuid {
            match self {
                Self::Inserted(record) | Self::Updated(record) => record.id(),
                Self::Deleted { id, .. } => *id,
            }
        }

        /// New state for inserts and updates, prior state (if known) for deletes.
        pub fn record(&self) -> Option<&T> {
            match self {
                Self::Inserted(record) | Self::Updated(record) => Some(record),
                Self::Deleted { prior, .. } => prior.as_ref(),
            }
        }
    }
}

pub mod auth {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct PasswordCredentials {
        pub email: String,
        pub password: String,
    }

    #[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct UserMetadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub full_name: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct SignUp {
        pub email: String,
        pub password: String,
        /// Stored by the auth service as user metadata.
        pub data: UserMetadata,
    }

    /// Identity as reported by the auth service.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AuthUser {
        pub id: Uuid,
        #[serde(default)]
        pub email: Option<String>,
        #[serde(default)]
        pub user_metadata: UserMetadata,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Session {
        pub access_token: String,
        #[serde(default)]
        pub token_type: Option<String>,
        #[serde(default)]
        pub expires_in: Option<i64>,
        /// Unix timestamp (seconds).
        #[serde(default)]
        pub expires_at: Option<i64>,
        #[serde(default)]
        pub refresh_token: Option<String>,
        pub user: AuthUser,
    }

    impl Session {
        pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
            self.expires_at
                .is_some_and(|expires_at| expires_at <= now.timestamp())
        }
    }

    /// Sign-up returns a session when the account is usable immediately and
    /// only the user when the service waits for email confirmation.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum SignUpResponse {
        Session(Session),
        User(AuthUser),
    }
}
