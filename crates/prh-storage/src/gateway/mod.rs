//! Persistence of pull-request records and the identity directory.
//!
//! Records were historically unique by `number` alone. [`Store::migrate_key_schema`]
//! moves a store to uniqueness on `(number, repository)`; until it runs, the
//! gateway still works but rejects a second repository's PR with an already
//! used number.

use async_trait::async_trait;
use prh_core::{AuthorRef, IdentityRecord, PullRequestKey, PullRequestRecord, Window};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pull request #{number} already stored under another repository than {repository}")]
    DuplicateKey { number: u64, repository: String },
    #[error("email {0} is already used by another identity")]
    EmailTaken(String),
    #[error("identity {0} not found")]
    IdentityNotFound(i64),
    #[error("an identity for external account {0} already exists")]
    DuplicateIdentity(u64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySchema {
    /// No uniqueness enforced at all.
    Unindexed,
    /// Legacy: unique by number.
    NumberOnly,
    NumberAndRepository,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub previous: KeySchema,
    pub duplicates_removed: u64,
    pub normalized: u64,
    /// False when the composite unique index could not be created. The store
    /// then keeps working without the constraint.
    pub composite_index: bool,
}

impl MigrationOutcome {
    /// Outcome of a migration that found the composite key already in place.
    pub fn already_migrated() -> Self {
        Self {
            previous: KeySchema::NumberAndRepository,
            duplicates_removed: 0,
            normalized: 0,
            composite_index: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Pagination over records touching an optional window, newest update first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowQuery {
    pub window: Option<Window>,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

impl WindowQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total.div_ceil(u64::from(limit))
        };
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

/// Locally-entered contact fields. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Everything the pipeline and the aggregator need from persistence.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ensure_schema(&self) -> StoreResult<()>;

    async fn key_schema(&self) -> StoreResult<KeySchema>;

    /// A store already on the composite key is left untouched. Otherwise
    /// `default_repository` (`owner/name`) fills rows stored without one, or
    /// with the bare name only.
    async fn migrate_key_schema(&self, default_repository: &str) -> StoreResult<MigrationOutcome>;

    async fn upsert_pull_request(&self, record: &PullRequestRecord) -> StoreResult<UpsertOutcome>;

    async fn get_pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> StoreResult<Option<PullRequestRecord>>;

    async fn query_pull_requests(&self, query: &WindowQuery) -> StoreResult<Page<PullRequestRecord>>;

    /// Records created or updated inside `window`, newest update first.
    async fn pull_requests_in(&self, window: &Window) -> StoreResult<Vec<PullRequestRecord>>;

    async fn all_pull_requests(&self) -> StoreResult<Vec<PullRequestRecord>>;

    /// Returns false when no record has that key.
    async fn set_author(&self, key: &PullRequestKey, author: &AuthorRef) -> StoreResult<bool>;

    async fn find_identity_by_github_id(&self, github_id: u64) -> StoreResult<Option<IdentityRecord>>;

    async fn find_identity_by_login(&self, login: &str) -> StoreResult<Option<IdentityRecord>>;

    /// Returns the stored record with its id.
    async fn insert_identity(&self, identity: &IdentityRecord) -> StoreResult<IdentityRecord>;

    /// Overwrites the record with `identity.id`.
    async fn update_identity(&self, identity: &IdentityRecord) -> StoreResult<IdentityRecord>;

    async fn all_identities(&self) -> StoreResult<Vec<IdentityRecord>>;

    async fn list_identities(&self, page: u32, limit: u32) -> StoreResult<Page<IdentityRecord>>;

    async fn get_identity(&self, id: i64) -> StoreResult<Option<IdentityRecord>>;

    async fn update_contact(&self, id: i64, update: &ContactUpdate) -> StoreResult<IdentityRecord>;

    /// Returns false when nothing was deleted.
    async fn delete_identity(&self, id: i64) -> StoreResult<bool>;
}
