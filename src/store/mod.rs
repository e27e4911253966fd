//! Storage collaborator.
//!
//! Every logical operation runs inside one [`Transaction`]: token rows, user
//! changes and the audit entry are committed or rolled back together. Reads
//! are scoped (soft-deleted rows are hidden) unless the method says otherwise.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{AuditEntry, Class, TokenRecord, User};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("duplicate value violates unique constraint {0}")]
    UniqueViolation(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// How to pick a token row.
#[derive(Debug, Clone, Copy)]
pub enum TokenFilter<'a> {
    Owner(Uuid),
    Secret(&'a str),
}

#[derive(Debug, Clone, Copy)]
pub enum UserFilter<'a> {
    Id(Uuid),
    Email(&'a str),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;

    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait Transaction: Send {
    /// Insert a token row, assigning `created_at` (and the derived expiry).
    async fn create_token(&mut self, record: &mut TokenRecord) -> StoreResult<()>;

    /// Persist usage counters, send stamps, data and revocation.
    async fn save_token(&mut self, record: &TokenRecord) -> StoreResult<()>;

    /// Oldest live row matching the filter.
    async fn first_token(
        &mut self,
        class: Class,
        filter: TokenFilter<'_>,
    ) -> StoreResult<Option<TokenRecord>>;

    /// Live row holding `secret`, locked against concurrent writers until the
    /// transaction ends. A writer that committed first hides the row.
    async fn lock_token(&mut self, class: Class, secret: &str) -> StoreResult<Option<TokenRecord>>;

    /// Live row for `owner` with the most recent `sent_at`.
    async fn last_sent_token(&mut self, class: Class, owner: Uuid)
        -> StoreResult<Option<TokenRecord>>;

    /// Soft delete. Fails with [`StoreError::NotFound`] when the row is
    /// already revoked.
    async fn delete_token(&mut self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    /// Hard delete of every row of `class` owned by `owner`, revoked ones included.
    async fn purge_tokens(&mut self, class: Class, owner: Uuid) -> StoreResult<u64>;

    /// Fails with [`StoreError::UniqueViolation`] when the email is taken.
    async fn create_user(&mut self, user: &User) -> StoreResult<()>;

    async fn save_user(&mut self, user: &User) -> StoreResult<()>;

    async fn first_user(&mut self, filter: UserFilter<'_>) -> StoreResult<Option<User>>;

    /// Soft delete, or hard delete when `hard` is set.
    async fn delete_user(&mut self, id: Uuid, hard: bool, at: DateTime<Utc>) -> StoreResult<()>;

    async fn create_audit_entry(&mut self, entry: &AuditEntry) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
