//! In-process store.
//!
//! A transaction holds the state lock for its whole lifetime and works on a
//! copy, so transactions are serialized and rollback simply drops the copy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, TokenFilter, Transaction, UserFilter};
use crate::models::{AuditEntry, Class, TokenRecord, User};

#[derive(Debug, Clone, Default)]
struct State {
    users: Vec<User>,
    tokens: Vec<TokenRecord>,
    audit: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    fail_audit: Arc<AtomicBool>,
    missed_owner_reads: Arc<AtomicUsize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every audit write fail, to exercise rollback paths.
    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` owner lookups come back empty, the way a read
    /// that raced another transaction's grant would.
    pub fn miss_owner_reads(&self, count: usize) {
        self.missed_owner_reads.store(count, Ordering::SeqCst);
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    /// Every token row, revoked ones included.
    pub async fn token_records(&self) -> Vec<TokenRecord> {
        self.state.lock().await.tokens.clone()
    }

    /// Every user row, soft-deleted ones included.
    pub async fn user_records(&self) -> Vec<User> {
        self.state.lock().await.users.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            fail_audit: self.fail_audit.load(Ordering::SeqCst),
            missed_owner_reads: Arc::clone(&self.missed_owner_reads),
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
    fail_audit: bool,
    missed_owner_reads: Arc<AtomicUsize>,
}

fn live(record: &TokenRecord, class: Class) -> bool {
    record.class == class && record.access.deleted_at.is_none()
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn create_token(&mut self, record: &mut TokenRecord) -> StoreResult<()> {
        let access = &record.access;
        let single_live = matches!(record.class, Class::Refresh | Class::Confirm);
        let duplicate = self.working.tokens.iter().any(|t| {
            let same_owner = t.class == record.class && t.access.user_id == access.user_id;
            t.access.id == access.id
                || (same_owner && t.access.token == access.token)
                || (same_owner && single_live && t.access.deleted_at.is_none())
        });
        if duplicate {
            return Err(StoreError::UniqueViolation("access_tokens_owner_token".into()));
        }
        record.access.stamp_created(Utc::now());
        self.working.tokens.push(record.clone());
        Ok(())
    }

    async fn save_token(&mut self, record: &TokenRecord) -> StoreResult<()> {
        let row = self
            .working
            .tokens
            .iter_mut()
            .find(|t| t.access.id == record.access.id)
            .ok_or(StoreError::NotFound)?;
        *row = record.clone();
        Ok(())
    }

    async fn first_token(
        &mut self,
        class: Class,
        filter: TokenFilter<'_>,
    ) -> StoreResult<Option<TokenRecord>> {
        if matches!(filter, TokenFilter::Owner(_))
            && self
                .missed_owner_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(None);
        }
        Ok(self
            .working
            .tokens
            .iter()
            .filter(|t| live(t, class))
            .find(|t| match filter {
                TokenFilter::Owner(owner) => t.access.user_id == owner,
                TokenFilter::Secret(secret) => t.access.token == secret,
            })
            .cloned())
    }

    // The whole state is already held by this transaction.
    async fn lock_token(&mut self, class: Class, secret: &str) -> StoreResult<Option<TokenRecord>> {
        self.first_token(class, TokenFilter::Secret(secret)).await
    }

    async fn last_sent_token(
        &mut self,
        class: Class,
        owner: Uuid,
    ) -> StoreResult<Option<TokenRecord>> {
        Ok(self
            .working
            .tokens
            .iter()
            .filter(|t| live(t, class) && t.access.user_id == owner && t.sent_at.is_some())
            .max_by_key(|t| t.sent_at)
            .cloned())
    }

    async fn delete_token(&mut self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let row = self
            .working
            .tokens
            .iter_mut()
            .find(|t| t.access.id == id && t.access.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;
        row.access.deleted_at = Some(at);
        Ok(())
    }

    async fn purge_tokens(&mut self, class: Class, owner: Uuid) -> StoreResult<u64> {
        let before = self.working.tokens.len();
        self.working
            .tokens
            .retain(|t| !(t.class == class && t.access.user_id == owner));
        Ok((before - self.working.tokens.len()) as u64)
    }

    async fn create_user(&mut self, user: &User) -> StoreResult<()> {
        let taken = self
            .working
            .users
            .iter()
            .any(|u| u.id == user.id || (u.deleted_at.is_none() && u.email == user.email));
        if taken {
            return Err(StoreError::UniqueViolation("users_email_key".into()));
        }
        self.working.users.push(user.clone());
        Ok(())
    }

    async fn save_user(&mut self, user: &User) -> StoreResult<()> {
        let row = self
            .working
            .users
            .iter_mut()
            .find(|u| u.id == user.id && u.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;
        *row = user.clone();
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn first_user(&mut self, filter: UserFilter<'_>) -> StoreResult<Option<User>> {
        Ok(self
            .working
            .users
            .iter()
            .filter(|u| u.deleted_at.is_none())
            .find(|u| match filter {
                UserFilter::Id(id) => u.id == id,
                UserFilter::Email(email) => u.email == email,
            })
            .cloned())
    }

    async fn delete_user(&mut self, id: Uuid, hard: bool, at: DateTime<Utc>) -> StoreResult<()> {
        if hard {
            self.working.users.retain(|u| u.id != id);
        } else if let Some(row) = self
            .working
            .users
            .iter_mut()
            .find(|u| u.id == id && u.deleted_at.is_none())
        {
            row.deleted_at = Some(at);
        }
        Ok(())
    }

    async fn create_audit_entry(&mut self, entry: &AuditEntry) -> StoreResult<()> {
        if self.fail_audit {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "audit log unavailable".into(),
            )));
        }
        self.working.audit.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
