//! `PostgreSQL` store backed by `sqlx`. Schema lives in `sql/schema.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row};
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, TokenFilter, Transaction, UserFilter};
use crate::models::{AccessToken, AuditEntry, Class, Role, Status, TokenRecord, User};

const TOKEN_COLUMNS: &str = "id, class, user_id, usage, token, max_uses, used, used_at, \
     expiration_ms, expired_at, data, sent_at, format, provider, created_at, deleted_at";

/// Reported when a token insert collides with an existing secret or with the
/// owner's live refresh/confirm row.
const TOKEN_CONFLICT: &str = "access_tokens_owner_token";

const USER_COLUMNS: &str = "id, provider, role, status, email, username, password, data, \
     metadata, signup_code, login_at, confirmed_at, verified_at, invited_at, created_at, \
     updated_at, deleted_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply `sql/schema.sql`. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(db_span("MIGRATE", "sql/schema.sql"))
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

const SCHEMA: &str = include_str!("../../sql/schema.sql");

fn db_span(operation: &str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn map_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().is_some_and(|code| code.as_ref() == "23505") {
            let constraint = db_err.constraint().unwrap_or("unique").to_string();
            return StoreError::UniqueViolation(constraint);
        }
    }
    StoreError::Database(err)
}

fn parse<T: std::str::FromStr<Err = String>>(value: Option<String>) -> StoreResult<Option<T>> {
    value
        .map(|v| v.parse::<T>().map_err(StoreError::Corrupt))
        .transpose()
}

fn token_from_row(row: &PgRow) -> StoreResult<TokenRecord> {
    let class: String = row.try_get("class")?;
    let usage: String = row.try_get("usage")?;
    let expiration: i64 = row.try_get("expiration_ms")?;

    let access = AccessToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        usage: usage.parse().map_err(StoreError::Corrupt)?,
        token: row.try_get("token")?,
        max_uses: row.try_get("max_uses")?,
        used: row.try_get("used")?,
        used_at: row.try_get("used_at")?,
        expiration: Duration::milliseconds(expiration),
        expired_at: row.try_get("expired_at")?,
        data: row.try_get("data")?,
        created_at: Some(row.try_get("created_at")?),
        deleted_at: row.try_get("deleted_at")?,
    };

    Ok(TokenRecord {
        class: class.parse().map_err(StoreError::Corrupt)?,
        access,
        sent_at: row.try_get("sent_at")?,
        format: parse(row.try_get("format")?)?,
        provider: row.try_get("provider")?,
    })
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    let role: i16 = row.try_get("role")?;
    let status: i16 = row.try_get("status")?;

    Ok(User {
        id: row.try_get("id")?,
        provider: row.try_get("provider")?,
        role: Role::from_i16(role).ok_or_else(|| StoreError::Corrupt(format!("role {role}")))?,
        status: Status::from_i16(status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {status}")))?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        data: row.try_get("data")?,
        metadata: row.try_get("metadata")?,
        signup_code: row.try_get("signup_code")?,
        login_at: row.try_get("login_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        verified_at: row.try_get("verified_at")?,
        invited_at: row.try_get("invited_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.map_err(map_err)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn ping(&self) -> StoreResult<()> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTx {
    async fn create_token(&mut self, record: &mut TokenRecord) -> StoreResult<()> {
        let query = r"
            INSERT INTO access_tokens
                (id, class, user_id, usage, token, max_uses, used, used_at,
                 expiration_ms, expired_at, data, sent_at, format, provider)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    CASE WHEN $9 > 0 THEN NOW() + ($9 * INTERVAL '1 millisecond') END,
                    $10, $11, $12, $13)
            ON CONFLICT DO NOTHING
            RETURNING created_at, expired_at
        ";
        let access = &record.access;
        let row = sqlx::query(query)
            .bind(access.id)
            .bind(record.class.as_str())
            .bind(access.user_id)
            .bind(access.usage.as_str())
            .bind(&access.token)
            .bind(access.max_uses)
            .bind(access.used)
            .bind(access.used_at)
            .bind(access.expiration.num_milliseconds())
            .bind(&access.data)
            .bind(record.sent_at)
            .bind(record.format.map(|f| f.as_str()))
            .bind(&record.provider)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_err)?;

        // A skipped insert leaves the transaction usable, so callers can retry.
        let Some(row) = row else {
            return Err(StoreError::UniqueViolation(TOKEN_CONFLICT.to_string()));
        };

        record.access.created_at = Some(row.try_get("created_at")?);
        record.access.expired_at = row.try_get("expired_at")?;
        Ok(())
    }

    async fn save_token(&mut self, record: &TokenRecord) -> StoreResult<()> {
        let query = r"
            UPDATE access_tokens
            SET used = $2, used_at = $3, data = $4, sent_at = $5, deleted_at = $6
            WHERE id = $1
        ";
        let access = &record.access;
        let result = sqlx::query(query)
            .bind(access.id)
            .bind(access.used)
            .bind(access.used_at)
            .bind(&access.data)
            .bind(record.sent_at)
            .bind(access.deleted_at)
            .execute(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(map_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn first_token(
        &mut self,
        class: Class,
        filter: TokenFilter<'_>,
    ) -> StoreResult<Option<TokenRecord>> {
        let predicate = match filter {
            TokenFilter::Owner(_) => "user_id = $2",
            TokenFilter::Secret(_) => "token = $2",
        };
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM access_tokens \
             WHERE class = $1 AND {predicate} AND deleted_at IS NULL \
             ORDER BY created_at, id LIMIT 1"
        );
        let q = sqlx::query(&query).bind(class.as_str());
        let q = match filter {
            TokenFilter::Owner(owner) => q.bind(owner),
            TokenFilter::Secret(secret) => q.bind(secret.to_string()),
        };
        let row = q
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_err)?;

        row.as_ref().map(token_from_row).transpose()
    }

    async fn lock_token(&mut self, class: Class, secret: &str) -> StoreResult<Option<TokenRecord>> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM access_tokens \
             WHERE class = $1 AND token = $2 AND deleted_at IS NULL \
             ORDER BY created_at, id LIMIT 1 FOR UPDATE"
        );
        let row = sqlx::query(&query)
            .bind(class.as_str())
            .bind(secret)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_err)?;

        row.as_ref().map(token_from_row).transpose()
    }

    async fn last_sent_token(
        &mut self,
        class: Class,
        owner: Uuid,
    ) -> StoreResult<Option<TokenRecord>> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM access_tokens \
             WHERE class = $1 AND user_id = $2 AND sent_at IS NOT NULL AND deleted_at IS NULL \
             ORDER BY sent_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(class.as_str())
            .bind(owner)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_err)?;

        row.as_ref().map(token_from_row).transpose()
    }

    async fn delete_token(&mut self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let query = "UPDATE access_tokens SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL";
        let result = sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(map_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn purge_tokens(&mut self, class: Class, owner: Uuid) -> StoreResult<u64> {
        let query = "DELETE FROM access_tokens WHERE class = $1 AND user_id = $2";
        let result = sqlx::query(query)
            .bind(class.as_str())
            .bind(owner)
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn create_user(&mut self, user: &User) -> StoreResult<()> {
        let query = r"
            INSERT INTO users
                (id, provider, role, status, email, username, password, data, metadata,
                 signup_code, login_at, confirmed_at, verified_at, invited_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ";
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.provider)
            .bind(user.role.as_i16())
            .bind(user.status.as_i16())
            .bind(&user.email)
            .bind(&user.username)
            .bind(&user.password)
            .bind(&user.data)
            .bind(&user.metadata)
            .bind(user.signup_code)
            .bind(user.login_at)
            .bind(user.confirmed_at)
            .bind(user.verified_at)
            .bind(user.invited_at)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn save_user(&mut self, user: &User) -> StoreResult<()> {
        let query = r"
            UPDATE users
            SET provider = $2, role = $3, status = $4, email = $5, username = $6,
                password = $7, data = $8, metadata = $9, signup_code = $10,
                login_at = $11, confirmed_at = $12, verified_at = $13, invited_at = $14,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(user.id)
            .bind(&user.provider)
            .bind(user.role.as_i16())
            .bind(user.status.as_i16())
            .bind(&user.email)
            .bind(&user.username)
            .bind(&user.password)
            .bind(&user.data)
            .bind(&user.metadata)
            .bind(user.signup_code)
            .bind(user.login_at)
            .bind(user.confirmed_at)
            .bind(user.verified_at)
            .bind(user.invited_at)
            .execute(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(map_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn first_user(&mut self, filter: UserFilter<'_>) -> StoreResult<Option<User>> {
        let predicate = match filter {
            UserFilter::Id(_) => "id = $1",
            UserFilter::Email(_) => "email = $1",
        };
        let query =
            format!("SELECT {USER_COLUMNS} FROM users WHERE {predicate} AND deleted_at IS NULL");
        let q = sqlx::query(&query);
        let q = match filter {
            UserFilter::Id(id) => q.bind(id),
            UserFilter::Email(email) => q.bind(email.to_string()),
        };
        let row = q
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", &query))
            .await
            .map_err(map_err)?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn delete_user(&mut self, id: Uuid, hard: bool, at: DateTime<Utc>) -> StoreResult<()> {
        if hard {
            let query = "DELETE FROM users WHERE id = $1";
            sqlx::query(query)
                .bind(id)
                .execute(&mut *self.tx)
                .instrument(db_span("DELETE", query))
                .await
                .map_err(map_err)?;
        } else {
            let query = "UPDATE users SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL";
            sqlx::query(query)
                .bind(id)
                .bind(at)
                .execute(&mut *self.tx)
                .instrument(db_span("UPDATE", query))
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn create_audit_entry(&mut self, entry: &AuditEntry) -> StoreResult<()> {
        let query = r"
            INSERT INTO audit_log (id, kind, action, user_id, fields, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(query)
            .bind(entry.id)
            .bind(entry.kind.as_str())
            .bind(entry.action.as_str())
            .bind(entry.user_id)
            .bind(serde_json::Value::Object(entry.fields.clone()))
            .bind(entry.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_err)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_enum_values_are_reported() {
        let parsed: StoreResult<Option<Class>> = parse(Some("bogus".to_string()));
        assert!(matches!(parsed, Err(StoreError::Corrupt(_))));
        let parsed: StoreResult<Option<Class>> = parse(None);
        assert!(matches!(parsed, Ok(None)));
    }

    #[test]
    fn non_unique_errors_stay_database_errors() {
        let err = map_err(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
    }
}
