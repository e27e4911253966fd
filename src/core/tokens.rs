//! Issue, reuse, rotate, revoke and burn primitives over the token table.
//!
//! Every function runs inside the caller's transaction.

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::error::{Error, Result};
use crate::models::{expiry_after, AuthToken, ConfirmToken, RefreshToken, Stored, Token};
use crate::store::{StoreError, TokenFilter, Transaction};

/// Upper bound on discard-and-recreate cycles in [`grant_or_reuse`].
pub const GRANT_ATTEMPTS: usize = 3;

/// Insert a new token row. The stored `created_at` and expiry are copied back.
pub async fn create<T: Stored>(tx: &mut dyn Transaction, token: &mut T) -> Result<()> {
    if token.secret().is_empty() {
        return Err(Error::validation("token", "empty token"));
    }
    if expiry_after(Utc::now(), token.access().expiration).is_none() {
        return Err(Error::validation("expiration", "token expiration out of range"));
    }
    let mut record = token.to_record();
    tx.create_token(&mut record).await?;
    *token = T::from_record(record);
    Ok(())
}

/// Return the owner's live token of kind `T`, or mint one with `factory`.
///
/// An unusable row found for the owner is revoked and the lookup repeats, at
/// most [`GRANT_ATTEMPTS`] times. The lookup also repeats when the insert
/// collides with a live row another transaction just committed.
pub async fn grant_or_reuse<T, F>(tx: &mut dyn Transaction, owner: Uuid, mut factory: F) -> Result<T>
where
    T: Stored + Send,
    F: FnMut() -> anyhow::Result<T> + Send,
{
    for attempt in 1..=GRANT_ATTEMPTS {
        let Some(record) = tx.first_token(T::CLASS, TokenFilter::Owner(owner)).await? else {
            let mut token = factory()?;
            match create(tx, &mut token).await {
                Ok(()) => return Ok(token),
                // Another transaction granted first; look again and reuse its row.
                Err(Error::Conflict(reason)) => {
                    debug!(attempt, class = %T::CLASS, %owner, %reason, "concurrent grant");
                    continue;
                }
                Err(err) => return Err(err),
            }
        };

        let existing = T::from_record(record);
        if existing.usable() {
            return Ok(existing);
        }

        debug!(attempt, class = %T::CLASS, %owner, "revoking unusable token before reissue");
        tx.delete_token(existing.access().id, Utc::now()).await?;
    }

    warn!(class = %T::CLASS, %owner, "token grant did not settle");
    Err(Error::Infrastructure(anyhow!(
        "could not grant {} token after {GRANT_ATTEMPTS} attempts",
        T::CLASS
    )))
}

/// Count one use and revoke the row once it is exhausted.
pub async fn use_token<T: Stored>(tx: &mut dyn Transaction, token: &mut T) -> Result<()> {
    let now = Utc::now();
    if !token.usable_at(now) {
        return Err(Error::policy(format!("{} token is not usable", T::CLASS)));
    }
    token.use_token(now);
    if !token.usable_at(now) {
        token.access_mut().deleted_at = Some(now);
    }
    tx.save_token(&token.to_record()).await?;
    Ok(())
}

/// Live token of kind `T` for a secret, row-locked for the rest of the
/// transaction. Unknown, revoked and unusable tokens all report the same
/// not-found error.
pub async fn usable_token<T: Stored>(tx: &mut dyn Transaction, secret: &str) -> Result<T> {
    if secret.is_empty() {
        return Err(Error::NotFound("token"));
    }
    let token = tx
        .lock_token(T::CLASS, secret)
        .await?
        .map(T::from_record)
        .filter(|t| t.usable())
        .ok_or(Error::NotFound("token"))?;
    Ok(token)
}

pub async fn grant_refresh_token(tx: &mut dyn Transaction, owner: Uuid) -> Result<RefreshToken> {
    grant_or_reuse(tx, owner, || RefreshToken::new(owner)).await
}

/// Rotate a refresh token: the presented secret is revoked and a replacement
/// issued to `owner`. A second call with the same secret fails not-found.
#[instrument(skip(tx, presented))]
pub async fn swap_refresh_token(
    tx: &mut dyn Transaction,
    owner: Uuid,
    presented: &str,
) -> Result<RefreshToken> {
    let current: RefreshToken = usable_token(tx, presented).await?;
    tx.delete_token(current.access.id, Utc::now())
        .await
        .map_err(|err| match err {
            StoreError::NotFound => Error::NotFound("token"),
            other => other.into(),
        })?;

    if current.issued_to() != owner {
        warn!(issued_to = %current.issued_to(), "refresh token presented for another user");
        return Err(Error::policy("mismatched user id"));
    }

    grant_refresh_token(tx, owner).await
}

/// Hard delete every refresh row for `owner`.
pub async fn revoke_all_refresh_tokens(tx: &mut dyn Transaction, owner: Uuid) -> Result<u64> {
    let purged = tx.purge_tokens(RefreshToken::CLASS, owner).await?;
    debug!(%owner, purged, "refresh tokens revoked");
    Ok(purged)
}

pub async fn has_usable_refresh_token(tx: &mut dyn Transaction, owner: Uuid) -> Result<bool> {
    Ok(tx
        .first_token(RefreshToken::CLASS, TokenFilter::Owner(owner))
        .await?
        .map(RefreshToken::from_record)
        .is_some_and(|rt| rt.usable()))
}

pub async fn grant_confirm_token(
    tx: &mut dyn Transaction,
    owner: Uuid,
    exp: Duration,
) -> Result<ConfirmToken> {
    grant_or_reuse(tx, owner, || ConfirmToken::new(owner, exp)).await
}

pub async fn confirm_token_sent(
    tx: &mut dyn Transaction,
    token: &mut ConfirmToken,
    at: DateTime<Utc>,
) -> Result<()> {
    token.sent_at = Some(at);
    tx.save_token(&token.to_record()).await?;
    Ok(())
}

pub async fn last_confirm_token_sent(
    tx: &mut dyn Transaction,
    owner: Uuid,
) -> Result<Option<ConfirmToken>> {
    Ok(tx
        .last_sent_token(ConfirmToken::CLASS, owner)
        .await?
        .map(ConfirmToken::from_record))
}

/// A fresh authorization token per redirect; several may be live for one provider.
pub async fn grant_auth_token(
    tx: &mut dyn Transaction,
    provider: &str,
    exp: Duration,
    session: serde_json::Value,
) -> Result<AuthToken> {
    let mut token = AuthToken::new(provider, exp)?;
    token.access.data = Some(serde_json::json!({ "session": session }));
    create(tx, &mut token).await?;
    Ok(token)
}
