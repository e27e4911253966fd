//! Password login, logout and bearer issuance.

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    audit, bearer, finish, password, tokens, users, validate, Context, Error, Event, EventKind,
    Kredo, Result,
};
use crate::models::{AuditAction, BearerToken, RefreshToken, Token, SYSTEM_ID};

impl Kredo {
    /// Verify credentials and issue a bearer token.
    ///
    /// Unknown emails fail not-found; every other refusal is a policy error
    /// that does not say which check failed.
    #[instrument(skip(self, ctx, password))]
    pub async fn login(&self, ctx: &Context, email: &str, password: &str) -> Result<BearerToken> {
        let email = validate::email(email)?;
        let provider = self.provider(ctx).to_string();

        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let mut user = users::get_user_with_email(tx.as_mut(), &email).await?;
            if !user.is_active() {
                return Err(Error::policy("inactive user"));
            }
            if user.provider != provider {
                return Err(Error::policy("account uses another identity provider"));
            }
            let verified = match user.password.as_deref() {
                Some(hash) if !user.is_locked() => {
                    password::verify(hash, password).await?
                }
                _ => false,
            };
            if !verified {
                warn!(user_id = %user.id, "login refused");
                return Err(Error::policy("invalid credentials"));
            }

            user.login_at = Some(Utc::now());
            tx.save_user(&user).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Login,
                user.id,
                audit::Fields::new(),
            )
            .await?;
            let bt = bearer::grant_bearer_token(tx.as_mut(), self.config.jwt(), &user).await?;
            Ok((user, bt))
        }
        .await;
        let (user, bt) = finish(tx, result).await?;

        info!(user_id = %user.id, "login");
        self.events
            .publish(Event::new(EventKind::Login, ctx, user.id).with_provider(&user.provider));
        Ok(bt)
    }

    /// Revoke every refresh token of `user_id`. The system user and unknown
    /// users are a no-op.
    #[instrument(skip(self, ctx))]
    pub async fn logout(&self, ctx: &Context, user_id: Uuid) -> Result<()> {
        if user_id == SYSTEM_ID {
            return Ok(());
        }
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let Some(user) = tx
                .first_user(crate::store::UserFilter::Id(user_id))
                .await?
            else {
                return Ok(None);
            };
            let revoked = tokens::revoke_all_refresh_tokens(tx.as_mut(), user.id).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Logout,
                user.id,
                audit::fields(serde_json::json!({ "revoked": revoked })),
            )
            .await?;
            Ok(Some(user))
        }
        .await;

        if let Some(user) = finish(tx, result).await? {
            self.events
                .publish(Event::new(EventKind::Logout, ctx, user.id).with_provider(&user.provider));
        }
        Ok(())
    }

    /// Bearer token for an already-authenticated user.
    pub async fn grant_bearer_token(&self, ctx: &Context, user_id: Uuid) -> Result<BearerToken> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let user = users::get_user(tx.as_mut(), user_id).await?;
            let bt = bearer::grant_bearer_token(tx.as_mut(), self.config.jwt(), &user).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Granted,
                user.id,
                audit::token_fields(&bt.refresh),
            )
            .await?;
            Ok(bt)
        }
        .await;
        finish(tx, result).await
    }

    /// Rotate a refresh token into a new bearer token. A refresh token that
    /// was already rotated reports not-found, the same as an unknown one.
    #[instrument(skip_all)]
    pub async fn refresh_bearer_token(&self, ctx: &Context, refresh: &str) -> Result<BearerToken> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let rt: RefreshToken = tokens::usable_token(tx.as_mut(), refresh).await?;
            let user = users::get_user(tx.as_mut(), rt.issued_to()).await?;
            if !user.is_active() {
                return Err(Error::policy("inactive user"));
            }
            let bt = bearer::refresh_bearer_token(
                tx.as_mut(),
                self.config.jwt(),
                &user,
                Some(refresh),
            )
            .await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Refreshed,
                user.id,
                audit::token_fields(&bt.refresh),
            )
            .await?;
            Ok(bt)
        }
        .await;
        finish(tx, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{error::ErrorKind, test_support::*};
    use crate::models::{Status, User};
    use crate::store::{MemoryStore, Store};

    async fn active_user(store: &MemoryStore, email: &str, pw: &str) -> anyhow::Result<User> {
        let mut user = User::new("kredo", email, "alice");
        user.status = Status::Active;
        user.confirmed_at = Some(Utc::now());
        user.password = Some(password::hash(pw).await?);
        let mut tx = store.begin().await?;
        tx.create_user(&user).await?;
        tx.commit().await?;
        Ok(user)
    }

    #[tokio::test]
    async fn login_issues_a_bearer_and_audits() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let user = active_user(&store, "alice@example.com", "correct horse").await?;
        let mut events = kredo.subscribe().ok_or_else(|| anyhow::anyhow!("events off"))?;

        let bt = kredo
            .login(&Context::new(), " Alice@Example.com ", "correct horse")
            .await?;
        assert_eq!(bt.issued_to(), user.id);
        let claims = bearer::verify(kredo.config().jwt(), bt.secret())?;
        assert_eq!(claims.user_id()?, user.id);

        let stored = kredo.get_user(user.id).await?;
        assert!(stored.login_at.is_some());
        let entries = store.audit_entries().await;
        assert!(entries.iter().any(|e| e.action == AuditAction::Login));
        assert_eq!(events.recv().await?.kind, EventKind::Login);
        Ok(())
    }

    #[tokio::test]
    async fn login_refusals() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let user = active_user(&store, "alice@example.com", "correct horse").await?;
        let ctx = Context::new();

        let err = kredo.login(&ctx, "alice@example.com", "wrong horse").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        let err = kredo.login(&ctx, "bob@example.com", "correct horse").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        let err = kredo.login(&ctx, "not-an-email", "correct horse").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Validation));
        let github = Context::new().with_provider("github");
        let err = kredo.login(&github, "alice@example.com", "correct horse").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));

        let mut locked = user.clone();
        locked.status = Status::Locked;
        let mut tx = store.begin().await?;
        tx.save_user(&locked).await?;
        tx.commit().await?;
        let err = kredo.login(&ctx, "alice@example.com", "correct horse").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_rotates_once() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        active_user(&store, "alice@example.com", "correct horse").await?;
        let ctx = Context::new();

        let bt = kredo.login(&ctx, "alice@example.com", "correct horse").await?;
        let next = kredo.refresh_bearer_token(&ctx, bt.refresh.secret()).await?;
        assert_ne!(next.refresh.secret(), bt.refresh.secret());

        let replay = kredo.refresh_bearer_token(&ctx, bt.refresh.secret()).await;
        assert_eq!(replay.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        // the replacement still works
        kredo.refresh_bearer_token(&ctx, next.refresh.secret()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn logout_revokes_every_refresh_token() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let user = active_user(&store, "alice@example.com", "correct horse").await?;
        let ctx = Context::new();

        let bt = kredo.login(&ctx, "alice@example.com", "correct horse").await?;
        kredo.logout(&ctx, user.id).await?;
        let err = kredo.refresh_bearer_token(&ctx, bt.refresh.secret()).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::NotFound));

        kredo.logout(&ctx, SYSTEM_ID).await?;
        kredo.logout(&ctx, Uuid::new_v4()).await?;
        let logouts = store
            .audit_entries()
            .await
            .into_iter()
            .filter(|e| e.action == AuditAction::Logout)
            .count();
        assert_eq!(logouts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_refuses_banned_users() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let user = active_user(&store, "alice@example.com", "correct horse").await?;
        let ctx = Context::new();
        let bt = kredo.login(&ctx, "alice@example.com", "correct horse").await?;

        let mut banned = user.clone();
        banned.status = Status::Banned;
        let mut tx = store.begin().await?;
        tx.save_user(&banned).await?;
        tx.commit().await?;

        let err = kredo.refresh_bearer_token(&ctx, bt.refresh.secret()).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        Ok(())
    }
}
