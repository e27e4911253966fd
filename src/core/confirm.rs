//! Confirmation mail and the flows that redeem confirm tokens.
//!
//! One confirm token is live per user at a time; signup confirmation, password
//! recovery and email change all reuse it. An email change records the pending
//! address on the token so the redeemed address must match.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    audit, finish, password, tokens, users, validate, Context, Error, Event, EventKind, Kredo,
    MailKind, MailMessage, Result, SendOutcome,
};
use crate::models::{AuditAction, ConfirmToken, Stored, Token, User};
use crate::store::{Transaction, UserFilter};

impl Kredo {
    /// Grant (or reuse) the user's confirm token and mail it to `to`, unless
    /// one was sent within the send limit.
    pub(crate) async fn send_confirm_token(
        &self,
        tx: &mut dyn Transaction,
        ctx: &Context,
        kind: MailKind,
        user: &User,
        to: &str,
        pending_email: Option<&str>,
    ) -> Result<SendOutcome> {
        if self.config.mail_disabled() {
            return Ok(SendOutcome::Skipped);
        }
        if user.provider != self.config.provider() {
            return Err(Error::policy("account uses an external identity provider"));
        }

        let now = Utc::now();
        let mut ct = tokens::grant_confirm_token(tx, user.id, self.config.confirm_expiration()).await?;
        let last = tokens::last_confirm_token_sent(tx, user.id).await?;
        if last
            .and_then(|t| t.sent_at)
            .is_some_and(|at| at > self.config.send_window_start(now))
        {
            debug!(user_id = %user.id, kind = kind.as_str(), "confirm mail throttled");
            return Ok(SendOutcome::Throttled);
        }

        if let Some(email) = pending_email {
            ct.access.data = Some(json!({ "email": email }));
        }
        self.mail(MailMessage {
            kind,
            to: to.to_string(),
            token: ct.secret().to_string(),
            referrer: None,
        })
        .await?;
        tokens::confirm_token_sent(tx, &mut ct, now).await?;
        audit::record(
            tx,
            ctx,
            AuditAction::ConfirmSent,
            user.id,
            audit::fields(json!({ "kind": kind.as_str() })),
        )
        .await?;
        Ok(SendOutcome::Sent)
    }

    /// Resend the signup confirmation. Confirmed users are skipped.
    #[instrument(skip(self, ctx))]
    pub async fn send_confirm_user(&self, ctx: &Context, user_id: Uuid) -> Result<SendOutcome> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let user = users::get_user(tx.as_mut(), user_id).await?;
            if user.is_confirmed() {
                return Ok(SendOutcome::Skipped);
            }
            if user.is_locked() {
                return Err(Error::policy("account is locked"));
            }
            self.send_confirm_token(tx.as_mut(), ctx, MailKind::ConfirmUser, &user, &user.email, None)
                .await
        }
        .await;
        finish(tx, result).await
    }

    #[instrument(skip(self, ctx))]
    pub async fn send_reset_password(&self, ctx: &Context, email: &str) -> Result<SendOutcome> {
        let email = validate::email(email)?;
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let user = users::get_user_with_email(tx.as_mut(), &email).await?;
            if user.is_locked() {
                return Err(Error::policy("account is locked"));
            }
            self.send_confirm_token(tx.as_mut(), ctx, MailKind::ResetPassword, &user, &email, None)
                .await
        }
        .await;
        finish(tx, result).await
    }

    /// Mail a confirm token to the new address.
    #[instrument(skip(self, ctx))]
    pub async fn send_change_email(
        &self,
        ctx: &Context,
        user_id: Uuid,
        new_email: &str,
    ) -> Result<SendOutcome> {
        let new_email = validate::email(new_email)?;
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let user = users::get_user(tx.as_mut(), user_id).await?;
            if user.is_locked() {
                return Err(Error::policy("account is locked"));
            }
            if user.email == new_email {
                return Err(Error::validation("email", "unchanged email address"));
            }
            if tx.first_user(UserFilter::Email(&new_email)).await?.is_some() {
                return Err(Error::conflict("email already registered"));
            }
            self.send_confirm_token(
                tx.as_mut(),
                ctx,
                MailKind::ChangeEmail,
                &user,
                &new_email,
                Some(&new_email),
            )
            .await
        }
        .await;
        finish(tx, result).await
    }

    /// Redeem a confirm token for its owner's signup confirmation.
    #[instrument(skip_all)]
    pub async fn confirm_user(&self, ctx: &Context, token: &str) -> Result<User> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let (mut user, _) = redeem(tx.as_mut(), token).await?;
            let changed = users::confirm_user(tx.as_mut(), &mut user, Utc::now()).await?;
            if changed {
                audit::record(
                    tx.as_mut(),
                    ctx,
                    AuditAction::Confirmed,
                    user.id,
                    audit::Fields::new(),
                )
                .await?;
            }
            Ok((user, changed))
        }
        .await;
        let (user, changed) = finish(tx, result).await?;
        if changed {
            self.events
                .publish(Event::new(EventKind::Confirmed, ctx, user.id).with_provider(&user.provider));
        }
        Ok(user)
    }

    /// Set a new password with a recovery token. Redeeming also confirms the
    /// email address.
    #[instrument(skip_all)]
    pub async fn confirm_password_change(
        &self,
        ctx: &Context,
        token: &str,
        new_password: &str,
    ) -> Result<User> {
        validate::password(new_password, self.config.min_password_length())?;
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let (mut user, _) = redeem(tx.as_mut(), token).await?;
            if user.is_locked() {
                return Err(Error::policy("account is locked"));
            }
            users::confirm_user(tx.as_mut(), &mut user, Utc::now()).await?;
            user.password = Some(password::hash(new_password).await?);
            tx.save_user(&user).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Password,
                user.id,
                audit::Fields::new(),
            )
            .await?;
            Ok(user)
        }
        .await;
        finish(tx, result).await
    }

    /// Apply a pending email change. `email` must be the address the token was
    /// mailed to.
    #[instrument(skip(self, ctx, token))]
    pub async fn confirm_change_email(&self, ctx: &Context, token: &str, email: &str) -> Result<User> {
        let email = validate::email(email)?;
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let (mut user, ct) = redeem(tx.as_mut(), token).await?;
            if user.is_locked() {
                return Err(Error::policy("account is locked"));
            }
            let pending = ct
                .access
                .data
                .as_ref()
                .and_then(|data| data.get("email"))
                .and_then(|value| value.as_str());
            if pending != Some(email.as_str()) {
                return Err(Error::policy("email does not match the pending change"));
            }
            if tx.first_user(UserFilter::Email(&email)).await?.is_some() {
                return Err(Error::conflict("email already registered"));
            }
            let from = std::mem::replace(&mut user.email, email.clone());
            tx.save_user(&user).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Email,
                user.id,
                audit::fields(json!({ "from": from, "to": email })),
            )
            .await?;
            Ok(user)
        }
        .await;
        finish(tx, result).await
    }
}

/// Burn a usable confirm token and load its owner.
async fn redeem(tx: &mut dyn Transaction, token: &str) -> Result<(User, ConfirmToken)> {
    let mut ct: ConfirmToken = tokens::usable_token(tx, token).await?;
    tokens::use_token(tx, &mut ct).await?;
    let user = users::get_user(tx, ct.issued_to()).await?;
    debug!(user_id = %user.id, class = %ConfirmToken::CLASS, "confirm token redeemed");
    Ok((user, ct))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{error::ErrorKind, test_support::*};
    use crate::models::Status;
    use crate::store::{MemoryStore, Store};
    use anyhow::anyhow;
    use chrono::Duration;

    async fn insert(store: &MemoryStore, user: &User) -> anyhow::Result<()> {
        let mut tx = store.begin().await?;
        tx.create_user(user).await?;
        tx.commit().await?;
        Ok(())
    }

    fn active(email: &str) -> User {
        let mut user = User::new("kredo", email, "a");
        user.status = Status::Active;
        user.confirmed_at = Some(Utc::now());
        user
    }

    #[tokio::test]
    async fn resends_inside_the_limit_are_throttled() -> anyhow::Result<()> {
        let (kredo, store, mailer) = service(config().with_send_limit(Duration::minutes(5)));
        let user = User::new("kredo", "new@example.com", "new");
        insert(&store, &user).await?;
        let ctx = Context::new();

        assert_eq!(kredo.send_confirm_user(&ctx, user.id).await?, SendOutcome::Sent);
        assert_eq!(
            kredo.send_confirm_user(&ctx, user.id).await?,
            SendOutcome::Throttled
        );
        assert_eq!(mailer.count(), 1);

        let token = mailer.last_token().ok_or_else(|| anyhow!("no mail"))?;
        let confirmed = kredo.confirm_user(&ctx, &token).await?;
        assert!(confirmed.is_active());
        assert_eq!(
            kredo.send_confirm_user(&ctx, user.id).await?,
            SendOutcome::Skipped
        );

        let replay = kredo.confirm_user(&ctx, &token).await;
        assert_eq!(replay.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn mail_disabled_skips_without_a_token() -> anyhow::Result<()> {
        let (kredo, store, mailer) = service(config().with_mail_disabled(true));
        let user = User::new("kredo", "new@example.com", "new");
        insert(&store, &user).await?;

        let outcome = kredo.send_confirm_user(&Context::new(), user.id).await?;
        assert_eq!(outcome, SendOutcome::Skipped);
        assert_eq!(mailer.count(), 0);
        assert!(store.token_records().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn external_provider_users_are_refused() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let user = User::new("github", "gh@example.com", "gh");
        insert(&store, &user).await?;

        let err = kredo.send_confirm_user(&Context::new(), user.id).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        Ok(())
    }

    #[tokio::test]
    async fn password_recovery() -> anyhow::Result<()> {
        let (kredo, store, mailer) = service(config());
        let user = active("alice@example.com");
        insert(&store, &user).await?;
        let ctx = Context::new();

        kredo.send_reset_password(&ctx, "ALICE@example.com").await?;
        let token = mailer.last_token().ok_or_else(|| anyhow!("no mail"))?;
        let err = kredo.confirm_password_change(&ctx, &token, "short").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Validation));

        let updated = kredo
            .confirm_password_change(&ctx, &token, "a brand new secret")
            .await?;
        let hash = updated.password.ok_or_else(|| anyhow!("no password"))?;
        assert!(password::verify(&hash, "a brand new secret").await?);
        let entries = store.audit_entries().await;
        assert_eq!(entries.last().map(|e| e.action), Some(AuditAction::Password));
        Ok(())
    }

    #[tokio::test]
    async fn email_change_requires_the_mailed_address() -> anyhow::Result<()> {
        let (kredo, store, mailer) = service(config());
        let user = active("alice@example.com");
        let other = active("taken@example.com");
        insert(&store, &user).await?;
        insert(&store, &other).await?;
        let ctx = Context::new();

        let err = kredo
            .send_change_email(&ctx, user.id, "taken@example.com")
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Conflict));

        kredo
            .send_change_email(&ctx, user.id, "alice@new.example.com")
            .await?;
        let sent = mailer
            .sent
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("no mail"))?;
        assert_eq!(sent.to, "alice@new.example.com");
        assert_eq!(sent.kind, MailKind::ChangeEmail);

        let changed = kredo
            .confirm_change_email(&ctx, &sent.token, "alice@new.example.com")
            .await?;
        assert_eq!(changed.email, "alice@new.example.com");
        assert!(!kredo.is_email_taken("alice@example.com").await?);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_email_rolls_back_the_burn() -> anyhow::Result<()> {
        let (kredo, store, mailer) = service(config());
        let user = active("alice@example.com");
        insert(&store, &user).await?;
        let ctx = Context::new();

        kredo
            .send_change_email(&ctx, user.id, "alice@new.example.com")
            .await?;
        let token = mailer.last_token().ok_or_else(|| anyhow!("no mail"))?;
        let err = kredo
            .confirm_change_email(&ctx, &token, "mallory@example.com")
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        // the token survived the failed attempt
        kredo
            .confirm_change_email(&ctx, &token, "alice@new.example.com")
            .await?;
        Ok(())
    }
}
