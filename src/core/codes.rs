//! Signup and access codes.

use anyhow::anyhow;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    audit, finish, tokens, users, validate, Context, CoreConfig, Error, Kredo, MailKind,
    MailMessage, Result, SendOutcome,
};
use crate::models::token::{is_debug_pin, is_valid_code};
use crate::models::{AuditAction, CodeFormat, Role, SignupCode, Stored, Token, User, SINGLE_USE};
use crate::store::{TokenFilter, Transaction, UserFilter};
use uuid::Uuid;

const CODE_ATTEMPTS: usize = 3;
const MAX_BATCH: usize = 1000;

/// Resolve a code string. The debug PIN resolves only when enabled.
pub async fn get_code(
    tx: &mut dyn Transaction,
    config: &CoreConfig,
    code: &str,
) -> Result<SignupCode> {
    let code = code.trim();
    if !is_valid_code(code) {
        return Err(Error::validation("code", "malformed signup code"));
    }
    if is_debug_pin(code) {
        if config.debug_pin() {
            debug!("debug signup code accepted");
            return Ok(SignupCode::debug());
        }
        return Err(Error::NotFound("signup code"));
    }
    tokens::usable_token(tx, code)
        .await
        .map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound("signup code"),
            other => other,
        })
}

/// Burn one use of `code` on behalf of `user`, a restricted user that has not
/// consumed a code yet. The caller saves `user`.
pub async fn use_code(
    tx: &mut dyn Transaction,
    config: &CoreConfig,
    code: &str,
    user: &mut User,
) -> Result<SignupCode> {
    if !user.is_restricted() || user.signup_code.is_some() {
        return Err(Error::policy("user cannot redeem a signup code"));
    }
    let mut sc = get_code(tx, config, code).await?;
    if sc.is_debug() {
        return Ok(sc);
    }
    tokens::use_token(tx, &mut sc).await?;
    user.signup_code = Some(sc.access.id);
    if sc.format == CodeFormat::Invite {
        user.invited_at = Some(Utc::now());
    }
    Ok(sc)
}

/// A new code owned by `owner` whose secret no other live code shares.
pub async fn create_code(
    tx: &mut dyn Transaction,
    owner: Uuid,
    format: CodeFormat,
    uses: i32,
) -> Result<SignupCode> {
    create_unique_code(tx, || SignupCode::new(owner, format, uses)).await
}

/// Insert codes from `generate` until one lands. A secret held by a live code
/// or by one of the owner's revoked codes counts as a collision.
async fn create_unique_code<F>(tx: &mut dyn Transaction, mut generate: F) -> Result<SignupCode>
where
    F: FnMut() -> anyhow::Result<SignupCode> + Send,
{
    for _ in 0..CODE_ATTEMPTS {
        let mut sc = generate()?;
        let taken = tx
            .first_token(SignupCode::CLASS, TokenFilter::Secret(sc.secret()))
            .await?
            .is_some();
        if taken {
            debug!(format = sc.format.as_str(), "signup code collision, regenerating");
            continue;
        }
        match tokens::create(tx, &mut sc).await {
            Ok(()) => return Ok(sc),
            Err(Error::Conflict(reason)) => {
                debug!(format = sc.format.as_str(), %reason, "signup code collision, regenerating");
            }
            Err(err) => return Err(err),
        }
    }
    Err(Error::Infrastructure(anyhow!(
        "could not generate a unique signup code after {CODE_ATTEMPTS} attempts"
    )))
}

fn valid_uses(uses: i32) -> Result<i32> {
    if uses == 0 || uses < -1 {
        return Err(Error::validation("uses", "must be positive or -1 for unlimited"));
    }
    Ok(uses)
}

impl Kredo {
    /// Admin-issued code.
    pub async fn create_signup_code(
        &self,
        ctx: &Context,
        format: CodeFormat,
        uses: i32,
    ) -> Result<SignupCode> {
        let mut codes = self.create_signup_codes(ctx, format, uses, 1).await?;
        codes
            .pop()
            .ok_or_else(|| Error::Infrastructure(anyhow!("no signup code created")))
    }

    #[instrument(skip(self, ctx))]
    pub async fn create_signup_codes(
        &self,
        ctx: &Context,
        format: CodeFormat,
        uses: i32,
        count: usize,
    ) -> Result<Vec<SignupCode>> {
        let uses = valid_uses(uses)?;
        if count == 0 || count > MAX_BATCH {
            return Err(Error::validation(
                "count",
                format!("must be between 1 and {MAX_BATCH}"),
            ));
        }
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let admin = users::validate_admin(tx.as_mut(), ctx).await?;
            let mut codes = Vec::with_capacity(count);
            for _ in 0..count {
                codes.push(create_code(tx.as_mut(), admin.id, format, uses).await?);
            }
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Granted,
                admin.id,
                audit::fields(json!({
                    "class": SignupCode::CLASS.as_str(),
                    "format": format.as_str(),
                    "uses": uses,
                    "count": count,
                })),
            )
            .await?;
            Ok(codes)
        }
        .await;
        finish(tx, result).await
    }

    /// Look a code up without burning it.
    pub async fn check_signup_code(&self, code: &str) -> Result<SignupCode> {
        let mut tx = self.begin().await?;
        let result = get_code(tx.as_mut(), &self.config, code).await;
        finish(tx, result).await
    }

    #[instrument(skip_all)]
    pub async fn delete_signup_code(&self, ctx: &Context, code: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let admin = users::validate_admin(tx.as_mut(), ctx).await?;
            let record = tx
                .first_token(SignupCode::CLASS, TokenFilter::Secret(code.trim()))
                .await?
                .ok_or(Error::NotFound("signup code"))?;
            let sc = SignupCode::from_record(record);
            tx.delete_token(sc.access.id, Utc::now()).await?;
            let mut fields = audit::token_fields(&sc);
            fields.insert("admin_id".to_string(), json!(admin.id.to_string()));
            audit::record(tx.as_mut(), ctx, AuditAction::Revoked, sc.issued_to(), fields).await?;
            Ok(())
        }
        .await;
        finish(tx, result).await
    }

    /// Mail a single-use invite from the calling user to `to`.
    ///
    /// Ordinary users may send one invite per send limit; admins are not
    /// throttled.
    #[instrument(skip(self, ctx))]
    pub async fn send_signup_code(&self, ctx: &Context, to: &str) -> Result<SendOutcome> {
        let to = validate::email(to)?;
        if self.config.mail_disabled() {
            return Ok(SendOutcome::Skipped);
        }
        let sender = ctx
            .user_id()
            .ok_or_else(|| Error::policy("an authenticated sender is required"))?;

        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let actor = users::get_user(tx.as_mut(), sender).await?;
            if !actor.is_active() {
                return Err(Error::policy("inactive user"));
            }
            if tx.first_user(UserFilter::Email(&to)).await?.is_some() {
                return Err(Error::conflict("email already registered"));
            }
            if actor.role <= Role::User {
                let last = tx.last_sent_token(SignupCode::CLASS, actor.id).await?;
                let limit = self.config.send_window_start(Utc::now());
                if last.and_then(|r| r.sent_at).is_some_and(|at| at > limit) {
                    return Err(Error::RateLimited);
                }
            }

            let mut sc = create_code(tx.as_mut(), actor.id, CodeFormat::Invite, SINGLE_USE).await?;
            self.mail(MailMessage {
                kind: MailKind::SignupCode,
                to: to.clone(),
                token: sc.secret().to_string(),
                referrer: None,
            })
            .await?;
            sc.sent_at = Some(Utc::now());
            tx.save_token(&sc.to_record()).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::CodeSent,
                actor.id,
                audit::fields(json!({ "to": to })),
            )
            .await?;
            Ok(SendOutcome::Sent)
        }
        .await;
        finish(tx, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{error::ErrorKind, test_support::*};
    use crate::models::{Status, DEBUG_PIN, SUPER_ADMIN_ID};
    use crate::store::{MemoryStore, Store};
    use chrono::Duration;

    fn restricted() -> User {
        User::new("kredo", "new@example.com", "new")
    }

    #[tokio::test]
    async fn debug_pin_needs_the_flag() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;

        let off = config();
        let err = get_code(tx.as_mut(), &off, DEBUG_PIN).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::NotFound));

        let on = config().with_debug_pin(true);
        let mut user = restricted();
        let sc = use_code(tx.as_mut(), &on, DEBUG_PIN, &mut user).await?;
        assert!(sc.is_debug());
        assert!(user.signup_code.is_none());
        tx.commit().await?;
        assert!(store.token_records().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn codes_are_consumed_once_per_user() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;
        let sc = create_code(tx.as_mut(), SUPER_ADMIN_ID, CodeFormat::Pin, 2).await?;
        assert_ne!(sc.secret(), DEBUG_PIN);

        let mut first = restricted();
        use_code(tx.as_mut(), &config(), sc.secret(), &mut first).await?;
        assert_eq!(first.signup_code, Some(sc.access.id));
        let err = use_code(tx.as_mut(), &config(), sc.secret(), &mut first).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));

        let mut active = restricted();
        active.status = Status::Active;
        active.confirmed_at = Some(Utc::now());
        let err = use_code(tx.as_mut(), &config(), sc.secret(), &mut active).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));

        let mut second = restricted();
        use_code(tx.as_mut(), &config(), sc.secret(), &mut second).await?;
        let mut third = restricted();
        let err = use_code(tx.as_mut(), &config(), sc.secret(), &mut third).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn revoked_secrets_are_not_reissued() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;

        let old = create_code(tx.as_mut(), SUPER_ADMIN_ID, CodeFormat::Pin, 1).await?;
        tx.delete_token(old.access.id, Utc::now()).await?;

        let mut first = true;
        let fresh = create_unique_code(tx.as_mut(), || {
            let mut sc = SignupCode::new(SUPER_ADMIN_ID, CodeFormat::Pin, 1)?;
            if std::mem::take(&mut first) {
                sc.access.token = old.secret().to_string();
            }
            Ok(sc)
        })
        .await?;
        assert_ne!(fresh.secret(), old.secret());
        assert!(fresh.usable());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_codes_are_rejected() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;
        let err = get_code(tx.as_mut(), &config(), "no spaces allowed").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Validation));
        Ok(())
    }

    #[tokio::test]
    async fn admins_create_and_delete_codes() -> anyhow::Result<()> {
        let (kredo, store, _) = service(config());
        let ctx = Context::new().with_admin(SUPER_ADMIN_ID);

        let codes = kredo
            .create_signup_codes(&ctx, CodeFormat::Invite, SINGLE_USE, 3)
            .await?;
        assert_eq!(codes.len(), 3);
        let checked = kredo.check_signup_code(codes[0].secret()).await?;
        assert_eq!(checked.access.id, codes[0].access.id);

        kredo.delete_signup_code(&ctx, codes[0].secret()).await?;
        let err = kredo.check_signup_code(codes[0].secret()).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::NotFound));

        let err = kredo
            .create_signup_code(&Context::new(), CodeFormat::Pin, 1)
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        let err = kredo.create_signup_code(&ctx, CodeFormat::Pin, 0).await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Validation));

        let actions: Vec<_> = store.audit_entries().await.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Granted, AuditAction::Revoked]);
        Ok(())
    }

    #[tokio::test]
    async fn users_are_throttled_when_sending_codes() -> anyhow::Result<()> {
        let (kredo, store, mailer) = service(config().with_send_limit(Duration::minutes(5)));
        let mut sender = User::new("kredo", "sender@example.com", "sender");
        sender.status = Status::Active;
        sender.confirmed_at = Some(Utc::now());
        let mut tx = store.begin().await?;
        tx.create_user(&sender).await?;
        tx.commit().await?;
        let ctx = Context::new().with_user(sender.id);

        let sent = kredo.send_signup_code(&ctx, "friend@example.com").await?;
        assert_eq!(sent, SendOutcome::Sent);
        let code = mailer.last_token().ok_or_else(|| anyhow!("no mail"))?;
        assert!(kredo.check_signup_code(&code).await?.sent_at.is_some());

        let err = kredo.send_signup_code(&ctx, "other@example.com").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::RateLimited));
        assert_eq!(mailer.count(), 1);

        let err = kredo.send_signup_code(&ctx, "sender@example.com").await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Conflict));
        Ok(())
    }
}
