//! Local account creation.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{
    audit, codes, finish, password, users, validate, Context, Error, Event, EventKind, Kredo,
    MailKind, Result,
};
use crate::models::{AuditAction, User};

impl Kredo {
    /// Create a restricted local user, then either confirm it right away or
    /// mail a confirmation token.
    ///
    /// `code` is required when signup codes are enforced and consumed when
    /// given otherwise.
    #[instrument(skip(self, ctx, password, data, code))]
    pub async fn signup(
        &self,
        ctx: &Context,
        email: &str,
        username: Option<&str>,
        password: &str,
        data: Option<Value>,
        code: Option<&str>,
    ) -> Result<User> {
        let settings = self.config.signup();
        if settings.disabled {
            return Err(Error::policy("signup is disabled"));
        }
        let provider = self.provider(ctx);
        if provider != self.config.provider() {
            return Err(Error::policy(format!("{provider} signup is not enabled")));
        }
        if settings.code_required && code.is_none() {
            return Err(Error::validation("code", "a signup code is required"));
        }

        let email = validate::email(email)?;
        validate::password(password, self.config.min_password_length())?;
        let username = match username.map(validate::username).transpose()? {
            Some(name) if !name.is_empty() => name,
            _ if settings.default_username => default_username(),
            _ => String::new(),
        };

        let mut user = User::new(provider, &email, &username);
        user.password = Some(password::hash(password).await?);
        if let Some(data) = data {
            user.data = data;
        }

        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            tx.create_user(&user).await?;
            if let Some(code) = code {
                let sc = codes::use_code(tx.as_mut(), &self.config, code, &mut user).await?;
                if !sc.is_debug() {
                    tx.save_user(&user).await?;
                }
            }
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Signup,
                user.id,
                audit::fields(json!({ "provider": user.provider })),
            )
            .await?;

            let confirmed = if settings.auto_confirm {
                users::confirm_user(tx.as_mut(), &mut user, Utc::now()).await?;
                audit::record(
                    tx.as_mut(),
                    ctx,
                    AuditAction::Confirmed,
                    user.id,
                    audit::Fields::new(),
                )
                .await?;
                true
            } else {
                let to = user.email.clone();
                self.send_confirm_token(tx.as_mut(), ctx, MailKind::ConfirmUser, &user, &to, None)
                    .await?;
                false
            };
            Ok(confirmed)
        }
        .await;
        let confirmed = finish(tx, result).await?;

        info!(user_id = %user.id, confirmed, "signup");
        self.events
            .publish(Event::new(EventKind::Signup, ctx, user.id).with_provider(&user.provider));
        if confirmed {
            self.events
                .publish(Event::new(EventKind::Confirmed, ctx, user.id).with_provider(&user.provider));
        }
        Ok(user)
    }
}

/// `user-` followed by eight hex digits.
fn default_username() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("user-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{error::ErrorKind, test_support::*, SignupConfig};
    use crate::models::{CodeFormat, Status, Token, DEBUG_PIN, SUPER_ADMIN_ID};
    use anyhow::anyhow;

    #[tokio::test]
    async fn signup_mails_a_confirmation() -> anyhow::Result<()> {
        let (kredo, store, mailer) = service(config());
        let mut events = kredo.subscribe().ok_or_else(|| anyhow!("events off"))?;

        let user = kredo
            .signup(&Context::new(), "New@Example.com", Some("newbie"), "long enough", None, None)
            .await?;
        assert_eq!(user.email, "new@example.com");
        assert_eq!(user.status, Status::Restricted);
        assert!(user.is_restricted());
        assert_eq!(mailer.count(), 1);
        assert_eq!(events.recv().await?.kind, EventKind::Signup);

        let actions: Vec<_> = store.audit_entries().await.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Signup, AuditAction::ConfirmSent]);

        let dup = kredo
            .signup(&Context::new(), "new@example.com", None, "long enough", None, None)
            .await;
        assert_eq!(dup.err().map(|e| e.kind()), Some(ErrorKind::Conflict));
        Ok(())
    }

    #[tokio::test]
    async fn auto_confirm_activates_immediately() -> anyhow::Result<()> {
        let signup = SignupConfig {
            auto_confirm: true,
            default_username: true,
            ..SignupConfig::default()
        };
        let (kredo, _, mailer) = service(config().with_signup(signup));

        let user = kredo
            .signup(&Context::new(), "a@example.com", None, "long enough", None, None)
            .await?;
        assert!(user.is_active());
        assert!(user.username.starts_with("user-"));
        assert_eq!(mailer.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn signup_refusals() -> anyhow::Result<()> {
        let disabled = SignupConfig {
            disabled: true,
            ..SignupConfig::default()
        };
        let (kredo, _, _) = service(config().with_signup(disabled));
        let err = kredo
            .signup(&Context::new(), "a@example.com", None, "long enough", None, None)
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));

        let (kredo, _, _) = service(config());
        let github = Context::new().with_provider("github");
        let err = kredo
            .signup(&github, "a@example.com", None, "long enough", None, None)
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Policy));
        let err = kredo
            .signup(&Context::new(), "a@example.com", None, "short", None, None)
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Validation));
        Ok(())
    }

    #[tokio::test]
    async fn required_codes_are_consumed() -> anyhow::Result<()> {
        let required = SignupConfig {
            code_required: true,
            ..SignupConfig::default()
        };
        let (kredo, store, _) = service(config().with_signup(required));
        let admin = Context::new().with_admin(SUPER_ADMIN_ID);
        let sc = kredo.create_signup_code(&admin, CodeFormat::Pin, 1).await?;
        let ctx = Context::new();

        let err = kredo
            .signup(&ctx, "a@example.com", None, "long enough", None, None)
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::Validation));

        let user = kredo
            .signup(&ctx, "a@example.com", None, "long enough", None, Some(sc.secret()))
            .await?;
        assert_eq!(user.signup_code, Some(sc.access.id));

        let err = kredo
            .signup(&ctx, "b@example.com", None, "long enough", None, Some(sc.secret()))
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        // nothing from the failed attempt was kept
        assert!(!kredo.is_email_taken("b@example.com").await?);
        assert_eq!(store.user_records().await.len(), 1);

        let err = kredo
            .signup(&ctx, "c@example.com", None, "long enough", None, Some(DEBUG_PIN))
            .await;
        assert_eq!(err.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        Ok(())
    }
}
