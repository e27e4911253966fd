//! External identity providers (OAuth, SAML).
//!
//! Providers are registered explicitly and injected into [`Kredo`]. The core
//! issues a single-use auth token per redirect and redeems it on callback;
//! the provider exchange runs between two transactions, never inside one.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};
use url::Url;

use super::{
    audit, bearer, finish, tokens, users, validate, Context, Error, Event, EventKind, Kredo,
    Result,
};
use crate::models::{AuditAction, AuthToken, BearerToken, Token, User};
use crate::store::UserFilter;

/// Normalized result of a provider exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProfile {
    pub account_id: String,
    pub email: String,
    pub username: Option<String>,
    pub data: Value,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Redirect URL carrying `state`, and the session blob to keep until the
    /// callback arrives.
    fn authorization_url(&self, state: &str) -> anyhow::Result<(Url, Value)>;

    async fn exchange(
        &self,
        session: &Value,
        params: &HashMap<String, String>,
    ) -> anyhow::Result<ProviderProfile>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn IdentityProvider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the provider's own name, replacing any previous entry.
    #[must_use]
    pub fn register(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn IdentityProvider>> {
        self.providers.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Outcome of a provider callback.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub user: User,
    pub bearer: BearerToken,
    /// `true` when the callback created the account.
    pub created: bool,
}

impl Kredo {
    /// Start a provider login: returns the redirect URL.
    #[instrument(skip(self, ctx))]
    pub async fn authorization_url(&self, ctx: &Context, provider: &str) -> Result<Url> {
        let idp = self
            .providers
            .get(provider)
            .ok_or(Error::NotFound("identity provider"))?;

        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let mut at = AuthToken::new(provider, self.config.auth_expiration())?;
            let (url, session) = idp
                .authorization_url(at.secret())
                .map_err(|e| Error::Infrastructure(e.context("authorization url")))?;
            at.access.data = Some(json!({ "session": session }));
            tokens::create(tx.as_mut(), &mut at).await?;
            audit::record(
                tx.as_mut(),
                ctx,
                AuditAction::Granted,
                at.issued_to(),
                audit::token_fields(&at),
            )
            .await?;
            Ok(url)
        }
        .await;
        finish(tx, result).await
    }

    /// Complete a provider login from its callback: log the bound user in, or
    /// sign a new one up already confirmed.
    #[instrument(skip(self, ctx, token, params))]
    pub async fn authorize_user(
        &self,
        ctx: &Context,
        token: &str,
        params: &HashMap<String, String>,
    ) -> Result<Authorized> {
        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let mut at: AuthToken = tokens::usable_token(tx.as_mut(), token).await?;
            tokens::use_token(tx.as_mut(), &mut at).await?;
            Ok(at)
        }
        .await;
        let at = finish(tx, result).await?;

        let idp = self
            .providers
            .get(&at.provider)
            .ok_or(Error::NotFound("identity provider"))?;
        let session = at.session().cloned().unwrap_or(Value::Null);
        let profile = idp
            .exchange(&session, params)
            .await
            .map_err(|e| Error::Infrastructure(e.context("provider exchange")))?;
        let email = validate::email(&profile.email)?;
        let ctx = ctx.clone().with_provider(&at.provider);

        let mut tx = self.begin().await?;
        let result: Result<_> = async {
            let existing = tx.first_user(UserFilter::Email(&email)).await?;
            let (mut user, created) = match existing {
                Some(user) => {
                    if user.provider != at.provider {
                        return Err(Error::policy("account uses another identity provider"));
                    }
                    (user, false)
                }
                None => {
                    let username = profile
                        .username
                        .as_deref()
                        .map(validate::username)
                        .transpose()?
                        .unwrap_or_default();
                    let mut user = User::new(&at.provider, &email, &username);
                    user.data = profile.data.clone();
                    user.metadata = json!({ "account_id": profile.account_id });
                    tx.create_user(&user).await?;
                    audit::record(
                        tx.as_mut(),
                        &ctx,
                        AuditAction::Signup,
                        user.id,
                        audit::Fields::new(),
                    )
                    .await?;
                    (user, true)
                }
            };

            if users::confirm_user(tx.as_mut(), &mut user, Utc::now()).await? && !created {
                audit::record(
                    tx.as_mut(),
                    &ctx,
                    AuditAction::Linked,
                    user.id,
                    audit::fields(json!({ "account_id": profile.account_id })),
                )
                .await?;
            }
            if !user.is_active() {
                return Err(Error::policy("inactive user"));
            }
            user.login_at = Some(Utc::now());
            tx.save_user(&user).await?;
            audit::record(
                tx.as_mut(),
                &ctx,
                AuditAction::Login,
                user.id,
                audit::Fields::new(),
            )
            .await?;
            let bearer = bearer::grant_bearer_token(tx.as_mut(), self.config.jwt(), &user).await?;
            Ok(Authorized {
                user,
                bearer,
                created,
            })
        }
        .await;
        let authorized = finish(tx, result).await?;

        info!(user_id = %authorized.user.id, provider = %at.provider, created = authorized.created, "provider login");
        if authorized.created {
            self.events.publish(
                Event::new(EventKind::Signup, &ctx, authorized.user.id).with_provider(&at.provider),
            );
        }
        self.events.publish(
            Event::new(EventKind::Login, &ctx, authorized.user.id).with_provider(&at.provider),
        );
        Ok(authorized)
    }
}
