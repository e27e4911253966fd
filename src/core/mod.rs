//! Credential lifecycle engine.
//!
//! [`Kredo`] is the service root. Each public operation opens one storage
//! transaction, runs the token/user/audit changes inside it, commits, and only
//! then publishes domain events.

pub mod audit;
pub mod authorize;
pub mod bearer;
pub mod codes;
pub mod config;
pub mod confirm;
pub mod context;
pub mod error;
pub mod events;
pub mod login;
pub mod mail;
pub mod password;
pub mod signup;
pub mod tokens;
pub mod users;
pub mod validate;

pub use self::authorize::{Authorized, IdentityProvider, ProviderProfile, ProviderRegistry};
pub use self::config::{CoreConfig, JwtConfig, SignupConfig};
pub use self::context::Context;
pub use self::error::{Error, ErrorKind, Result};
pub use self::events::{Dispatch, Event, EventKind};
pub use self::mail::{LogMailSender, MailKind, MailMessage, MailSender, SendOutcome};

use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::models::{AuditAction, SYSTEM_ID};
use crate::store::{Store, Transaction};

pub struct Kredo {
    store: Arc<dyn Store>,
    config: CoreConfig,
    mailer: Arc<dyn MailSender>,
    events: Dispatch,
    providers: ProviderRegistry,
}

impl Kredo {
    /// Service with the logging mail sender and no external providers.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: CoreConfig) -> Self {
        let events = if config.events_disabled() {
            Dispatch::disabled()
        } else {
            Dispatch::new()
        };
        Self {
            store,
            config,
            mailer: Arc::new(LogMailSender),
            events,
            providers: ProviderRegistry::new(),
        }
    }

    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn MailSender>) -> Self {
        self.mailer = mailer;
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// `None` when events are disabled.
    #[must_use]
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        self.events.subscribe()
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await?;
        Ok(())
    }

    /// Record the system startup entry.
    pub async fn startup(&self, ctx: &Context) -> Result<()> {
        self.system_event(ctx, AuditAction::Startup).await
    }

    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        self.system_event(ctx, AuditAction::Shutdown).await
    }

    async fn system_event(&self, ctx: &Context, action: AuditAction) -> Result<()> {
        let mut tx = self.begin().await?;
        let result = audit::record(
            tx.as_mut(),
            ctx,
            action,
            SYSTEM_ID,
            audit::fields(json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "build": crate::GIT_COMMIT_HASH,
            })),
        )
        .await;
        finish(tx, result).await?;
        info!(action = %action, "system event recorded");
        Ok(())
    }

    pub(crate) async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(self.store.begin().await?)
    }

    /// Senders may block on network I/O, so delivery runs on the blocking pool.
    async fn mail(&self, message: MailMessage) -> Result<()> {
        let mailer = Arc::clone(&self.mailer);
        tokio::task::spawn_blocking(move || mailer.send(&message))
            .await
            .map_err(|e| Error::Infrastructure(anyhow::anyhow!("mail task failed: {e}")))?
            .map_err(|e| Error::Infrastructure(e.context("send mail")))
    }

    /// The provider named by the request, or the local one.
    fn provider<'a>(&'a self, ctx: &'a Context) -> &'a str {
        ctx.provider().unwrap_or_else(|| self.config.provider())
    }
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<T>(tx: Box<dyn Transaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                error!("rollback failed: {rollback}");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::store::MemoryStore;
    use secrecy::SecretString;
    use std::sync::Mutex;

    /// Mail sender that remembers what it was asked to send.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<MailMessage>>,
    }

    impl MailSender for RecordingMailer {
        fn send(&self, message: &MailMessage) -> anyhow::Result<()> {
            self.sent
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(message.clone());
            Ok(())
        }
    }

    impl RecordingMailer {
        pub fn count(&self) -> usize {
            self.sent.lock().map(|sent| sent.len()).unwrap_or_default()
        }

        pub fn last_token(&self) -> Option<String> {
            self.sent
                .lock()
                .ok()
                .and_then(|sent| sent.last().map(|m| m.token.clone()))
        }
    }

    pub fn config() -> CoreConfig {
        CoreConfig::new(JwtConfig::new(SecretString::from("test-secret")))
            .with_min_password_length(8)
    }

    pub fn service(config: CoreConfig) -> (Kredo, MemoryStore, Arc<RecordingMailer>) {
        let store = MemoryStore::new();
        let mailer = Arc::new(RecordingMailer::default());
        let kredo = Kredo::new(Arc::new(store.clone()), config).with_mailer(mailer.clone());
        (kredo, store, mailer)
    }
}
