//! Core configuration with builder-style setters.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::Algorithm;
use secrecy::SecretString;

pub const DEFAULT_PROVIDER: &str = "kredo";
const DEFAULT_ISSUER: &str = "kredo";
const DEFAULT_BEARER_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_CONFIRM_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_AUTH_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_SEND_LIMIT_SECONDS: i64 = 60;
const DEFAULT_MIN_PASSWORD_LENGTH: usize = 8;

/// Ten years; the ceiling for every configured lifetime or send limit.
pub const MAX_DURATION_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct JwtConfig {
    secret: SecretString,
    algorithm: Algorithm,
    issuer: String,
    audience: Vec<String>,
    expiration: Duration,
}

impl JwtConfig {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            algorithm: Algorithm::HS256,
            issuer: DEFAULT_ISSUER.to_string(),
            audience: Vec::new(),
            expiration: Duration::seconds(DEFAULT_BEARER_TTL_SECONDS),
        }
    }

    /// Only the HMAC family is accepted; anything else falls back to HS256.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = match algorithm {
            Algorithm::HS384 | Algorithm::HS512 => algorithm,
            _ => Algorithm::HS256,
        };
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: Vec<String>) -> Self {
        self.audience = audience;
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &[String] {
        &self.audience
    }

    #[must_use]
    pub fn expiration(&self) -> Duration {
        self.expiration
    }
}

#[derive(Clone, Debug, Default)]
pub struct SignupConfig {
    pub disabled: bool,
    pub auto_confirm: bool,
    pub code_required: bool,
    pub default_username: bool,
}

#[derive(Clone, Debug)]
pub struct CoreConfig {
    provider: String,
    jwt: JwtConfig,
    signup: SignupConfig,
    confirm_expiration: Duration,
    auth_expiration: Duration,
    send_limit: Duration,
    mail_disabled: bool,
    events_disabled: bool,
    debug_pin: bool,
    min_password_length: usize,
}

impl CoreConfig {
    #[must_use]
    pub fn new(jwt: JwtConfig) -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            jwt,
            signup: SignupConfig::default(),
            confirm_expiration: Duration::seconds(DEFAULT_CONFIRM_TTL_SECONDS),
            auth_expiration: Duration::seconds(DEFAULT_AUTH_TTL_SECONDS),
            send_limit: Duration::seconds(DEFAULT_SEND_LIMIT_SECONDS),
            mail_disabled: false,
            events_disabled: false,
            debug_pin: false,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
        }
    }

    /// Name of the local (password) identity provider.
    #[must_use]
    pub fn with_provider(mut self, provider: String) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_signup(mut self, signup: SignupConfig) -> Self {
        self.signup = signup;
        self
    }

    #[must_use]
    pub fn with_confirm_expiration(mut self, expiration: Duration) -> Self {
        self.confirm_expiration = expiration;
        self
    }

    #[must_use]
    pub fn with_auth_expiration(mut self, expiration: Duration) -> Self {
        self.auth_expiration = expiration;
        self
    }

    /// Minimum interval between two mails of the same kind to one user.
    #[must_use]
    pub fn with_send_limit(mut self, limit: Duration) -> Self {
        self.send_limit = limit;
        self
    }

    /// Skip every mail send. Sends report [`SendOutcome::Skipped`](super::mail::SendOutcome).
    #[must_use]
    pub fn with_mail_disabled(mut self, disabled: bool) -> Self {
        self.mail_disabled = disabled;
        self
    }

    #[must_use]
    pub fn with_events_disabled(mut self, disabled: bool) -> Self {
        self.events_disabled = disabled;
        self
    }

    /// Accept the reserved PIN `000000` as a signup code. Never enable in production.
    #[must_use]
    pub fn with_debug_pin(mut self, enabled: bool) -> Self {
        self.debug_pin = enabled;
        self
    }

    #[must_use]
    pub fn with_min_password_length(mut self, length: usize) -> Self {
        self.min_password_length = length;
        self
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[must_use]
    pub fn jwt(&self) -> &JwtConfig {
        &self.jwt
    }

    #[must_use]
    pub fn signup(&self) -> &SignupConfig {
        &self.signup
    }

    #[must_use]
    pub fn confirm_expiration(&self) -> Duration {
        self.confirm_expiration
    }

    #[must_use]
    pub fn auth_expiration(&self) -> Duration {
        self.auth_expiration
    }

    #[must_use]
    pub fn send_limit(&self) -> Duration {
        self.send_limit
    }

    /// Sends stamped after this instant fall inside the send limit.
    #[must_use]
    pub fn send_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.send_limit)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    #[must_use]
    pub fn mail_disabled(&self) -> bool {
        self.mail_disabled
    }

    #[must_use]
    pub fn events_disabled(&self) -> bool {
        self.events_disabled
    }

    #[must_use]
    pub fn debug_pin(&self) -> bool {
        self.debug_pin
    }

    #[must_use]
    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }
}
