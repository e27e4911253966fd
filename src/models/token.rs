//! Generic access-token record shared by every credential kind.
//!
//! Each concrete credential (refresh, confirm, provider authorization, signup
//! code, bearer) embeds one [`AccessToken`] and implements [`Token`], so usage
//! and expiry rules are written once here.
//!
//! Usage is derived from the requested `uses` and expiration when the record is
//! built and is never chosen directly:
//!
//! | uses      | exp   | usage      | max uses |
//! |-----------|-------|------------|----------|
//! | `<= -1`   | `<= 0`| `Infinite` | `-1`     |
//! | `0..=1`   | `<= 0`| `Single`   | `1`      |
//! | `> 1`     | `<= 0`| `Multi`    | `uses`   |
//! | any       | `> 0` | `Timed`    | as above |
//!
//! The absolute expiry is computed from the server-assigned creation time, so
//! it only exists once the record has been stored.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use super::user::SYSTEM_ID;

/// `max_uses` sentinel for unlimited tokens.
pub const INFINITE_USE: i32 = -1;
pub const SINGLE_USE: i32 = 1;

/// Reserved PIN that bypasses signup-code checks when explicitly enabled.
pub const DEBUG_PIN: &str = "000000";

const PIN_LENGTH: usize = 6;

/// `at + exp`, or `None` when the sum is not representable.
#[must_use]
pub fn expiry_after(at: DateTime<Utc>, exp: Duration) -> Option<DateTime<Utc>> {
    at.checked_add_signed(exp)
}

/// Zero duration, meaning "never expires".
#[must_use]
pub fn no_expiration() -> Duration {
    Duration::zero()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Class {
    Access,
    Refresh,
    Confirm,
    Auth,
    Signup,
    Bearer,
}

impl Class {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Confirm => "confirm",
            Self::Auth => "auth",
            Self::Signup => "signup",
            Self::Bearer => "bearer",
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Class {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(Self::Access),
            "refresh" => Ok(Self::Refresh),
            "confirm" => Ok(Self::Confirm),
            "auth" => Ok(Self::Auth),
            "signup" => Ok(Self::Signup),
            "bearer" => Ok(Self::Bearer),
            other => Err(format!("unknown token class: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Usage {
    Infinite,
    Single,
    Multi,
    Timed,
}

impl Usage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Infinite => "infinite",
            Self::Single => "single",
            Self::Multi => "multi",
            Self::Timed => "timed",
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Usage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infinite" => Ok(Self::Infinite),
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            "timed" => Ok(Self::Timed),
            other => Err(format!("unknown token usage: {other}")),
        }
    }
}

/// The common credential record.
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub usage: Usage,
    pub token: String,
    pub max_uses: i32,
    pub used: i32,
    pub used_at: Option<DateTime<Utc>>,
    pub expiration: Duration,
    pub expired_at: Option<DateTime<Utc>>,
    pub data: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

// Keep the secret out of logs.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("usage", &self.usage)
            .field("max_uses", &self.max_uses)
            .field("used", &self.used)
            .field("used_at", &self.used_at)
            .field("expiration", &self.expiration)
            .field("expired_at", &self.expired_at)
            .field("created_at", &self.created_at)
            .field("deleted_at", &self.deleted_at)
            .finish_non_exhaustive()
    }
}

impl AccessToken {
    /// Build a record owned by the system user, deriving usage from `uses` and `exp`.
    #[must_use]
    pub fn new(token: String, uses: i32, exp: Duration) -> Self {
        let (mut usage, max_uses) = if uses <= INFINITE_USE {
            (Usage::Infinite, INFINITE_USE)
        } else if uses <= SINGLE_USE {
            (Usage::Single, SINGLE_USE)
        } else {
            (Usage::Multi, uses)
        };

        let expiration = if exp > Duration::zero() {
            usage = Usage::Timed;
            exp
        } else {
            no_expiration()
        };

        Self {
            id: Uuid::now_v7(),
            user_id: SYSTEM_ID,
            usage,
            token,
            max_uses,
            used: 0,
            used_at: None,
            expiration,
            expired_at: None,
            data: None,
            created_at: None,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn owned_by(mut self, user_id: Uuid) -> Self {
        self.user_id = user_id;
        self
    }

    /// Record the server-assigned creation time and derive the absolute expiry,
    /// saturating at the latest representable instant.
    pub fn stamp_created(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
        if self.expiration > Duration::zero() {
            self.expired_at =
                Some(expiry_after(at, self.expiration).unwrap_or(DateTime::<Utc>::MAX_UTC));
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|exp| exp < now)
    }

    #[must_use]
    pub fn usable_at(&self, now: DateTime<Utc>) -> bool {
        if self.token.is_empty() || self.deleted_at.is_some() || self.is_expired_at(now) {
            return false;
        }
        if self.usage == Usage::Infinite || self.max_uses == INFINITE_USE {
            return true;
        }
        self.used < self.max_uses
    }

    fn record_use(&mut self, at: DateTime<Utc>) {
        self.used = self.used.saturating_add(1);
        self.used_at = Some(at);
    }
}

/// Capability interface implemented once per credential kind.
pub trait Token {
    fn class(&self) -> Class;

    fn access(&self) -> &AccessToken;

    fn access_mut(&mut self) -> &mut AccessToken;

    /// Stored kinds are only usable after they have been persisted.
    fn persisted_only(&self) -> bool {
        false
    }

    fn usage(&self) -> Usage {
        self.access().usage
    }

    fn issued_to(&self) -> Uuid {
        self.access().user_id
    }

    fn issued(&self) -> Option<DateTime<Utc>> {
        self.access().created_at
    }

    fn last_used(&self) -> Option<DateTime<Utc>> {
        self.access().used_at
    }

    fn expiration_date(&self) -> Option<DateTime<Utc>> {
        self.access().expired_at
    }

    fn revoked(&self) -> Option<DateTime<Utc>> {
        self.access().deleted_at
    }

    /// The credential secret.
    fn secret(&self) -> &str {
        &self.access().token
    }

    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        if self.persisted_only() && self.access().created_at.is_none() {
            return false;
        }
        self.access().usable_at(now)
    }

    fn usable(&self) -> bool {
        self.usable_at(Utc::now())
    }

    /// Count one use. Callers check [`Token::usable`] first.
    fn use_token(&mut self, at: DateTime<Utc>) {
        self.access_mut().record_use(at);
    }
}

impl Token for AccessToken {
    fn class(&self) -> Class {
        Class::Access
    }

    fn access(&self) -> &AccessToken {
        self
    }

    fn access_mut(&mut self) -> &mut AccessToken {
        self
    }
}

/// Signup/access code presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeFormat {
    Invite,
    Pin,
}

impl CodeFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Pin => "pin",
        }
    }
}

impl FromStr for CodeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invite" => Ok(Self::Invite),
            "pin" => Ok(Self::Pin),
            other => Err(format!("unknown code format: {other}")),
        }
    }
}

/// Flat storage shape of every persisted credential kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub class: Class,
    pub access: AccessToken,
    pub sent_at: Option<DateTime<Utc>>,
    pub format: Option<CodeFormat>,
    pub provider: Option<String>,
}

impl TokenRecord {
    #[must_use]
    pub fn new(class: Class, access: AccessToken) -> Self {
        Self {
            class,
            access,
            sent_at: None,
            format: None,
            provider: None,
        }
    }
}

/// Credential kinds that live in the token table.
pub trait Stored: Token + Sized {
    const CLASS: Class;

    fn to_record(&self) -> TokenRecord;

    fn from_record(record: TokenRecord) -> Self;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshToken {
    pub access: AccessToken,
}

impl RefreshToken {
    /// A new unlimited, non-expiring refresh token for `user_id`.
    ///
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn new(user_id: Uuid) -> Result<Self> {
        let access =
            AccessToken::new(secure_token()?, INFINITE_USE, no_expiration()).owned_by(user_id);
        Ok(Self { access })
    }
}

impl Token for RefreshToken {
    fn class(&self) -> Class {
        Class::Refresh
    }

    fn access(&self) -> &AccessToken {
        &self.access
    }

    fn access_mut(&mut self) -> &mut AccessToken {
        &mut self.access
    }

    fn persisted_only(&self) -> bool {
        true
    }
}

impl Stored for RefreshToken {
    const CLASS: Class = Class::Refresh;

    fn to_record(&self) -> TokenRecord {
        TokenRecord::new(Self::CLASS, self.access.clone())
    }

    fn from_record(record: TokenRecord) -> Self {
        Self {
            access: record.access,
        }
    }
}

/// Single-use email confirmation token.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmToken {
    pub access: AccessToken,
    pub sent_at: Option<DateTime<Utc>>,
}

impl ConfirmToken {
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn new(user_id: Uuid, exp: Duration) -> Result<Self> {
        let access = AccessToken::new(secure_token()?, SINGLE_USE, exp).owned_by(user_id);
        Ok(Self {
            access,
            sent_at: None,
        })
    }
}

impl Token for ConfirmToken {
    fn class(&self) -> Class {
        Class::Confirm
    }

    fn access(&self) -> &AccessToken {
        &self.access
    }

    fn access_mut(&mut self) -> &mut AccessToken {
        &mut self.access
    }

    fn persisted_only(&self) -> bool {
        true
    }
}

impl Stored for ConfirmToken {
    const CLASS: Class = Class::Confirm;

    fn to_record(&self) -> TokenRecord {
        let mut record = TokenRecord::new(Self::CLASS, self.access.clone());
        record.sent_at = self.sent_at;
        record
    }

    fn from_record(record: TokenRecord) -> Self {
        Self {
            access: record.access,
            sent_at: record.sent_at,
        }
    }
}

/// Correlates an outbound provider redirect with its callback.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub access: AccessToken,
    pub provider: String,
}

impl AuthToken {
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn new(provider: &str, exp: Duration) -> Result<Self> {
        let access =
            AccessToken::new(secure_token()?, SINGLE_USE, exp).owned_by(provider_id(provider));
        Ok(Self {
            access,
            provider: provider.to_string(),
        })
    }

    #[must_use]
    pub fn session(&self) -> Option<&serde_json::Value> {
        self.access.data.as_ref().and_then(|data| data.get("session"))
    }
}

impl Token for AuthToken {
    fn class(&self) -> Class {
        Class::Auth
    }

    fn access(&self) -> &AccessToken {
        &self.access
    }

    fn access_mut(&mut self) -> &mut AccessToken {
        &mut self.access
    }
}

impl Stored for AuthToken {
    const CLASS: Class = Class::Auth;

    fn to_record(&self) -> TokenRecord {
        let mut record = TokenRecord::new(Self::CLASS, self.access.clone());
        record.provider = Some(self.provider.clone());
        record
    }

    fn from_record(record: TokenRecord) -> Self {
        Self {
            provider: record.provider.unwrap_or_default(),
            access: record.access,
        }
    }
}

/// Signup or access code, created by `user_id` and consumed by new accounts.
#[derive(Debug, Clone, PartialEq)]
pub struct SignupCode {
    pub access: AccessToken,
    pub format: CodeFormat,
    pub sent_at: Option<DateTime<Utc>>,
}

impl SignupCode {
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn new(user_id: Uuid, format: CodeFormat, uses: i32) -> Result<Self> {
        let code = match format {
            CodeFormat::Pin => random_pin(),
            CodeFormat::Invite => secure_token()?,
        };
        let access = AccessToken::new(code, uses, no_expiration()).owned_by(user_id);
        Ok(Self {
            access,
            format,
            sent_at: None,
        })
    }

    /// The in-memory debug code; never stored.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            access: AccessToken::new(DEBUG_PIN.to_string(), INFINITE_USE, no_expiration()),
            format: CodeFormat::Pin,
            sent_at: None,
        }
    }

    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.format == CodeFormat::Pin && is_debug_pin(&self.access.token)
    }
}

impl Token for SignupCode {
    fn class(&self) -> Class {
        Class::Signup
    }

    fn access(&self) -> &AccessToken {
        &self.access
    }

    fn access_mut(&mut self) -> &mut AccessToken {
        &mut self.access
    }

    fn persisted_only(&self) -> bool {
        true
    }

    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_debug() {
            return true;
        }
        self.access.created_at.is_some() && self.access.usable_at(now)
    }
}

impl Stored for SignupCode {
    const CLASS: Class = Class::Signup;

    fn to_record(&self) -> TokenRecord {
        let mut record = TokenRecord::new(Self::CLASS, self.access.clone());
        record.format = Some(self.format);
        record.sent_at = self.sent_at;
        record
    }

    fn from_record(record: TokenRecord) -> Self {
        Self {
            format: record.format.unwrap_or(CodeFormat::Invite),
            sent_at: record.sent_at,
            access: record.access,
        }
    }
}

/// Signed, stateless credential paired with a refresh row.
#[derive(Debug, Clone, PartialEq)]
pub struct BearerToken {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

impl Token for BearerToken {
    fn class(&self) -> Class {
        Class::Bearer
    }

    fn access(&self) -> &AccessToken {
        &self.access
    }

    fn access_mut(&mut self) -> &mut AccessToken {
        &mut self.access
    }
}

/// 32 random bytes, URL-safe base64 without padding.
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn secure_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate secure token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Six random digits, never the reserved debug PIN.
#[must_use]
pub fn random_pin() -> String {
    let mut rng = OsRng;
    loop {
        let pin: String = (0..PIN_LENGTH)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        if !is_debug_pin(&pin) {
            return pin;
        }
    }
}

#[must_use]
pub fn is_debug_pin(code: &str) -> bool {
    code == DEBUG_PIN
}

/// A code is either a six digit PIN or a non-empty URL-safe string.
#[must_use]
pub fn is_valid_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Deterministic pseudo-owner for provider authorization tokens.
#[must_use]
pub fn provider_id(provider: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("provider:{provider}").as_bytes())
}
