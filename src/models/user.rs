//! User record plus the role and status ladders.
//!
//! Status predicates fold in both the ladder and the timestamps, so a user
//! whose status says `Active` but who was never confirmed is still treated as
//! restricted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Owner of credentials that do not belong to a real user.
pub const SYSTEM_ID: Uuid = Uuid::nil();

/// Seeded out-of-band; always acts with [`Role::Super`].
pub const SUPER_ADMIN_ID: Uuid = Uuid::from_u128(u128::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System = 0,
    User = 1,
    Admin = 2,
    Super = 3,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Admin => "admin",
            Self::Super => "super",
        }
    }

    #[must_use]
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    #[must_use]
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::System),
            1 => Some(Self::User),
            2 => Some(Self::Admin),
            3 => Some(Self::Super),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "super" => Ok(Self::Super),
            other => Err(format!("invalid role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Banned = 0,
    Locked = 1,
    Restricted = 2,
    Active = 3,
    Verified = 4,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::Locked => "locked",
            Self::Restricted => "restricted",
            Self::Active => "active",
            Self::Verified => "verified",
        }
    }

    #[must_use]
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    #[must_use]
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Banned),
            1 => Some(Self::Locked),
            2 => Some(Self::Restricted),
            3 => Some(Self::Active),
            4 => Some(Self::Verified),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub provider: String,
    pub role: Role,
    pub status: Status,
    pub email: String,
    pub username: String,
    #[serde(skip)]
    pub password: Option<String>,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub signup_code: Option<Uuid>,
    pub login_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub invited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("role", &self.role)
            .field("status", &self.status)
            .field("email", &self.email)
            .field("username", &self.username)
            .field("confirmed_at", &self.confirmed_at)
            .field("deleted_at", &self.deleted_at)
            .finish_non_exhaustive()
    }
}

impl User {
    /// A new restricted user with role [`Role::User`].
    #[must_use]
    pub fn new(provider: &str, email: &str, username: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            role: Role::User,
            status: Status::Restricted,
            email: email.to_string(),
            username: username.to_string(),
            password: None,
            data: serde_json::Value::Object(serde_json::Map::new()),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            signup_code: None,
            login_at: None,
            confirmed_at: None,
            verified_at: None,
            invited_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_ID
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role >= Role::Admin
    }

    #[must_use]
    pub fn is_super(&self) -> bool {
        self.id == SUPER_ADMIN_ID || self.role == Role::Super
    }

    #[must_use]
    pub fn is_banned(&self) -> bool {
        self.id.is_nil() || self.status <= Status::Banned
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.is_banned() || self.status <= Status::Locked
    }

    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.is_locked() && (self.status <= Status::Restricted || self.confirmed_at.is_none())
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        !self.is_locked() && self.confirmed_at.is_some()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_confirmed() && self.status >= Status::Active
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.is_confirmed() && self.verified_at.is_some() && self.status >= Status::Verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(status: Status, confirmed: bool) -> User {
        let mut u = User::new("kredo", "a@example.com", "a");
        u.status = status;
        u.confirmed_at = confirmed.then(Utc::now);
        u
    }

    #[test]
    fn ladders_are_ordered() {
        assert!(Role::System < Role::User);
        assert!(Role::User < Role::Admin);
        assert!(Role::Admin < Role::Super);
        assert!(Status::Banned < Status::Locked);
        assert!(Status::Locked < Status::Restricted);
        assert!(Status::Restricted < Status::Active);
        assert!(Status::Active < Status::Verified);
    }

    #[test]
    fn new_users_are_restricted() {
        let u = User::new("kredo", "a@example.com", "a");
        assert!(u.is_restricted());
        assert!(!u.is_confirmed());
        assert!(!u.is_active());
        assert!(!u.is_locked());
    }

    #[test]
    fn active_requires_confirmation() {
        assert!(user(Status::Active, true).is_active());
        let unconfirmed = user(Status::Active, false);
        assert!(!unconfirmed.is_active());
        assert!(unconfirmed.is_restricted());
    }

    #[test]
    fn banned_implies_locked() {
        let banned = user(Status::Banned, true);
        assert!(banned.is_banned());
        assert!(banned.is_locked());
        assert!(!banned.is_restricted());
        assert!(!banned.is_confirmed());
        assert!(!banned.is_active());

        let locked = user(Status::Locked, true);
        assert!(!locked.is_banned());
        assert!(locked.is_locked());
        assert!(!locked.is_active());
    }

    #[test]
    fn invalid_rows_count_as_banned() {
        let mut u = user(Status::Active, true);
        u.id = Uuid::nil();
        assert!(u.is_banned());
        assert!(u.is_system());
    }

    #[test]
    fn verified_needs_timestamp_and_status() {
        let mut u = user(Status::Verified, true);
        assert!(!u.is_verified());
        u.verified_at = Some(Utc::now());
        assert!(u.is_verified());
        u.status = Status::Active;
        assert!(!u.is_verified());
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Admin".parse::<Role>(), Ok(Role::Admin));
        assert!("root".parse::<Role>().is_err());
        assert_eq!(Role::from_i16(Role::Super.as_i16()), Some(Role::Super));
        assert_eq!(Status::from_i16(9), None);
    }

    #[test]
    fn password_is_not_serialized() -> anyhow::Result<()> {
        let mut u = user(Status::Active, true);
        u.password = Some("hash".to_string());
        let json = serde_json::to_string(&u)?;
        assert!(!json.contains("hash"));
        Ok(())
    }
}
