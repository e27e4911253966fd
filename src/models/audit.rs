use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    System,
    Account,
    Token,
    User,
}

impl AuditKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Account => "account",
            Self::Token => "token",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // account
    Signup,
    CodeSent,
    ConfirmSent,
    Confirmed,
    Linked,
    Banned,
    Locked,
    Deleted,
    // token
    Granted,
    Refreshed,
    Revoked,
    RevokedAll,
    // user
    Login,
    Logout,
    Password,
    Email,
    Updated,
    ChangeRole,
    // system
    Startup,
    Shutdown,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::CodeSent => "code_sent",
            Self::ConfirmSent => "confirm_sent",
            Self::Confirmed => "confirmed",
            Self::Linked => "linked",
            Self::Banned => "banned",
            Self::Locked => "locked",
            Self::Deleted => "deleted",
            Self::Granted => "granted",
            Self::Refreshed => "refreshed",
            Self::Revoked => "revoked",
            Self::RevokedAll => "revoked_all",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Password => "password",
            Self::Email => "email",
            Self::Updated => "updated",
            Self::ChangeRole => "change_role",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
        }
    }

    #[must_use]
    pub fn kind(self) -> AuditKind {
        match self {
            Self::Signup
            | Self::CodeSent
            | Self::ConfirmSent
            | Self::Confirmed
            | Self::Linked
            | Self::Banned
            | Self::Locked
            | Self::Deleted => AuditKind::Account,
            Self::Granted | Self::Refreshed | Self::Revoked | Self::RevokedAll => AuditKind::Token,
            Self::Login
            | Self::Logout
            | Self::Password
            | Self::Email
            | Self::Updated
            | Self::ChangeRole => AuditKind::User,
            Self::Startup | Self::Shutdown => AuditKind::System,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: AuditKind,
    pub action: AuditAction,
    pub user_id: Uuid,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        action: AuditAction,
        user_id: Uuid,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind: action.kind(),
            action,
            user_id,
            fields,
            created_at: Utc::now(),
        }
    }
}
