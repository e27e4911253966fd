//! # Kredo (Credential Lifecycle Engine)
//!
//! `kredo` owns the credentials an identity provider hands out and takes back:
//! bearer/refresh pairs, confirmation tokens, provider-authorization tokens and
//! signup/access codes, together with the user trust state they depend on.
//!
//! ## Tokens
//!
//! Every stored credential is one row in `access_tokens`. Its usage (infinite,
//! single, multi-use or timed) is derived from the requested use count and
//! expiration when the row is built, and never changes afterwards. A token is
//! usable while it is not revoked, not expired and not exhausted.
//!
//! - **Refresh tokens** are single-active per user and rotate on every use. A
//!   rotated token presented again fails exactly like an unknown one.
//! - **Confirm tokens** prove control of an email address. Resends inside the
//!   configured send limit are suppressed and still reported as success.
//! - **Signup codes** gate account creation. The fixed debug PIN is only
//!   honoured when explicitly enabled.
//!
//! ## Users
//!
//! Roles climb `system < user < admin < super`; statuses climb
//! `banned < locked < restricted < active < verified`. Lock and ban only move a
//! user down. Confirmation is the only way up and refuses locked accounts.
//! Banned users are never deleted so their email stays reserved.
//!
//! ## Transactions & Audit
//!
//! Each service operation runs in one storage transaction. Audit entries are
//! written inside it, so a failed audit write rolls the whole operation back.
//! Domain events are published only after commit.

pub mod api;
pub mod cli;
pub mod core;
pub mod models;
pub mod store;
pub mod vault;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

pub use crate::core::{Context, CoreConfig, Error, ErrorKind, Kredo, Result};
