//! Mail collaborator. The core decides when to send; implementations decide how.
//!
//! The default sender for local development is [`LogMailSender`], which only
//! logs. Sends are skipped outright when mail is disabled in
//! [`CoreConfig`](super::config::CoreConfig).

use anyhow::Result;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    ConfirmUser,
    ResetPassword,
    ChangeEmail,
    SignupCode,
}

impl MailKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfirmUser => "confirm_user",
            Self::ResetPassword => "reset_password",
            Self::ChangeEmail => "change_email",
            Self::SignupCode => "signup_code",
        }
    }
}

#[derive(Clone)]
pub struct MailMessage {
    pub kind: MailKind,
    pub to: String,
    pub token: String,
    pub referrer: Option<String>,
}

impl fmt::Debug for MailMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailMessage")
            .field("kind", &self.kind)
            .field("to", &self.to)
            .field("referrer", &self.referrer)
            .finish_non_exhaustive()
    }
}

/// Mail delivery abstraction.
pub trait MailSender: Send + Sync {
    /// Deliver a message or return an error; the enclosing operation rolls back on error.
    fn send(&self, message: &MailMessage) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct LogMailSender;

impl MailSender for LogMailSender {
    fn send(&self, message: &MailMessage) -> Result<()> {
        info!(
            kind = message.kind.as_str(),
            to = %message.to,
            referrer = ?message.referrer,
            "mail send stub"
        );
        Ok(())
    }
}

/// Result of a mail-backed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// A send happened within the configured limit; nothing was sent.
    Throttled,
    /// Mail is disabled.
    Skipped,
}
