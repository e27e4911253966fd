use thiserror::Error as ThisError;

use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification so callers can branch without matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Policy,
    Conflict,
    RateLimited,
    Infrastructure,
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed input; nothing was changed.
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    /// The actor or subject is not allowed to do this.
    #[error("{0}")]
    Policy(String),

    #[error("{0}")]
    Conflict(String),

    /// Resend throttled; retry later.
    #[error("rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Policy(_) => ErrorKind::Policy,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }

    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn policy(message: impl Into<String>) -> Self {
        Self::Policy(message.into())
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound("record"),
            StoreError::UniqueViolation(constraint) => {
                Self::Conflict(format!("duplicate value ({constraint})"))
            }
            other => Self::Infrastructure(anyhow::Error::new(other).context("storage failure")),
        }
    }
}
