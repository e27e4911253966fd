pub mod audit;
pub mod token;
pub mod user;

pub use self::audit::{AuditAction, AuditEntry, AuditKind};
pub use self::token::{
    expiry_after, AccessToken, AuthToken, BearerToken, Class, CodeFormat, ConfirmToken,
    RefreshToken, SignupCode, Stored, Token, TokenRecord, Usage, DEBUG_PIN, INFINITE_USE,
    SINGLE_USE,
};
pub use self::user::{Role, Status, User, SUPER_ADMIN_ID, SYSTEM_ID};
