//! Signed bearer tokens and their refresh pairing.

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use super::{
    config::JwtConfig,
    error::{Error, Result},
    tokens,
};
use crate::models::{AccessToken, BearerToken, Token, User, INFINITE_USE};
use crate::store::Transaction;

/// Snapshot of the user's public claims at issue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aud: Vec<String>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// identity provider
    pub pvd: String,
    /// admin
    pub adm: bool,
    /// restricted
    pub rst: bool,
    /// confirmed
    pub cnf: bool,
    /// verified
    pub vrd: bool,
    #[serde(default)]
    pub dat: serde_json::Value,
}

impl UserClaims {
    /// Fails with a validation error when the configured expiration overflows.
    pub fn new(config: &JwtConfig, user: &User, now: DateTime<Utc>) -> Result<Self> {
        let exp = now
            .checked_add_signed(config.expiration())
            .ok_or_else(|| Error::validation("expiration", "bearer expiration out of range"))?;
        Ok(Self {
            sub: user.id.to_string(),
            aud: config.audience().to_vec(),
            iss: config.issuer().to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            pvd: user.provider.clone(),
            adm: user.is_admin(),
            rst: user.is_restricted(),
            cnf: user.is_confirmed(),
            vrd: user.is_verified(),
            dat: user.data.clone(),
        })
    }

    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| Error::validation("token", "invalid subject"))
    }
}

pub fn sign(config: &JwtConfig, claims: &UserClaims) -> Result<String> {
    let key = EncodingKey::from_secret(config.secret().expose_secret().as_bytes());
    encode(&Header::new(config.algorithm()), claims, &key)
        .map_err(|e| Error::Infrastructure(anyhow!("sign bearer token: {e}")))
}

/// Decode and validate signature, expiry, issuer and audience.
pub fn verify(config: &JwtConfig, token: &str) -> Result<UserClaims> {
    let key = DecodingKey::from_secret(config.secret().expose_secret().as_bytes());
    let mut validation = Validation::new(config.algorithm());
    validation.set_issuer(&[config.issuer()]);
    if config.audience().is_empty() {
        validation.validate_aud = false;
    } else {
        validation.set_audience(config.audience());
    }

    decode::<UserClaims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|_| Error::NotFound("bearer token"))
}

/// Issue a bearer token and the owner's refresh token.
pub async fn grant_bearer_token(
    tx: &mut dyn Transaction,
    config: &JwtConfig,
    user: &User,
) -> Result<BearerToken> {
    refresh_bearer_token(tx, config, user, None).await
}

/// Issue a bearer token; with `presented`, rotate that refresh token instead
/// of reusing the live one.
#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn refresh_bearer_token(
    tx: &mut dyn Transaction,
    config: &JwtConfig,
    user: &User,
    presented: Option<&str>,
) -> Result<BearerToken> {
    if !user.is_active() && !user.is_restricted() {
        return Err(Error::policy(format!("inactive user: {}", user.id)));
    }

    let now = Utc::now();
    let claims = UserClaims::new(config, user, now)?;
    let signed = sign(config, &claims)?;

    let mut access = AccessToken::new(signed, INFINITE_USE, config.expiration()).owned_by(user.id);
    access.created_at = Some(now);
    access.expired_at = Utc.timestamp_opt(claims.exp, 0).single();

    let refresh = match presented {
        None => tokens::grant_refresh_token(tx, user.id).await?,
        Some(secret) => tokens::swap_refresh_token(tx, user.id, secret).await?,
    };
    if refresh.issued_to() != access.user_id {
        return Err(Error::policy("mismatched user id"));
    }

    Ok(BearerToken { access, refresh })
}
