//! Password hashing and verification (Argon2id).

use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use secrecy::{ExposeSecret, SecretString};

use super::error::{Error, Result};

/// Argon2id with the RFC 9106 second recommended parameter set.
fn argon2() -> Result<Argon2<'static>> {
    let params = Params::new(19_456, 2, 1, None)
        .map_err(|e| Error::Infrastructure(anyhow!("create argon2 params: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash on the blocking pool.
pub async fn hash(plaintext: &str) -> Result<String> {
    let plaintext = SecretString::from(plaintext);
    blocking(move || hash_blocking(plaintext.expose_secret())).await
}

/// Verify on the blocking pool. Parameters are read from the stored hash.
pub async fn verify(hash: &str, plaintext: &str) -> Result<bool> {
    let hash = hash.to_owned();
    let plaintext = SecretString::from(plaintext);
    blocking(move || verify_blocking(&hash, plaintext.expose_secret())).await
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Infrastructure(anyhow!("password task failed: {e}")))?
}

fn hash_blocking(plaintext: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2()?
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| Error::Infrastructure(anyhow!("hash password: {e}")))?;
    Ok(hash.to_string())
}

fn verify_blocking(hash: &str, plaintext: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::Infrastructure(anyhow!("parse password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_and_verify() -> Result<()> {
        let hashed = hash("correct horse").await?;
        assert!(hashed.starts_with("$argon2id$"));
        assert!(verify(&hashed, "correct horse").await?);
        assert!(!verify(&hashed, "battery staple").await?);
        Ok(())
    }

    #[tokio::test]
    async fn salts_differ() -> Result<()> {
        assert_ne!(hash("same").await?, hash("same").await?);
        Ok(())
    }

    #[tokio::test]
    async fn garbage_hash_is_an_error() {
        assert!(verify("not-a-hash", "pw").await.is_err());
    }
}
