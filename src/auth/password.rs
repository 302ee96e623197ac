//! Argon2id credentials. Hashing is memory-hard, so both directions run on the
//! blocking pool instead of the request's worker thread.

use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tokio::task;

/// Salted Argon2id PHC string for `plain`, default cost parameters.
pub async fn hash_password(plain: &str) -> anyhow::Result<String> {
    let plain = plain.to_owned();
    task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(plain.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| anyhow::anyhow!("argon2 hashing failed: {e}"))
    })
    .await
    .context("password hashing task panicked")?
}

/// `Ok(false)` on mismatch; `Err` only when the stored hash is unreadable.
pub async fn verify_password(plain: &str, stored: &str) -> anyhow::Result<bool> {
    let (plain, stored) = (plain.to_owned(), stored.to_owned());
    task::spawn_blocking(move || -> anyhow::Result<bool> {
        let parsed = PasswordHash::new(&stored)
            .map_err(|e| anyhow::anyhow!("stored password hash is malformed: {e}"))?;
        Ok(Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .context("password verification task panicked")?
}
