//! Single-use password-reset tokens kept in the key-value store.

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::storage::{KvStore, StoreError};

pub const FORGET_PASSWORD_PREFIX: &str = "forget-password:";
pub const RESET_TOKEN_TTL: Duration = Duration::days(3);
const TOKEN_LEN: usize = 43;

fn key(token: &str) -> String {
    format!("{FORGET_PASSWORD_PREFIX}{token}")
}

pub fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Store a fresh token for `user_id` and return it.
pub async fn issue(kv: &dyn KvStore, user_id: Uuid) -> Result<String, StoreError> {
    let token = generate_token();
    kv.set(&key(&token), &user_id.to_string(), RESET_TOKEN_TTL)
        .await?;
    Ok(token)
}

/// The user a live token belongs to. Unknown, expired and garbled entries all
/// resolve to `None`.
pub async fn resolve(kv: &dyn KvStore, token: &str) -> Result<Option<Uuid>, StoreError> {
    let Some(raw) = kv.get(&key(token)).await? else {
        return Ok(None);
    };
    match raw.parse::<Uuid>() {
        Ok(id) => Ok(Some(id)),
        Err(e) => {
            warn!(error = %e, "reset token holds a malformed user id");
            Ok(None)
        }
    }
}

pub async fn revoke(kv: &dyn KvStore, token: &str) -> Result<(), StoreError> {
    kv.delete(&key(token)).await
}
