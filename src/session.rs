//! Server-side sessions.
//!
//! Sessions are driven by `tower-sessions`; their records live in the shared
//! [`KvStore`] under `sess:<id>` until the record's expiry date.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use time::OffsetDateTime;
use tower_sessions::{
    cookie::{Key, SameSite},
    session::{Id, Record},
    session_store, Expiry, Session, SessionStore,
};
use uuid::Uuid;

use crate::{config::SessionConfig, storage::KvStore};

/// Session payload key holding the authenticated user's id.
pub const USER_ID_KEY: &str = "userId";

const SESSION_PREFIX: &str = "sess:";

#[derive(Clone)]
pub struct KvSessionStore {
    kv: Arc<dyn KvStore>,
}

impl KvSessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

impl fmt::Debug for KvSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvSessionStore").finish_non_exhaustive()
    }
}

fn session_key(id: &Id) -> String {
    format!("{SESSION_PREFIX}{id}")
}

fn backend<E: fmt::Display>(e: E) -> session_store::Error {
    session_store::Error::Backend(e.to_string())
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        while self
            .kv
            .get(&session_key(&record.id))
            .await
            .map_err(backend)?
            .is_some()
        {
            record.id = Id::default();
        }
        self.save(record).await
    }

    async fn save(&self, record: &Record) -> session_store::Result<()> {
        let encoded = serde_json::to_string(record)
            .map_err(|e| session_store::Error::Encode(e.to_string()))?;
        let ttl = record.expiry_date - OffsetDateTime::now_utc();
        self.kv
            .set(&session_key(&record.id), &encoded, ttl)
            .await
            .map_err(backend)
    }

    async fn load(&self, id: &Id) -> session_store::Result<Option<Record>> {
        let Some(raw) = self.kv.get(&session_key(id)).await.map_err(backend)? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw)
            .map_err(|e| session_store::Error::Decode(e.to_string()))?;
        Ok(Some(record))
    }

    async fn delete(&self, id: &Id) -> session_store::Result<()> {
        self.kv.delete(&session_key(id)).await.map_err(backend)
    }
}

/// Cookie policy applied by the session layer.
pub struct CookiePolicy {
    pub name: String,
    pub secure: bool,
    pub same_site: SameSite,
    pub expiry: Expiry,
    pub key: Key,
}

impl CookiePolicy {
    pub fn from_config(cfg: &SessionConfig) -> anyhow::Result<Self> {
        let key = Key::try_from(cfg.secret.as_bytes())
            .map_err(|_| anyhow::anyhow!("SESSION_SECRET must be at least 64 bytes"))?;
        Ok(Self {
            name: cfg.cookie_name.clone(),
            secure: cfg.secure,
            same_site: SameSite::Lax,
            expiry: Expiry::OnInactivity(time::Duration::days(cfg.max_age_days)),
            key,
        })
    }
}

/// Bind the session to `user_id`. The existing session id is kept.
pub async fn sign_in(session: &Session, user_id: Uuid) -> anyhow::Result<()> {
    session.insert(USER_ID_KEY, user_id).await?;
    Ok(())
}

pub async fn current_user_id(session: &Session) -> anyhow::Result<Option<Uuid>> {
    Ok(session.get::<Uuid>(USER_ID_KEY).await?)
}

#[cfg(test)]
pub(crate) fn detached_session(kv: Arc<dyn KvStore>) -> Session {
    Session::new(None, Arc::new(KvSessionStore::new(kv)), None)
}
