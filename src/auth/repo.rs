use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, User};

/// Outcome of a failed credential-store operation.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// A unique constraint (username or email) was violated.
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return RepoError::Conflict(db.constraint().unwrap_or("unique").to_string());
            }
        }
        RepoError::Unknown(e.into())
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, new: NewUser<'_>) -> Result<User, RepoError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepoError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError>;
    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), RepoError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<User>, RepoError> {
        let sql = format!(
            "SELECT id, username, email, password_hash, created_at, updated_at \
             FROM users WHERE {column} = $1"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, new: NewUser<'_>) -> Result<User, RepoError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, email, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, username, email, password_hash, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.username)
        .bind(new.email)
        .bind(new.password_hash)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepoError> {
        self.find_one("username", username).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        self.find_one("email", email).await
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
