use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{CredentialStore, RefreshTokenStore, StoreError};
use crate::models::{normalize_email, NewIdentity, RefreshRecord, RotateOutcome, UserIdentity};

const USER_COLUMNS: &str =
    "id, username, email, password_hash, verified, created_at, password_changed_at, deactivated_at";

/// Applies the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Migration failed: {}", e)))
}

#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn create_identity(
        &self,
        identity: NewIdentity,
        now: DateTime<Utc>,
    ) -> Result<UserIdentity, StoreError> {
        let identity = identity.into_identity(now);
        // Uniqueness is enforced by the users_email_key index; a violation maps to
        // StoreError::DuplicateEmail through From<sqlx::Error>.
        let user = sqlx::query_as::<_, UserIdentity>(&format!(
            "INSERT INTO users (id, username, email, password_hash, verified, created_at, password_changed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(identity.id)
        .bind(&identity.username)
        .bind(&identity.email)
        .bind(&identity.password_hash)
        .bind(identity.verified)
        .bind(identity.created_at)
        .bind(identity.password_changed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserIdentity>, StoreError> {
        let user = sqlx::query_as::<_, UserIdentity>(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserIdentity>, StoreError> {
        let user = sqlx::query_as::<_, UserIdentity>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn mark_verified(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET verified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        new_hash: String,
        changed_at: DateTime<Utc>,
        expected_changed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $1, password_changed_at = $2
             WHERE id = $3 AND password_changed_at = $4 AND deactivated_at IS NULL",
        )
        .bind(new_hash)
        .bind(changed_at)
        .bind(id)
        .bind(expected_changed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn deactivate(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET deactivated_at = COALESCE(deactivated_at, $1) WHERE id = $2",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, record: RefreshRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (jti, session_id, user_id, issued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.jti)
        .bind(record.session_id)
        .bind(record.user_id)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rotate(
        &self,
        presented: Uuid,
        replacement: RefreshRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // A concurrent rotation of the same row blocks on the row lock and then
        // re-evaluates the predicate, so only one caller sees a returned row.
        let consumed = sqlx::query_as::<_, (Uuid,)>(
            "UPDATE refresh_tokens
             SET used_at = $2, replaced_by = $3
             WHERE jti = $1 AND used_at IS NULL AND revoked_at IS NULL AND expires_at > $2
             RETURNING user_id",
        )
        .bind(presented)
        .bind(now)
        .bind(replacement.jti)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((user_id,)) = consumed {
            sqlx::query(
                "INSERT INTO refresh_tokens (jti, session_id, user_id, issued_at, expires_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(replacement.jti)
            .bind(replacement.session_id)
            .bind(replacement.user_id)
            .bind(replacement.issued_at)
            .bind(replacement.expires_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(RotateOutcome::Rotated { user_id });
        }

        let existing = sqlx::query_as::<_, RefreshRecord>(
            "SELECT jti, session_id, user_id, issued_at, expires_at, used_at, revoked_at,
                    replaced_by
             FROM refresh_tokens WHERE jti = $1",
        )
        .bind(presented)
        .fetch_optional(&mut *tx)
        .await?;
        tx.rollback().await?;

        Ok(match existing {
            Some(record) => match record.rotation_status(now) {
                // The row was live when re-read but the update did not match: lost a race.
                RotateOutcome::Rotated { user_id } => RotateOutcome::AlreadyUsed { user_id },
                other => other,
            },
            None => RotateOutcome::Unknown,
        })
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $1
             WHERE session_id = $2 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session_active(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let active = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                 SELECT 1 FROM refresh_tokens
                 WHERE session_id = $1 AND used_at IS NULL AND revoked_at IS NULL
                   AND expires_at > $2
             )",
        )
        .bind(session_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $1
             WHERE user_id = $2 AND revoked_at IS NULL AND used_at IS NULL",
        )
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
