//! Persistence ports for identities and refresh tokens.
//!
//! Stores hold no authentication logic: they never compare passwords or verify
//! signatures. The one piece of logic they own is atomicity: email uniqueness on create,
//! compare-and-set on password changes and check-and-invalidate on refresh rotation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NewIdentity, RefreshRecord, RotateOutcome, UserIdentity};

pub use memory::{InMemoryCredentialStore, InMemoryRefreshTokenStore};
pub use postgres::{run_migrations, PgCredentialStore, PgRefreshTokenStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Email already registered")]
    DuplicateEmail,
    #[error("Record not found")]
    NotFound,
    /// The backing store could not be reached or failed mid-operation. Retryable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> StoreError {
        match error {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                StoreError::DuplicateEmail
            }
            _ => StoreError::Unavailable(error.to_string()),
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateEmail`] if the normalized email is taken.
    async fn create_identity(
        &self,
        identity: NewIdentity,
        now: DateTime<Utc>,
    ) -> Result<UserIdentity, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<UserIdentity>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserIdentity>, StoreError>;
    async fn mark_verified(&self, id: Uuid) -> Result<(), StoreError>;
    /// Replaces the password hash of an active identity and sets `password_changed_at`
    /// to `changed_at`, but only while `password_changed_at` still equals
    /// `expected_changed_at`. Returns `false` when nothing was written: the identity is
    /// missing, deactivated, or its password changed in the meantime.
    async fn update_password_hash(
        &self,
        id: Uuid,
        new_hash: String,
        changed_at: DateTime<Utc>,
        expected_changed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Idempotent; the first deactivation timestamp wins.
    async fn deactivate(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: RefreshRecord) -> Result<(), StoreError>;

    /// Marks `presented` used and inserts `replacement` as one atomic step.
    ///
    /// The replacement is only stored when the outcome is [`RotateOutcome::Rotated`].
    /// Two concurrent calls for the same `presented` id observe exactly one `Rotated`.
    async fn rotate(
        &self,
        presented: Uuid,
        replacement: RefreshRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError>;

    /// Revokes every token of a session. Unknown or already revoked sessions are a no-op.
    async fn revoke_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Whether the session still has a live refresh token at `now`.
    async fn session_active(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Revokes every live token of a user, returning how many were revoked.
    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Deletes records that expired at or before `before`, returning how many went.
    /// An expired refresh token is rejected on its `exp` claim before the store is
    /// consulted, so its record carries no further information.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
