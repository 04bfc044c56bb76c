use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an identity. Password changes do not move it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// Registered but the email address has not been confirmed yet.
    Registered,
    /// Email ownership confirmed.
    Verified,
    /// Terminal. The row is kept so contacts owned by the user stay referentially intact.
    Deactivated,
}

/// A user identity as persisted by the credential store.
///
/// Not `Serialize` on purpose: it carries the password hash. Use [`UserResponse`] on the wire.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UserIdentity {
    pub id: Uuid,
    pub username: String,
    /// Normalized (trimmed, lowercased) email address.
    pub email: String,
    pub password_hash: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub password_changed_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl UserIdentity {
    pub fn state(&self) -> AccountState {
        if self.deactivated_at.is_some() {
            AccountState::Deactivated
        } else if self.verified {
            AccountState::Verified
        } else {
            AccountState::Registered
        }
    }

    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

/// Input for creating an identity. The password is already hashed.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

impl NewIdentity {
    /// Builds the identity record a store should persist, stamping id and timestamps.
    pub fn into_identity(self, now: DateTime<Utc>) -> UserIdentity {
        UserIdentity {
            id: Uuid::new_v4(),
            username: self.username,
            email: normalize_email(&self.email),
            password_hash: self.password_hash,
            verified: false,
            created_at: now,
            password_changed_at: now,
            deactivated_at: None,
        }
    }
}

/// Public view of a [`UserIdentity`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub verified: bool,
    pub state: AccountState,
    pub created_at: DateTime<Utc>,
}

impl From<&UserIdentity> for UserResponse {
    fn from(user: &UserIdentity) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            verified: user.verified,
            state: user.state(),
            created_at: user.created_at,
        }
    }
}

/// Canonical form used for uniqueness and lookups.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
