use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What a signed token is allowed to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    AccessToken,
    RefreshToken,
    EmailVerification,
    PasswordReset,
}

/// A short-lived bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub user_id: Uuid,
    /// The login session this token was issued for. Ending the session ends the token.
    pub session_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A single-use credential for obtaining a new token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub token: String,
    pub jti: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Server-side state of a refresh token, keyed by the token's `jti`.
///
/// Every token handed out by one login and its rotations shares a `session_id`. The
/// session is live while one of its records is neither used, revoked nor expired.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefreshRecord {
    pub jti: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<Uuid>,
}

impl RefreshRecord {
    pub fn for_token(token: &RefreshToken) -> Self {
        Self {
            jti: token.jti,
            session_id: token.session_id,
            user_id: token.user_id,
            issued_at: token.issued_at,
            expires_at: token.expires_at,
            used_at: None,
            revoked_at: None,
            replaced_by: None,
        }
    }

    /// Whether this record keeps its session alive at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && self.revoked_at.is_none() && self.expires_at > now
    }

    /// Classifies this record for a rotation attempt at `now`.
    ///
    /// Revocation is checked before use so a logged-out token never reports `AlreadyUsed`.
    pub fn rotation_status(&self, now: DateTime<Utc>) -> RotateOutcome {
        if self.revoked_at.is_some() {
            RotateOutcome::Revoked
        } else if self.used_at.is_some() {
            RotateOutcome::AlreadyUsed {
                user_id: self.user_id,
            }
        } else if self.expires_at <= now {
            RotateOutcome::Expired
        } else {
            RotateOutcome::Rotated {
                user_id: self.user_id,
            }
        }
    }
}

/// Result of an atomic check-and-invalidate on a presented refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The presented token was live; it is now used and the replacement is stored.
    Rotated { user_id: Uuid },
    /// No record with that `jti`.
    Unknown,
    /// The token was already exchanged once.
    AlreadyUsed { user_id: Uuid },
    /// The token was revoked by logout, password change or deactivation.
    Revoked,
    Expired,
}

/// Token pair returned by login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

impl TokenPair {
    pub fn bearer(access: AccessToken, refresh: RefreshToken) -> Self {
        Self {
            access_token: access.token,
            refresh_token: refresh.token,
            token_type: "bearer".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(now: DateTime<Utc>) -> RefreshRecord {
        RefreshRecord {
            jti: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            issued_at: now,
            expires_at: now + Duration::days(7),
            used_at: None,
            revoked_at: None,
            replaced_by: None,
        }
    }

    #[test]
    fn test_rotation_status() {
        let now = Utc::now();
        let mut rec = record(now);
        assert_eq!(
            rec.rotation_status(now),
            RotateOutcome::Rotated {
                user_id: rec.user_id
            }
        );
        assert_eq!(
            rec.rotation_status(now + Duration::days(7)),
            RotateOutcome::Expired
        );

        assert!(rec.is_live(now));
        assert!(!rec.is_live(now + Duration::days(7)));

        rec.used_at = Some(now);
        assert!(!rec.is_live(now));
        assert_eq!(
            rec.rotation_status(now),
            RotateOutcome::AlreadyUsed {
                user_id: rec.user_id
            }
        );

        rec.revoked_at = Some(now);
        assert_eq!(rec.rotation_status(now), RotateOutcome::Revoked);
    }

    #[test]
    fn test_scope_wire_names() {
        assert_eq!(
            serde_json::to_value(TokenScope::RefreshToken).unwrap(),
            "refresh_token"
        );
        assert_eq!(
            serde_json::to_value(TokenScope::EmailVerification).unwrap(),
            "email_verification"
        );
    }
}
