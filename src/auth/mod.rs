pub mod extractors;
pub mod middleware;
pub mod password;
pub mod service;
pub mod token;

use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

// Re-export necessary items
pub use extractors::AuthenticatedUserId;
pub use middleware::AuthMiddleware;
pub use password::{hash_password, verify_password};
pub use service::{AuthError, AuthPolicy, AuthService, VerificationOutcome};
pub use token::{Claims, KeyRing, TokenError, TokenService, TokenTtls};

lazy_static! {
    // Regex for username validation: alphanumeric, underscores, hyphens
    static ref USERNAME_REGEX: regex::Regex = regex::Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// bcrypt only looks at the first 72 bytes of a password.
const BCRYPT_MAX_BYTES: usize = 72;
const MIN_PASSWORD_CHARS: usize = 6;

/// Emails are trimmed before validation so that surrounding whitespace reaches the
/// duplicate check instead of failing the format check.
fn trimmed<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    Ok(value.trim().to_string())
}

/// At least 6 characters and at most 72 bytes, so nothing is silently truncated by bcrypt.
fn validate_new_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_CHARS || password.len() > BCRYPT_MAX_BYTES {
        let mut error = ValidationError::new("password_length");
        error.message = Some("Password must be 6 characters to 72 bytes long".into());
        return Err(error);
    }
    Ok(())
}

/// Represents the payload for a user login request.
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    /// User's email address.
    /// Must be a valid email format.
    #[serde(deserialize_with = "trimmed")]
    #[validate(email)]
    pub email: String,
    /// User's password. Not length-checked here so that a wrong password of any length
    /// yields the same `401` as an unknown email.
    #[validate(length(min = 1))]
    pub password: String,
}

/// Represents the payload for a new user registration request.
#[derive(Debug, Deserialize, Validate)]
pub struct SignupRequest {
    /// Display name for the new account.
    /// Must be between 3 and 50 characters, alphanumeric, and can include underscores or hyphens.
    #[validate(
        length(min = 3, max = 50),
        regex(
            path = "USERNAME_REGEX",
            message = "Username must be alphanumeric, underscores, or hyphens"
        )
    )]
    pub username: String,
    /// Email address for the new account.
    /// Must be a valid email format.
    #[serde(deserialize_with = "trimmed")]
    #[validate(email)]
    pub email: String,
    /// Password for the new account.
    /// At least 6 characters and at most 72 bytes (bcrypt ignores anything longer).
    #[validate(custom = "validate_new_password")]
    pub password: String,
}

/// Body of the refresh and logout requests.
#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

/// Body of the "resend verification" and "forgot password" requests.
#[derive(Debug, Deserialize, Validate)]
pub struct EmailRequest {
    #[serde(deserialize_with = "trimmed")]
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(custom = "validate_new_password")]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1))]
    pub current_password: String,
    #[validate(custom = "validate_new_password")]
    pub new_password: String,
}

/// Plain acknowledgement body.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
