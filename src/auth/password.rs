use bcrypt::{hash, verify};

use super::service::AuthError;

pub fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    hash(password, cost)
        .map_err(|e| AuthError::Internal(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, hashed_password: &str) -> Result<bool, AuthError> {
    verify(password, hashed_password)
        .map_err(|e| AuthError::Internal(format!("Failed to verify password: {}", e)))
}

/// Hashes on the blocking pool; bcrypt is deliberately slow and would stall the worker.
pub async fn hash_password_blocking(password: String, cost: u32) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || hash_password(&password, cost))
        .await
        .map_err(|e| AuthError::Internal(format!("Password hashing task failed: {}", e)))?
}

pub async fn verify_password_blocking(
    password: String,
    hashed_password: String,
) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hashed_password))
        .await
        .map_err(|e| AuthError::Internal(format!("Password verification task failed: {}", e)))?
}
