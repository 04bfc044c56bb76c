//! Account and session orchestration.
//!
//! [`AuthService`] is framework independent: route handlers translate HTTP into calls
//! here, and everything below it (stores, token service, notifier) is injected.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::password::{hash_password, hash_password_blocking, verify_password_blocking};
use super::token::{TokenError, TokenService};
use crate::models::{normalize_email, NewIdentity, TokenPair, TokenScope, UserIdentity};
use crate::notify::Notifier;
use crate::store::{CredentialStore, StoreError};

/// Every way an auth operation can fail.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email already registered")]
    DuplicateEmail,
    /// Unknown email, wrong password and deactivated account all look like this.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Email not confirmed")]
    Unverified,
    #[error("Token expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Refresh token already used")]
    AlreadyUsed,
    #[error("Not found")]
    NotFound,
    /// Storage is down; the caller may retry.
    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthError {
    fn from(error: StoreError) -> AuthError {
        match error {
            StoreError::DuplicateEmail => AuthError::DuplicateEmail,
            StoreError::NotFound => AuthError::NotFound,
            StoreError::Unavailable(msg) => AuthError::Unavailable(msg),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(error: TokenError) -> AuthError {
        match error {
            TokenError::Expired => AuthError::Expired,
            TokenError::Invalid => AuthError::Invalid,
            TokenError::AlreadyUsed => AuthError::AlreadyUsed,
            TokenError::Signing(msg) => AuthError::Internal(msg),
            TokenError::Store(e) => e.into(),
        }
    }
}

/// Behavioural knobs, taken from configuration at startup.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    /// Refuse login until the email address is confirmed.
    pub require_verification: bool,
    pub bcrypt_cost: u32,
    /// Base URL used to build the links in outgoing emails.
    pub public_base_url: String,
    /// Presenting an already-used refresh token revokes every session of its owner.
    pub revoke_all_on_reuse: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            require_verification: true,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            public_base_url: "http://127.0.0.1:8080".to_string(),
            revoke_all_on_reuse: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    AlreadyVerified,
}

pub struct AuthService {
    credentials: Arc<dyn CredentialStore>,
    tokens: Arc<TokenService>,
    notifier: Arc<dyn Notifier>,
    policy: AuthPolicy,
    // Compared against on unknown emails so a miss costs as much as a wrong password.
    dummy_hash: String,
}

impl AuthService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        tokens: Arc<TokenService>,
        notifier: Arc<dyn Notifier>,
        policy: AuthPolicy,
    ) -> Result<Self, AuthError> {
        let dummy_hash = hash_password("contacts-auth timing guard", policy.bcrypt_cost)?;
        Ok(Self {
            credentials,
            tokens,
            notifier,
            policy,
            dummy_hash,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    fn link(&self, path: &str) -> String {
        format!("{}{}", self.policy.public_base_url.trim_end_matches('/'), path)
    }

    /// Creates an unverified identity and sends the verification email.
    ///
    /// The email is sent in the background; a delivery failure is logged and does not
    /// undo the registration.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<UserIdentity, AuthError> {
        let email = normalize_email(email);
        if self.credentials.find_by_email(&email).await?.is_some() {
            return Err(AuthError::DuplicateEmail);
        }

        let password_hash =
            hash_password_blocking(password.to_string(), self.policy.bcrypt_cost).await?;
        // The store re-checks uniqueness atomically; the lookup above only avoids
        // hashing for an obvious duplicate.
        let user = self
            .credentials
            .create_identity(
                NewIdentity {
                    username: username.to_string(),
                    email,
                    password_hash,
                },
                self.tokens.now(),
            )
            .await?;

        log::info!("Registered user {} ({})", user.id, user.email);
        self.send_verification(&user);
        Ok(user)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let Some(user) = self.credentials.find_by_email(email).await? else {
            let _ = verify_password_blocking(password.to_string(), self.dummy_hash.clone()).await;
            log::debug!("Login rejected: unknown email");
            return Err(AuthError::InvalidCredentials);
        };

        let matches =
            verify_password_blocking(password.to_string(), user.password_hash.clone()).await?;
        if !matches || !user.is_active() {
            log::debug!("Login rejected for user {}", user.id);
            return Err(AuthError::InvalidCredentials);
        }
        if self.policy.require_verification && !user.verified {
            return Err(AuthError::Unverified);
        }

        let (access, refresh) = self.tokens.issue_pair(user.id).await?;
        log::info!("User {} logged in", user.id);
        Ok(TokenPair::bearer(access, refresh))
    }

    /// Exchanges a refresh token for a new pair. The presented token stops working.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let (access, refresh) = match self.tokens.rotate_refresh_token(refresh_token).await {
            Ok(pair) => pair,
            Err(failure) => {
                if let Some(user_id) = failure.reused_by {
                    self.handle_reuse(user_id).await;
                }
                return Err(failure.error.into());
            }
        };

        let active = self
            .credentials
            .find_by_id(access.user_id)
            .await?
            .map_or(false, |user| user.is_active());
        if !active {
            self.tokens.revoke_all_for_user(access.user_id).await?;
            return Err(AuthError::Invalid);
        }
        Ok(TokenPair::bearer(access, refresh))
    }

    async fn handle_reuse(&self, user_id: Uuid) {
        if !self.policy.revoke_all_on_reuse {
            log::warn!("Refresh token reuse for user {}", user_id);
            return;
        }
        match self.tokens.revoke_all_for_user(user_id).await {
            Ok(count) => log::warn!(
                "Refresh token reuse for user {}; revoked {} live session(s)",
                user_id,
                count
            ),
            Err(e) => log::error!(
                "Refresh token reuse for user {} but revoking sessions failed: {}",
                user_id,
                e
            ),
        }
    }

    /// Ends the session of a refresh token, including the access tokens issued in it.
    /// Calling it again with the same token is a no-op.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let user_id = self.tokens.revoke_refresh_token(refresh_token).await?;
        log::info!("User {} logged out", user_id);
        Ok(())
    }

    /// Returns the user id an access token belongs to while its session is live.
    pub async fn authenticate(&self, access_token: &str) -> Result<Uuid, AuthError> {
        Ok(self.tokens.validate_access_token(access_token).await?)
    }

    pub async fn verify_email(&self, token: &str) -> Result<VerificationOutcome, AuthError> {
        let claims = self
            .tokens
            .decode_email_token(token, TokenScope::EmailVerification)?;
        let user = self
            .credentials
            .find_by_id(claims.sub)
            .await?
            .filter(UserIdentity::is_active)
            .ok_or(AuthError::NotFound)?;

        if user.verified {
            return Ok(VerificationOutcome::AlreadyVerified);
        }
        self.credentials.mark_verified(user.id).await?;
        log::info!("User {} confirmed their email", user.id);
        Ok(VerificationOutcome::Verified)
    }

    /// Sends a fresh verification email if the account exists and still needs one.
    /// The outcome is not reported so callers cannot learn which addresses are registered.
    pub async fn resend_verification(&self, email: &str) -> Result<(), AuthError> {
        if let Some(user) = self.credentials.find_by_email(email).await? {
            if user.is_active() && !user.verified {
                self.send_verification(&user);
            }
        }
        Ok(())
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let Some(user) = self
            .credentials
            .find_by_email(email)
            .await?
            .filter(UserIdentity::is_active)
        else {
            return Ok(());
        };

        let token = self
            .tokens
            .issue_password_reset_token(user.id, user.password_changed_at)?;
        let link = self.link(&format!("/api/auth/reset_password?token={}", token));
        let notifier = Arc::clone(&self.notifier);
        let email = user.email.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_password_reset_email(&email, &link).await {
                log::warn!("Failed to send password reset email to {}: {}", email, e);
            }
        });
        Ok(())
    }

    /// Sets a new password from a reset link. A link only works once: it is bound to the
    /// password stamp it was issued against, and the first password change of any kind
    /// moves that stamp.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        let claims = self
            .tokens
            .decode_email_token(token, TokenScope::PasswordReset)?;
        let user = self
            .credentials
            .find_by_id(claims.sub)
            .await?
            .filter(UserIdentity::is_active)
            .ok_or(AuthError::Invalid)?;
        if claims.pwd != Some(user.password_changed_at.timestamp_micros()) {
            return Err(AuthError::Invalid);
        }

        self.set_password(&user, new_password).await?;
        log::info!("User {} reset their password", user.id);
        Ok(())
    }

    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self.current_user(user_id).await?;
        let matches =
            verify_password_blocking(current_password.to_string(), user.password_hash.clone())
                .await?;
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }

        self.set_password(&user, new_password).await?;
        log::info!("User {} changed their password", user.id);
        Ok(())
    }

    /// Writes the new hash only if the password is still the one `user` was read with.
    /// Of two concurrent changes starting from the same state, the second gets `Invalid`.
    async fn set_password(
        &self,
        user: &UserIdentity,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let hash = hash_password_blocking(new_password.to_string(), self.policy.bcrypt_cost).await?;
        let changed_at = next_password_stamp(self.tokens.now(), user.password_changed_at);
        let updated = self
            .credentials
            .update_password_hash(user.id, hash, changed_at, user.password_changed_at)
            .await?;
        if !updated {
            log::debug!("Password update for user {} lost to a concurrent change", user.id);
            return Err(AuthError::Invalid);
        }
        self.tokens.revoke_all_for_user(user.id).await?;
        Ok(())
    }

    /// Moves the account to its terminal state and ends every session.
    pub async fn deactivate(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.credentials
            .deactivate(user_id, self.tokens.now())
            .await?;
        let revoked = self.tokens.revoke_all_for_user(user_id).await?;
        log::info!("User {} deactivated; {} session(s) revoked", user_id, revoked);
        Ok(())
    }

    /// Looks up an active identity.
    pub async fn current_user(&self, user_id: Uuid) -> Result<UserIdentity, AuthError> {
        self.credentials
            .find_by_id(user_id)
            .await?
            .filter(UserIdentity::is_active)
            .ok_or(AuthError::NotFound)
    }

    pub async fn health_check(&self) -> Result<(), AuthError> {
        Ok(self.credentials.ping().await?)
    }

    fn send_verification(&self, user: &UserIdentity) {
        let token = match self
            .tokens
            .issue_email_token(user.id, TokenScope::EmailVerification)
        {
            Ok(token) => token,
            Err(e) => {
                log::warn!("Could not issue verification token for {}: {}", user.id, e);
                return;
            }
        };
        let link = self.link(&format!("/api/auth/confirmed_email/{}", token));
        let notifier = Arc::clone(&self.notifier);
        let (email, username) = (user.email.clone(), user.username.clone());
        tokio::spawn(async move {
            if let Err(e) = notifier
                .send_verification_email(&email, &username, &link)
                .await
            {
                log::warn!("Failed to send verification email to {}: {}", email, e);
            }
        });
    }
}

/// The next `password_changed_at`: microsecond precision, as Postgres stores it, and
/// strictly after `previous` even when the clock has not moved.
fn next_password_stamp(now: DateTime<Utc>, previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    if now > previous {
        now
    } else {
        previous.trunc_subsecs(6) + Duration::microseconds(1)
    }
}
