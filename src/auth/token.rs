use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{AccessToken, RefreshRecord, RefreshToken, RotateOutcome, TokenScope};
use crate::store::{RefreshTokenStore, StoreError};

/// Represents the claims encoded within every token this service signs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject of the token: the user's identifier.
    pub sub: Uuid,
    /// Unique token id. For refresh tokens this keys the stored record.
    pub jti: Uuid,
    /// Issued-at timestamp (seconds since epoch).
    pub iat: i64,
    /// Expiration timestamp (seconds since epoch).
    pub exp: i64,
    pub scope: TokenScope,
    /// Login session of an access or refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,
    /// On password reset tokens: the identity's `password_changed_at` in microseconds
    /// at issue time. The token only works while the two still match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwd: Option<i64>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Refresh token already used")]
    AlreadyUsed,
    #[error("Failed to sign token: {0}")]
    Signing(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifetimes of each token kind.
#[derive(Debug, Clone, Copy)]
pub struct TokenTtls {
    pub access: Duration,
    pub refresh: Duration,
    pub email_verification: Duration,
    pub password_reset: Duration,
}

impl Default for TokenTtls {
    fn default() -> Self {
        Self {
            access: Duration::minutes(15),
            refresh: Duration::days(7),
            email_verification: Duration::days(1),
            password_reset: Duration::hours(1),
        }
    }
}

impl TokenTtls {
    fn for_scope(&self, scope: TokenScope) -> Duration {
        match scope {
            TokenScope::AccessToken => self.access,
            TokenScope::RefreshToken => self.refresh,
            TokenScope::EmailVerification => self.email_verification,
            TokenScope::PasswordReset => self.password_reset,
        }
    }
}

#[derive(Clone)]
struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    fn new(algorithm: Algorithm, secret: &[u8]) -> Result<Self, TokenError> {
        let encoding = EncodingKey::from_secret(secret);
        Ok(Self {
            kid: key_id(algorithm, &encoding)?,
            encoding,
            decoding: DecodingKey::from_secret(secret),
        })
    }
}

/// Derives a stable key id from the key itself, so the same secret gets the same `kid`
/// across restarts without the id revealing anything about the secret.
fn key_id(algorithm: Algorithm, key: &EncodingKey) -> Result<String, TokenError> {
    let mac = jsonwebtoken::crypto::sign(b"contacts-auth/key-id", key, algorithm)
        .map_err(|e| TokenError::Signing(e.to_string()))?;
    Ok(mac.chars().take(12).collect())
}

/// The current signing key plus at most one previous key still accepted for validation.
///
/// Rotation makes a new secret current and demotes the old current key to previous;
/// the key that was previous before the rotation is dropped, and tokens carrying its
/// `kid` stop validating.
pub struct KeyRing {
    algorithm: Algorithm,
    current: SigningKey,
    previous: Option<SigningKey>,
}

impl KeyRing {
    pub fn new(
        algorithm: Algorithm,
        secret: &[u8],
        previous_secret: Option<&[u8]>,
    ) -> Result<Self, TokenError> {
        Ok(Self {
            algorithm,
            current: SigningKey::new(algorithm, secret)?,
            previous: previous_secret
                .map(|s| SigningKey::new(algorithm, s))
                .transpose()?,
        })
    }

    fn rotated(&self, new_secret: &[u8]) -> Result<Self, TokenError> {
        Ok(Self {
            algorithm: self.algorithm,
            current: SigningKey::new(self.algorithm, new_secret)?,
            previous: Some(self.current.clone()),
        })
    }

    fn decoding_key(&self, kid: Option<&str>) -> Option<&DecodingKey> {
        match kid {
            None => Some(&self.current.decoding),
            Some(kid) if kid == self.current.kid => Some(&self.current.decoding),
            Some(kid) => self
                .previous
                .as_ref()
                .filter(|key| key.kid == kid)
                .map(|key| &key.decoding),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn current_kid(&self) -> &str {
        &self.current.kid
    }
}

/// Issues, validates and rotates tokens.
///
/// Refresh tokens are JWTs whose `jti` has a record in the [`RefreshTokenStore`]; that
/// record is what makes them single use. Access tokens carry the session id of the
/// refresh token they were issued with and stop validating once that session ends.
/// Email tokens are stateless.
pub struct TokenService {
    keys: RwLock<Arc<KeyRing>>,
    refresh_store: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
    ttls: TokenTtls,
}

impl TokenService {
    pub fn new(
        keys: KeyRing,
        refresh_store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
        ttls: TokenTtls,
    ) -> Self {
        Self {
            keys: RwLock::new(Arc::new(keys)),
            refresh_store,
            clock,
            ttls,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn key_ring(&self) -> Arc<KeyRing> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes `new_secret` the signing key. Tokens signed with the key it replaces keep
    /// validating until they expire or until the next rotation.
    pub fn rotate_signing_key(&self, new_secret: &[u8]) -> Result<(), TokenError> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let rotated = keys.rotated(new_secret)?;
        log::info!(
            "Rotated token signing key: kid {} -> {}",
            keys.current_kid(),
            rotated.current_kid()
        );
        *keys = Arc::new(rotated);
        Ok(())
    }

    fn sign(
        &self,
        user_id: Uuid,
        scope: TokenScope,
        sid: Option<Uuid>,
        pwd: Option<i64>,
    ) -> Result<(String, Claims), TokenError> {
        let keys = self.key_ring();
        let issued_at = self.clock.now();
        let expires_at = issued_at + self.ttls.for_scope(scope);
        let claims = Claims {
            sub: user_id,
            jti: Uuid::new_v4(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            scope,
            sid,
            pwd,
        };

        let mut header = Header::new(keys.algorithm);
        header.kid = Some(keys.current.kid.clone());

        let token = encode(&header, &claims, &keys.current.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        Ok((token, claims))
    }

    /// Verifies signature and scope. Expiry is NOT checked here; callers decide whether
    /// an expired token is an error (validation) or acceptable (logout).
    fn decode_authentic(&self, token: &str, scope: TokenScope) -> Result<Claims, TokenError> {
        let keys = self.key_ring();
        let header = decode_header(token).map_err(|_| TokenError::Invalid)?;
        if header.alg != keys.algorithm {
            return Err(TokenError::Invalid);
        }
        let key = keys
            .decoding_key(header.kid.as_deref())
            .ok_or(TokenError::Invalid)?;

        let mut validation = Validation::new(keys.algorithm);
        validation.validate_exp = false;
        validation.leeway = 0;

        let claims = decode::<Claims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|_| TokenError::Invalid)?;
        if claims.scope != scope {
            return Err(TokenError::Invalid);
        }
        Ok(claims)
    }

    /// Like `decode_authentic` but a token at or past its `exp` is [`TokenError::Expired`].
    fn decode_live(&self, token: &str, scope: TokenScope) -> Result<Claims, TokenError> {
        let claims = self.decode_authentic(token, scope)?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<AccessToken, TokenError> {
        let (token, claims) = self.sign(user_id, TokenScope::AccessToken, Some(session_id), None)?;
        Ok(AccessToken {
            token,
            user_id,
            session_id,
            issued_at: timestamp(claims.iat),
            expires_at: timestamp(claims.exp),
        })
    }

    fn signed_refresh_token(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<RefreshToken, TokenError> {
        let (token, claims) =
            self.sign(user_id, TokenScope::RefreshToken, Some(session_id), None)?;
        Ok(RefreshToken {
            token,
            jti: claims.jti,
            session_id,
            user_id,
            issued_at: timestamp(claims.iat),
            expires_at: timestamp(claims.exp),
        })
    }

    /// Starts a new session: issues its first refresh token and persists the record.
    pub async fn issue_refresh_token(&self, user_id: Uuid) -> Result<RefreshToken, TokenError> {
        let refresh = self.signed_refresh_token(user_id, Uuid::new_v4())?;
        self.refresh_store
            .insert(RefreshRecord::for_token(&refresh))
            .await?;
        Ok(refresh)
    }

    pub async fn issue_pair(&self, user_id: Uuid) -> Result<(AccessToken, RefreshToken), TokenError> {
        let refresh = self.issue_refresh_token(user_id).await?;
        let access = self.issue_access_token(user_id, refresh.session_id)?;
        Ok((access, refresh))
    }

    /// Returns the user id an access token is bound to, provided its session is still
    /// live. Logout, password changes and deactivation all end sessions.
    pub async fn validate_access_token(&self, token: &str) -> Result<Uuid, TokenError> {
        let claims = self.decode_live(token, TokenScope::AccessToken)?;
        let session_id = claims.sid.ok_or(TokenError::Invalid)?;
        if !self
            .refresh_store
            .session_active(session_id, self.clock.now())
            .await?
        {
            return Err(TokenError::Invalid);
        }
        Ok(claims.sub)
    }

    /// Exchanges a refresh token for a new pair.
    ///
    /// The presented token is invalidated and its replacement stored in one store call,
    /// so at no point are both valid. On [`TokenError::AlreadyUsed`] the caller gets the
    /// owning user id back through [`RotationFailure`] to decide on reuse handling.
    pub async fn rotate_refresh_token(
        &self,
        token: &str,
    ) -> Result<(AccessToken, RefreshToken), RotationFailure> {
        let claims = self.decode_live(token, TokenScope::RefreshToken)?;
        let session_id = claims.sid.ok_or(TokenError::Invalid)?;
        let replacement = self.signed_refresh_token(claims.sub, session_id)?;

        let outcome = self
            .refresh_store
            .rotate(
                claims.jti,
                RefreshRecord::for_token(&replacement),
                self.clock.now(),
            )
            .await
            .map_err(TokenError::from)?;

        match outcome {
            RotateOutcome::Rotated { user_id } => {
                let access = self.issue_access_token(user_id, session_id)?;
                Ok((access, replacement))
            }
            RotateOutcome::AlreadyUsed { user_id } => Err(RotationFailure {
                error: TokenError::AlreadyUsed,
                reused_by: Some(user_id),
            }),
            RotateOutcome::Expired => Err(TokenError::Expired.into()),
            RotateOutcome::Unknown | RotateOutcome::Revoked => Err(TokenError::Invalid.into()),
        }
    }

    /// Ends the session a refresh token belongs to, along with every access token issued
    /// in it. Authentic tokens are accepted even when expired, used or already revoked,
    /// which makes repeated logout a no-op.
    pub async fn revoke_refresh_token(&self, token: &str) -> Result<Uuid, TokenError> {
        let claims = self.decode_authentic(token, TokenScope::RefreshToken)?;
        let session_id = claims.sid.ok_or(TokenError::Invalid)?;
        self.refresh_store
            .revoke_session(session_id, self.clock.now())
            .await?;
        Ok(claims.sub)
    }

    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, TokenError> {
        Ok(self
            .refresh_store
            .revoke_all_for_user(user_id, self.clock.now())
            .await?)
    }

    /// Drops refresh records that have expired. Returns how many were removed.
    pub async fn purge_expired_sessions(&self) -> Result<u64, TokenError> {
        Ok(self.refresh_store.purge_expired(self.clock.now()).await?)
    }

    /// Issues a stateless token for an emailed link.
    pub fn issue_email_token(&self, user_id: Uuid, scope: TokenScope) -> Result<String, TokenError> {
        self.sign(user_id, scope, None, None).map(|(token, _)| token)
    }

    /// Issues a reset token bound to the identity's current `password_changed_at`, so
    /// that it stops working after the first successful password change of any kind.
    pub fn issue_password_reset_token(
        &self,
        user_id: Uuid,
        password_changed_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        self.sign(
            user_id,
            TokenScope::PasswordReset,
            None,
            Some(password_changed_at.timestamp_micros()),
        )
        .map(|(token, _)| token)
    }

    pub fn decode_email_token(&self, token: &str, scope: TokenScope) -> Result<Claims, TokenError> {
        self.decode_live(token, scope)
    }
}

/// A failed rotation. `reused_by` is set when the presented token had already been used.
#[derive(Debug)]
pub struct RotationFailure {
    pub error: TokenError,
    pub reused_by: Option<Uuid>,
}

impl From<TokenError> for RotationFailure {
    fn from(error: TokenError) -> Self {
        Self {
            error,
            reused_by: None,
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
