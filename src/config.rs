use chrono::Duration;
use jsonwebtoken::Algorithm;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::auth::{AuthPolicy, KeyRing, TokenError, TokenTtls};

const MIN_SECRET_LEN: usize = 16;
const DEFAULT_BANNED_USER_AGENTS: &[&str] = &["bot-Yandex", "Python-urllib", "Googlebot"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Signing settings. Secrets stay out of `Debug` output.
#[derive(Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub previous_secret: Option<String>,
    pub algorithm: Algorithm,
    pub ttls: TokenTtls,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("previous_secret", &self.previous_secret.as_ref().map(|_| "<redacted>"))
            .field("algorithm", &self.algorithm)
            .field("ttls", &self.ttls)
            .finish()
    }
}

impl JwtConfig {
    pub fn key_ring(&self) -> Result<KeyRing, TokenError> {
        KeyRing::new(
            self.algorithm,
            self.secret.as_bytes(),
            self.previous_secret.as_deref().map(str::as_bytes),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent means the process keeps its data in memory.
    pub database_url: Option<String>,
    pub server_port: u16,
    pub server_host: String,
    pub public_base_url: String,
    pub jwt: JwtConfig,
    pub require_verification: bool,
    pub revoke_all_on_reuse: bool,
    pub bcrypt_cost: u32,
    pub banned_user_agents: Vec<String>,
    pub mail_api_url: Option<String>,
    /// How often expired refresh token records are deleted.
    pub session_purge_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup. Empty values count as unset.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let server_host = get("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let server_port = parse_or(&get, "SERVER_PORT", 8080)?;
        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://{}:{}", server_host, server_port));

        let secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        check_secret("JWT_SECRET", &secret)?;
        let previous_secret = get("JWT_PREVIOUS_SECRET");
        if let Some(previous) = &previous_secret {
            check_secret("JWT_PREVIOUS_SECRET", previous)?;
        }

        let algorithm = match get("JWT_ALGORITHM").as_deref() {
            None | Some("HS256") => Algorithm::HS256,
            Some("HS512") => Algorithm::HS512,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "JWT_ALGORITHM",
                    reason: format!("unsupported algorithm {}, expected HS256 or HS512", other),
                })
            }
        };

        let ttls = TokenTtls {
            access: ttl(&get, "ACCESS_TOKEN_TTL_SECS", 900)?,
            refresh: ttl(&get, "REFRESH_TOKEN_TTL_SECS", 604_800)?,
            email_verification: ttl(&get, "EMAIL_TOKEN_TTL_SECS", 86_400)?,
            password_reset: ttl(&get, "RESET_TOKEN_TTL_SECS", 3_600)?,
        };

        let bcrypt_cost = parse_or(&get, "BCRYPT_COST", bcrypt::DEFAULT_COST)?;
        if !(4..=31).contains(&bcrypt_cost) {
            return Err(ConfigError::Invalid {
                name: "BCRYPT_COST",
                reason: "must be between 4 and 31".to_string(),
            });
        }

        let banned_user_agents = match get("BANNED_USER_AGENTS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_BANNED_USER_AGENTS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            server_port,
            server_host,
            public_base_url,
            jwt: JwtConfig {
                secret,
                previous_secret,
                algorithm,
                ttls,
            },
            require_verification: parse_or(&get, "REQUIRE_VERIFICATION", true)?,
            revoke_all_on_reuse: parse_or(&get, "REFRESH_REUSE_REVOKES_ALL", true)?,
            bcrypt_cost,
            banned_user_agents,
            mail_api_url: get("MAIL_API_URL"),
            session_purge_interval: ttl(&get, "SESSION_PURGE_INTERVAL_SECS", 3_600)?,
        })
    }

    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.server_port)
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy {
            require_verification: self.require_verification,
            bcrypt_cost: self.bcrypt_cost,
            public_base_url: self.public_base_url.clone(),
            revoke_all_on_reuse: self.revoke_all_on_reuse,
        }
    }
}

fn check_secret(name: &'static str, secret: &str) -> Result<(), ConfigError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("must be at least {} bytes", MIN_SECRET_LEN),
        });
    }
    Ok(())
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn ttl<G>(get: &G, name: &'static str, default_secs: i64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: i64 = parse_or(get, name, default_secs)?;
    if secs <= 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be a positive number of seconds".to_string(),
        });
    }
    Ok(Duration::seconds(secs))
}
