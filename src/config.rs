//! Injected configuration
//!
//! Token lifetimes, retry budgets and hashing cost are passed in at
//! construction so tests can run with short, deterministic settings.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ErrorRecord};

/// Retry budget and backoff shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of invocations of the wrapped operation
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%)
    pub jitter: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            factor: 2.0,
            jitter: 0.2,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Number of passes (argon2 `t_cost`)
    pub cost_factor: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            cost_factor: 2,
            memory_kib: 19_456,
            parallelism: 1,
        }
    }
}

/// Signing secret and access-token lifetime
pub struct TokenConfig {
    secret: SecretString,
    pub access_ttl_secs: u64,
    /// Clock skew tolerated when checking expiry
    pub leeway_secs: u64,
}

impl TokenConfig {
    /// Returns an error if the secret is empty
    pub fn new(secret: impl Into<String>) -> Result<Self, ErrorRecord> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(ErrorRecord::new(
                ErrorKind::Validation,
                "ACCESS_TOKEN_SEED must not be empty",
            ));
        }

        Ok(Self {
            secret: SecretString::from(secret),
            access_ttl_secs: 5,
            leeway_secs: 0,
        })
    }

    pub fn with_access_ttl_secs(mut self, secs: u64) -> Self {
        self.access_ttl_secs = secs;
        self
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"[REDACTED]")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Collection names used in the document store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Collections {
    pub users: String,
    pub sessions: String,
    pub error_logs: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            users: "users".to_string(),
            sessions: "auth_sessions".to_string(),
            error_logs: "error_logs".to_string(),
        }
    }
}

/// Everything the auth service needs at construction
#[derive(Debug)]
pub struct AuthConfig {
    pub token: TokenConfig,
    pub retry: RetryConfig,
    pub hash: HashConfig,
    pub session_ttl_secs: u64,
    pub error_log_ttl_secs: u64,
    pub collections: Collections,
}

impl AuthConfig {
    pub fn new(token: TokenConfig) -> Self {
        Self {
            token,
            retry: RetryConfig::default(),
            hash: HashConfig::default(),
            session_ttl_secs: 60 * 60 * 24,
            error_log_ttl_secs: 60 * 60 * 24 * 7,
            collections: Collections::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_hash(mut self, hash: HashConfig) -> Self {
        self.hash = hash;
        self
    }

    /// Load from the environment
    ///
    /// `ACCESS_TOKEN_SEED` is required; `ACCESS_TOKEN_TTL_SECS`, `MAX_RETRIES`,
    /// `RETRY_BASE_DELAY_MS`, `RETRY_BACKOFF_FACTOR`, `HASH_COST_FACTOR` and
    /// `SESSION_TTL_SECS` override the defaults.
    pub fn from_env() -> Result<Self, ErrorRecord> {
        let seed = env::var("ACCESS_TOKEN_SEED").map_err(|_| {
            ErrorRecord::new(ErrorKind::Validation, "ACCESS_TOKEN_SEED is required")
        })?;

        let mut config = Self::new(TokenConfig::new(seed)?);
        if let Some(ttl) = env_parse("ACCESS_TOKEN_TTL_SECS")? {
            config.token.access_ttl_secs = ttl;
        }
        if let Some(attempts) = env_parse("MAX_RETRIES")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(delay) = env_parse("RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = delay;
        }
        if let Some(factor) = env_parse("RETRY_BACKOFF_FACTOR")? {
            config.retry.factor = factor;
        }
        if let Some(cost) = env_parse("HASH_COST_FACTOR")? {
            config.hash.cost_factor = cost;
        }
        if let Some(ttl) = env_parse("SESSION_TTL_SECS")? {
            config.session_ttl_secs = ttl;
        }
        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ErrorRecord> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ErrorRecord::new(ErrorKind::Validation, format!("{key} has an invalid value"))
        }),
        Err(_) => Ok(None),
    }
}
