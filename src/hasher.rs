//! Password hashing and comparison using Argon2id
//!
//! Both operations run on the blocking pool and report through [`Outcome`].
//! A password that does not match is `Value(false)`, not a failure.

use argon2::{
    password_hash::{
        rand_core::OsRng, Error as PasswordHashError, PasswordHash, PasswordHasher,
        PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::config::HashConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialHasher {
    config: HashConfig,
}

impl CredentialHasher {
    pub fn new(config: HashConfig) -> Self {
        Self { config }
    }

    /// Hash `secret` with the configured cost; returns a PHC string
    pub async fn hash(&self, secret: &str) -> Outcome<String> {
        let config = self.config;
        let secret = secret.to_owned();

        match tokio::task::spawn_blocking(move || hash_blocking(&config, &secret)).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::failure(ErrorRecord::from_error(ErrorKind::HashGeneration, &e)),
        }
    }

    /// Compare `candidate` against a stored PHC hash
    pub async fn compare(&self, hashed: &str, candidate: &str) -> Outcome<bool> {
        let hashed = hashed.to_owned();
        let candidate = candidate.to_owned();

        match tokio::task::spawn_blocking(move || compare_blocking(&hashed, &candidate)).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::failure(ErrorRecord::from_error(ErrorKind::HashComparison, &e)),
        }
    }
}

fn hash_blocking(config: &HashConfig, secret: &str) -> Outcome<String> {
    let params = Params::new(config.memory_kib, config.cost_factor, config.parallelism, None);
    let params = match params {
        Ok(params) => params,
        Err(e) => {
            return Outcome::failure(ErrorRecord::new(
                ErrorKind::HashGeneration,
                format!("Invalid hash parameters: {e}"),
            ))
        }
    };
    let salt = SaltString::generate(&mut OsRng);

    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(secret.as_bytes(), &salt)
        .map_or_else(
            |e| {
                Outcome::failure(ErrorRecord::new(
                    ErrorKind::HashGeneration,
                    format!("Failed to hash password: {e}"),
                ))
            },
            |hash| Outcome::Value(hash.to_string()),
        )
}

fn compare_blocking(hashed: &str, candidate: &str) -> Outcome<bool> {
    let parsed = match PasswordHash::new(hashed) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Outcome::failure(ErrorRecord::new(
                ErrorKind::HashComparison,
                format!("Invalid password hash format: {e}"),
            ))
        }
    };

    // parameters come from the PHC string, not from the default instance
    match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
        Ok(()) => Outcome::Value(true),
        Err(PasswordHashError::Password) => Outcome::Value(false),
        Err(e) => Outcome::failure(ErrorRecord::new(
            ErrorKind::HashComparison,
            format!("Failed to compare password: {e}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> CredentialHasher {
        CredentialHasher::new(HashConfig {
            cost_factor: 1,
            memory_kib: 64,
            parallelism: 1,
        })
    }

    #[tokio::test]
    async fn test_hash_and_compare() {
        let hasher = cheap();
        let hash = hasher.hash("Secr3t!").await.value().unwrap();

        assert!(hash.starts_with("$argon2id"));
        assert_eq!(hasher.compare(&hash, "Secr3t!").await, Outcome::Value(true));
        assert_eq!(hasher.compare(&hash, "wrong").await, Outcome::Value(false));
    }

    #[tokio::test]
    async fn test_salts_differ() {
        let hasher = cheap();
        let first = hasher.hash("same").await.value().unwrap();
        let second = hasher.hash("same").await.value().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_hash_is_comparison_failure() {
        let outcome = cheap().compare("not-a-valid-hash", "password").await;
        assert_eq!(
            outcome.as_failure().map(|r| r.kind),
            Some(ErrorKind::HashComparison)
        );
    }

    #[tokio::test]
    async fn test_invalid_params_is_generation_failure() {
        let hasher = CredentialHasher::new(HashConfig {
            cost_factor: 0,
            memory_kib: 64,
            parallelism: 1,
        });
        let outcome = hasher.hash("x").await;
        assert_eq!(
            outcome.as_failure().map(|r| r.kind),
            Some(ErrorKind::HashGeneration)
        );
    }
}
