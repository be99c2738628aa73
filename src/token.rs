//! Access token signing, verification and decoding
//!
//! Tokens are HS256 JWTs. Verification is the trust boundary and reports an
//! expired-but-authentic token as [`Outcome::Empty`]; decoding reads the claims
//! without checking the signature or expiry and is only used after
//! verification has vetted the token.
//!
//! Every token carries a random `jti`, so two tokens for the same session
//! issued within the same second still differ.

use std::fmt;

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind as JwtErrorKind, Algorithm, DecodingKey, EncodingKey,
    Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::outcome::Outcome;
use crate::user::{Role, User};

/// Identity embedded in a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub user_id: String,
    pub username: String,
    pub roles: Vec<Role>,
    pub session_id: String,
}

impl TokenPayload {
    pub fn for_session(user: &User, session_id: &str) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            roles: user.roles.clone(),
            session_id: session_id.to_string(),
        }
    }
}

/// Claims as they appear inside a signed token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub user_id: String,
    pub username: String,
    pub roles: Vec<Role>,
    pub session_id: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    pub jti: String,
}

impl TokenClaims {
    /// The identity part, without timing fields
    pub fn payload(&self) -> TokenPayload {
        TokenPayload {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            roles: self.roles.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// A freshly signed token together with its claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
}

#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    leeway_secs: u64,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(config: &TokenConfig) -> Self {
        let secret = config.secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl_secs: i64::try_from(config.access_ttl_secs).unwrap_or(i64::MAX),
            leeway_secs: config.leeway_secs,
        }
    }

    /// Sign `payload` with a fresh lifetime and token id
    pub fn issue(&self, payload: &TokenPayload) -> Outcome<IssuedToken> {
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            user_id: payload.user_id.clone(),
            username: payload.username.clone(),
            roles: payload.roles.clone(),
            session_id: payload.session_id.clone(),
            iat: now,
            exp: now.saturating_add(self.access_ttl_secs),
            jti: Uuid::new_v4().to_string(),
        };

        self.sign_claims(&claims)
            .map(|token| IssuedToken { token, claims })
    }

    pub fn sign(&self, payload: &TokenPayload) -> Outcome<String> {
        self.issue(payload).map(|issued| issued.token)
    }

    /// Sign claims exactly as given
    pub fn sign_claims(&self, claims: &TokenClaims) -> Outcome<String> {
        match encode(&Header::new(Algorithm::HS256), claims, &self.encoding) {
            Ok(token) => Outcome::Value(token),
            Err(e) => Outcome::failure(ErrorRecord::from_error(ErrorKind::TokenSignature, &e)),
        }
    }

    /// Check signature and expiry
    ///
    /// Authentic and live → `Value`; authentic but expired → `Empty`;
    /// anything else → `TokenVerificationError`.
    pub fn verify(&self, token: &str) -> Outcome<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;

        match decode::<TokenClaims>(token, &self.decoding, &validation) {
            Ok(data) => Outcome::Value(data.claims),
            Err(e) if matches!(e.kind(), JwtErrorKind::ExpiredSignature) => Outcome::Empty,
            Err(e) => Outcome::failure(ErrorRecord::from_error(ErrorKind::TokenVerification, &e)),
        }
    }

    /// Read the claims without checking signature or expiry
    pub fn decode(&self, token: &str) -> Outcome<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        match decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
            Ok(data) => Outcome::Value(data.claims),
            Err(e) => Outcome::failure(ErrorRecord::from_error(ErrorKind::TokenDecode, &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(secret: &str) -> TokenCodec {
        TokenCodec::new(&TokenConfig::new(secret).unwrap().with_access_ttl_secs(60))
    }

    fn payload() -> TokenPayload {
        TokenPayload {
            user_id: "user-1".to_string(),
            username: "alice".to_string(),
            roles: vec![Role::Employee],
            session_id: "session-1".to_string(),
        }
    }

    fn expired_claims() -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            user_id: "user-1".to_string(),
            username: "alice".to_string(),
            roles: vec![Role::Employee],
            session_id: "session-1".to_string(),
            iat: now - 120,
            exp: now - 60,
            jti: "expired".to_string(),
        }
    }

    #[test]
    fn test_decode_recovers_signed_payload() {
        let codec = codec("test-secret");
        let token = codec.sign(&payload()).value().unwrap();

        let claims = codec.decode(&token).value().unwrap();
        assert_eq!(claims.payload(), payload());
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[test]
    fn test_verify_valid_token() {
        let codec = codec("test-secret");
        let issued = codec.issue(&payload()).value().unwrap();
        assert_eq!(codec.verify(&issued.token), Outcome::Value(issued.claims));
    }

    #[test]
    fn test_verify_expired_is_empty() {
        let codec = codec("test-secret");
        let token = codec.sign_claims(&expired_claims()).value().unwrap();

        assert!(codec.verify(&token).is_empty());
        // expired tokens can still be read
        assert_eq!(codec.decode(&token).value().unwrap().jti, "expired");
    }

    #[test]
    fn test_verify_tampered_is_failure() {
        let codec = codec("test-secret");
        let token = codec.sign(&payload()).value().unwrap();
        let admin = TokenPayload {
            roles: vec![Role::Admin],
            ..payload()
        };
        let forged = codec.sign(&admin).value().unwrap();

        // splice the admin claims onto the original signature
        let parts: Vec<&str> = token.split('.').collect();
        let forged_parts: Vec<&str> = forged.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged_parts[1], parts[2]);

        let outcome = codec.verify(&tampered);
        assert_eq!(
            outcome.as_failure().map(|r| r.kind),
            Some(ErrorKind::TokenVerification)
        );
    }

    #[test]
    fn test_verify_foreign_secret_is_failure() {
        let token = codec("other-secret").sign(&payload()).value().unwrap();
        assert!(codec("test-secret").verify(&token).is_failure());
    }

    #[test]
    fn test_expired_with_foreign_secret_is_failure() {
        let token = codec("other-secret")
            .sign_claims(&expired_claims())
            .value()
            .unwrap();
        assert!(codec("test-secret").verify(&token).is_failure());
    }

    #[test]
    fn test_decode_malformed_is_failure() {
        let outcome = codec("test-secret").decode("not.a.token");
        assert_eq!(outcome.as_failure().map(|r| r.kind), Some(ErrorKind::TokenDecode));
    }

    #[test]
    fn test_tokens_for_same_payload_differ() {
        let codec = codec("test-secret");
        let first = codec.sign(&payload()).value().unwrap();
        let second = codec.sign(&payload()).value().unwrap();
        assert_ne!(first, second);
    }
}
