//! Error taxonomy and fault classification
//!
//! Every failure inside the crate is carried as an [`ErrorRecord`]. Records are
//! produced by total classification functions, so they can be built from any
//! fault (an error value, a message, a JSON blob or a panic payload) without
//! failing themselves.

use std::any::Any;
use std::error::Error as StdError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of failure, dispatched by pattern match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Auth,
    Validation,
    Database,
    NotFound,
    Network,
    TokenDecode,
    TokenVerification,
    TokenSignature,
    HashComparison,
    HashGeneration,
    RetryLimitExceeded,
    Timeout,
    /// A concurrent writer won a compare-and-swap; the caller may retry.
    Conflict,
    Unknown,
}

impl ErrorKind {
    /// Stable name used in logs and error extensions
    pub fn name(self) -> &'static str {
        match self {
            Self::Auth => "AuthError",
            Self::Validation => "ValidationError",
            Self::Database => "DatabaseError",
            Self::NotFound => "NotFoundError",
            Self::Network => "NetworkError",
            Self::TokenDecode => "TokenDecodeError",
            Self::TokenVerification => "TokenVerificationError",
            Self::TokenSignature => "TokenSignatureError",
            Self::HashComparison => "HashComparisonError",
            Self::HashGeneration => "HashGenerationError",
            Self::RetryLimitExceeded => "RetryLimitExceededError",
            Self::Timeout => "TimeoutError",
            Self::Conflict => "ConflictError",
            Self::Unknown => "UnknownError",
        }
    }

    /// Message that is safe to hand to an external client
    pub fn client_message(self) -> &'static str {
        match self {
            Self::Auth | Self::TokenDecode | Self::TokenVerification => "Unauthorized",
            Self::NotFound => "Not Found",
            Self::Validation => "Bad Request",
            Self::Conflict => "Conflict",
            Self::RetryLimitExceeded | Self::Timeout => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    /// HTTP-class status code for the kind
    pub fn status_code(self) -> u16 {
        match self {
            Self::Auth | Self::TokenDecode | Self::TokenVerification => 401,
            Self::NotFound => 404,
            Self::Validation => 400,
            Self::Conflict => 409,
            Self::RetryLimitExceeded | Self::Timeout => 503,
            _ => 500,
        }
    }
}

/// Structured description of a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{name}: {message}")]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub original: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set when the failure must be surfaced to security monitoring
    #[serde(default)]
    pub security_event: bool,
}

const UNCLASSIFIED_NAME: &str = "UnclassifiedFault";
const UNCLASSIFIED_MESSAGE: &str = "unclassified fault";

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            message: message.into(),
            stack: None,
            original: None,
            timestamp: Utc::now(),
            security_event: false,
        }
    }

    /// Classify an error value under `kind`
    ///
    /// The `source()` chain stands in for a stack trace; the debug form of the
    /// error is kept as `original`.
    pub fn from_error(kind: ErrorKind, error: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            stack: (!causes.is_empty()).then(|| causes.join("\ncaused by: ")),
            original: Some(format!("{error:?}")),
            ..Self::new(kind, error.to_string())
        }
    }

    /// Classify a bare message
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            ..Self::new(ErrorKind::Unknown, message)
        }
    }

    /// Classify a structured fault by serializing it into `original`
    pub fn from_value(value: &serde_json::Value) -> Self {
        let original = serde_json::to_string_pretty(value)
            .unwrap_or_else(|_| "Unserializable data".to_string());
        Self {
            name: "Error".to_string(),
            original: Some(original),
            ..Self::new(ErrorKind::Unknown, "An error occurred")
        }
    }

    /// Classify a panic payload caught at an entry point
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            return Self::from_message(*message);
        }
        if let Some(message) = payload.downcast_ref::<String>() {
            return Self::from_message(message.clone());
        }
        Self {
            name: UNCLASSIFIED_NAME.to_string(),
            ..Self::new(ErrorKind::Unknown, UNCLASSIFIED_MESSAGE)
        }
    }

    /// Wrap the last fault seen by an exhausted retry loop
    pub fn retry_limit_exceeded(operation: &str, attempts: u32, last: Option<Self>) -> Self {
        let mut record = Self::new(
            ErrorKind::RetryLimitExceeded,
            format!("Retry limit exceeded for {operation} after {attempts} attempts"),
        );
        if let Some(last) = last {
            record.original = Some(match &last.original {
                Some(original) => format!("{last}\n{original}"),
                None => last.to_string(),
            });
            record.stack = last.stack;
        }
        record
    }

    /// Mark the record for security monitoring
    pub fn flag_security(mut self) -> Self {
        self.security_event = true;
        self
    }

    /// Copy of the record with internal details removed
    pub fn sanitized(&self) -> Self {
        Self {
            kind: self.kind,
            name: self.kind.name().to_string(),
            message: self.kind.client_message().to_string(),
            stack: None,
            original: None,
            timestamp: self.timestamp,
            security_event: false,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Whether the client has to log in again to continue
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Auth
                | ErrorKind::TokenDecode
                | ErrorKind::TokenVerification
                | ErrorKind::NotFound
                | ErrorKind::RetryLimitExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection reset")]
    struct Reset;

    #[derive(Debug, Error)]
    #[error("query failed")]
    struct QueryFailed(#[source] Reset);

    #[test]
    fn test_from_error_keeps_source_chain() {
        let record = ErrorRecord::from_error(ErrorKind::Database, &QueryFailed(Reset));
        assert_eq!(record.name, "DatabaseError");
        assert_eq!(record.message, "query failed");
        assert_eq!(record.stack.as_deref(), Some("connection reset"));
        assert!(record.original.is_some());
    }

    #[test]
    fn test_from_message() {
        let record = ErrorRecord::from_message("boom");
        assert_eq!(record.name, "Error");
        assert_eq!(record.message, "boom");
        assert_eq!(record.kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_from_value_serializes_original() {
        let record = ErrorRecord::from_value(&serde_json::json!({ "code": 11000 }));
        assert_eq!(record.message, "An error occurred");
        assert!(record.original.as_deref().unwrap().contains("11000"));
    }

    #[test]
    fn test_from_panic_payloads() {
        let record = ErrorRecord::from_panic(Box::new("static message"));
        assert_eq!(record.message, "static message");

        let record = ErrorRecord::from_panic(Box::new(String::from("owned message")));
        assert_eq!(record.message, "owned message");

        let record = ErrorRecord::from_panic(Box::new(42_u8));
        assert_eq!(record.name, UNCLASSIFIED_NAME);
    }

    #[test]
    fn test_sanitized_hides_internals() {
        let record = ErrorRecord::from_error(ErrorKind::Database, &QueryFailed(Reset))
            .flag_security();
        let clean = record.sanitized();
        assert_eq!(clean.message, "Internal Server Error");
        assert!(clean.stack.is_none());
        assert!(clean.original.is_none());
        assert!(!clean.security_event);
        assert_eq!(clean.status_code(), 500);
    }

    #[test]
    fn test_retry_limit_wraps_last_fault() {
        let last = ErrorRecord::new(ErrorKind::Database, "store unreachable");
        let record = ErrorRecord::retry_limit_exceeded("users.get_by_id", 3, Some(last));
        assert_eq!(record.kind, ErrorKind::RetryLimitExceeded);
        assert!(record.original.as_deref().unwrap().contains("store unreachable"));
        assert!(record.requires_reauthentication());
    }
}
