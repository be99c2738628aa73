//! Error log sink
//!
//! Entry points hand every failure to an [`ErrorLogSink`] before answering the
//! caller. The sink's own result never changes the caller's outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{ErrorKind, ErrorRecord};
use crate::outcome::Outcome;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::session::RequestMetadata;
use crate::store::DocumentStore;
use crate::token::TokenClaims;

/// Who was acting when a failure happened, as far as it is known
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

impl Identity {
    pub fn username(username: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            ..Self::default()
        }
    }
}

impl From<&TokenClaims> for Identity {
    fn from(claims: &TokenClaims) -> Self {
        Self {
            session_id: Some(claims.session_id.clone()),
            user_id: Some(claims.user_id.clone()),
            username: Some(claims.username.clone()),
        }
    }
}

/// Durable failure record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub operation: String,
    pub message: String,
    pub name: String,
    pub stack: String,
    pub original: String,
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Option<String>,
    pub security_event: bool,
    pub expire_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(
        operation: &str,
        record: &ErrorRecord,
        identity: &Identity,
        metadata: &RequestMetadata,
        ttl: Duration,
    ) -> Self {
        Self {
            id: None,
            operation: operation.to_string(),
            message: record.message.clone(),
            name: record.name.clone(),
            stack: record.stack.clone().unwrap_or_default(),
            original: record.original.clone().unwrap_or_default(),
            session_id: identity.session_id.clone().unwrap_or_default(),
            user_id: identity.user_id.clone().unwrap_or_default(),
            username: identity.username.clone().unwrap_or_default(),
            timestamp: record.timestamp,
            ip: metadata.ip.clone(),
            user_agent: metadata.user_agent.clone(),
            headers: metadata.headers.clone(),
            security_event: record.security_event,
            expire_at: Utc::now() + ttl,
        }
    }
}

/// Destination for failure records
#[async_trait]
pub trait ErrorLogSink: Send + Sync {
    async fn record(&self, entry: ErrorLogEntry) -> Result<(), ErrorRecord>;
}

/// Persists entries into a document collection
#[derive(Debug, Clone)]
pub struct StoreErrorLogSink {
    entries: Repository<ErrorLogEntry>,
}

impl StoreErrorLogSink {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            entries: Repository::new(store, collection, retry),
        }
    }

    pub fn entries(&self) -> &Repository<ErrorLogEntry> {
        &self.entries
    }
}

#[async_trait]
impl ErrorLogSink for StoreErrorLogSink {
    async fn record(&self, entry: ErrorLogEntry) -> Result<(), ErrorRecord> {
        match self.entries.create(&entry).await {
            Outcome::Value(_) => Ok(()),
            Outcome::Empty => Err(ErrorRecord::new(
                ErrorKind::Database,
                "error log entry was not persisted",
            )),
            Outcome::Failure(record) => Err(record),
        }
    }
}

/// Emits entries as `tracing` events, for hosts without a durable sink
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorLogSink;

#[async_trait]
impl ErrorLogSink for TracingErrorLogSink {
    async fn record(&self, entry: ErrorLogEntry) -> Result<(), ErrorRecord> {
        error!(
            operation = %entry.operation,
            name = %entry.name,
            message = %entry.message,
            session_id = %entry.session_id,
            user_id = %entry.user_id,
            username = %entry.username,
            security_event = entry.security_event,
            "error log entry"
        );
        Ok(())
    }
}
