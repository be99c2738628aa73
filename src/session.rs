//! Session records and the retrying session store
//!
//! A session binds a user to the single token that is currently valid for it.
//! It is created at login with a placeholder token, its token is swapped on
//! every rotation and it is deleted at logout or when a superseded token is
//! replayed. Sessions also lapse `session_ttl` after login.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ErrorKind, ErrorRecord};
use crate::outcome::Outcome;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, Filter, Patch};
use crate::user::User;

/// Token value stored between session creation and the first signature
pub const PLACEHOLDER_TOKEN: &str = "notAToken";

const ACTIVE_TOKEN_FIELD: &str = "currentlyActiveToken";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "_id")]
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub currently_active_token: String,
    #[serde(rename = "addressIP")]
    pub address_ip: String,
    pub user_agent: String,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}

/// Insert schema for a new session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub user_id: String,
    pub username: String,
    pub currently_active_token: String,
    #[serde(rename = "addressIP")]
    pub address_ip: String,
    pub user_agent: String,
    pub expire_at: DateTime<Utc>,
}

impl NewSession {
    pub fn for_user(user: &User, metadata: &RequestMetadata, ttl: Duration) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            currently_active_token: PLACEHOLDER_TOKEN.to_string(),
            address_ip: metadata.ip_or_unknown().to_string(),
            user_agent: metadata.user_agent_or_unknown().to_string(),
            expire_at: Utc::now() + ttl,
        }
    }
}

/// Field-level session changes; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currently_active_token: Option<String>,
    #[serde(rename = "addressIP", skip_serializing_if = "Option::is_none")]
    pub address_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl SessionPatch {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            currently_active_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: &RequestMetadata) -> Self {
        self.address_ip = Some(metadata.ip_or_unknown().to_string());
        self.user_agent = Some(metadata.user_agent_or_unknown().to_string());
        self
    }
}

/// Caller details recorded with sessions and error logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    /// Serialized request headers
    pub headers: Option<String>,
}

impl RequestMetadata {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            user_agent: Some(user_agent.into()),
            headers: None,
        }
    }

    pub fn ip_or_unknown(&self) -> &str {
        self.ip.as_deref().unwrap_or("unknown")
    }

    pub fn user_agent_or_unknown(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("unknown")
    }
}

/// Retrying CRUD over session records
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Repository<Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        retry: RetryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            sessions: Repository::new(store, collection, retry),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn create(&self, session: &NewSession) -> Outcome<Session> {
        self.sessions.create(session).await
    }

    /// Load a live session; a lapsed one is removed and reported as `Empty`
    pub async fn get_by_id(&self, session_id: &str) -> Outcome<Session> {
        match self.sessions.get_by_id(session_id).await {
            Outcome::Value(session) if session.is_expired(Utc::now()) => {
                debug!(session_id, "session lapsed");
                // best effort; the record is unusable either way
                let _ = self.sessions.delete_by_id(session_id).await;
                Outcome::Empty
            }
            other => other,
        }
    }

    pub async fn update_by_id(&self, session_id: &str, patch: &SessionPatch) -> Outcome<Session> {
        match Patch::from_serializable(patch) {
            Ok(patch) => self.sessions.update_by_id(session_id, &patch).await,
            Err(e) => Outcome::failure(ErrorRecord::from_error(ErrorKind::Validation, &e)),
        }
    }

    /// Replace the active token only if it still equals `expected`
    ///
    /// `Empty` means another writer changed the token (or the session is gone)
    /// since `expected` was read.
    pub async fn swap_active_token(
        &self,
        session_id: &str,
        expected: &str,
        fresh: &str,
    ) -> Outcome<Session> {
        self.sessions
            .update_by_id_if(
                session_id,
                &Filter::new().eq(ACTIVE_TOKEN_FIELD, expected),
                &Patch::new().set(ACTIVE_TOKEN_FIELD, fresh),
            )
            .await
    }

    pub async fn delete_by_id(&self, session_id: &str) -> Outcome<bool> {
        self.sessions.delete_by_id(session_id).await
    }
}
