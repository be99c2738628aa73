//! # pleme-auth-helpers
//!
//! Session authentication library for Pleme GraphQL services.
//!
//! ## Features
//!
//! - **Rotating Access Tokens** - every request exchanges its token for a fresh one
//! - **Replay Detection** - a superseded token revokes its session
//! - **Tri-state Outcomes** - value, empty or a classified error record
//! - **Retrying Repositories** - exponential backoff with jitter over a document store
//! - **Error Log Sink** - full failure records persisted, sanitized ones returned
//! - **Auth Middleware** - axum handler that rotates tokens for GraphQL requests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pleme_auth_helpers::{AuthConfig, AuthService, MemoryStore, RequestMetadata};
//!
//! # async fn example() {
//! let config = AuthConfig::from_env().expect("ACCESS_TOKEN_SEED must be set");
//! let auth = AuthService::with_store_sink(Arc::new(MemoryStore::new()), config);
//!
//! let metadata = RequestMetadata::new("203.0.113.9", "curl/8");
//! if let Some(grant) = auth.login("alice", "Secr3t!", &metadata).await.value() {
//!     let next = auth.rotate(&grant.token, &metadata).await;
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod error_log;
pub mod graphql;
pub mod hasher;
pub mod orchestrator;
pub mod outcome;
pub mod repository;
pub mod retry;
pub mod session;
pub mod store;
pub mod token;
pub mod user;

pub use config::{AuthConfig, Collections, HashConfig, RetryConfig, TokenConfig};
pub use error::{ErrorKind, ErrorRecord};
pub use error_log::{ErrorLogEntry, ErrorLogSink, StoreErrorLogSink, TracingErrorLogSink};
pub use graphql::{graphql_handler, extract_bearer_token, AuthMutation, AuthQuery, RequestContext};
pub use hasher::CredentialHasher;
pub use orchestrator::{AuthService, LoginGrant, Rotation};
pub use outcome::Outcome;
pub use repository::Repository;
pub use retry::RetryPolicy;
pub use session::{RequestMetadata, Session, SessionStore};
pub use store::{DocumentStore, Filter, MemoryStore, Patch, StoreError};
pub use token::{TokenClaims, TokenCodec, TokenPayload};
pub use user::{NewUser, Role, User, UserProfile};
