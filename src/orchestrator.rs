//! Login, per-request token rotation and logout
//!
//! Session states: anonymous → authenticated → rotating → authenticated or
//! revoked. Every authenticated request exchanges its token for a fresh one;
//! presenting a token that has already been exchanged revokes the session.
//!
//! Each entry point returns a sanitized [`Outcome`]. The full [`ErrorRecord`]
//! of any failure, including panics caught at the entry point, goes to the
//! [`ErrorLogSink`] first.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Duration;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::AuthConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::error_log::{ErrorLogEntry, ErrorLogSink, Identity, StoreErrorLogSink};
use crate::hasher::CredentialHasher;
use crate::outcome::Outcome;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::session::{NewSession, RequestMetadata, SessionPatch, SessionStore};
use crate::store::{DocumentStore, Filter, FindOptions};
use crate::token::{TokenClaims, TokenCodec, TokenPayload};
use crate::user::{NewUser, User, UserProfile, UserSchema};

/// Result of a successful login
#[derive(Debug, Clone, PartialEq)]
pub struct LoginGrant {
    pub user: UserProfile,
    pub token: String,
    pub session_id: String,
}

/// Result of a successful rotation
#[derive(Debug, Clone, PartialEq)]
pub struct Rotation {
    /// Token the client must present on its next request
    pub token: String,
    pub claims: TokenClaims,
}

/// A failed step plus whatever identity was known when it failed
struct StepError {
    record: ErrorRecord,
    identity: Identity,
}

impl From<ErrorRecord> for StepError {
    fn from(record: ErrorRecord) -> Self {
        Self {
            record,
            identity: Identity::default(),
        }
    }
}

impl StepError {
    fn with_identity(mut self, identity: Identity) -> Self {
        if self.identity == Identity::default() {
            self.identity = identity;
        }
        self
    }
}

type StepResult<T> = Result<T, StepError>;

pub struct AuthService {
    users: Repository<User>,
    sessions: SessionStore,
    tokens: TokenCodec,
    hasher: CredentialHasher,
    sink: Arc<dyn ErrorLogSink>,
    error_log_ttl: Duration,
}

fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

impl AuthService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: AuthConfig,
        sink: Arc<dyn ErrorLogSink>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry);
        Self {
            users: Repository::new(Arc::clone(&store), config.collections.users.clone(), retry),
            sessions: SessionStore::new(
                store,
                config.collections.sessions.clone(),
                retry,
                seconds(config.session_ttl_secs),
            ),
            tokens: TokenCodec::new(&config.token),
            hasher: CredentialHasher::new(config.hash),
            sink,
            error_log_ttl: seconds(config.error_log_ttl_secs),
        }
    }

    /// Service whose error log lives in the same store
    pub fn with_store_sink(store: Arc<dyn DocumentStore>, config: AuthConfig) -> Self {
        let sink = StoreErrorLogSink::new(
            Arc::clone(&store),
            config.collections.error_logs.clone(),
            RetryPolicy::new(config.retry),
        );
        Self::new(store, config, Arc::new(sink))
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenCodec {
        &self.tokens
    }

    pub fn users(&self) -> &Repository<User> {
        &self.users
    }

    /// Check credentials, open a session and issue its first token
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        metadata: &RequestMetadata,
    ) -> Outcome<LoginGrant> {
        let identity = Identity::username(username);
        self.guard("login", metadata, identity.clone(), async {
            self.try_login(username, password, metadata)
                .await
                .map(Some)
                .map_err(|e| StepError::from(e).with_identity(identity.clone()))
        })
        .await
    }

    /// Exchange `incoming` for a fresh token
    ///
    /// The incoming token may be expired but must be authentic and must be the
    /// session's active token. A superseded token revokes the session. Losing a
    /// compare-and-swap to a concurrent rotation yields a `ConflictError`
    /// without revoking.
    pub async fn rotate(&self, incoming: &str, metadata: &RequestMetadata) -> Outcome<Rotation> {
        self.guard("rotate", metadata, Identity::default(), async {
            let claims = self.vetted_claims(incoming)?;
            self.try_rotate(incoming, &claims)
                .await
                .map(Some)
                .map_err(|e| StepError::from(e).with_identity(Identity::from(&claims)))
        })
        .await
    }

    /// Delete the session behind `token`
    ///
    /// The token must be authentic and unexpired. A session that is already
    /// gone is `Empty`, not a failure.
    pub async fn logout(&self, token: &str, metadata: &RequestMetadata) -> Outcome<bool> {
        self.guard("logout", metadata, Identity::default(), async {
            let claims = self.live_claims(token)?;
            let deleted = self
                .sessions
                .delete_by_id(&claims.session_id)
                .await
                .into_result()
                .map_err(|e| StepError::from(e).with_identity(Identity::from(&claims)))?;

            info!(session_id = %claims.session_id, username = %claims.username, "logged out");
            Ok(deleted)
        })
        .await
    }

    /// Hash the password and store a new user
    pub async fn register(
        &self,
        new_user: &NewUser,
        metadata: &RequestMetadata,
    ) -> Outcome<UserProfile> {
        let identity = Identity::username(&new_user.username);
        self.guard("register", metadata, identity.clone(), async {
            self.try_register(new_user)
                .await
                .map(Some)
                .map_err(|e| StepError::from(e).with_identity(identity.clone()))
        })
        .await
    }

    pub async fn username_exists(
        &self,
        username: &str,
        metadata: &RequestMetadata,
    ) -> Outcome<bool> {
        let identity = Identity::username(username);
        self.user_with("username_exists", "username", username, identity, metadata)
            .await
    }

    pub async fn email_exists(&self, email: &str, metadata: &RequestMetadata) -> Outcome<bool> {
        self.user_with("email_exists", "email", email, Identity::default(), metadata)
            .await
    }

    /// `Value(true)` when exactly one user has `field == value`
    async fn user_with(
        &self,
        operation: &'static str,
        field: &str,
        value: &str,
        identity: Identity,
        metadata: &RequestMetadata,
    ) -> Outcome<bool> {
        self.guard(operation, metadata, identity.clone(), async {
            self.users
                .get_by_filter(&Filter::new().eq(field, value), &FindOptions::default())
                .await
                .into_result()
                .map(|user| Some(user.is_some()))
                .map_err(|e| StepError::from(e).with_identity(identity.clone()))
        })
        .await
    }

    async fn try_login(
        &self,
        username: &str,
        password: &str,
        metadata: &RequestMetadata,
    ) -> Result<LoginGrant, ErrorRecord> {
        let user = self
            .users
            .get_by_filter(&Filter::new().eq("username", username), &FindOptions::default())
            .await
            .require(|| ErrorRecord::new(ErrorKind::Auth, format!("user {username} not found")))?;

        let matches = self
            .hasher
            .compare(&user.password, password)
            .await
            .require(|| ErrorRecord::new(ErrorKind::Auth, "invalid credentials"))?;
        if !matches {
            return Err(ErrorRecord::new(ErrorKind::Auth, "invalid credentials"));
        }

        let session = self
            .sessions
            .create(&NewSession::for_user(&user, metadata, self.sessions.ttl()))
            .await
            .require(|| ErrorRecord::new(ErrorKind::Database, "session was not created"))?;

        match self.activate_session(&user, &session.session_id, metadata).await {
            Ok(token) => {
                info!(username = %user.username, session_id = %session.session_id, "logged in");
                Ok(LoginGrant {
                    user: user.into(),
                    token,
                    session_id: session.session_id,
                })
            }
            Err(record) => {
                // do not leave a session behind that no token can reach
                let cleanup = self.sessions.delete_by_id(&session.session_id).await;
                if let Outcome::Failure(cleanup) = cleanup {
                    warn!(
                        session_id = %session.session_id,
                        error = %cleanup,
                        "orphaned session not removed"
                    );
                }
                Err(record)
            }
        }
    }

    async fn activate_session(
        &self,
        user: &User,
        session_id: &str,
        metadata: &RequestMetadata,
    ) -> Result<String, ErrorRecord> {
        let token = self
            .tokens
            .sign(&TokenPayload::for_session(user, session_id))
            .require(|| ErrorRecord::new(ErrorKind::TokenSignature, "no token was signed"))?;

        self.sessions
            .update_by_id(
                session_id,
                &SessionPatch::token(token.clone()).with_metadata(metadata),
            )
            .await
            .require(|| ErrorRecord::new(ErrorKind::NotFound, "session vanished during login"))?;

        Ok(token)
    }

    /// Verify then decode; expiry is tolerated, forgery is not
    fn vetted_claims(&self, token: &str) -> StepResult<TokenClaims> {
        if let Outcome::Failure(record) = self.tokens.verify(token) {
            return Err(record.into());
        }
        Ok(self
            .tokens
            .decode(token)
            .require(|| ErrorRecord::new(ErrorKind::TokenDecode, "token carries no claims"))?)
    }

    /// Verify only; an expired token is an `AuthError`
    fn live_claims(&self, token: &str) -> StepResult<TokenClaims> {
        Ok(self
            .tokens
            .verify(token)
            .require(|| ErrorRecord::new(ErrorKind::Auth, "token expired; log in again"))?)
    }

    async fn try_rotate(
        &self,
        incoming: &str,
        claims: &TokenClaims,
    ) -> Result<Rotation, ErrorRecord> {
        let session_id = claims.session_id.as_str();
        let session = self
            .sessions
            .get_by_id(session_id)
            .await
            .require(|| ErrorRecord::new(ErrorKind::NotFound, "session not found; log in again"))?;

        if session.currently_active_token != incoming {
            warn!(
                session_id,
                username = %claims.username,
                security_event = true,
                "superseded token presented, revoking session"
            );
            if let Outcome::Failure(cleanup) = self.sessions.delete_by_id(session_id).await {
                error!(session_id, error = %cleanup, "failed to revoke session");
            }
            return Err(ErrorRecord::new(
                ErrorKind::Auth,
                "superseded token presented; session revoked",
            )
            .flag_security());
        }

        let issued = self
            .tokens
            .issue(&claims.payload())
            .require(|| ErrorRecord::new(ErrorKind::TokenSignature, "no token was signed"))?;

        self.sessions
            .swap_active_token(session_id, incoming, &issued.token)
            .await
            .require(|| {
                ErrorRecord::new(
                    ErrorKind::Conflict,
                    "session token changed concurrently; retry the request",
                )
            })?;

        debug!(session_id, "token rotated");
        Ok(Rotation {
            token: issued.token,
            claims: issued.claims,
        })
    }

    async fn try_register(&self, new_user: &NewUser) -> Result<UserProfile, ErrorRecord> {
        let hashed = self
            .hasher
            .hash(&new_user.password)
            .await
            .require(|| ErrorRecord::new(ErrorKind::HashGeneration, "no hash was produced"))?;

        let user = self
            .users
            .create(&UserSchema {
                username: &new_user.username,
                email: &new_user.email,
                password: &hashed,
                roles: &new_user.roles,
            })
            .await
            .require(|| ErrorRecord::new(ErrorKind::Database, "user was not created"))?;

        info!(username = %user.username, "registered user");
        Ok(user.into())
    }

    /// Entry-point boundary: catch panics, log failures, sanitize the answer
    async fn guard<T, F>(
        &self,
        operation: &'static str,
        metadata: &RequestMetadata,
        identity: Identity,
        step: F,
    ) -> Outcome<T>
    where
        F: Future<Output = StepResult<Option<T>>>,
    {
        let failed = match AssertUnwindSafe(step).catch_unwind().await {
            Ok(Ok(value)) => return Outcome::success(value),
            Ok(Err(failed)) => failed,
            Err(panic) => StepError {
                record: ErrorRecord::from_panic(panic),
                identity,
            },
        };

        let record = failed.record;
        if record.security_event {
            warn!(
                operation,
                name = %record.name,
                message = %record.message,
                security_event = true,
                "request rejected"
            );
        } else {
            debug!(operation, name = %record.name, message = %record.message, "request failed");
        }

        let entry = ErrorLogEntry::new(
            operation,
            &record,
            &failed.identity,
            metadata,
            self.error_log_ttl,
        );
        if let Err(sink_error) = self.sink.record(entry).await {
            warn!(operation, error = %sink_error, "error log sink rejected entry");
        }

        Outcome::failure(record.sanitized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HashConfig, RetryConfig, TokenConfig};
    use crate::repository::tests::FlakyStore;
    use crate::store::{Document, MemoryStore, Patch, StoreError};
    use crate::user::Role;
    use async_trait::async_trait;
    use tokio::sync::{Barrier, Mutex};

    #[derive(Default)]
    struct CapturingSink {
        entries: Mutex<Vec<ErrorLogEntry>>,
    }

    #[async_trait]
    impl ErrorLogSink for CapturingSink {
        async fn record(&self, entry: ErrorLogEntry) -> Result<(), ErrorRecord> {
            self.entries.lock().await.push(entry);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ErrorLogSink for FailingSink {
        async fn record(&self, _entry: ErrorLogEntry) -> Result<(), ErrorRecord> {
            Err(ErrorRecord::new(ErrorKind::Database, "sink down"))
        }
    }

    fn config() -> AuthConfig {
        let token = TokenConfig::new("orchestrator-test-secret")
            .unwrap()
            .with_access_ttl_secs(60);
        AuthConfig::new(token)
            .with_retry(RetryConfig::default().with_base_delay_ms(1))
            .with_hash(HashConfig {
                cost_factor: 1,
                memory_kib: 64,
                parallelism: 1,
            })
    }

    fn metadata() -> RequestMetadata {
        RequestMetadata::new("127.0.0.1", "orchestrator-tests")
    }

    async fn service_with(store: Arc<dyn DocumentStore>) -> (AuthService, Arc<CapturingSink>) {
        let sink = Arc::new(CapturingSink::default());
        let service = AuthService::new(store, config(), sink.clone());
        let registered = service
            .register(
                &NewUser {
                    username: "alice".to_string(),
                    email: "alice@example.com".to_string(),
                    password: "Secr3t!".to_string(),
                    roles: vec![Role::Employee],
                },
                &metadata(),
            )
            .await;
        assert!(registered.is_value());
        (service, sink)
    }

    async fn service() -> (AuthService, Arc<CapturingSink>) {
        service_with(Arc::new(MemoryStore::new())).await
    }

    #[tokio::test]
    async fn test_login_binds_session_to_token() {
        let (service, _) = service().await;
        let grant = service.login("alice", "Secr3t!", &metadata()).await.value().unwrap();

        assert_eq!(grant.user.username, "alice");
        let session = service.sessions().get_by_id(&grant.session_id).await.value().unwrap();
        assert_eq!(session.currently_active_token, grant.token);
        assert_eq!(session.address_ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_login_unknown_user_is_unauthorized() {
        let (service, sink) = service().await;
        let outcome = service.login("bob", "whatever", &metadata()).await;

        let record = outcome.as_failure().unwrap();
        assert_eq!(record.kind, ErrorKind::Auth);
        assert_eq!(record.message, "Unauthorized");
        let entries = sink.entries.lock().await;
        assert_eq!(entries[0].username, "bob");
        assert_eq!(entries[0].message, "user bob not found");
    }

    #[tokio::test]
    async fn test_login_wrong_password_is_auth_failure() {
        let (service, _) = service().await;
        let outcome = service.login("alice", "wrong", &metadata()).await;
        assert_eq!(outcome.as_failure().map(|r| r.kind), Some(ErrorKind::Auth));
    }

    #[tokio::test]
    async fn test_rotation_retires_previous_token() {
        let (service, sink) = service().await;
        let grant = service.login("alice", "Secr3t!", &metadata()).await.value().unwrap();

        let rotation = service.rotate(&grant.token, &metadata()).await.value().unwrap();
        assert_ne!(rotation.token, grant.token);
        assert_eq!(rotation.claims.session_id, grant.session_id);

        let replay = service.rotate(&grant.token, &metadata()).await;
        assert_eq!(replay.as_failure().map(|r| r.kind), Some(ErrorKind::Auth));
        assert!(service.sessions().get_by_id(&grant.session_id).await.is_empty());

        let entries = sink.entries.lock().await;
        let revoked = entries.last().unwrap();
        assert!(revoked.security_event);
        assert_eq!(revoked.session_id, grant.session_id);

        // the replay also killed the freshest token
        drop(entries);
        let after = service.rotate(&rotation.token, &metadata()).await;
        assert_eq!(after.as_failure().map(|r| r.kind), Some(ErrorKind::NotFound));
    }

    /// Replace the session's active token with an already expired one
    async fn expire_active_token(service: &AuthService, grant: &LoginGrant) -> String {
        let mut claims = service.tokens().decode(&grant.token).value().unwrap();
        claims.iat -= 600;
        claims.exp -= 600;
        let expired = service.tokens().sign_claims(&claims).value().unwrap();
        service
            .sessions()
            .swap_active_token(&grant.session_id, &grant.token, &expired)
            .await
            .value()
            .unwrap();
        assert!(service.tokens().verify(&expired).is_empty());
        expired
    }

    #[tokio::test]
    async fn test_rotation_accepts_expired_active_token() {
        let (service, _) = service().await;
        let grant = service.login("alice", "Secr3t!", &metadata()).await.value().unwrap();
        let expired = expire_active_token(&service, &grant).await;

        let rotation = service.rotate(&expired, &metadata()).await.value().unwrap();
        assert!(service.tokens().verify(&rotation.token).is_value());
    }

    #[tokio::test]
    async fn test_rotation_rejects_forged_token() {
        let (service, sink) = service().await;
        let grant = service.login("alice", "Secr3t!", &metadata()).await.value().unwrap();

        let other = TokenCodec::new(&TokenConfig::new("someone-else").unwrap());
        let forged = other
            .sign(&service.tokens().decode(&grant.token).value().unwrap().payload())
            .value()
            .unwrap();

        let outcome = service.rotate(&forged, &metadata()).await;
        assert_eq!(
            outcome.as_failure().map(|r| r.kind),
            Some(ErrorKind::TokenVerification)
        );
        // forged tokens never touch the session
        assert!(service.sessions().get_by_id(&grant.session_id).await.is_value());
        assert_eq!(sink.entries.lock().await.last().unwrap().name, "TokenVerificationError");
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (service, _) = service().await;
        let grant = service.login("alice", "Secr3t!", &metadata()).await.value().unwrap();

        assert_eq!(service.logout(&grant.token, &metadata()).await, Outcome::Value(true));
        assert!(service.logout(&grant.token, &metadata()).await.is_empty());

        let after = service.rotate(&grant.token, &metadata()).await;
        assert_eq!(after.as_failure().map(|r| r.kind), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_logout_rejects_expired_token() {
        let (service, sink) = service().await;
        let grant = service.login("alice", "Secr3t!", &metadata()).await.value().unwrap();
        let expired = expire_active_token(&service, &grant).await;

        let outcome = service.logout(&expired, &metadata()).await;
        assert_eq!(outcome.as_failure().map(|r| r.kind), Some(ErrorKind::Auth));
        assert!(service.sessions().get_by_id(&grant.session_id).await.is_value());
        assert_eq!(sink.entries.lock().await.last().unwrap().operation, "logout");
    }

    #[tokio::test]
    async fn test_username_and_email_exist() {
        let (service, _) = service().await;
        let meta = metadata();
        assert_eq!(service.username_exists("alice", &meta).await, Outcome::Value(true));
        assert_eq!(service.username_exists("bob", &meta).await, Outcome::Value(false));
        assert_eq!(service.email_exists("alice@example.com", &meta).await, Outcome::Value(true));
        assert_eq!(service.email_exists("bob@example.com", &meta).await, Outcome::Value(false));
    }

    #[tokio::test]
    async fn test_failures_are_sanitized_and_logged() {
        let store = Arc::new(FlakyStore::always_failing());
        let sink = Arc::new(CapturingSink::default());
        let service = AuthService::new(store, config(), sink.clone());

        let outcome = service.login("alice", "Secr3t!", &metadata()).await;
        let record = outcome.as_failure().unwrap();
        assert_eq!(record.kind, ErrorKind::RetryLimitExceeded);
        assert!(record.original.is_none());
        assert!(record.stack.is_none());

        let entries = sink.entries.lock().await;
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].original.is_empty());
        assert_eq!(entries[0].operation, "login");
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_change_outcome() {
        let store = Arc::new(MemoryStore::new());
        let service = AuthService::new(store, config(), Arc::new(FailingSink));
        let outcome = service.login("nobody", "x", &metadata()).await;
        assert_eq!(outcome.as_failure().map(|r| r.kind), Some(ErrorKind::Auth));
    }

    #[tokio::test]
    async fn test_panics_become_failures() {
        let (service, sink) = service().await;
        async fn explode() -> StepResult<Option<()>> {
            panic!("resolver bug")
        }

        let outcome = service
            .guard("explode", &metadata(), Identity::username("alice"), explode())
            .await;

        assert_eq!(outcome.as_failure().map(|r| r.kind), Some(ErrorKind::Unknown));
        let entries = sink.entries.lock().await;
        assert_eq!(entries.last().unwrap().message, "resolver bug");
        assert_eq!(entries.last().unwrap().username, "alice");
    }

    /// Memory store that can stall or reject operations on the sessions collection
    #[derive(Default)]
    struct SessionInterceptor {
        inner: MemoryStore,
        /// Session reads wait here until two readers have arrived
        read_barrier: Option<Barrier>,
        reject_updates: bool,
    }

    impl SessionInterceptor {
        fn targets(collection: &str) -> bool {
            collection == "auth_sessions"
        }
    }

    #[async_trait]
    impl DocumentStore for SessionInterceptor {
        async fn find_by_id(
            &self,
            collection: &str,
            id: &str,
        ) -> Result<Option<Document>, StoreError> {
            let found = self.inner.find_by_id(collection, id).await;
            if let Some(barrier) = &self.read_barrier {
                if Self::targets(collection) {
                    barrier.wait().await;
                }
            }
            found
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Filter,
            options: &FindOptions,
        ) -> Result<Vec<Document>, StoreError> {
            self.inner.find(collection, filter, options).await
        }

        async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
            self.inner.count(collection, filter).await
        }

        async fn insert(
            &self,
            collection: &str,
            document: Document,
        ) -> Result<Document, StoreError> {
            self.inner.insert(collection, document).await
        }

        async fn update_by_id(
            &self,
            collection: &str,
            id: &str,
            patch: &Patch,
        ) -> Result<Option<Document>, StoreError> {
            if self.reject_updates && Self::targets(collection) {
                return Err(StoreError::InvalidDocument("session write rejected".to_string()));
            }
            self.inner.update_by_id(collection, id, patch).await
        }

        async fn update_one_where(
            &self,
            collection: &str,
            id: &str,
            condition: &Filter,
            patch: &Patch,
        ) -> Result<Option<Document>, StoreError> {
            self.inner.update_one_where(collection, id, condition, patch).await
        }

        async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_by_id(collection, id).await
        }

        async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
            self.inner.delete_many(collection, filter).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_rotation_has_single_winner() {
        let store = Arc::new(SessionInterceptor {
            read_barrier: Some(Barrier::new(2)),
            ..SessionInterceptor::default()
        });
        // login reads no sessions, so the gate only affects the rotations
        let (service, _) = service_with(store.clone()).await;
        let grant = service.login("alice", "Secr3t!", &metadata()).await.value().unwrap();

        let meta = metadata();
        let (first, second) = tokio::join!(
            service.rotate(&grant.token, &meta),
            service.rotate(&grant.token, &meta)
        );

        let winners: Vec<&Rotation> = [&first, &second]
            .into_iter()
            .filter_map(|outcome| match outcome {
                Outcome::Value(rotation) => Some(rotation),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1);

        let loser = if first.is_value() { &second } else { &first };
        assert_eq!(loser.as_failure().map(|r| r.kind), Some(ErrorKind::Conflict));

        let session = store
            .inner
            .find_by_id("auth_sessions", &grant.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session["currentlyActiveToken"], winners[0].token.as_str());
    }

    #[tokio::test]
    async fn test_failed_activation_removes_session() {
        let store = Arc::new(SessionInterceptor {
            reject_updates: true,
            ..SessionInterceptor::default()
        });
        let (service, sink) = service_with(store.clone()).await;

        let outcome = service.login("alice", "Secr3t!", &metadata()).await;
        assert_eq!(
            outcome.as_failure().map(|r| r.kind),
            Some(ErrorKind::RetryLimitExceeded)
        );

        let remaining = store
            .inner
            .find("auth_sessions", &Filter::new(), &FindOptions::default())
            .await
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(sink.entries.lock().await.last().unwrap().username, "alice");
    }
}
