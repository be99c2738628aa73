//! GraphQL adapter: token rotation in the axum handler, context extraction and
//! resolvers for the auth entry points
//!
//! Every request that carries a bearer token has it rotated before the query
//! runs. Resolvers see the fresh token and its claims through
//! [`RequestContext`]; the client receives the fresh token in the
//! `x-access-token` response header.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_graphql::{
    Context, ErrorExtensions, InputObject, Object, Pos, Request, Response, Scalar, ScalarType,
    Schema, SimpleObject, Value,
};
use axum::{
    extract::Extension,
    http::{header, HeaderMap, HeaderValue},
    Json,
};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{ErrorKind, ErrorRecord};
use crate::orchestrator::{AuthService, LoginGrant};
use crate::outcome::Outcome;
use crate::session::RequestMetadata;
use crate::token::TokenClaims;
use crate::user::{NewUser, Role, UserProfile};

/// Response header carrying the rotated token
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Headers never copied into request metadata
const REDACTED_HEADERS: [&str; 2] = ["authorization", "cookie"];

/// Timestamp scalar (RFC 3339)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub DateTime<Utc>);

#[Scalar]
impl ScalarType for Timestamp {
    fn parse(value: Value) -> async_graphql::InputValueResult<Self> {
        if let Value::String(s) = value {
            Ok(Timestamp(
                DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| format!("Invalid Timestamp: {}", e))?
                    .with_timezone(&Utc),
            ))
        } else {
            Err("Expected string for Timestamp".into())
        }
    }

    fn to_value(&self) -> Value {
        Value::String(self.0.to_rfc3339())
    }
}

/// Auth state injected into every GraphQL request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Claims of the rotated token, when the caller presented one
    pub claims: Option<TokenClaims>,
    /// The rotated token, already sent back in the response header
    pub access_token: Option<String>,
    pub metadata: RequestMetadata,
}

/// Extract the token from an `Authorization: Bearer` header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Caller address, user agent and a redacted copy of the headers
pub fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let ip = header_str("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next())
        .or_else(|| header_str("x-real-ip"))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string);

    let visible: BTreeMap<&str, &str> = headers
        .iter()
        .filter(|(name, _)| !REDACTED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect();

    RequestMetadata {
        ip,
        user_agent: header_str(header::USER_AGENT.as_str()).map(str::to_string),
        headers: serde_json::to_string(&visible).ok(),
    }
}

/// Client-facing GraphQL error: sanitized message plus `code` and `statusCode`
pub fn graphql_error(record: &ErrorRecord) -> async_graphql::Error {
    let sanitized = record.sanitized();
    async_graphql::Error::new(sanitized.message.clone()).extend_with(|_, e| {
        e.set("code", sanitized.name.clone());
        e.set("statusCode", i32::from(sanitized.status_code()));
    })
}

/// GraphQL handler that rotates the caller's token before executing
///
/// # Example
///
/// ```rust,no_run
/// use axum::{Router, routing::post};
/// use pleme_auth_helpers::graphql::{graphql_handler, AuthMutation, AuthQuery};
/// use async_graphql::EmptySubscription;
///
/// let app: Router = Router::new()
///     .route("/graphql", post(graphql_handler::<AuthQuery, AuthMutation, EmptySubscription>));
/// ```
pub async fn graphql_handler<Query, Mutation, Subscription>(
    Extension(schema): Extension<Schema<Query, Mutation, Subscription>>,
    Extension(auth): Extension<Arc<AuthService>>,
    headers: HeaderMap,
    req: Json<Request>,
) -> (HeaderMap, Json<Response>)
where
    Query: async_graphql::ObjectType + 'static,
    Mutation: async_graphql::ObjectType + 'static,
    Subscription: async_graphql::SubscriptionType + 'static,
{
    let metadata = request_metadata(&headers);
    let mut response_headers = HeaderMap::new();
    let mut context = RequestContext {
        metadata,
        ..RequestContext::default()
    };

    if let Some(token) = extract_bearer_token(&headers) {
        match auth.rotate(&token, &context.metadata).await {
            Outcome::Value(rotation) => {
                if let Ok(value) = HeaderValue::from_str(&rotation.token) {
                    response_headers.insert(ACCESS_TOKEN_HEADER, value);
                }
                context.claims = Some(rotation.claims);
                context.access_token = Some(rotation.token);
            }
            Outcome::Empty => {}
            Outcome::Failure(record) => {
                debug!(name = %record.name, "rejecting request with unusable token");
                let error = graphql_error(&record).into_server_error(Pos::default());
                return (response_headers, Json(Response::from_errors(vec![error])));
            }
        }
    }

    let request = req.0.data(context).data(auth);
    let response = schema.execute(request).await;

    (response_headers, Json(response))
}

/// Get the [`RequestContext`] from GraphQL context
pub fn get_request_context(ctx: &Context<'_>) -> RequestContext {
    ctx.data_opt::<RequestContext>().cloned().unwrap_or_default()
}

fn auth_service<'a>(ctx: &Context<'a>) -> async_graphql::Result<&'a Arc<AuthService>> {
    ctx.data::<Arc<AuthService>>()
}

fn resolve<T>(outcome: Outcome<T>) -> async_graphql::Result<Option<T>> {
    outcome.into_result().map_err(|record| graphql_error(&record))
}

fn unauthenticated() -> async_graphql::Error {
    graphql_error(&ErrorRecord::new(ErrorKind::Auth, "no access token presented"))
}

#[derive(Debug, Clone, SimpleObject)]
pub struct UserNode {
    pub id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<UserProfile> for UserNode {
    fn from(user: UserProfile) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            roles: user.roles,
            created_at: Timestamp(user.created_at),
            updated_at: Timestamp(user.updated_at),
        }
    }
}

#[derive(Debug, Clone, SimpleObject)]
pub struct LoginPayload {
    pub token: String,
    pub session_id: String,
    pub user: UserNode,
}

impl From<LoginGrant> for LoginPayload {
    fn from(grant: LoginGrant) -> Self {
        Self {
            token: grant.token,
            session_id: grant.session_id,
            user: grant.user.into(),
        }
    }
}

/// Identity behind the current request
#[derive(Debug, Clone, SimpleObject)]
pub struct Viewer {
    pub user_id: String,
    pub username: String,
    pub roles: Vec<Role>,
    pub session_id: String,
}

#[derive(Debug, Clone, InputObject)]
pub struct RegisterUserInput {
    pub username: String,
    pub email: String,
    pub password: String,
    #[graphql(default)]
    pub roles: Vec<Role>,
}

#[derive(Debug, Default)]
pub struct AuthQuery;

#[Object]
impl AuthQuery {
    async fn username_exists(
        &self,
        ctx: &Context<'_>,
        username: String,
    ) -> async_graphql::Result<bool> {
        let metadata = get_request_context(ctx).metadata;
        let exists = resolve(auth_service(ctx)?.username_exists(&username, &metadata).await)?;
        Ok(exists.unwrap_or(false))
    }

    async fn email_exists(&self, ctx: &Context<'_>, email: String) -> async_graphql::Result<bool> {
        let metadata = get_request_context(ctx).metadata;
        let exists = resolve(auth_service(ctx)?.email_exists(&email, &metadata).await)?;
        Ok(exists.unwrap_or(false))
    }

    async fn viewer(&self, ctx: &Context<'_>) -> Option<Viewer> {
        get_request_context(ctx).claims.map(|claims| Viewer {
            user_id: claims.user_id,
            username: claims.username,
            roles: claims.roles,
            session_id: claims.session_id,
        })
    }
}

#[derive(Debug, Default)]
pub struct AuthMutation;

#[Object]
impl AuthMutation {
    async fn login(
        &self,
        ctx: &Context<'_>,
        username: String,
        password: String,
    ) -> async_graphql::Result<LoginPayload> {
        let metadata = get_request_context(ctx).metadata;
        let grant = resolve(auth_service(ctx)?.login(&username, &password, &metadata).await)?;
        grant.map(LoginPayload::from).ok_or_else(unauthenticated)
    }

    /// Ends the caller's session; `false` when it was already gone
    async fn logout(&self, ctx: &Context<'_>) -> async_graphql::Result<bool> {
        let context = get_request_context(ctx);
        let token = context.access_token.ok_or_else(unauthenticated)?;
        let deleted = resolve(auth_service(ctx)?.logout(&token, &context.metadata).await)?;
        Ok(deleted.unwrap_or(false))
    }

    async fn register_user(
        &self,
        ctx: &Context<'_>,
        input: RegisterUserInput,
    ) -> async_graphql::Result<UserNode> {
        let metadata = get_request_context(ctx).metadata;
        let new_user = NewUser {
            username: input.username,
            email: input.email,
            password: input.password,
            roles: input.roles,
        };
        let user = resolve(auth_service(ctx)?.register(&new_user, &metadata).await)?;
        user.map(UserNode::from).ok_or_else(|| {
            graphql_error(&ErrorRecord::new(ErrorKind::Database, "user was not created"))
        })
    }
}
