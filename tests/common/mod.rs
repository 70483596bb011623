//! Shared integration test harness
//!
//! [`spawn_idp`] serves a loopback identity provider with the four upstream
//! surfaces the server talks to:
//!
//! - `GET  /.well-known/jwks.json`
//! - `GET  /.well-known/openid-configuration`
//! - `POST /clients`, `GET /clients/{id}`, `PUT /clients/{id}/branding`
//! - `POST /assume`

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{self, post, put},
};
use dashmap::DashMap;
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use mcp_authz::config::Config;
use mcp_authz::server::{AppState, create_router};
use mcp_authz::tenant::AssumeRoleRequest;

pub const KID: &str = "test-key-1";
pub const RESOURCE_URL: &str = "https://api.x.com";
pub const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/tenant-access";

const PRIVATE_KEY: &[u8] = include_bytes!("../fixtures/rsa_private.pem");
const PUBLIC_JWK: &str = include_str!("../fixtures/rsa_public.jwk.json");

/// Observable state of the mock identity provider
#[derive(Default)]
pub struct IdpState {
    pub jwks_hits: AtomicUsize,
    pub metadata_hits: AtomicUsize,
    pub clients: DashMap<String, Value>,
    pub branded: DashMap<String, String>,
    pub assumed: Mutex<Vec<AssumeRoleRequest>>,
    pub broker_down: AtomicBool,
    next_client: AtomicUsize,
}

/// A running mock identity provider
pub struct MockIdp {
    pub base: String,
    pub state: Arc<IdpState>,
}

pub async fn spawn_idp() -> MockIdp {
    let state = Arc::new(IdpState::default());
    let app = Router::new()
        .route("/.well-known/jwks.json", routing::get(jwks))
        .route("/.well-known/openid-configuration", routing::get(openid_configuration))
        .route("/clients", post(create_client))
        .route("/clients/{id}", routing::get(describe_client))
        .route("/clients/{id}/branding", put(brand_client))
        .route("/assume", post(assume_role))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockIdp {
        base: format!("http://{addr}"),
        state,
    }
}

async fn jwks(State(state): State<Arc<IdpState>>) -> Response {
    state.jwks_hits.fetch_add(1, Ordering::SeqCst);
    let keys: Value = serde_json::from_str(PUBLIC_JWK).unwrap();
    Json(json!({ "keys": [keys] })).into_response()
}

async fn openid_configuration(State(state): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    state.metadata_hits.fetch_add(1, Ordering::SeqCst);
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let issuer = format!("http://{host}");
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/oauth2/authorize"),
            "token_endpoint": format!("{issuer}/oauth2/token"),
            "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
            "response_types_supported": ["code"],
        })),
    )
        .into_response()
}

async fn create_client(
    State(state): State<Arc<IdpState>>,
    Json(metadata): Json<Value>,
) -> Response {
    let n = state.next_client.fetch_add(1, Ordering::SeqCst) + 1;
    let client_id = format!("client-{n}");
    let record = json!({
        "client_id": client_id,
        "client_id_issued_at": 1_700_000_000 + i64::try_from(n).unwrap(),
        "client_name": metadata["client_name"],
        "redirect_uris": metadata["redirect_uris"],
        "grant_types": metadata["grant_types"],
        "response_types": metadata["response_types"],
    });
    state.clients.insert(client_id, record.clone());
    (StatusCode::CREATED, Json(record)).into_response()
}

async fn describe_client(State(state): State<Arc<IdpState>>, Path(id): Path<String>) -> Response {
    match state.clients.get(&id) {
        Some(record) => Json(record.value().clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn brand_client(
    State(state): State<Arc<IdpState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let name = body["client_name"].as_str().unwrap_or_default().to_string();
    state.branded.insert(id, name);
    StatusCode::NO_CONTENT
}

async fn assume_role(
    State(state): State<Arc<IdpState>>,
    Json(request): Json<AssumeRoleRequest>,
) -> Response {
    if state.broker_down.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "broker down: secret internal detail",
        )
            .into_response();
    }
    state.assumed.lock().push(request);
    let expiration = (chrono::Utc::now() + chrono::Duration::minutes(15)).to_rfc3339();
    Json(json!({
        "Credentials": {
            "AccessKeyId": "ASIATESTKEY",
            "SecretAccessKey": "test-secret",
            "SessionToken": "test-session-token",
            "Expiration": expiration,
        }
    }))
    .into_response()
}

/// Fully configured server pointing at `idp`.
pub fn config(idp: &MockIdp) -> Config {
    let mut config = Config::default();
    config.resource.server_url = Some(RESOURCE_URL.to_string());
    config.identity.user_pool_id = Some("us-east-1_TEST".to_string());
    config.identity.region = Some("us-east-1".to_string());
    config.identity.issuer = Some(idp.base.clone());
    config.registration.admin_url = Some(format!("{}/clients", idp.base));
    config.credentials.broker_url = Some(format!("{}/assume", idp.base));
    config.credentials.role_arn = Some(ROLE_ARN.to_string());
    config.upstream.timeout = Duration::from_secs(5);
    config
}

pub fn app(config: &Config) -> Router {
    create_router(AppState::from_config(config).unwrap())
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Claims for user `user-1` of tenant `acme`.
pub fn claims(issuer: &str) -> Value {
    json!({
        "iss": issuer,
        "sub": "user-1",
        "scope": "openid email",
        "custom:tenantId": "acme",
        "custom:tenantTier": "premium",
        "exp": now() + 3600,
        "iat": now(),
    })
}

pub fn sign_with(kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(PRIVATE_KEY).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

pub fn sign(claims: &Value) -> String {
    sign_with(KID, claims)
}

/// Response status, headers and JSON body (`Null` when empty).
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    TestResponse {
        status,
        headers,
        body,
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}
