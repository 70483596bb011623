//! End-to-end authorization tests
//!
//! Bearer verification against the mock issuer's JWKS, the tenant context it
//! yields, and tenant-scoped credential derivation.

mod common;

use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{
    ROLE_ARN, app, claims, config, get, get_with_token, post_with_token, send, sign, sign_with,
    spawn_idp,
};
use mcp_authz::tenant::{SessionTag, TENANT_TAG_KEY};

const METADATA_URL: &str = "https://api.x.com/.well-known/oauth-protected-resource";

/// Missing credentials get a challenge pointing at the resource metadata
#[tokio::test]
async fn test_missing_token_is_challenged() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));

    let response = send(&app, get("/whoami")).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.header(header::WWW_AUTHENTICATE),
        Some(format!(r#"Bearer resource_metadata="{METADATA_URL}""#).as_str())
    );
    assert_eq!(response.body["error"], "missing_credential");
    assert_eq!(response.body["resource_metadata"], METADATA_URL);
}

/// A non-Bearer scheme is an invalid request
#[tokio::test]
async fn test_basic_scheme_is_invalid_request() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));

    let request = Request::builder()
        .uri("/whoami")
        .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["error"], "invalid_format");
    assert!(
        response
            .header(header::WWW_AUTHENTICATE)
            .is_some_and(|h| h.contains(r#"error="invalid_request""#))
    );
}

/// A valid token yields the tenant context from its claims
#[tokio::test]
async fn test_valid_token_yields_tenant_context() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));
    let token = sign(&claims(&idp.base));

    let response = send(&app, get_with_token("/whoami", &token)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.body,
        json!({
            "tenant_id": "acme",
            "tenant_tier": "premium",
            "user_id": "user-1",
            "scopes": ["email", "openid"],
            "state": "authorized",
        })
    );
}

/// Signing keys are fetched once and then served from cache
#[tokio::test]
async fn test_signing_keys_are_cached() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));
    let token = sign(&claims(&idp.base));

    for _ in 0..3 {
        let response = send(&app, get_with_token("/whoami", &token)).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    assert_eq!(idp.state.jwks_hits.load(Ordering::SeqCst), 1);
}

/// Expired tokens are rejected with an invalid_token challenge
#[tokio::test]
async fn test_expired_token_is_rejected() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));
    let mut expired = claims(&idp.base);
    expired["exp"] = json!(common::now() - 3600);

    let response = send(&app, get_with_token("/whoami", &sign(&expired))).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["error"], "token_expired");
    assert!(
        response
            .header(header::WWW_AUTHENTICATE)
            .is_some_and(|h| h.contains(r#"error="invalid_token""#))
    );
}

/// A token from another issuer is rejected
#[tokio::test]
async fn test_foreign_issuer_is_rejected() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));

    let response = send(
        &app,
        get_with_token("/whoami", &sign(&claims("https://evil.example.com"))),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["error"], "untrusted_issuer");
}

/// An unknown key id triggers one key fetch and is then rejected
#[tokio::test]
async fn test_unknown_key_id_is_rejected() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));

    let response = send(
        &app,
        get_with_token("/whoami", &sign_with("rotated-away", &claims(&idp.base))),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["error"], "unknown_signing_key");
    assert_eq!(idp.state.jwks_hits.load(Ordering::SeqCst), 1);
}

/// An unreachable key set is reported as a backend failure, not a bad token
#[tokio::test]
async fn test_unreachable_jwks_is_backend_unavailable() {
    let idp = spawn_idp().await;
    let mut config = config(&idp);
    config.identity.jwks_uri = Some(format!("{}/missing-jwks", idp.base));
    let app = app(&config);

    let response = send(&app, get_with_token("/whoami", &sign(&claims(&idp.base)))).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["error"], "auth_backend_unavailable");
}

/// Missing required scopes are forbidden, not unauthorized
#[tokio::test]
async fn test_missing_scope_is_forbidden() {
    let idp = spawn_idp().await;
    let mut config = config(&idp);
    config.auth.required_scopes = vec!["mcp:admin".to_string()];
    let app = app(&config);

    let response = send(&app, get_with_token("/whoami", &sign(&claims(&idp.base)))).await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.body["error"], "insufficient_scope");
    assert!(
        response
            .header(header::WWW_AUTHENTICATE)
            .is_some_and(|h| h.contains(r#"scope="mcp:admin""#))
    );
}

/// Credentials are always tagged with the token's tenant, whatever the path says
#[tokio::test]
async fn test_credentials_are_tagged_with_token_tenant() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));
    let token = sign(&claims(&idp.base));

    let response = send(&app, post_with_token("/tenants/globex/credentials", &token)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header(header::CACHE_CONTROL), Some("no-store"));
    assert_eq!(response.body["tenant_id"], "acme");
    assert_eq!(response.body["session_name"], "tenant-acme-user-1");
    assert_eq!(response.body["state"], "credentialed");
    assert_eq!(response.body["credentials"]["access_key_id"], "ASIATESTKEY");
    assert!(response.body["credentials"]["expiration"].is_string());

    let assumed = idp.state.assumed.lock();
    assert_eq!(assumed.len(), 1);
    assert_eq!(assumed[0].role_arn, ROLE_ARN);
    assert_eq!(assumed[0].duration_seconds, 900);
    assert_eq!(
        assumed[0].tags,
        vec![SessionTag {
            key: TENANT_TAG_KEY.to_string(),
            value: "acme".to_string(),
        }]
    );
}

/// Role service failures surface as one generic message
#[tokio::test]
async fn test_credential_failure_is_generic() {
    let idp = spawn_idp().await;
    idp.state.broker_down.store(true, Ordering::SeqCst);
    let app = app(&config(&idp));
    let token = sign(&claims(&idp.base));

    let response = send(&app, post_with_token("/tenants/acme/credentials", &token)).await;

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.body,
        json!({
            "error": "credential_derivation_failed",
            "error_description": "credential derivation failed",
        })
    );
}

/// Without a role to assume derivation fails closed
#[tokio::test]
async fn test_credentials_unconfigured_fail_closed() {
    let idp = spawn_idp().await;
    let mut config = config(&idp);
    config.credentials.role_arn = None;
    let app = app(&config);
    let token = sign(&claims(&idp.base));

    let response = send(&app, post_with_token("/tenants/acme/credentials", &token)).await;

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body["error"], "credential_derivation_failed");
    assert!(idp.state.assumed.lock().is_empty());
}

/// The credentials route never runs without a verified token
#[tokio::test]
async fn test_credentials_require_token() {
    let idp = spawn_idp().await;
    let app = app(&config(&idp));

    let request = Request::builder()
        .method("POST")
        .uri("/tenants/acme/credentials")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert!(idp.state.assumed.lock().is_empty());
}
