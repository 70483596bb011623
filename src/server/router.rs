//! HTTP router
//!
//! Public discovery and registration routes sit beside the protected routes;
//! only the latter run through the bearer guard.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use super::AppState;
use crate::audit::{self, AuditEvent};
use crate::auth::authorize;
use crate::error::{HttpError, no_store};
use crate::oauth::discovery::metadata_handler;
use crate::oauth::registration::{method_not_allowed, register_handler};
use crate::oauth::resource::resource_metadata_handler;
use crate::tenant::{
    AuthEvent, AuthState, TemporaryCredential, TenantContext, TenantCredentialDeriver, session_name,
};

/// Path of the protected resource metadata document.
pub const RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

/// Create the router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/whoami", get(whoami_handler))
        .route("/tenants/{tenant_id}/credentials", post(credentials_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.guard),
            authorize,
        ));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route(RESOURCE_METADATA_PATH, get(resource_metadata_handler));

    let resource_path = state.resource_path.trim_end_matches('/');
    if resource_path.starts_with('/') {
        router = router.route(
            &format!("{RESOURCE_METADATA_PATH}{resource_path}"),
            get(resource_metadata_handler),
        );
    }

    router
        .route("/.well-known/oauth-authorization-server", get(metadata_handler))
        .route("/.well-known/openid-configuration", get(metadata_handler))
        .route("/register", post(register_handler).fallback(method_not_allowed))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(state.max_body_size))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Identity of the caller as established by the guard
async fn whoami_handler(
    Extension(ctx): Extension<TenantContext>,
    Extension(state): Extension<AuthState>,
) -> Response {
    no_store(
        Json(json!({
            "tenant_id": ctx.tenant_id,
            "tenant_tier": ctx.tenant_tier,
            "user_id": ctx.user_id,
            "scopes": ctx.scopes,
            "state": state,
        }))
        .into_response(),
    )
}

#[derive(Serialize)]
struct CredentialsBody {
    tenant_id: String,
    session_name: String,
    state: AuthState,
    credentials: TemporaryCredential,
}

/// Derive credentials for the caller's tenant.
///
/// The tenant always comes from the verified token; the path segment is only
/// compared against it.
async fn credentials_handler(
    State(deriver): State<Arc<TenantCredentialDeriver>>,
    Path(requested): Path<String>,
    Extension(ctx): Extension<TenantContext>,
    Extension(state): Extension<AuthState>,
) -> Response {
    if requested != ctx.tenant_id {
        warn!(
            requested = %requested,
            tenant = %ctx.tenant_id,
            "Path tenant differs from token tenant; using token tenant"
        );
    }

    match deriver.derive(&ctx).await {
        Ok(credentials) => {
            let session = session_name(&ctx);
            let state = state.next(AuthEvent::CredentialsIssued).unwrap_or(state);
            info!(tenant = %ctx.tenant_id, %state, session = %session, "Issued tenant credentials");
            audit::emit(&AuditEvent::credentials_issued(&ctx, &session));
            no_store(
                Json(CredentialsBody {
                    tenant_id: ctx.tenant_id,
                    session_name: session,
                    state,
                    credentials,
                })
                .into_response(),
            )
        }
        Err(err) => {
            let state = state.next(AuthEvent::CredentialsFailed).unwrap_or(state);
            warn!(tenant = %ctx.tenant_id, %state, error = %err, "Credential derivation failed");
            audit::emit(&AuditEvent::credentials_failed(&ctx, err.to_string()));
            no_store(err.to_response())
        }
    }
}
