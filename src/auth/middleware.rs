//! Bearer authorization middleware for protected routes.
//!
//! Failures are answered without reading the request body:
//!
//! ```text
//! HTTP/1.1 401 Unauthorized
//! WWW-Authenticate: Bearer resource_metadata="https://api.x.com/.well-known/oauth-protected-resource", error="invalid_token", error_description="..."
//!
//! {"error":"token_expired","error_description":"...","resource_metadata":"https://..."}
//! ```
//!
//! On success the request carries a [`TenantContext`] and
//! [`AuthState::Authorized`] in its extensions.

use std::sync::Arc;

use authz_wire::ErrorBody;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, warn};

use super::verifier::{TokenVerifier, VerifyError};
use crate::audit::{self, AuditEvent};
use crate::error::HttpError;
use crate::tenant::{AuthEvent, AuthState, TenantContext};

/// Authentication or authorization failure on a protected route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header
    #[error("missing credential")]
    MissingCredential,

    /// Header present but not `Bearer <token>`
    #[error("invalid authorization header format")]
    InvalidFormat,

    /// `Bearer` with nothing after it
    #[error("empty bearer token")]
    EmptyToken,

    /// Token failed verification
    #[error(transparent)]
    Token(#[from] VerifyError),

    /// Token lacks required scopes
    #[error("insufficient scope")]
    InsufficientScope(Vec<String>),
}

impl AuthError {
    /// RFC 6750 error value for the `WWW-Authenticate` challenge
    fn challenge_error(&self) -> Option<&'static str> {
        match self {
            Self::MissingCredential => None,
            Self::InvalidFormat | Self::EmptyToken => Some("invalid_request"),
            Self::Token(_) => Some("invalid_token"),
            Self::InsufficientScope(_) => Some("insufficient_scope"),
        }
    }
}

impl HttpError for AuthError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InsufficientScope(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::InvalidFormat => "invalid_format",
            Self::EmptyToken => "empty_token",
            Self::Token(e) => e.code(),
            Self::InsufficientScope(_) => "insufficient_scope",
        }
    }

    fn description(&self) -> String {
        match self {
            Self::MissingCredential => {
                "Authorization required. Use: Authorization: Bearer <token>".to_string()
            }
            Self::InvalidFormat => "Authorization header must use the Bearer scheme".to_string(),
            Self::EmptyToken => "Bearer token is empty".to_string(),
            Self::Token(e) => e.description().to_string(),
            Self::InsufficientScope(missing) => {
                format!("Token lacks required scopes: {}", missing.join(" "))
            }
        }
    }
}

/// Shared state for [`authorize`].
pub struct AuthGuard {
    verifier: Arc<TokenVerifier>,
    resource_metadata_url: String,
    required_scopes: Vec<String>,
}

impl AuthGuard {
    /// Create a guard advertising `resource_metadata_url` in challenges.
    #[must_use]
    pub fn new(
        verifier: Arc<TokenVerifier>,
        resource_metadata_url: impl Into<String>,
        required_scopes: Vec<String>,
    ) -> Self {
        Self {
            verifier,
            resource_metadata_url: resource_metadata_url.into(),
            required_scopes,
        }
    }

    /// Authenticate request headers into a tenant context.
    ///
    /// # Errors
    ///
    /// [`AuthError`] describing the first check that failed.
    pub async fn check(&self, headers: &HeaderMap) -> Result<TenantContext, AuthError> {
        let token = bearer_token(headers)?;
        let claims = self.verifier.verify(token).await?;
        let ctx = TenantContext::from(&claims);

        let missing = ctx.missing_scopes(&self.required_scopes);
        if !missing.is_empty() {
            return Err(AuthError::InsufficientScope(missing));
        }

        Ok(ctx)
    }

    /// Build the failure response for `err`.
    #[must_use]
    pub fn reject(&self, err: &AuthError) -> Response {
        #[derive(Serialize)]
        struct RejectBody<'a> {
            #[serde(flatten)]
            error: ErrorBody,
            resource_metadata: &'a str,
        }

        let description = err.description();
        let mut challenge = format!(r#"Bearer resource_metadata="{}""#, self.resource_metadata_url);
        if let Some(code) = err.challenge_error() {
            challenge.push_str(&format!(
                r#", error="{code}", error_description="{}""#,
                description.replace('"', "'")
            ));
        }
        if let AuthError::InsufficientScope(_) = err {
            challenge.push_str(&format!(r#", scope="{}""#, self.required_scopes.join(" ")));
        }

        let body = RejectBody {
            error: ErrorBody::new(err.code(), description),
            resource_metadata: &self.resource_metadata_url,
        };

        let mut response = (err.status(), Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
///
/// The scheme is matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingCredential)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;

    let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidFormat);
    }

    let token = rest.trim();
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    if token.contains(char::is_whitespace) {
        return Err(AuthError::InvalidFormat);
    }
    Ok(token)
}

/// axum middleware guarding protected routes.
pub async fn authorize(
    State(guard): State<Arc<AuthGuard>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let mut state = AuthState::Unauthenticated;
    if bearer_token(request.headers()).is_ok() {
        state = state.next(AuthEvent::TokenPresented).unwrap_or(state);
    }

    let err = match guard.check(request.headers()).await {
        Ok(ctx) => match state.next(AuthEvent::Verified) {
            Ok(state) => {
                debug!(tenant = %ctx.tenant_id, user = %ctx.user_id, %state, path = %path, "Authorized request");
                audit::emit(&AuditEvent::authorized(&ctx, &path));
                request.extensions_mut().insert(ctx);
                request.extensions_mut().insert(state);
                return next.run(request).await;
            }
            Err(e) => {
                warn!(error = %e, path = %path, "Verified without a presented token");
                AuthError::MissingCredential
            }
        },
        Err(err) => err,
    };

    let state = state.next(AuthEvent::Failed).unwrap_or(AuthState::Rejected);
    warn!(code = err.code(), %state, path = %path, "Rejected request");
    audit::emit(&AuditEvent::rejected(err.code(), &path));
    guard.reject(&err)
}
