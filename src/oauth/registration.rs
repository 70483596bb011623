//! Dynamic client registration (RFC 7591) with deduplication.
//!
//! Registrations are keyed by `client_name#base64url(sorted(redirect_uris))`.
//! A repeat of the same name and redirect set replays the existing client
//! instead of creating another upstream public client.
//!
//! Every response from this endpoint carries `Cache-Control: no-store`.

use std::sync::Arc;
use std::time::Duration;

use authz_wire::{ClientRegistrationResponse, PUBLIC_CLIENT_AUTH_METHOD};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::{Host, Url};

use super::index::{ClientIndex, ClientIndexEntry, IndexError};
use super::upstream::{ClientAdmin, ClientAdminError, ClientMetadata, ClientRecord};
use crate::audit::{self, AuditEvent};
use crate::error::{HttpError, error_response, no_store};

const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
const GRANT_REFRESH_TOKEN: &str = "refresh_token";
const RESPONSE_CODE: &str = "code";

/// Request fields a client may not set; they are issued, never echoed.
const ISSUED_FIELDS: [&str; 4] = [
    "client_id",
    "client_id_issued_at",
    "client_secret",
    "client_secret_expires_at",
];

/// One validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// RFC 7591 error code
    pub code: &'static str,
    /// What was wrong, naming the offending value
    pub message: String,
}

impl Violation {
    fn redirect(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_redirect_uri",
            message: message.into(),
        }
    }

    fn metadata(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_client_metadata",
            message: message.into(),
        }
    }
}

/// Registration failure.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// Body is not `application/json`
    #[error("content type must be application/json")]
    UnsupportedContentType,

    /// Body is not a JSON object
    #[error("request body is not a JSON object: {0}")]
    InvalidJson(String),

    /// Client metadata failed validation
    #[error("invalid client metadata")]
    Invalid(Vec<Violation>),

    /// Upstream client admin failed
    #[error(transparent)]
    Upstream(#[from] ClientAdminError),
}

impl HttpError for RegistrationError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedContentType | Self::InvalidJson(_) => "invalid_request",
            Self::Invalid(violations) => violations
                .first()
                .map_or("invalid_client_metadata", |v| v.code),
            Self::Upstream(_) => "server_error",
        }
    }

    fn description(&self) -> String {
        match self {
            Self::UnsupportedContentType => "Content-Type must be application/json".to_string(),
            Self::InvalidJson(_) => "Request body must be a JSON object".to_string(),
            Self::Invalid(violations) => violations
                .iter()
                .map(|v| v.message.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            Self::Upstream(_) => "Client registration failed".to_string(),
        }
    }
}

/// Dedup key for a name and redirect set; independent of redirect order.
#[must_use]
pub fn client_key(client_name: &str, redirect_uris: &[String]) -> String {
    let mut sorted: Vec<&str> = redirect_uris.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!("{client_name}#{}", URL_SAFE_NO_PAD.encode(sorted.join(",")))
}

/// Check one redirect URI: absolute, `https` or loopback `http`, no fragment.
pub fn validate_redirect_uri(value: &str) -> Result<(), Violation> {
    let url = Url::parse(value)
        .map_err(|_| Violation::redirect(format!("redirect URI is not an absolute URI: {value}")))?;

    if url.fragment().is_some() {
        return Err(Violation::redirect(format!(
            "redirect URI must not contain a fragment: {value}"
        )));
    }

    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback(url.host()) => Ok(()),
        _ => Err(Violation::redirect(format!(
            "redirect URI must use https, or http on a loopback host: {value}"
        ))),
    }
}

fn is_loopback(host: Option<Host<&str>>) -> bool {
    match host {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip == std::net::Ipv4Addr::LOCALHOST,
        Some(Host::Ipv6(ip)) => ip == std::net::Ipv6Addr::LOCALHOST,
        None => false,
    }
}

/// Read an optional array-of-strings field.
fn string_list(
    body: &mut Map<String, Value>,
    field: &str,
    default: &str,
    violations: &mut Vec<Violation>,
) -> Vec<String> {
    match body.remove(field) {
        None | Some(Value::Null) => vec![default.to_string()],
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s),
                    other => violations.push(Violation::metadata(format!(
                        "{field} entries must be strings: {other}"
                    ))),
                }
            }
            out
        }
        Some(other) => {
            violations.push(Violation::metadata(format!("{field} must be an array: {other}")));
            Vec::new()
        }
    }
}

/// Validate a registration request into upstream client metadata.
///
/// Every violation is collected. Issued fields are dropped; every other
/// unknown field is kept for pass-through.
///
/// # Errors
///
/// [`RegistrationError::Invalid`] listing every violation.
pub fn validate(
    mut body: Map<String, Value>,
    default_client_name: &str,
) -> Result<ClientMetadata, RegistrationError> {
    let mut violations = Vec::new();

    let redirect_uris = match body.remove("redirect_uris") {
        Some(Value::Array(items)) if !items.is_empty() => {
            let mut uris = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(uri) => {
                        if let Err(v) = validate_redirect_uri(&uri) {
                            violations.push(v);
                        }
                        uris.push(uri);
                    }
                    other => violations.push(Violation::redirect(format!(
                        "redirect URI must be a string: {other}"
                    ))),
                }
            }
            uris
        }
        _ => {
            violations.push(Violation::redirect("redirect_uris must be a non-empty array"));
            Vec::new()
        }
    };

    let grant_types = string_list(
        &mut body,
        "grant_types",
        GRANT_AUTHORIZATION_CODE,
        &mut violations,
    );
    let response_types = string_list(&mut body, "response_types", RESPONSE_CODE, &mut violations);

    for grant in &grant_types {
        if grant != GRANT_AUTHORIZATION_CODE && grant != GRANT_REFRESH_TOKEN {
            violations.push(Violation::metadata(format!("unsupported grant type: {grant}")));
        }
    }
    for response_type in &response_types {
        if response_type != RESPONSE_CODE {
            violations.push(Violation::metadata(format!(
                "unsupported response type: {response_type}"
            )));
        }
    }
    if grant_types.iter().any(|g| g == GRANT_AUTHORIZATION_CODE)
        && !response_types.iter().any(|r| r == RESPONSE_CODE)
    {
        violations.push(Violation::metadata(
            "grant type authorization_code requires response type code",
        ));
    }

    let client_name = match body.remove("client_name") {
        None | Some(Value::Null) => default_client_name.to_string(),
        Some(Value::String(name)) if name.trim().is_empty() => default_client_name.to_string(),
        Some(Value::String(name)) => name,
        Some(other) => {
            violations.push(Violation::metadata(format!("client_name must be a string: {other}")));
            String::new()
        }
    };

    // Forced to "none" regardless of what was asked for
    body.remove("token_endpoint_auth_method");
    for field in ISSUED_FIELDS {
        body.remove(field);
    }

    if !violations.is_empty() {
        return Err(RegistrationError::Invalid(violations));
    }

    Ok(ClientMetadata {
        client_name,
        redirect_uris,
        grant_types,
        response_types,
        token_endpoint_auth_method: PUBLIC_CLIENT_AUTH_METHOD.to_string(),
        extra: body,
    })
}

/// Registers public clients, replaying existing ones for repeat requests.
pub struct DynamicClientRegistrar {
    index: Arc<dyn ClientIndex>,
    admin: Arc<dyn ClientAdmin>,
    default_client_name: String,
    branding: bool,
    timeout: Duration,
}

impl DynamicClientRegistrar {
    /// Create a registrar.
    #[must_use]
    pub fn new(
        index: Arc<dyn ClientIndex>,
        admin: Arc<dyn ClientAdmin>,
        default_client_name: impl Into<String>,
        branding: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            admin,
            default_client_name: default_client_name.into(),
            branding,
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ClientAdminError>>,
    ) -> Result<T, ClientAdminError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ClientAdminError::Timeout)?
    }

    /// Register (or replay) a client from a parsed request body.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Invalid`] for bad metadata,
    /// [`RegistrationError::Upstream`] when the client admin fails.
    pub async fn register(
        &self,
        body: Map<String, Value>,
    ) -> Result<ClientRegistrationResponse, RegistrationError> {
        let metadata = validate(body, &self.default_client_name)?;
        let key = client_key(&metadata.client_name, &metadata.redirect_uris);

        let existing = match tokio::time::timeout(self.timeout, self.index.get(&key))
            .await
            .unwrap_or(Err(IndexError::Timeout))
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Client index read failed, treating as miss");
                None
            }
        };

        if let Some(entry) = existing {
            match self.bounded(self.admin.describe_client(&entry.client_id)).await {
                Ok(record) => {
                    debug!(client_id = %record.client_id, "Replaying existing registration");
                    audit::emit(&AuditEvent::replayed(&record.client_id, &metadata.client_name));
                    return Ok(build_response(record, metadata));
                }
                Err(ClientAdminError::NotFound(id)) => {
                    warn!(client_id = %id, "Indexed client no longer exists upstream, re-creating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let record = self
            .bounded(self.admin.create_public_client(&metadata))
            .await
            .inspect_err(|e| warn!(error = %e, "Upstream client creation failed"))?;
        info!(client_id = %record.client_id, client_name = %metadata.client_name, "Registered client");
        audit::emit(&AuditEvent::registered(&record.client_id, &metadata.client_name));

        if self.branding {
            if let Err(e) = self
                .bounded(self.admin.apply_branding(&record.client_id, &metadata.client_name))
                .await
            {
                warn!(client_id = %record.client_id, error = %e, "Branding failed (ignored)");
            }
        }

        let entry = ClientIndexEntry {
            client_key: key,
            client_id: record.client_id.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = tokio::time::timeout(self.timeout, self.index.put(entry))
            .await
            .unwrap_or(Err(IndexError::Timeout))
        {
            warn!(client_id = %record.client_id, error = %e, "Client index write failed (ignored)");
        }

        Ok(build_response(record, metadata))
    }

    /// Serve `POST /register`.
    pub async fn handle(&self, headers: &HeaderMap, body: &[u8]) -> Response {
        let result = match parse_body(headers, body) {
            Ok(body) => self.register(body).await,
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(registration) => (StatusCode::CREATED, Json(registration)).into_response(),
            Err(e) => {
                debug!(code = e.code(), error = %e, "Registration rejected");
                e.to_response()
            }
        };
        no_store(response)
    }
}

/// Check the content type and parse the body as a JSON object.
fn parse_body(headers: &HeaderMap, body: &[u8]) -> Result<Map<String, Value>, RegistrationError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        return Err(RegistrationError::UnsupportedContentType);
    }

    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RegistrationError::InvalidJson(format!("expected object, got {other}"))),
        Err(e) => Err(RegistrationError::InvalidJson(e.to_string())),
    }
}

fn build_response(record: ClientRecord, metadata: ClientMetadata) -> ClientRegistrationResponse {
    fn or_requested(recorded: Vec<String>, requested: Vec<String>) -> Vec<String> {
        if recorded.is_empty() { requested } else { recorded }
    }

    ClientRegistrationResponse {
        client_id: record.client_id,
        client_id_issued_at: record
            .client_id_issued_at
            .unwrap_or_else(|| Utc::now().timestamp()),
        client_name: record.client_name.unwrap_or(metadata.client_name),
        redirect_uris: or_requested(record.redirect_uris, metadata.redirect_uris),
        grant_types: or_requested(record.grant_types, metadata.grant_types),
        response_types: or_requested(record.response_types, metadata.response_types),
        token_endpoint_auth_method: PUBLIC_CLIENT_AUTH_METHOD.to_string(),
        extra: metadata.extra,
    }
}

/// `POST /register` handler.
pub async fn register_handler(
    State(registrar): State<Arc<DynamicClientRegistrar>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    registrar.handle(&headers, &body).await
}

/// `405` for any other method on `/register`.
pub async fn method_not_allowed() -> Response {
    let mut response = error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "Use POST to register a client",
    );
    response
        .headers_mut()
        .insert(header::ALLOW, axum::http::HeaderValue::from_static("POST"));
    no_store(response)
}
