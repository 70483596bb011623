//! Wire documents served and consumed by `mcp-authz`.
//!
//! - RFC 9728 protected resource metadata
//! - RFC 8414 authorization server metadata
//! - RFC 7591 dynamic client registration responses
//! - The `{error, error_description}` body every error response uses

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Fixed scopes advertised by the protected resource.
pub const SCOPES_SUPPORTED: [&str; 3] = ["openid", "profile", "email"];

/// Bearer token delivery methods accepted by the protected resource.
pub const BEARER_METHODS_SUPPORTED: [&str; 1] = ["header"];

/// PKCE methods advertised through the metadata proxy.
pub const CODE_CHALLENGE_METHODS: [&str; 1] = ["S256"];

/// The only token endpoint auth method a registered client ever receives.
pub const PUBLIC_CLIENT_AUTH_METHOD: &str = "none";

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported bearer token methods
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

/// OAuth Authorization Server Metadata (RFC 8414)
///
/// A typed view over the fields clients of this service rely on. The proxy
/// checks each upstream document against it, then passes the JSON object
/// through so unknown fields survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    /// Token endpoint URL
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// JWKS URI
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Dynamic client registration endpoint
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Check if PKCE is supported (S256 method)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

/// RFC 7591 client information response.
///
/// Fields the registrar does not interpret (`client_uri`, `logo_uri`,
/// `client_name#ja-Jpan-JP`, software statements, extensions) are carried in
/// `extra` and flattened back into the JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    /// Issued client identifier
    pub client_id: String,
    /// Issue time (Unix epoch seconds)
    pub client_id_issued_at: i64,
    /// Human-readable client name
    pub client_name: String,
    /// Registered redirect URIs
    pub redirect_uris: Vec<String>,
    /// Registered grant types
    pub grant_types: Vec<String>,
    /// Registered response types
    pub response_types: Vec<String>,
    /// Always `"none"`: registered clients are public
    pub token_endpoint_auth_method: String,
    /// Pass-through metadata supplied by the client
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// JSON error body shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub error: String,
    /// Human-readable description
    pub error_description: String,
}

impl ErrorBody {
    /// Create an error body
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: description.into(),
        }
    }
}

/// Deserialize scopes that may be either a string or array
/// Some implementations incorrectly return `"read write"` instead of `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}
