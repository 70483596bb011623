//! Upstream client-admin API.
//!
//! The registrar never mints client ids itself in production: it asks the
//! identity provider's admin API through a [`ClientAdmin`]. Deployments
//! without one fall back to [`InMemoryClientAdmin`], which issues UUIDs.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Metadata sent upstream when creating a public client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientMetadata {
    /// Client display name
    pub client_name: String,
    /// Validated redirect URIs
    pub redirect_uris: Vec<String>,
    /// Grant types
    pub grant_types: Vec<String>,
    /// Response types
    pub response_types: Vec<String>,
    /// Always `"none"`
    pub token_endpoint_auth_method: String,
    /// Pass-through fields from the registration request
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A client as described by the upstream admin API.
///
/// Everything but `client_id` is optional; the registrar fills gaps from the
/// request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Client id
    pub client_id: String,
    /// Issue time (Unix epoch seconds)
    #[serde(default)]
    pub client_id_issued_at: Option<i64>,
    /// Display name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Registered redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Registered grant types
    #[serde(default)]
    pub grant_types: Vec<String>,
    /// Registered response types
    #[serde(default)]
    pub response_types: Vec<String>,
}

/// Client-admin failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientAdminError {
    /// The client does not exist upstream
    #[error("client not found: {0}")]
    NotFound(String),

    /// Non-success status
    #[error("client admin returned HTTP {0}")]
    Status(StatusCode),

    /// Transport or decode failure
    #[error("client admin request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Call exceeded the upstream timeout
    #[error("client admin timed out")]
    Timeout,
}

/// Upstream client-admin operations.
#[async_trait]
pub trait ClientAdmin: Send + Sync + 'static {
    /// Create a public (secret-less) client.
    async fn create_public_client(
        &self,
        metadata: &ClientMetadata,
    ) -> Result<ClientRecord, ClientAdminError>;

    /// Describe an existing client.
    async fn describe_client(&self, client_id: &str) -> Result<ClientRecord, ClientAdminError>;

    /// Apply hosted sign-in branding to a client.
    async fn apply_branding(&self, client_id: &str, client_name: &str)
    -> Result<(), ClientAdminError>;
}

/// RFC 7591-style JSON admin API.
///
/// ```text
/// POST {admin_url}                      create
/// GET  {admin_url}/{client_id}          describe
/// PUT  {admin_url}/{client_id}/branding branding
/// ```
pub struct HttpClientAdmin {
    http: reqwest::Client,
    admin_url: String,
    token: Option<String>,
}

impl HttpClientAdmin {
    /// Create an admin client for `admin_url`, authenticating with `token`.
    #[must_use]
    pub fn new(http: reqwest::Client, admin_url: &str, token: Option<String>) -> Self {
        Self {
            http,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn client_url(&self, client_id: &str) -> String {
        format!("{}/{}", self.admin_url, urlencode(client_id))
    }
}

fn urlencode(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

#[async_trait]
impl ClientAdmin for HttpClientAdmin {
    async fn create_public_client(
        &self,
        metadata: &ClientMetadata,
    ) -> Result<ClientRecord, ClientAdminError> {
        let response = self
            .authorize(self.http.post(&self.admin_url))
            .json(metadata)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientAdminError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    async fn describe_client(&self, client_id: &str) -> Result<ClientRecord, ClientAdminError> {
        let response = self
            .authorize(self.http.get(self.client_url(client_id)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ClientAdminError::NotFound(client_id.to_string())),
            s if s.is_success() => Ok(response.json().await?),
            s => Err(ClientAdminError::Status(s)),
        }
    }

    async fn apply_branding(
        &self,
        client_id: &str,
        client_name: &str,
    ) -> Result<(), ClientAdminError> {
        let url = format!("{}/branding", self.client_url(client_id));
        let response = self
            .authorize(self.http.put(url))
            .json(&serde_json::json!({ "client_name": client_name }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientAdminError::Status(response.status()));
        }
        Ok(())
    }
}

/// Process-local client admin issuing UUID client ids.
#[derive(Default)]
pub struct InMemoryClientAdmin {
    clients: DashMap<String, ClientRecord>,
    created: AtomicUsize,
}

impl InMemoryClientAdmin {
    /// Create an empty admin
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many clients have been created
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Forget a client, as if it were deleted upstream.
    pub fn remove(&self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }
}

#[async_trait]
impl ClientAdmin for InMemoryClientAdmin {
    async fn create_public_client(
        &self,
        metadata: &ClientMetadata,
    ) -> Result<ClientRecord, ClientAdminError> {
        let record = ClientRecord {
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            client_id_issued_at: Some(Utc::now().timestamp()),
            client_name: Some(metadata.client_name.clone()),
            redirect_uris: metadata.redirect_uris.clone(),
            grant_types: metadata.grant_types.clone(),
            response_types: metadata.response_types.clone(),
        };
        self.clients.insert(record.client_id.clone(), record.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(client_id = %record.client_id, "Created local client");
        Ok(record)
    }

    async fn describe_client(&self, client_id: &str) -> Result<ClientRecord, ClientAdminError> {
        self.clients
            .get(client_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ClientAdminError::NotFound(client_id.to_string()))
    }

    async fn apply_branding(
        &self,
        client_id: &str,
        _client_name: &str,
    ) -> Result<(), ClientAdminError> {
        if self.clients.contains_key(client_id) {
            Ok(())
        } else {
            Err(ClientAdminError::NotFound(client_id.to_string()))
        }
    }
}
