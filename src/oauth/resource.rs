//! Protected resource metadata (RFC 9728).

use std::sync::Arc;

use authz_wire::{BEARER_METHODS_SUPPORTED, ProtectedResourceMetadata, SCOPES_SUPPORTED};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;
use url::Url;

use crate::config::{Config, cognito_issuer, non_blank};
use crate::error::error_response;

/// Outcome of checking the publisher's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigValidation {
    /// No violations
    pub is_valid: bool,
    /// Every violation found
    pub errors: Vec<String>,
}

/// Publishes `/.well-known/oauth-protected-resource`.
pub struct ResourceMetadataPublisher {
    server_url: Option<String>,
    resource_path: String,
    user_pool_id: Option<String>,
    region: Option<String>,
    proxy_enabled: bool,
    proxy_url: Option<String>,
}

impl ResourceMetadataPublisher {
    /// Create a publisher from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let owned = |v: Option<&String>| non_blank(v.map(String::as_str)).map(str::to_string);
        Self {
            server_url: owned(config.resource.server_url.as_ref()),
            resource_path: config.resource.path.clone(),
            user_pool_id: owned(config.identity.user_pool_id.as_ref()),
            region: owned(config.identity.region.as_ref()),
            proxy_enabled: config.proxy.enabled,
            proxy_url: owned(config.proxy.url.as_ref()),
        }
    }

    /// Check every required setting; a missing value skips its format check.
    #[must_use]
    pub fn validate_configuration(&self) -> ConfigValidation {
        let mut errors = Vec::new();

        match self.server_url.as_deref() {
            None => errors.push("RESOURCE_SERVER_URL is not set".to_string()),
            Some(url) if !is_absolute_http(url) => errors.push(format!(
                "RESOURCE_SERVER_URL must be an absolute http or https URL: {url}"
            )),
            Some(_) => {}
        }
        if self.user_pool_id.is_none() {
            errors.push("COGNITO_USER_POOL_ID is not set".to_string());
        }
        if self.region.is_none() {
            errors.push("AWS_REGION is not set".to_string());
        }
        if self.proxy_enabled && self.proxy_url.is_none() {
            errors.push("DCR_PROXY_URL is not set while USE_DCR_PROXY is enabled".to_string());
        }

        ConfigValidation {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// Build the metadata document.
    ///
    /// # Errors
    ///
    /// The list of configuration violations when the document cannot be built.
    pub fn generate_metadata(&self) -> Result<ProtectedResourceMetadata, Vec<String>> {
        let validation = self.validate_configuration();
        let (Some(server_url), Some(pool), Some(region), true) = (
            self.server_url.as_deref(),
            self.user_pool_id.as_deref(),
            self.region.as_deref(),
            validation.is_valid,
        ) else {
            return Err(validation.errors);
        };

        let authorization_server = match (self.proxy_enabled, self.proxy_url.as_deref()) {
            (true, Some(proxy)) => proxy.trim_end_matches('/').to_string(),
            _ => cognito_issuer(region, pool),
        };

        Ok(ProtectedResourceMetadata {
            resource: format!("{}{}", server_url.trim_end_matches('/'), self.resource_path),
            authorization_servers: vec![authorization_server],
            scopes_supported: SCOPES_SUPPORTED.iter().map(|s| (*s).to_string()).collect(),
            bearer_methods_supported: BEARER_METHODS_SUPPORTED
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        })
    }

    /// Serve the metadata endpoint: `200` document or `503`.
    pub fn handle(&self) -> Response {
        match self.generate_metadata() {
            Ok(metadata) => (StatusCode::OK, Json(metadata)).into_response(),
            Err(errors) => {
                error!(errors = ?errors, "Protected resource metadata unavailable");
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service_unavailable",
                    "Protected resource metadata is not configured",
                )
            }
        }
    }
}

fn is_absolute_http(value: &str) -> bool {
    Url::parse(value)
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}

/// `GET /.well-known/oauth-protected-resource[{resource.path}]`
pub async fn resource_metadata_handler(
    State(publisher): State<Arc<ResourceMetadataPublisher>>,
) -> Response {
    publisher.handle()
}
