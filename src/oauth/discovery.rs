//! Authorization server metadata proxy (RFC 8414).
//!
//! Serves the identity provider's discovery document with two fields merged
//! in: this deployment's `registration_endpoint` and
//! `code_challenge_methods_supported = ["S256"]`. The merged document is held
//! in one shared slot until the upstream's `max-age` (or the configured
//! default) runs out.
//!
//! Upstream failures fail closed with a generic `500`; upstream text is
//! logged, never forwarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use authz_wire::{AuthorizationServerMetadata, CODE_CHALLENGE_METHODS};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::cache::{MAX_TTL, SlotCache};
use crate::config::{Config, non_blank};
use crate::error::HttpError;

/// Shared slot for the merged metadata document.
pub type MetadataCache = SlotCache<Map<String, Value>>;

/// A fetched upstream document and its advertised lifetime.
#[derive(Debug, Clone, Default)]
pub struct UpstreamDocument {
    /// Discovery document
    pub document: Map<String, Value>,
    /// `Cache-Control: max-age`, when present
    pub max_age: Option<Duration>,
}

/// Metadata proxy failure.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// Required settings are missing
    #[error("missing configuration: {}", .0.join(", "))]
    NotConfigured(Vec<&'static str>),

    /// Transport or decode failure
    #[error("upstream metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success upstream status
    #[error("upstream metadata returned HTTP {0}")]
    Status(StatusCode),

    /// Upstream body is not a discovery document
    #[error("upstream metadata is not a valid discovery document")]
    InvalidDocument,

    /// Upstream call exceeded the timeout
    #[error("upstream metadata timed out")]
    Timeout,
}

impl HttpError for MetadataError {
    fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn code(&self) -> &'static str {
        "server_error"
    }

    fn description(&self) -> String {
        match self {
            Self::NotConfigured(_) => "Authorization server metadata is not configured".to_string(),
            _ => "Failed to retrieve authorization server metadata".to_string(),
        }
    }
}

/// Source of the upstream discovery document.
#[async_trait]
pub trait UpstreamMetadata: Send + Sync {
    /// Fetch the current document.
    async fn fetch(&self) -> Result<UpstreamDocument, MetadataError>;
}

/// Fetches the discovery document over HTTP.
pub struct HttpUpstreamMetadata {
    http: reqwest::Client,
    url: String,
}

impl HttpUpstreamMetadata {
    /// Create a fetcher for `url`.
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl UpstreamMetadata for HttpUpstreamMetadata {
    async fn fetch(&self) -> Result<UpstreamDocument, MetadataError> {
        debug!(url = %self.url, "Fetching authorization server metadata");
        let response = self.http.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(MetadataError::Status(response.status()));
        }

        let max_age = max_age(response.headers());
        match response.json::<Value>().await? {
            Value::Object(document) => Ok(UpstreamDocument { document, max_age }),
            _ => Err(MetadataError::InvalidDocument),
        }
    }
}

/// `max-age` from a `Cache-Control` header, capped at one day.
#[must_use]
pub fn max_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|directive| {
            let (name, value) = directive.trim().split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            let secs: u64 = value.trim().trim_matches('"').parse().ok()?;
            Some(Duration::from_secs(secs).min(MAX_TTL))
        })
}

/// Default upstream discovery URL for an issuer.
#[must_use]
pub fn default_upstream_url(issuer: &str) -> String {
    format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/'))
}

/// Serves merged authorization server metadata.
pub struct AuthorizationServerMetadataProxy {
    upstream: Arc<dyn UpstreamMetadata>,
    cache: Arc<MetadataCache>,
    registration_endpoint: Option<String>,
    missing: Vec<&'static str>,
    default_max_age: Duration,
    timeout: Duration,
}

impl AuthorizationServerMetadataProxy {
    /// Create a proxy from configuration.
    #[must_use]
    pub fn new(
        config: &Config,
        upstream: Arc<dyn UpstreamMetadata>,
        cache: Arc<MetadataCache>,
    ) -> Self {
        let registration_endpoint = config.registration_endpoint();

        let mut missing = Vec::new();
        if non_blank(config.identity.user_pool_id.as_deref()).is_none() {
            missing.push("COGNITO_USER_POOL_ID");
        }
        if non_blank(config.identity.region.as_deref()).is_none() {
            missing.push("AWS_REGION");
        }
        if registration_endpoint.is_none() {
            missing.push("REGISTRATION_ENDPOINT or RESOURCE_SERVER_URL");
        }

        Self {
            upstream,
            cache,
            registration_endpoint,
            missing,
            default_max_age: config.proxy.default_max_age,
            timeout: config.upstream.timeout,
        }
    }

    /// Settings that must be supplied before metadata can be served
    #[must_use]
    pub fn missing_configuration(&self) -> &[&'static str] {
        &self.missing
    }

    /// Merged metadata document.
    ///
    /// # Errors
    ///
    /// [`MetadataError`] for missing configuration or any upstream failure.
    pub async fn metadata(&self) -> Result<Map<String, Value>, MetadataError> {
        self.metadata_at(Instant::now()).await
    }

    /// Merged metadata document, judging cache expiry as of `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::metadata`].
    pub async fn metadata_at(&self, now: Instant) -> Result<Map<String, Value>, MetadataError> {
        let registration_endpoint = match self.registration_endpoint.as_deref() {
            Some(endpoint) if self.missing.is_empty() => endpoint,
            _ => return Err(MetadataError::NotConfigured(self.missing.clone())),
        };

        if let Some(document) = self.cache.get_at(now) {
            debug!("Serving cached authorization server metadata");
            return Ok(document);
        }

        let fetched = tokio::time::timeout(self.timeout, self.upstream.fetch())
            .await
            .map_err(|_| MetadataError::Timeout)??;

        let mut document = fetched.document;
        let typed: AuthorizationServerMetadata =
            serde_json::from_value(Value::Object(document.clone())).map_err(|e| {
                warn!(error = %e, "Upstream discovery document rejected");
                MetadataError::InvalidDocument
            })?;
        if !typed.supports_pkce() {
            debug!(issuer = %typed.issuer, "Upstream does not advertise S256, adding it");
        }

        document.insert(
            "registration_endpoint".to_string(),
            Value::String(registration_endpoint.to_string()),
        );
        document.insert(
            "code_challenge_methods_supported".to_string(),
            Value::from(CODE_CHALLENGE_METHODS.to_vec()),
        );

        let ttl = fetched.max_age.unwrap_or(self.default_max_age);
        self.cache.store_at(document.clone(), ttl, now);
        debug!(ttl_secs = ttl.as_secs(), "Cached authorization server metadata");
        Ok(document)
    }

    /// Serve the metadata endpoint.
    pub async fn handle(&self) -> Response {
        match self.metadata().await {
            Ok(document) => (StatusCode::OK, Json(document)).into_response(),
            Err(e) => {
                match &e {
                    MetadataError::NotConfigured(missing) => {
                        error!(missing = ?missing, "Authorization server metadata not configured");
                    }
                    other => warn!(error = %other, "Authorization server metadata unavailable"),
                }
                e.to_response()
            }
        }
    }
}

/// `GET /.well-known/oauth-authorization-server` and
/// `GET /.well-known/openid-configuration`.
pub async fn metadata_handler(
    State(proxy): State<Arc<AuthorizationServerMetadataProxy>>,
) -> Response {
    proxy.handle().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;

    struct CountingUpstream {
        fetches: AtomicUsize,
        max_age: Option<Duration>,
        fail: bool,
    }

    impl CountingUpstream {
        fn new(max_age: Option<Duration>) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                max_age,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl UpstreamMetadata for CountingUpstream {
        async fn fetch(&self) -> Result<UpstreamDocument, MetadataError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MetadataError::Status(StatusCode::BAD_GATEWAY));
            }
            let Value::Object(document) = json!({
                "issuer": "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC",
                "authorization_endpoint": "https://auth.x.com/oauth2/authorize",
                "token_endpoint": "https://auth.x.com/oauth2/token",
                "code_challenge_methods_supported": ["plain"],
            }) else {
                unreachable!()
            };
            Ok(UpstreamDocument {
                document,
                max_age: self.max_age,
            })
        }
    }

    /// Serves one fixed document with the lifetime its headers advertise
    struct FixedUpstream {
        document: Value,
        headers: HeaderMap,
    }

    #[async_trait]
    impl UpstreamMetadata for FixedUpstream {
        async fn fetch(&self) -> Result<UpstreamDocument, MetadataError> {
            let Value::Object(document) = self.document.clone() else {
                return Err(MetadataError::InvalidDocument);
            };
            Ok(UpstreamDocument {
                document,
                max_age: max_age(&self.headers),
            })
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.resource.server_url = Some("https://api.x.com".to_string());
        config.identity.user_pool_id = Some("us-east-1_ABC".to_string());
        config.identity.region = Some("us-east-1".to_string());
        config
    }

    fn proxy(config: &Config, upstream: Arc<CountingUpstream>) -> AuthorizationServerMetadataProxy {
        AuthorizationServerMetadataProxy::new(config, upstream, Arc::new(MetadataCache::new()))
    }

    #[tokio::test]
    async fn merges_registration_endpoint_and_pkce() {
        let upstream = Arc::new(CountingUpstream::new(None));
        let proxy = proxy(&config(), upstream);

        let document = proxy.metadata().await.unwrap();

        assert_eq!(document["registration_endpoint"], "https://api.x.com/register");
        assert_eq!(document["code_challenge_methods_supported"], json!(["S256"]));
        assert_eq!(document["token_endpoint"], "https://auth.x.com/oauth2/token");
    }

    #[tokio::test]
    async fn any_missing_setting_fails_before_fetch() {
        let cases: [fn(&mut Config); 3] = [
            |c| c.identity.user_pool_id = None,
            |c| c.identity.region = Some(" ".to_string()),
            |c| c.resource.server_url = None,
        ];

        for unset in cases {
            // GIVEN: one required setting removed
            let mut config = config();
            unset(&mut config);
            let upstream = Arc::new(CountingUpstream::new(None));
            let proxy = proxy(&config, upstream.clone());

            // WHEN: metadata is requested
            let response = proxy.handle().await;

            // THEN: 500 without touching the upstream
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(upstream.fetches.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn cached_document_served_until_expiry() {
        // GIVEN: an upstream with no max-age (default one hour)
        let upstream = Arc::new(CountingUpstream::new(None));
        let proxy = proxy(&config(), upstream.clone());
        let t0 = Instant::now();

        // WHEN: requested repeatedly inside the hour
        proxy.metadata_at(t0).await.unwrap();
        for secs in [1, 600, 3599] {
            proxy.metadata_at(t0 + Duration::from_secs(secs)).await.unwrap();
        }

        // THEN: one fetch
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 1);

        // AND: refetched once expired
        proxy.metadata_at(t0 + Duration::from_secs(3600)).await.unwrap();
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn upstream_max_age_overrides_default() {
        let upstream = Arc::new(CountingUpstream::new(Some(Duration::from_secs(60))));
        let proxy = proxy(&config(), upstream.clone());
        let t0 = Instant::now();

        proxy.metadata_at(t0).await.unwrap();
        proxy.metadata_at(t0 + Duration::from_secs(59)).await.unwrap();
        proxy.metadata_at(t0 + Duration::from_secs(61)).await.unwrap();

        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_after_expiry_refetch_a_few_times() {
        let upstream = Arc::new(CountingUpstream::new(Some(Duration::from_secs(60))));
        let proxy = Arc::new(proxy(&config(), upstream.clone()));
        let t0 = Instant::now();
        proxy.metadata_at(t0).await.unwrap();

        let later = t0 + Duration::from_secs(120);
        let calls = (0..16).map(|_| {
            let proxy = proxy.clone();
            async move { proxy.metadata_at(later).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        let fetches = upstream.fetches.load(Ordering::SeqCst);
        assert!((2..=17).contains(&fetches));

        // The refreshed slot now serves everyone
        proxy.metadata_at(later + Duration::from_secs(1)).await.unwrap();
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), fetches);
    }

    #[tokio::test]
    async fn upstream_failure_is_generic_500() {
        let upstream = Arc::new(CountingUpstream {
            fetches: AtomicUsize::new(0),
            max_age: None,
            fail: true,
        });
        let proxy = proxy(&config(), upstream);

        let err = proxy.metadata().await.unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "server_error");
        assert!(!err.description().contains("502"));
    }

    #[tokio::test]
    async fn absurd_upstream_max_age_is_served_and_capped() {
        // GIVEN: an upstream advertising the largest possible max-age
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=18446744073709551615"),
        );
        let upstream = Arc::new(FixedUpstream {
            document: json!({ "issuer": "https://idp.x.com" }),
            headers,
        });
        let proxy = AuthorizationServerMetadataProxy::new(
            &config(),
            upstream,
            Arc::new(MetadataCache::new()),
        );

        // WHEN: metadata is served
        let response = proxy.handle().await;

        // THEN: 200, cached for at most a day
        assert_eq!(response.status(), StatusCode::OK);
        assert!(proxy.cache.get_at(Instant::now() + MAX_TTL).is_none());
    }

    #[tokio::test]
    async fn document_without_issuer_is_rejected() {
        let upstream = Arc::new(FixedUpstream {
            document: json!({ "token_endpoint": "https://idp.x.com/token" }),
            headers: HeaderMap::new(),
        });
        let proxy = AuthorizationServerMetadataProxy::new(
            &config(),
            upstream,
            Arc::new(MetadataCache::new()),
        );

        let err = proxy.metadata().await.unwrap_err();

        assert!(matches!(err, MetadataError::InvalidDocument));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn max_age_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(max_age(&headers), None);

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"));
        assert_eq!(max_age(&headers), Some(Duration::from_secs(300)));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        assert_eq!(max_age(&headers), None);

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("Max-Age=\"10\""));
        assert_eq!(max_age(&headers), Some(Duration::from_secs(10)));

        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=18446744073709551615"),
        );
        assert_eq!(max_age(&headers), Some(MAX_TTL));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=-1"));
        assert_eq!(max_age(&headers), None);
    }

    #[test]
    fn explicit_registration_endpoint_wins() {
        let mut config = config();
        config.proxy.registration_endpoint = Some("https://dcr.x.com/register".to_string());
        let proxy = proxy(&config, Arc::new(CountingUpstream::new(None)));

        assert!(proxy.missing_configuration().is_empty());
        assert_eq!(
            proxy.registration_endpoint.as_deref(),
            Some("https://dcr.x.com/register")
        );
    }
}
