//! Application state and collaborator wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use tracing::{info, warn};

use crate::auth::{AuthGuard, HttpKeyFetcher, SigningKeyCache, TokenVerifier};
use crate::config::{Config, IndexBackend, non_blank};
use crate::oauth::discovery::default_upstream_url;
use crate::oauth::{
    AuthorizationServerMetadataProxy, ClientAdmin, ClientIndex, DynamicClientRegistrar,
    FileClientIndex, HttpClientAdmin, HttpUpstreamMetadata, InMemoryClientAdmin,
    InMemoryClientIndex, MetadataCache, ResourceMetadataPublisher,
};
use crate::tenant::{HttpRoleAssumer, RoleAssumer, TenantCredentialDeriver};
use crate::Result;

/// Shared application state.
///
/// Handlers extract the component they need through [`FromRef`].
#[derive(Clone)]
pub struct AppState {
    /// Protected resource metadata
    pub publisher: Arc<ResourceMetadataPublisher>,
    /// Authorization server metadata proxy
    pub proxy: Arc<AuthorizationServerMetadataProxy>,
    /// Dynamic client registration
    pub registrar: Arc<DynamicClientRegistrar>,
    /// Bearer guard for protected routes
    pub guard: Arc<AuthGuard>,
    /// Tenant credential derivation
    pub deriver: Arc<TenantCredentialDeriver>,
    /// Resource path, also served as a metadata path suffix
    pub resource_path: String,
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Request body limit (bytes)
    pub max_body_size: usize,
}

macro_rules! substate {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(
            impl FromRef<AppState> for Arc<$ty> {
                fn from_ref(state: &AppState) -> Self {
                    Arc::clone(&state.$field)
                }
            }
        )*
    };
}

substate! {
    publisher: ResourceMetadataPublisher,
    proxy: AuthorizationServerMetadataProxy,
    registrar: DynamicClientRegistrar,
    guard: AuthGuard,
    deriver: TenantCredentialDeriver,
}

impl AppState {
    /// Build every component and its HTTP collaborators from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = config.upstream.timeout;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mcp-authz/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let issuer = config.identity.issuer();
        if issuer.is_none() {
            warn!("No issuer configured; every bearer token will be rejected");
        }

        let fetcher =
            HttpKeyFetcher::new(http.clone(), config.identity.jwks_uri().unwrap_or_default());
        let keys = Arc::new(SigningKeyCache::new(
            config.identity.jwks_cache_capacity,
            config.identity.jwks_cache_ttl,
        ));
        let verifier = TokenVerifier::new(&config.identity, Arc::new(fetcher), keys, timeout);
        let guard = AuthGuard::new(
            Arc::new(verifier),
            config.resource_metadata_url(),
            config.auth.required_scopes.clone(),
        );

        let upstream_url = non_blank(config.proxy.upstream_metadata_url.as_deref())
            .map(str::to_string)
            .or_else(|| issuer.as_deref().map(default_upstream_url))
            .unwrap_or_default();
        let proxy = AuthorizationServerMetadataProxy::new(
            config,
            Arc::new(HttpUpstreamMetadata::new(http.clone(), upstream_url)),
            Arc::new(MetadataCache::new()),
        );

        let registrar = DynamicClientRegistrar::new(
            client_index(config)?,
            client_admin(config, &http),
            config.registration.default_client_name.clone(),
            config.registration.branding,
            timeout,
        );

        let assumer = non_blank(config.credentials.broker_url.as_deref()).map(|url| {
            Arc::new(HttpRoleAssumer::new(http.clone(), url)) as Arc<dyn RoleAssumer>
        });
        if assumer.is_none() {
            warn!("No credentials.broker_url configured; credential derivation will fail closed");
        }
        let deriver = TenantCredentialDeriver::new(
            assumer,
            config.credentials.role_arn.clone(),
            config.credentials.session_duration,
            timeout,
        );

        Ok(Self {
            publisher: Arc::new(ResourceMetadataPublisher::new(config)),
            proxy: Arc::new(proxy),
            registrar: Arc::new(registrar),
            guard: Arc::new(guard),
            deriver: Arc::new(deriver),
            resource_path: config.resource.path.clone(),
            request_timeout: config.server.request_timeout,
            max_body_size: config.server.max_body_size,
        })
    }
}

fn client_index(config: &Config) -> Result<Arc<dyn ClientIndex>> {
    Ok(match config.registration.index {
        IndexBackend::Memory => Arc::new(InMemoryClientIndex::new()),
        IndexBackend::File => {
            let index = match non_blank(config.registration.index_dir.as_deref()) {
                Some(dir) => FileClientIndex::new(expand_home(dir))?,
                None => FileClientIndex::default_location()?,
            };
            Arc::new(index)
        }
    })
}

fn client_admin(config: &Config, http: &reqwest::Client) -> Arc<dyn ClientAdmin> {
    if let Some(url) = non_blank(config.registration.admin_url.as_deref()) {
        info!(admin_url = %url, "Using upstream client admin");
        Arc::new(HttpClientAdmin::new(
            http.clone(),
            url,
            config.registration.admin_token.clone(),
        ))
    } else {
        warn!("No registration.admin_url configured; issuing client ids locally");
        Arc::new(InMemoryClientAdmin::new())
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
