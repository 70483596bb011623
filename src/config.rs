//! Configuration management
//!
//! Layering, lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. YAML file (`--config`)
//! 3. `MCP_AUTHZ_*` environment variables (nested with `__`)
//! 4. The deployment's plain environment names (`RESOURCE_SERVER_URL`,
//!    `COGNITO_USER_POOL_ID`, `AWS_REGION`, ...)
//!
//! Required settings are `Option`s. A missing value does not stop startup;
//! the metadata endpoints report it as `503`/`500` at request time.

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Plain environment variable names and the config keys they populate.
const PLAIN_ENV_KEYS: &[(&str, &str)] = &[
    ("RESOURCE_SERVER_URL", "resource.server_url"),
    ("COGNITO_USER_POOL_ID", "identity.user_pool_id"),
    ("AWS_REGION", "identity.region"),
    ("USE_DCR_PROXY", "proxy.enabled"),
    ("DCR_PROXY_URL", "proxy.url"),
    ("REGISTRATION_ENDPOINT", "proxy.registration_endpoint"),
    ("TENANT_ROLE_ARN", "credentials.role_arn"),
];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server settings
    pub server: ServerConfig,
    /// Protected resource settings (RFC 9728)
    pub resource: ResourceConfig,
    /// Identity provider / token verification settings
    pub identity: IdentityConfig,
    /// Authorization server metadata proxy settings (RFC 8414)
    pub proxy: ProxyConfig,
    /// Dynamic client registration settings (RFC 7591)
    pub registration: RegistrationConfig,
    /// Tenant credential derivation settings
    pub credentials: CredentialsConfig,
    /// Protected endpoint policy
    pub auth: AuthConfig,
    /// Outbound call settings
    pub upstream: UpstreamConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Protected resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Public base URL of the resource server (`RESOURCE_SERVER_URL`)
    pub server_url: Option<String>,
    /// Path appended to `server_url` to form the resource identifier
    pub path: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            path: "/mcp".to_string(),
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// User pool id (`COGNITO_USER_POOL_ID`)
    pub user_pool_id: Option<String>,
    /// Region of the user pool (`AWS_REGION`)
    pub region: Option<String>,
    /// Explicit issuer URL; overrides the one computed from pool id and region
    pub issuer: Option<String>,
    /// Explicit JWKS URI; defaults to `{issuer}/.well-known/jwks.json`
    pub jwks_uri: Option<String>,
    /// Validate the `aud` claim against `audiences`.
    ///
    /// Off by default: dynamically registered clients have no audience known
    /// ahead of time, so any token from the configured issuer is accepted.
    pub verify_audience: bool,
    /// Accepted audiences when `verify_audience` is on
    pub audiences: Vec<String>,
    /// Claim names checked, in order, for the tenant id
    pub tenant_id_claims: Vec<String>,
    /// Claim names checked, in order, for the tenant tier
    pub tenant_tier_claims: Vec<String>,
    /// Tier used when no tier claim is present
    pub default_tier: String,
    /// How long a fetched signing key stays cached
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Maximum number of cached signing keys
    pub jwks_cache_capacity: usize,
    /// Clock skew tolerance for `exp`/`nbf` (seconds)
    pub leeway_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_pool_id: None,
            region: None,
            issuer: None,
            jwks_uri: None,
            verify_audience: false,
            audiences: Vec::new(),
            tenant_id_claims: vec![
                "custom:tenantId".to_string(),
                "custom:tenant_id".to_string(),
                "tenantId".to_string(),
                "tenant_id".to_string(),
            ],
            tenant_tier_claims: vec![
                "custom:tenantTier".to_string(),
                "tenantTier".to_string(),
                "tenant_tier".to_string(),
            ],
            default_tier: "basic".to_string(),
            jwks_cache_ttl: Duration::from_secs(600),
            jwks_cache_capacity: 5,
            leeway_secs: 60,
        }
    }
}

impl IdentityConfig {
    /// Issuer URL: the explicit override, or the Cognito issuer derived from
    /// pool id and region. `None` when neither can be determined.
    #[must_use]
    pub fn issuer(&self) -> Option<String> {
        if let Some(issuer) = non_blank(self.issuer.as_deref()) {
            return Some(issuer.trim_end_matches('/').to_string());
        }
        let pool = non_blank(self.user_pool_id.as_deref())?;
        let region = non_blank(self.region.as_deref())?;
        Some(cognito_issuer(region, pool))
    }

    /// JWKS URI for the configured issuer
    #[must_use]
    pub fn jwks_uri(&self) -> Option<String> {
        if let Some(uri) = non_blank(self.jwks_uri.as_deref()) {
            return Some(uri.to_string());
        }
        self.issuer()
            .map(|issuer| format!("{issuer}/.well-known/jwks.json"))
    }
}

/// Authorization server metadata proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Advertise the proxy (instead of the issuer) as the authorization server
    pub enabled: bool,
    /// Public URL of the proxy (`DCR_PROXY_URL`)
    pub url: Option<String>,
    /// Registration endpoint merged into the metadata; defaults to
    /// `{resource.server_url}/register`
    pub registration_endpoint: Option<String>,
    /// Upstream metadata document; defaults to
    /// `{issuer}/.well-known/openid-configuration`
    pub upstream_metadata_url: Option<String>,
    /// Cache lifetime when the upstream sends no `max-age`
    #[serde(with = "humantime_serde")]
    pub default_max_age: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            registration_endpoint: None,
            upstream_metadata_url: None,
            default_max_age: Duration::from_secs(3600),
        }
    }
}

/// Dedup index storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// Process-local `DashMap`
    #[default]
    Memory,
    /// One JSON file per entry under `index_dir`
    File,
}

/// Dynamic client registration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Where dedup entries live
    pub index: IndexBackend,
    /// Directory for the file index (default `~/.mcp-authz/clients`)
    pub index_dir: Option<String>,
    /// Upstream client-admin API; local client ids are issued when unset
    pub admin_url: Option<String>,
    /// Bearer token for the client-admin API (supports `${VAR}`)
    pub admin_token: Option<String>,
    /// Name used when a request omits `client_name`
    pub default_client_name: String,
    /// Apply hosted-UI branding to newly created clients (best effort)
    pub branding: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            index: IndexBackend::Memory,
            index_dir: None,
            admin_url: None,
            admin_token: None,
            default_client_name: "MCP Client".to_string(),
            branding: true,
        }
    }
}

/// Tenant credential derivation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Role assumed on behalf of a tenant (`TENANT_ROLE_ARN`)
    pub role_arn: Option<String>,
    /// Role-assumption broker endpoint
    pub broker_url: Option<String>,
    /// Requested session lifetime
    #[serde(with = "humantime_serde")]
    pub session_duration: Duration,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            role_arn: None,
            broker_url: None,
            session_duration: Duration::from_secs(900),
        }
    }
}

/// Protected endpoint policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Scopes every token must carry to reach a protected endpoint
    pub required_scopes: Vec<String>,
}

/// Outbound call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Bound on every collaborator call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
        }

        let mut config = Self::extract(path)?;

        // Env files may carry the plain deployment variables, so re-extract
        // once they are in the process environment.
        if config.load_env_files() > 0 {
            config = Self::extract(path)?;
        }

        config.expand_env_vars();
        Ok(config)
    }

    fn extract(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment
            .merge(Env::prefixed("MCP_AUTHZ_").split("__"))
            .merge(Env::raw().filter_map(|key| {
                PLAIN_ENV_KEYS
                    .iter()
                    .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                    .map(|(_, path)| (*path).into())
            }));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    /// Returns how many files were loaded.
    fn load_env_files(&self) -> usize {
        let mut loaded = 0;
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
        loaded
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in collaborator settings
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            &mut self.registration.admin_url,
            &mut self.registration.admin_token,
            &mut self.credentials.role_arn,
            &mut self.credentials.broker_url,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Registration endpoint advertised in authorization server metadata.
    #[must_use]
    pub fn registration_endpoint(&self) -> Option<String> {
        if let Some(endpoint) = non_blank(self.proxy.registration_endpoint.as_deref()) {
            return Some(endpoint.to_string());
        }
        non_blank(self.resource.server_url.as_deref())
            .map(|base| format!("{}/register", base.trim_end_matches('/')))
    }

    /// URL of this server's protected resource metadata document.
    #[must_use]
    pub fn resource_metadata_url(&self) -> String {
        let path = "/.well-known/oauth-protected-resource";
        match non_blank(self.resource.server_url.as_deref()) {
            Some(base) => format!("{}{path}", base.trim_end_matches('/')),
            None => path.to_string(),
        }
    }
}

/// Cognito issuer URL for a pool.
#[must_use]
pub fn cognito_issuer(region: &str, pool_id: &str) -> String {
    format!("https://cognito-idp.{region}.amazonaws.com/{pool_id}")
}

/// `Some(trimmed)` when the value is present and not blank.
#[must_use]
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "1h", "100ms" or a bare number of seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_is_derived_from_pool_and_region() {
        let identity = IdentityConfig {
            user_pool_id: Some("us-east-1_ABC".to_string()),
            region: Some("us-east-1".to_string()),
            ..IdentityConfig::default()
        };

        assert_eq!(
            identity.issuer().as_deref(),
            Some("https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC")
        );
        assert_eq!(
            identity.jwks_uri().as_deref(),
            Some("https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC/.well-known/jwks.json")
        );
    }

    #[test]
    fn issuer_missing_when_region_blank() {
        let identity = IdentityConfig {
            user_pool_id: Some("us-east-1_ABC".to_string()),
            region: Some("   ".to_string()),
            ..IdentityConfig::default()
        };

        assert!(identity.issuer().is_none());
    }

    #[test]
    fn explicit_issuer_wins() {
        let identity = IdentityConfig {
            user_pool_id: Some("us-east-1_ABC".to_string()),
            region: Some("us-east-1".to_string()),
            issuer: Some("https://idp.example.com/".to_string()),
            ..IdentityConfig::default()
        };

        assert_eq!(identity.issuer().as_deref(), Some("https://idp.example.com"));
    }

    #[test]
    fn registration_endpoint_derived_from_resource_url() {
        let mut config = Config::default();
        assert!(config.registration_endpoint().is_none());

        config.resource.server_url = Some("https://api.x.com/".to_string());
        assert_eq!(
            config.registration_endpoint().as_deref(),
            Some("https://api.x.com/register")
        );

        config.proxy.registration_endpoint = Some("https://dcr.x.com/register".to_string());
        assert_eq!(
            config.registration_endpoint().as_deref(),
            Some("https://dcr.x.com/register")
        );
    }

    #[test]
    fn resource_metadata_url_falls_back_to_relative_path() {
        let mut config = Config::default();
        assert_eq!(
            config.resource_metadata_url(),
            "/.well-known/oauth-protected-resource"
        );

        config.resource.server_url = Some("https://api.x.com".to_string());
        assert_eq!(
            config.resource_metadata_url(),
            "https://api.x.com/.well-known/oauth-protected-resource"
        );
    }

    #[test]
    fn humantime_parse_units() {
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(humantime_serde::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("45").unwrap(), Duration::from_secs(45));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn yaml_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authz.yaml");
        std::fs::write(
            &path,
            "resource:\n  server_url: https://api.x.com\nidentity:\n  user_pool_id: us-east-1_ABC\n  region: us-east-1\n  jwks_cache_ttl: 5m\nregistration:\n  index: file\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.resource.server_url.as_deref(), Some("https://api.x.com"));
        assert_eq!(config.identity.jwks_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.registration.index, IndexBackend::File);
        assert_eq!(config.resource.path, "/mcp");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/authz.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn expand_string_uses_default() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let expanded = Config::expand_string(&re, "${MCP_AUTHZ_TEST_UNSET_VAR:-fallback}");
        assert_eq!(expanded, "fallback");
    }
}
