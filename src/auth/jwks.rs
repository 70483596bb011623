//! Signing key retrieval and caching.
//!
//! Keys are fetched from the issuer's `/.well-known/jwks.json` through a
//! [`KeyFetcher`] and held in a [`SigningKeyCache`] keyed by `kid`. Only RSA
//! keys are loaded: tokens are verified with RS256 and nothing else.

use async_trait::async_trait;
use axum::http::StatusCode;
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use tracing::{debug, warn};

use crate::cache::TtlCache;

/// `kid -> DecodingKey`, bounded with per-entry TTL.
pub type SigningKeyCache = TtlCache<String, DecodingKey>;

/// JWKS retrieval failure.
#[derive(Debug, thiserror::Error)]
pub enum KeyFetchError {
    /// Transport or decode failure
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the JWKS endpoint
    #[error("JWKS endpoint returned HTTP {0}")]
    Status(StatusCode),
}

/// Source of the issuer's signing key set.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError>;
}

/// Fetches a JWKS document over HTTP.
pub struct HttpKeyFetcher {
    http: reqwest::Client,
    jwks_uri: String,
}

impl HttpKeyFetcher {
    /// Create a fetcher for `jwks_uri`.
    #[must_use]
    pub fn new(http: reqwest::Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            http,
            jwks_uri: jwks_uri.into(),
        }
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        debug!(uri = %self.jwks_uri, "Fetching JWKS");
        let response = self.http.get(&self.jwks_uri).send().await?;

        if !response.status().is_success() {
            return Err(KeyFetchError::Status(response.status()));
        }

        Ok(response.json().await?)
    }
}

/// Load every RSA key with a `kid` from `jwks` into `cache`.
///
/// Returns how many keys were loaded.
pub fn load_keys(cache: &SigningKeyCache, jwks: &JwkSet) -> usize {
    let mut loaded = 0;
    for jwk in &jwks.keys {
        let Some(kid) = jwk.common.key_id.as_deref() else {
            continue;
        };

        let AlgorithmParameters::RSA(rsa) = &jwk.algorithm else {
            debug!(kid = %kid, "Skipping non-RSA JWK");
            continue;
        };

        match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
            Ok(key) => {
                cache.insert(kid.to_string(), key);
                loaded += 1;
            }
            Err(e) => warn!(kid = %kid, error = %e, "Ignoring unusable RSA JWK"),
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const TEST_JWK: &str = include_str!("../../tests/fixtures/rsa_public.jwk.json");

    fn jwks_with(extra: &str) -> JwkSet {
        serde_json::from_str(&format!(r#"{{"keys":[{TEST_JWK}{extra}]}}"#)).unwrap()
    }

    #[test]
    fn load_keys_takes_rsa_only() {
        // GIVEN: one RSA key and one symmetric key
        let jwks = jwks_with(r#",{"kty":"oct","kid":"hmac-1","k":"c2VjcmV0"}"#);
        let cache = SigningKeyCache::new(5, Duration::from_secs(600));

        // WHEN: loading
        let loaded = load_keys(&cache, &jwks);

        // THEN: only the RSA key is usable
        assert_eq!(loaded, 1);
        assert!(cache.get(&"test-key-1".to_string()).is_some());
        assert!(cache.get(&"hmac-1".to_string()).is_none());
    }

    #[test]
    fn load_keys_skips_keys_without_kid() {
        let jwks: JwkSet = serde_json::from_str(
            r#"{"keys":[{"kty":"RSA","n":"sXch","e":"AQAB"}]}"#,
        )
        .unwrap();
        let cache = SigningKeyCache::new(5, Duration::from_secs(600));

        assert_eq!(load_keys(&cache, &jwks), 0);
        assert_eq!(cache.stats().size, 0);
    }
}
