//! Bearer token verification.
//!
//! # Verification flow
//!
//! 1. Decode the header (no verification); require `kid` and `alg = RS256`.
//! 2. Look `kid` up in the signing key cache. On a miss, fetch the issuer's
//!    JWKS exactly once, load its RSA keys and look again.
//! 3. Verify the signature and `iss`, `exp`, `nbf` with the configured leeway.
//!    `aud` is only checked when `identity.verify_audience` is on.
//! 4. Extract subject, tenant id, tenant tier and scopes.
//!
//! A JWKS fetch failure is reported as [`VerifyError::BackendUnavailable`]
//! and is not retried within the request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, errors::ErrorKind};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::claims;
use super::jwks::{KeyFetcher, SigningKeyCache, load_keys};
use crate::config::IdentityConfig;

/// Token verification failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Outside the `exp`/`nbf` validity window
    #[error("token is outside its validity window")]
    Expired,

    /// Undecodable, wrongly signed, or disallowed algorithm
    #[error("malformed token: {0}")]
    Malformed(String),

    /// `kid` not present in the issuer's key set
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    /// `iss` differs from the configured issuer
    #[error("untrusted token issuer")]
    IssuerMismatch,

    /// Signing keys could not be obtained
    #[error("authentication backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl VerifyError {
    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Expired => "token_expired",
            Self::Malformed(_) => "invalid_token",
            Self::UnknownSigningKey(_) => "unknown_signing_key",
            Self::IssuerMismatch => "untrusted_issuer",
            Self::BackendUnavailable(_) => "auth_backend_unavailable",
        }
    }

    /// Client-facing description; never carries token or upstream detail
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Expired => "The access token has expired or is not yet valid",
            Self::Malformed(_) => "The access token is malformed or its signature is invalid",
            Self::UnknownSigningKey(_) => "The access token was signed with an unknown key",
            Self::IssuerMismatch => "The access token was issued by an untrusted issuer",
            Self::BackendUnavailable(_) => "Token verification is temporarily unavailable",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => Self::Expired,
            ErrorKind::InvalidIssuer => Self::IssuerMismatch,
            _ => Self::Malformed(e.to_string()),
        }
    }
}

/// Claims of a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedClaims {
    /// `sub`
    pub subject: String,
    /// `iss`
    pub issuer: String,
    /// Tenant id, empty when absent
    pub tenant_id: String,
    /// Tenant tier, the configured default when absent
    pub tenant_tier: String,
    /// Granted scopes
    pub scopes: std::collections::BTreeSet<String>,
}

/// Verifies RS256 bearer tokens against one issuer.
pub struct TokenVerifier {
    issuer: Option<String>,
    fetcher: Arc<dyn KeyFetcher>,
    keys: Arc<SigningKeyCache>,
    tenant_id_claims: Vec<String>,
    tenant_tier_claims: Vec<String>,
    default_tier: String,
    audiences: Option<Vec<String>>,
    leeway_secs: u64,
    timeout: Duration,
}

impl TokenVerifier {
    /// Create a verifier for the issuer described by `identity`.
    ///
    /// With no resolvable issuer every verification reports
    /// [`VerifyError::BackendUnavailable`].
    #[must_use]
    pub fn new(
        identity: &IdentityConfig,
        fetcher: Arc<dyn KeyFetcher>,
        keys: Arc<SigningKeyCache>,
        timeout: Duration,
    ) -> Self {
        if identity.verify_audience && identity.audiences.is_empty() {
            warn!("identity.verify_audience is on but no audiences are configured");
        }

        Self {
            issuer: identity.issuer(),
            fetcher,
            keys,
            tenant_id_claims: identity.tenant_id_claims.clone(),
            tenant_tier_claims: identity.tenant_tier_claims.clone(),
            default_tier: identity.default_tier.clone(),
            audiences: identity
                .verify_audience
                .then(|| identity.audiences.clone()),
            leeway_secs: identity.leeway_secs,
            timeout,
        }
    }

    /// Verify `token` and extract its claims.
    ///
    /// # Errors
    ///
    /// See [`VerifyError`].
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, VerifyError> {
        let Some(issuer) = self.issuer.as_deref() else {
            return Err(VerifyError::BackendUnavailable(
                "issuer not configured".to_string(),
            ));
        };

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| VerifyError::Malformed(format!("header: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(VerifyError::Malformed(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::Malformed("missing kid".to_string()))?;

        let key = self.signing_key(&kid).await?;

        let validation = self.validation(issuer);
        let data = jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)?;
        let claims = data.claims;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VerifyError::Malformed("missing sub".to_string()))?
            .to_string();

        Ok(VerifiedClaims {
            subject,
            issuer: issuer.to_string(),
            tenant_id: claims::lookup_first(&claims, &self.tenant_id_claims).unwrap_or_default(),
            tenant_tier: claims::lookup_first(&claims, &self.tenant_tier_claims)
                .unwrap_or_else(|| self.default_tier.clone()),
            scopes: claims::scopes(&claims),
        })
    }

    /// Cached key for `kid`, fetching the JWKS once on a miss.
    async fn signing_key(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        let kid = kid.to_string();
        if let Some(key) = self.keys.get(&kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Signing key not cached, fetching JWKS");
        let jwks = tokio::time::timeout(self.timeout, self.fetcher.fetch())
            .await
            .map_err(|_| VerifyError::BackendUnavailable("JWKS fetch timed out".to_string()))?
            .map_err(|e| {
                warn!(error = %e, "JWKS fetch failed");
                VerifyError::BackendUnavailable(e.to_string())
            })?;

        let loaded = load_keys(&self.keys, &jwks);
        let stats = self.keys.stats();
        debug!(
            loaded,
            cached = stats.size,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            "Loaded signing keys"
        );

        self.keys
            .get(&kid)
            .ok_or(VerifyError::UnknownSigningKey(kid))
    }

    fn validation(&self, issuer: &str) -> Validation {
        let mut v = Validation::new(Algorithm::RS256);
        v.leeway = self.leeway_secs;
        v.validate_nbf = true;
        v.set_issuer(&[issuer]);
        v.required_spec_claims = HashSet::from(["exp".to_string(), "iss".to_string()]);
        match &self.audiences {
            Some(audiences) => v.set_audience(audiences),
            None => v.validate_aud = false,
        }
        v
    }
}
