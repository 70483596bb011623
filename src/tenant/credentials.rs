//! Tenant-scoped temporary credentials.
//!
//! The deriver assumes a configured role on behalf of a tenant, attaching a
//! `tenantId` session tag taken from the verified [`TenantContext`]. Any
//! failure fails closed: there is no fallback to the process's own
//! credentials.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::TenantContext;
use crate::error::HttpError;

/// Session tag key carrying the tenant id.
pub const TENANT_TAG_KEY: &str = "tenantId";

/// Longest role session name the role service accepts.
const MAX_SESSION_NAME_LEN: usize = 64;

/// One session tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionTag {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
}

/// Role assumption request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssumeRoleRequest {
    /// Role to assume
    pub role_arn: String,
    /// Deterministic session name
    pub role_session_name: String,
    /// Requested lifetime
    pub duration_seconds: u64,
    /// Session tags
    pub tags: Vec<SessionTag>,
}

/// Role assumption response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssumeRoleResponse {
    /// Issued credential material, if any
    #[serde(default)]
    pub credentials: Option<RawCredentials>,
}

/// Credential material as returned by the role service.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawCredentials {
    /// Access key id
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Session token
    #[serde(default)]
    pub session_token: Option<String>,
    /// Expiry
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl fmt::Debug for RawCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "[REDACTED]"))
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Tenant-scoped temporary credentials.
#[derive(Clone, Serialize)]
pub struct TemporaryCredential {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
    /// Expiry
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for TemporaryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Role service failure.
#[derive(Debug, thiserror::Error)]
pub enum RoleAssumerError {
    /// Transport failure
    #[error("role service request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status
    #[error("role service returned HTTP {0}")]
    Status(StatusCode),
}

/// Role assumption collaborator.
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    /// Assume a role with the given session name and tags.
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<AssumeRoleResponse, RoleAssumerError>;
}

/// Role assumer posting STS-shaped JSON to a broker endpoint.
pub struct HttpRoleAssumer {
    http: reqwest::Client,
    url: String,
}

impl HttpRoleAssumer {
    /// Create an assumer for `url`.
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RoleAssumer for HttpRoleAssumer {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<AssumeRoleResponse, RoleAssumerError> {
        debug!(session = %request.role_session_name, "Assuming tenant role");
        let response = self.http.post(&self.url).json(request).send().await?;

        if !response.status().is_success() {
            return Err(RoleAssumerError::Status(response.status()));
        }

        Ok(response.json().await?)
    }
}

/// Credential derivation failure. Always rendered as one generic message.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The verified context carries no tenant id
    #[error("no tenant id in verified context")]
    MissingTenant,

    /// No role or role service is configured
    #[error("credential derivation not configured")]
    NotConfigured,

    /// Role service call failed
    #[error(transparent)]
    Upstream(#[from] RoleAssumerError),

    /// Role service call exceeded the upstream timeout
    #[error("role service timed out")]
    Timeout,

    /// Role service answered without usable credential material
    #[error("role service returned no credentials")]
    MissingCredentials,

    /// Session duration cannot be expressed as an expiry time
    #[error("session duration out of range")]
    InvalidDuration,
}

impl HttpError for CredentialError {
    fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn code(&self) -> &'static str {
        "credential_derivation_failed"
    }

    fn description(&self) -> String {
        "credential derivation failed".to_string()
    }
}

/// Derives tenant-scoped credentials from a verified [`TenantContext`].
pub struct TenantCredentialDeriver {
    assumer: Option<Arc<dyn RoleAssumer>>,
    role_arn: Option<String>,
    duration: Duration,
    timeout: Duration,
}

impl TenantCredentialDeriver {
    /// Create a deriver. With no assumer or role every call fails closed.
    #[must_use]
    pub fn new(
        assumer: Option<Arc<dyn RoleAssumer>>,
        role_arn: Option<String>,
        duration: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            assumer,
            role_arn: role_arn.filter(|r| !r.trim().is_empty()),
            duration,
            timeout,
        }
    }

    /// Derive credentials tagged with the context's tenant id.
    ///
    /// # Errors
    ///
    /// [`CredentialError`] when the tenant id is empty, derivation is not
    /// configured, the role service fails or times out, or it returns no
    /// credential material.
    pub async fn derive(
        &self,
        ctx: &TenantContext,
    ) -> Result<TemporaryCredential, CredentialError> {
        if ctx.tenant_id.trim().is_empty() {
            return Err(CredentialError::MissingTenant);
        }
        let (Some(assumer), Some(role_arn)) = (&self.assumer, &self.role_arn) else {
            return Err(CredentialError::NotConfigured);
        };

        let request = AssumeRoleRequest {
            role_arn: role_arn.clone(),
            role_session_name: session_name(ctx),
            duration_seconds: self.duration.as_secs(),
            tags: vec![SessionTag {
                key: TENANT_TAG_KEY.to_string(),
                value: ctx.tenant_id.clone(),
            }],
        };

        let response = tokio::time::timeout(self.timeout, assumer.assume_role(&request))
            .await
            .map_err(|_| CredentialError::Timeout)?
            .inspect_err(|e| warn!(tenant = %ctx.tenant_id, error = %e, "Role assumption failed"))?;

        let raw = response.credentials.ok_or(CredentialError::MissingCredentials)?;
        let (Some(access_key_id), Some(secret_access_key), Some(session_token)) = (
            non_empty(raw.access_key_id),
            non_empty(raw.secret_access_key),
            non_empty(raw.session_token),
        ) else {
            return Err(CredentialError::MissingCredentials);
        };

        let expiration = match raw.expiration {
            Some(expiration) => expiration,
            None => i64::try_from(self.duration.as_secs())
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                .ok_or(CredentialError::InvalidDuration)?,
        };

        Ok(TemporaryCredential {
            access_key_id,
            secret_access_key,
            session_token,
            expiration,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Deterministic role session name `tenant-<tenant>-<user>`.
///
/// Characters outside `[A-Za-z0-9_=,.@-]` become `-`; the result is cut to
/// 64 characters.
#[must_use]
pub fn session_name(ctx: &TenantContext) -> String {
    format!("tenant-{}-{}", ctx.tenant_id, ctx.user_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_=,.@-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(MAX_SESSION_NAME_LEN)
        .collect()
}
