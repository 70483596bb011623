//! Audit logging for authorization, registration and credential events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.rejected` | A protected request failed authentication or scope checks |
//! | `auth.authorized` | A bearer token was verified and bound to a tenant |
//! | `client.registered` | A new public client was created upstream |
//! | `client.replayed` | A registration matched an existing dedup entry |
//! | `credentials.issued` | Tenant-scoped temporary credentials were derived |
//! | `credentials.failed` | Credential derivation failed closed |
//!
//! Bearer tokens and credential secrets never appear in an event.

use serde::Serialize;

use crate::tenant::TenantContext;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"client.registered"`).
    pub event: &'static str,
    /// Tenant the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Token subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// OAuth client id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// OAuth client name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Role session name used for credential derivation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    /// Request path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Machine code or human-readable reason for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            tenant_id: None,
            user_id: None,
            client_id: None,
            client_name: None,
            session_name: None,
            path: None,
            reason: None,
        }
    }

    /// Construct an `auth.rejected` event.
    #[must_use]
    pub fn rejected(code: &str, path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            reason: Some(code.to_string()),
            ..Self::bare("auth.rejected")
        }
    }

    /// Construct an `auth.authorized` event.
    #[must_use]
    pub fn authorized(ctx: &TenantContext, path: &str) -> Self {
        Self {
            tenant_id: Some(ctx.tenant_id.clone()),
            user_id: Some(ctx.user_id.clone()),
            path: Some(path.to_string()),
            ..Self::bare("auth.authorized")
        }
    }

    /// Construct a `client.registered` event.
    #[must_use]
    pub fn registered(client_id: &str, client_name: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            client_name: Some(client_name.to_string()),
            ..Self::bare("client.registered")
        }
    }

    /// Construct a `client.replayed` event.
    #[must_use]
    pub fn replayed(client_id: &str, client_name: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            client_name: Some(client_name.to_string()),
            ..Self::bare("client.replayed")
        }
    }

    /// Construct a `credentials.issued` event.
    #[must_use]
    pub fn credentials_issued(ctx: &TenantContext, session_name: &str) -> Self {
        Self {
            tenant_id: Some(ctx.tenant_id.clone()),
            user_id: Some(ctx.user_id.clone()),
            session_name: Some(session_name.to_string()),
            ..Self::bare("credentials.issued")
        }
    }

    /// Construct a `credentials.failed` event.
    #[must_use]
    pub fn credentials_failed(ctx: &TenantContext, reason: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(ctx.tenant_id.clone()),
            user_id: Some(ctx.user_id.clone()),
            reason: Some(reason.into()),
            ..Self::bare("credentials.failed")
        }
    }
}

/// Emit an audit event via `tracing::info!` under the `audit` target.
///
/// ```text
/// INFO audit: audit={"event":"client.registered","client_id":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(target: "audit", event = event.event, audit = %json, "audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
