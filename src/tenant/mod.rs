//! Tenant identity and tenant-scoped credentials.
//!
//! A [`TenantContext`] is built by the authorization middleware from a
//! verified token and lives only in that request's extensions. Handlers hand
//! it to the [`TenantCredentialDeriver`]; nothing else is ever used to pick
//! the tenant.

mod credentials;
mod state;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::auth::VerifiedClaims;

pub use credentials::{
    AssumeRoleRequest, AssumeRoleResponse, CredentialError, HttpRoleAssumer, RawCredentials,
    RoleAssumer, RoleAssumerError, SessionTag, TENANT_TAG_KEY, TemporaryCredential,
    TenantCredentialDeriver, session_name,
};
pub use state::{AuthEvent, AuthState, InvalidTransition};

/// Per-request tenant identity derived from a verified token.
///
/// Only ever built from verified claims, so it is not `Deserialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantContext {
    /// Tenant id claim (empty when the token carries none)
    pub tenant_id: String,
    /// Tenant tier claim (`"basic"` by default)
    pub tenant_tier: String,
    /// Token subject
    pub user_id: String,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
}

impl From<&VerifiedClaims> for TenantContext {
    fn from(claims: &VerifiedClaims) -> Self {
        Self {
            tenant_id: claims.tenant_id.clone(),
            tenant_tier: claims.tenant_tier.clone(),
            user_id: claims.subject.clone(),
            scopes: claims.scopes.clone(),
        }
    }
}

impl TenantContext {
    /// Scopes in `required` that were not granted, in `required` order
    #[must_use]
    pub fn missing_scopes(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|s| !self.scopes.contains(*s))
            .cloned()
            .collect()
    }
}
