//! Request authorization lifecycle.
//!
//! ```text
//! Unauthenticated -> Verifying -> Authorized -> Credentialed
//!                             \            \-> CredentialFailed
//!                              \-> Rejected
//! ```
//!
//! `Rejected`, `Credentialed` and `CredentialFailed` are terminal. A request
//! that never asks for credentials simply ends in `Authorized`.

use std::fmt;

use serde::Serialize;

/// Where a request is in the authorization lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No credential examined yet
    Unauthenticated,
    /// Bearer token is being verified
    Verifying,
    /// Token verified and bound to a tenant
    Authorized,
    /// Authentication or authorization failed
    Rejected,
    /// Tenant-scoped credentials derived
    Credentialed,
    /// Credential derivation failed closed
    CredentialFailed,
}

/// Inputs that move a request through [`AuthState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// A bearer token was extracted
    TokenPresented,
    /// Verification and scope checks passed
    Verified,
    /// Header, token or scope check failed
    Failed,
    /// Role assumption returned credentials
    CredentialsIssued,
    /// Role assumption failed
    CredentialsFailed,
}

/// A transition not allowed from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid auth transition from {from} on {event:?}")]
pub struct InvalidTransition {
    /// State the request was in
    pub from: AuthState,
    /// Event that was applied
    pub event: AuthEvent,
}

impl AuthState {
    /// Apply an event.
    pub fn next(self, event: AuthEvent) -> Result<Self, InvalidTransition> {
        use AuthEvent as E;
        use AuthState as S;

        match (self, event) {
            (S::Unauthenticated, E::TokenPresented) => Ok(S::Verifying),
            (S::Unauthenticated | S::Verifying, E::Failed) => Ok(S::Rejected),
            (S::Verifying, E::Verified) => Ok(S::Authorized),
            (S::Authorized, E::CredentialsIssued) => Ok(S::Credentialed),
            (S::Authorized, E::CredentialsFailed) => Ok(S::CredentialFailed),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Verifying => "verifying",
            Self::Authorized => "authorized",
            Self::Rejected => "rejected",
            Self::Credentialed => "credentialed",
            Self::CredentialFailed => "credential_failed",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
