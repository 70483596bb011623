//! MCP Authorization Core
//!
//! Multi-tenant OAuth 2.1 authorization for Model Context Protocol resource
//! servers backed by a hosted identity provider.
//!
//! # Features
//!
//! - **Protected resource metadata** (RFC 9728) at `/.well-known/oauth-protected-resource`
//! - **Authorization server metadata proxy** (RFC 8414) that adds a
//!   registration endpoint and PKCE `S256` to the upstream document
//! - **Dynamic client registration** (RFC 7591) with idempotent replay of
//!   repeat registrations
//! - **Bearer token verification** against the issuer's JWKS, producing a
//!   tenant context
//! - **Tenant-scoped credentials** via role assumption tagged with the tenant id

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod server;
pub mod tenant;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
