//! Authorization server
//!
//! [`AuthzServer`] binds the listener and serves the router built by
//! [`create_router`] until a shutdown signal arrives.

mod router;
mod state;

pub use router::{RESOURCE_METADATA_PATH, create_router};
pub use state::AppState;

use std::net::SocketAddr;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use crate::config::{Config, non_blank};
use crate::{Error, Result};

/// Configuration problems found before serving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigReport {
    /// Settings that make a discovery endpoint fail
    pub errors: Vec<String>,
    /// Settings that disable an optional capability
    pub warnings: Vec<String>,
}

impl ConfigReport {
    /// Check a configuration through the components that consume it.
    #[must_use]
    pub fn check(config: &Config, state: &AppState) -> Self {
        let mut errors = state.publisher.validate_configuration().errors;
        for missing in state.proxy.missing_configuration() {
            let line = format!("{missing} is not set");
            if !errors.contains(&line) {
                errors.push(line);
            }
        }

        let mut warnings = Vec::new();
        if non_blank(config.credentials.role_arn.as_deref()).is_none() {
            warnings.push(
                "TENANT_ROLE_ARN is not set; credential derivation is disabled".to_string(),
            );
        }
        if non_blank(config.credentials.broker_url.as_deref()).is_none() {
            warnings.push(
                "credentials.broker_url is not set; credential derivation is disabled".to_string(),
            );
        }
        if non_blank(config.registration.admin_url.as_deref()).is_none() {
            warnings.push(
                "registration.admin_url is not set; client ids are issued locally".to_string(),
            );
        }

        Self { errors, warnings }
    }

    /// No errors
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The authorization HTTP server
pub struct AuthzServer {
    config: Config,
    state: AppState,
}

impl AuthzServer {
    /// Build every component from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let state = AppState::from_config(&config)?;
        Ok(Self { config, state })
    }

    /// Startup configuration report
    #[must_use]
    pub fn report(&self) -> ConfigReport {
        ConfigReport::check(&self.config, &self.state)
    }

    /// Serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        // Missing settings are reported, not fatal: the endpoints answer 503/500.
        let report = self.report();
        for problem in &report.errors {
            error!("Configuration: {problem}");
        }
        for problem in &report.warnings {
            warn!("Configuration: {problem}");
        }

        let app = create_router(self.state);
        let listener = TcpListener::bind(addr).await?;

        info!("MCP authorization server listening on http://{addr}");
        info!("  Resource metadata: http://{addr}{RESOURCE_METADATA_PATH}");
        info!("  AS metadata:       http://{addr}/.well-known/oauth-authorization-server");
        info!("  Registration:      http://{addr}/register");
        info!("  Health:            http://{addr}/health");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
