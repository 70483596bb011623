//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-tenant OAuth 2.1 authorization server for MCP resource servers
#[derive(Parser, Debug)]
#[command(name = "mcp-authz")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_AUTHZ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_AUTHZ_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_AUTHZ_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_AUTHZ_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_AUTHZ_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the authorization server (default)
    Serve,

    /// Report configuration problems and exit non-zero if any endpoint
    /// would be unavailable
    CheckConfig {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}
