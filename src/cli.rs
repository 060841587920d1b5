//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Security gateway for a SonarQube MCP proxy
#[derive(Parser, Debug)]
#[command(name = "sonar-authgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SONAR_AUTHGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SONAR_AUTHGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SONAR_AUTHGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (defaults to `check`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and compile the configuration, then print a summary
    Check,

    /// Run the full pipeline once for a bearer token
    Authorize {
        /// Bearer token (JWT)
        #[arg(long, env = "SONAR_AUTHGATE_TOKEN")]
        token: String,

        /// Tool to authorize
        #[arg(long)]
        tool: String,

        /// Project key to authorize
        #[arg(long)]
        project: Option<String>,
    },

    /// Evaluate permission rules for a synthetic user
    Explain {
        /// Group memberships (comma-separated)
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Tool to evaluate
        #[arg(long)]
        tool: String,

        /// Project key to evaluate
        #[arg(long)]
        project: Option<String>,

        /// User id reported in the output
        #[arg(long, default_value = "explain")]
        user: String,
    },
}
