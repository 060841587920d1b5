//! Sonar Authgate Library
//!
//! Security gateway for a SonarQube MCP proxy.
//!
//! # Features
//!
//! - **Token validation**: JWT signature, issuer, audience, expiry and
//!   RFC 8707 resource checks against JWKS or static keys
//! - **Identity providers**: Keycloak, Azure AD, Okta, Auth0, LDAP-style and
//!   generic issuers with per-provider group normalization
//! - **Permissions**: group-scoped rules over tools, projects, severities and
//!   statuses, with decision caching and audit
//! - **Service accounts**: priority-ordered user -> account mapping with
//!   health tracking and failover
//! - **Sessions**: bounded, idle-expiring session cache

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pattern;
pub mod permissions;
pub mod service_accounts;
pub mod session;

pub use error::{Error, Result};
pub use gateway::{AuthGateway, AuthenticatedSession, Collaborators, GatewayHealth};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
