//! Backend credential routing.
//!
//! Users are mapped to a pool of service accounts by priority-ordered rules.
//! Every resolution validates a client for the chosen account and fails over
//! along `fallback_account_id` links when it cannot.

mod account;
mod backend;
mod health;
mod mapper;

pub use account::{
    DEFAULT_ACCOUNT_ID, DEFAULT_BACKEND_URL, MAX_ENV_ACCOUNTS, MappingRuleConfig, ServiceAccountConfig,
};
pub use backend::{
    BackendClient, BackendError, ClientFactory, CredentialStore, HttpBackendClient, HttpClientFactory,
    StaticCredentialStore,
};
pub use health::{AccountHealth, HealthRegistry, ServiceAccountHealthMonitor};
pub use mapper::{MappingError, ResolvedClient, ServiceAccountMapper};
