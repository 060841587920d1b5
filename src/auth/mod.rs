//! Bearer token authentication.
//!
//! [`TokenValidator`] verifies JWTs; [`ExternalIdpManager`] supplies the
//! verification keys and normalizes provider-specific claims.

mod claims;
mod idp;
mod jwks;
mod token;

pub use claims::Claims;
pub use idp::{
    ExternalIdpManager, GroupsTransform, ISSUER_MARKER, IdpError, IdpHealth, IdpProvider, PROVIDER_MARKER,
    TENANT_MARKER,
};
pub use jwks::{HttpJwksFetcher, JwksCache, JwksFetcher, Refresh, VerificationKey, select_key};
pub use token::{TokenError, TokenValidator};
