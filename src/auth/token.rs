//! Bearer token validation.
//!
//! # Validation flow
//!
//! 1. Decode header and payload without verification; malformed tokens stop here.
//! 2. The header `alg` must be on the configured allow-list.
//! 3. The `iss` claim must be an allowed issuer.
//! 4. Resolve the verification key: a static key for the issuer, else the
//!    issuer's JWKS via [`ExternalIdpManager`] (by `kid` when present).
//! 5. Verify signature, `exp`, `nbf`, `iss` and `aud` with clock leeway.
//! 6. Re-check the audience intersection explicitly.
//! 7. When enabled, check the `resource` claim against expected resources.
//! 8. Normalize provider claims through the IdP manager.

use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::{
    Algorithm, Header, Validation, decode, decode_header, errors::ErrorKind,
};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Claims, ExternalIdpManager, IdpError, VerificationKey};
use crate::config::AuthConfig;
use crate::{Error, Result};

/// Why a bearer token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Malformed, unsupported algorithm, or otherwise unusable
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// `exp` is in the past beyond the clock tolerance
    #[error("Token expired: {0}")]
    Expired(String),

    /// Audience does not intersect the expected audiences
    #[error("Invalid audience: {0}")]
    InvalidAudience(String),

    /// Issuer is not trusted
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// Signature does not verify, or no key could verify it
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Resource indicator does not match an expected resource
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// `nbf` is in the future beyond the clock tolerance
    #[error("Token not yet valid: {0}")]
    NotActive(String),
}

impl TokenError {
    /// OAuth 2.0 error code for the challenge.
    #[must_use]
    pub fn code(&self) -> &'static str {
        "invalid_token"
    }

    /// Short machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "invalid_token",
            Self::Expired(_) => "expired_token",
            Self::InvalidAudience(_) => "invalid_audience",
            Self::InvalidIssuer(_) => "invalid_issuer",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::InvalidResource(_) => "invalid_resource",
            Self::NotActive(_) => "token_not_active",
        }
    }

    /// RFC 6750 `WWW-Authenticate` header value.
    #[must_use]
    pub fn www_authenticate(&self) -> String {
        let description = self.to_string().replace('\\', "\\\\").replace('"', "\\\"");
        format!(
            "Bearer error=\"{}\", error_description=\"{description}\"",
            self.code()
        )
    }
}

/// Validates bearer tokens and returns normalized claims.
pub struct TokenValidator {
    config: AuthConfig,
    idps: Arc<ExternalIdpManager>,
    static_keys: HashMap<String, VerificationKey>,
}

impl TokenValidator {
    /// Build a validator. Static keys are parsed here; a bad PEM is a
    /// configuration error.
    pub fn new(config: AuthConfig, idps: Arc<ExternalIdpManager>) -> Result<Self> {
        let mut static_keys = HashMap::new();
        for key in &config.static_keys {
            let verification = if let Some(secret) = key.resolve_secret()? {
                VerificationKey::hmac(secret.as_bytes())
            } else if let Some(pem) = &key.public_key_pem {
                VerificationKey::rsa_pem(pem.as_bytes())
                    .or_else(|_| VerificationKey::ec_pem(pem.as_bytes()))
                    .map_err(|e| {
                        Error::Config(format!("static key for '{}': {e}", key.issuer))
                    })?
            } else {
                return Err(Error::Config(format!(
                    "static key for '{}' has no key material",
                    key.issuer
                )));
            };
            static_keys.insert(key.issuer.clone(), verification);
        }

        Ok(Self {
            config,
            idps,
            static_keys,
        })
    }

    /// Returns `true` if tokens from `issuer` are accepted.
    #[must_use]
    pub fn is_allowed_issuer(&self, issuer: &str) -> bool {
        self.config.issuers.iter().any(|i| i == issuer) || self.idps.has_idp(issuer)
    }

    /// Validate `token` and return its normalized claims.
    pub async fn validate_token(&self, token: &str) -> std::result::Result<Claims, TokenError> {
        let (header, unverified) = decode_unverified(token)?;

        if !self.config.algorithms.contains(&header.alg) {
            return Err(TokenError::InvalidToken(format!(
                "algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let issuer = unverified.iss;
        if issuer.is_empty() {
            return Err(TokenError::InvalidIssuer("missing iss claim".to_string()));
        }
        if !self.is_allowed_issuer(&issuer) {
            warn!(issuer = %issuer, "Rejected token from untrusted issuer");
            return Err(TokenError::InvalidIssuer(format!("issuer '{issuer}' is not trusted")));
        }

        let key = self.resolve_key(&issuer, header.kid.as_deref()).await?;
        if !key.supports(header.alg) {
            return Err(TokenError::InvalidSignature(format!(
                "key for '{issuer}' cannot verify {:?}",
                header.alg
            )));
        }

        let claims = decode::<Claims>(token, &key.key, &self.validation(header.alg, &issuer))
            .map_err(map_jwt_error)?
            .claims;

        if !self.config.audiences.is_empty() && !claims.audience_intersects(&self.config.audiences) {
            return Err(TokenError::InvalidAudience(format!(
                "token audience {:?} does not include an expected audience",
                claims.aud
            )));
        }

        if self.config.validate_resource && !claims.resource.is_empty() {
            let matched = claims.resource.iter().any(|r| {
                self.config
                    .expected_resources
                    .iter()
                    .any(|expected| resource_matches(r, expected))
            });
            if !matched {
                return Err(TokenError::InvalidResource(format!(
                    "resource {:?} is not an expected resource",
                    claims.resource
                )));
            }
        }

        debug!(sub = %claims.sub, issuer = %issuer, "Token validated");
        Ok(self.idps.extract_claims(&issuer, claims))
    }

    /// Drop cached JWKS documents.
    pub fn clear_key_cache(&self) {
        self.idps.clear_key_cache();
    }

    async fn resolve_key(
        &self,
        issuer: &str,
        kid: Option<&str>,
    ) -> std::result::Result<VerificationKey, TokenError> {
        if let Some(key) = self.static_keys.get(issuer) {
            return Ok(key.clone());
        }

        self.idps.get_public_key(issuer, kid).await.map_err(|e| {
            warn!(issuer = %issuer, kid = ?kid, error = %e, "Key resolution failed");
            match e {
                IdpError::KeyNotFound { .. } => TokenError::InvalidSignature(e.to_string()),
                other => TokenError::InvalidToken(format!("key resolution failed: {other}")),
            }
        })
    }

    fn validation(&self, alg: Algorithm, issuer: &str) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = self.config.clock_tolerance.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        if self.config.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audiences);
        }
        validation
    }
}

/// Structural decode of header and payload, no signature check.
fn decode_unverified(token: &str) -> std::result::Result<(Header, Claims), TokenError> {
    let header = decode_header(token).map_err(|e| TokenError::InvalidToken(e.to_string()))?;

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| TokenError::InvalidToken("missing payload segment".to_string()))?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload)
        .map_err(|_| TokenError::InvalidToken("payload is not base64url".to_string()))?;
    let claims = serde_json::from_slice::<Claims>(&bytes)
        .map_err(|e| TokenError::InvalidToken(format!("payload is not a claims object: {e}")))?;

    Ok((header, claims))
}

/// `resource` equals `expected`, or is a path prefix of it.
fn resource_matches(resource: &str, expected: &str) -> bool {
    let resource = resource.trim_end_matches('/');
    let expected = expected.trim_end_matches('/');
    resource == expected
        || expected
            .strip_prefix(resource)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> TokenError {
    match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired("token has expired".to_string()),
        ErrorKind::ImmatureSignature => TokenError::NotActive("token is not valid yet".to_string()),
        ErrorKind::InvalidAudience => TokenError::InvalidAudience("audience mismatch".to_string()),
        ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => {
            TokenError::InvalidAudience("missing aud claim".to_string())
        }
        ErrorKind::InvalidIssuer => TokenError::InvalidIssuer("issuer mismatch".to_string()),
        ErrorKind::InvalidSignature => {
            TokenError::InvalidSignature("signature verification failed".to_string())
        }
        _ => TokenError::InvalidToken(e.to_string()),
    }
}
