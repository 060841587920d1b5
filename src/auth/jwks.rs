//! JWKS fetching and caching.
//!
//! Key sets are cached per issuer with a TTL. An unknown `kid` forces one
//! refresh before the lookup fails. Forced refreshes are throttled per
//! issuer: within [`MIN_FORCED_REFRESH_INTERVAL`] of the last one, the
//! cached set is served as-is.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
};
use tracing::debug;

use super::IdpError;

/// Source of JWKS documents.
///
/// The production implementation is [`HttpJwksFetcher`]; tests substitute an
/// in-memory key set.
#[async_trait]
pub trait JwksFetcher: Send + Sync + 'static {
    /// Fetch the key set published at `jwks_uri`.
    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet, IdpError>;
}

/// Fetches JWKS documents over HTTP.
pub struct HttpJwksFetcher {
    http: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpJwksFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet, IdpError> {
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| IdpError::Fetch {
                uri: jwks_uri.to_string(),
                reason: e.to_string(),
            })?;

        response.json::<JwkSet>().await.map_err(|e| IdpError::Fetch {
            uri: jwks_uri.to_string(),
            reason: format!("invalid JWKS document: {e}"),
        })
    }
}

/// A key ready for signature verification.
#[derive(Clone)]
pub struct VerificationKey {
    /// Decoding key material.
    pub key: DecodingKey,
    /// Algorithms this key may verify.
    pub algorithms: Vec<Algorithm>,
}

impl VerificationKey {
    /// HMAC key from a shared secret.
    #[must_use]
    pub fn hmac(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            algorithms: vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512],
        }
    }

    /// RSA public key from PEM.
    pub fn rsa_pem(pem: &[u8]) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            key: DecodingKey::from_rsa_pem(pem)?,
            algorithms: RSA_ALGORITHMS.to_vec(),
        })
    }

    /// EC public key from PEM.
    pub fn ec_pem(pem: &[u8]) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            key: DecodingKey::from_ec_pem(pem)?,
            algorithms: vec![Algorithm::ES256, Algorithm::ES384],
        })
    }

    /// Returns `true` if this key can verify `alg`.
    #[must_use]
    pub fn supports(&self, alg: Algorithm) -> bool {
        self.algorithms.contains(&alg)
    }
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithms", &self.algorithms)
            .finish_non_exhaustive()
    }
}

const RSA_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// Minimum spacing between forced refreshes for one issuer.
pub const MIN_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// How [`JwksCache::get_or_fetch`] treats a cached key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Serve the cached set while fresh
    IfStale,
    /// The wanted `kid` is missing: refetch, throttled per issuer
    KeyMiss,
    /// Always fetch
    Always,
}

/// JWKS cache, one entry per issuer.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    forced: DashMap<String, Instant>,
    ttl: Duration,
    min_refresh_interval: Duration,
}

impl JwksCache {
    /// Create a cache whose entries go stale after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            forced: DashMap::new(),
            ttl,
            min_refresh_interval: MIN_FORCED_REFRESH_INTERVAL,
        }
    }

    /// Override the minimum spacing between forced refreshes.
    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Return the key set for `issuer`, fetching according to `refresh`.
    ///
    /// A [`Refresh::KeyMiss`] within the minimum interval of the previous
    /// one returns the cached set without fetching.
    pub async fn get_or_fetch(
        &self,
        fetcher: &dyn JwksFetcher,
        issuer: &str,
        jwks_uri: &str,
        refresh: Refresh,
    ) -> Result<JwkSet, IdpError> {
        match refresh {
            Refresh::IfStale => {
                if let Some(cached) = self.inner.get(issuer) {
                    if cached.fetched_at.elapsed() < self.ttl {
                        return Ok(cached.keys.clone());
                    }
                }
            }
            Refresh::KeyMiss => {
                let throttled = self
                    .forced
                    .get(issuer)
                    .is_some_and(|last| last.elapsed() < self.min_refresh_interval);
                if throttled {
                    if let Some(cached) = self.inner.get(issuer) {
                        debug!(issuer = %issuer, "Forced JWKS refresh throttled");
                        return Ok(cached.keys.clone());
                    }
                }
                self.forced.insert(issuer.to_string(), Instant::now());
            }
            Refresh::Always => {}
        }

        debug!(issuer = %issuer, jwks_uri = %jwks_uri, "Fetching JWKS");
        let keys = fetcher.fetch(jwks_uri).await?;

        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(keys)
    }

    /// Drop the cached key set for one issuer.
    pub fn invalidate(&self, issuer: &str) {
        self.inner.remove(issuer);
        self.forced.remove(issuer);
    }

    /// Drop every cached key set.
    pub fn clear(&self) {
        self.inner.clear();
        self.forced.clear();
    }

    /// Number of issuers with a cached key set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Select a verification key from a key set.
///
/// With a `kid`, only the key carrying that id is eligible. Without one, the
/// first usable signing key wins.
#[must_use]
pub fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Option<VerificationKey> {
    match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .filter(|jwk| jwk.common.key_id.as_deref() == Some(kid))
            .find_map(jwk_to_key),
        None => jwks.keys.iter().find_map(jwk_to_key),
    }
}

fn jwk_to_key(jwk: &Jwk) -> Option<VerificationKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .ok()
            .map(|key| VerificationKey {
                key,
                algorithms: RSA_ALGORITHMS.to_vec(),
            }),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
            .ok()
            .map(|key| VerificationKey {
                key,
                algorithms: vec![Algorithm::ES256, Algorithm::ES384],
            }),
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x)
            .ok()
            .map(|key| VerificationKey {
                key,
                algorithms: vec![Algorithm::EdDSA],
            }),
        AlgorithmParameters::OctetKey(oct) => {
            base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &oct.value)
                .ok()
                .map(|secret| VerificationKey::hmac(&secret))
        }
    }
}
