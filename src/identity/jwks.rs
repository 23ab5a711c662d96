//! RS256 JWT verification against a JSON Web Key Set.
//!
//! Keys are cached in memory for five minutes; an unknown `kid` forces a refresh (at most
//! once per cooldown window). A failed refresh keeps the last known keys.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime},
};

use anyhow::{Context, Result, anyhow};
use base64ct::{Base64UrlUnpadded, Encoding};
use reqwest::{
    Client,
    header::{ETAG, IF_NONE_MATCH},
};
use rsa::{
    BigUint, RsaPublicKey,
    errors::Error as RsaError,
    pkcs1v15::{Signature, VerifyingKey},
    signature::Verifier,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{Instrument, info, info_span, warn};
use url::Url;

pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const KEYSET_CACHE_TTL_SECONDS: u64 = 300;
const KEYSET_REFRESH_COOLDOWN_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("rsa error")]
    Rsa(#[from] RsaError),
    #[error("invalid signature")]
    InvalidSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// # Errors
    /// Returns an error if `s` is not a JWKS document.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    #[must_use]
    pub fn find_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }

}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    pub kid: String,
    pub n: String,
    pub e: String,
}

impl Jwk {
    /// # Errors
    /// Returns an error if the modulus or exponent is not valid base64url or not a usable key.
    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, JwtError> {
        let n_bytes = Base64UrlUnpadded::decode_vec(&self.n).map_err(|_| JwtError::Base64)?;
        let e_bytes = Base64UrlUnpadded::decode_vec(&self.e).map_err(|_| JwtError::Base64)?;
        let n = BigUint::from_bytes_be(&n_bytes);
        let e = BigUint::from_bytes_be(&e_bytes);
        RsaPublicKey::new(n, e).map_err(JwtError::Rsa)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct JwtHeader {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
    kid: String,
}

fn b64d_json<T: DeserializeOwned>(s: &str) -> Result<T, JwtError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| JwtError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Check the RS256 signature of `token` against `jwks` and decode its claims.
/// Claim semantics (issuer, audience, expiry) are left to the caller.
///
/// # Errors
/// Returns an error if the token is malformed, the `kid` is unknown or the signature is invalid.
pub fn verify_rs256<C: DeserializeOwned>(token: &str, jwks: &Jwks) -> Result<C, JwtError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(JwtError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(JwtError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(JwtError::TokenFormat)?;
    if parts.next().is_some() {
        return Err(JwtError::TokenFormat);
    }

    let header: JwtHeader = b64d_json(header_b64)?;
    if header.alg != "RS256" {
        return Err(JwtError::UnsupportedAlg(header.alg));
    }

    let jwk = jwks
        .find_by_kid(&header.kid)
        .ok_or_else(|| JwtError::UnknownKid(header.kid.clone()))?;

    let public_key = jwk.to_rsa_public_key()?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| JwtError::Base64)?;
    let signature =
        Signature::try_from(signature_bytes.as_slice()).map_err(|_| JwtError::InvalidSignature)?;
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| JwtError::InvalidSignature)?;

    b64d_json(claims_b64)
}

#[derive(Debug)]
enum KeysetSource {
    /// Keys supplied at construction and never refreshed.
    Static,
    /// Keys fetched from the provider's JWKS endpoint.
    Remote { url: String, client: Client },
}

#[derive(Debug, Clone)]
struct KeysetCache {
    jwks: Jwks,
    fetched_at: Instant,
    etag: Option<String>,
}

impl KeysetCache {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < Duration::from_secs(KEYSET_CACHE_TTL_SECONDS)
    }
}

/// Cached provider signing keys.
#[derive(Debug)]
pub struct JwksCache {
    keyset_source: KeysetSource,
    keyset_cache: RwLock<KeysetCache>,
    last_refresh_unix: AtomicU64,
}

impl JwksCache {
    #[must_use]
    pub fn new_static(jwks: Jwks) -> Self {
        Self {
            keyset_source: KeysetSource::Static,
            keyset_cache: RwLock::new(KeysetCache {
                jwks,
                fetched_at: Instant::now(),
                etag: None,
            }),
            last_refresh_unix: AtomicU64::new(0),
        }
    }

    /// Keys are fetched lazily on first use.
    ///
    /// # Errors
    /// Returns an error if the URL is not https or the HTTP client cannot be built.
    pub fn new_remote(url: String) -> Result<Self> {
        let parsed = Url::parse(&url).context("Invalid JWKS URL")?;
        if parsed.scheme() != "https" {
            return Err(anyhow!("JWKS URL must use https: {url}"));
        }
        let client = Client::builder()
            .use_rustls_tls()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build JWKS HTTP client")?;
        Ok(Self {
            keyset_source: KeysetSource::Remote { url, client },
            keyset_cache: RwLock::new(KeysetCache {
                jwks: Jwks { keys: Vec::new() },
                fetched_at: stale_instant(),
                etag: None,
            }),
            last_refresh_unix: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match &self.keyset_source {
            KeysetSource::Static => None,
            KeysetSource::Remote { url, .. } => Some(url.as_str()),
        }
    }

    /// Verify `token` and decode its claims; an unknown `kid` triggers one refresh and retry.
    ///
    /// # Errors
    /// Returns the verification error of the last attempt.
    pub async fn verify<C: DeserializeOwned>(&self, token: &str) -> Result<C, JwtError> {
        let jwks = self.snapshot().await;
        match verify_rs256(token, &jwks) {
            Err(JwtError::UnknownKid(kid)) => match self.refresh_on_unknown_kid().await {
                Ok(true) => verify_rs256(token, &self.snapshot().await),
                Ok(false) => Err(JwtError::UnknownKid(kid)),
                Err(err) => {
                    warn!(error = %err, kid = %kid, "jwks refresh on unknown kid failed");
                    Err(JwtError::UnknownKid(kid))
                }
            },
            other => other,
        }
    }

    /// Current keys; refreshes when stale and keeps the old keys if that fails.
    async fn snapshot(&self) -> Jwks {
        let (cached, fresh) = {
            let cache = self.keyset_cache.read().await;
            (cache.jwks.clone(), cache.is_fresh())
        };
        if fresh {
            return cached;
        }

        if let KeysetSource::Remote { url, .. } = &self.keyset_source
            && let Err(err) = self.refresh().await
        {
            warn!(error = %err, url = %url, "failed to refresh jwks cache");
            return cached;
        }

        self.keyset_cache.read().await.jwks.clone()
    }

    async fn refresh(&self) -> Result<()> {
        let (url, client, etag) = match &self.keyset_source {
            KeysetSource::Static => return Ok(()),
            KeysetSource::Remote { url, client } => {
                let etag = self.keyset_cache.read().await.etag.clone();
                (url.clone(), client.clone(), etag)
            }
        };

        self.last_refresh_unix
            .store(now_unix_seconds(), Ordering::Relaxed);
        match fetch_jwks(&client, &url, etag.as_deref()).await? {
            FetchOutcome::NotModified => {
                self.keyset_cache.write().await.fetched_at = Instant::now();
            }
            FetchOutcome::Updated { jwks, etag } => {
                let mut cache = self.keyset_cache.write().await;
                cache.jwks = jwks;
                cache.fetched_at = Instant::now();
                cache.etag = etag;
                info!(keys = cache.jwks.keys.len(), "jwks cache refreshed");
            }
        }
        Ok(())
    }

    /// Refresh because a token named an unknown `kid`, unless a refresh ran within the cooldown.
    async fn refresh_on_unknown_kid(&self) -> Result<bool> {
        if matches!(&self.keyset_source, KeysetSource::Static) {
            return Ok(false);
        }
        let now = now_unix_seconds();
        let last = self.last_refresh_unix.load(Ordering::Relaxed);
        if now.saturating_sub(last) < KEYSET_REFRESH_COOLDOWN_SECONDS {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }
}

fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn stale_instant() -> Instant {
    Instant::now()
        .checked_sub(Duration::from_secs(KEYSET_CACHE_TTL_SECONDS + 1))
        .unwrap_or_else(Instant::now)
}

enum FetchOutcome {
    NotModified,
    Updated { jwks: Jwks, etag: Option<String> },
}

async fn fetch_jwks(client: &Client, url: &str, etag: Option<&str>) -> Result<FetchOutcome> {
    let span = info_span!("jwks.fetch", http.method = "GET", url = %url);
    async {
        let mut request = client.get(url);
        if let Some(etag_value) = etag {
            request = request.header(IF_NONE_MATCH, etag_value);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 304 {
            return Ok(FetchOutcome::NotModified);
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(anyhow!("jwks fetch failed: {status}"));
        }

        let jwks = Jwks::from_json(&body).context("Invalid JWKS JSON")?;
        Ok(FetchOutcome::Updated { jwks, etag })
    }
    .instrument(span)
    .await
}
