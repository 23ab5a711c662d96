//! Access token minting, use accounting and revocation.
//!
//! Flow Overview:
//! 1) Check the caller against the policy's access token trusted IPs.
//! 2) Build the token record (expiry capped by max TTL) and sign a PASETO v4.public bearer.
//! 3) Persist the record; for client secret logins the secret's use is counted in the same step.
//!
//! Each later use of the bearer is counted against the token's own limit and renews periodic
//! tokens, never past the max TTL ceiling fixed at issuance.

use std::{fmt, net::IpAddr, sync::Arc};

use anyhow::{Context, anyhow};
use ed25519_dalek::SigningKey;
use pasetors::{
    Public,
    footer::Footer,
    keys::{AsymmetricPublicKey, AsymmetricSecretKey},
    paserk::{FormatAsPaserk, Id},
    token::UntrustedToken,
    version4::{PublicToken, V4},
};
use rand::{RngCore, rngs::OsRng};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::warn;
use uuid::Uuid;

use super::{
    error::AuthError,
    trusted_ip::TrustedIpList,
    verifier::{AuthMethod, VerifiedIdentity},
};
use crate::store::{Store, UseOutcome};

pub const TOKEN_TYPE: &str = "Bearer";

/// Persisted state of an issued access token. The bearer string itself is never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessTokenRecord {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub auth_method: AuthMethod,
    pub auth_config_id: Uuid,
    pub client_secret_id: Option<Uuid>,
    pub issued_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    /// `issued_at + max_ttl`; renewal never moves `expires_at` past it.
    pub max_expires_at: Option<OffsetDateTime>,
    pub ttl: u64,
    pub max_ttl: u64,
    pub period: u64,
    pub num_uses: u64,
    pub num_uses_limit: u64,
    /// Snapshot of the policy's access token trusted IPs at issuance.
    pub trusted_ips: TrustedIpList,
    pub is_revoked: bool,
    pub last_used_at: Option<OffsetDateTime>,
}

pub(crate) fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

impl AccessTokenRecord {
    /// Build the record for a fresh token.
    ///
    /// Periodic tokens live for one period, others for `ttl` (none when `ttl = 0`); either way
    /// the first expiry is capped at `issued_at + max_ttl` when `max_ttl > 0`.
    #[must_use]
    pub fn mint(identity: &VerifiedIdentity, now: OffsetDateTime) -> Self {
        let policy = &identity.policy;
        let max_expires_at = (policy.access_token_max_ttl > 0)
            .then(|| now.checked_add(seconds(policy.access_token_max_ttl)))
            .flatten();
        let window = if policy.is_periodic() {
            Some(policy.access_token_period)
        } else if policy.access_token_ttl > 0 {
            Some(policy.access_token_ttl)
        } else {
            None
        };
        let window_end = window.and_then(|window| now.checked_add(seconds(window)));

        Self {
            id: Uuid::new_v4(),
            identity_id: identity.identity_id,
            auth_method: identity.auth_method,
            auth_config_id: identity.auth_config_id,
            client_secret_id: identity.client_secret_id,
            issued_at: now,
            expires_at: earliest(window_end, max_expires_at),
            max_expires_at,
            ttl: policy.access_token_ttl,
            max_ttl: policy.access_token_max_ttl,
            period: policy.access_token_period,
            num_uses: 0,
            num_uses_limit: policy.access_token_num_uses_limit,
            trusted_ips: policy.access_token_trusted_ips.clone(),
            is_revoked: false,
            last_used_at: None,
        }
    }

    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        self.period > 0
    }

    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    #[must_use]
    pub const fn exceeds_limit_on_next_use(&self) -> bool {
        self.num_uses_limit > 0 && self.num_uses + 1 > self.num_uses_limit
    }

    /// Expiry after a use at `now`: periodic tokens move to `now + period` (never earlier than
    /// the current expiry, never past the ceiling); fixed tokens keep theirs.
    #[must_use]
    pub fn renewed_expiry(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        if !self.is_periodic() {
            return self.expires_at;
        }
        let candidate = now.checked_add(seconds(self.period));
        let extended = match (self.expires_at, candidate) {
            (Some(current), Some(candidate)) => Some(current.max(candidate)),
            (current, candidate) => current.or(candidate),
        };
        earliest(extended, self.max_expires_at)
    }

    /// Count one use. Going past the limit revokes the token instead.
    pub fn consume(&mut self, now: OffsetDateTime, renew: bool) -> UseOutcome<()> {
        if self.is_revoked {
            return UseOutcome::Revoked;
        }
        if self.is_expired(now) {
            return UseOutcome::Expired;
        }
        if self.exceeds_limit_on_next_use() {
            self.is_revoked = true;
            return UseOutcome::LimitExceeded;
        }
        self.num_uses += 1;
        self.last_used_at = Some(now);
        if renew {
            self.expires_at = self.renewed_expiry(now);
        }
        UseOutcome::Counted(())
    }

    /// Seconds from issuance to the first expiry; `0` when the token has none.
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        self.expires_at
            .map(|expires_at| (expires_at - self.issued_at).whole_seconds())
            .and_then(|secs| u64::try_from(secs).ok())
            .unwrap_or(0)
    }
}

fn earliest(
    a: Option<OffsetDateTime>,
    b: Option<OffsetDateTime>,
) -> Option<OffsetDateTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    /// Identity the token was minted for.
    pub sub: Uuid,
    /// Token record id.
    pub jti: Uuid,
    #[serde(rename = "authMethod")]
    pub auth_method: AuthMethod,
    pub iat: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenFooter {
    kid: String,
}

/// Ed25519 key that signs and verifies this service's bearer tokens.
pub struct TokenSigner {
    secret_key: AsymmetricSecretKey<V4>,
    public_key: AsymmetricPublicKey<V4>,
    key_id: String,
    issuer: String,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("key_id", &self.key_id)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Build a signer with a random key; tokens do not survive a restart.
    ///
    /// # Errors
    /// Returns an error if the OS RNG fails or the key ID cannot be derived.
    pub fn generate(issuer: impl Into<String>) -> Result<Self, AuthError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|err| AuthError::Store(anyhow!("failed to generate signing key: {err}")))?;
        Self::from_seed(&seed, issuer)
    }

    /// # Errors
    /// Returns an error if the key ID cannot be derived.
    pub fn from_seed(seed: &[u8; 32], issuer: impl Into<String>) -> Result<Self, AuthError> {
        let verifying_key = SigningKey::from_bytes(seed).verifying_key();
        // PASETO v4 secret keys are the seed followed by the public key.
        let mut keypair = [0u8; 64];
        keypair[..32].copy_from_slice(seed);
        keypair[32..].copy_from_slice(verifying_key.as_bytes());
        let secret_key = AsymmetricSecretKey::<V4>::from(&keypair)
            .map_err(|_| AuthError::Store(anyhow!("invalid Ed25519 secret key")))?;
        let public_key = AsymmetricPublicKey::<V4>::from(verifying_key.as_bytes())
            .map_err(|_| AuthError::Store(anyhow!("invalid Ed25519 public key")))?;
        let mut key_id = String::new();
        Id::from(&public_key)
            .fmt(&mut key_id)
            .map_err(|_| AuthError::Store(anyhow!("failed to derive PASERK id")))?;
        Ok(Self {
            secret_key,
            public_key,
            key_id,
            issuer: issuer.into(),
        })
    }

    /// Parse a 64 character hex seed.
    ///
    /// # Errors
    /// Returns `Validation` if the seed is not 32 hex-encoded bytes.
    pub fn from_hex_seed(seed: &str, issuer: impl Into<String>) -> Result<Self, AuthError> {
        let bytes = hex::decode(seed.trim())
            .map_err(|_| AuthError::validation("token signing seed must be hex"))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::validation("token signing seed must be 32 bytes"))?;
        Self::from_seed(&seed, issuer)
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign the bearer for `record`.
    ///
    /// # Errors
    /// Returns an error if claim encoding fails.
    pub fn sign(&self, record: &AccessTokenRecord) -> Result<SecretString, AuthError> {
        let iat = record
            .issued_at
            .replace_nanosecond(0)
            .context("strip iat nanoseconds")?
            .format(&Rfc3339)
            .context("format iat")?;
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: record.identity_id,
            jti: record.id,
            auth_method: record.auth_method,
            iat,
        };
        let footer = TokenFooter {
            kid: self.key_id.clone(),
        };

        let payload = serde_json::to_vec(&claims).context("encode access token claims")?;
        let footer = serde_json::to_vec(&footer).context("encode access token footer")?;
        let token = PublicToken::sign(&self.secret_key, &payload, Some(&footer), None)
            .map_err(|err| AuthError::Store(anyhow!("failed to sign access token: {err}")))?;
        Ok(SecretString::from(token))
    }

    /// Check the signature, key ID and issuer of a bearer and return its claims.
    ///
    /// # Errors
    /// Returns `Unauthorized` for anything that is not a token this signer issued.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let untrusted =
            UntrustedToken::<Public, V4>::try_from(token).map_err(|_| AuthError::Unauthorized)?;
        let kid = footer_kid(untrusted.untrusted_footer()).ok_or(AuthError::Unauthorized)?;
        if kid != self.key_id {
            return Err(AuthError::Unauthorized);
        }
        let trusted = PublicToken::verify(&self.public_key, &untrusted, None, None)
            .map_err(|_| AuthError::Unauthorized)?;
        let claims: TokenClaims =
            serde_json::from_str(trusted.payload()).map_err(|_| AuthError::Unauthorized)?;
        if claims.iss != self.issuer {
            return Err(AuthError::Unauthorized);
        }
        Ok(claims)
    }
}

fn footer_kid(footer_bytes: &[u8]) -> Option<String> {
    if footer_bytes.is_empty() {
        return None;
    }
    let mut footer = Footer::new();
    footer.parse_bytes(footer_bytes).ok()?;
    footer
        .get_claim("kid")
        .and_then(|value| value.as_str())
        .map(ToString::to_string)
}

/// Login response body.
#[derive(Debug)]
pub struct IssuedAccessToken {
    pub access_token: SecretString,
    pub expires_in: u64,
    pub access_token_max_ttl: u64,
    pub token_type: &'static str,
    pub token_id: Uuid,
}

#[derive(Clone)]
pub struct AccessTokenIssuer {
    store: Arc<dyn Store>,
    signer: Arc<TokenSigner>,
}

impl AccessTokenIssuer {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, signer: Arc<TokenSigner>) -> Self {
        Self { store, signer }
    }

    #[must_use]
    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Turn a verified login into a bearer token.
    ///
    /// # Errors
    /// `IpBlocked` when the source is outside the access token trusted IPs; for client secret
    /// logins `SecretRevoked`, `SecretExpired` or `SecretUsesExceeded` (the secret is revoked).
    pub async fn issue(
        &self,
        identity: &VerifiedIdentity,
        source_ip: IpAddr,
        now: OffsetDateTime,
    ) -> Result<IssuedAccessToken, AuthError> {
        if !identity.policy.access_token_trusted_ips.is_allowed(source_ip) {
            warn!(
                identity_id = %identity.identity_id,
                source_ip = %source_ip,
                "login blocked by access token trusted IPs"
            );
            return Err(AuthError::IpBlocked);
        }

        let record = AccessTokenRecord::mint(identity, now);
        let access_token = self.signer.sign(&record)?;

        match identity.client_secret_id {
            Some(secret_id) => match self.store.redeem_client_secret(secret_id, &record).await? {
                UseOutcome::Counted(()) => {}
                UseOutcome::LimitExceeded => {
                    warn!(
                        identity_id = %identity.identity_id,
                        client_secret_id = %secret_id,
                        "client secret exceeded its usage limit and was revoked"
                    );
                    return Err(AuthError::SecretUsesExceeded);
                }
                UseOutcome::Revoked => {
                    warn!(client_secret_id = %secret_id, "revoked client secret presented");
                    return Err(AuthError::SecretRevoked);
                }
                UseOutcome::Expired => return Err(AuthError::SecretExpired),
                UseOutcome::Missing => return Err(AuthError::Unauthorized),
            },
            None => self.store.insert_access_token(&record).await?,
        }

        Ok(IssuedAccessToken {
            access_token,
            expires_in: record.expires_in(),
            access_token_max_ttl: record.max_ttl,
            token_type: TOKEN_TYPE,
            token_id: record.id,
        })
    }

    /// Validate and count one use of a bearer token.
    ///
    /// # Errors
    /// `Unauthorized` for unknown or forged tokens, `TokenRevoked`, `TokenExpired`,
    /// `IpBlocked`, or `TokenUsesExceeded` (the token is revoked).
    pub async fn authenticate(
        &self,
        bearer: &str,
        source_ip: IpAddr,
        now: OffsetDateTime,
    ) -> Result<AccessTokenRecord, AuthError> {
        let claims = self.signer.verify(bearer)?;
        let record = self
            .store
            .find_access_token(claims.jti)
            .await?
            .filter(|record| record.identity_id == claims.sub)
            .ok_or(AuthError::Unauthorized)?;

        if record.is_revoked {
            return Err(AuthError::TokenRevoked);
        }
        if record.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }
        if !record.trusted_ips.is_allowed(source_ip) {
            warn!(
                identity_id = %record.identity_id,
                source_ip = %source_ip,
                "access token use blocked by trusted IPs"
            );
            return Err(AuthError::IpBlocked);
        }

        match self.store.use_access_token(record.id, now).await? {
            UseOutcome::Counted(record) => Ok(record),
            UseOutcome::LimitExceeded => {
                warn!(
                    identity_id = %record.identity_id,
                    token_id = %record.id,
                    "access token exceeded its usage limit and was revoked"
                );
                Err(AuthError::TokenUsesExceeded)
            }
            UseOutcome::Revoked => Err(AuthError::TokenRevoked),
            UseOutcome::Expired => Err(AuthError::TokenExpired),
            UseOutcome::Missing => Err(AuthError::Unauthorized),
        }
    }

    /// Revoke the token behind `bearer`. Revoking twice is not an error.
    ///
    /// # Errors
    /// `Unauthorized` if the bearer is not one of ours.
    pub async fn revoke(
        &self,
        bearer: &str,
        now: OffsetDateTime,
    ) -> Result<AccessTokenRecord, AuthError> {
        let claims = self.signer.verify(bearer)?;
        self.store
            .revoke_access_token(claims.jti, now)
            .await?
            .filter(|record| record.identity_id == claims.sub)
            .ok_or(AuthError::Unauthorized)
    }
}
