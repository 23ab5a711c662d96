//! Credential verification shared by every login method.
//!
//! A verifier turns a presented credential into a [`VerifiedIdentity`]; token issuance is
//! the same for all of them and lives in [`crate::identity::token::AccessTokenIssuer`].

use std::{fmt, net::IpAddr, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{error::AuthError, policy::TokenPolicy, secret_codec::SecretCodec};
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    UniversalAuth,
    GcpAuth,
}

impl AuthMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UniversalAuth => "universal-auth",
            Self::GcpAuth => "gcp-auth",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "universal-auth" => Ok(Self::UniversalAuth),
            "gcp-auth" => Ok(Self::GcpAuth),
            other => Err(AuthError::validation(format!("unknown auth method: {other}"))),
        }
    }
}

/// A credential that passed verification, with the policy its token must follow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub identity_id: Uuid,
    pub auth_method: AuthMethod,
    pub auth_config_id: Uuid,
    pub policy: TokenPolicy,
    /// Set for client secret logins; the issuer redeems it atomically with token creation.
    pub client_secret_id: Option<Uuid>,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    type Credential: Send + Sync;

    /// # Errors
    /// Returns `NotFound`, `Unauthorized`, `IpBlocked` or a store failure.
    async fn verify(
        &self,
        credential: &Self::Credential,
        source_ip: IpAddr,
        now: OffsetDateTime,
    ) -> Result<VerifiedIdentity, AuthError>;
}

#[derive(Debug)]
pub struct ClientSecretCredential {
    pub client_id: Uuid,
    pub client_secret: SecretString,
}

/// Universal Auth: client ID plus client secret.
#[derive(Clone)]
pub struct ClientSecretVerifier {
    store: Arc<dyn Store>,
    codec: SecretCodec,
}

impl ClientSecretVerifier {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, codec: SecretCodec) -> Self {
        Self { store, codec }
    }
}

#[async_trait]
impl CredentialVerifier for ClientSecretVerifier {
    type Credential = ClientSecretCredential;

    async fn verify(
        &self,
        credential: &ClientSecretCredential,
        source_ip: IpAddr,
        _now: OffsetDateTime,
    ) -> Result<VerifiedIdentity, AuthError> {
        let config = self
            .store
            .find_universal_auth_by_client_id(credential.client_id)
            .await?
            .ok_or(AuthError::NotFound("universal auth"))?;

        if !config.client_secret_trusted_ips.is_allowed(source_ip) {
            warn!(
                identity_id = %config.identity_id,
                source_ip = %source_ip,
                "client secret login blocked by trusted IPs"
            );
            return Err(AuthError::IpBlocked);
        }

        // Revoked secrets stay candidates so a match reports SecretRevoked, not Unauthorized.
        let secrets = self.store.list_client_secrets(config.id).await?;
        let codec = self.codec.clone();
        let plaintext = SecretString::from(credential.client_secret.expose_secret().to_owned());
        let matched = tokio::task::spawn_blocking(move || {
            codec
                .find_match(plaintext.expose_secret(), &secrets, |secret| {
                    secret.hash.as_str()
                })
                .map(|secret| secret.id)
        })
        .await
        .map_err(|err| AuthError::Store(anyhow!("client secret verification failed: {err}")))?;

        let Some(client_secret_id) = matched else {
            warn!(identity_id = %config.identity_id, "client secret did not match");
            return Err(AuthError::Unauthorized);
        };

        Ok(VerifiedIdentity {
            identity_id: config.identity_id,
            auth_method: AuthMethod::UniversalAuth,
            auth_config_id: config.id,
            policy: config.policy,
            client_secret_id: Some(client_secret_id),
        })
    }
}
