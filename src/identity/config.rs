//! Per-identity Universal Auth configuration.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    error::AuthError,
    policy::{TokenPolicy, TokenPolicyPatch},
    trusted_ip::{TrustedIp, TrustedIpList},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UniversalAuthConfig {
    pub id: Uuid,
    pub identity_id: Uuid,
    /// Public half of the client credential, presented at login.
    pub client_id: Uuid,
    #[serde(flatten)]
    pub policy: TokenPolicy,
    #[schema(value_type = Vec<TrustedIp>)]
    pub client_secret_trusted_ips: TrustedIpList,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

/// Attach/update payload. On attach, absent fields take the defaults; on update they keep
/// the stored value.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UniversalAuthInput {
    #[serde(flatten)]
    pub policy: TokenPolicyPatch,
    #[serde(default)]
    pub client_secret_trusted_ips: Option<Vec<TrustedIp>>,
}

impl UniversalAuthConfig {
    /// Build a fresh config with a new client ID.
    ///
    /// # Errors
    /// Returns `Validation` if the resulting TTL bounds or IP lists are invalid.
    pub fn attach(
        identity_id: Uuid,
        input: &UniversalAuthInput,
        now: OffsetDateTime,
    ) -> Result<Self, AuthError> {
        let policy = TokenPolicy::universal_auth_default().apply(&input.policy)?;
        let client_secret_trusted_ips = match &input.client_secret_trusted_ips {
            Some(entries) => TrustedIpList::new(entries.clone())?,
            None => TrustedIpList::allow_all(),
        };
        Ok(Self {
            id: Uuid::new_v4(),
            identity_id,
            client_id: Uuid::new_v4(),
            policy,
            client_secret_trusted_ips,
            created_at: now,
            updated_at: now,
        })
    }

    /// Merge `input` onto this config; TTL bounds are checked on the merged values.
    ///
    /// # Errors
    /// Returns `Validation` if the merged config is invalid. `self` is left untouched.
    pub fn apply(&self, input: &UniversalAuthInput, now: OffsetDateTime) -> Result<Self, AuthError> {
        let policy = self.policy.apply(&input.policy)?;
        let client_secret_trusted_ips = match &input.client_secret_trusted_ips {
            Some(entries) => TrustedIpList::new(entries.clone())?,
            None => self.client_secret_trusted_ips.clone(),
        };
        Ok(Self {
            policy,
            client_secret_trusted_ips,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Whether either allow-list narrows access below "everything".
    #[must_use]
    pub fn restricts_network(&self) -> bool {
        self.client_secret_trusted_ips.is_restricted()
            || self.policy.access_token_trusted_ips.is_restricted()
    }
}
