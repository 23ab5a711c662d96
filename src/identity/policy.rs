//! Access token policy shared by every auth method attached to an identity.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{
    error::AuthError,
    trusted_ip::{TrustedIp, TrustedIpList},
};

/// Ten years, the ceiling for every TTL, max TTL and period.
pub const MAX_TTL_SECONDS: u64 = 315_360_000;

/// Lifetime, usage and network rules applied to tokens minted for an identity.
///
/// `ttl = 0` means the token has no TTL-based expiry and `max_ttl = 0` means there is no
/// absolute ceiling; `num_uses_limit = 0` is unlimited and `period = 0` is a fixed-expiry token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenPolicy {
    #[serde(rename = "accessTokenTTL")]
    pub access_token_ttl: u64,
    #[serde(rename = "accessTokenMaxTTL")]
    pub access_token_max_ttl: u64,
    pub access_token_num_uses_limit: u64,
    pub access_token_period: u64,
    #[schema(value_type = Vec<TrustedIp>)]
    pub access_token_trusted_ips: TrustedIpList,
}

/// Partial policy update; absent fields keep their current value.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenPolicyPatch {
    #[serde(default, rename = "accessTokenTTL")]
    pub access_token_ttl: Option<u64>,
    #[serde(default, rename = "accessTokenMaxTTL")]
    pub access_token_max_ttl: Option<u64>,
    #[serde(default)]
    pub access_token_num_uses_limit: Option<u64>,
    #[serde(default)]
    pub access_token_period: Option<u64>,
    #[serde(default)]
    pub access_token_trusted_ips: Option<Vec<TrustedIp>>,
}

impl TokenPolicy {
    /// 30 day tokens, unlimited uses, reachable from anywhere.
    #[must_use]
    pub fn universal_auth_default() -> Self {
        Self::with_lifetime(2_592_000)
    }

    /// Two hour tokens, unlimited uses, reachable from anywhere.
    #[must_use]
    pub fn gcp_auth_default() -> Self {
        Self::with_lifetime(7200)
    }

    fn with_lifetime(seconds: u64) -> Self {
        Self {
            access_token_ttl: seconds,
            access_token_max_ttl: seconds,
            access_token_num_uses_limit: 0,
            access_token_period: 0,
            access_token_trusted_ips: TrustedIpList::allow_all(),
        }
    }

    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        self.access_token_period > 0
    }

    /// Merge `patch` onto this policy and validate the merged result.
    ///
    /// # Errors
    /// Returns `Validation` if the merged TTL bounds are violated or a trusted IP list is invalid.
    pub fn apply(&self, patch: &TokenPolicyPatch) -> Result<Self, AuthError> {
        let access_token_trusted_ips = match &patch.access_token_trusted_ips {
            Some(entries) => TrustedIpList::new(entries.clone())?,
            None => self.access_token_trusted_ips.clone(),
        };
        let merged = Self {
            access_token_ttl: patch.access_token_ttl.unwrap_or(self.access_token_ttl),
            access_token_max_ttl: patch
                .access_token_max_ttl
                .unwrap_or(self.access_token_max_ttl),
            access_token_num_uses_limit: patch
                .access_token_num_uses_limit
                .unwrap_or(self.access_token_num_uses_limit),
            access_token_period: patch.access_token_period.unwrap_or(self.access_token_period),
            access_token_trusted_ips,
        };
        merged.validate()?;
        Ok(merged)
    }

    /// # Errors
    /// Returns `Validation` when `ttl > max_ttl` or any duration exceeds ten years.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.access_token_ttl > MAX_TTL_SECONDS {
            return Err(AuthError::validation(format!(
                "accessTokenTTL must not exceed {MAX_TTL_SECONDS}"
            )));
        }
        if self.access_token_max_ttl > MAX_TTL_SECONDS {
            return Err(AuthError::validation(format!(
                "accessTokenMaxTTL must not exceed {MAX_TTL_SECONDS}"
            )));
        }
        if self.access_token_period > MAX_TTL_SECONDS {
            return Err(AuthError::validation(format!(
                "accessTokenPeriod must not exceed {MAX_TTL_SECONDS}"
            )));
        }
        if self.access_token_ttl > self.access_token_max_ttl {
            return Err(AuthError::validation(
                "Access Token TTL cannot be greater than Access Token Max TTL.",
            ));
        }
        Ok(())
    }
}
