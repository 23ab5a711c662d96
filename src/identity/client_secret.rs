//! Client secret records and their sanitized projection.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{error::AuthError, policy::MAX_TTL_SECONDS, secret_codec::GeneratedSecret};
use crate::store::UseOutcome;

/// Stored form of a client secret. Holds the hash, never the plaintext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSecret {
    pub id: Uuid,
    /// Owning Universal Auth config.
    pub identity_ua_id: Uuid,
    pub identity_id: Uuid,
    pub description: String,
    pub prefix: String,
    pub hash: String,
    pub num_uses: u64,
    pub num_uses_limit: u64,
    pub ttl: u64,
    pub is_revoked: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewClientSecret {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub num_uses_limit: u64,
    #[serde(default)]
    pub ttl: u64,
}

/// Listing/get projection: prefix and metadata only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientSecretView {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
    pub description: String,
    pub client_secret_prefix: String,
    pub client_secret_num_uses: u64,
    pub client_secret_num_uses_limit: u64,
    #[serde(rename = "clientSecretTTL")]
    pub client_secret_ttl: u64,
    #[serde(rename = "identityUAId")]
    pub identity_ua_id: Uuid,
    pub is_client_secret_revoked: bool,
}

/// Result of creating a secret: the only time the plaintext is available.
#[derive(Debug)]
pub struct IssuedClientSecret {
    pub client_secret: SecretString,
    pub record: ClientSecretView,
}

impl NewClientSecret {
    /// # Errors
    /// Returns `Validation` if `ttl` exceeds ten years.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.ttl > MAX_TTL_SECONDS {
            return Err(AuthError::validation(format!(
                "ttl must not exceed {MAX_TTL_SECONDS}"
            )));
        }
        Ok(())
    }
}

impl ClientSecret {
    /// Build the record for a freshly generated secret.
    #[must_use]
    pub fn new(
        identity_ua_id: Uuid,
        identity_id: Uuid,
        request: &NewClientSecret,
        generated: &GeneratedSecret,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_ua_id,
            identity_id,
            description: request.description.trim().to_string(),
            prefix: generated.prefix.clone(),
            hash: generated.hash.clone(),
            num_uses: 0,
            num_uses_limit: request.num_uses_limit,
            ttl: request.ttl,
            is_revoked: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// `now > created_at + ttl`, only when `ttl > 0`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        if self.ttl == 0 {
            return false;
        }
        let ttl = Duration::seconds(i64::try_from(self.ttl).unwrap_or(i64::MAX));
        self.created_at
            .checked_add(ttl)
            .is_some_and(|expires_at| now > expires_at)
    }

    /// Whether one more use would go past the limit.
    #[must_use]
    pub const fn exceeds_limit_on_next_use(&self) -> bool {
        self.num_uses_limit > 0 && self.num_uses + 1 > self.num_uses_limit
    }

    /// Count one use, revoking the secret instead when the use would exceed the limit.
    pub fn consume(&mut self, now: OffsetDateTime) -> UseOutcome<()> {
        if self.is_revoked {
            return UseOutcome::Revoked;
        }
        if self.exceeds_limit_on_next_use() {
            self.is_revoked = true;
            self.updated_at = now;
            return UseOutcome::LimitExceeded;
        }
        self.num_uses += 1;
        self.updated_at = now;
        UseOutcome::Counted(())
    }

    #[must_use]
    pub fn view(&self) -> ClientSecretView {
        ClientSecretView {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            description: self.description.clone(),
            client_secret_prefix: self.prefix.clone(),
            client_secret_num_uses: self.num_uses,
            client_secret_num_uses_limit: self.num_uses_limit,
            client_secret_ttl: self.ttl,
            identity_ua_id: self.identity_ua_id,
            is_client_secret_revoked: self.is_revoked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::secret_codec::test_codec;
    use secrecy::ExposeSecret;

    fn secret(ttl: u64, limit: u64) -> Result<(ClientSecret, GeneratedSecret), AuthError> {
        let generated = test_codec().generate()?;
        let request = NewClientSecret {
            description: "  ci runner ".to_string(),
            num_uses_limit: limit,
            ttl,
        };
        let record = ClientSecret::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &request,
            &generated,
            OffsetDateTime::UNIX_EPOCH,
        );
        Ok((record, generated))
    }

    #[test]
    fn expiry_is_strictly_after_ttl() -> Result<(), AuthError> {
        let (record, _) = secret(1, 0)?;
        let created = record.created_at;
        assert!(!record.is_expired(created));
        assert!(!record.is_expired(created + Duration::seconds(1)));
        assert!(record.is_expired(created + Duration::seconds(2)));

        let (forever, _) = secret(0, 0)?;
        assert!(!forever.is_expired(created + Duration::days(36_500)));
        Ok(())
    }

    #[test]
    fn limit_check_counts_the_next_use() -> Result<(), AuthError> {
        let (mut record, _) = secret(0, 3)?;
        for uses in 0..3 {
            record.num_uses = uses;
            assert!(!record.exceeds_limit_on_next_use());
        }
        record.num_uses = 3;
        assert!(record.exceeds_limit_on_next_use());

        let (mut unlimited, _) = secret(0, 0)?;
        unlimited.num_uses = u64::from(u32::MAX);
        assert!(!unlimited.exceeds_limit_on_next_use());
        Ok(())
    }

    #[test]
    fn consume_revokes_once_limit_is_spent() -> Result<(), AuthError> {
        let (mut record, _) = secret(0, 2)?;
        let now = record.created_at;
        assert_eq!(record.consume(now), UseOutcome::Counted(()));
        assert_eq!(record.consume(now), UseOutcome::Counted(()));
        assert_eq!(record.num_uses, 2);
        assert_eq!(record.consume(now), UseOutcome::LimitExceeded);
        assert!(record.is_revoked);
        assert_eq!(record.num_uses, 2);
        assert_eq!(record.consume(now), UseOutcome::Revoked);
        Ok(())
    }

    #[test]
    fn view_never_exposes_hash_or_plaintext() -> anyhow::Result<()> {
        let (record, generated) = secret(0, 0)?;
        let json = serde_json::to_string(&record.view())?;
        assert!(!json.contains(&record.hash));
        assert!(!json.contains(generated.plaintext.expose_secret()));
        assert!(json.contains(&record.prefix));
        assert!(json.contains("\"clientSecretTTL\""));
        assert!(json.contains("\"identityUAId\""));
        assert_eq!(record.description, "ci runner");
        Ok(())
    }

    #[test]
    fn ttl_is_capped() {
        let request = NewClientSecret {
            ttl: MAX_TTL_SECONDS + 1,
            ..NewClientSecret::default()
        };
        assert!(matches!(request.validate(), Err(AuthError::Validation(_))));
    }
}
