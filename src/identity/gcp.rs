//! GCP identity login: Google-signed ID tokens checked against per-identity allow-lists.

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    error::AuthError,
    jwks::JwksCache,
    policy::{TokenPolicy, TokenPolicyPatch},
    verifier::{AuthMethod, CredentialVerifier, VerifiedIdentity},
};
use crate::store::Store;

const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
const IAM_SERVICE_ACCOUNT_DOMAIN: &str = ".iam.gserviceaccount.com";

/// Which kind of Google identity token the identity logs in with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GcpAuthType {
    /// Compute Engine instance identity token (carries project and zone).
    Gce,
    /// Service account ID token minted through IAM credentials.
    Iam,
}

impl GcpAuthType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gce => "gce",
            Self::Iam => "iam",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpAuthConfig {
    pub id: Uuid,
    pub identity_id: Uuid,
    #[serde(rename = "type")]
    pub auth_type: GcpAuthType,
    /// Comma-separated; empty allows any value.
    pub allowed_service_accounts: String,
    pub allowed_projects: String,
    pub allowed_zones: String,
    #[serde(flatten)]
    pub policy: TokenPolicy,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpAuthInput {
    #[serde(default, rename = "type")]
    pub auth_type: Option<GcpAuthType>,
    #[serde(default)]
    pub allowed_service_accounts: Option<String>,
    #[serde(default)]
    pub allowed_projects: Option<String>,
    #[serde(default)]
    pub allowed_zones: Option<String>,
    #[serde(flatten)]
    pub policy: TokenPolicyPatch,
}

impl GcpAuthConfig {
    /// # Errors
    /// Returns `Validation` if `type` is missing or the TTL bounds are invalid.
    pub fn attach(
        identity_id: Uuid,
        input: &GcpAuthInput,
        now: OffsetDateTime,
    ) -> Result<Self, AuthError> {
        let auth_type = input
            .auth_type
            .ok_or_else(|| AuthError::validation("type is required"))?;
        let policy = TokenPolicy::gcp_auth_default().apply(&input.policy)?;
        Ok(Self {
            id: Uuid::new_v4(),
            identity_id,
            auth_type,
            allowed_service_accounts: normalize_list(
                input.allowed_service_accounts.as_deref().unwrap_or_default(),
            ),
            allowed_projects: normalize_list(input.allowed_projects.as_deref().unwrap_or_default()),
            allowed_zones: normalize_list(input.allowed_zones.as_deref().unwrap_or_default()),
            policy,
            created_at: now,
            updated_at: now,
        })
    }

    /// # Errors
    /// Returns `Validation` if the merged TTL bounds are invalid.
    pub fn apply(&self, input: &GcpAuthInput, now: OffsetDateTime) -> Result<Self, AuthError> {
        let policy = self.policy.apply(&input.policy)?;
        Ok(Self {
            auth_type: input.auth_type.unwrap_or(self.auth_type),
            allowed_service_accounts: input
                .allowed_service_accounts
                .as_deref()
                .map_or_else(|| self.allowed_service_accounts.clone(), normalize_list),
            allowed_projects: input
                .allowed_projects
                .as_deref()
                .map_or_else(|| self.allowed_projects.clone(), normalize_list),
            allowed_zones: input
                .allowed_zones
                .as_deref()
                .map_or_else(|| self.allowed_zones.clone(), normalize_list),
            policy,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Check an asserted principal against the allow-lists.
    #[must_use]
    pub fn permits(&self, principal: &GcpPrincipal) -> bool {
        let zones_apply = self.auth_type == GcpAuthType::Gce;
        list_permits(&self.allowed_service_accounts, Some(principal.service_account.as_str()))
            && list_permits(&self.allowed_projects, principal.project_id.as_deref())
            && (!zones_apply || list_permits(&self.allowed_zones, principal.zone.as_deref()))
    }
}

fn normalize_list(value: &str) -> String {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn list_permits(list: &str, value: Option<&str>) -> bool {
    if list.is_empty() {
        return true;
    }
    value.is_some_and(|value| list.split(',').any(|entry| entry == value))
}

/// Who a verified Google token says the caller is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcpPrincipal {
    pub service_account: String,
    pub project_id: Option<String>,
    pub zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleIdClaims {
    iss: String,
    aud: String,
    exp: i64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    google: Option<GoogleExtension>,
}

#[derive(Debug, Deserialize)]
struct GoogleExtension {
    #[serde(default)]
    compute_engine: Option<ComputeEngine>,
}

#[derive(Debug, Deserialize)]
struct ComputeEngine {
    project_id: String,
    zone: String,
}

impl GoogleIdClaims {
    fn principal(self, auth_type: GcpAuthType) -> Option<GcpPrincipal> {
        let service_account = self.email?;
        match auth_type {
            GcpAuthType::Gce => {
                let compute = self.google?.compute_engine?;
                Some(GcpPrincipal {
                    service_account,
                    project_id: Some(compute.project_id),
                    zone: Some(compute.zone),
                })
            }
            GcpAuthType::Iam => {
                let project_id = service_account
                    .split_once('@')
                    .and_then(|(_, domain)| domain.strip_suffix(IAM_SERVICE_ACCOUNT_DOMAIN))
                    .map(ToString::to_string);
                Some(GcpPrincipal {
                    service_account,
                    project_id,
                    zone: None,
                })
            }
        }
    }
}

#[derive(Debug)]
pub struct GcpCredential {
    pub identity_id: Uuid,
    pub jwt: SecretString,
}

pub struct GcpIdentityVerifier {
    store: Arc<dyn Store>,
    keys: Arc<JwksCache>,
    audience: String,
}

impl GcpIdentityVerifier {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, keys: Arc<JwksCache>, audience: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            audience: audience.into(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for GcpIdentityVerifier {
    type Credential = GcpCredential;

    async fn verify(
        &self,
        credential: &GcpCredential,
        _source_ip: IpAddr,
        now: OffsetDateTime,
    ) -> Result<VerifiedIdentity, AuthError> {
        let config = self
            .store
            .find_gcp_auth(credential.identity_id)
            .await?
            .ok_or(AuthError::NotFound("gcp auth"))?;

        let claims: GoogleIdClaims = self
            .keys
            .verify(credential.jwt.expose_secret())
            .await
            .map_err(|err| {
                warn!(identity_id = %config.identity_id, error = %err, "gcp identity token rejected");
                AuthError::Unauthorized
            })?;

        if !GOOGLE_ISSUERS.contains(&claims.iss.as_str()) {
            warn!(identity_id = %config.identity_id, iss = %claims.iss, "unexpected gcp token issuer");
            return Err(AuthError::Unauthorized);
        }
        if claims.aud != self.audience {
            warn!(identity_id = %config.identity_id, "gcp token audience mismatch");
            return Err(AuthError::Unauthorized);
        }
        if claims.exp <= now.unix_timestamp() {
            return Err(AuthError::Unauthorized);
        }

        let principal = claims
            .principal(config.auth_type)
            .ok_or(AuthError::Unauthorized)?;
        if !config.permits(&principal) {
            warn!(
                identity_id = %config.identity_id,
                service_account = %principal.service_account,
                "gcp principal not in allow-lists"
            );
            return Err(AuthError::Unauthorized);
        }

        Ok(VerifiedIdentity {
            identity_id: config.identity_id,
            auth_method: AuthMethod::GcpAuth,
            auth_config_id: config.id,
            policy: config.policy,
            client_secret_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::jwks::{
        fixtures::{jwks_for_private_key, sign_rs256},
        tests::TEST_PRIVATE_KEY_PEM,
    };
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::net::Ipv4Addr;

    const AUDIENCE: &str = "https://auth.example.test";

    fn input(auth_type: GcpAuthType) -> GcpAuthInput {
        GcpAuthInput {
            auth_type: Some(auth_type),
            allowed_service_accounts: Some(" ci@proj-a.iam.gserviceaccount.com , ".to_string()),
            allowed_projects: Some("proj-a".to_string()),
            allowed_zones: Some("us-east1-b".to_string()),
            ..GcpAuthInput::default()
        }
    }

    async fn verifier_with(
        config: &GcpAuthConfig,
    ) -> Result<GcpIdentityVerifier, AuthError> {
        let store = Arc::new(MemoryStore::new());
        store.insert_gcp_auth(config).await?;
        let jwks = jwks_for_private_key(TEST_PRIVATE_KEY_PEM.as_bytes(), "g1")
            .map_err(|err| AuthError::Store(err.into()))?;
        Ok(GcpIdentityVerifier::new(
            store,
            Arc::new(JwksCache::new_static(jwks)),
            AUDIENCE,
        ))
    }

    fn token(claims: &serde_json::Value) -> Result<SecretString, AuthError> {
        sign_rs256(TEST_PRIVATE_KEY_PEM.as_bytes(), "g1", claims)
            .map(SecretString::from)
            .map_err(|err| AuthError::Store(err.into()))
    }

    fn gce_claims(now: OffsetDateTime, zone: &str) -> serde_json::Value {
        json!({
            "iss": "https://accounts.google.com",
            "aud": AUDIENCE,
            "exp": now.unix_timestamp() + 300,
            "iat": now.unix_timestamp(),
            "email": "ci@proj-a.iam.gserviceaccount.com",
            "google": {"compute_engine": {"project_id": "proj-a", "zone": zone}}
        })
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn attach_requires_type_and_normalizes_lists() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        assert!(matches!(
            GcpAuthConfig::attach(Uuid::new_v4(), &GcpAuthInput::default(), now),
            Err(AuthError::Validation(_))
        ));
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &input(GcpAuthType::Gce), now)?;
        assert_eq!(
            config.allowed_service_accounts,
            "ci@proj-a.iam.gserviceaccount.com"
        );
        assert_eq!(config.policy.access_token_ttl, 7200);
        Ok(())
    }

    #[test]
    fn empty_lists_allow_anything() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let open = GcpAuthInput {
            auth_type: Some(GcpAuthType::Iam),
            ..GcpAuthInput::default()
        };
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &open, now)?;
        assert!(config.permits(&GcpPrincipal {
            service_account: "anyone@elsewhere.iam.gserviceaccount.com".to_string(),
            project_id: None,
            zone: None,
        }));
        Ok(())
    }

    #[test]
    fn update_keeps_untouched_lists() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &input(GcpAuthType::Gce), now)?;
        let patch = GcpAuthInput {
            allowed_zones: Some("europe-west1-b".to_string()),
            ..GcpAuthInput::default()
        };
        let updated = config.apply(&patch, now)?;
        assert_eq!(updated.allowed_projects, config.allowed_projects);
        assert_eq!(updated.allowed_zones, "europe-west1-b");
        assert_eq!(updated.auth_type, GcpAuthType::Gce);
        Ok(())
    }

    #[tokio::test]
    async fn gce_token_in_allow_lists_verifies() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &input(GcpAuthType::Gce), now)?;
        let verifier = verifier_with(&config).await?;
        let credential = GcpCredential {
            identity_id: config.identity_id,
            jwt: token(&gce_claims(now, "us-east1-b"))?,
        };
        let verified = verifier.verify(&credential, ip(), now).await?;
        assert_eq!(verified.auth_method, AuthMethod::GcpAuth);
        assert_eq!(verified.auth_config_id, config.id);
        assert!(verified.client_secret_id.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn zone_outside_allow_list_is_rejected() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &input(GcpAuthType::Gce), now)?;
        let verifier = verifier_with(&config).await?;
        let credential = GcpCredential {
            identity_id: config.identity_id,
            jwt: token(&gce_claims(now, "asia-east1-a"))?,
        };
        assert!(matches!(
            verifier.verify(&credential, ip(), now).await,
            Err(AuthError::Unauthorized)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn iam_project_comes_from_service_account() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &input(GcpAuthType::Iam), now)?;
        let verifier = verifier_with(&config).await?;
        let claims = json!({
            "iss": "accounts.google.com",
            "aud": AUDIENCE,
            "exp": now.unix_timestamp() + 300,
            "email": "ci@proj-a.iam.gserviceaccount.com"
        });
        let credential = GcpCredential {
            identity_id: config.identity_id,
            jwt: token(&claims)?,
        };
        verifier.verify(&credential, ip(), now).await?;
        Ok(())
    }

    #[tokio::test]
    async fn wrong_audience_issuer_or_expiry_is_rejected() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &input(GcpAuthType::Gce), now)?;
        let verifier = verifier_with(&config).await?;

        let mut wrong_aud = gce_claims(now, "us-east1-b");
        wrong_aud["aud"] = json!("someone-else");
        let mut wrong_iss = gce_claims(now, "us-east1-b");
        wrong_iss["iss"] = json!("https://evil.example");
        let mut expired = gce_claims(now, "us-east1-b");
        expired["exp"] = json!(now.unix_timestamp() - 1);

        for claims in [wrong_aud, wrong_iss, expired] {
            let credential = GcpCredential {
                identity_id: config.identity_id,
                jwt: token(&claims)?,
            };
            assert!(matches!(
                verifier.verify(&credential, ip(), now).await,
                Err(AuthError::Unauthorized)
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc();
        let config = GcpAuthConfig::attach(Uuid::new_v4(), &input(GcpAuthType::Gce), now)?;
        let verifier = verifier_with(&config).await?;
        let credential = GcpCredential {
            identity_id: Uuid::new_v4(),
            jwt: token(&gce_claims(now, "us-east1-b"))?,
        };
        assert!(matches!(
            verifier.verify(&credential, ip(), now).await,
            Err(AuthError::NotFound(_))
        ));
        Ok(())
    }
}
