//! Persistence seam for auth configs, client secrets and access tokens.
//!
//! Every method that checks and then mutates a record does both inside one atomic step
//! (a conditional `UPDATE`, a row lock, or the in-memory mutex), so concurrent logins can
//! never race past a usage limit and a failed call leaves no partial write behind.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::identity::{
    actor::Actor, client_secret::ClientSecret, config::UniversalAuthConfig, error::AuthError,
    gcp::GcpAuthConfig, token::AccessTokenRecord,
};

/// Outcome of consuming one use of a counted credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UseOutcome<T> {
    /// The use was granted and counted.
    Counted(T),
    /// The limit was already reached; the credential has now been revoked.
    LimitExceeded,
    Revoked,
    Expired,
    Missing,
}

impl<T> UseOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> UseOutcome<U> {
        match self {
            Self::Counted(value) => UseOutcome::Counted(f(value)),
            Self::LimitExceeded => UseOutcome::LimitExceeded,
            Self::Revoked => UseOutcome::Revoked,
            Self::Expired => UseOutcome::Expired,
            Self::Missing => UseOutcome::Missing,
        }
    }
}

/// Merge function applied to a config while the store holds its lock.
pub type ConfigUpdate<'a, T> = dyn Fn(&T) -> Result<T, AuthError> + Send + Sync + 'a;

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), AuthError>;

    /// # Errors
    /// `AlreadyAttached` if the identity already has a Universal Auth config.
    async fn insert_universal_auth(&self, config: &UniversalAuthConfig) -> Result<(), AuthError>;
    async fn find_universal_auth(
        &self,
        identity_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError>;
    async fn find_universal_auth_by_client_id(
        &self,
        client_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError>;
    /// Replace the config with `update(current)` under the identity's lock.
    async fn update_universal_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, UniversalAuthConfig>,
    ) -> Result<UniversalAuthConfig, AuthError>;
    /// Revoke every client secret of the config and delete it, atomically.
    async fn revoke_universal_auth(
        &self,
        identity_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UniversalAuthConfig, AuthError>;

    async fn insert_client_secret(&self, secret: &ClientSecret) -> Result<(), AuthError>;
    /// All secrets of a config, revoked ones included, oldest first.
    async fn list_client_secrets(
        &self,
        identity_ua_id: Uuid,
    ) -> Result<Vec<ClientSecret>, AuthError>;
    async fn find_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
    ) -> Result<Option<ClientSecret>, AuthError>;
    /// Idempotent; an already revoked secret is returned unchanged.
    async fn revoke_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<ClientSecret>, AuthError>;
    /// Count one use of the secret and persist `token` in the same atomic step.
    /// Going past the limit revokes the secret and stores no token.
    async fn redeem_client_secret(
        &self,
        secret_id: Uuid,
        token: &AccessTokenRecord,
    ) -> Result<UseOutcome<()>, AuthError>;

    async fn insert_access_token(&self, token: &AccessTokenRecord) -> Result<(), AuthError>;
    async fn find_access_token(
        &self,
        token_id: Uuid,
    ) -> Result<Option<AccessTokenRecord>, AuthError>;
    /// Count one use of the token, renewing periodic tokens while their auth config exists.
    async fn use_access_token(
        &self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UseOutcome<AccessTokenRecord>, AuthError>;
    async fn revoke_access_token(
        &self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<AccessTokenRecord>, AuthError>;

    /// # Errors
    /// `AlreadyAttached` if the identity already has a GCP auth config.
    async fn insert_gcp_auth(&self, config: &GcpAuthConfig) -> Result<(), AuthError>;
    async fn find_gcp_auth(&self, identity_id: Uuid) -> Result<Option<GcpAuthConfig>, AuthError>;
    async fn update_gcp_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, GcpAuthConfig>,
    ) -> Result<GcpAuthConfig, AuthError>;
    async fn revoke_gcp_auth(&self, identity_id: Uuid) -> Result<GcpAuthConfig, AuthError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub org_id: Uuid,
}

/// Organization capabilities that gate identity configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrgPolicy {
    /// Whether the org may narrow trusted IP lists below "allow everything".
    pub ip_allowlisting: bool,
}

/// Identity and membership lookups owned by the surrounding platform.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn find_identity(&self, identity_id: Uuid) -> Result<Option<IdentityRecord>, AuthError>;
    /// Whether `actor` may manage machine identities in `org_id`.
    async fn can_manage_identities(&self, actor: &Actor, org_id: Uuid) -> Result<bool, AuthError>;
    async fn org_policy(&self, org_id: Uuid) -> Result<OrgPolicy, AuthError>;
}
