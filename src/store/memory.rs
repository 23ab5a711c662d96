//! In-memory backend for tests and single-process development.
//!
//! All state sits behind one mutex, so every trait method is atomic with respect to the others.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConfigUpdate, IdentityDirectory, IdentityRecord, OrgPolicy, Store, UseOutcome};
use crate::identity::{
    actor::Actor, client_secret::ClientSecret, config::UniversalAuthConfig, error::AuthError,
    gcp::GcpAuthConfig, token::AccessTokenRecord,
};

#[derive(Default)]
struct State {
    /// Keyed by identity id.
    universal_auths: HashMap<Uuid, UniversalAuthConfig>,
    client_secrets: HashMap<Uuid, ClientSecret>,
    access_tokens: HashMap<Uuid, AccessTokenRecord>,
    /// Keyed by identity id.
    gcp_auths: HashMap<Uuid, GcpAuthConfig>,
    identities: HashMap<Uuid, IdentityRecord>,
    managers: HashSet<(Actor, Uuid)>,
    org_policies: HashMap<Uuid, OrgPolicy>,
}

impl State {
    fn auth_config_exists(&self, auth_config_id: Uuid) -> bool {
        self.universal_auths
            .values()
            .any(|config| config.id == auth_config_id)
            || self
                .gcp_auths
                .values()
                .any(|config| config.id == auth_config_id)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine identity owned by `org_id`.
    pub async fn add_identity(&self, identity_id: Uuid, org_id: Uuid) {
        self.state.lock().await.identities.insert(
            identity_id,
            IdentityRecord {
                id: identity_id,
                org_id,
            },
        );
    }

    /// Allow `actor` to manage identities of `org_id`.
    pub async fn grant_manage(&self, actor: Actor, org_id: Uuid) {
        self.state.lock().await.managers.insert((actor, org_id));
    }

    pub async fn set_org_policy(&self, org_id: Uuid, policy: OrgPolicy) {
        self.state.lock().await.org_policies.insert(org_id, policy);
    }

    /// Number of access tokens ever persisted for `identity_id`, revoked ones included.
    pub async fn access_token_count(&self, identity_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .access_tokens
            .values()
            .filter(|token| token.identity_id == identity_id)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), AuthError> {
        Ok(())
    }

    async fn insert_universal_auth(&self, config: &UniversalAuthConfig) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        if state.universal_auths.contains_key(&config.identity_id) {
            return Err(AuthError::AlreadyAttached("universal auth"));
        }
        state
            .universal_auths
            .insert(config.identity_id, config.clone());
        Ok(())
    }

    async fn find_universal_auth(
        &self,
        identity_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError> {
        Ok(self
            .state
            .lock()
            .await
            .universal_auths
            .get(&identity_id)
            .cloned())
    }

    async fn find_universal_auth_by_client_id(
        &self,
        client_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError> {
        Ok(self
            .state
            .lock()
            .await
            .universal_auths
            .values()
            .find(|config| config.client_id == client_id)
            .cloned())
    }

    async fn update_universal_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, UniversalAuthConfig>,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let mut state = self.state.lock().await;
        let current = state
            .universal_auths
            .get(&identity_id)
            .ok_or(AuthError::NotFound("universal auth"))?;
        let updated = update(current)?;
        state.universal_auths.insert(identity_id, updated.clone());
        Ok(updated)
    }

    async fn revoke_universal_auth(
        &self,
        identity_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let config = state
            .universal_auths
            .remove(&identity_id)
            .ok_or(AuthError::NotFound("universal auth"))?;
        for secret in state
            .client_secrets
            .values_mut()
            .filter(|secret| secret.identity_ua_id == config.id && !secret.is_revoked)
        {
            secret.is_revoked = true;
            secret.updated_at = now;
        }
        Ok(config)
    }

    async fn insert_client_secret(&self, secret: &ClientSecret) -> Result<(), AuthError> {
        self.state
            .lock()
            .await
            .client_secrets
            .insert(secret.id, secret.clone());
        Ok(())
    }

    async fn list_client_secrets(
        &self,
        identity_ua_id: Uuid,
    ) -> Result<Vec<ClientSecret>, AuthError> {
        let state = self.state.lock().await;
        let mut secrets: Vec<ClientSecret> = state
            .client_secrets
            .values()
            .filter(|secret| secret.identity_ua_id == identity_ua_id)
            .cloned()
            .collect();
        secrets.sort_by_key(|secret| (secret.created_at, secret.id));
        Ok(secrets)
    }

    async fn find_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
    ) -> Result<Option<ClientSecret>, AuthError> {
        Ok(self
            .state
            .lock()
            .await
            .client_secrets
            .get(&secret_id)
            .filter(|secret| secret.identity_ua_id == identity_ua_id)
            .cloned())
    }

    async fn revoke_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<ClientSecret>, AuthError> {
        let mut state = self.state.lock().await;
        let Some(secret) = state
            .client_secrets
            .get_mut(&secret_id)
            .filter(|secret| secret.identity_ua_id == identity_ua_id)
        else {
            return Ok(None);
        };
        if !secret.is_revoked {
            secret.is_revoked = true;
            secret.updated_at = now;
        }
        Ok(Some(secret.clone()))
    }

    async fn redeem_client_secret(
        &self,
        secret_id: Uuid,
        token: &AccessTokenRecord,
    ) -> Result<UseOutcome<()>, AuthError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(secret) = state.client_secrets.get_mut(&secret_id) else {
            return Ok(UseOutcome::Missing);
        };
        if secret.is_revoked {
            return Ok(UseOutcome::Revoked);
        }
        if secret.is_expired(token.issued_at) {
            return Ok(UseOutcome::Expired);
        }
        let outcome = secret.consume(token.issued_at);
        if outcome == UseOutcome::Counted(()) {
            state.access_tokens.insert(token.id, token.clone());
        }
        Ok(outcome)
    }

    async fn insert_access_token(&self, token: &AccessTokenRecord) -> Result<(), AuthError> {
        self.state
            .lock()
            .await
            .access_tokens
            .insert(token.id, token.clone());
        Ok(())
    }

    async fn find_access_token(
        &self,
        token_id: Uuid,
    ) -> Result<Option<AccessTokenRecord>, AuthError> {
        Ok(self
            .state
            .lock()
            .await
            .access_tokens
            .get(&token_id)
            .cloned())
    }

    async fn use_access_token(
        &self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UseOutcome<AccessTokenRecord>, AuthError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(auth_config_id) = state
            .access_tokens
            .get(&token_id)
            .map(|token| token.auth_config_id)
        else {
            return Ok(UseOutcome::Missing);
        };
        let renew = state.auth_config_exists(auth_config_id);
        let Some(token) = state.access_tokens.get_mut(&token_id) else {
            return Ok(UseOutcome::Missing);
        };
        let outcome = token.consume(now, renew);
        Ok(outcome.map(|()| token.clone()))
    }

    async fn revoke_access_token(
        &self,
        token_id: Uuid,
        _now: OffsetDateTime,
    ) -> Result<Option<AccessTokenRecord>, AuthError> {
        let mut state = self.state.lock().await;
        let Some(token) = state.access_tokens.get_mut(&token_id) else {
            return Ok(None);
        };
        token.is_revoked = true;
        Ok(Some(token.clone()))
    }

    async fn insert_gcp_auth(&self, config: &GcpAuthConfig) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        if state.gcp_auths.contains_key(&config.identity_id) {
            return Err(AuthError::AlreadyAttached("gcp auth"));
        }
        state.gcp_auths.insert(config.identity_id, config.clone());
        Ok(())
    }

    async fn find_gcp_auth(&self, identity_id: Uuid) -> Result<Option<GcpAuthConfig>, AuthError> {
        Ok(self.state.lock().await.gcp_auths.get(&identity_id).cloned())
    }

    async fn update_gcp_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, GcpAuthConfig>,
    ) -> Result<GcpAuthConfig, AuthError> {
        let mut state = self.state.lock().await;
        let current = state
            .gcp_auths
            .get(&identity_id)
            .ok_or(AuthError::NotFound("gcp auth"))?;
        let updated = update(current)?;
        state.gcp_auths.insert(identity_id, updated.clone());
        Ok(updated)
    }

    async fn revoke_gcp_auth(&self, identity_id: Uuid) -> Result<GcpAuthConfig, AuthError> {
        self.state
            .lock()
            .await
            .gcp_auths
            .remove(&identity_id)
            .ok_or(AuthError::NotFound("gcp auth"))
    }
}

#[async_trait]
impl IdentityDirectory for MemoryStore {
    async fn find_identity(&self, identity_id: Uuid) -> Result<Option<IdentityRecord>, AuthError> {
        Ok(self.state.lock().await.identities.get(&identity_id).copied())
    }

    async fn can_manage_identities(&self, actor: &Actor, org_id: Uuid) -> Result<bool, AuthError> {
        Ok(self.state.lock().await.managers.contains(&(*actor, org_id)))
    }

    async fn org_policy(&self, org_id: Uuid) -> Result<OrgPolicy, AuthError> {
        Ok(self
            .state
            .lock()
            .await
            .org_policies
            .get(&org_id)
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{
        client_secret::NewClientSecret,
        config::UniversalAuthInput,
        policy::{TokenPolicy, TokenPolicyPatch},
        secret_codec::test_codec,
        verifier::{AuthMethod, VerifiedIdentity},
    };

    async fn attached(store: &MemoryStore) -> Result<UniversalAuthConfig, AuthError> {
        let config = UniversalAuthConfig::attach(
            Uuid::new_v4(),
            &UniversalAuthInput::default(),
            OffsetDateTime::now_utc(),
        )?;
        store.insert_universal_auth(&config).await?;
        Ok(config)
    }

    async fn secret(
        store: &MemoryStore,
        config: &UniversalAuthConfig,
        limit: u64,
    ) -> Result<ClientSecret, AuthError> {
        let request = NewClientSecret {
            num_uses_limit: limit,
            ..NewClientSecret::default()
        };
        let secret = ClientSecret::new(
            config.id,
            config.identity_id,
            &request,
            &test_codec().generate()?,
            OffsetDateTime::now_utc(),
        );
        store.insert_client_secret(&secret).await?;
        Ok(secret)
    }

    fn token_for(config: &UniversalAuthConfig, secret: &ClientSecret) -> AccessTokenRecord {
        AccessTokenRecord::mint(
            &VerifiedIdentity {
                identity_id: config.identity_id,
                auth_method: AuthMethod::UniversalAuth,
                auth_config_id: config.id,
                policy: config.policy.clone(),
                client_secret_id: Some(secret.id),
            },
            OffsetDateTime::now_utc(),
        )
    }

    #[tokio::test]
    async fn attach_twice_conflicts() -> Result<(), AuthError> {
        let store = MemoryStore::new();
        let config = attached(&store).await?;
        let again = UniversalAuthConfig::attach(
            config.identity_id,
            &UniversalAuthInput::default(),
            OffsetDateTime::now_utc(),
        )?;
        assert!(matches!(
            store.insert_universal_auth(&again).await,
            Err(AuthError::AlreadyAttached(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn failed_update_leaves_config_unchanged() -> Result<(), AuthError> {
        let store = MemoryStore::new();
        let config = attached(&store).await?;
        let patch = UniversalAuthInput {
            policy: TokenPolicyPatch {
                access_token_max_ttl: Some(1),
                ..TokenPolicyPatch::default()
            },
            ..UniversalAuthInput::default()
        };
        let now = OffsetDateTime::now_utc();
        let result = store
            .update_universal_auth(config.identity_id, &|current| current.apply(&patch, now))
            .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        assert_eq!(
            store.find_universal_auth(config.identity_id).await?,
            Some(config)
        );
        Ok(())
    }

    #[tokio::test]
    async fn revoke_cascades_to_secrets() -> Result<(), AuthError> {
        let store = MemoryStore::new();
        let config = attached(&store).await?;
        secret(&store, &config, 0).await?;
        secret(&store, &config, 0).await?;

        store
            .revoke_universal_auth(config.identity_id, OffsetDateTime::now_utc())
            .await?;
        let secrets = store.list_client_secrets(config.id).await?;
        assert_eq!(secrets.len(), 2);
        assert!(secrets.iter().all(|secret| secret.is_revoked));
        assert!(store.find_universal_auth(config.identity_id).await?.is_none());
        assert!(
            store
                .find_universal_auth_by_client_id(config.client_id)
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_redeems_never_pass_the_limit() -> Result<(), AuthError> {
        let store = MemoryStore::new();
        let config = attached(&store).await?;
        let secret = secret(&store, &config, 1).await?;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let token = token_for(&config, &secret);
            let secret_id = secret.id;
            tasks.push(tokio::spawn(async move {
                store.redeem_client_secret(secret_id, &token).await
            }));
        }
        let mut counted = 0;
        for task in tasks {
            let outcome = task
                .await
                .map_err(|err| AuthError::Store(anyhow::anyhow!(err)))??;
            match outcome {
                UseOutcome::Counted(()) => counted += 1,
                UseOutcome::LimitExceeded | UseOutcome::Revoked => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(counted, 1);
        let stored = store.find_client_secret(config.id, secret.id).await?;
        assert_eq!(stored.map(|s| (s.num_uses, s.is_revoked)), Some((1, true)));
        Ok(())
    }

    #[tokio::test]
    async fn redeem_only_persists_token_on_success() -> Result<(), AuthError> {
        let store = MemoryStore::new();
        let config = attached(&store).await?;
        let secret = secret(&store, &config, 0).await?;
        store
            .revoke_client_secret(config.id, secret.id, OffsetDateTime::now_utc())
            .await?;

        let token = token_for(&config, &secret);
        assert_eq!(
            store.redeem_client_secret(secret.id, &token).await?,
            UseOutcome::Revoked
        );
        assert!(store.find_access_token(token.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn tokens_stop_renewing_once_config_is_revoked() -> Result<(), AuthError> {
        let store = MemoryStore::new();
        let policy = TokenPolicy {
            access_token_ttl: 0,
            access_token_max_ttl: 1000,
            access_token_period: 60,
            ..TokenPolicy::universal_auth_default()
        };
        let input = UniversalAuthInput {
            policy: TokenPolicyPatch {
                access_token_ttl: Some(policy.access_token_ttl),
                access_token_max_ttl: Some(policy.access_token_max_ttl),
                access_token_period: Some(policy.access_token_period),
                ..TokenPolicyPatch::default()
            },
            ..UniversalAuthInput::default()
        };
        let now = OffsetDateTime::now_utc();
        let config = UniversalAuthConfig::attach(Uuid::new_v4(), &input, now)?;
        store.insert_universal_auth(&config).await?;
        let secret = secret(&store, &config, 0).await?;
        let token = token_for(&config, &secret);
        store.insert_access_token(&token).await?;
        let first_expiry = token.expires_at;

        let later = token.issued_at + time::Duration::seconds(30);
        let UseOutcome::Counted(renewed) = store.use_access_token(token.id, later).await? else {
            panic!("token use should be counted");
        };
        assert!(renewed.expires_at > first_expiry);

        store.revoke_universal_auth(config.identity_id, later).await?;
        let UseOutcome::Counted(frozen) = store
            .use_access_token(token.id, later + time::Duration::seconds(10))
            .await?
        else {
            panic!("token use should be counted");
        };
        assert_eq!(frozen.expires_at, renewed.expires_at);
        Ok(())
    }

    #[tokio::test]
    async fn directory_tracks_membership_and_policy() -> Result<(), AuthError> {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = Actor::User(Uuid::new_v4());
        store.add_identity(Uuid::nil(), org).await;
        store.grant_manage(user, org).await;
        store
            .set_org_policy(org, OrgPolicy { ip_allowlisting: true })
            .await;

        assert_eq!(
            store.find_identity(Uuid::nil()).await?.map(|i| i.org_id),
            Some(org)
        );
        assert!(store.can_manage_identities(&user, org).await?);
        assert!(!store.can_manage_identities(&user, Uuid::new_v4()).await?);
        assert!(store.org_policy(org).await?.ip_allowlisting);
        assert!(!store.org_policy(Uuid::new_v4()).await?.ip_allowlisting);
        Ok(())
    }
}
