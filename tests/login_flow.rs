//! End-to-end Universal Auth flows through the service facade with the in-memory store.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration as StdDuration,
};

use anyhow::{Result, anyhow, ensure};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use time::{Duration, OffsetDateTime, macros::datetime};
use universal_auth::{
    identity::{
        AuthError, ErrorKind, UniversalAuthService,
        actor::ActorContext,
        audit::{AuditEventKind, MemoryAuditSink},
        client_secret::{ClientSecret, NewClientSecret},
        clock::ManualClock,
        config::{UniversalAuthConfig, UniversalAuthInput},
        gcp::GcpAuthConfig,
        policy::TokenPolicyPatch,
        secret_codec::SecretCodec,
        token::{AccessTokenRecord, TokenSigner},
        trusted_ip::TrustedIp,
    },
    store::{ConfigUpdate, IdentityDirectory, MemoryStore, Store, UseOutcome},
};
use uuid::Uuid;

const START: OffsetDateTime = datetime!(2026-01-01 00:00 UTC);

struct Harness {
    service: Arc<UniversalAuthService>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    audit: Arc<MemoryAuditSink>,
    identity_id: Uuid,
    admin: ActorContext,
}

fn codec() -> Result<SecretCodec> {
    let params = argon2::Params::new(8, 1, 1, None).map_err(|err| anyhow!("{err}"))?;
    Ok(SecretCodec::new(b"integration-pepper".to_vec()).with_params(params))
}

async fn harness() -> Result<Harness> {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(START));
    let audit = Arc::new(MemoryAuditSink::new());
    let org_id = Uuid::new_v4();
    let identity_id = Uuid::new_v4();
    let admin = ActorContext::user(Uuid::new_v4(), org_id);
    store.add_identity(identity_id, org_id).await;
    store.grant_manage(admin.actor, org_id).await;

    let signer = Arc::new(TokenSigner::generate("universal-auth-it")?);
    let service = UniversalAuthService::new(store.clone(), store.clone(), codec()?, signer)
        .with_clock(clock.clone())
        .with_audit_sink(audit.clone());

    Ok(Harness {
        service: Arc::new(service),
        store,
        clock,
        audit,
        identity_id,
        admin,
    })
}

fn secret(plaintext: &str) -> SecretString {
    SecretString::from(plaintext.to_string())
}

fn caller() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))
}

impl Harness {
    async fn attach(&self, input: &UniversalAuthInput) -> Result<UniversalAuthConfig, AuthError> {
        self.service
            .attach_universal_auth(self.identity_id, input, &self.admin)
            .await
    }

    async fn secret(&self, num_uses_limit: u64, ttl: u64) -> Result<(Uuid, String)> {
        let issued = self
            .service
            .create_client_secret(
                self.identity_id,
                &NewClientSecret {
                    description: "ci".to_string(),
                    num_uses_limit,
                    ttl,
                },
                &self.admin,
            )
            .await?;
        Ok((
            issued.record.id,
            issued.client_secret.expose_secret().to_string(),
        ))
    }
}

#[tokio::test]
async fn ttl_bound_decides_attach() -> Result<()> {
    for (ttl, max_ttl, ok) in [(0, 0, true), (60, 60, true), (60, 3600, true), (61, 60, false)] {
        let h = harness().await?;
        let input = UniversalAuthInput {
            policy: TokenPolicyPatch {
                access_token_ttl: Some(ttl),
                access_token_max_ttl: Some(max_ttl),
                ..TokenPolicyPatch::default()
            },
            ..UniversalAuthInput::default()
        };
        let result = h.attach(&input).await;
        match (ok, result) {
            (true, Ok(config)) => ensure!(config.policy.access_token_ttl == ttl),
            (false, Err(AuthError::Validation(_))) => {}
            (_, other) => return Err(anyhow!("ttl={ttl} max={max_ttl}: {other:?}")),
        }
    }
    Ok(())
}

#[tokio::test]
async fn plaintext_is_returned_once() -> Result<()> {
    let h = harness().await?;
    h.attach(&UniversalAuthInput::default()).await?;
    let (secret_id, plaintext) = h.secret(0, 0).await?;

    let listed = h
        .service
        .list_client_secrets(h.identity_id, &h.admin)
        .await?;
    let fetched = h
        .service
        .get_client_secret(h.identity_id, secret_id, &h.admin)
        .await?;

    let listed_json = serde_json::to_string(&listed)?;
    let fetched_json = serde_json::to_string(&fetched)?;
    for json in [&listed_json, &fetched_json] {
        ensure!(!json.contains(plaintext.as_str()));
    }
    ensure!(plaintext.starts_with(&fetched.client_secret_prefix));
    ensure!(listed.len() == 1);
    Ok(())
}

#[tokio::test]
async fn exceeding_use_limit_revokes_the_secret() -> Result<()> {
    let h = harness().await?;
    let config = h.attach(&UniversalAuthInput::default()).await?;
    let (secret_id, plaintext) = h.secret(3, 0).await?;

    for _ in 0..3 {
        h.service
            .login(config.client_id, secret(&plaintext), caller())
            .await?;
    }
    let fourth = h
        .service
        .login(config.client_id, secret(&plaintext), caller())
        .await;
    ensure!(matches!(fourth, Err(AuthError::SecretUsesExceeded)), "{fourth:?}");

    let fifth = h
        .service
        .login(config.client_id, secret(&plaintext), caller())
        .await;
    ensure!(matches!(fifth, Err(AuthError::SecretRevoked)), "{fifth:?}");

    let stored = h
        .store
        .find_client_secret(config.id, secret_id)
        .await?
        .ok_or_else(|| anyhow!("secret vanished"))?;
    ensure!(stored.num_uses == 3 && stored.is_revoked);
    Ok(())
}

#[tokio::test]
async fn secret_ttl_expires() -> Result<()> {
    let h = harness().await?;
    let config = h.attach(&UniversalAuthInput::default()).await?;
    let (_, plaintext) = h.secret(0, 1).await?;

    h.service
        .login(config.client_id, secret(&plaintext), caller())
        .await?;

    h.clock.advance(Duration::seconds(2));
    let late = h.service.login(config.client_id, secret(&plaintext), caller()).await;
    ensure!(matches!(late, Err(AuthError::SecretExpired)), "{late:?}");
    ensure!(late.is_err_and(|err| err.is_terminal()));
    Ok(())
}

#[tokio::test]
async fn untrusted_source_is_blocked() -> Result<()> {
    let h = harness().await?;
    let super_admin = h.admin.clone().with_super_admin(true);
    let input = UniversalAuthInput {
        client_secret_trusted_ips: Some(vec![TrustedIp::new("192.168.0.0/16")]),
        ..UniversalAuthInput::default()
    };
    let config = h
        .service
        .attach_universal_auth(h.identity_id, &input, &super_admin)
        .await?;
    let (_, plaintext) = h.secret(0, 0).await?;

    let blocked = h
        .service
        .login(config.client_id, secret(&plaintext), caller())
        .await;
    ensure!(matches!(blocked, Err(AuthError::IpBlocked)), "{blocked:?}");

    let inside = IpAddr::V4(Ipv4Addr::new(192, 168, 7, 7));
    h.service.login(config.client_id, secret(&plaintext), inside).await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_logins_respect_single_use() -> Result<()> {
    let h = harness().await?;
    let config = h.attach(&UniversalAuthInput::default()).await?;
    let (_, plaintext) = h.secret(1, 0).await?;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        let plaintext = secret(&plaintext);
        let client_id = config.client_id;
        tasks.push(tokio::spawn(async move {
            service.login(client_id, plaintext, caller()).await
        }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await? {
            Ok(_) => successes += 1,
            Err(AuthError::SecretUsesExceeded | AuthError::SecretRevoked) => {}
            Err(other) => return Err(anyhow!("unexpected failure: {other:?}")),
        }
    }
    ensure!(successes == 1, "{successes} logins succeeded");
    Ok(())
}

#[tokio::test]
async fn update_below_ttl_keeps_config() -> Result<()> {
    let h = harness().await?;
    let before = h.attach(&UniversalAuthInput::default()).await?;

    let input = UniversalAuthInput {
        policy: TokenPolicyPatch {
            access_token_max_ttl: Some(before.policy.access_token_ttl - 1),
            ..TokenPolicyPatch::default()
        },
        ..UniversalAuthInput::default()
    };
    let result = h
        .service
        .update_universal_auth(h.identity_id, &input, &h.admin)
        .await;
    ensure!(matches!(result, Err(AuthError::Validation(_))), "{result:?}");

    let after = h
        .service
        .get_universal_auth(h.identity_id, &h.admin)
        .await?;
    ensure!(after == before);
    Ok(())
}

#[tokio::test]
async fn revoking_config_revokes_secrets_and_logins() -> Result<()> {
    let h = harness().await?;
    let config = h.attach(&UniversalAuthInput::default()).await?;
    let (first, plaintext) = h.secret(0, 0).await?;
    let (second, _) = h.secret(0, 0).await?;

    h.service
        .revoke_universal_auth(h.identity_id, &h.admin)
        .await?;

    for secret_id in [first, second] {
        let stored = h
            .store
            .find_client_secret(config.id, secret_id)
            .await?
            .ok_or_else(|| anyhow!("secret {secret_id} vanished"))?;
        ensure!(stored.is_revoked);
    }
    ensure!(h.store.find_universal_auth(h.identity_id).await?.is_none());

    let login = h.service.login(config.client_id, secret(&plaintext), caller()).await;
    ensure!(matches!(login, Err(AuthError::NotFound(_))), "{login:?}");
    Ok(())
}

#[tokio::test]
async fn issued_token_authenticates_and_revokes() -> Result<()> {
    let h = harness().await?;
    let config = h.attach(&UniversalAuthInput::default()).await?;
    let (secret_id, plaintext) = h.secret(0, 0).await?;

    let issued = h
        .service
        .login(config.client_id, secret(&plaintext), caller())
        .await?;
    ensure!(issued.expires_in == 2_592_000);
    ensure!(issued.access_token.expose_secret().starts_with("v4.public."));

    let bearer = issued.access_token.expose_secret();
    let actor = h.service.identity_actor(bearer, caller()).await?;
    ensure!(actor.actor == universal_auth::identity::actor::Actor::Identity(h.identity_id));

    h.service.revoke_access_token(bearer, caller()).await?;
    let reused = h.service.authenticate_access_token(bearer, caller()).await;
    ensure!(matches!(reused, Err(AuthError::TokenRevoked)), "{reused:?}");

    let login_event = h
        .audit
        .events()
        .into_iter()
        .find_map(|event| match event.event {
            AuditEventKind::LoginIdentityUniversalAuth {
                client_secret_id, ..
            } => Some(client_secret_id),
            _ => None,
        });
    ensure!(login_event == Some(secret_id));
    Ok(())
}

#[tokio::test]
async fn periodic_token_renews_on_use() -> Result<()> {
    let h = harness().await?;
    let input = UniversalAuthInput {
        policy: TokenPolicyPatch {
            access_token_ttl: Some(60),
            access_token_max_ttl: Some(300),
            access_token_period: Some(60),
            ..TokenPolicyPatch::default()
        },
        ..UniversalAuthInput::default()
    };
    let config = h.attach(&input).await?;
    let (_, plaintext) = h.secret(0, 0).await?;
    let issued = h
        .service
        .login(config.client_id, secret(&plaintext), caller())
        .await?;
    let bearer = issued.access_token.expose_secret();

    // Each use inside the window pushes expiry forward, up to the max TTL.
    for _ in 0..4 {
        h.clock.advance(Duration::seconds(50));
        h.service.authenticate_access_token(bearer, caller()).await?;
    }
    h.clock.advance(Duration::seconds(101));
    let late = h.service.authenticate_access_token(bearer, caller()).await;
    ensure!(matches!(late, Err(AuthError::TokenExpired)), "{late:?}");
    Ok(())
}

/// Delegates to the in-memory store but stalls before redeeming a client secret.
struct StallingRedeemStore {
    inner: MemoryStore,
    stall: StdDuration,
}

#[async_trait]
impl Store for StallingRedeemStore {
    async fn ping(&self) -> Result<(), AuthError> {
        self.inner.ping().await
    }

    async fn insert_universal_auth(&self, config: &UniversalAuthConfig) -> Result<(), AuthError> {
        self.inner.insert_universal_auth(config).await
    }

    async fn find_universal_auth(
        &self,
        identity_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError> {
        self.inner.find_universal_auth(identity_id).await
    }

    async fn find_universal_auth_by_client_id(
        &self,
        client_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError> {
        self.inner.find_universal_auth_by_client_id(client_id).await
    }

    async fn update_universal_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, UniversalAuthConfig>,
    ) -> Result<UniversalAuthConfig, AuthError> {
        self.inner.update_universal_auth(identity_id, update).await
    }

    async fn revoke_universal_auth(
        &self,
        identity_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UniversalAuthConfig, AuthError> {
        self.inner.revoke_universal_auth(identity_id, now).await
    }

    async fn insert_client_secret(&self, secret: &ClientSecret) -> Result<(), AuthError> {
        self.inner.insert_client_secret(secret).await
    }

    async fn list_client_secrets(
        &self,
        identity_ua_id: Uuid,
    ) -> Result<Vec<ClientSecret>, AuthError> {
        self.inner.list_client_secrets(identity_ua_id).await
    }

    async fn find_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
    ) -> Result<Option<ClientSecret>, AuthError> {
        self.inner.find_client_secret(identity_ua_id, secret_id).await
    }

    async fn revoke_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<ClientSecret>, AuthError> {
        self.inner
            .revoke_client_secret(identity_ua_id, secret_id, now)
            .await
    }

    async fn redeem_client_secret(
        &self,
        secret_id: Uuid,
        token: &AccessTokenRecord,
    ) -> Result<UseOutcome<()>, AuthError> {
        tokio::time::sleep(self.stall).await;
        self.inner.redeem_client_secret(secret_id, token).await
    }

    async fn insert_access_token(&self, token: &AccessTokenRecord) -> Result<(), AuthError> {
        self.inner.insert_access_token(token).await
    }

    async fn find_access_token(
        &self,
        token_id: Uuid,
    ) -> Result<Option<AccessTokenRecord>, AuthError> {
        self.inner.find_access_token(token_id).await
    }

    async fn use_access_token(
        &self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UseOutcome<AccessTokenRecord>, AuthError> {
        self.inner.use_access_token(token_id, now).await
    }

    async fn revoke_access_token(
        &self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<AccessTokenRecord>, AuthError> {
        self.inner.revoke_access_token(token_id, now).await
    }

    async fn insert_gcp_auth(&self, config: &GcpAuthConfig) -> Result<(), AuthError> {
        self.inner.insert_gcp_auth(config).await
    }

    async fn find_gcp_auth(&self, identity_id: Uuid) -> Result<Option<GcpAuthConfig>, AuthError> {
        self.inner.find_gcp_auth(identity_id).await
    }

    async fn update_gcp_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, GcpAuthConfig>,
    ) -> Result<GcpAuthConfig, AuthError> {
        self.inner.update_gcp_auth(identity_id, update).await
    }

    async fn revoke_gcp_auth(&self, identity_id: Uuid) -> Result<GcpAuthConfig, AuthError> {
        self.inner.revoke_gcp_auth(identity_id).await
    }
}

#[tokio::test]
async fn timed_out_login_leaves_no_partial_write() -> Result<()> {
    let h = harness().await?;
    let config = h.attach(&UniversalAuthInput::default()).await?;
    let (_, plaintext) = h.secret(1, 0).await?;

    let stalling = Arc::new(StallingRedeemStore {
        inner: (*h.store).clone(),
        stall: StdDuration::from_secs(5),
    });
    let directory: Arc<dyn IdentityDirectory> = h.store.clone();
    let signer = Arc::new(TokenSigner::generate("universal-auth-it")?);
    let slow = UniversalAuthService::new(stalling, directory, codec()?, signer)
        .with_clock(h.clock.clone())
        .with_operation_timeout(StdDuration::from_millis(100));

    let err = slow
        .login(config.client_id, secret(&plaintext), caller())
        .await
        .err()
        .ok_or_else(|| anyhow!("login should time out"))?;
    ensure!(err.kind() == ErrorKind::Timeout, "unexpected error: {err:?}");
    ensure!(err.is_retryable());

    let secrets = h.store.list_client_secrets(config.id).await?;
    ensure!(secrets.len() == 1);
    ensure!(secrets[0].num_uses == 0);
    ensure!(!secrets[0].is_revoked);
    ensure!(h.store.access_token_count(h.identity_id).await == 0);

    // The single allowed use is still available once the store answers in time.
    h.service
        .login(config.client_id, secret(&plaintext), caller())
        .await?;
    ensure!(h.store.access_token_count(h.identity_id).await == 1);
    Ok(())
}
