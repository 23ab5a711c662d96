//! Boundary operations for machine identity auth.
//!
//! [`UniversalAuthService`] ties the verifiers, the token issuer, the store and the injected
//! collaborators (directory, audit sink, rate limiter, clock) together. Management calls are
//! scoped by an [`ActorContext`]; login calls by the caller's source address.

use std::{future::Future, net::IpAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use secrecy::SecretString;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    actor::{Actor, ActorContext},
    audit::{AuditEvent, AuditEventKind, AuditSink, TracingAuditSink},
    client_secret::{ClientSecret, ClientSecretView, IssuedClientSecret, NewClientSecret},
    clock::{Clock, SystemClock},
    config::{UniversalAuthConfig, UniversalAuthInput},
    error::AuthError,
    gcp::{GcpAuthConfig, GcpAuthInput, GcpCredential, GcpIdentityVerifier},
    rate_limit::{NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter},
    secret_codec::SecretCodec,
    token::{AccessTokenIssuer, AccessTokenRecord, IssuedAccessToken, TokenSigner},
    trusted_ip::{TrustedIp, TrustedIpList},
    verifier::{ClientSecretCredential, ClientSecretVerifier, CredentialVerifier},
};
use crate::store::{IdentityDirectory, IdentityRecord, Store};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UniversalAuthService {
    store: Arc<dyn Store>,
    directory: Arc<dyn IdentityDirectory>,
    codec: SecretCodec,
    client_secrets: ClientSecretVerifier,
    gcp: Option<GcpIdentityVerifier>,
    issuer: AccessTokenIssuer,
    audit: Arc<dyn AuditSink>,
    rate_limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl UniversalAuthService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn IdentityDirectory>,
        codec: SecretCodec,
        signer: Arc<TokenSigner>,
    ) -> Self {
        Self {
            client_secrets: ClientSecretVerifier::new(store.clone(), codec.clone()),
            issuer: AccessTokenIssuer::new(store.clone(), signer),
            store,
            directory,
            codec,
            gcp: None,
            audit: Arc::new(TracingAuditSink),
            rate_limiter: Arc::new(NoopRateLimiter),
            clock: Arc::new(SystemClock),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable GCP logins. Without a verifier, GCP login fails with `NotFound`.
    #[must_use]
    pub fn with_gcp_verifier(mut self, verifier: GcpIdentityVerifier) -> Self {
        self.gcp = Some(verifier);
        self
    }

    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// # Errors
    /// Returns a store error if the backing store is unreachable.
    pub async fn ping(&self) -> Result<(), AuthError> {
        self.store.ping().await
    }

    // Login

    /// Exchange a client ID and secret for an access token.
    ///
    /// # Errors
    /// `RateLimited`, `NotFound`, `IpBlocked`, `Unauthorized`, `SecretRevoked`,
    /// `SecretExpired`, `SecretUsesExceeded` or `Timeout`.
    pub async fn login(
        &self,
        client_id: Uuid,
        client_secret: SecretString,
        source_ip: IpAddr,
    ) -> Result<IssuedAccessToken, AuthError> {
        self.check_rate_limit(source_ip, RateLimitAction::UniversalAuthLogin)?;
        let credential = ClientSecretCredential {
            client_id,
            client_secret,
        };

        let (verified, issued) = self
            .bounded(async {
                let now = self.clock.now();
                let verified = self.client_secrets.verify(&credential, source_ip, now).await?;
                let issued = self.issuer.issue(&verified, source_ip, now).await?;
                Ok((verified, issued))
            })
            .await?;

        debug!(identity_id = %verified.identity_id, "universal auth login succeeded");
        let org_id = self.org_of(verified.identity_id).await;
        self.record(
            Actor::Identity(verified.identity_id),
            org_id,
            Some(source_ip),
            AuditEventKind::LoginIdentityUniversalAuth {
                identity_id: verified.identity_id,
                identity_universal_auth_id: verified.auth_config_id,
                client_secret_id: verified.client_secret_id.unwrap_or_default(),
                identity_access_token_id: issued.token_id,
            },
        );
        Ok(issued)
    }

    /// Exchange a Google-signed identity token for an access token.
    ///
    /// # Errors
    /// `RateLimited`, `NotFound`, `Unauthorized`, `IpBlocked` or `Timeout`.
    pub async fn login_gcp(
        &self,
        identity_id: Uuid,
        jwt: SecretString,
        source_ip: IpAddr,
    ) -> Result<IssuedAccessToken, AuthError> {
        self.check_rate_limit(source_ip, RateLimitAction::GcpAuthLogin)?;
        let verifier = self.gcp.as_ref().ok_or(AuthError::NotFound("gcp auth"))?;
        let credential = GcpCredential { identity_id, jwt };

        let (verified, issued) = self
            .bounded(async {
                let now = self.clock.now();
                let verified = verifier.verify(&credential, source_ip, now).await?;
                let issued = self.issuer.issue(&verified, source_ip, now).await?;
                Ok((verified, issued))
            })
            .await?;

        let org_id = self.org_of(verified.identity_id).await;
        self.record(
            Actor::Identity(verified.identity_id),
            org_id,
            Some(source_ip),
            AuditEventKind::LoginIdentityGcpAuth {
                identity_id: verified.identity_id,
                identity_gcp_auth_id: verified.auth_config_id,
                identity_access_token_id: issued.token_id,
            },
        );
        Ok(issued)
    }

    // Access tokens

    /// Validate a bearer token and count one use of it.
    ///
    /// # Errors
    /// `Unauthorized`, `TokenRevoked`, `TokenExpired`, `IpBlocked`, `TokenUsesExceeded` or
    /// `Timeout`.
    pub async fn authenticate_access_token(
        &self,
        bearer: &str,
        source_ip: IpAddr,
    ) -> Result<AccessTokenRecord, AuthError> {
        self.bounded(self.issuer.authenticate(bearer, source_ip, self.clock.now()))
            .await
    }

    /// Resolve a bearer token to the identity actor it was minted for.
    ///
    /// # Errors
    /// Any error of [`Self::authenticate_access_token`], or `Unauthorized` if the identity no
    /// longer exists.
    pub async fn identity_actor(
        &self,
        bearer: &str,
        source_ip: IpAddr,
    ) -> Result<ActorContext, AuthError> {
        let record = self.authenticate_access_token(bearer, source_ip).await?;
        let identity = self
            .directory
            .find_identity(record.identity_id)
            .await?
            .ok_or(AuthError::Unauthorized)?;
        Ok(ActorContext::identity(identity.id, identity.org_id).with_source_ip(source_ip))
    }

    /// Revoke the token behind `bearer`; revoking twice succeeds.
    ///
    /// # Errors
    /// `Unauthorized` if the bearer was not minted here.
    pub async fn revoke_access_token(
        &self,
        bearer: &str,
        source_ip: IpAddr,
    ) -> Result<AccessTokenRecord, AuthError> {
        let record = self.issuer.revoke(bearer, self.clock.now()).await?;
        let org_id = self.org_of(record.identity_id).await;
        self.record(
            Actor::Identity(record.identity_id),
            org_id,
            Some(source_ip),
            AuditEventKind::RevokeIdentityAccessToken {
                identity_id: record.identity_id,
                identity_access_token_id: record.id,
            },
        );
        Ok(record)
    }

    // Universal Auth configuration

    /// # Errors
    /// `NotFound`, `Forbidden`, `AlreadyAttached` or `Validation`.
    pub async fn attach_universal_auth(
        &self,
        identity_id: Uuid,
        input: &UniversalAuthInput,
        ctx: &ActorContext,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = UniversalAuthConfig::attach(identity_id, input, self.clock.now())?;
        if !ctx.is_super_admin && config.restricts_network() {
            self.ensure_ip_allowlisting(identity.org_id).await?;
        }
        self.store.insert_universal_auth(&config).await?;

        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::AddIdentityUniversalAuth {
                identity_id,
                access_token_ttl: config.policy.access_token_ttl,
                access_token_max_ttl: config.policy.access_token_max_ttl,
                access_token_num_uses_limit: config.policy.access_token_num_uses_limit,
                access_token_period: config.policy.access_token_period,
                client_secret_trusted_ips: config.client_secret_trusted_ips.to_string(),
                access_token_trusted_ips: config.policy.access_token_trusted_ips.to_string(),
            },
        );
        Ok(config)
    }

    /// Merge `input` onto the stored config. TTL bounds are checked on the merged values and a
    /// rejected update leaves the stored config unchanged.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden` or `Validation`.
    pub async fn update_universal_auth(
        &self,
        identity_id: Uuid,
        input: &UniversalAuthInput,
        ctx: &ActorContext,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        if requests_restriction(&[
            input.client_secret_trusted_ips.as_deref(),
            input.policy.access_token_trusted_ips.as_deref(),
        ])? {
            self.ensure_ip_allowlisting(identity.org_id).await?;
        }

        let now = self.clock.now();
        let config = self
            .store
            .update_universal_auth(identity_id, &|current: &UniversalAuthConfig| {
                current.apply(input, now)
            })
            .await?;

        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::UpdateIdentityUniversalAuth {
                identity_id,
                access_token_ttl: config.policy.access_token_ttl,
                access_token_max_ttl: config.policy.access_token_max_ttl,
                access_token_num_uses_limit: config.policy.access_token_num_uses_limit,
                access_token_period: config.policy.access_token_period,
                client_secret_trusted_ips: config.client_secret_trusted_ips.to_string(),
                access_token_trusted_ips: config.policy.access_token_trusted_ips.to_string(),
            },
        );
        Ok(config)
    }

    /// # Errors
    /// `NotFound` or `Forbidden`.
    pub async fn get_universal_auth(
        &self,
        identity_id: Uuid,
        ctx: &ActorContext,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = self.universal_auth_of(identity_id).await?;
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::GetIdentityUniversalAuth { identity_id },
        );
        Ok(config)
    }

    /// Delete the config and revoke all of its client secrets. Tokens already issued stay
    /// valid until they expire but periodic ones stop renewing.
    ///
    /// # Errors
    /// `NotFound` or `Forbidden`.
    pub async fn revoke_universal_auth(
        &self,
        identity_id: Uuid,
        ctx: &ActorContext,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = self
            .store
            .revoke_universal_auth(identity_id, self.clock.now())
            .await?;
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::RevokeIdentityUniversalAuth { identity_id },
        );
        Ok(config)
    }

    // Client secrets

    /// Generate a client secret. The plaintext in the result is never available again.
    ///
    /// # Errors
    /// `NotFound`, `Forbidden` or `Validation`.
    pub async fn create_client_secret(
        &self,
        identity_id: Uuid,
        request: &NewClientSecret,
        ctx: &ActorContext,
    ) -> Result<IssuedClientSecret, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        request.validate()?;
        let config = self.universal_auth_of(identity_id).await?;

        let codec = self.codec.clone();
        let generated = tokio::task::spawn_blocking(move || codec.generate())
            .await
            .map_err(|err| AuthError::Store(anyhow!("client secret generation failed: {err}")))??;
        let secret = ClientSecret::new(
            config.id,
            identity_id,
            request,
            &generated,
            self.clock.now(),
        );
        self.store.insert_client_secret(&secret).await?;

        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::CreateIdentityUniversalAuthClientSecret {
                identity_id,
                client_secret_id: secret.id,
            },
        );
        Ok(IssuedClientSecret {
            client_secret: generated.plaintext,
            record: secret.view(),
        })
    }

    /// Active (non-revoked) client secrets, prefix and metadata only.
    ///
    /// # Errors
    /// `NotFound` or `Forbidden`.
    pub async fn list_client_secrets(
        &self,
        identity_id: Uuid,
        ctx: &ActorContext,
    ) -> Result<Vec<ClientSecretView>, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = self.universal_auth_of(identity_id).await?;
        let secrets = self
            .store
            .list_client_secrets(config.id)
            .await?
            .into_iter()
            .filter(|secret| !secret.is_revoked)
            .map(|secret| secret.view())
            .collect();
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::GetIdentityUniversalAuthClientSecrets { identity_id },
        );
        Ok(secrets)
    }

    /// # Errors
    /// `NotFound` or `Forbidden`.
    pub async fn get_client_secret(
        &self,
        identity_id: Uuid,
        client_secret_id: Uuid,
        ctx: &ActorContext,
    ) -> Result<ClientSecretView, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = self.universal_auth_of(identity_id).await?;
        let secret = self
            .store
            .find_client_secret(config.id, client_secret_id)
            .await?
            .ok_or(AuthError::NotFound("client secret"))?;
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::GetIdentityUniversalAuthClientSecret {
                identity_id,
                client_secret_id,
            },
        );
        Ok(secret.view())
    }

    /// Revoke one client secret. Revoking twice returns the already revoked record.
    ///
    /// # Errors
    /// `NotFound` or `Forbidden`.
    pub async fn revoke_client_secret(
        &self,
        identity_id: Uuid,
        client_secret_id: Uuid,
        ctx: &ActorContext,
    ) -> Result<ClientSecretView, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = self.universal_auth_of(identity_id).await?;
        let secret = self
            .store
            .revoke_client_secret(config.id, client_secret_id, self.clock.now())
            .await?
            .ok_or(AuthError::NotFound("client secret"))?;
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::RevokeIdentityUniversalAuthClientSecret {
                identity_id,
                client_secret_id,
            },
        );
        Ok(secret.view())
    }

    // GCP configuration

    /// # Errors
    /// `NotFound`, `Forbidden`, `AlreadyAttached` or `Validation`.
    pub async fn attach_gcp_auth(
        &self,
        identity_id: Uuid,
        input: &GcpAuthInput,
        ctx: &ActorContext,
    ) -> Result<GcpAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = GcpAuthConfig::attach(identity_id, input, self.clock.now())?;
        if !ctx.is_super_admin && config.policy.access_token_trusted_ips.is_restricted() {
            self.ensure_ip_allowlisting(identity.org_id).await?;
        }
        self.store.insert_gcp_auth(&config).await?;
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::AddIdentityGcpAuth {
                identity_id,
                auth_type: config.auth_type,
                allowed_service_accounts: config.allowed_service_accounts.clone(),
                allowed_projects: config.allowed_projects.clone(),
                allowed_zones: config.allowed_zones.clone(),
                access_token_ttl: config.policy.access_token_ttl,
                access_token_max_ttl: config.policy.access_token_max_ttl,
                access_token_num_uses_limit: config.policy.access_token_num_uses_limit,
                access_token_trusted_ips: config.policy.access_token_trusted_ips.to_string(),
            },
        );
        Ok(config)
    }

    /// # Errors
    /// `NotFound`, `Forbidden` or `Validation`.
    pub async fn update_gcp_auth(
        &self,
        identity_id: Uuid,
        input: &GcpAuthInput,
        ctx: &ActorContext,
    ) -> Result<GcpAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        if requests_restriction(&[input.policy.access_token_trusted_ips.as_deref()])? {
            self.ensure_ip_allowlisting(identity.org_id).await?;
        }

        let now = self.clock.now();
        let config = self
            .store
            .update_gcp_auth(identity_id, &|current: &GcpAuthConfig| {
                current.apply(input, now)
            })
            .await?;

        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::UpdateIdentityGcpAuth {
                identity_id,
                auth_type: config.auth_type,
                allowed_service_accounts: config.allowed_service_accounts.clone(),
                allowed_projects: config.allowed_projects.clone(),
                allowed_zones: config.allowed_zones.clone(),
                access_token_ttl: config.policy.access_token_ttl,
                access_token_max_ttl: config.policy.access_token_max_ttl,
                access_token_num_uses_limit: config.policy.access_token_num_uses_limit,
                access_token_trusted_ips: config.policy.access_token_trusted_ips.to_string(),
            },
        );
        Ok(config)
    }

    /// # Errors
    /// `NotFound` or `Forbidden`.
    pub async fn get_gcp_auth(
        &self,
        identity_id: Uuid,
        ctx: &ActorContext,
    ) -> Result<GcpAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = self
            .store
            .find_gcp_auth(identity_id)
            .await?
            .ok_or(AuthError::NotFound("gcp auth"))?;
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::GetIdentityGcpAuth { identity_id },
        );
        Ok(config)
    }

    /// # Errors
    /// `NotFound` or `Forbidden`.
    pub async fn revoke_gcp_auth(
        &self,
        identity_id: Uuid,
        ctx: &ActorContext,
    ) -> Result<GcpAuthConfig, AuthError> {
        let identity = self.authorize(ctx, identity_id).await?;
        let config = self.store.revoke_gcp_auth(identity_id).await?;
        self.audit_ctx(
            ctx,
            identity.org_id,
            AuditEventKind::RevokeIdentityGcpAuth { identity_id },
        );
        Ok(config)
    }

    // Helpers

    /// Resolve the target identity and check that `ctx` may manage it. Identities in other
    /// orgs are reported as missing.
    async fn authorize(
        &self,
        ctx: &ActorContext,
        identity_id: Uuid,
    ) -> Result<IdentityRecord, AuthError> {
        let identity = self
            .directory
            .find_identity(identity_id)
            .await?
            .ok_or(AuthError::NotFound("identity"))?;
        if ctx.is_super_admin {
            return Ok(identity);
        }
        if ctx.org_id != Some(identity.org_id) {
            return Err(AuthError::NotFound("identity"));
        }
        if !self
            .directory
            .can_manage_identities(&ctx.actor, identity.org_id)
            .await?
        {
            warn!(actor = ?ctx.actor, identity_id = %identity_id, "actor may not manage identity");
            return Err(AuthError::Forbidden);
        }
        Ok(identity)
    }

    async fn ensure_ip_allowlisting(&self, org_id: Uuid) -> Result<(), AuthError> {
        if self.directory.org_policy(org_id).await?.ip_allowlisting {
            Ok(())
        } else {
            Err(AuthError::validation(
                "Failed to restrict trusted IPs: IP allowlisting is not enabled for this organization",
            ))
        }
    }

    async fn universal_auth_of(&self, identity_id: Uuid) -> Result<UniversalAuthConfig, AuthError> {
        self.store
            .find_universal_auth(identity_id)
            .await?
            .ok_or(AuthError::NotFound("universal auth"))
    }

    /// Best effort org lookup for login audit events; a directory failure must not undo a
    /// token that was already issued.
    async fn org_of(&self, identity_id: Uuid) -> Option<Uuid> {
        match self.directory.find_identity(identity_id).await {
            Ok(identity) => identity.map(|identity| identity.org_id),
            Err(err) => {
                warn!(identity_id = %identity_id, "identity lookup for audit failed: {err}");
                None
            }
        }
    }

    fn check_rate_limit(&self, source_ip: IpAddr, action: RateLimitAction) -> Result<(), AuthError> {
        match self.rate_limiter.check_ip(source_ip, action) {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited => {
                warn!(source_ip = %source_ip, action = ?action, "login rate limited");
                Err(AuthError::RateLimited)
            }
        }
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, AuthError>>,
    ) -> Result<T, AuthError> {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .unwrap_or_else(|_| {
                warn!(timeout = ?self.operation_timeout, "operation timed out");
                Err(AuthError::Timeout)
            })
    }

    fn audit_ctx(&self, ctx: &ActorContext, org_id: Uuid, event: AuditEventKind) {
        self.record(ctx.actor, Some(org_id), ctx.source_ip, event);
    }

    fn record(
        &self,
        actor: Actor,
        org_id: Option<Uuid>,
        source_ip: Option<IpAddr>,
        event: AuditEventKind,
    ) {
        self.audit.record(AuditEvent {
            actor,
            org_id,
            timestamp: self.clock.now(),
            source_ip,
            event,
        });
    }
}

/// Whether any supplied list narrows access below "allow everything".
fn requests_restriction(lists: &[Option<&[TrustedIp]>]) -> Result<bool, AuthError> {
    for entries in lists.iter().flatten() {
        if TrustedIpList::new(entries.to_vec())?.is_restricted() {
            return Ok(true);
        }
    }
    Ok(false)
}
