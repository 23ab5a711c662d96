//! Audit events for machine identity operations.
//!
//! The core builds the event payload; delivery belongs to the [`AuditSink`]. Reads are
//! audited as well as writes.

use std::{net::IpAddr, sync::Mutex};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use super::{actor::Actor, gcp::GcpAuthType};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub actor: Actor,
    pub org_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source_ip: Option<IpAddr>,
    #[serde(flatten)]
    pub event: AuditEventKind,
}

/// Event type plus its metadata payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "metadata", rename_all = "kebab-case")]
pub enum AuditEventKind {
    #[serde(rename_all = "camelCase")]
    LoginIdentityUniversalAuth {
        identity_id: Uuid,
        identity_universal_auth_id: Uuid,
        client_secret_id: Uuid,
        identity_access_token_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    AddIdentityUniversalAuth {
        identity_id: Uuid,
        access_token_ttl: u64,
        access_token_max_ttl: u64,
        access_token_num_uses_limit: u64,
        access_token_period: u64,
        client_secret_trusted_ips: String,
        access_token_trusted_ips: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateIdentityUniversalAuth {
        identity_id: Uuid,
        access_token_ttl: u64,
        access_token_max_ttl: u64,
        access_token_num_uses_limit: u64,
        access_token_period: u64,
        client_secret_trusted_ips: String,
        access_token_trusted_ips: String,
    },
    #[serde(rename_all = "camelCase")]
    GetIdentityUniversalAuth { identity_id: Uuid },
    #[serde(rename_all = "camelCase")]
    RevokeIdentityUniversalAuth { identity_id: Uuid },
    #[serde(rename_all = "camelCase")]
    CreateIdentityUniversalAuthClientSecret {
        identity_id: Uuid,
        client_secret_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    GetIdentityUniversalAuthClientSecrets { identity_id: Uuid },
    #[serde(rename_all = "camelCase")]
    GetIdentityUniversalAuthClientSecret {
        identity_id: Uuid,
        client_secret_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    RevokeIdentityUniversalAuthClientSecret {
        identity_id: Uuid,
        client_secret_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    LoginIdentityGcpAuth {
        identity_id: Uuid,
        identity_gcp_auth_id: Uuid,
        identity_access_token_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    AddIdentityGcpAuth {
        identity_id: Uuid,
        #[serde(rename = "type")]
        auth_type: GcpAuthType,
        allowed_service_accounts: String,
        allowed_projects: String,
        allowed_zones: String,
        access_token_ttl: u64,
        access_token_max_ttl: u64,
        access_token_num_uses_limit: u64,
        access_token_trusted_ips: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateIdentityGcpAuth {
        identity_id: Uuid,
        #[serde(rename = "type")]
        auth_type: GcpAuthType,
        allowed_service_accounts: String,
        allowed_projects: String,
        allowed_zones: String,
        access_token_ttl: u64,
        access_token_max_ttl: u64,
        access_token_num_uses_limit: u64,
        access_token_trusted_ips: String,
    },
    #[serde(rename_all = "camelCase")]
    GetIdentityGcpAuth { identity_id: Uuid },
    #[serde(rename_all = "camelCase")]
    RevokeIdentityGcpAuth { identity_id: Uuid },
    #[serde(rename_all = "camelCase")]
    RevokeIdentityAccessToken {
        identity_id: Uuid,
        identity_access_token_id: Uuid,
    },
}

impl AuditEventKind {
    /// Kebab-case event type, as serialized.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::LoginIdentityUniversalAuth { .. } => "login-identity-universal-auth",
            Self::AddIdentityUniversalAuth { .. } => "add-identity-universal-auth",
            Self::UpdateIdentityUniversalAuth { .. } => "update-identity-universal-auth",
            Self::GetIdentityUniversalAuth { .. } => "get-identity-universal-auth",
            Self::RevokeIdentityUniversalAuth { .. } => "revoke-identity-universal-auth",
            Self::CreateIdentityUniversalAuthClientSecret { .. } => {
                "create-identity-universal-auth-client-secret"
            }
            Self::GetIdentityUniversalAuthClientSecrets { .. } => {
                "get-identity-universal-auth-client-secrets"
            }
            Self::GetIdentityUniversalAuthClientSecret { .. } => {
                "get-identity-universal-auth-client-secret"
            }
            Self::RevokeIdentityUniversalAuthClientSecret { .. } => {
                "revoke-identity-universal-auth-client-secret"
            }
            Self::LoginIdentityGcpAuth { .. } => "login-identity-gcp-auth",
            Self::AddIdentityGcpAuth { .. } => "add-identity-gcp-auth",
            Self::UpdateIdentityGcpAuth { .. } => "update-identity-gcp-auth",
            Self::GetIdentityGcpAuth { .. } => "get-identity-gcp-auth",
            Self::RevokeIdentityGcpAuth { .. } => "revoke-identity-gcp-auth",
            Self::RevokeIdentityAccessToken { .. } => "revoke-identity-access-token",
        }
    }
}

/// Receives audit events. Delivery and retry are the sink's concern.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits each event as a structured log line on the `audit` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(target: "audit", "Failed to serialize audit event: {err}");
                return;
            }
        };
        info!(
            target: "audit",
            event_type = event.event.event_type(),
            org_id = ?event.org_id,
            audit_event = %payload,
            "audit"
        );
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
