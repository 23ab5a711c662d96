//! Who is calling a management operation.

use std::net::IpAddr;

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(tag = "type", content = "id", rename_all = "kebab-case")]
pub enum Actor {
    User(Uuid),
    Identity(Uuid),
    /// Platform operator authenticated with the operator token.
    Operator,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorContext {
    pub actor: Actor,
    /// Organization the actor is acting within.
    pub org_id: Option<Uuid>,
    /// Super admins bypass org scoping, membership checks and the org IP-allowlisting
    /// restriction on attach.
    pub is_super_admin: bool,
    /// Address the request came from, recorded on audit events.
    pub source_ip: Option<IpAddr>,
}

impl ActorContext {
    #[must_use]
    pub const fn user(user_id: Uuid, org_id: Uuid) -> Self {
        Self {
            actor: Actor::User(user_id),
            org_id: Some(org_id),
            is_super_admin: false,
            source_ip: None,
        }
    }

    #[must_use]
    pub const fn identity(identity_id: Uuid, org_id: Uuid) -> Self {
        Self {
            actor: Actor::Identity(identity_id),
            org_id: Some(org_id),
            is_super_admin: false,
            source_ip: None,
        }
    }

    #[must_use]
    pub const fn operator() -> Self {
        Self {
            actor: Actor::Operator,
            org_id: None,
            is_super_admin: true,
            source_ip: None,
        }
    }

    #[must_use]
    pub const fn with_super_admin(mut self, is_super_admin: bool) -> Self {
        self.is_super_admin = is_super_admin;
        self
    }

    #[must_use]
    pub const fn with_source_ip(mut self, source_ip: IpAddr) -> Self {
        self.source_ip = Some(source_ip);
        self
    }
}
