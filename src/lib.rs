//! # Universal Auth
//!
//! Authentication for machine identities (workloads, pipelines, agents). An identity proves
//! who it is by presenting a **client ID and client secret** (Universal Auth) or a
//! **Google-signed identity token** (GCP auth) and receives a short-lived **access token**.
//!
//! ## Credentials
//!
//! Client secrets are random strings shown once at creation. Only an Argon2id hash (peppered
//! with a server-side secret) and a short display prefix are stored. Each secret may carry its
//! own TTL and use limit; the use counter is incremented atomically together with the access
//! token insert, so concurrent logins can never exceed the limit.
//!
//! ## Access tokens
//!
//! Access tokens are PASETO `v4.public` tokens signed with Ed25519. The token only carries the
//! identity, the record ID (`jti`) and the auth method; TTL, max TTL, use limit, renewal period
//! and trusted IPs live in the stored record and are enforced on every use.
//!
//! ## Layout
//!
//! - [`identity`]: the core (codecs, policies, verifiers, issuer, service facade).
//! - [`store`]: the persistence seam with in-memory and `PostgreSQL` implementations.
//! - [`api`]: the axum HTTP adapter and its `OpenAPI` document.
//! - [`cli`]: argument parsing, telemetry and the server action.
//!
//! The `PostgreSQL` schema lives in `sql/schema.sql`.

pub mod api;
pub mod cli;
pub mod identity;
pub mod store;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
