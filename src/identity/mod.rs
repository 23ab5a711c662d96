//! Machine identity authentication core.

pub mod actor;
pub mod audit;
pub mod client_secret;
pub mod clock;
pub mod config;
pub mod error;
pub mod gcp;
pub mod jwks;
pub mod policy;
pub mod rate_limit;
pub mod secret_codec;
pub mod service;
pub mod token;
pub mod trusted_ip;
pub mod verifier;

pub use error::{AuthError, ErrorKind};
pub use service::UniversalAuthService;
