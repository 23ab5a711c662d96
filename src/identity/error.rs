//! Structured failures for machine identity authentication.
//!
//! Every failure carries a stable [`ErrorKind`] so callers can tell terminal credential
//! outcomes (never retry) from transient ones (retry with backoff), even when the transport
//! collapses several of them onto the same status code.

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    IpBlocked,
    RateLimited,
    SecretRevoked,
    SecretExpired,
    SecretUsesExceeded,
    TokenRevoked,
    TokenExpired,
    TokenUsesExceeded,
    Timeout,
    Store,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::IpBlocked => "ip_blocked",
            Self::RateLimited => "rate_limited",
            Self::SecretRevoked => "secret_revoked",
            Self::SecretExpired => "secret_expired",
            Self::SecretUsesExceeded => "secret_uses_exceeded",
            Self::TokenRevoked => "token_revoked",
            Self::TokenExpired => "token_expired",
            Self::TokenUsesExceeded => "token_uses_exceeded",
            Self::Timeout => "timeout",
            Self::Store => "store",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("identity already has {0} attached")]
    AlreadyAttached(&'static str),
    #[error("invalid credentials")]
    Unauthorized,
    #[error("actor is not allowed to manage this identity")]
    Forbidden,
    #[error("access denied due to IP address restriction")]
    IpBlocked,
    #[error("too many requests")]
    RateLimited,
    #[error("client secret has been revoked")]
    SecretRevoked,
    #[error("client secret has expired")]
    SecretExpired,
    #[error("client secret reached its usage limit and has been revoked")]
    SecretUsesExceeded,
    #[error("access token has been revoked")]
    TokenRevoked,
    #[error("access token has expired")]
    TokenExpired,
    #[error("access token reached its usage limit and has been revoked")]
    TokenUsesExceeded,
    #[error("operation timed out")]
    Timeout,
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl AuthError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyAttached(_) => ErrorKind::Conflict,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::IpBlocked => ErrorKind::IpBlocked,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::SecretRevoked => ErrorKind::SecretRevoked,
            Self::SecretExpired => ErrorKind::SecretExpired,
            Self::SecretUsesExceeded => ErrorKind::SecretUsesExceeded,
            Self::TokenRevoked => ErrorKind::TokenRevoked,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::TokenUsesExceeded => ErrorKind::TokenUsesExceeded,
            Self::Timeout => ErrorKind::Timeout,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// The credential can never succeed again; callers must stop retrying.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SecretRevoked
                | Self::SecretExpired
                | Self::SecretUsesExceeded
                | Self::TokenRevoked
                | Self::TokenExpired
                | Self::TokenUsesExceeded
        )
    }

    /// A later attempt may succeed (different network, after backoff, store recovered).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IpBlocked | Self::RateLimited | Self::Timeout | Self::Store(_)
        )
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.into())
    }
}
