pub mod gcp_auth;
pub mod health;
pub mod token;
pub mod universal_auth;

// common functions for the handlers
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Json,
    extract::ConnectInfo,
    http::{
        Extensions, HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL},
    },
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error};
use utoipa::ToSchema;

use crate::identity::{
    UniversalAuthService,
    actor::ActorContext,
    error::{AuthError, ErrorKind},
    token::IssuedAccessToken,
    trusted_ip::TrustedIpList,
};

/// Shared state handed to every handler through an `Extension`.
pub struct AppState {
    pub service: UniversalAuthService,
    operator_token_digest: Option<[u8; 32]>,
    trusted_proxies: Option<TrustedIpList>,
}

impl AppState {
    #[must_use]
    pub fn new(service: UniversalAuthService, operator_token: Option<&SecretString>) -> Self {
        Self {
            service,
            operator_token_digest: operator_token
                .map(|token| Sha256::digest(token.expose_secret().as_bytes()).into()),
            trusted_proxies: None,
        }
    }

    /// Honor `x-forwarded-for` / `x-real-ip` from peers inside `proxies`.
    #[must_use]
    pub fn with_trusted_proxies(mut self, proxies: TrustedIpList) -> Self {
        self.trusted_proxies = Some(proxies);
        self
    }

    /// Address the trusted-IP checks run against.
    pub(crate) fn client_ip(&self, headers: &HeaderMap, extensions: &Extensions) -> IpAddr {
        client_ip(headers, extensions, self.trusted_proxies.as_ref())
    }

    fn is_operator_token(&self, bearer: &str) -> bool {
        self.operator_token_digest.is_some_and(|digest| {
            let presented: [u8; 32] = Sha256::digest(bearer.as_bytes()).into();
            presented == digest
        })
    }

    /// Resolve the caller of a management route.
    ///
    /// # Errors
    /// `Unauthorized` without a usable bearer, or any access token failure.
    pub async fn actor(
        &self,
        headers: &HeaderMap,
        source_ip: IpAddr,
    ) -> Result<ActorContext, AuthError> {
        let bearer = extract_bearer_token(headers).ok_or(AuthError::Unauthorized)?;
        if self.is_operator_token(&bearer) {
            debug!("operator token presented");
            return Ok(ActorContext::operator().with_source_ip(source_ip));
        }
        self.service.identity_actor(&bearer, source_ip).await
    }
}

pub type SharedState = Arc<AppState>;

#[derive(ToSchema, Serialize, Debug)]
pub struct ErrorBody {
    #[schema(value_type = String)]
    pub error: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(rename = "accessTokenMaxTTL")]
    pub access_token_max_ttl: u64,
    pub token_type: String,
}

impl From<IssuedAccessToken> for AccessTokenResponse {
    fn from(issued: IssuedAccessToken) -> Self {
        Self {
            access_token: issued.access_token.expose_secret().to_string(),
            expires_in: issued.expires_in,
            access_token_max_ttl: issued.access_token_max_ttl,
            token_type: issued.token_type.to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthorized
            | ErrorKind::SecretRevoked
            | ErrorKind::SecretExpired
            | ErrorKind::SecretUsesExceeded
            | ErrorKind::TokenRevoked
            | ErrorKind::TokenExpired
            | ErrorKind::TokenUsesExceeded => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden | ErrorKind::IpBlocked => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Store => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if let Self::Store(err) = &self {
            error!("Store failure: {err:#}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorBody {
            error: self.kind(),
            message,
            retryable: self.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

/// Headers for responses that carry a plaintext secret or a bearer token.
pub(crate) fn no_store() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers
}

/// Client address used for trusted-IP enforcement.
///
/// The socket peer is authoritative. Forwarding headers are read only when the peer is one of
/// `trusted_proxies`; `x-forwarded-for` is walked right to left and the first hop that is not
/// itself a trusted proxy wins, so a client cannot prepend its own entry.
pub(crate) fn client_ip(
    headers: &HeaderMap,
    extensions: &Extensions,
    trusted_proxies: Option<&TrustedIpList>,
) -> IpAddr {
    let Some(peer) = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    };
    let Some(proxies) = trusted_proxies.filter(|proxies| proxies.is_allowed(peer)) else {
        return peer;
    };

    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    if let Some(forwarded) = header("x-forwarded-for") {
        let hops: Vec<IpAddr> = forwarded
            .split(',')
            .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
            .collect();
        if let Some(client) = hops.iter().rev().find(|hop| !proxies.is_allowed(**hop)) {
            return *client;
        }
        if let Some(first) = hops.first() {
            return *first;
        }
    }
    header("x-real-ip")
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::to_bytes;

    fn peer(ip: [u8; 4]) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from((ip, 4000))));
        extensions
    }

    fn forwarded_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.9.9.9, 203.0.113.7"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        headers
    }

    #[test]
    fn client_ip_ignores_forwarding_headers_by_default() {
        let headers = forwarded_headers();
        assert_eq!(
            client_ip(&headers, &peer([198, 51, 100, 1]), None),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1))
        );
        assert_eq!(
            client_ip(&headers, &Extensions::new(), None),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn client_ip_ignores_forwarding_headers_from_untrusted_peers() -> Result<()> {
        let proxies = TrustedIpList::parse(["10.0.0.0/8"])?;
        assert_eq!(
            client_ip(&forwarded_headers(), &peer([198, 51, 100, 1]), Some(&proxies)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1))
        );
        Ok(())
    }

    #[test]
    fn client_ip_walks_forwarded_for_behind_trusted_proxy() -> Result<()> {
        let proxies = TrustedIpList::parse(["10.0.0.0/8"])?;
        let behind_proxy = peer([10, 0, 0, 1]);

        // The rightmost hop not owned by a proxy is the client; a spoofed left entry is skipped.
        let mut headers = forwarded_headers();
        assert_eq!(
            client_ip(&headers, &behind_proxy, Some(&proxies)),
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
        );

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1, 10.2.2.2"));
        assert_eq!(
            client_ip(&headers, &behind_proxy, Some(&proxies)),
            IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))
        );

        headers.remove("x-forwarded-for");
        assert_eq!(
            client_ip(&headers, &behind_proxy, Some(&proxies)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2))
        );

        headers.remove("x-real-ip");
        assert_eq!(
            client_ip(&headers, &behind_proxy, Some(&proxies)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        );
        Ok(())
    }

    #[test]
    fn secret_request_bodies_deserialize() -> Result<()> {
        let login: universal_auth::LoginRequest = serde_json::from_str(
            r#"{"clientId":"6f1c9d4e-2b7a-4c1e-9a53-0d8e4f2b7c11","clientSecret":"s3cr3t"}"#,
        )?;
        assert_eq!(login.client_secret.expose_secret(), "s3cr3t");
        assert!(!format!("{login:?}").contains("s3cr3t"));

        let gcp: gcp_auth::GcpLoginRequest = serde_json::from_str(
            r#"{"identityId":"6f1c9d4e-2b7a-4c1e-9a53-0d8e4f2b7c11","jwt":"a.b.c"}"#,
        )?;
        assert_eq!(gcp.jwt.expose_secret(), "a.b.c");

        let revoke: token::RevokeTokenRequest =
            serde_json::from_str(r#"{"accessToken":"v4.public.x"}"#)?;
        assert_eq!(revoke.access_token.expose_secret(), "v4.public.x");
        Ok(())
    }

    #[test]
    fn bearer_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer v4.public.x"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("v4.public.x"));
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retryable_in_body() -> Result<()> {
        let response = AuthError::SecretUsesExceeded.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let body: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(body["error"], "secret_uses_exceeded");
        assert_eq!(body["retryable"], false);
        Ok(())
    }

    #[tokio::test]
    async fn store_errors_hide_details() -> Result<()> {
        let response = AuthError::Store(anyhow::anyhow!("password=hunter2")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let text = String::from_utf8(body.to_vec())?;
        assert!(!text.contains("hunter2"));
        assert!(text.contains("\"retryable\":true"));
        Ok(())
    }
}
