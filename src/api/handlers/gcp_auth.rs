use axum::{
    Json,
    extract::{Extension, Path},
    http::{Extensions, HeaderMap},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{AccessTokenResponse, ErrorBody, SharedState, no_store};
use crate::identity::{
    error::AuthError,
    gcp::{GcpAuthConfig, GcpAuthInput},
};

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GcpLoginRequest {
    pub identity_id: Uuid,
    /// Google-signed identity token.
    #[schema(value_type = String)]
    pub jwt: SecretString,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GcpAuthResponse {
    pub identity_gcp_auth: GcpAuthConfig,
}

#[utoipa::path(
    post,
    path = "/v1/auth/gcp-auth/login",
    request_body = GcpLoginRequest,
    responses (
        (status = 200, description = "Access token issued", body = AccessTokenResponse),
        (status = 401, description = "Token rejected or principal not allowed", body = ErrorBody),
        (status = 404, description = "GCP auth is not configured for the identity", body = ErrorBody),
        (status = 429, description = "Too many login attempts", body = ErrorBody),
    ),
    tag = "gcp-auth",
)]
#[instrument(skip_all, fields(identity_id = %request.identity_id))]
pub async fn login(
    Extension(state): Extension<SharedState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<GcpLoginRequest>,
) -> Result<(HeaderMap, Json<AccessTokenResponse>), AuthError> {
    let source_ip = state.client_ip(&headers, &extensions);
    let issued = state
        .service
        .login_gcp(request.identity_id, request.jwt, source_ip)
        .await?;
    Ok((no_store(), Json(issued.into())))
}

#[utoipa::path(
    post,
    path = "/v1/auth/gcp-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    request_body = GcpAuthInput,
    responses (
        (status = 200, description = "GCP auth attached", body = GcpAuthResponse),
        (status = 400, description = "Invalid TTL bounds or trusted IPs", body = ErrorBody),
        (status = 409, description = "GCP auth is already attached", body = ErrorBody),
    ),
    tag = "gcp-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn attach(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(input): Json<GcpAuthInput>,
) -> Result<Json<GcpAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state
        .service
        .attach_gcp_auth(identity_id, &input, &actor)
        .await?;
    Ok(Json(GcpAuthResponse {
        identity_gcp_auth: config,
    }))
}

#[utoipa::path(
    patch,
    path = "/v1/auth/gcp-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    request_body = GcpAuthInput,
    responses (
        (status = 200, description = "GCP auth updated", body = GcpAuthResponse),
        (status = 400, description = "Merged TTL bounds or trusted IPs are invalid", body = ErrorBody),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "gcp-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn update(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(input): Json<GcpAuthInput>,
) -> Result<Json<GcpAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state
        .service
        .update_gcp_auth(identity_id, &input, &actor)
        .await?;
    Ok(Json(GcpAuthResponse {
        identity_gcp_auth: config,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/auth/gcp-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    responses (
        (status = 200, description = "GCP auth config", body = GcpAuthResponse),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "gcp-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn get(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<GcpAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state.service.get_gcp_auth(identity_id, &actor).await?;
    Ok(Json(GcpAuthResponse {
        identity_gcp_auth: config,
    }))
}

#[utoipa::path(
    delete,
    path = "/v1/auth/gcp-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    responses (
        (status = 200, description = "GCP auth revoked", body = GcpAuthResponse),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "gcp-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn revoke(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<GcpAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state.service.revoke_gcp_auth(identity_id, &actor).await?;
    Ok(Json(GcpAuthResponse {
        identity_gcp_auth: config,
    }))
}
