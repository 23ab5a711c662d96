//! Universal Auth routes: client secret login, config management and client secrets.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{Extensions, HeaderMap},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{AccessTokenResponse, ErrorBody, SharedState, no_store};
use crate::identity::{
    client_secret::{ClientSecretView, NewClientSecret},
    config::{UniversalAuthConfig, UniversalAuthInput},
    error::AuthError,
};

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub client_id: Uuid,
    #[schema(value_type = String)]
    pub client_secret: SecretString,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UniversalAuthResponse {
    pub identity_universal_auth: UniversalAuthConfig,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientSecretResponse {
    pub client_secret_data: ClientSecretView,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientSecretListResponse {
    pub client_secret_data: Vec<ClientSecretView>,
}

/// Creation response; the only time the plaintext is returned.
#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreatedClientSecretResponse {
    pub client_secret: String,
    pub client_secret_data: ClientSecretView,
}

#[utoipa::path(
    post,
    path = "/v1/auth/universal-auth/login",
    request_body = LoginRequest,
    responses (
        (status = 200, description = "Access token issued", body = AccessTokenResponse),
        (status = 401, description = "Invalid, revoked, expired or exhausted client secret", body = ErrorBody),
        (status = 403, description = "Source address is not trusted", body = ErrorBody),
        (status = 404, description = "Unknown client ID", body = ErrorBody),
        (status = 429, description = "Too many login attempts", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(client_id = %request.client_id))]
pub async fn login(
    Extension(state): Extension<SharedState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<AccessTokenResponse>), AuthError> {
    let source_ip = state.client_ip(&headers, &extensions);
    let issued = state
        .service
        .login(request.client_id, request.client_secret, source_ip)
        .await?;
    Ok((no_store(), Json(issued.into())))
}

#[utoipa::path(
    post,
    path = "/v1/auth/universal-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    request_body = UniversalAuthInput,
    responses (
        (status = 200, description = "Universal Auth attached", body = UniversalAuthResponse),
        (status = 400, description = "Invalid TTL bounds or trusted IPs", body = ErrorBody),
        (status = 409, description = "Universal Auth is already attached", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn attach(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(input): Json<UniversalAuthInput>,
) -> Result<Json<UniversalAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state
        .service
        .attach_universal_auth(identity_id, &input, &actor)
        .await?;
    Ok(Json(UniversalAuthResponse {
        identity_universal_auth: config,
    }))
}

#[utoipa::path(
    patch,
    path = "/v1/auth/universal-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    request_body = UniversalAuthInput,
    responses (
        (status = 200, description = "Universal Auth updated", body = UniversalAuthResponse),
        (status = 400, description = "Merged TTL bounds or trusted IPs are invalid", body = ErrorBody),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn update(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(input): Json<UniversalAuthInput>,
) -> Result<Json<UniversalAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state
        .service
        .update_universal_auth(identity_id, &input, &actor)
        .await?;
    Ok(Json(UniversalAuthResponse {
        identity_universal_auth: config,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/auth/universal-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    responses (
        (status = 200, description = "Universal Auth config", body = UniversalAuthResponse),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn get(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<UniversalAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state.service.get_universal_auth(identity_id, &actor).await?;
    Ok(Json(UniversalAuthResponse {
        identity_universal_auth: config,
    }))
}

#[utoipa::path(
    delete,
    path = "/v1/auth/universal-auth/identities/{identityId}",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    responses (
        (status = 200, description = "Universal Auth revoked with all client secrets", body = UniversalAuthResponse),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn revoke(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<UniversalAuthResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let config = state
        .service
        .revoke_universal_auth(identity_id, &actor)
        .await?;
    Ok(Json(UniversalAuthResponse {
        identity_universal_auth: config,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/auth/universal-auth/identities/{identityId}/client-secrets",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    request_body = NewClientSecret,
    responses (
        (status = 200, description = "Client secret created", body = CreatedClientSecretResponse),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn create_client_secret(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<NewClientSecret>,
) -> Result<(HeaderMap, Json<CreatedClientSecretResponse>), AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let issued = state
        .service
        .create_client_secret(identity_id, &request, &actor)
        .await?;
    Ok((
        no_store(),
        Json(CreatedClientSecretResponse {
            client_secret: issued.client_secret.expose_secret().to_string(),
            client_secret_data: issued.record,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/auth/universal-auth/identities/{identityId}/client-secrets",
    params(("identityId" = Uuid, Path, description = "Machine identity")),
    responses (
        (status = 200, description = "Active client secrets", body = ClientSecretListResponse),
        (status = 404, description = "Identity or config not found", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id))]
pub async fn list_client_secrets(
    Extension(state): Extension<SharedState>,
    Path(identity_id): Path<Uuid>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<ClientSecretListResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let secrets = state
        .service
        .list_client_secrets(identity_id, &actor)
        .await?;
    Ok(Json(ClientSecretListResponse {
        client_secret_data: secrets,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/auth/universal-auth/identities/{identityId}/client-secrets/{clientSecretId}",
    params(
        ("identityId" = Uuid, Path, description = "Machine identity"),
        ("clientSecretId" = Uuid, Path, description = "Client secret"),
    ),
    responses (
        (status = 200, description = "Client secret metadata", body = ClientSecretResponse),
        (status = 404, description = "Identity, config or secret not found", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id, client_secret_id = %client_secret_id))]
pub async fn get_client_secret(
    Extension(state): Extension<SharedState>,
    Path((identity_id, client_secret_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<ClientSecretResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let secret = state
        .service
        .get_client_secret(identity_id, client_secret_id, &actor)
        .await?;
    Ok(Json(ClientSecretResponse {
        client_secret_data: secret,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/auth/universal-auth/identities/{identityId}/client-secrets/{clientSecretId}/revoke",
    params(
        ("identityId" = Uuid, Path, description = "Machine identity"),
        ("clientSecretId" = Uuid, Path, description = "Client secret"),
    ),
    responses (
        (status = 200, description = "Client secret revoked", body = ClientSecretResponse),
        (status = 404, description = "Identity, config or secret not found", body = ErrorBody),
    ),
    tag = "universal-auth",
)]
#[instrument(skip_all, fields(identity_id = %identity_id, client_secret_id = %client_secret_id))]
pub async fn revoke_client_secret(
    Extension(state): Extension<SharedState>,
    Path((identity_id, client_secret_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<ClientSecretResponse>, AuthError> {
    let actor = state.actor(&headers, state.client_ip(&headers, &extensions)).await?;
    let secret = state
        .service
        .revoke_client_secret(identity_id, client_secret_id, &actor)
        .await?;
    Ok(Json(ClientSecretResponse {
        client_secret_data: secret,
    }))
}
