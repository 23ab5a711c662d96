use axum::{
    Json,
    extract::Extension,
    http::{Extensions, HeaderMap},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::ToSchema;

use super::{ErrorBody, SharedState};
use crate::identity::error::AuthError;

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RevokeTokenRequest {
    #[schema(value_type = String)]
    pub access_token: SecretString,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevokeTokenResponse {
    pub message: String,
}

#[utoipa::path(
    post,
    path = "/v1/auth/token/revoke",
    request_body = RevokeTokenRequest,
    responses (
        (status = 200, description = "Access token revoked", body = RevokeTokenResponse),
        (status = 401, description = "Token was not issued by this service", body = ErrorBody),
    ),
    tag = "token",
)]
#[instrument(skip_all)]
pub async fn revoke(
    Extension(state): Extension<SharedState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<RevokeTokenRequest>,
) -> Result<Json<RevokeTokenResponse>, AuthError> {
    let source_ip = state.client_ip(&headers, &extensions);
    state
        .service
        .revoke_access_token(request.access_token.expose_secret(), source_ip)
        .await?;
    Ok(Json(RevokeTokenResponse {
        message: "Successfully revoked access token".to_string(),
    }))
}
