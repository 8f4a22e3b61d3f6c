//! Signing request submission and listing endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use treasury_types::{SigningRequestRecord, SigningRequestStatus, SigningRequestType};

use crate::{error::ApiError, state::AppState, ApiResult};

/// One signer's signed copy of a pending request.
#[derive(Debug, Deserialize)]
pub struct SubmitSignatureRequest {
    /// Base64 PSBT carrying this signer's partial signatures.
    pub psbt: String,
}

/// POST /signing-requests/:id/signatures - submit one signed copy.
/// Returns 204 with an empty body on success.
pub async fn submit_signature(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitSignatureRequest>,
) -> ApiResult<StatusCode> {
    if payload.psbt.trim().is_empty() {
        return Err(ApiError::BadRequest("psbt is required".to_string()));
    }

    state.ledger.submit_signature(&id, &payload.psbt).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Optional filters for the listing endpoint.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub request_type: Option<String>,
}

/// GET /signing-requests?status=&type= - read-only listing.
pub async fn list_signing_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<SigningRequestRecord>>> {
    let status = query
        .status
        .as_deref()
        .map(SigningRequestStatus::parse)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let request_type = query
        .request_type
        .as_deref()
        .map(SigningRequestType::parse)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let requests = state.ledger.list(status, request_type)?;
    Ok(Json(requests))
}
