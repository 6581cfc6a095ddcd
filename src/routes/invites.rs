use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::{AppState, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::models::batch::BatchStatus;
use crate::services::dispatch::InviteDirectory;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInvitesResponse {
    pub queued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// POST /api/v1/questions/{question_id}/send-invites: queue invitation
/// emails for every access-granted recipient who has not registered yet.
pub async fn send_invites(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(question_id): Path<Uuid>,
) -> ApiResult<Json<SendInvitesResponse>> {
    match state.directory.can_manage(question_id, auth.user_id).await? {
        None => return Err(ApiError::not_found("Question not found")),
        Some(false) => {
            return Err(ApiError::forbidden(
                "Only the question owner or organization members can send invites",
            ))
        }
        Some(true) => {}
    }

    let outcome = state.dispatcher.dispatch_invites(question_id).await?;

    let response = match outcome.batch_id {
        Some(batch_id) => SendInvitesResponse {
            queued: outcome.queued,
            batch_id: Some(batch_id),
            message: None,
        },
        None => SendInvitesResponse {
            queued: 0,
            batch_id: None,
            message: Some("No pending invitations to send".to_string()),
        },
    };

    Ok(Json(response))
}

/// GET /api/v1/invites/batches/{batch_id}: progress of an invitation batch.
///
/// Expired and unknown batches are both reported as 404.
pub async fn batch_status(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<BatchStatus>> {
    let record = state
        .batches
        .fetch(batch_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Batch not found"))?;

    Ok(Json(BatchStatus::from(record)))
}
