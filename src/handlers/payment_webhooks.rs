use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{errors::ServiceError, services::reconciliation::ReconcileOutcome, AppState};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: ReconcileOutcome,
}

/// Receives signed processor events. The raw body is needed for the signature,
/// so it is taken as bytes and parsed after verification.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Event applied, already applied or ignored", body = WebhookAck),
        (status = 400, description = "Malformed event; will not be retried usefully", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 409, description = "Payment confirmed but stock exhausted", body = crate::errors::ErrorResponse),
        (status = 422, description = "Event references an unknown order", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let outcome = state
        .services
        .reconciler
        .handle_webhook(&headers, &body)
        .await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
