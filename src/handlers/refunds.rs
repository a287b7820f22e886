use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    auth::AdminOperator,
    errors::ServiceError,
    services::refunds::{CreateRefundRequest, RefundHistory, RefundResult},
    AppState,
};

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refunds",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = CreateRefundRequest,
    responses(
        (status = 201, description = "Refund issued", body = RefundResult),
        (status = 400, description = "Invalid amount, reason or order state", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Amount exceeds the refundable balance", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment processor rejected the refund", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Refunds"
)]
pub async fn create_refund(
    State(state): State<AppState>,
    operator: AdminOperator,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreateRefundRequest>,
) -> Result<(StatusCode, Json<RefundResult>), ServiceError> {
    let result = state
        .services
        .refunds
        .create_refund(id, payload, operator.identity())
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/refunds",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Refund history and balance", body = RefundHistory),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Refunds"
)]
pub async fn list_refunds(
    State(state): State<AppState>,
    _operator: AdminOperator,
    Path(id): Path<Uuid>,
) -> Result<Json<RefundHistory>, ServiceError> {
    Ok(Json(state.services.refunds.list_refunds(id).await?))
}
