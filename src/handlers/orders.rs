use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    auth::AdminOperator,
    errors::ServiceError,
    services::orders::{
        AppendNoteRequest, CancelOrderRequest, NoteView, OrderDetail, UpdateOrderRequest,
    },
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with items, notes and refunds", body = OrderDetail),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    _operator: AdminOperator,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetail>, ServiceError> {
    Ok(Json(state.services.orders.get_order(id).await?))
}

#[utoipa::path(
    patch,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderRequest,
    responses(
        (status = 200, description = "Order updated", body = OrderDetail),
        (status = 400, description = "Invalid request or status transition", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_order(
    State(state): State<AppState>,
    operator: AdminOperator,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderRequest>,
) -> Result<Json<OrderDetail>, ServiceError> {
    let order = state
        .services
        .orders
        .update_order(id, payload, operator.identity())
        .await?;
    Ok(Json(order))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled", body = OrderDetail),
        (status = 400, description = "Order already shipped or delivered", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    operator: AdminOperator,
    Path(id): Path<Uuid>,
    payload: Option<Json<CancelOrderRequest>>,
) -> Result<Json<OrderDetail>, ServiceError> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    let order = state
        .services
        .orders
        .cancel_order(id, request, operator.identity())
        .await?;
    Ok(Json(order))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/notes",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = AppendNoteRequest,
    responses(
        (status = 201, description = "Note appended", body = NoteView),
        (status = 400, description = "Empty note", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn append_note(
    State(state): State<AppState>,
    operator: AdminOperator,
    Path(id): Path<Uuid>,
    Json(payload): Json<AppendNoteRequest>,
) -> Result<(StatusCode, Json<NoteView>), ServiceError> {
    let note = state
        .services
        .orders
        .append_note(id, payload, operator.identity())
        .await?;
    Ok((StatusCode::CREATED, Json(note)))
}
