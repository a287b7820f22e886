use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    auth::AdminOperator, errors::ServiceError, services::inventory::StockLevel, AppState,
};

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct SetStockRequest {
    #[validate(range(min = 0))]
    pub stock: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct AdjustStockRequest {
    /// Signed change; negative values never take stock below zero
    pub delta: i32,
}

#[utoipa::path(
    get,
    path = "/api/v1/inventory/{product_id}",
    params(("product_id" = i32, Path, description = "Product id")),
    responses(
        (status = 200, description = "Current stock", body = StockLevel),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Inventory"
)]
pub async fn get_stock(
    State(state): State<AppState>,
    _operator: AdminOperator,
    Path(product_id): Path<i32>,
) -> Result<Json<StockLevel>, ServiceError> {
    Ok(Json(state.services.inventory.get_stock(product_id).await?))
}

#[utoipa::path(
    put,
    path = "/api/v1/inventory/{product_id}",
    params(("product_id" = i32, Path, description = "Product id")),
    request_body = SetStockRequest,
    responses(
        (status = 200, description = "Stock set", body = StockLevel),
        (status = 400, description = "Negative stock", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Inventory"
)]
pub async fn set_stock(
    State(state): State<AppState>,
    operator: AdminOperator,
    Path(product_id): Path<i32>,
    Json(payload): Json<SetStockRequest>,
) -> Result<Json<StockLevel>, ServiceError> {
    payload.validate()?;
    tracing::info!(operator = operator.identity(), product_id, "Admin stock set");
    Ok(Json(
        state
            .services
            .inventory
            .set_stock(product_id, payload.stock)
            .await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/inventory/{product_id}/adjust",
    params(("product_id" = i32, Path, description = "Product id")),
    request_body = AdjustStockRequest,
    responses(
        (status = 200, description = "Stock adjusted", body = StockLevel),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Adjustment would make stock negative", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Inventory"
)]
pub async fn adjust_stock(
    State(state): State<AppState>,
    operator: AdminOperator,
    Path(product_id): Path<i32>,
    Json(payload): Json<AdjustStockRequest>,
) -> Result<Json<StockLevel>, ServiceError> {
    tracing::info!(operator = operator.identity(), product_id, delta = payload.delta, "Admin stock adjustment");
    Ok(Json(
        state
            .services
            .inventory
            .adjust_stock(product_id, payload.delta)
            .await?,
    ))
}
