use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    errors::ServiceError,
    services::{
        checkout::{CheckoutRequest, CheckoutResponse},
        reconciliation::VerifyPaymentResponse,
    },
    AppState,
};

/// Creates a PENDING order and a hosted checkout session
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created, redirect the customer to the session", body = CheckoutResponse),
        (status = 400, description = "Invalid cart or delivery info", body = crate::errors::ErrorResponse),
        (status = 409, description = "A product does not have enough stock", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment processor unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ServiceError> {
    let response = state.services.checkout.create_checkout(payload).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Polling fallback used by the success page when the webhook is late
#[utoipa::path(
    get,
    path = "/api/v1/checkout/verify/{session_id}",
    params(("session_id" = String, Path, description = "Checkout session id returned at checkout")),
    responses(
        (status = 200, description = "Current payment state of the order", body = VerifyPaymentResponse),
        (status = 404, description = "No order for this session", body = crate::errors::ErrorResponse),
        (status = 409, description = "Paid but stock is exhausted", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment processor unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<VerifyPaymentResponse>, ServiceError> {
    let response = state.services.reconciler.verify_session(&session_id).await?;
    Ok(Json(response))
}
