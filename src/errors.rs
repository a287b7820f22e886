use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::payment_processor::ProcessorError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "message": "Refund of 61.00 exceeds the refundable balance of 60.00",
    "details": { "requested": "61.00", "max_refundable": "60.00" },
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    #[schema(example = "Conflict")]
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable context the caller needs to correct the request
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Insufficient stock for product {product_id} ({product_name}): {available} available, {requested} requested")]
    InsufficientStock {
        product_id: i32,
        product_name: String,
        available: i32,
        requested: i32,
    },

    #[error("Stock conflict on order {order_id}: product {product_id} no longer has enough stock")]
    StockConflict { order_id: Uuid, product_id: i32 },

    #[error("Refund of {requested} exceeds the refundable balance of {max_refundable}")]
    RefundExceedsBalance {
        requested: Decimal,
        max_refundable: Decimal,
    },

    #[error("Refund of {requested} exceeds the {available_at_processor} still refundable at the payment processor")]
    ProcessorBalanceExceeded {
        requested: Decimal,
        available_at_processor: Decimal,
    },

    #[error("Invalid status transition from {current} to {requested}: {rule}")]
    InvalidTransition {
        current: String,
        requested: String,
        rule: String,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Payment processor error: {0}")]
    PaymentProcessor(String),

    #[error("Webhook signature rejected: {0}")]
    WebhookSignature(String),

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<ProcessorError> for ServiceError {
    fn from(err: ProcessorError) -> Self {
        ServiceError::PaymentProcessor(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::BadRequest(_)
            | Self::InvalidOperation(_)
            | Self::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Self::InsufficientStock { .. }
            | Self::StockConflict { .. }
            | Self::RefundExceedsBalance { .. }
            | Self::ProcessorBalanceExceeded { .. } => StatusCode::CONFLICT,
            Self::Unauthorized(_) | Self::WebhookSignature(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::IntegrityError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PaymentProcessor(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured context for conflict errors so callers can react without parsing messages.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InsufficientStock {
                product_id,
                product_name,
                available,
                requested,
            } => Some(json!({
                "product_id": product_id,
                "product_name": product_name,
                "available": available,
                "requested": requested,
            })),
            Self::StockConflict {
                order_id,
                product_id,
            } => Some(json!({
                "order_id": order_id,
                "product_id": product_id,
            })),
            Self::RefundExceedsBalance {
                requested,
                max_refundable,
            } => Some(json!({
                "requested": crate::money::display(*requested),
                "max_refundable": crate::money::display(*max_refundable),
            })),
            Self::ProcessorBalanceExceeded {
                requested,
                available_at_processor,
            } => Some(json!({
                "requested": crate::money::display(*requested),
                "available_at_processor": crate::money::display(*available_at_processor),
            })),
            Self::InvalidTransition {
                current,
                requested,
                rule,
            } => Some(json!({
                "current_status": current,
                "requested_status": requested,
                "rule": rule,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
