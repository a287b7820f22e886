use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront order and payment API

Checkout, payment reconciliation, refunds and back-office order control for the storefront.

## Authentication

Checkout and verify-payment are public. The payment webhook is authenticated by its
HMAC signature. Every other endpoint requires an admin JWT:

```
Authorization: Bearer <your-jwt-token>
```

## Error Handling

Errors share one body format. Conflicts carry the numbers needed to correct the request:

```json
{
  "error": "Conflict",
  "message": "Refund of 61.00 exceeds the refundable balance of 60.00",
  "details": { "requested": "61.00", "max_refundable": "60.00" },
  "request_id": "5f0c...",
  "timestamp": "2024-01-01T00:00:00Z"
}
```

Amounts are strings with two decimal places.
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Cart checkout and payment verification"),
        (name = "Payments", description = "Payment processor webhooks"),
        (name = "Orders", description = "Admin order control"),
        (name = "Refunds", description = "Refund ledger"),
        (name = "Inventory", description = "Inventory ledger"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        handlers::checkout::create_checkout,
        handlers::checkout::verify_payment,
        handlers::payment_webhooks::payment_webhook,
        handlers::orders::get_order,
        handlers::orders::update_order,
        handlers::orders::cancel_order,
        handlers::orders::append_note,
        handlers::refunds::create_refund,
        handlers::refunds::list_refunds,
        handlers::inventory::get_stock,
        handlers::inventory::set_stock,
        handlers::inventory::adjust_stock,
        handlers::health::health_check,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::entities::FulfillmentStatus,
            crate::entities::PaymentStatus,
            crate::entities::RefundStatus,
            crate::entities::RefundType,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDocV1::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_lists_the_order_engine_routes() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("Storefront API"));
        assert!(json.contains("/api/v1/checkout"));
        assert!(json.contains("/api/v1/orders/{id}/refunds"));
        assert!(json.contains("/api/v1/payments/webhook"));
        assert!(json.contains("\"Bearer\""));
    }
}
