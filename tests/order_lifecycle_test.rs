//! End-to-end order lifecycle: checkout, payment confirmation by webhook or by
//! polling, fulfillment and refund.

mod common;

use axum::http::Method;
use common::{completed_event, response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::entities::{FulfillmentStatus, PaymentStatus};
use uuid::Uuid;

#[tokio::test]
async fn checkout_pay_ship_and_refund() {
    let app = TestApp::new().await;
    app.seed_product_with(7, "Ceramic Mug", dec!(10.00), 5, true)
        .await;

    let checkout = app.checkout(&[(7, 2)]).await;
    assert_eq!(checkout["total"], "20.00");
    let order_id: Uuid = checkout["orderId"].as_str().unwrap().parse().unwrap();
    assert_eq!(app.stock(7).await, 5);

    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;
    let response = app.deliver_webhook(&completed_event(&snapshot)).await;
    assert_eq!(response_json(response).await["outcome"], "APPLIED");

    assert_eq!(app.stock(7).await, 3);
    let order = app.order(order_id).await;
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Processing);
    assert_eq!(order.payment_status, PaymentStatus::Paid);

    let response = app
        .request_authenticated(
            Method::POST,
            &format!("/api/v1/orders/{}/refunds", order_id),
            Some(json!({ "amount": "20.00", "reason": "item damaged in transit" })),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body = response_json(response).await;
    assert_eq!(body["refund"]["refundType"], "FULL");
    assert_eq!(body["orderUpdate"]["newPaymentStatus"], "REFUNDED");
    assert_eq!(body["orderUpdate"]["remainingAmount"], "0.00");

    let response = app
        .request_authenticated(Method::GET, &format!("/api/v1/orders/{}", order_id), None)
        .await;
    let detail = response_json(response).await;
    assert_eq!(detail["paymentStatus"], "REFUNDED");
    assert_eq!(detail["refunds"][0]["reason"], "item damaged in transit");
    assert_eq!(detail["refundSummary"]["totalRefunded"], "20.00");
    assert!(detail["adminNotes"]
        .as_str()
        .unwrap()
        .contains("item damaged in transit"));

    // A refund does not restock
    assert_eq!(app.stock(7).await, 3);
}

#[tokio::test]
async fn verify_payment_applies_a_paid_session_when_the_webhook_is_late() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let session_id = checkout["sessionId"].as_str().unwrap();
    let verify_uri = format!("/api/v1/checkout/verify/{}", session_id);

    let response = app.request(Method::GET, &verify_uri, None, None).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["outcome"], "PENDING");
    assert_eq!(body["paymentStatus"], "PENDING");
    assert_eq!(app.stock(7).await, 5);

    let snapshot = app.pay(session_id).await;
    let response = app.request(Method::GET, &verify_uri, None, None).await;
    let body = response_json(response).await;
    assert_eq!(body["outcome"], "APPLIED");
    assert_eq!(body["paymentStatus"], "PAID");
    assert_eq!(body["fulfillmentStatus"], "PROCESSING");
    assert_eq!(body["orderId"], checkout["orderId"]);
    assert_eq!(app.stock(7).await, 3);

    // The webhook arriving afterwards is a duplicate
    let response = app.deliver_webhook(&completed_event(&snapshot)).await;
    assert_eq!(response_json(response).await["outcome"], "ALREADY_PROCESSED");
    let response = app.request(Method::GET, &verify_uri, None, None).await;
    assert_eq!(response_json(response).await["outcome"], "ALREADY_PROCESSED");
    assert_eq!(app.stock(7).await, 3);
}

#[tokio::test]
async fn verify_payment_for_unknown_session_is_not_found() {
    let app = TestApp::new().await;
    let response = app
        .request(Method::GET, "/api/v1/checkout/verify/cs_missing", None, None)
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn health_and_metrics_are_public() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;
    app.paid_order(&[(7, 1)]).await;

    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["database"]["status"], "up");

    let response = app.request(Method::GET, "/metrics", None, None).await;
    assert_eq!(response.status(), 200);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("checkouts_created_total"));
    assert!(text.contains("payment_webhook_events_total"));
}
