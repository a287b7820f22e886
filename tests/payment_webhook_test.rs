//! Integration tests for the payment webhook reconciler.
//!
//! Tests cover:
//! - Signature verification
//! - At-most-once application under redelivery and concurrent delivery
//! - Failure events and late successes
//! - Payments racing an admin cancel
//! - Correlation errors and malformed payloads

mod common;

use std::collections::HashMap;

use axum::http::Method;
use chrono::Utc;
use common::{completed_event, response_json, session_event, TestApp, WEBHOOK_SECRET};
use futures::future::join_all;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use storefront_api::{
    entities::{payment_transaction, FulfillmentStatus, PaymentStatus, TransactionStatus},
    events::Event,
    services::{
        payment_processor::{
            signature::{compute_signature, signature_header},
            SessionSnapshot,
        },
        reconciliation::claim_payment,
    },
};
use uuid::Uuid;

fn order_id_of(snapshot: &SessionSnapshot) -> Uuid {
    snapshot.metadata["order_id"].parse().unwrap()
}

#[tokio::test]
async fn completed_session_marks_order_paid_and_decrements_stock() {
    let mut app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;

    let response = app.deliver_webhook(&completed_event(&snapshot)).await;
    assert_eq!(response.status(), 200);
    let ack = response_json(response).await;
    assert_eq!(ack["received"], true);
    assert_eq!(ack["outcome"], "APPLIED");

    let order = app.order(order_id_of(&snapshot)).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Processing);
    assert_eq!(order.payment_intent_id, snapshot.payment_intent);
    assert!(order.paid_at.is_some());
    assert_eq!(app.stock(7).await, 3);

    let transaction = payment_transaction::Entity::find()
        .filter(payment_transaction::Column::OrderId.eq(order.id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.status, TransactionStatus::Succeeded);
    assert_eq!(transaction.payment_intent_id, snapshot.payment_intent);

    let events = app.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::OrderPaid(c) if c.order_id == order.id && c.total_amount == dec!(20.00))));
}

#[tokio::test]
async fn redelivered_events_apply_exactly_once() {
    let mut app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;
    let event = completed_event(&snapshot);

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        let response = app.deliver_webhook(&event).await;
        assert_eq!(response.status(), 200);
        outcomes.push(response_json(response).await["outcome"].clone());
    }

    assert_eq!(outcomes[0], "APPLIED");
    assert!(outcomes[1..].iter().all(|o| o == "ALREADY_PROCESSED"));
    assert_eq!(app.stock(7).await, 3);

    let confirmations = app
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Event::OrderPaid(_)))
        .count();
    assert_eq!(confirmations, 1);
}

#[tokio::test]
async fn concurrent_deliveries_decrement_stock_once() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;
    let event = completed_event(&snapshot);

    let responses = join_all((0..8).map(|_| app.deliver_webhook(&event))).await;
    let mut applied = 0;
    for response in responses {
        assert_eq!(response.status(), 200);
        if response_json(response).await["outcome"] == "APPLIED" {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(app.stock(7).await, 3);
}

#[tokio::test]
async fn bad_or_missing_signatures_are_rejected_without_side_effects() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;
    let payload = serde_json::to_vec(&completed_event(&snapshot)).unwrap();
    let now = Utc::now().timestamp();

    let wrong_secret = signature_header("whsec_wrong", now, &payload);
    let stale = signature_header(WEBHOOK_SECRET, now - 3_600, &payload);
    for signature in [Some(wrong_secret), Some(stale), None] {
        let response = app.deliver_raw_webhook(payload.clone(), signature).await;
        assert_eq!(response.status(), 401);
    }

    // A valid signature over a different body does not carry over
    let other_body = b"{\"type\":\"checkout.session.completed\"}".to_vec();
    let response = app
        .deliver_raw_webhook(
            payload.clone(),
            Some(format!("t={},v1={}", now, compute_signature(WEBHOOK_SECRET, now, &other_body))),
        )
        .await;
    assert_eq!(response.status(), 401);

    let order = app.order(order_id_of(&snapshot)).await;
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(app.stock(7).await, 5);
}

#[tokio::test]
async fn malformed_payloads_are_bad_requests() {
    let app = TestApp::new().await;

    let response = app.deliver_webhook(&json!({ "not": "an event" })).await;
    assert_eq!(response.status(), 400);

    let response = app
        .deliver_webhook(&json!({
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_123", "payment_status": "paid", "metadata": {} } }
        }))
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("malformed"));
}

#[tokio::test]
async fn events_for_unknown_orders_are_integrity_errors() {
    let app = TestApp::new().await;
    let snapshot = SessionSnapshot {
        id: "cs_unknown".into(),
        status: "complete".into(),
        payment_status: "paid".into(),
        payment_intent: Some("pi_unknown".into()),
        amount_total: Some(1000),
        metadata: HashMap::from([
            ("order_id".to_string(), Uuid::new_v4().to_string()),
            ("transaction_id".to_string(), Uuid::new_v4().to_string()),
        ]),
    };

    let response = app.deliver_webhook(&completed_event(&snapshot)).await;
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn session_from_another_order_is_refused() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let first = app.checkout(&[(7, 1)]).await;
    let second = app.checkout(&[(7, 1)]).await;
    let paid_second = app.pay(second["sessionId"].as_str().unwrap()).await;

    // Metadata of the first order paired with the second order's session
    let first_session = app
        .processor
        .session_request(first["sessionId"].as_str().unwrap())
        .await
        .unwrap();
    let mut forged = paid_second.clone();
    forged.metadata = first_session.metadata.to_map();

    let response = app.deliver_webhook(&completed_event(&forged)).await;
    assert_eq!(response.status(), 422);
    assert_eq!(app.stock(7).await, 5);
}

#[tokio::test]
async fn failure_events_mark_payment_failed_and_a_later_success_still_applies() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let session_id = checkout["sessionId"].as_str().unwrap();
    let open = app.session(session_id).await;

    let response = app
        .deliver_webhook(&session_event("checkout.session.async_payment_failed", &open))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["outcome"], "PAYMENT_FAILED");

    let order = app.order(order_id_of(&open)).await;
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(app.stock(7).await, 5);

    // Repeating the failure changes nothing
    let response = app
        .deliver_webhook(&session_event("checkout.session.expired", &open))
        .await;
    assert_eq!(response_json(response).await["outcome"], "IGNORED");

    let paid = app.pay(session_id).await;
    let response = app
        .deliver_webhook(&session_event("checkout.session.async_payment_succeeded", &paid))
        .await;
    assert_eq!(response_json(response).await["outcome"], "APPLIED");
    assert_eq!(app.order(order.id).await.payment_status, PaymentStatus::Paid);
    assert_eq!(app.stock(7).await, 3);
}

#[tokio::test]
async fn failure_after_payment_is_ignored() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let (order_id, snapshot) = app.paid_order(&[(7, 1)]).await;
    let response = app
        .deliver_webhook(&session_event("checkout.session.expired", &snapshot))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["outcome"], "IGNORED");
    assert_eq!(app.order(order_id).await.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn unpaid_completion_and_unrelated_events_are_ignored() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 1)]).await;
    let open = app.session(checkout["sessionId"].as_str().unwrap()).await;

    let response = app
        .deliver_webhook(&session_event("checkout.session.completed", &open))
        .await;
    assert_eq!(response_json(response).await["outcome"], "IGNORED");

    let response = app
        .deliver_webhook(&json!({
            "id": "evt_other",
            "type": "customer.created",
            "data": { "object": { "id": "cus_1" } }
        }))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["outcome"], "IGNORED");
    assert_eq!(app.order(order_id_of(&open)).await.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn payment_for_cancelled_order_is_recorded_without_touching_stock() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let order_id = checkout["orderId"].as_str().unwrap();
    let response = app
        .request_authenticated(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_id),
            Some(json!({ "reason": "customer changed their mind" })),
        )
        .await;
    assert_eq!(response.status(), 200);

    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;
    let response = app.deliver_webhook(&completed_event(&snapshot)).await;
    assert_eq!(response_json(response).await["outcome"], "APPLIED");

    let order = app.order(order_id.parse().unwrap()).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Cancelled);
    assert_eq!(app.stock(7).await, 5);
}

#[tokio::test]
async fn payment_claim_does_not_overwrite_a_cancel_committed_after_the_read() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let order_id: Uuid = checkout["orderId"].as_str().unwrap().parse().unwrap();
    let observed = app.order(order_id).await;
    assert_eq!(observed.fulfillment_status, FulfillmentStatus::Pending);

    let response = app
        .request_authenticated(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_id),
            Some(json!({ "reason": "customer changed their mind" })),
        )
        .await;
    assert_eq!(response.status(), 200);

    let claimed = claim_payment(&*app.state.db, &observed, Some("pi_observed".to_string()), Utc::now())
        .await
        .unwrap();
    assert!(!claimed);

    let order = app.order(order_id).await;
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(app.stock(7).await, 5);

    // The real delivery re-reads the cancelled order and records the payment.
    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;
    let response = app.deliver_webhook(&completed_event(&snapshot)).await;
    assert_eq!(response_json(response).await["outcome"], "APPLIED");

    let order = app.order(order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Cancelled);
    assert_eq!(app.stock(7).await, 5);
}

#[tokio::test]
async fn cancel_racing_a_payment_always_ends_cancelled() {
    let app = TestApp::new().await;
    app.seed_product(7, dec!(10.00), 5).await;

    let checkout = app.checkout(&[(7, 2)]).await;
    let order_id: Uuid = checkout["orderId"].as_str().unwrap().parse().unwrap();
    let snapshot = app.pay(checkout["sessionId"].as_str().unwrap()).await;
    let event = completed_event(&snapshot);
    let cancel_uri = format!("/api/v1/orders/{}/cancel", order_id);

    let (webhook, cancel) = tokio::join!(
        app.deliver_webhook(&event),
        app.request_authenticated(
            Method::POST,
            &cancel_uri,
            Some(json!({ "reason": "customer changed their mind" })),
        ),
    );
    assert_eq!(webhook.status(), 200);
    assert_eq!(cancel.status(), 200);

    let order = app.order(order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Cancelled);
    // 5 when the cancel landed first, 3 when the payment did.
    assert!(matches!(app.stock(7).await, 3 | 5));
}
