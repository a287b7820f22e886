#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::Claims,
    config::AppConfig,
    db,
    entities::{order, product},
    events::{self, Event},
    services::payment_processor::{
        signature::signature_header, InMemoryProcessor, PaymentProcessor, SessionSnapshot,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_the_storefront_admin_api_32chars";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Application harness backed by an in-memory SQLite database and the in-memory processor.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub processor: Arc<InMemoryProcessor>,
    /// Domain events published by the services, for assertions
    pub events: mpsc::Receiver<Event>,
    token: String,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        // One connection keeps the in-memory database alive and shared
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let processor = Arc::new(InMemoryProcessor::new());
        let (event_sender, event_rx) = events::channel(1024);
        let state = AppState::new(Arc::new(pool), cfg, processor.clone(), event_sender);
        let router = storefront_api::app(state.clone());

        Self {
            router,
            state,
            processor,
            events: event_rx,
            token: admin_token("ops@example.com"),
        }
    }

    /// Bearer token for the default admin operator.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Convenience helper for authenticated JSON requests.
    pub async fn request_authenticated(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        self.request(method, uri, body, Some(self.token())).await
    }

    /// Delivers a webhook body signed with the configured secret.
    pub async fn deliver_webhook(&self, event: &Value) -> Response {
        let payload = serde_json::to_vec(event).expect("serialize webhook event");
        let header = signature_header(WEBHOOK_SECRET, Utc::now().timestamp(), &payload);
        self.deliver_raw_webhook(payload, Some(header)).await
    }

    pub async fn deliver_raw_webhook(&self, payload: Vec<u8>, signature: Option<String>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        let request = builder
            .body(Body::from(payload))
            .expect("failed to build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    pub async fn seed_product(&self, id: i32, price: Decimal, stock: i32) -> product::Model {
        self.seed_product_with(id, &format!("Product {}", id), price, stock, true)
            .await
    }

    pub async fn seed_product_with(
        &self,
        id: i32,
        name: &str,
        price: Decimal,
        stock: i32,
        is_active: bool,
    ) -> product::Model {
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            image_url: Set(None),
            is_active: Set(is_active),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product for tests")
    }

    pub async fn set_price(&self, id: i32, price: Decimal) {
        let mut active: product::ActiveModel = self.product(id).await.into();
        active.price = Set(price);
        active
            .update(&*self.state.db)
            .await
            .expect("update product price");
    }

    pub async fn product(&self, id: i32) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn stock(&self, id: i32) -> i32 {
        self.product(id).await.stock
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    /// Runs a checkout for `lines` of `(product_id, quantity)` and returns the response body.
    pub async fn checkout(&self, lines: &[(i32, i32)]) -> Value {
        let response = self
            .request(Method::POST, "/api/v1/checkout", Some(checkout_body(lines)), None)
            .await;
        assert_eq!(response.status(), 201, "checkout should succeed");
        response_json(response).await
    }

    /// Simulates the customer paying at the hosted page and returns the
    /// processor's view of the session.
    pub async fn pay(&self, session_id: &str) -> SessionSnapshot {
        self.processor
            .complete_session(session_id)
            .await
            .expect("complete checkout session")
    }

    /// Current processor view of a session, paid or not.
    pub async fn session(&self, session_id: &str) -> SessionSnapshot {
        self.processor
            .retrieve_checkout_session(session_id)
            .await
            .expect("retrieve checkout session")
    }

    /// Checkout, payment and webhook delivery in one step; returns the order id.
    pub async fn paid_order(&self, lines: &[(i32, i32)]) -> (Uuid, SessionSnapshot) {
        let checkout = self.checkout(lines).await;
        let session_id = checkout["sessionId"].as_str().expect("session id");
        let snapshot = self.pay(session_id).await;
        let response = self.deliver_webhook(&completed_event(&snapshot)).await;
        assert_eq!(response.status(), 200, "payment webhook should apply");
        let order_id = checkout["orderId"]
            .as_str()
            .and_then(|id| id.parse().ok())
            .expect("order id");
        (order_id, snapshot)
    }

    /// Drains the domain events published so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

pub fn admin_token(email: &str) -> String {
    token_with_role(email, "admin")
}

pub fn token_with_role(email: &str, role: &str) -> String {
    let claims = Claims {
        sub: Uuid::new_v4().to_string(),
        email: Some(email.to_string()),
        role: Some(role.to_string()),
        roles: Vec::new(),
        exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("encode access token")
}

pub fn checkout_body(lines: &[(i32, i32)]) -> Value {
    let cart: Vec<Value> = lines
        .iter()
        .map(|(product_id, quantity)| json!({ "productId": product_id, "quantity": quantity }))
        .collect();
    json!({
        "cart": cart,
        "deliveryInfo": {
            "fullName": "Ada Lovelace",
            "email": "ada@example.com",
            "phone": "+1 555 0100",
            "address": "12 Analytical Way",
            "city": "London",
            "state": "LDN",
            "zipCode": "NW1 6XE",
            "country": "GB"
        }
    })
}

/// `checkout.session.completed` event for a session as the processor reports it.
pub fn completed_event(snapshot: &SessionSnapshot) -> Value {
    session_event("checkout.session.completed", snapshot)
}

pub fn session_event(event_type: &str, snapshot: &SessionSnapshot) -> Value {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": {
            "object": {
                "id": snapshot.id,
                "status": snapshot.status,
                "payment_status": snapshot.payment_status,
                "payment_intent": snapshot.payment_intent,
                "amount_total": snapshot.amount_total,
                "metadata": snapshot.metadata,
            }
        }
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
