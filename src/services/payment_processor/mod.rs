//! Port to the external payment processor.
//!
//! The processor is authoritative for money movement. Everything that crosses this
//! boundary is in integer minor units; conversion to `Decimal` happens in
//! [`crate::money`].

pub mod in_memory;
pub mod signature;
pub mod stripe;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AppConfig;

pub use in_memory::InMemoryProcessor;
pub use signature::{verify_webhook_signature, SignatureError};
pub use stripe::StripeProcessor;

pub const METADATA_ORDER_ID: &str = "order_id";
pub const METADATA_TRANSACTION_ID: &str = "transaction_id";

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The processor answered with an error; `message` is its own text.
    #[error("{message} (status {status})")]
    Api { status: u16, message: String },
    #[error("payment processor unreachable: {0}")]
    Transport(String),
    #[error("unexpected payment processor response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProcessorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProcessorError::Decode(err.to_string())
        } else {
            ProcessorError::Transport(err.to_string())
        }
    }
}

/// Correlation data attached to a checkout session and echoed back in events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentMetadata {
    pub order_id: Uuid,
    pub transaction_id: Uuid,
}

impl PaymentMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (METADATA_ORDER_ID.to_string(), self.order_id.to_string()),
            (
                METADATA_TRANSACTION_ID.to_string(),
                self.transaction_id.to_string(),
            ),
        ])
    }

    /// Returns `None` unless both ids are present and well formed.
    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        let order_id = map.get(METADATA_ORDER_ID)?.parse().ok()?;
        let transaction_id = map.get(METADATA_TRANSACTION_ID)?.parse().ok()?;
        Some(Self {
            order_id,
            transaction_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutLineItem {
    pub name: String,
    pub image_url: Option<String>,
    /// Unit price in minor units
    pub unit_amount: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub line_items: Vec<CheckoutLineItem>,
    pub currency: String,
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: PaymentMetadata,
}

impl CheckoutSessionRequest {
    pub fn amount_total(&self) -> i64 {
        self.line_items
            .iter()
            .map(|item| item.unit_amount * i64::from(item.quantity))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// Hosted payment page the customer is redirected to
    pub url: Option<String>,
}

/// Processor-side view of a checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    /// `open`, `complete` or `expired`
    pub status: String,
    /// `unpaid`, `paid` or `no_payment_required`
    pub payment_status: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SessionSnapshot {
    pub fn is_paid(&self) -> bool {
        self.status == "complete" && self.payment_status == "paid"
    }
}

/// Captured and refunded totals for a payment intent, in minor units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentIntentSnapshot {
    pub amount_received: i64,
    pub amount_refunded: i64,
}

impl PaymentIntentSnapshot {
    pub fn available_to_refund(&self) -> i64 {
        (self.amount_received - self.amount_refunded).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProcessorError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<SessionSnapshot, ProcessorError>;

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentSnapshot, ProcessorError>;

    /// Refunds `amount` minor units. Repeating a call with the same
    /// `idempotency_key` must not move money twice.
    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, ProcessorError>;
}

/// Envelope of an asynchronous processor event
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ProcessorEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorEventData {
    pub object: serde_json::Value,
}

pub const EVENT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const EVENT_SESSION_EXPIRED: &str = "checkout.session.expired";
pub const EVENT_ASYNC_PAYMENT_FAILED: &str = "checkout.session.async_payment_failed";
pub const EVENT_PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";

/// Builds the processor selected in configuration
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn PaymentProcessor>, ProcessorError> {
    match config.payment_processor.as_str() {
        "stripe" => {
            let api_key = config.payment_processor_api_key.clone().ok_or_else(|| {
                ProcessorError::Transport("payment processor API key not configured".into())
            })?;
            Ok(Arc::new(StripeProcessor::new(
                config.payment_processor_base_url.clone(),
                api_key,
                config.payment_processor_timeout(),
            )?))
        }
        _ => Ok(Arc::new(InMemoryProcessor::new())),
    }
}
