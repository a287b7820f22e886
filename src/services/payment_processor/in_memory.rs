use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::{
    CheckoutSession, CheckoutSessionRequest, PaymentIntentSnapshot, PaymentProcessor,
    ProcessorError, RefundReceipt, SessionSnapshot,
};

#[derive(Debug, Clone)]
struct SessionRecord {
    request: CheckoutSessionRequest,
    status: String,
    payment_status: String,
    payment_intent: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct IntentRecord {
    amount_received: i64,
    amount_refunded: i64,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, SessionRecord>,
    intents: HashMap<String, IntentRecord>,
    refunds_by_key: HashMap<String, RefundReceipt>,
    session_failure: Option<String>,
    refund_failure: Option<String>,
    refund_latency: Option<Duration>,
}

/// Deterministic local processor for development and tests.
///
/// Sessions start `open`/`unpaid`; [`InMemoryProcessor::complete_session`] plays the
/// part of the customer paying at the hosted page.
#[derive(Debug, Default)]
pub struct InMemoryProcessor {
    state: Mutex<State>,
}

impl InMemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a session paid and captures its full amount on a new payment intent.
    pub async fn complete_session(&self, session_id: &str) -> Result<SessionSnapshot, ProcessorError> {
        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found("checkout session", session_id))?;

        let intent_id = record
            .payment_intent
            .get_or_insert_with(|| format!("pi_{}", Uuid::new_v4().simple()))
            .clone();
        record.status = "complete".to_string();
        record.payment_status = "paid".to_string();
        let amount = record.request.amount_total();
        let snapshot = snapshot(session_id, record);

        state.intents.entry(intent_id).or_insert(IntentRecord {
            amount_received: amount,
            amount_refunded: 0,
        });
        Ok(snapshot)
    }

    pub async fn expire_session(&self, session_id: &str) -> Result<SessionSnapshot, ProcessorError> {
        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found("checkout session", session_id))?;
        record.status = "expired".to_string();
        Ok(snapshot(session_id, record))
    }

    /// Records a refund made outside this service, e.g. from the processor dashboard.
    pub async fn record_external_refund(
        &self,
        payment_intent_id: &str,
        amount: i64,
    ) -> Result<(), ProcessorError> {
        let mut state = self.state.lock().await;
        let intent = state
            .intents
            .get_mut(payment_intent_id)
            .ok_or_else(|| not_found("payment intent", payment_intent_id))?;
        intent.amount_refunded += amount;
        Ok(())
    }

    /// Makes every following session creation fail with `message`.
    pub async fn fail_sessions_with(&self, message: Option<String>) {
        self.state.lock().await.session_failure = message;
    }

    /// Makes every following refund fail with `message`.
    pub async fn fail_refunds_with(&self, message: Option<String>) {
        self.state.lock().await.refund_failure = message;
    }

    /// Makes every following refund call take `latency` before it answers.
    pub async fn delay_refunds_by(&self, latency: Option<Duration>) {
        self.state.lock().await.refund_latency = latency;
    }

    pub async fn session_request(&self, session_id: &str) -> Option<CheckoutSessionRequest> {
        self.state
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|record| record.request.clone())
    }

    pub async fn refunded_amount(&self, payment_intent_id: &str) -> i64 {
        self.state
            .lock()
            .await
            .intents
            .get(payment_intent_id)
            .map(|intent| intent.amount_refunded)
            .unwrap_or(0)
    }
}

fn not_found(kind: &str, id: &str) -> ProcessorError {
    ProcessorError::Api {
        status: 404,
        message: format!("No such {}: '{}'", kind, id),
    }
}

fn snapshot(session_id: &str, record: &SessionRecord) -> SessionSnapshot {
    SessionSnapshot {
        id: session_id.to_string(),
        status: record.status.clone(),
        payment_status: record.payment_status.clone(),
        payment_intent: record.payment_intent.clone(),
        amount_total: Some(record.request.amount_total()),
        metadata: record.request.metadata.to_map(),
    }
}

#[async_trait]
impl PaymentProcessor for InMemoryProcessor {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProcessorError> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.session_failure.clone() {
            return Err(ProcessorError::Api {
                status: 500,
                message,
            });
        }

        let id = format!("cs_{}", Uuid::new_v4().simple());
        let url = format!("https://checkout.local/pay/{}", id);
        state.sessions.insert(
            id.clone(),
            SessionRecord {
                request,
                status: "open".to_string(),
                payment_status: "unpaid".to_string(),
                payment_intent: None,
            },
        );
        info!(session_id = %id, "in-memory checkout session created");
        Ok(CheckoutSession { id, url: Some(url) })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<SessionSnapshot, ProcessorError> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(session_id)
            .map(|record| snapshot(session_id, record))
            .ok_or_else(|| not_found("checkout session", session_id))
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentSnapshot, ProcessorError> {
        let state = self.state.lock().await;
        state
            .intents
            .get(payment_intent_id)
            .map(|intent| PaymentIntentSnapshot {
                amount_received: intent.amount_received,
                amount_refunded: intent.amount_refunded,
            })
            .ok_or_else(|| not_found("payment intent", payment_intent_id))
    }

    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, ProcessorError> {
        let latency = self.state.lock().await.refund_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if let Some(receipt) = state.refunds_by_key.get(idempotency_key) {
            return Ok(receipt.clone());
        }
        if let Some(message) = state.refund_failure.clone() {
            return Err(ProcessorError::Api {
                status: 402,
                message,
            });
        }

        let intent = state
            .intents
            .get_mut(payment_intent_id)
            .ok_or_else(|| not_found("payment intent", payment_intent_id))?;
        if amount > intent.amount_received - intent.amount_refunded {
            return Err(ProcessorError::Api {
                status: 400,
                message: format!(
                    "Refund amount ({}) is greater than unrefunded amount on charge ({})",
                    amount,
                    intent.amount_received - intent.amount_refunded
                ),
            });
        }
        intent.amount_refunded += amount;

        let receipt = RefundReceipt {
            id: format!("re_{}", Uuid::new_v4().simple()),
            status: "succeeded".to_string(),
        };
        state
            .refunds_by_key
            .insert(idempotency_key.to_string(), receipt.clone());
        Ok(receipt)
    }
}
