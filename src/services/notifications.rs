use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::services::payment_processor::signature::compute_signature;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error("notification could not be encoded: {0}")]
    Encoding(String),
}

/// Payload of the customer-facing confirmation sent once an order is paid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_id: Uuid,
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    #[serde(serialize_with = "crate::money::serialize_amount")]
    pub total_amount: Decimal,
    pub currency: String,
}

/// Outbound customer notifications. Failures are reported, never retried by callers.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn order_confirmed(&self, confirmation: &OrderConfirmation)
        -> Result<(), NotificationError>;
}

/// Writes confirmations to the log; used when no delivery endpoint is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl OrderNotifier for LogNotifier {
    async fn order_confirmed(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        info!(
            order_id = %confirmation.order_id,
            order_number = %confirmation.order_number,
            "Order confirmation queued for {}",
            confirmation.customer_email
        );
        Ok(())
    }
}

/// Posts confirmations as JSON to a mail/notification gateway.
///
/// Requests carry `x-timestamp` and, when a secret is configured, an
/// `x-signature` HMAC over `"{timestamp}.{body}"`.
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
    secret: Option<String>,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpNotifier {
    pub fn new(endpoint: String, secret: Option<String>) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            secret,
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    #[instrument(skip(self, body))]
    async fn deliver(&self, body: Vec<u8>) -> Result<(), NotificationError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self
            .secret
            .as_deref()
            .map(|secret| compute_signature(secret, timestamp, &body));

        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .header("x-timestamp", timestamp.to_string())
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header("x-signature", sig.as_str());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Notification delivered to {}", self.endpoint);
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        "Notification delivery failed with status: {} (attempt {}/{})",
                        response.status(),
                        attempt,
                        self.max_retries
                    );
                }
                Err(e) => {
                    warn!(
                        "Notification delivery error: {} (attempt {}/{})",
                        e, attempt, self.max_retries
                    );
                }
            }

            // 1x, 2x, 4x the base backoff
            if attempt < self.max_retries {
                tokio::time::sleep(self.base_backoff * 2_u32.pow(attempt - 1)).await;
            }
        }

        error!("Notification delivery failed after {} attempts", self.max_retries);
        Err(NotificationError::Delivery(format!(
            "gave up after {} attempts",
            self.max_retries
        )))
    }
}

#[async_trait]
impl OrderNotifier for HttpNotifier {
    async fn order_confirmed(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "order.confirmed",
            "data": confirmation,
        }))
        .map_err(|e| NotificationError::Encoding(e.to_string()))?;
        self.deliver(body).await
    }
}

/// Picks the HTTP notifier when an endpoint is configured, the log notifier otherwise
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn OrderNotifier>, NotificationError> {
    match &config.notification_webhook_url {
        Some(url) => Ok(Arc::new(HttpNotifier::new(
            url.clone(),
            config.notification_webhook_secret.clone(),
        )?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
