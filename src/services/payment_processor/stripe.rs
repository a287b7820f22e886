use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    CheckoutSession, CheckoutSessionRequest, PaymentIntentSnapshot, PaymentProcessor,
    ProcessorError, RefundReceipt, SessionSnapshot,
};

/// Stripe-compatible REST client (form-encoded requests, bearer key auth).
#[derive(Clone)]
pub struct StripeProcessor {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentBody {
    amount_received: i64,
    #[serde(default)]
    latest_charge: Option<ChargeBody>,
}

#[derive(Debug, Deserialize)]
struct ChargeBody {
    #[serde(default)]
    amount_refunded: i64,
}

impl StripeProcessor {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Result<Self, ProcessorError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.api_key)
    }

    async fn into_error(response: Response) -> ProcessorError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|body| body.error.message)
            .unwrap_or(text);
        warn!(status, %message, "payment processor rejected request");
        ProcessorError::Api { status, message }
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<T, ProcessorError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self.authorized(request).send().await?;
        if !response.status().is_success() {
            return Err(Self::into_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ProcessorError::Decode(e.to_string()))
    }

    fn session_form(request: &CheckoutSessionRequest) -> Vec<(String, String)> {
        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            ("customer_email".to_string(), request.customer_email.clone()),
        ];
        for (index, item) in request.line_items.iter().enumerate() {
            let prefix = format!("line_items[{}]", index);
            form.push((
                format!("{}[price_data][currency]", prefix),
                request.currency.clone(),
            ));
            form.push((
                format!("{}[price_data][unit_amount]", prefix),
                item.unit_amount.to_string(),
            ));
            form.push((
                format!("{}[price_data][product_data][name]", prefix),
                item.name.clone(),
            ));
            if let Some(image) = &item.image_url {
                form.push((
                    format!("{}[price_data][product_data][images][0]", prefix),
                    image.clone(),
                ));
            }
            form.push((format!("{}[quantity]", prefix), item.quantity.to_string()));
        }
        for (key, value) in request.metadata.to_map() {
            form.push((format!("metadata[{}]", key), value.clone()));
            form.push((format!("payment_intent_data[metadata][{}]", key), value));
        }
        form
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    #[instrument(skip(self, request), fields(order_id = %request.metadata.order_id))]
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProcessorError> {
        let form = Self::session_form(&request);
        let session: CheckoutSession = self
            .send(self.client.post(self.url("/v1/checkout/sessions")).form(&form))
            .await?;
        debug!(session_id = %session.id, "checkout session created");
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<SessionSnapshot, ProcessorError> {
        self.send(
            self.client
                .get(self.url(&format!("/v1/checkout/sessions/{}", session_id))),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentSnapshot, ProcessorError> {
        let body: PaymentIntentBody = self
            .send(
                self.client
                    .get(self.url(&format!("/v1/payment_intents/{}", payment_intent_id)))
                    .query(&[("expand[]", "latest_charge")]),
            )
            .await?;
        Ok(PaymentIntentSnapshot {
            amount_received: body.amount_received,
            amount_refunded: body
                .latest_charge
                .map(|charge| charge.amount_refunded)
                .unwrap_or(0),
        })
    }

    #[instrument(skip(self))]
    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, ProcessorError> {
        let form = [
            ("payment_intent", payment_intent_id.to_string()),
            ("amount", amount.to_string()),
        ];
        let receipt: RefundReceipt = self
            .send(
                self.client
                    .post(self.url("/v1/refunds"))
                    .header("Idempotency-Key", idempotency_key)
                    .form(&form),
            )
            .await?;

        if matches!(receipt.status.as_str(), "failed" | "canceled") {
            return Err(ProcessorError::Api {
                status: 402,
                message: format!("refund {} {}", receipt.id, receipt.status),
            });
        }
        Ok(receipt)
    }
}
