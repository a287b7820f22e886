use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity},
        order_item,
        payment_transaction::{self, Entity as TransactionEntity},
        FulfillmentStatus, PaymentStatus, TransactionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    services::{
        inventory,
        notifications::OrderConfirmation,
        orders::lock_order,
        payment_processor::{
            verify_webhook_signature, PaymentMetadata, PaymentProcessor, ProcessorEvent,
            EVENT_ASYNC_PAYMENT_FAILED, EVENT_ASYNC_PAYMENT_SUCCEEDED, EVENT_PAYMENT_INTENT_FAILED,
            EVENT_SESSION_COMPLETED, EVENT_SESSION_EXPIRED,
        },
    },
};

/// Result of applying one processor notification to local state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileOutcome {
    /// The payment was recorded and stock decremented by this call
    Applied,
    /// An earlier delivery already recorded the payment
    AlreadyProcessed,
    /// The order's payment attempt was marked failed
    PaymentFailed,
    /// The event type is not one the reconciler acts on
    Ignored,
    /// The processor has not confirmed payment yet
    Pending,
}

impl ReconcileOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadyProcessed => "already_processed",
            Self::PaymentFailed => "payment_failed",
            Self::Ignored => "ignored",
            Self::Pending => "pending",
        }
    }
}

/// Local state returned to the customer-facing verify-payment poll
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub outcome: ReconcileOutcome,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
}

fn record_outcome(outcome: &str) {
    metrics::increment_counter_with("payment_webhook_events_total", &[("outcome", outcome)]);
}

fn malformed(reason: &str) -> ServiceError {
    record_outcome("malformed");
    warn!("Rejecting malformed payment event: {}", reason);
    ServiceError::BadRequest(format!("malformed payment event: {}", reason))
}

fn object_metadata(object: &Value) -> Option<PaymentMetadata> {
    let map: HashMap<String, String> =
        serde_json::from_value(object.get("metadata")?.clone()).ok()?;
    PaymentMetadata::from_map(&map)
}

fn object_str<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

/// Promotes `observed` to PAID. A cancelled order stays cancelled; anything
/// else moves to PROCESSING.
///
/// The update only matches while the row still has the payment and fulfillment
/// status `observed` was read with, so it never overwrites a status change
/// committed in between. Returns `false` when nothing matched.
pub async fn claim_payment<C>(
    conn: &C,
    observed: &order::Model,
    payment_intent: Option<String>,
    now: DateTime<Utc>,
) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let next_fulfillment = match observed.fulfillment_status {
        FulfillmentStatus::Cancelled => FulfillmentStatus::Cancelled,
        _ => FulfillmentStatus::Processing,
    };
    let claimed = OrderEntity::update_many()
        .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
        .col_expr(order::Column::FulfillmentStatus, Expr::value(next_fulfillment))
        .col_expr(order::Column::PaymentIntentId, Expr::value(payment_intent))
        .col_expr(order::Column::PaidAt, Expr::value(now))
        .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(observed.id))
        .filter(order::Column::PaymentStatus.is_in([PaymentStatus::Pending, PaymentStatus::Failed]))
        .filter(order::Column::FulfillmentStatus.eq(observed.fulfillment_status))
        .exec(conn)
        .await?;
    Ok(claimed.rows_affected == 1)
}

/// Applies processor payment results to orders, inventory and transactions.
///
/// Only this service promotes an order from PENDING to PAID. Promotion is a
/// conditional update on the payment status, so any number of deliveries of the
/// same event (webhook or verify-payment poll) apply at most once.
#[derive(Clone)]
pub struct PaymentReconciler {
    db_pool: Arc<DatabaseConnection>,
    processor: Arc<dyn PaymentProcessor>,
    event_sender: EventSender,
    webhook_secret: Option<String>,
    tolerance_secs: u64,
}

impl PaymentReconciler {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        processor: Arc<dyn PaymentProcessor>,
        event_sender: EventSender,
        webhook_secret: Option<String>,
        tolerance_secs: u64,
    ) -> Self {
        Self {
            db_pool,
            processor,
            event_sender,
            webhook_secret,
            tolerance_secs,
        }
    }

    /// Verifies and applies a raw webhook delivery.
    #[instrument(skip(self, headers, payload), fields(bytes = payload.len()))]
    pub async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<ReconcileOutcome, ServiceError> {
        verify_webhook_signature(
            headers,
            payload,
            self.webhook_secret.as_deref(),
            self.tolerance_secs,
            Utc::now().timestamp(),
        )
        .map_err(|e| {
            record_outcome("signature_rejected");
            warn!("Webhook signature rejected: {}", e);
            ServiceError::WebhookSignature(e.to_string())
        })?;

        let event: ProcessorEvent =
            serde_json::from_slice(payload).map_err(|e| malformed(&e.to_string()))?;
        self.handle_event(event).await
    }

    /// Applies an already-verified processor event.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = ?event.id))]
    pub async fn handle_event(&self, event: ProcessorEvent) -> Result<ReconcileOutcome, ServiceError> {
        let object = &event.data.object;
        let outcome = match event.event_type.as_str() {
            EVENT_SESSION_COMPLETED | EVENT_ASYNC_PAYMENT_SUCCEEDED => {
                let metadata =
                    object_metadata(object).ok_or_else(|| malformed("missing order metadata"))?;
                let session_id =
                    object_str(object, "id").ok_or_else(|| malformed("missing session id"))?;
                // Delayed payment methods complete the session before the money arrives
                if object_str(object, "payment_status") == Some("unpaid") {
                    info!(order_id = %metadata.order_id, "Session completed without payment yet");
                    ReconcileOutcome::Ignored
                } else {
                    let payment_intent = object_str(object, "payment_intent").map(str::to_string);
                    self.apply_payment(metadata, Some(session_id), payment_intent)
                        .await?
                }
            }
            EVENT_SESSION_EXPIRED | EVENT_ASYNC_PAYMENT_FAILED | EVENT_PAYMENT_INTENT_FAILED => {
                let metadata =
                    object_metadata(object).ok_or_else(|| malformed("missing order metadata"))?;
                self.mark_failed(metadata).await?
            }
            other => {
                info!("Ignoring payment event of type {}", other);
                ReconcileOutcome::Ignored
            }
        };
        record_outcome(outcome.as_label());
        Ok(outcome)
    }

    /// Polling fallback for delayed webhooks: asks the processor about a session
    /// and applies the payment if it is complete.
    #[instrument(skip(self))]
    pub async fn verify_session(&self, session_id: &str) -> Result<VerifyPaymentResponse, ServiceError> {
        let order = OrderEntity::find()
            .filter(order::Column::CheckoutSessionId.eq(session_id))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No order for checkout session {}", session_id))
            })?;

        let snapshot = self
            .processor
            .retrieve_checkout_session(session_id)
            .await
            .map_err(|e| {
                metrics::increment_counter_with(
                    "payment_processor_errors_total",
                    &[("operation", "retrieve_session")],
                );
                ServiceError::from(e)
            })?;

        let outcome = if snapshot.is_paid() {
            let metadata = match PaymentMetadata::from_map(&snapshot.metadata) {
                Some(metadata) => metadata,
                None => self.metadata_for(&order).await?,
            };
            if metadata.order_id != order.id {
                return Err(ServiceError::IntegrityError(format!(
                    "checkout session {} belongs to order {}, not {}",
                    session_id, metadata.order_id, order.id
                )));
            }
            self.apply_payment(metadata, Some(session_id), snapshot.payment_intent.clone())
                .await?
        } else {
            ReconcileOutcome::Pending
        };

        let current = OrderEntity::find_by_id(order.id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))?;
        Ok(VerifyPaymentResponse {
            order_id: current.id,
            order_number: current.order_number,
            outcome,
            payment_status: current.payment_status,
            fulfillment_status: current.fulfillment_status,
        })
    }

    async fn metadata_for(&self, order: &order::Model) -> Result<PaymentMetadata, ServiceError> {
        let transaction = TransactionEntity::find()
            .filter(payment_transaction::Column::OrderId.eq(order.id))
            .filter(payment_transaction::Column::CheckoutSessionId.eq(order.checkout_session_id.clone()))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| {
                ServiceError::IntegrityError(format!("order {} has no payment transaction", order.id))
            })?;
        Ok(PaymentMetadata {
            order_id: order.id,
            transaction_id: transaction.id,
        })
    }

    /// Locks and loads the order and transaction named by the metadata, failing
    /// loudly when either is unknown: a dropped payment confirmation is a
    /// financial discrepancy. The order row stays locked until `txn` ends, so
    /// admin status changes serialize with the payment.
    async fn load_correlated(
        txn: &DatabaseTransaction,
        metadata: PaymentMetadata,
        session_id: Option<&str>,
    ) -> Result<(order::Model, payment_transaction::Model), ServiceError> {
        let order = match lock_order(txn, metadata.order_id).await {
            Ok(order) => order,
            Err(ServiceError::NotFound(_)) => {
                record_outcome("unknown_order");
                error!(order_id = %metadata.order_id, "Payment event references unknown order");
                return Err(ServiceError::IntegrityError(format!(
                    "payment event references unknown order {}",
                    metadata.order_id
                )));
            }
            Err(err) => return Err(err),
        };

        let transaction = TransactionEntity::find_by_id(metadata.transaction_id)
            .one(txn)
            .await?
            .filter(|t| t.order_id == order.id)
            .ok_or_else(|| {
                record_outcome("unknown_order");
                error!(
                    order_id = %order.id,
                    transaction_id = %metadata.transaction_id,
                    "Payment event references unknown transaction"
                );
                ServiceError::IntegrityError(format!(
                    "payment event references unknown transaction {} for order {}",
                    metadata.transaction_id, order.id
                ))
            })?;

        if let (Some(expected), Some(actual)) = (order.checkout_session_id.as_deref(), session_id) {
            if expected != actual {
                record_outcome("unknown_order");
                error!(order_id = %order.id, expected, actual, "Checkout session mismatch");
                return Err(ServiceError::IntegrityError(format!(
                    "checkout session {} does not belong to order {}",
                    actual, order.id
                )));
            }
        }
        Ok((order, transaction))
    }

    async fn apply_payment(
        &self,
        metadata: PaymentMetadata,
        session_id: Option<&str>,
        payment_intent: Option<String>,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let (order, _transaction) = Self::load_correlated(&txn, metadata, session_id).await?;

        if !order.payment_status.awaiting_payment() {
            info!(order_id = %order.id, payment_status = %order.payment_status, "Payment already recorded");
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let now = Utc::now();
        let cancelled = order.fulfillment_status == FulfillmentStatus::Cancelled;

        // Losing this race to a concurrent delivery means the other delivery
        // owns the stock decrement.
        if !claim_payment(&txn, &order, payment_intent.clone(), now).await? {
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        if cancelled {
            warn!(order_id = %order.id, "Payment received for a cancelled order; stock left untouched");
        } else {
            let items = order_item::Entity::find()
                .filter(order_item::Column::OrderId.eq(order.id))
                .order_by_asc(order_item::Column::ProductId)
                .all(&txn)
                .await?;
            for item in &items {
                if !inventory::try_decrement(&txn, item.product_id, item.quantity).await? {
                    // Dropping the transaction rolls the claim back; the order stays PENDING
                    drop(txn);
                    record_outcome("stock_conflict");
                    metrics::increment_counter("stock_conflicts_total");
                    error!(
                        order_id = %order.id,
                        product_id = item.product_id,
                        quantity = item.quantity,
                        "Paid order cannot be fulfilled: stock exhausted"
                    );
                    self.event_sender.publish(Event::PaymentStockConflict {
                        order_id: order.id,
                        product_id: item.product_id,
                    });
                    return Err(ServiceError::StockConflict {
                        order_id: order.id,
                        product_id: item.product_id,
                    });
                }
            }
        }

        let mut transaction_update = TransactionEntity::update_many()
            .col_expr(
                payment_transaction::Column::Status,
                Expr::value(TransactionStatus::Succeeded),
            )
            .col_expr(
                payment_transaction::Column::PaymentIntentId,
                Expr::value(payment_intent.clone()),
            )
            .col_expr(payment_transaction::Column::UpdatedAt, Expr::value(now));
        if let Some(session_id) = session_id {
            transaction_update = transaction_update.col_expr(
                payment_transaction::Column::CheckoutSessionId,
                Expr::value(session_id.to_string()),
            );
        }
        transaction_update
            .filter(payment_transaction::Column::Id.eq(metadata.transaction_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            payment_intent = ?payment_intent,
            "Payment reconciled"
        );

        self.event_sender.publish(Event::OrderPaid(OrderConfirmation {
            order_id: order.id,
            order_number: order.order_number,
            customer_name: order.customer_name,
            customer_email: order.customer_email,
            total_amount: order.total_amount,
            currency: order.currency,
        }));
        Ok(ReconcileOutcome::Applied)
    }

    async fn mark_failed(&self, metadata: PaymentMetadata) -> Result<ReconcileOutcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let (order, _transaction) = Self::load_correlated(&txn, metadata, None).await?;
        let now = Utc::now();

        let updated = OrderEntity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Failed))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .exec(&txn)
            .await?;
        if updated.rows_affected != 1 {
            return Ok(ReconcileOutcome::Ignored);
        }

        TransactionEntity::update_many()
            .col_expr(
                payment_transaction::Column::Status,
                Expr::value(TransactionStatus::Failed),
            )
            .col_expr(payment_transaction::Column::UpdatedAt, Expr::value(now))
            .filter(payment_transaction::Column::Id.eq(metadata.transaction_id))
            .filter(payment_transaction::Column::Status.eq(TransactionStatus::Pending))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        warn!(order_id = %order.id, "Payment attempt failed");
        self.event_sender
            .publish(Event::PaymentFailed { order_id: order.id });
        Ok(ReconcileOutcome::PaymentFailed)
    }
}
