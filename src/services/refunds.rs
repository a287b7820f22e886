use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity},
        order_note,
        refund::{self, Entity as RefundEntity},
        FulfillmentStatus, PaymentStatus, RefundStatus, RefundType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics, money,
    services::{
        orders::lock_order,
        payment_processor::{PaymentProcessor, RefundReceipt},
    },
};

pub const MIN_REASON_LENGTH: usize = 10;

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateRefundRequest {
    #[schema(value_type = String, example = "20.00")]
    pub amount: Decimal,
    #[validate(length(min = 10, max = 1000, message = "reason must be at least 10 characters"))]
    pub reason: String,
    /// Derived from the amount when omitted
    pub refund_type: Option<RefundType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundView {
    pub id: Uuid,
    pub order_id: Uuid,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String, example = "20.00")]
    pub amount: Decimal,
    pub reason: String,
    pub refund_type: RefundType,
    pub status: RefundStatus,
    pub external_refund_id: Option<String>,
    pub initiated_by: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<refund::Model> for RefundView {
    fn from(model: refund::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            amount: model.amount,
            reason: model.reason,
            refund_type: model.refund_type,
            status: model.status,
            external_refund_id: model.external_refund_id,
            initiated_by: model.initiated_by,
            created_at: model.created_at,
            processed_at: model.processed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub previous_payment_status: PaymentStatus,
    pub new_payment_status: PaymentStatus,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String, example = "20.00")]
    pub total_refunded: Decimal,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String, example = "0.00")]
    pub remaining_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub refund: RefundView,
    pub order_update: OrderUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundHistory {
    pub refunds: Vec<RefundView>,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String)]
    pub total_refunded: Decimal,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String)]
    pub max_refundable: Decimal,
}

/// Refundable balance of one order, computed from its ledger rows.
///
/// Every amount here is already at two decimal places; nothing is rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundBalance {
    pub order_total: Decimal,
    /// Sum of PROCESSING and COMPLETED refunds
    pub already_refunded: Decimal,
}

impl RefundBalance {
    pub fn from_refunds<'a>(
        order_total: Decimal,
        refunds: impl IntoIterator<Item = &'a refund::Model>,
    ) -> Self {
        let already_refunded = refunds
            .into_iter()
            .filter(|r| r.status.counts_against_balance())
            .map(|r| r.amount)
            .sum();
        Self {
            order_total: money::normalize(order_total),
            already_refunded: money::normalize(already_refunded),
        }
    }

    pub fn max_refundable(&self) -> Decimal {
        (self.order_total - self.already_refunded).max(Decimal::ZERO)
    }

    pub fn check(&self, amount: Decimal) -> Result<(), ServiceError> {
        if amount > self.max_refundable() {
            return Err(ServiceError::RefundExceedsBalance {
                requested: amount,
                max_refundable: self.max_refundable(),
            });
        }
        Ok(())
    }

    /// FULL when the amount clears the balance. A declared FULL must do exactly that.
    pub fn resolve_type(
        &self,
        amount: Decimal,
        declared: Option<RefundType>,
    ) -> Result<RefundType, ServiceError> {
        let clears_balance = amount == self.max_refundable();
        match declared {
            Some(RefundType::Full) if !clears_balance => Err(ServiceError::ValidationError(format!(
                "a FULL refund must be exactly the refundable balance of {}",
                money::display(self.max_refundable())
            ))),
            Some(declared) => Ok(declared),
            None if clears_balance => Ok(RefundType::Full),
            None => Ok(RefundType::Partial),
        }
    }

    /// Payment status once `amount` more has actually been refunded
    pub fn status_after(&self, amount: Decimal) -> PaymentStatus {
        if self.already_refunded + amount >= self.order_total {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        }
    }
}

fn rejected(reason: &str) {
    metrics::increment_counter_with("refunds_rejected_total", &[("reason", reason)]);
}

/// Issues refunds against the processor and keeps the local ledger in step.
///
/// The refundable balance is read under the order's row lock (a version bump),
/// and a refund is reserved as a PROCESSING row before any money moves, so
/// concurrent requests always see each other.
#[derive(Clone)]
pub struct RefundService {
    db_pool: Arc<DatabaseConnection>,
    processor: Arc<dyn PaymentProcessor>,
    event_sender: EventSender,
}

impl RefundService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        processor: Arc<dyn PaymentProcessor>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db_pool,
            processor,
            event_sender,
        }
    }

    async fn counted_refunds<C>(conn: &C, order_id: Uuid) -> Result<Vec<refund::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(RefundEntity::find()
            .filter(refund::Column::OrderId.eq(order_id))
            .filter(refund::Column::Status.is_in([RefundStatus::Processing, RefundStatus::Completed]))
            .all(conn)
            .await?)
    }

    #[instrument(skip(self, request), fields(amount = %request.amount))]
    pub async fn create_refund(
        &self,
        order_id: Uuid,
        request: CreateRefundRequest,
        operator: &str,
    ) -> Result<RefundResult, ServiceError> {
        request.validate()?;
        let reason = request.reason.trim().to_string();
        if reason.chars().count() < MIN_REASON_LENGTH {
            return Err(ServiceError::ValidationError(format!(
                "reason must be at least {} characters",
                MIN_REASON_LENGTH
            )));
        }
        let amount = money::parse_amount(request.amount, "amount")?;

        // Once reserved, the refund must complete or release its reservation
        // even when the caller stops waiting.
        let service = self.clone();
        let declared_type = request.refund_type;
        let operator = operator.to_string();
        tokio::spawn(
            async move {
                service
                    .settle(order_id, amount, reason, declared_type, operator)
                    .await
            }
            .in_current_span(),
        )
        .await
        .map_err(|err| ServiceError::InternalError(format!("refund task failed: {}", err)))?
    }

    async fn settle(
        &self,
        order_id: Uuid,
        amount: Decimal,
        reason: String,
        declared_type: Option<RefundType>,
        operator: String,
    ) -> Result<RefundResult, ServiceError> {
        let operator = operator.as_str();
        let (order, refund_type, reservation) =
            self.reserve(order_id, amount, &reason, declared_type, operator).await?;
        let payment_intent_id = order.payment_intent_id.clone().unwrap_or_default();

        let receipt = match self
            .issue_at_processor(&payment_intent_id, amount, reservation.id)
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                // No money moved, so no refund row may survive
                if let Err(db_err) = RefundEntity::delete_by_id(reservation.id)
                    .exec(&*self.db_pool)
                    .await
                {
                    error!(refund_id = %reservation.id, "Failed to release refund reservation: {}", db_err);
                }
                warn!(%order_id, %amount, "Refund not issued: {}", err);
                return Err(err);
            }
        };

        let result = self
            .complete(order_id, reservation, refund_type, &receipt, operator)
            .await
            .map_err(|err| {
                error!(
                    %order_id,
                    external_refund_id = %receipt.id,
                    "Refund issued at processor but not recorded; reservation left PROCESSING: {}",
                    err
                );
                err
            })?;

        metrics::increment_counter("refunds_completed_total");
        self.event_sender.publish(Event::RefundCompleted {
            order_id,
            refund_id: result.refund.id,
            amount,
            payment_status: result.order_update.new_payment_status,
        });
        Ok(result)
    }

    async fn reserve(
        &self,
        order_id: Uuid,
        amount: Decimal,
        reason: &str,
        declared_type: Option<RefundType>,
        operator: &str,
    ) -> Result<(order::Model, RefundType, refund::Model), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, order_id).await?;

        if !order.payment_status.is_refundable() {
            rejected("not_paid");
            return Err(ServiceError::InvalidOperation(format!(
                "order payment status {} is not refundable",
                order.payment_status
            )));
        }
        if order.fulfillment_status == FulfillmentStatus::Cancelled {
            rejected("cancelled");
            return Err(ServiceError::InvalidOperation(
                "cancelled orders cannot be refunded".to_string(),
            ));
        }
        if order.payment_intent_id.is_none() {
            rejected("no_payment_reference");
            return Err(ServiceError::IntegrityError(format!(
                "order {} is paid but has no payment reference",
                order_id
            )));
        }

        let refunds = Self::counted_refunds(&txn, order_id).await?;
        let balance = RefundBalance::from_refunds(order.total_amount, &refunds);
        if let Err(err) = balance.check(amount) {
            rejected("exceeds_balance");
            warn!(
                %order_id,
                %amount,
                max_refundable = %balance.max_refundable(),
                "Refund exceeds refundable balance"
            );
            return Err(err);
        }
        let refund_type = balance.resolve_type(amount, declared_type)?;

        let reservation = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            amount: Set(amount),
            reason: Set(reason.to_string()),
            refund_type: Set(refund_type),
            status: Set(RefundStatus::Processing),
            external_refund_id: Set(None),
            initiated_by: Set(operator.to_string()),
            created_at: Set(Utc::now()),
            processed_at: Set(None),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        Ok((order, refund_type, reservation))
    }

    /// The processor is authoritative for money: its own unrefunded capture must
    /// cover the amount, whatever the local ledger says.
    async fn issue_at_processor(
        &self,
        payment_intent_id: &str,
        amount: Decimal,
        refund_id: Uuid,
    ) -> Result<RefundReceipt, ServiceError> {
        let intent = self
            .processor
            .retrieve_payment_intent(payment_intent_id)
            .await
            .map_err(|e| {
                metrics::increment_counter_with(
                    "payment_processor_errors_total",
                    &[("operation", "retrieve_payment_intent")],
                );
                ServiceError::from(e)
            })?;

        let available_at_processor = money::from_minor_units(intent.available_to_refund());
        if amount > available_at_processor {
            rejected("exceeds_processor_balance");
            return Err(ServiceError::ProcessorBalanceExceeded {
                requested: amount,
                available_at_processor,
            });
        }

        self.processor
            .create_refund(
                payment_intent_id,
                money::to_minor_units(amount)?,
                &refund_id.to_string(),
            )
            .await
            .map_err(|e| {
                metrics::increment_counter_with(
                    "payment_processor_errors_total",
                    &[("operation", "create_refund")],
                );
                ServiceError::from(e)
            })
    }

    async fn complete(
        &self,
        order_id: Uuid,
        reservation: refund::Model,
        refund_type: RefundType,
        receipt: &RefundReceipt,
        operator: &str,
    ) -> Result<RefundResult, ServiceError> {
        let now = Utc::now();
        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, order_id).await?;

        let completed: Vec<refund::Model> = Self::counted_refunds(&txn, order_id)
            .await?
            .into_iter()
            .filter(|r| r.status == RefundStatus::Completed)
            .collect();
        let settled = RefundBalance::from_refunds(order.total_amount, &completed);
        let new_status = settled.status_after(reservation.amount);

        let mut active: refund::ActiveModel = reservation.clone().into();
        active.status = Set(RefundStatus::Completed);
        active.external_refund_id = Set(Some(receipt.id.clone()));
        active.processed_at = Set(Some(now));
        let refund = active.update(&txn).await?;

        OrderEntity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .exec(&txn)
            .await?;

        order_note::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            author: Set(operator.to_string()),
            body: Set(format!(
                "{} refund of {} issued (processor ref {}): {}",
                match refund_type {
                    RefundType::Full => "Full",
                    RefundType::Partial => "Partial",
                },
                money::display(refund.amount),
                receipt.id,
                refund.reason
            )),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let outstanding = RefundBalance::from_refunds(
            order.total_amount,
            &Self::counted_refunds(&txn, order_id).await?,
        );
        txn.commit().await?;

        info!(
            %order_id,
            refund_id = %refund.id,
            amount = %refund.amount,
            previous = %order.payment_status,
            new = %new_status,
            "Refund completed"
        );

        Ok(RefundResult {
            refund: RefundView::from(refund),
            order_update: OrderUpdate {
                previous_payment_status: order.payment_status,
                new_payment_status: new_status,
                total_refunded: settled.already_refunded + reservation.amount,
                remaining_amount: outstanding.max_refundable(),
            },
        })
    }

    #[instrument(skip(self))]
    pub async fn list_refunds(&self, order_id: Uuid) -> Result<RefundHistory, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let refunds = RefundEntity::find()
            .filter(refund::Column::OrderId.eq(order_id))
            .order_by_asc(refund::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?;

        let balance = RefundBalance::from_refunds(order.total_amount, &refunds);
        let total_refunded = money::normalize(
            refunds
                .iter()
                .filter(|r| r.status == RefundStatus::Completed)
                .map(|r| r.amount)
                .sum(),
        );
        Ok(RefundHistory {
            refunds: refunds.into_iter().map(RefundView::from).collect(),
            total_refunded,
            max_refundable: balance.max_refundable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn refund_row(amount: Decimal, status: RefundStatus) -> refund::Model {
        refund::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::nil(),
            amount,
            reason: "customer changed mind".into(),
            refund_type: RefundType::Partial,
            status,
            external_refund_id: None,
            initiated_by: "admin".into(),
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn failed_and_cancelled_refunds_do_not_count() {
        let rows = vec![
            refund_row(dec!(10.00), RefundStatus::Completed),
            refund_row(dec!(5.00), RefundStatus::Processing),
            refund_row(dec!(30.00), RefundStatus::Failed),
            refund_row(dec!(30.00), RefundStatus::Cancelled),
        ];
        let balance = RefundBalance::from_refunds(dec!(100.00), &rows);
        assert_eq!(balance.already_refunded, dec!(15.00));
        assert_eq!(balance.max_refundable(), dec!(85.00));
    }

    #[test]
    fn forty_then_sixty_one_is_rejected_with_ceiling() {
        let balance = RefundBalance::from_refunds(
            dec!(100.00),
            &[refund_row(dec!(40.00), RefundStatus::Completed)],
        );
        assert_eq!(balance.status_after(dec!(0)), PaymentStatus::PartiallyRefunded);
        assert_matches!(
            balance.check(dec!(61.00)),
            Err(ServiceError::RefundExceedsBalance { max_refundable, .. }) if max_refundable == dec!(60.00)
        );
        assert!(balance.check(dec!(60.00)).is_ok());
        assert_eq!(balance.status_after(dec!(60.00)), PaymentStatus::Refunded);
    }

    #[test]
    fn refund_type_is_derived_and_full_must_clear_balance() {
        let balance = RefundBalance::from_refunds(dec!(20.00), std::iter::empty());
        assert_eq!(balance.resolve_type(dec!(20.00), None).unwrap(), RefundType::Full);
        assert_eq!(balance.resolve_type(dec!(5.00), None).unwrap(), RefundType::Partial);
        assert_eq!(
            balance.resolve_type(dec!(20.00), Some(RefundType::Partial)).unwrap(),
            RefundType::Partial
        );
        let err = balance
            .resolve_type(dec!(5.00), Some(RefundType::Full))
            .unwrap_err();
        assert!(err.to_string().contains("20.00"));
    }

    fn cents() -> impl Strategy<Value = Decimal> {
        (1i64..=20_000).prop_map(money::from_minor_units)
    }

    proptest! {
        #[test]
        fn accepted_refunds_never_exceed_order_total(
            total in cents(),
            requests in proptest::collection::vec(cents(), 1..20),
        ) {
            let mut ledger: Vec<refund::Model> = Vec::new();
            for amount in requests {
                let balance = RefundBalance::from_refunds(total, &ledger);
                match balance.check(amount) {
                    Ok(()) => ledger.push(refund_row(amount, RefundStatus::Completed)),
                    Err(ServiceError::RefundExceedsBalance { max_refundable, .. }) => {
                        prop_assert_eq!(max_refundable, total - balance.already_refunded);
                        prop_assert!(amount > max_refundable);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {}", other),
                }
                let refunded: Decimal = ledger.iter().map(|r| r.amount).sum();
                prop_assert!(refunded <= total);
            }
        }

        #[test]
        fn status_is_refunded_exactly_when_balance_is_cleared(
            total in cents(),
            refunded_cents in 0i64..=20_000,
        ) {
            let refunded = money::from_minor_units(refunded_cents).min(total);
            let balance = RefundBalance::from_refunds(
                total,
                &[refund_row(refunded, RefundStatus::Completed)],
            );
            let remaining = balance.max_refundable();
            prop_assert_eq!(balance.status_after(remaining), PaymentStatus::Refunded);
            if remaining > dec!(0.01) {
                prop_assert_eq!(
                    balance.status_after(remaining - dec!(0.01)),
                    PaymentStatus::PartiallyRefunded
                );
            }
        }
    }
}
