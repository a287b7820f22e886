use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        address,
        order::{self, Entity as OrderEntity},
        order_item, order_note, refund, FulfillmentStatus, PaymentStatus, RefundStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money,
    services::refunds::{RefundBalance, RefundView},
};

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderRequest {
    pub status: Option<FulfillmentStatus>,
    #[validate(length(min = 1, max = 100))]
    pub tracking_number: Option<String>,
    #[validate(length(min = 1, max = 2000))]
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate, ToSchema)]
pub struct CancelOrderRequest {
    #[validate(length(min = 1, max = 2000))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct AppendNoteRequest {
    #[validate(length(min = 1, max = 2000))]
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressView {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
    pub special_instructions: Option<String>,
}

impl From<address::Model> for AddressView {
    fn from(model: address::Model) -> Self {
        Self {
            full_name: model.full_name,
            email: model.email,
            phone: model.phone,
            address: model.address_line,
            city: model.city,
            state: model.state,
            zip_code: model.zip_code,
            country: model.country,
            special_instructions: model.special_instructions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub product_id: i32,
    pub product_name: String,
    pub product_image: Option<String>,
    pub quantity: i32,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String, example = "10.00")]
    pub unit_price: Decimal,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String, example = "20.00")]
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemView {
    fn from(model: order_item::Model) -> Self {
        Self {
            product_id: model.product_id,
            product_name: model.product_name,
            product_image: model.product_image,
            quantity: model.quantity,
            unit_price: model.unit_price,
            line_total: model.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NoteView {
    pub id: Uuid,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<order_note::Model> for NoteView {
    fn from(model: order_note::Model) -> Self {
        Self {
            id: model.id,
            author: model.author,
            body: model.body,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundSummary {
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String)]
    pub total_refunded: Decimal,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String)]
    pub max_refundable: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    pub id: Uuid,
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub shipping_address: Option<AddressView>,
    pub items: Vec<OrderItemView>,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String, example = "20.00")]
    pub total_amount: Decimal,
    pub currency: String,
    pub fulfillment_status: FulfillmentStatus,
    pub payment_status: PaymentStatus,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub tracking_number: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Note history rendered as timestamped lines, oldest first
    pub admin_notes: String,
    pub notes: Vec<NoteView>,
    pub refunds: Vec<RefundView>,
    pub refund_summary: RefundSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bumps the order's version and re-reads it. Inside a transaction the bump
/// holds the row lock until commit, serializing writers on the same order.
pub(crate) async fn lock_order<C>(conn: &C, order_id: Uuid) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let bumped = OrderEntity::update_many()
        .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
        .filter(order::Column::Id.eq(order_id))
        .exec(conn)
        .await?;
    if bumped.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
    }
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

async fn insert_note<C>(conn: &C, order_id: Uuid, author: &str, body: String) -> Result<order_note::Model, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(order_note::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        author: Set(author.to_string()),
        body: Set(body),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?)
}

/// Admin-side order control: status moves, tracking, notes and cancellation.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetail, ServiceError> {
        let db = &*self.db_pool;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let shipping_address = address::Entity::find_by_id(order.shipping_address_id)
            .one(db)
            .await?
            .map(AddressView::from);
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::ProductId)
            .all(db)
            .await?;
        let notes = order_note::Entity::find()
            .filter(order_note::Column::OrderId.eq(order_id))
            .order_by_asc(order_note::Column::CreatedAt)
            .all(db)
            .await?;
        let refunds = refund::Entity::find()
            .filter(refund::Column::OrderId.eq(order_id))
            .order_by_asc(refund::Column::CreatedAt)
            .all(db)
            .await?;

        let balance = RefundBalance::from_refunds(order.total_amount, &refunds);
        let total_refunded = money::normalize(
            refunds
                .iter()
                .filter(|r| r.status == RefundStatus::Completed)
                .map(|r| r.amount)
                .sum(),
        );
        let admin_notes = notes
            .iter()
            .map(order_note::Model::log_line)
            .collect::<Vec<_>>()
            .join("\n");

        Ok(OrderDetail {
            id: order.id,
            order_number: order.order_number,
            customer_name: order.customer_name,
            customer_email: order.customer_email,
            customer_phone: order.customer_phone,
            shipping_address,
            items: items.into_iter().map(OrderItemView::from).collect(),
            total_amount: order.total_amount,
            currency: order.currency,
            fulfillment_status: order.fulfillment_status,
            payment_status: order.payment_status,
            checkout_session_id: order.checkout_session_id,
            payment_intent_id: order.payment_intent_id,
            tracking_number: order.tracking_number,
            paid_at: order.paid_at,
            admin_notes,
            notes: notes.into_iter().map(NoteView::from).collect(),
            refunds: refunds.into_iter().map(RefundView::from).collect(),
            refund_summary: RefundSummary {
                total_refunded,
                max_refundable: balance.max_refundable(),
            },
            created_at: order.created_at,
            updated_at: order.updated_at,
        })
    }

    /// Applies any combination of status change, tracking number and note.
    #[instrument(skip(self, request))]
    pub async fn update_order(
        &self,
        order_id: Uuid,
        request: UpdateOrderRequest,
        operator: &str,
    ) -> Result<OrderDetail, ServiceError> {
        request.validate()?;
        if request.status.is_none() && request.tracking_number.is_none() && request.admin_notes.is_none() {
            return Err(ServiceError::ValidationError(
                "at least one of status, trackingNumber or adminNotes is required".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let order = lock_order(&txn, order_id).await?;
        let now = Utc::now();
        let mut status_change = None;

        if let Some(target) = request.status {
            let current = order.fulfillment_status;
            current
                .check_transition(target, order.has_been_paid())
                .map_err(|rule| {
                    warn!(%order_id, %current, requested = %target, rule, "Status change refused");
                    ServiceError::InvalidTransition {
                        current: current.to_string(),
                        requested: target.to_string(),
                        rule: rule.to_string(),
                    }
                })?;

            if target != current {
                OrderEntity::update_many()
                    .col_expr(order::Column::FulfillmentStatus, Expr::value(target))
                    .col_expr(order::Column::UpdatedAt, Expr::value(now))
                    .filter(order::Column::Id.eq(order_id))
                    .exec(&txn)
                    .await?;
                insert_note(
                    &txn,
                    order_id,
                    operator,
                    format!("Status changed from {} to {}", current, target),
                )
                .await?;
                status_change = Some((current, target));
            }
        }

        if let Some(tracking) = &request.tracking_number {
            OrderEntity::update_many()
                .col_expr(order::Column::TrackingNumber, Expr::value(tracking.clone()))
                .col_expr(order::Column::UpdatedAt, Expr::value(now))
                .filter(order::Column::Id.eq(order_id))
                .exec(&txn)
                .await?;
            insert_note(
                &txn,
                order_id,
                operator,
                format!("Tracking number set to {}", tracking),
            )
            .await?;
        }

        if let Some(note) = request.admin_notes {
            insert_note(&txn, order_id, operator, note).await?;
        }

        txn.commit().await?;

        if let Some((old_status, new_status)) = status_change {
            info!(%order_id, %old_status, %new_status, "Fulfillment status changed");
            if new_status == FulfillmentStatus::Cancelled {
                self.event_sender.publish(Event::OrderCancelled { order_id });
            }
            self.event_sender.publish(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            });
        }
        self.get_order(order_id).await
    }

    /// Moves the order to CANCELLED with a note. Never deletes and never refunds.
    #[instrument(skip(self, request))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        request: CancelOrderRequest,
        operator: &str,
    ) -> Result<OrderDetail, ServiceError> {
        request.validate()?;
        let note = match request.reason {
            Some(reason) => format!("Order cancelled: {}", reason),
            None => "Order cancelled".to_string(),
        };
        self.update_order(
            order_id,
            UpdateOrderRequest {
                status: Some(FulfillmentStatus::Cancelled),
                tracking_number: None,
                admin_notes: Some(note),
            },
            operator,
        )
        .await
    }

    #[instrument(skip(self, request))]
    pub async fn append_note(
        &self,
        order_id: Uuid,
        request: AppendNoteRequest,
        operator: &str,
    ) -> Result<NoteView, ServiceError> {
        request.validate()?;
        let txn = self.db_pool.begin().await?;
        lock_order(&txn, order_id).await?;
        let note = insert_note(&txn, order_id, operator, request.note).await?;
        txn.commit().await?;
        Ok(NoteView::from(note))
    }
}
