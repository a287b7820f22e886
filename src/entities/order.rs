use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub shipping_address_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,
    pub currency: String,
    pub fulfillment_status: FulfillmentStatus,
    pub payment_status: PaymentStatus,
    /// Canonical correlation id with the payment processor
    #[sea_orm(unique, nullable)]
    pub checkout_session_id: Option<String>,
    /// Lower-level charge reference, targeted by refunds
    #[sea_orm(nullable)]
    pub payment_intent_id: Option<String>,
    #[sea_orm(nullable)]
    pub tracking_number: Option<String>,
    /// Set once, when the payment is first reconciled
    #[sea_orm(nullable)]
    pub paid_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::refund::Entity")]
    Refunds,
    #[sea_orm(has_many = "super::order_note::Entity")]
    Notes,
    #[sea_orm(has_many = "super::payment_transaction::Entity")]
    Transactions,
    #[sea_orm(
        belongs_to = "super::address::Entity",
        from = "Column::ShippingAddressId",
        to = "super::address::Column::Id"
    )]
    ShippingAddress,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::refund::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Refunds.def()
    }
}

impl Related<super::order_note::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Notes.def()
    }
}

impl Related<super::payment_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl Related<super::address::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ShippingAddress.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if !insert {
            active_model.updated_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}

impl Model {
    /// True once a payment has been reconciled, even if it was later refunded.
    pub fn has_been_paid(&self) -> bool {
        self.paid_at.is_some()
    }
}

/// Shipping and handling lifecycle, independent of payment
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

pub const RULE_CANNOT_CANCEL_SHIPPED: &str = "cannot cancel shipped/delivered order";
pub const RULE_CANCELLED_IS_FINAL: &str = "cancelled orders cannot change status";
pub const RULE_SHIP_REQUIRES_PAYMENT: &str = "order must be paid before it can ship";
pub const RULE_NO_BACKWARDS: &str = "fulfillment status cannot move backwards";

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Shipped => 2,
            Self::Delivered => 3,
            Self::Cancelled => 4,
        }
    }

    /// Checks a requested move against the fulfillment state machine.
    ///
    /// Returns the name of the violated rule on rejection. Moving to the current
    /// status is accepted as a no-op.
    pub fn check_transition(&self, target: Self, has_been_paid: bool) -> Result<(), &'static str> {
        if *self == target {
            return Ok(());
        }
        match (self, target) {
            (Self::Cancelled, _) => Err(RULE_CANCELLED_IS_FINAL),
            (Self::Shipped | Self::Delivered, Self::Cancelled) => Err(RULE_CANNOT_CANCEL_SHIPPED),
            (Self::Pending | Self::Processing, Self::Cancelled) => Ok(()),
            (_, Self::Shipped | Self::Delivered) if !has_been_paid => {
                Err(RULE_SHIP_REQUIRES_PAYMENT)
            }
            (current, next) if next.rank() < current.rank() => Err(RULE_NO_BACKWARDS),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monetary lifecycle, driven by the webhook reconciler and the refund ledger
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::PartiallyRefunded => "PARTIALLY_REFUNDED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// Statuses from which the webhook may still promote the order to PAID
    pub fn awaiting_payment(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    /// Statuses against which a refund may be issued
    pub fn is_refundable(&self) -> bool {
        matches!(self, Self::Paid | Self::PartiallyRefunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
