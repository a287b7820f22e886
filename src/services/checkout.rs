use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        address, order, order_item, payment_transaction,
        product::{self, Entity as ProductEntity},
        FulfillmentStatus, PaymentStatus, TransactionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics, money,
    services::payment_processor::{
        CheckoutLineItem, CheckoutSessionRequest, PaymentMetadata, PaymentProcessor,
    },
};

pub const MAX_LINE_QUANTITY: i32 = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    #[validate(range(min = 1))]
    pub product_id: i32,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryInfo {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 5, max = 32))]
    pub phone: String,
    #[validate(length(min = 1, max = 500))]
    pub address: String,
    #[validate(length(min = 1, max = 120))]
    pub city: String,
    #[validate(length(min = 1, max = 120))]
    pub state: String,
    #[validate(length(min = 1, max = 20))]
    pub zip_code: String,
    #[validate(length(min = 2, max = 56))]
    pub country: String,
    #[validate(length(max = 1000))]
    pub special_instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[validate(length(min = 1, message = "cart must not be empty"))]
    pub cart: Vec<CartLine>,
    #[validate]
    pub delivery_info: DeliveryInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub order_id: Uuid,
    pub order_number: String,
    /// Hosted payment page to redirect the customer to
    pub url: Option<String>,
    #[serde(serialize_with = "money::serialize_amount")]
    #[schema(value_type = String, example = "20.00")]
    pub total: Decimal,
}

/// Return URLs and currency applied to every checkout session
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

/// A cart line priced from the catalog as it stands right now
#[derive(Debug, Clone)]
struct PricedLine {
    product: product::Model,
    quantity: i32,
    unit_price: Decimal,
    line_total: Decimal,
}

/// Sums repeated product lines, keeping first-seen order.
pub fn merge_lines(cart: &[CartLine]) -> Result<Vec<CartLine>, ServiceError> {
    let mut merged: Vec<CartLine> = Vec::with_capacity(cart.len());
    for line in cart {
        match merged.iter_mut().find(|m| m.product_id == line.product_id) {
            Some(existing) => existing.quantity += line.quantity,
            None => merged.push(line.clone()),
        }
    }
    if let Some(line) = merged.iter().find(|l| l.quantity > MAX_LINE_QUANTITY) {
        return Err(ServiceError::ValidationError(format!(
            "quantity for product {} must not exceed {}",
            line.product_id, MAX_LINE_QUANTITY
        )));
    }
    Ok(merged)
}

/// `ORD-` followed by eight upper-case alphanumerics
pub fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("ORD-{}", suffix)
}

/// Turns a cart into a PENDING order and a processor checkout session
#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DatabaseConnection>,
    processor: Arc<dyn PaymentProcessor>,
    event_sender: EventSender,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        processor: Arc<dyn PaymentProcessor>,
        event_sender: EventSender,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            db_pool,
            processor,
            event_sender,
            settings,
        }
    }

    /// Re-reads price and stock for every line. The stock check only narrows the
    /// race window; the webhook's conditional decrement is what prevents overselling.
    async fn price_cart(&self, lines: &[CartLine]) -> Result<Vec<PricedLine>, ServiceError> {
        let ids: Vec<i32> = lines.iter().map(|l| l.product_id).collect();
        let mut products: HashMap<i32, product::Model> = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(&*self.db_pool)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut priced = Vec::with_capacity(lines.len());
        for line in lines {
            let product = match products.remove(&line.product_id) {
                Some(p) if p.is_active => p,
                _ => {
                    return Err(ServiceError::ValidationError(format!(
                        "product {} is not available",
                        line.product_id
                    )))
                }
            };
            if product.stock < line.quantity {
                warn!(
                    product_id = product.id,
                    available = product.stock,
                    requested = line.quantity,
                    "Checkout refused: insufficient stock"
                );
                return Err(ServiceError::InsufficientStock {
                    product_id: product.id,
                    product_name: product.name,
                    available: product.stock,
                    requested: line.quantity,
                });
            }
            let unit_price = money::normalize(product.price);
            priced.push(PricedLine {
                unit_price,
                line_total: money::normalize(unit_price * Decimal::from(line.quantity)),
                quantity: line.quantity,
                product,
            });
        }
        Ok(priced)
    }

    #[instrument(skip(self, request), fields(lines = request.cart.len()))]
    pub async fn create_checkout(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        request.validate()?;
        for line in &request.cart {
            line.validate()?;
        }
        let lines = merge_lines(&request.cart)?;
        let priced = self.price_cart(&lines).await?;
        let total = money::normalize(priced.iter().map(|l| l.line_total).sum());

        let delivery = request.delivery_info;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let transaction_id = Uuid::new_v4();
        let address_id = Uuid::new_v4();
        let order_number = generate_order_number();

        let txn = self.db_pool.begin().await?;

        address::ActiveModel {
            id: Set(address_id),
            full_name: Set(delivery.full_name.clone()),
            email: Set(delivery.email.clone()),
            phone: Set(delivery.phone.clone()),
            address_line: Set(delivery.address.clone()),
            city: Set(delivery.city.clone()),
            state: Set(delivery.state.clone()),
            zip_code: Set(delivery.zip_code.clone()),
            country: Set(delivery.country.clone()),
            special_instructions: Set(delivery.special_instructions.clone()),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            customer_name: Set(delivery.full_name.clone()),
            customer_email: Set(delivery.email.clone()),
            customer_phone: Set(delivery.phone.clone()),
            shipping_address_id: Set(address_id),
            total_amount: Set(total),
            currency: Set(self.settings.currency.clone()),
            fulfillment_status: Set(FulfillmentStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            checkout_session_id: Set(None),
            payment_intent_id: Set(None),
            tracking_number: Set(None),
            paid_at: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for line in &priced {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product.id),
                product_name: Set(line.product.name.clone()),
                product_image: Set(line.product.image_url.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                line_total: Set(line.line_total),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        payment_transaction::ActiveModel {
            id: Set(transaction_id),
            order_id: Set(order_id),
            amount: Set(total),
            currency: Set(self.settings.currency.clone()),
            status: Set(TransactionStatus::Pending),
            checkout_session_id: Set(None),
            payment_intent_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        info!(%order_id, %order_number, %total, "Pending order created");

        let session_request = CheckoutSessionRequest {
            line_items: priced
                .iter()
                .map(|line| {
                    Ok(CheckoutLineItem {
                        name: line.product.name.clone(),
                        image_url: line.product.image_url.clone(),
                        unit_amount: money::to_minor_units(line.unit_price)?,
                        quantity: line.quantity,
                    })
                })
                .collect::<Result<Vec<_>, ServiceError>>()?,
            currency: self.settings.currency.clone(),
            customer_email: delivery.email,
            success_url: self.settings.success_url.clone(),
            cancel_url: self.settings.cancel_url.clone(),
            metadata: PaymentMetadata {
                order_id,
                transaction_id,
            },
        };

        // A failure here leaves the PENDING order behind; it is never charged.
        let session = self
            .processor
            .create_checkout_session(session_request)
            .await
            .map_err(|e| {
                error!(%order_id, "Checkout session creation failed: {}", e);
                metrics::increment_counter_with(
                    "payment_processor_errors_total",
                    &[("operation", "create_session")],
                );
                ServiceError::from(e)
            })?;

        let txn = self.db_pool.begin().await?;
        order::Entity::update_many()
            .col_expr(
                order::Column::CheckoutSessionId,
                Expr::value(session.id.clone()),
            )
            .filter(order::Column::Id.eq(order_id))
            .exec(&txn)
            .await?;
        payment_transaction::Entity::update_many()
            .col_expr(
                payment_transaction::Column::CheckoutSessionId,
                Expr::value(session.id.clone()),
            )
            .filter(payment_transaction::Column::Id.eq(transaction_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        metrics::increment_counter("checkouts_created_total");
        self.event_sender.publish(Event::OrderCreated {
            order_id,
            order_number: order_number.clone(),
        });
        info!(%order_id, session_id = %session.id, "Checkout session attached");

        Ok(CheckoutResponse {
            session_id: session.id,
            order_id,
            order_number,
            url: session.url,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn line(product_id: i32, quantity: i32) -> CartLine {
        CartLine {
            product_id,
            quantity,
        }
    }

    #[test]
    fn duplicate_lines_are_merged_in_first_seen_order() {
        let merged = merge_lines(&[line(7, 2), line(3, 1), line(7, 4)]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!((merged[0].product_id, merged[0].quantity), (7, 6));
        assert_eq!((merged[1].product_id, merged[1].quantity), (3, 1));
    }

    #[test]
    fn merged_quantity_is_still_capped() {
        assert_matches!(
            merge_lines(&[line(7, 60), line(7, 41)]),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn order_numbers_have_the_expected_shape() {
        let number = generate_order_number();
        assert!(number.starts_with("ORD-"));
        let suffix = &number[4..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn empty_cart_and_bad_email_fail_validation() {
        let request = CheckoutRequest {
            cart: vec![],
            delivery_info: DeliveryInfo {
                full_name: "Ada Lovelace".into(),
                email: "not-an-email".into(),
                phone: "555-0100".into(),
                address: "1 Analytical Way".into(),
                city: "London".into(),
                state: "LDN".into(),
                zip_code: "N1".into(),
                country: "GB".into(),
                special_instructions: None,
            },
        };
        let errors = request.validate().unwrap_err();
        let fields = errors.errors();
        assert!(fields.contains_key("cart"));
        assert!(fields.contains_key("delivery_info"));
    }
}
