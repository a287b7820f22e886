use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::{
    entities::product::{self, Entity as ProductEntity},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// On-hand stock for one product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub product_id: i32,
    pub product_name: String,
    pub stock: i32,
    pub is_active: bool,
}

impl From<product::Model> for StockLevel {
    fn from(model: product::Model) -> Self {
        Self {
            product_id: model.id,
            product_name: model.name,
            stock: model.stock,
            is_active: model.is_active,
        }
    }
}

/// Conditionally removes `quantity` units from a product's stock.
///
/// Runs a single `UPDATE ... WHERE stock >= quantity` and returns `false` when no
/// row matched, i.e. the product is missing or short. This is the only path
/// through which a sale lowers stock.
pub async fn try_decrement<C>(conn: &C, product_id: i32, quantity: i32) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let result = ProductEntity::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Service for reading and editing the inventory ledger
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl InventoryService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    async fn find_product(&self, product_id: i32) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    #[instrument(skip(self))]
    pub async fn get_stock(&self, product_id: i32) -> Result<StockLevel, ServiceError> {
        self.find_product(product_id).await.map(StockLevel::from)
    }

    /// Overwrites the stock count of a product
    #[instrument(skip(self))]
    pub async fn set_stock(&self, product_id: i32, stock: i32) -> Result<StockLevel, ServiceError> {
        if stock < 0 {
            return Err(ServiceError::ValidationError(
                "stock must not be negative".to_string(),
            ));
        }
        let before = self.find_product(product_id).await?;

        ProductEntity::update_many()
            .col_expr(product::Column::Stock, Expr::value(stock))
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(&*self.db_pool)
            .await?;

        info!(product_id, old_stock = before.stock, new_stock = stock, "Stock set");
        self.event_sender.publish(Event::InventoryAdjusted {
            product_id,
            old_stock: before.stock,
            new_stock: stock,
        });
        self.get_stock(product_id).await
    }

    /// Applies a signed delta. A negative delta only succeeds if enough stock is on hand.
    #[instrument(skip(self))]
    pub async fn adjust_stock(&self, product_id: i32, delta: i32) -> Result<StockLevel, ServiceError> {
        if delta == 0 {
            return Err(ServiceError::ValidationError(
                "delta must not be zero".to_string(),
            ));
        }

        let applied = if delta < 0 {
            try_decrement(&*self.db_pool, product_id, -delta).await?
        } else {
            let result = ProductEntity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(delta),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(product_id))
                .exec(&*self.db_pool)
                .await?;
            result.rows_affected == 1
        };

        let current = self.find_product(product_id).await?;
        if !applied {
            warn!(product_id, delta, available = current.stock, "Stock adjustment refused");
            return Err(ServiceError::InsufficientStock {
                product_id,
                product_name: current.name,
                available: current.stock,
                requested: -delta,
            });
        }

        info!(product_id, delta, new_stock = current.stock, "Stock adjusted");
        self.event_sender.publish(Event::InventoryAdjusted {
            product_id,
            old_stock: current.stock - delta,
            new_stock: current.stock,
        });
        Ok(StockLevel::from(current))
    }
}
