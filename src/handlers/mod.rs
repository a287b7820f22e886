pub mod checkout;
pub mod health;
pub mod inventory;
pub mod orders;
pub mod payment_webhooks;
pub mod refunds;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        checkout::{CheckoutService, CheckoutSettings},
        inventory::InventoryService,
        orders::OrderService,
        payment_processor::PaymentProcessor,
        reconciliation::PaymentReconciler,
        refunds::RefundService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<PaymentReconciler>,
    pub refunds: Arc<RefundService>,
    pub orders: Arc<OrderService>,
    pub inventory: Arc<InventoryService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        processor: Arc<dyn PaymentProcessor>,
        event_sender: EventSender,
        config: &AppConfig,
    ) -> Self {
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            processor.clone(),
            event_sender.clone(),
            CheckoutSettings {
                currency: config.currency.to_ascii_lowercase(),
                success_url: config.checkout_success_url(),
                cancel_url: config.checkout_cancel_url(),
            },
        ));
        let reconciler = Arc::new(PaymentReconciler::new(
            db_pool.clone(),
            processor.clone(),
            event_sender.clone(),
            config.payment_webhook_secret.clone(),
            config.payment_webhook_tolerance_secs,
        ));
        let refunds = Arc::new(RefundService::new(
            db_pool.clone(),
            processor,
            event_sender.clone(),
        ));
        let orders = Arc::new(OrderService::new(db_pool.clone(), event_sender.clone()));
        let inventory = Arc::new(InventoryService::new(db_pool, event_sender));

        Self {
            checkout,
            reconciler,
            refunds,
            orders,
            inventory,
        }
    }
}
