use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::{FulfillmentStatus, PaymentStatus};
use crate::services::notifications::{OrderConfirmation, OrderNotifier};

/// Domain events published after a state change has been committed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    OrderPaid(OrderConfirmation),
    PaymentFailed {
        order_id: Uuid,
    },
    PaymentStockConflict {
        order_id: Uuid,
        product_id: i32,
    },
    RefundCompleted {
        order_id: Uuid,
        refund_id: Uuid,
        amount: Decimal,
        payment_status: PaymentStatus,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: FulfillmentStatus,
        new_status: FulfillmentStatus,
    },
    OrderCancelled {
        order_id: Uuid,
    },
    InventoryAdjusted {
        product_id: i32,
        old_stock: i32,
        new_stock: i32,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Publishes without waiting. A full or closed channel drops the event
    /// with a warning; the caller's state change has already been committed.
    pub fn publish(&self, event: Event) {
        if let Err(err) = self.sender.try_send(event) {
            warn!("Dropping domain event: {}", err);
        }
    }
}

/// Creates the event channel with the given capacity
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the event channel until every sender is dropped
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn OrderNotifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!("Received event: {:?}", event);

        match event {
            Event::OrderPaid(confirmation) => {
                if let Err(e) = notifier.order_confirmed(&confirmation).await {
                    error!(
                        "Failed to send order confirmation: order_id={}, error={}",
                        confirmation.order_id, e
                    );
                }
            }
            Event::PaymentStockConflict {
                order_id,
                product_id,
            } => {
                warn!(
                    %order_id,
                    product_id,
                    "Paid order could not be fulfilled from stock; needs support follow-up"
                );
            }
            Event::RefundCompleted {
                order_id,
                refund_id,
                amount,
                payment_status,
            } => {
                info!(%order_id, %refund_id, %amount, %payment_status, "Refund completed");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "Order status changed");
            }
            other => {
                info!("Event processed: {:?}", other);
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifications::NotificationError;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl OrderNotifier for RecordingNotifier {
        async fn order_confirmed(
            &self,
            confirmation: &OrderConfirmation,
        ) -> Result<(), NotificationError> {
            self.seen.lock().await.push(confirmation.order_id);
            Err(NotificationError::Delivery("smtp down".into()))
        }
    }

    fn confirmation(order_id: Uuid) -> OrderConfirmation {
        OrderConfirmation {
            order_id,
            order_number: "ORD-TEST0001".into(),
            customer_name: "Ada".into(),
            customer_email: "ada@example.com".into(),
            total_amount: dec!(20.00),
            currency: "usd".into(),
        }
    }

    #[tokio::test]
    async fn paid_orders_reach_the_notifier_even_when_it_fails() {
        let (sender, rx) = channel(8);
        let notifier = Arc::new(RecordingNotifier::default());
        let order_id = Uuid::new_v4();

        sender.publish(Event::OrderPaid(confirmation(order_id)));
        sender.publish(Event::OrderCancelled {
            order_id: Uuid::new_v4(),
        });
        drop(sender);

        process_events(rx, notifier.clone()).await;
        assert_eq!(*notifier.seen.lock().await, vec![order_id]);
    }

    #[test]
    fn publish_on_full_channel_does_not_block() {
        let (sender, _rx) = channel(1);
        sender.publish(Event::PaymentFailed {
            order_id: Uuid::new_v4(),
        });
        sender.publish(Event::PaymentFailed {
            order_id: Uuid::new_v4(),
        });
    }
}
