pub mod address;
pub mod order;
pub mod order_item;
pub mod order_note;
pub mod payment_transaction;
pub mod product;
pub mod refund;

pub use order::{FulfillmentStatus, PaymentStatus};
pub use payment_transaction::TransactionStatus;
pub use refund::{RefundStatus, RefundType};
