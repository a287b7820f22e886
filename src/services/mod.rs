// Order lifecycle
pub mod checkout;
pub mod orders;
pub mod reconciliation;
pub mod refunds;

// Inventory ledger
pub mod inventory;

// External collaborators
pub mod notifications;
pub mod payment_processor;
