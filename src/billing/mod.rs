//! Billing flows built on the storage ledgers: idempotent token purchases
//! and version-gated read metering.

pub mod metering;
pub mod purchase;

pub use metering::{
    bump_version, charge_once_per_version, list_cache_key, scope_version, MeterAction, MeterError,
    MeterOutcome,
};
pub use purchase::{buy_tokens, PurchaseError, PurchaseReceipt};
