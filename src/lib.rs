//! modelmint - an ML training and prediction service with exactly-once
//! billing
//!
//! Every billable operation (model training, prediction, token purchase) is
//! deduplicated by a deterministic fingerprint or idempotency key and
//! charged at most once, no matter how often it is retried. The crate
//! provides:
//! - Fingerprinted operation ledgers with a Pending/Applied/Failed lifecycle
//! - A single-transaction charge+apply commit (redb embedded database)
//! - Two-phase artifact publish with a startup crash reconciler
//! - A token ledger with idempotent purchases and version-gated read billing
//! - Refresh-token session rotation with reuse detection
//! - REST API

pub mod api;
pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod ops;
pub mod reconciler;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use cache::CacheClient;
use config::Config;
use ops::Predictor;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub cache: CacheClient,
    pub config: Config,
    pub db: Database,
    pub predictor: Arc<dyn Predictor>,
}
