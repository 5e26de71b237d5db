use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a ledger row.
///
/// Transitions are monotonic: `Pending -> Applied` is terminal,
/// `Pending -> Failed` may be reopened only by an explicit restart
/// (`Failed -> Pending`). `Applied` is never reachable from `Failed`
/// without passing through `Pending` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Pending,
    Applied,
    Failed,
}

/// A registered account holding the token balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// When the account was created
    pub created_at: DateTime<Utc>,
    pub email: String,
    /// Non-secret UUID identifier
    pub id: String,
    pub is_active: bool,
    /// Hash of the password (hashing scheme is an external concern)
    pub password_hash: String,
    /// Token balance, `0 ..= max_balance`
    pub tokens: u64,
    pub username: String,
}

/// One attempt (ever) at a fingerprinted training request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub created_at: DateTime<Utc>,
    /// Column name -> "numeric" | "categorical", captured at submission
    pub feature_schema: BTreeMap<String, String>,
    pub features: Vec<String>,
    /// Deduplication key; derived once at creation, never recomputed
    pub fingerprint: String,
    pub id: String,
    pub label: String,
    /// Metrics reported by the worker, populated only at `Applied`
    pub metrics: Option<serde_json::Value>,
    pub model_params: BTreeMap<String, serde_json::Value>,
    /// Final artifact path; `<model_path>.tmp` is the staging location
    pub model_path: String,
    pub model_type: String,
    pub owner_id: String,
    pub status: RowStatus,
}

/// One attempt (ever) at a fingerprinted prediction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionJob {
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub id: String,
    pub input: BTreeMap<String, serde_json::Value>,
    pub model_id: String,
    pub model_type: String,
    pub owner_id: String,
    /// Populated only at `Applied`
    pub result: Option<String>,
    pub status: RowStatus,
}

/// A row in the idempotent purchase ledger, keyed by `(owner, key)`.
/// Append-only for audit; replays of the same key never re-credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCredit {
    pub created_at: DateTime<Utc>,
    pub id: String,
    /// Client-supplied idempotency key
    pub key: String,
    /// Snapshot of the resulting balance, set only when `Applied`
    pub open_balance: Option<u64>,
    pub owner_id: String,
    pub status: RowStatus,
}

/// A refresh-token session with a two-link rotation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    /// Hard expiry; never extended
    pub absolute_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Hash of the refresh token currently accepted for rotation
    pub current_hash: String,
    /// Sliding expiry; extended on every rotation
    pub expires_at: DateTime<Utc>,
    pub id: String,
    /// Hash superseded by the last rotation. Presenting it is proof of
    /// token theft or replay.
    pub previous_hash: Option<String>,
    pub revoked: bool,
    pub user_id: String,
}

/// A short-lived opaque bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
}
