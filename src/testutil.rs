//! Shared helpers for unit tests.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use crate::config::TokenConfig;
use crate::storage::models::{AuthSession, PredictionJob, RowStatus, TrainingJob, User};
use crate::storage::Database;

/// Fresh database in a temp dir. Keep the TempDir alive for the test's
/// duration.
pub fn setup_db() -> (Database, TempDir) {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(temp.path()).expect("Failed to open database");
    (db, temp)
}

pub fn make_user(id: &str, tokens: u64) -> User {
    User {
        created_at: Utc::now(),
        email: format!("{id}@example.com"),
        id: id.to_string(),
        is_active: true,
        password_hash: String::new(),
        tokens,
        username: format!("user-{id}"),
    }
}

pub fn make_training_job(id: &str, owner_id: &str, fingerprint: &str) -> TrainingJob {
    TrainingJob {
        created_at: Utc::now(),
        feature_schema: [
            ("a".to_string(), "numeric".to_string()),
            ("b".to_string(), "numeric".to_string()),
        ]
        .into(),
        features: vec!["a".to_string(), "b".to_string()],
        fingerprint: fingerprint.to_string(),
        id: id.to_string(),
        label: "y".to_string(),
        metrics: None,
        model_params: Default::default(),
        model_path: format!("/nonexistent/{owner_id}/{fingerprint}.bin"),
        model_type: "linear".to_string(),
        owner_id: owner_id.to_string(),
        status: RowStatus::Pending,
    }
}

pub fn make_prediction_job(id: &str, owner_id: &str, fingerprint: &str) -> PredictionJob {
    PredictionJob {
        created_at: Utc::now(),
        fingerprint: fingerprint.to_string(),
        id: id.to_string(),
        input: [
            ("a".to_string(), serde_json::json!(1.0)),
            ("b".to_string(), serde_json::json!(2.0)),
        ]
        .into(),
        model_id: "model-1".to_string(),
        model_type: "linear".to_string(),
        owner_id: owner_id.to_string(),
        result: None,
        status: RowStatus::Pending,
    }
}

pub fn make_auth_session(id: &str, user_id: &str, current_hash: &str) -> AuthSession {
    let now = Utc::now();
    AuthSession {
        absolute_expires_at: now + Duration::hours(24),
        created_at: now,
        current_hash: current_hash.to_string(),
        expires_at: now + Duration::hours(1),
        id: id.to_string(),
        previous_hash: None,
        revoked: false,
        user_id: user_id.to_string(),
    }
}

pub fn token_config() -> TokenConfig {
    TokenConfig {
        access_ttl_seconds: 900,
        max_balance: 1000,
        max_purchase_amount: 100,
        max_token_generation_retries: 5,
        refresh_absolute_ttl_seconds: 86400,
        refresh_ttl_seconds: 3600,
    }
}
