//! End-to-end integration tests

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use modelmint::auth::{
    hash_token, issue_access_token, issue_session, rotate_session, validate_access_token,
    AuthError,
};
use modelmint::billing::{buy_tokens, PurchaseError};
use modelmint::config::TokenConfig;
use modelmint::ops::{run_prediction, run_training, OpError};
use modelmint::reconciler;
use modelmint::storage::models::{PredictionJob, RowStatus, TrainingJob, User};
use modelmint::storage::{Database, ChargeOutcome, PREDICTION, TRAINING};

fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(temp_dir.path()).unwrap();
    (db, temp_dir)
}

fn make_user(id: &str, tokens: u64) -> User {
    User {
        created_at: Utc::now(),
        email: format!("{id}@example.com"),
        id: id.to_string(),
        is_active: true,
        password_hash: hash_token("hunter22"),
        tokens,
        username: format!("user-{id}"),
    }
}

fn make_training_job(id: &str, owner_id: &str, fingerprint: &str, dir: &Path) -> TrainingJob {
    TrainingJob {
        created_at: Utc::now(),
        feature_schema: BTreeMap::from([("a".to_string(), "numeric".to_string())]),
        features: vec!["a".to_string()],
        fingerprint: fingerprint.to_string(),
        id: id.to_string(),
        label: "y".to_string(),
        metrics: None,
        model_params: BTreeMap::new(),
        model_path: dir.join(format!("{fingerprint}.bin")).display().to_string(),
        model_type: "linear".to_string(),
        owner_id: owner_id.to_string(),
        status: RowStatus::Pending,
    }
}

fn make_prediction_job(id: &str, owner_id: &str, fingerprint: &str) -> PredictionJob {
    PredictionJob {
        created_at: Utc::now(),
        fingerprint: fingerprint.to_string(),
        id: id.to_string(),
        input: BTreeMap::from([("a".to_string(), serde_json::json!(1.0))]),
        model_id: "model-1".to_string(),
        model_type: "linear".to_string(),
        owner_id: owner_id.to_string(),
        result: None,
        status: RowStatus::Pending,
    }
}

// ============================================================================
// Exactly-once training
// ============================================================================

#[tokio::test]
async fn test_training_is_charged_exactly_once_across_retries() {
    let (db, _temp) = setup_db();
    let artifacts = TempDir::new().unwrap();
    db.create_user(&make_user("u1", 100)).unwrap();

    for attempt in 0..3 {
        let job = make_training_job(&format!("j{attempt}"), "u1", "fp-1", artifacts.path());
        let outcome = run_training(db.clone(), 10, job, |tmp| async move {
            std::fs::write(&tmp, b"estimator").unwrap();
            Ok(serde_json::json!({"r2": 0.9}))
        })
        .await
        .unwrap();

        assert_eq!(outcome.charged, attempt == 0);
        assert_eq!(outcome.balance, 90);
        assert_eq!(outcome.job.id, "j0");
    }
    assert_eq!(db.get_tokens("u1").unwrap(), Some(90));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_resolve_to_one_charge() {
    let (db, _temp) = setup_db();
    let artifacts = TempDir::new().unwrap();
    db.create_user(&make_user("u1", 100)).unwrap();

    let mut handles = Vec::new();
    for n in 0..4 {
        let db = db.clone();
        let job = make_training_job(&format!("j{n}"), "u1", "fp-race", artifacts.path());
        handles.push(tokio::spawn(async move {
            run_training(db, 10, job, |tmp| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                std::fs::write(&tmp, b"estimator").unwrap();
                Ok(serde_json::json!({"r2": 0.9}))
            })
            .await
        }));
    }

    let mut charged = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                if outcome.charged {
                    charged += 1;
                }
            }
            // Losers that arrive while the winner is still pending
            Err(OpError::InProgress) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(charged, 1);
    assert_eq!(db.get_tokens("u1").unwrap(), Some(90));

    // A later duplicate replays the stored result without charging
    let replay = make_training_job("j9", "u1", "fp-race", artifacts.path());
    let outcome = run_training(db.clone(), 10, replay, |_| async { panic!("must not run") })
        .await
        .unwrap();
    assert!(!outcome.charged);
    assert_eq!(db.get_tokens("u1").unwrap(), Some(90));
}

#[tokio::test]
async fn test_failed_training_charges_nothing_and_is_retryable() {
    let (db, _temp) = setup_db();
    let artifacts = TempDir::new().unwrap();
    db.create_user(&make_user("u1", 100)).unwrap();

    let job = make_training_job("j1", "u1", "fp-1", artifacts.path());
    let err = run_training(db.clone(), 10, job, |_| async {
        Err(modelmint::ops::ComputeError::Timeout)
    })
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::ComputeFailed));
    assert_eq!(db.get_tokens("u1").unwrap(), Some(100));

    // The retry reuses the original row
    let retry = make_training_job("j2", "u1", "fp-1", artifacts.path());
    let outcome = run_training(db.clone(), 10, retry, |tmp| async move {
        std::fs::write(&tmp, b"estimator").unwrap();
        Ok(serde_json::json!({"r2": 0.7}))
    })
    .await
    .unwrap();
    assert!(outcome.charged);
    assert_eq!(outcome.job.id, "j1");
    assert_eq!(db.get_tokens("u1").unwrap(), Some(90));
}

// ============================================================================
// Crash recovery
// ============================================================================

#[tokio::test]
async fn test_reconciler_completes_interrupted_publish() {
    let (db, _temp) = setup_db();
    let artifacts = TempDir::new().unwrap();
    db.create_user(&make_user("u1", 100)).unwrap();

    // Charge committed, rename never ran
    let job = make_training_job("j1", "u1", "fp-1", artifacts.path());
    let final_path = PathBuf::from(&job.model_path);
    db.try_begin(TRAINING, &job).unwrap();
    let applied = db
        .charge_and_apply::<TrainingJob>(TRAINING, "j1", "u1", 10, |row| {
            row.metrics = Some(serde_json::json!({"r2": 0.9}));
        })
        .unwrap();
    assert!(matches!(applied, ChargeOutcome::Applied { .. }));
    let tmp_path = PathBuf::from(format!("{}.tmp", final_path.display()));
    std::fs::write(&tmp_path, b"estimator").unwrap();

    // Abandoned pending rows from the same crash
    let pending = make_training_job("j2", "u1", "fp-2", artifacts.path());
    db.try_begin(TRAINING, &pending).unwrap();
    db.try_begin(PREDICTION, &make_prediction_job("p1", "u1", "pfp-1"))
        .unwrap();

    let report = reconciler::run(&db).unwrap();
    assert_eq!(report.training_completed, 1);
    assert_eq!(report.training_failed, 1);
    assert_eq!(report.predictions_failed, 1);
    assert!(final_path.exists());
    assert!(!tmp_path.exists());

    // The completed row replays normally afterwards
    let replay = make_training_job("j9", "u1", "fp-1", artifacts.path());
    let outcome = run_training(db.clone(), 10, replay, |_| async { panic!("must not run") })
        .await
        .unwrap();
    assert!(!outcome.charged);
    assert_eq!(outcome.job.metrics, Some(serde_json::json!({"r2": 0.9})));

    // The failed pending row is retryable
    let retry = make_training_job("j10", "u1", "fp-2", artifacts.path());
    let outcome = run_training(db.clone(), 10, retry, |tmp| async move {
        std::fs::write(&tmp, b"estimator").unwrap();
        Ok(serde_json::json!({"r2": 0.5}))
    })
    .await
    .unwrap();
    assert!(outcome.charged);
    assert_eq!(outcome.job.id, "j2");
}

// ============================================================================
// Predictions
// ============================================================================

#[tokio::test]
async fn test_prediction_replay_and_balance() {
    let (db, _temp) = setup_db();
    db.create_user(&make_user("u1", 20)).unwrap();

    let job = make_prediction_job("p1", "u1", "pfp-1");
    let outcome = run_prediction(db.clone(), 5, Duration::from_secs(5), job, || {
        Ok("2.25".to_string())
    })
    .await
    .unwrap();
    assert!(outcome.charged);
    assert_eq!(outcome.balance, 15);

    let dup = make_prediction_job("p2", "u1", "pfp-1");
    let outcome = run_prediction(db.clone(), 5, Duration::from_secs(5), dup, || {
        panic!("must not run")
    })
    .await
    .unwrap();
    assert!(!outcome.charged);
    assert_eq!(outcome.job.result.as_deref(), Some("2.25"));
    assert_eq!(db.get_tokens("u1").unwrap(), Some(15));
}

// ============================================================================
// Token purchases
// ============================================================================

#[test]
fn test_concurrent_purchases_with_one_key_credit_once() {
    let (db, _temp) = setup_db();
    db.create_user(&make_user("u1", 0)).unwrap();

    let mut threads = Vec::new();
    for _ in 0..3 {
        let db = db.clone();
        threads.push(std::thread::spawn(move || loop {
            match buy_tokens(&db, "u1", "key-1", 10, 1000) {
                Ok(receipt) => return receipt,
                Err(PurchaseError::InProgress) => std::thread::yield_now(),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }));
    }

    let receipts: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    let credited = receipts.iter().filter(|r| r.credited).count();
    assert_eq!(credited, 1);
    // Every caller observes the same post-credit balance
    assert!(receipts.iter().all(|r| r.balance == 10));
    assert_eq!(db.get_tokens("u1").unwrap(), Some(10));
}

#[test]
fn test_purchase_policy_bounds() {
    let (db, _temp) = setup_db();
    db.create_user(&make_user("u1", 0)).unwrap();

    // Over the balance cap
    assert!(matches!(
        buy_tokens(&db, "u1", "key-big", 5000, 1000).unwrap_err(),
        PurchaseError::NonZeroBalance
    ));

    buy_tokens(&db, "u1", "key-1", 10, 1000).unwrap();
    // Non-zero balance blocks further purchases
    assert!(matches!(
        buy_tokens(&db, "u1", "key-2", 10, 1000).unwrap_err(),
        PurchaseError::NonZeroBalance
    ));

    // Draining the balance unlocks purchasing again
    db.debit_tokens("u1", 10).unwrap();
    let receipt = buy_tokens(&db, "u1", "key-3", 10, 1000).unwrap();
    assert!(receipt.credited);
}

// ============================================================================
// Session rotation
// ============================================================================

#[test]
fn test_stolen_refresh_token_locks_the_session() {
    let (db, _temp) = setup_db();
    let cfg = TokenConfig::default();
    db.create_user(&make_user("u1", 0)).unwrap();

    let t1 = issue_session(&db, &cfg, "u1").unwrap();
    // The legitimate client rotates
    let t2 = rotate_session(&db, &cfg, &t1.refresh_token).unwrap();

    // An attacker replays the stolen t1
    assert!(matches!(
        rotate_session(&db, &cfg, &t1.refresh_token).unwrap_err(),
        AuthError::ReusedToken
    ));

    // The session is dead for everyone, including the t2 holder
    assert!(matches!(
        rotate_session(&db, &cfg, &t2.refresh_token).unwrap_err(),
        AuthError::ReusedToken
    ));

    // A fresh login starts a new, unrelated session
    let t3 = issue_session(&db, &cfg, "u1").unwrap();
    assert!(rotate_session(&db, &cfg, &t3.refresh_token).is_ok());
}

// ============================================================================
// Account deactivation
// ============================================================================

#[tokio::test]
async fn test_deactivated_account_is_locked_out_everywhere() {
    let (db, _temp) = setup_db();
    let artifacts = TempDir::new().unwrap();
    let cfg = TokenConfig::default();
    db.create_user(&make_user("u1", 100)).unwrap();

    let job = make_training_job("j1", "u1", "fp-1", artifacts.path());
    let outcome = run_training(db.clone(), 10, job, |tmp| async move {
        std::fs::write(&tmp, b"estimator").unwrap();
        Ok(serde_json::json!({"r2": 0.9}))
    })
    .await
    .unwrap();
    assert!(outcome.charged);

    let session = issue_session(&db, &cfg, "u1").unwrap();
    let access = issue_access_token(&db, &cfg, "u1").unwrap();
    let visible: Vec<TrainingJob> = db.list_operations_all(TRAINING).unwrap();
    assert_eq!(visible.len(), 1);

    assert!(db.deactivate_user("u1").unwrap());
    assert_eq!(db.revoke_sessions_for_user("u1").unwrap(), 1);

    // Every credential and spend path is closed
    assert!(matches!(
        validate_access_token(&db, &access).unwrap_err(),
        AuthError::InvalidToken
    ));
    assert!(matches!(
        rotate_session(&db, &cfg, &session.refresh_token).unwrap_err(),
        AuthError::ReusedToken
    ));
    assert_eq!(db.debit_tokens("u1", 1).unwrap(), None);

    // The account's rows drop out of the global listing, the username
    // stays reserved, and deactivation does not repeat
    let visible: Vec<TrainingJob> = db.list_operations_all(TRAINING).unwrap();
    assert!(visible.is_empty());
    assert!(db.get_user_by_username("user-u1").unwrap().is_none());
    assert!(!db.deactivate_user("u1").unwrap());
}
