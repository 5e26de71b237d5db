//! Orchestrates the prediction lifecycle: model lookup, idempotency gate,
//! blocking compute under a timeout, and the single charge+apply
//! transaction. Predictions have no artifact of their own, so there is no
//! publish phase.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::worker::ComputeError;
use super::{begin_or_replay, Gate, OpError};
use crate::storage::models::{PredictionJob, RowStatus, TrainingJob};
use crate::storage::{ChargeOutcome, Database, PREDICTION, TRAINING};

#[derive(Debug)]
pub struct PredictionOutcome {
    pub balance: u64,
    /// False on the idempotent-replay path
    pub charged: bool,
    pub job: PredictionJob,
}

/// Resolve the model a prediction runs against. The model must belong to
/// `owner_id` and be applied, and its published artifact must still exist
/// on disk.
pub fn load_model_for_owner(
    db: &Database,
    owner_id: &str,
    model_id: &str,
) -> Result<TrainingJob, OpError> {
    let model: TrainingJob = db
        .get_operation_by_id(TRAINING, model_id)?
        .ok_or(OpError::ModelNotFound)?;
    if model.owner_id != owner_id || model.status != RowStatus::Applied {
        return Err(OpError::ModelNotFound);
    }
    if !Path::new(&model.model_path).exists() {
        warn!(model_id = %model_id, path = %model.model_path, "Applied model has no artifact on disk");
        return Err(OpError::ArtifactMissing);
    }
    Ok(model)
}

/// Run one prediction submission to a terminal state.
///
/// `compute` is a blocking closure (the estimator evaluation); it runs on a
/// blocking worker thread under `timeout`. As with training, the post-gate
/// phase is spawned so a dropped caller cannot strand the pending row.
pub async fn run_prediction<F>(
    db: Database,
    cost: u64,
    timeout: Duration,
    job: PredictionJob,
    compute: F,
) -> Result<PredictionOutcome, OpError>
where
    F: FnOnce() -> Result<String, ComputeError> + Send + 'static,
{
    let owner_id = job.owner_id.clone();
    let fingerprint = job.fingerprint.clone();

    let job_id = match begin_or_replay(&db, PREDICTION, &job)? {
        Gate::Run(id) => id,
        Gate::Replay(existing) => {
            let balance = db.get_tokens(&owner_id)?.unwrap_or(0);
            info!(owner_id = %owner_id, fingerprint = %fingerprint, "Prediction replayed from ledger");
            return Ok(PredictionOutcome {
                balance,
                charged: false,
                job: existing,
            });
        }
    };

    let task_db = db.clone();
    let task_id = job_id.clone();
    let handle = tokio::spawn(async move {
        execute_prediction(task_db, cost, task_id, owner_id, timeout, compute).await
    });

    match handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Prediction task aborted");
            mark_failed(&db, &job_id);
            Err(OpError::ComputeFailed)
        }
    }
}

async fn execute_prediction<F>(
    db: Database,
    cost: u64,
    job_id: String,
    owner_id: String,
    timeout: Duration,
    compute: F,
) -> Result<PredictionOutcome, OpError>
where
    F: FnOnce() -> Result<String, ComputeError> + Send + 'static,
{
    let evaluated = tokio::time::timeout(timeout, tokio::task::spawn_blocking(compute)).await;
    let result = match evaluated {
        Err(_) => {
            warn!(job_id = %job_id, "Prediction timed out");
            mark_failed(&db, &job_id);
            return Err(OpError::ComputeFailed);
        }
        Ok(Err(join_err)) => {
            warn!(job_id = %job_id, error = %join_err, "Prediction worker panicked");
            mark_failed(&db, &job_id);
            return Err(OpError::ComputeFailed);
        }
        Ok(Ok(Err(e))) => {
            warn!(job_id = %job_id, detail = %e, "Prediction worker failed");
            mark_failed(&db, &job_id);
            return Err(OpError::ComputeFailed);
        }
        Ok(Ok(Ok(result))) => result,
    };

    let charge =
        db.charge_and_apply::<PredictionJob>(PREDICTION, &job_id, &owner_id, cost, |row| {
            row.result = Some(result);
        });
    let (balance, job) = match charge {
        Ok(ChargeOutcome::Applied { balance, record }) => (balance, record),
        Ok(ChargeOutcome::InsufficientFunds) => {
            mark_failed(&db, &job_id);
            return Err(OpError::InsufficientFunds);
        }
        Ok(ChargeOutcome::NotPending) => {
            warn!(job_id = %job_id, "Apply state mismatch: row left pending during compute");
            mark_failed(&db, &job_id);
            return Err(OpError::StateMismatch);
        }
        Err(e) => {
            mark_failed(&db, &job_id);
            return Err(OpError::Database(e));
        }
    };

    info!(
        job_id = %job_id,
        owner_id = %owner_id,
        charged = cost,
        balance_after = balance,
        "prediction_applied"
    );
    Ok(PredictionOutcome {
        balance,
        charged: true,
        job,
    })
}

fn mark_failed(db: &Database, job_id: &str) {
    if let Err(e) = db.mark_operation_failed::<PredictionJob>(PREDICTION, job_id) {
        warn!(job_id = %job_id, error = %e, "Could not mark prediction failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_prediction_job, make_training_job, make_user, setup_db};

    #[tokio::test]
    async fn test_successful_prediction_charges_once() {
        let (db, _temp) = setup_db();
        db.create_user(&make_user("u1", 20)).unwrap();

        let job = make_prediction_job("p1", "u1", "pfp-1");
        let outcome = run_prediction(db.clone(), 5, Duration::from_secs(5), job, || {
            Ok("1.5".to_string())
        })
        .await
        .unwrap();

        assert!(outcome.charged);
        assert_eq!(outcome.balance, 15);
        assert_eq!(outcome.job.result.as_deref(), Some("1.5"));
        assert_eq!(outcome.job.status, RowStatus::Applied);
    }

    #[tokio::test]
    async fn test_replay_returns_stored_result_uncharged() {
        let (db, _temp) = setup_db();
        db.create_user(&make_user("u1", 20)).unwrap();

        let job = make_prediction_job("p1", "u1", "pfp-1");
        run_prediction(db.clone(), 5, Duration::from_secs(5), job, || {
            Ok("1.5".to_string())
        })
        .await
        .unwrap();

        let dup = make_prediction_job("p2", "u1", "pfp-1");
        let outcome = run_prediction(db.clone(), 5, Duration::from_secs(5), dup, || {
            panic!("replay must not recompute")
        })
        .await
        .unwrap();

        assert!(!outcome.charged);
        assert_eq!(outcome.balance, 15);
        assert_eq!(outcome.job.id, "p1");
        assert_eq!(db.get_tokens("u1").unwrap(), Some(15));
    }

    #[tokio::test]
    async fn test_timeout_marks_row_failed_without_charge() {
        let (db, _temp) = setup_db();
        db.create_user(&make_user("u1", 20)).unwrap();

        let job = make_prediction_job("p1", "u1", "pfp-1");
        let err = run_prediction(db.clone(), 5, Duration::from_millis(50), job, || {
            std::thread::sleep(Duration::from_secs(10));
            Ok("never".to_string())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, OpError::ComputeFailed));
        assert_eq!(db.get_tokens("u1").unwrap(), Some(20));
        let row: PredictionJob = db.get_operation(PREDICTION, "u1", "pfp-1").unwrap().unwrap();
        assert_eq!(row.status, RowStatus::Failed);
    }

    #[tokio::test]
    async fn test_load_model_requires_owned_applied_artifact() {
        let (db, _temp) = setup_db();
        db.create_user(&make_user("u1", 20)).unwrap();
        db.create_user(&make_user("u2", 20)).unwrap();

        let artifacts_dir = tempfile::tempdir().unwrap();
        let artifact = artifacts_dir.path().join("m.bin");
        std::fs::write(&artifact, b"estimator").unwrap();

        let mut model = make_training_job("m1", "u1", "fp-m");
        model.model_path = artifact.display().to_string();
        db.try_begin(TRAINING, &model).unwrap();

        // Pending model is invisible to prediction
        assert!(matches!(
            load_model_for_owner(&db, "u1", "m1").unwrap_err(),
            OpError::ModelNotFound
        ));

        db.charge_and_apply::<TrainingJob>(TRAINING, "m1", "u1", 10, |_| {})
            .unwrap();
        assert!(load_model_for_owner(&db, "u1", "m1").is_ok());

        // Another owner's model id does not resolve
        assert!(matches!(
            load_model_for_owner(&db, "u2", "m1").unwrap_err(),
            OpError::ModelNotFound
        ));

        // Applied row with a missing artifact is a distinct failure
        std::fs::remove_file(&artifact).unwrap();
        assert!(matches!(
            load_model_for_owner(&db, "u1", "m1").unwrap_err(),
            OpError::ArtifactMissing
        ));
    }
}
