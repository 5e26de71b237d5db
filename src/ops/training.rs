//! Orchestrates the training-job lifecycle: idempotency gate, subprocess
//! compute, the single charge+apply transaction, and the two-phase artifact
//! publish.

use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::artifacts;
use super::worker::ComputeError;
use super::{begin_or_replay, Gate, OpError};
use crate::storage::models::TrainingJob;
use crate::storage::{ChargeOutcome, Database, TRAINING};

#[derive(Debug)]
pub struct TrainOutcome {
    pub balance: u64,
    /// False on the idempotent-replay path
    pub charged: bool,
    pub job: TrainingJob,
}

/// Run one training submission to a terminal state.
///
/// `job` is the fully built pending candidate row (id, fingerprint, final
/// artifact path); `compute` receives the temp output path and produces the
/// worker's metrics object. The post-gate phase runs in a spawned task so a
/// dropped caller (client disconnect) cannot strand the row mid-flight:
/// every failure inside the task drives the row to `Failed` and removes
/// staged files in its own best-effort writes.
pub async fn run_training<F, Fut>(
    db: Database,
    cost: u64,
    job: TrainingJob,
    compute: F,
) -> Result<TrainOutcome, OpError>
where
    F: FnOnce(PathBuf) -> Fut + Send + 'static,
    Fut: Future<Output = Result<serde_json::Value, ComputeError>> + Send + 'static,
{
    let owner_id = job.owner_id.clone();
    let fingerprint = job.fingerprint.clone();

    let job_id = match begin_or_replay(&db, TRAINING, &job)? {
        Gate::Run(id) => id,
        Gate::Replay(existing) => {
            let balance = db.get_tokens(&owner_id)?.unwrap_or(0);
            info!(owner_id = %owner_id, fingerprint = %fingerprint, "Training replayed from ledger");
            return Ok(TrainOutcome {
                balance,
                charged: false,
                job: existing,
            });
        }
    };

    let task_db = db.clone();
    let final_path = PathBuf::from(job.model_path.clone());
    let handle = tokio::spawn(execute_training(
        task_db,
        cost,
        job_id.clone(),
        owner_id.clone(),
        final_path.clone(),
        compute,
    ));

    match handle.await {
        Ok(result) => result,
        Err(e) => {
            // Task panicked; converge the row before surfacing a generic failure
            warn!(job_id = %job_id, error = %e, "Training task aborted");
            fail_and_cleanup(
                &db,
                &job_id,
                Some(&artifacts::temp_path_for(&final_path)),
                None,
            );
            Err(OpError::ComputeFailed)
        }
    }
}

async fn execute_training<F, Fut>(
    db: Database,
    cost: u64,
    job_id: String,
    owner_id: String,
    final_path: PathBuf,
    compute: F,
) -> Result<TrainOutcome, OpError>
where
    F: FnOnce(PathBuf) -> Fut + Send,
    Fut: Future<Output = Result<serde_json::Value, ComputeError>> + Send,
{
    let tmp_path = artifacts::temp_path_for(&final_path);
    if let Some(parent) = final_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(job_id = %job_id, error = %e, "Could not create artifact directory");
            fail_and_cleanup(&db, &job_id, None, None);
            return Err(OpError::ArtifactIo);
        }
    }

    let metrics = match compute(tmp_path.clone()).await {
        Ok(metrics) => metrics,
        Err(e) => {
            warn!(job_id = %job_id, detail = %e, "Training worker failed");
            fail_and_cleanup(&db, &job_id, Some(&tmp_path), None);
            return Err(OpError::ComputeFailed);
        }
    };

    let charge = db.charge_and_apply::<TrainingJob>(TRAINING, &job_id, &owner_id, cost, |row| {
        row.metrics = Some(metrics);
    });
    let (balance, job) = match charge {
        Ok(ChargeOutcome::Applied { balance, record }) => (balance, record),
        Ok(ChargeOutcome::InsufficientFunds) => {
            fail_and_cleanup(&db, &job_id, Some(&tmp_path), None);
            return Err(OpError::InsufficientFunds);
        }
        Ok(ChargeOutcome::NotPending) => {
            warn!(job_id = %job_id, "Apply state mismatch: row left pending during compute");
            fail_and_cleanup(&db, &job_id, Some(&tmp_path), None);
            return Err(OpError::StateMismatch);
        }
        Err(e) => {
            fail_and_cleanup(&db, &job_id, Some(&tmp_path), None);
            return Err(OpError::Database(e));
        }
    };

    // Publish strictly after the row is applied. A failed rename leaves the
    // row failed with tokens already charged; there is deliberately no
    // refund here. The retry path and the reconciler own the repair.
    if let Err(e) = artifacts::publish(&tmp_path, &final_path) {
        warn!(job_id = %job_id, error = %e, "Artifact publish failed after charge");
        fail_and_cleanup(&db, &job_id, Some(&tmp_path), Some(&final_path));
        return Err(OpError::ArtifactIo);
    }

    info!(
        job_id = %job_id,
        owner_id = %owner_id,
        charged = cost,
        balance_after = balance,
        "training_job_applied"
    );
    Ok(TrainOutcome {
        balance,
        charged: true,
        job,
    })
}

/// Best-effort convergence for a doomed attempt: flip the row to `Failed`
/// in its own short transaction and remove staged files. A failure to even
/// mark-failed is logged and swallowed; the startup reconciler is the
/// backstop.
fn fail_and_cleanup(db: &Database, job_id: &str, tmp_path: Option<&Path>, final_path: Option<&Path>) {
    if let Err(e) = db.mark_operation_failed::<TrainingJob>(TRAINING, job_id) {
        warn!(job_id = %job_id, error = %e, "Could not mark training job failed");
    }
    if let Some(tmp) = tmp_path {
        artifacts::safe_unlink(tmp);
    }
    if let Some(fin) = final_path {
        artifacts::safe_unlink(fin);
    }
}
