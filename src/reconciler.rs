//! Startup crash recovery.
//!
//! Runs once, after the database opens and before the listener binds. Any
//! row still `Pending` belongs to a run that died mid-flight; any `Applied`
//! training row whose artifact files disagree with the ledger was
//! interrupted between the commit and the rename. The ledger is
//! authoritative: files are completed or removed to match it, never the
//! other way around.

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::ops::artifacts;
use crate::storage::models::{PredictionJob, RowStatus, TrainingJob};
use crate::storage::{Database, DatabaseError, OperationRow, PREDICTION, TRAINING};

/// What to do about one training row given which of its files survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAction {
    /// Row settled, stray staging file left behind
    CleanTmp,
    /// Charge committed but the rename never ran; finish it
    CompletePublish,
    /// Row cannot be made whole; mark it failed
    Fail,
    /// Mark failed and remove the abandoned staging file
    FailAndCleanTmp,
    Nothing,
}

/// The recovery decision table. Pure so every cell is testable.
pub fn publish_action(status: RowStatus, final_exists: bool, tmp_exists: bool) -> PublishAction {
    match (status, final_exists, tmp_exists) {
        (RowStatus::Applied, true, true) => PublishAction::CleanTmp,
        (RowStatus::Applied, true, false) => PublishAction::Nothing,
        (RowStatus::Applied, false, true) => PublishAction::CompletePublish,
        (RowStatus::Applied, false, false) => PublishAction::Fail,
        (RowStatus::Pending, _, true) => PublishAction::FailAndCleanTmp,
        (RowStatus::Pending, _, false) => PublishAction::Fail,
        (RowStatus::Failed, _, true) => PublishAction::CleanTmp,
        (RowStatus::Failed, _, false) => PublishAction::Nothing,
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub predictions_failed: usize,
    pub purchases_failed: usize,
    pub tmp_cleaned: usize,
    pub training_completed: usize,
    pub training_failed: usize,
}

/// Reconcile the ledgers with the filesystem. Errors are fatal to startup;
/// serving requests against an unreconciled ledger is worse than not
/// serving at all.
pub fn run(db: &Database) -> Result<ReconcileReport, DatabaseError> {
    let mut report = ReconcileReport::default();

    for status in [RowStatus::Pending, RowStatus::Applied, RowStatus::Failed] {
        for job in db.operations_with_status::<TrainingJob>(TRAINING, status)? {
            reconcile_training(db, &job, &mut report)?;
        }
    }

    for job in db.operations_with_status::<PredictionJob>(PREDICTION, RowStatus::Pending)? {
        warn!(job_id = %job.id, "Abandoned pending prediction, marking failed");
        db.mark_operation_failed::<PredictionJob>(PREDICTION, &job.id)?;
        report.predictions_failed += 1;
    }

    // A purchase that crashed between opening its row and settling the
    // credit still holds its owner's pending slot and would block every
    // later purchase. Fail it: the key burns and the slot frees. Whether
    // the credit itself landed cannot be recovered from the row, so the
    // ambiguity resolves against re-crediting.
    for credit in db.pending_credits()? {
        warn!(owner_id = %credit.owner_id, key = %credit.key, "Unsettled purchase, marking failed");
        db.mark_credit_failed(&credit.owner_id, &credit.key)?;
        report.purchases_failed += 1;
    }

    info!(
        predictions_failed = report.predictions_failed,
        purchases_failed = report.purchases_failed,
        tmp_cleaned = report.tmp_cleaned,
        training_completed = report.training_completed,
        training_failed = report.training_failed,
        "reconcile_complete"
    );
    Ok(report)
}

fn reconcile_training(
    db: &Database,
    job: &TrainingJob,
    report: &mut ReconcileReport,
) -> Result<(), DatabaseError> {
    let final_path = Path::new(&job.model_path);
    let tmp_path = artifacts::temp_path_for(final_path);

    match publish_action(job.status(), final_path.exists(), tmp_path.exists()) {
        PublishAction::Nothing => {}
        PublishAction::CleanTmp => {
            artifacts::safe_unlink(&tmp_path);
            report.tmp_cleaned += 1;
        }
        PublishAction::CompletePublish => match artifacts::publish(&tmp_path, final_path) {
            Ok(()) => {
                info!(job_id = %job.id, "Completed interrupted artifact publish");
                report.training_completed += 1;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Completing publish failed, marking job failed");
                db.mark_operation_failed::<TrainingJob>(TRAINING, &job.id)?;
                artifacts::safe_unlink(&tmp_path);
                artifacts::safe_unlink(final_path);
                report.training_failed += 1;
            }
        },
        PublishAction::Fail => {
            warn!(job_id = %job.id, status = ?job.status, "Unrecoverable training row, marking failed");
            db.mark_operation_failed::<TrainingJob>(TRAINING, &job.id)?;
            report.training_failed += 1;
        }
        PublishAction::FailAndCleanTmp => {
            warn!(job_id = %job.id, "Abandoned pending training job, marking failed");
            db.mark_operation_failed::<TrainingJob>(TRAINING, &job.id)?;
            artifacts::safe_unlink(&tmp_path);
            report.training_failed += 1;
        }
    }
    Ok(())
}
