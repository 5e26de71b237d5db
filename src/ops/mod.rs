//! Transition orchestrators for the two long-running operation kinds.
//!
//! Both orchestrators share the same gate: conditionally insert a pending
//! row, or inspect the existing row and either replay its stored result,
//! report a conflict, or reopen a failed attempt. Compute always runs
//! outside any storage transaction; the charge and the apply share one.

pub mod artifacts;
pub mod prediction;
pub mod training;
pub mod worker;

use thiserror::Error;

use crate::storage::models::RowStatus;
use crate::storage::{Database, DatabaseError, OpTables, OperationRow};

pub use prediction::{run_prediction, PredictionOutcome};
pub use training::{run_training, TrainOutcome};
pub use worker::{ComputeError, Predictor};

#[derive(Debug, Error)]
pub enum OpError {
    /// Publishing the artifact failed after the charge; the row is failed
    /// and no refund is issued
    #[error("artifact could not be published")]
    ArtifactIo,
    #[error("model artifact is missing")]
    ArtifactMissing,
    /// Worker failure, timeout, or malformed output; detail is logged only
    #[error("operation failed")]
    ComputeFailed,
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// An operation for this fingerprint is already pending; retryable
    #[error("operation already in progress")]
    InProgress,
    #[error("insufficient token balance")]
    InsufficientFunds,
    #[error("model not found")]
    ModelNotFound,
    /// The row left `Pending` under us (concurrent failure or restart)
    #[error("operation state mismatch")]
    StateMismatch,
}

/// Where the idempotency gate sends a submission.
pub(crate) enum Gate<T> {
    /// We own a pending row (fresh insert or reopened failure); run compute
    Run(String),
    /// An applied row already exists; return it uncharged
    Replay(T),
}

/// The insert-or-inspect gate shared by both operation kinds. Exactly one
/// concurrent submitter per `(owner, fingerprint)` gets `Run`; the rest see
/// the applied result or a conflict.
pub(crate) fn begin_or_replay<T: OperationRow>(
    db: &Database,
    tables: OpTables,
    row: &T,
) -> Result<Gate<T>, OpError> {
    if let Some(id) = db.try_begin(tables, row)? {
        return Ok(Gate::Run(id));
    }

    let existing: T = db
        .get_operation(tables, row.owner_id(), row.fingerprint())?
        .ok_or(OpError::InProgress)?;
    match existing.status() {
        RowStatus::Applied => Ok(Gate::Replay(existing)),
        RowStatus::Pending => Err(OpError::InProgress),
        RowStatus::Failed => {
            // Reopen the failed attempt; losing this race to a concurrent
            // restart reads as "in progress"
            match db.restart_operation::<T>(tables, row.owner_id(), row.fingerprint())? {
                Some(id) => Ok(Gate::Run(id)),
                None => Err(OpError::InProgress),
            }
        }
    }
}
