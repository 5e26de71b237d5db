pub mod db;
pub mod models;
mod operations;
mod sessions;
pub mod tables;
mod tokens;

pub use db::{Database, DatabaseError};
pub use operations::{ChargeOutcome, OpTables, OperationRow, PREDICTION, TRAINING};
pub use sessions::RotateOutcome;
pub use tokens::InsertPendingOutcome;
