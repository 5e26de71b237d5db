//! Generic primitives for the per-kind operation ledgers.
//!
//! Both operation kinds (training jobs, prediction jobs) share the same
//! lifecycle: a row keyed by `(owner, fingerprint)` moves through
//! `Pending -> Applied | Failed`, with `Failed -> Pending` on explicit
//! restart. The composite row key realizes the uniqueness constraint, and
//! redb's serialized write transactions make every transition primitive
//! here atomic: concurrent `try_begin` calls resolve to exactly one winner
//! without any application-level lock.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::db::{Database, DatabaseError};
use super::models::{PredictionJob, RowStatus, TrainingJob, User};
use super::tables::*;
use super::tokens::debit_in_txn;

pub type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;
pub type IdTable = TableDefinition<'static, &'static str, &'static str>;

/// The pair of tables backing one operation kind: the row table keyed by
/// `"{owner}/{fingerprint}"` and the id index keyed by row id.
#[derive(Clone, Copy)]
pub struct OpTables {
    pub ids: IdTable,
    pub rows: RowTable,
}

pub const TRAINING: OpTables = OpTables {
    ids: TRAINING_JOB_IDS,
    rows: TRAINING_JOBS,
};

pub const PREDICTION: OpTables = OpTables {
    ids: PREDICTION_IDS,
    rows: PREDICTIONS,
};

/// Composite row key. Owner ids are UUIDs and fingerprints are hex, so '/'
/// cannot occur in either part.
pub fn op_key(owner_id: &str, fingerprint: &str) -> String {
    format!("{owner_id}/{fingerprint}")
}

/// Accessors every operation record exposes to the ledger primitives.
pub trait OperationRow: Serialize + DeserializeOwned {
    fn created_at(&self) -> DateTime<Utc>;
    fn fingerprint(&self) -> &str;
    fn id(&self) -> &str;
    fn owner_id(&self) -> &str;
    fn status(&self) -> RowStatus;
    fn set_status(&mut self, status: RowStatus);
    /// Drop any stale result when a failed row is reopened
    fn clear_result(&mut self);
}

impl OperationRow for TrainingJob {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
    fn status(&self) -> RowStatus {
        self.status
    }
    fn set_status(&mut self, status: RowStatus) {
        self.status = status;
    }
    fn clear_result(&mut self) {
        self.metrics = None;
    }
}

impl OperationRow for PredictionJob {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
    fn status(&self) -> RowStatus {
        self.status
    }
    fn set_status(&mut self, status: RowStatus) {
        self.status = status;
    }
    fn clear_result(&mut self) {
        self.result = None;
    }
}

/// Result of the single charge+apply transaction.
#[derive(Debug)]
pub enum ChargeOutcome<T> {
    /// Tokens debited and the row flipped to `Applied`, both committed
    Applied { balance: u64, record: T },
    /// Balance guard failed; nothing was committed
    InsufficientFunds,
    /// The row was no longer `Pending` (concurrent failure or restart);
    /// nothing was committed
    NotPending,
}

impl Database {
    /// Conditionally insert a `Pending` row for `(owner, fingerprint)`.
    /// Returns the new row id, or None if a row already exists (any status).
    pub fn try_begin<T: OperationRow>(
        &self,
        tables: OpTables,
        row: &T,
    ) -> Result<Option<String>, DatabaseError> {
        debug_assert!(row.status() == RowStatus::Pending, "new rows must be pending");

        let key = op_key(row.owner_id(), row.fingerprint());
        let write_txn = self.begin_write()?;
        let inserted = {
            let mut rows = write_txn.open_table(tables.rows)?;
            if rows.get(key.as_str())?.is_some() {
                false
            } else {
                let data = rmp_serde::to_vec_named(row)?;
                rows.insert(key.as_str(), data.as_slice())?;
                drop(rows);
                let mut ids = write_txn.open_table(tables.ids)?;
                ids.insert(row.id(), key.as_str())?;
                true
            }
        };
        write_txn.commit()?;

        Ok(inserted.then(|| row.id().to_string()))
    }

    /// Fetch the row for `(owner, fingerprint)`, any status
    pub fn get_operation<T: OperationRow>(
        &self,
        tables: OpTables,
        owner_id: &str,
        fingerprint: &str,
    ) -> Result<Option<T>, DatabaseError> {
        let key = op_key(owner_id, fingerprint);
        let read_txn = self.begin_read()?;
        let rows = read_txn.open_table(tables.rows)?;

        match rows.get(key.as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Fetch a row by its id
    pub fn get_operation_by_id<T: OperationRow>(
        &self,
        tables: OpTables,
        id: &str,
    ) -> Result<Option<T>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let ids = read_txn.open_table(tables.ids)?;
        let key = match ids.get(id)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        drop(ids);

        let rows = read_txn.open_table(tables.rows)?;
        match rows.get(key.as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Atomically flip a `Failed` row back to `Pending` so the caller can
    /// reuse its id, clearing any stale result. Returns None if the row is
    /// missing or not `Failed` (a concurrent restart won the race).
    pub fn restart_operation<T: OperationRow>(
        &self,
        tables: OpTables,
        owner_id: &str,
        fingerprint: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let key = op_key(owner_id, fingerprint);
        let write_txn = self.begin_write()?;
        let restarted = {
            let mut rows = write_txn.open_table(tables.rows)?;
            let existing: Option<T> = match rows.get(key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            match existing {
                Some(mut row) if row.status() == RowStatus::Failed => {
                    row.set_status(RowStatus::Pending);
                    row.clear_result();
                    let data = rmp_serde::to_vec_named(&row)?;
                    rows.insert(key.as_str(), data.as_slice())?;
                    Some(row.id().to_string())
                }
                _ => None,
            }
        };
        write_txn.commit()?;
        Ok(restarted)
    }

    /// Mark a row `Failed` regardless of its current status (idempotent).
    /// Returns whether a row with this id existed.
    pub fn mark_operation_failed<T: OperationRow>(
        &self,
        tables: OpTables,
        id: &str,
    ) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let updated = {
            let key = {
                let ids = write_txn.open_table(tables.ids)?;
                let key = ids.get(id)?.map(|v| v.value().to_string());
                key
            };
            match key {
                Some(key) => {
                    let mut rows = write_txn.open_table(tables.rows)?;
                    let row: Option<T> = match rows.get(key.as_str())? {
                        Some(data) => Some(rmp_serde::from_slice(data.value())?),
                        None => None,
                    };
                    match row {
                        Some(mut row) => {
                            row.set_status(RowStatus::Failed);
                            let data = rmp_serde::to_vec_named(&row)?;
                            rows.insert(key.as_str(), data.as_slice())?;
                            true
                        }
                        None => false,
                    }
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    /// In one transaction: debit `cost` tokens from the owner (guarded by
    /// `balance >= cost`) and flip the row `Pending -> Applied`, storing the
    /// result via `apply`. Either both effects commit or neither does.
    pub fn charge_and_apply<T: OperationRow>(
        &self,
        tables: OpTables,
        id: &str,
        owner_id: &str,
        cost: u64,
        apply: impl FnOnce(&mut T),
    ) -> Result<ChargeOutcome<T>, DatabaseError> {
        let write_txn = self.begin_write()?;

        let key = {
            let ids = write_txn.open_table(tables.ids)?;
            let key = ids.get(id)?.map(|v| v.value().to_string());
            key
        };
        let key = match key {
            Some(key) => key,
            None => {
                write_txn.abort()?;
                return Ok(ChargeOutcome::NotPending);
            }
        };

        let row: Option<T> = {
            let rows = write_txn.open_table(tables.rows)?;
            let row = match rows.get(key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            row
        };
        let mut row = match row {
            Some(row) if row.status() == RowStatus::Pending => row,
            _ => {
                write_txn.abort()?;
                return Ok(ChargeOutcome::NotPending);
            }
        };

        let balance = match debit_in_txn(&write_txn, owner_id, cost)? {
            Some(balance) => balance,
            None => {
                write_txn.abort()?;
                return Ok(ChargeOutcome::InsufficientFunds);
            }
        };

        apply(&mut row);
        row.set_status(RowStatus::Applied);
        {
            let mut rows = write_txn.open_table(tables.rows)?;
            let data = rmp_serde::to_vec_named(&row)?;
            rows.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        Ok(ChargeOutcome::Applied { balance, record: row })
    }

    /// All rows for one owner, oldest first
    pub fn list_operations_for<T: OperationRow>(
        &self,
        tables: OpTables,
        owner_id: &str,
    ) -> Result<Vec<T>, DatabaseError> {
        let prefix = format!("{owner_id}/");
        let read_txn = self.begin_read()?;
        let rows = read_txn.open_table(tables.rows)?;

        let mut out: Vec<T> = Vec::new();
        for entry in rows.iter()? {
            let (key, value) = entry?;
            if key.value().starts_with(&prefix) {
                out.push(rmp_serde::from_slice(value.value())?);
            }
        }
        out.sort_by_key(|r| r.created_at());
        Ok(out)
    }

    /// All rows across active owners, oldest first
    pub fn list_operations_all<T: OperationRow>(
        &self,
        tables: OpTables,
    ) -> Result<Vec<T>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let rows = read_txn.open_table(tables.rows)?;
        let users = read_txn.open_table(USERS)?;

        let mut out: Vec<T> = Vec::new();
        for entry in rows.iter()? {
            let (_, value) = entry?;
            let row: T = rmp_serde::from_slice(value.value())?;
            let active = match users.get(row.owner_id())? {
                Some(data) => rmp_serde::from_slice::<User>(data.value())?.is_active,
                None => false,
            };
            if active {
                out.push(row);
            }
        }
        out.sort_by_key(|r| r.created_at());
        Ok(out)
    }

    /// Max `created_at` across rows of active owners, the dataset version
    /// used by version-gated read billing. None if no rows exist.
    pub fn latest_created_at<T: OperationRow>(
        &self,
        tables: OpTables,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let rows: Vec<T> = self.list_operations_all(tables)?;
        Ok(rows.iter().map(|r| r.created_at()).max())
    }

    /// All rows currently in `status` (reconciler scan)
    pub fn operations_with_status<T: OperationRow>(
        &self,
        tables: OpTables,
        status: RowStatus,
    ) -> Result<Vec<T>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let rows = read_txn.open_table(tables.rows)?;

        let mut out: Vec<T> = Vec::new();
        for entry in rows.iter()? {
            let (_, value) = entry?;
            let row: T = rmp_serde::from_slice(value.value())?;
            if row.status() == status {
                out.push(row);
            }
        }
        Ok(out)
    }
}
