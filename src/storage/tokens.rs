//! Token balance mutations and the idempotent purchase ledger.
//!
//! Balance updates are conditional writes evaluated inside a single write
//! transaction; there is no read-then-write window for racers to slip
//! through. The purchase ledger is append-only and keyed by
//! `(owner, idempotency_key)`: for a fixed key, exactly one credit is ever
//! applied and every replay observes the recorded outcome.

use chrono::Utc;
use redb::{ReadableTable, WriteTransaction};
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{RowStatus, TokenCredit, User};
use super::tables::*;

/// Purchase ledger composite key
fn credit_key(owner_id: &str, key: &str) -> String {
    format!("{owner_id}/{key}")
}

/// Outcome of attempting to open a pending purchase row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPendingOutcome {
    /// A row for `(owner, key)` already exists; replay path
    DuplicateKey,
    /// This caller owns the key; proceed to credit
    Inserted,
    /// A different purchase for this owner is still pending
    OwnerBusy,
}

/// Conditional debit inside an already-open write transaction.
/// Returns the new balance, or None if the owner is missing, inactive, or
/// the `balance >= cost` guard fails. Writes nothing when the guard fails.
pub(super) fn debit_in_txn(
    txn: &WriteTransaction,
    owner_id: &str,
    cost: u64,
) -> Result<Option<u64>, DatabaseError> {
    let mut users = txn.open_table(USERS)?;
    let user: Option<User> = match users.get(owner_id)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };
    match user {
        Some(mut user) if user.is_active && user.tokens >= cost => {
            user.tokens -= cost;
            let data = rmp_serde::to_vec_named(&user)?;
            users.insert(owner_id, data.as_slice())?;
            Ok(Some(user.tokens))
        }
        _ => Ok(None),
    }
}

impl Database {
    /// Debit `cost` tokens, guarded by `balance >= cost`.
    /// Returns the new balance, or None if the guard failed.
    pub fn debit_tokens(&self, owner_id: &str, cost: u64) -> Result<Option<u64>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let balance = debit_in_txn(&write_txn, owner_id, cost)?;
        write_txn.commit()?;
        Ok(balance)
    }

    /// Credit `amount` tokens, guarded by the zero-balance-before-purchase
    /// policy (`balance == 0`) and the balance cap. Returns the new balance,
    /// or None if either guard failed.
    pub fn credit_tokens_if_zero(
        &self,
        owner_id: &str,
        amount: u64,
        max_balance: u64,
    ) -> Result<Option<u64>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let balance = {
            let mut users = write_txn.open_table(USERS)?;
            let user: Option<User> = match users.get(owner_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            match user {
                Some(mut user) if user.is_active && user.tokens == 0 && amount <= max_balance => {
                    user.tokens = amount;
                    let data = rmp_serde::to_vec_named(&user)?;
                    users.insert(owner_id, data.as_slice())?;
                    Some(user.tokens)
                }
                _ => None,
            }
        };
        write_txn.commit()?;
        Ok(balance)
    }

    // ========================================================================
    // Purchase ledger
    // ========================================================================

    /// Open a `Pending` purchase row for `(owner, key)` exactly once.
    /// At most one purchase per owner may be pending at a time.
    pub fn try_insert_pending_credit(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<InsertPendingOutcome, DatabaseError> {
        let row_key = credit_key(owner_id, key);
        let write_txn = self.begin_write()?;
        let outcome = {
            let mut credits = write_txn.open_table(TOKEN_CREDITS)?;
            if credits.get(row_key.as_str())?.is_some() {
                InsertPendingOutcome::DuplicateKey
            } else {
                let mut pending = write_txn.open_table(PENDING_CREDITS)?;
                if pending.get(owner_id)?.is_some() {
                    InsertPendingOutcome::OwnerBusy
                } else {
                    pending.insert(owner_id, key)?;
                    drop(pending);
                    let row = TokenCredit {
                        created_at: Utc::now(),
                        id: Uuid::new_v4().to_string(),
                        key: key.to_string(),
                        open_balance: None,
                        owner_id: owner_id.to_string(),
                        status: RowStatus::Pending,
                    };
                    let data = rmp_serde::to_vec_named(&row)?;
                    credits.insert(row_key.as_str(), data.as_slice())?;
                    InsertPendingOutcome::Inserted
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Fetch the purchase row for `(owner, key)`, any status
    pub fn get_credit(&self, owner_id: &str, key: &str) -> Result<Option<TokenCredit>, DatabaseError> {
        let row_key = credit_key(owner_id, key);
        let read_txn = self.begin_read()?;
        let credits = read_txn.open_table(TOKEN_CREDITS)?;
        match credits.get(row_key.as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Record a successful credit: status `Applied` plus the balance
    /// snapshot that replays of this key will return verbatim.
    pub fn mark_credit_applied(
        &self,
        owner_id: &str,
        key: &str,
        open_balance: u64,
    ) -> Result<(), DatabaseError> {
        self.finish_credit(owner_id, key, RowStatus::Applied, Some(open_balance))
    }

    /// Record a failed credit (policy violation); replays surface the same
    /// failure.
    pub fn mark_credit_failed(&self, owner_id: &str, key: &str) -> Result<(), DatabaseError> {
        self.finish_credit(owner_id, key, RowStatus::Failed, None)
    }

    fn finish_credit(
        &self,
        owner_id: &str,
        key: &str,
        status: RowStatus,
        open_balance: Option<u64>,
    ) -> Result<(), DatabaseError> {
        let row_key = credit_key(owner_id, key);
        let write_txn = self.begin_write()?;
        {
            let mut credits = write_txn.open_table(TOKEN_CREDITS)?;
            let row: Option<TokenCredit> = match credits.get(row_key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            if let Some(mut row) = row {
                row.status = status;
                row.open_balance = open_balance;
                let data = rmp_serde::to_vec_named(&row)?;
                credits.insert(row_key.as_str(), data.as_slice())?;
            }
            drop(credits);

            // Release the one-pending-per-owner slot
            let mut pending = write_txn.open_table(PENDING_CREDITS)?;
            let held_for = pending.get(owner_id)?.map(|v| v.value().to_string());
            if held_for.as_deref() == Some(key) {
                pending.remove(owner_id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All purchase rows still `Pending` (startup reconcile scan)
    pub fn pending_credits(&self) -> Result<Vec<TokenCredit>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let credits = read_txn.open_table(TOKEN_CREDITS)?;

        let mut out: Vec<TokenCredit> = Vec::new();
        for entry in credits.iter()? {
            let (_, value) = entry?;
            let row: TokenCredit = rmp_serde::from_slice(value.value())?;
            if row.status == RowStatus::Pending {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Purchase history for one owner, oldest first (audit view)
    pub fn token_history(&self, owner_id: &str) -> Result<Vec<TokenCredit>, DatabaseError> {
        let prefix = format!("{owner_id}/");
        let read_txn = self.begin_read()?;
        let credits = read_txn.open_table(TOKEN_CREDITS)?;

        let mut out: Vec<TokenCredit> = Vec::new();
        for entry in credits.iter()? {
            let (key, value) = entry?;
            if key.value().starts_with(&prefix) {
                out.push(rmp_serde::from_slice(value.value())?);
            }
        }
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }
}
