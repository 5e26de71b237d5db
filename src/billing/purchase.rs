//! Idempotent token purchases.
//!
//! Each purchase carries a client-supplied idempotency key. The ledger row
//! for `(owner, key)` is the single source of truth: the first submission
//! settles it (applied or failed), every later submission with the same key
//! replays the recorded outcome without touching the balance.

use thiserror::Error;
use tracing::info;

use crate::storage::models::RowStatus;
use crate::storage::{Database, DatabaseError, InsertPendingOutcome};

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// Another purchase for this owner (or this key) is still settling
    #[error("a purchase is already in progress")]
    InProgress,
    /// The zero-balance-before-purchase policy or the balance cap rejected
    /// the credit; replays of the same key report the same rejection
    #[error("tokens can only be purchased at zero balance")]
    NonZeroBalance,
}

#[derive(Debug)]
pub struct PurchaseReceipt {
    pub balance: u64,
    /// False when this call replayed an already-settled key
    pub credited: bool,
}

/// Credit `amount` tokens to `owner_id` exactly once per idempotency key.
///
/// The credit itself is guarded by the zero-balance policy and the balance
/// cap; a guard rejection is recorded on the ledger row so the key stays
/// burned.
pub fn buy_tokens(
    db: &Database,
    owner_id: &str,
    key: &str,
    amount: u64,
    max_balance: u64,
) -> Result<PurchaseReceipt, PurchaseError> {
    match db.try_insert_pending_credit(owner_id, key)? {
        InsertPendingOutcome::Inserted => {}
        InsertPendingOutcome::OwnerBusy => return Err(PurchaseError::InProgress),
        InsertPendingOutcome::DuplicateKey => {
            let row = db.get_credit(owner_id, key)?.ok_or(PurchaseError::InProgress)?;
            return match row.status {
                RowStatus::Applied => {
                    info!(owner_id = %owner_id, key = %key, "Purchase replayed from ledger");
                    Ok(PurchaseReceipt {
                        // Settled rows always carry the snapshot
                        balance: row.open_balance.unwrap_or(0),
                        credited: false,
                    })
                }
                RowStatus::Failed => Err(PurchaseError::NonZeroBalance),
                RowStatus::Pending => Err(PurchaseError::InProgress),
            };
        }
    }

    match db.credit_tokens_if_zero(owner_id, amount, max_balance)? {
        Some(balance) => {
            db.mark_credit_applied(owner_id, key, balance)?;
            info!(owner_id = %owner_id, key = %key, amount, balance, "tokens_credited");
            Ok(PurchaseReceipt { balance, credited: true })
        }
        None => {
            db.mark_credit_failed(owner_id, key)?;
            Err(PurchaseError::NonZeroBalance)
        }
    }
}
