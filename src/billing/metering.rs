//! Version-gated read billing.
//!
//! Listing a collection is billable, but only once per dataset version.
//! The version of a scope is the max `created_at` across its rows (active
//! owners only); a per-user cache marker records the last version the user
//! paid to read. Reads at an already-paid version are free. Cache loss is
//! safe: the version is re-derived from storage and the next read simply
//! pays again.

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::CacheClient;
use crate::storage::{Database, DatabaseError, OpTables, OperationRow};

#[derive(Debug, Error)]
pub enum MeterError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("insufficient token balance")]
    InsufficientFunds,
}

/// A billable read: the scope names the collection (for example
/// `"training_jobs"`), the cost is the metadata price.
#[derive(Clone, Copy)]
pub struct MeterAction<'a> {
    pub cost: u64,
    pub scope: &'a str,
}

#[derive(Debug)]
pub struct MeterOutcome {
    /// Balance after the debit; None on the free path
    pub balance: Option<u64>,
    pub charged: bool,
}

/// Memoized list payload for a scope
pub fn list_cache_key(scope: &str) -> String {
    format!("{scope}:list")
}

fn version_key(scope: &str) -> String {
    format!("{scope}:version")
}

fn last_seen_key(scope: &str, owner_id: &str) -> String {
    format!("{scope}:last_seen:{owner_id}")
}

/// Current dataset version of a scope: max `created_at` across rows of
/// active owners, RFC 3339. Cached until the next write bumps the scope.
pub async fn scope_version<T: OperationRow>(
    db: &Database,
    cache: &CacheClient,
    scope: &str,
    tables: OpTables,
) -> Result<String, MeterError> {
    if let Some(version) = cache.get(&version_key(scope)).await {
        return Ok(version);
    }
    let version = db
        .latest_created_at::<T>(tables)?
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "empty".to_string());
    cache.set(&version_key(scope), version.clone()).await;
    Ok(version)
}

/// Debit the metadata cost unless `owner_id` already paid for `version` of
/// `action.scope`. The paid marker is written only after a successful
/// debit.
pub async fn charge_once_per_version(
    db: &Database,
    cache: &CacheClient,
    action: MeterAction<'_>,
    owner_id: &str,
    version: &str,
) -> Result<MeterOutcome, MeterError> {
    let seen = cache.get(&last_seen_key(action.scope, owner_id)).await;
    if seen.as_deref() == Some(version) {
        debug!(scope = %action.scope, owner_id = %owner_id, "Read at paid version, no charge");
        return Ok(MeterOutcome { balance: None, charged: false });
    }

    let balance = db
        .debit_tokens(owner_id, action.cost)?
        .ok_or(MeterError::InsufficientFunds)?;
    cache
        .set(&last_seen_key(action.scope, owner_id), version)
        .await;
    info!(
        scope = %action.scope,
        owner_id = %owner_id,
        charged = action.cost,
        balance_after = balance,
        "metadata_read_charged"
    );
    Ok(MeterOutcome { balance: Some(balance), charged: true })
}

/// Invalidate a scope after a write: drop the cached version (re-derived
/// from storage on the next read) and the memoized list.
pub async fn bump_version(cache: &CacheClient, scope: &str) {
    cache.delete(&version_key(scope)).await;
    cache.delete(&list_cache_key(scope)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::TrainingJob;
    use crate::storage::TRAINING;
    use crate::testutil::{make_training_job, make_user, setup_db};

    const LIST_JOBS: MeterAction<'_> = MeterAction { cost: 1, scope: "training_jobs" };

    async fn version(db: &Database, cache: &CacheClient) -> String {
        scope_version::<TrainingJob>(db, cache, "training_jobs", TRAINING)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_version_tracks_latest_row() {
        let (db, _temp) = setup_db();
        let cache = CacheClient::new();
        db.create_user(&make_user("u1", 10)).unwrap();

        assert_eq!(version(&db, &cache).await, "empty");

        db.try_begin(TRAINING, &make_training_job("j1", "u1", "fp-1")).unwrap();
        // Cached until bumped
        assert_eq!(version(&db, &cache).await, "empty");
        bump_version(&cache, "training_jobs").await;
        assert_ne!(version(&db, &cache).await, "empty");
    }

    #[tokio::test]
    async fn test_charges_once_per_version() {
        let (db, _temp) = setup_db();
        let cache = CacheClient::new();
        db.create_user(&make_user("u1", 10)).unwrap();

        let v = version(&db, &cache).await;
        let first = charge_once_per_version(&db, &cache, LIST_JOBS, "u1", &v).await.unwrap();
        assert!(first.charged);
        assert_eq!(first.balance, Some(9));

        // Same version: free
        let second = charge_once_per_version(&db, &cache, LIST_JOBS, "u1", &v).await.unwrap();
        assert!(!second.charged);
        assert_eq!(db.get_tokens("u1").unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_new_version_charges_again() {
        let (db, _temp) = setup_db();
        let cache = CacheClient::new();
        db.create_user(&make_user("u1", 10)).unwrap();

        let v = version(&db, &cache).await;
        charge_once_per_version(&db, &cache, LIST_JOBS, "u1", &v).await.unwrap();
        cache.set(&list_cache_key("training_jobs"), "[]").await;

        db.try_begin(TRAINING, &make_training_job("j1", "u1", "fp-1")).unwrap();
        bump_version(&cache, "training_jobs").await;
        assert!(cache.get(&list_cache_key("training_jobs")).await.is_none());

        let v2 = version(&db, &cache).await;
        assert_ne!(v, v2);
        let again = charge_once_per_version(&db, &cache, LIST_JOBS, "u1", &v2).await.unwrap();
        assert!(again.charged);
        assert_eq!(db.get_tokens("u1").unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_marker_unpaid() {
        let (db, _temp) = setup_db();
        let cache = CacheClient::new();
        db.create_user(&make_user("u1", 0)).unwrap();

        let v = version(&db, &cache).await;
        let err = charge_once_per_version(&db, &cache, LIST_JOBS, "u1", &v)
            .await
            .unwrap_err();
        assert!(matches!(err, MeterError::InsufficientFunds));

        // Still unpaid after a top-up, so the next read charges
        db.credit_tokens_if_zero("u1", 5, 1000).unwrap();
        let outcome = charge_once_per_version(&db, &cache, LIST_JOBS, "u1", &v).await.unwrap();
        assert!(outcome.charged);
        assert_eq!(outcome.balance, Some(4));
    }

    #[tokio::test]
    async fn test_markers_are_per_user() {
        let (db, _temp) = setup_db();
        let cache = CacheClient::new();
        db.create_user(&make_user("u1", 10)).unwrap();
        db.create_user(&make_user("u2", 10)).unwrap();

        let v = version(&db, &cache).await;
        charge_once_per_version(&db, &cache, LIST_JOBS, "u1", &v).await.unwrap();
        let other = charge_once_per_version(&db, &cache, LIST_JOBS, "u2", &v).await.unwrap();
        assert!(other.charged);
    }
}
