use std::path::Path;
use std::sync::Arc;

use redb::{Database as RedbDatabase, ReadTransaction, ReadableTable, WriteTransaction};
use thiserror::Error;

use super::models::User;
use super::tables::*;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
}

/// Handle to the embedded database. Cheap to clone; writers are serialized
/// by redb, so every conditional mutation performed inside a single write
/// transaction is atomic at the storage layer.
#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("modelmint.redb");
        let db = RedbDatabase::create(db_path)?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(USERNAMES)?;
            let _ = write_txn.open_table(TRAINING_JOBS)?;
            let _ = write_txn.open_table(TRAINING_JOB_IDS)?;
            let _ = write_txn.open_table(PREDICTIONS)?;
            let _ = write_txn.open_table(PREDICTION_IDS)?;
            let _ = write_txn.open_table(TOKEN_CREDITS)?;
            let _ = write_txn.open_table(PENDING_CREDITS)?;
            let _ = write_txn.open_table(AUTH_SESSIONS)?;
            let _ = write_txn.open_table(REFRESH_HASHES)?;
            let _ = write_txn.open_table(ACCESS_TOKENS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    // ========================================================================
    // User operations
    // ========================================================================

    /// Store a new user. Returns false (and stores nothing) if the username
    /// is already taken by an active user.
    pub fn create_user(&self, user: &User) -> Result<bool, DatabaseError> {
        debug_assert!(!user.id.is_empty(), "user id must not be empty");
        debug_assert!(!user.username.is_empty(), "username must not be empty");

        let write_txn = self.begin_write()?;
        let inserted = {
            let mut names = write_txn.open_table(USERNAMES)?;
            if names.get(user.username.as_str())?.is_some() {
                false
            } else {
                names.insert(user.username.as_str(), user.id.as_str())?;
                drop(names);
                let mut table = write_txn.open_table(USERS)?;
                let data = rmp_serde::to_vec_named(user)?;
                table.insert(user.id.as_str(), data.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Get a user by id
    pub fn get_user(&self, user_id: &str) -> Result<Option<User>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        match table.get(user_id)? {
            Some(data) => {
                let user: User = rmp_serde::from_slice(data.value())?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Get an active user by username
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let names = read_txn.open_table(USERNAMES)?;

        let user_id = match names.get(username)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        drop(names);

        let table = read_txn.open_table(USERS)?;
        match table.get(user_id.as_str())? {
            Some(data) => {
                let user: User = rmp_serde::from_slice(data.value())?;
                Ok(if user.is_active { Some(user) } else { None })
            }
            None => Ok(None),
        }
    }

    /// Soft-delete: flip `is_active` to false. Returns false if the user is
    /// unknown or already deactivated. The username stays reserved.
    pub fn deactivate_user(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deactivated = {
            let mut table = write_txn.open_table(USERS)?;
            let user: Option<User> = match table.get(user_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            match user {
                Some(mut user) if user.is_active => {
                    user.is_active = false;
                    let data = rmp_serde::to_vec_named(&user)?;
                    table.insert(user_id, data.as_slice())?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        Ok(deactivated)
    }

    /// Current token balance for an owner, or None if the owner is unknown
    pub fn get_tokens(&self, user_id: &str) -> Result<Option<u64>, DatabaseError> {
        Ok(self.get_user(user_id)?.map(|u| u.tokens))
    }
}
