//! Auth session rows and the refresh-hash index.
//!
//! The index maps both the current and the previous refresh hash of a
//! session to its id, so a replayed, already-rotated token still resolves
//! to the session it belonged to; that lookup is what makes reuse
//! detection possible. The lookup and every liveness check run inside the
//! rotation write transaction, so concurrent rotations presenting the same
//! hash serialize: the first one wins, the second finds its hash already
//! superseded and trips reuse detection.

use chrono::{DateTime, Utc};
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{AccessToken, AuthSession};
use super::tables::*;

/// Outcome of a conditional rotation write.
#[derive(Debug, Clone, PartialEq)]
pub enum RotateOutcome {
    /// Session past its hard expiry; revoked by this call
    AbsoluteExpired,
    /// The freshly generated hash collided with an existing one;
    /// the caller retries with a new token
    HashCollision,
    /// The presented hash resolves to no session
    NotFound,
    /// The presented hash was already superseded by a rotation; the
    /// session has been revoked by this call
    Reused { session_id: String },
    /// Session was revoked before this call
    Revoked,
    Rotated(AuthSession),
    /// Sliding window lapsed; the row is left untouched
    SlidingExpired,
}

impl Database {
    /// Store a new session. Returns false (storing nothing) if the session's
    /// refresh hash collides with any hash already in the index.
    pub fn insert_session(&self, session: &AuthSession) -> Result<bool, DatabaseError> {
        debug_assert!(!session.id.is_empty(), "session id must not be empty");
        debug_assert!(
            !session.current_hash.is_empty(),
            "session refresh hash must not be empty"
        );

        let write_txn = self.begin_write()?;
        let inserted = {
            let mut hashes = write_txn.open_table(REFRESH_HASHES)?;
            if hashes.get(session.current_hash.as_str())?.is_some() {
                false
            } else {
                hashes.insert(session.current_hash.as_str(), session.id.as_str())?;
                drop(hashes);
                let mut sessions = write_txn.open_table(AUTH_SESSIONS)?;
                let data = rmp_serde::to_vec_named(session)?;
                sessions.insert(session.id.as_str(), data.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Get a session by id
    pub fn get_session(&self, session_id: &str) -> Result<Option<AuthSession>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let sessions = read_txn.open_table(AUTH_SESSIONS)?;
        match sessions.get(session_id)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Resolve a presented refresh hash (current or previous) to its session
    pub fn get_session_by_refresh_hash(
        &self,
        hash: &str,
    ) -> Result<Option<AuthSession>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let hashes = read_txn.open_table(REFRESH_HASHES)?;
        let session_id = match hashes.get(hash)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        drop(hashes);

        let sessions = read_txn.open_table(AUTH_SESSIONS)?;
        match sessions.get(session_id.as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Exchange the presented refresh hash for `new_hash` in one
    /// transaction: resolve the hash, re-check revocation, both expiries,
    /// and the current-vs-previous position, then move the current hash
    /// into "previous" and extend the sliding expiry. The mapping for the
    /// superseded previous hash (if any) is dropped; the old current hash
    /// stays indexed so its reuse can be detected. Reuse and absolute
    /// expiry revoke the session within the same transaction.
    pub fn rotate_session(
        &self,
        presented_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, DatabaseError> {
        let write_txn = self.begin_write()?;
        let outcome = {
            let mut hashes = write_txn.open_table(REFRESH_HASHES)?;
            let mut sessions = write_txn.open_table(AUTH_SESSIONS)?;

            let session_id = hashes.get(presented_hash)?.map(|v| v.value().to_string());
            let session: Option<(String, AuthSession)> = match session_id {
                Some(id) => {
                    let row = sessions.get(id.as_str())?.map(|data| data.value().to_vec());
                    match row {
                        Some(data) => Some((id, rmp_serde::from_slice(&data)?)),
                        None => None,
                    }
                }
                None => None,
            };

            match session {
                None => RotateOutcome::NotFound,
                Some((session_id, mut session)) => {
                    if session.revoked {
                        RotateOutcome::Revoked
                    } else if session.absolute_expires_at <= now {
                        session.revoked = true;
                        let data = rmp_serde::to_vec_named(&session)?;
                        sessions.insert(session_id.as_str(), data.as_slice())?;
                        RotateOutcome::AbsoluteExpired
                    } else if session.expires_at <= now {
                        RotateOutcome::SlidingExpired
                    } else if session.previous_hash.as_deref() == Some(presented_hash) {
                        // Spent token replayed; kill the whole session
                        session.revoked = true;
                        let data = rmp_serde::to_vec_named(&session)?;
                        sessions.insert(session_id.as_str(), data.as_slice())?;
                        RotateOutcome::Reused { session_id }
                    } else {
                        // The presented hash is the live current one
                        let collision = hashes.get(new_hash)?.is_some();
                        if collision {
                            RotateOutcome::HashCollision
                        } else {
                            if let Some(old_previous) = session.previous_hash.take() {
                                hashes.remove(old_previous.as_str())?;
                            }
                            session.previous_hash = Some(session.current_hash.clone());
                            session.current_hash = new_hash.to_string();
                            session.expires_at = new_expires_at;

                            hashes.insert(new_hash, session_id.as_str())?;
                            let data = rmp_serde::to_vec_named(&session)?;
                            sessions.insert(session_id.as_str(), data.as_slice())?;
                            RotateOutcome::Rotated(session)
                        }
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Set the revoked flag on a session (kept for audit, never deleted).
    /// Returns whether the session existed.
    pub fn revoke_session(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let revoked = {
            let mut sessions = write_txn.open_table(AUTH_SESSIONS)?;
            let session: Option<AuthSession> = match sessions.get(session_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            match session {
                Some(mut session) => {
                    session.revoked = true;
                    let data = rmp_serde::to_vec_named(&session)?;
                    sessions.insert(session_id, data.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(revoked)
    }

    /// Revoke every session belonging to `user_id` (account deactivation).
    /// Returns how many were still live.
    pub fn revoke_sessions_for_user(&self, user_id: &str) -> Result<usize, DatabaseError> {
        let write_txn = self.begin_write()?;
        let revoked = {
            let mut sessions = write_txn.open_table(AUTH_SESSIONS)?;

            let mut live: Vec<AuthSession> = Vec::new();
            for entry in sessions.iter()? {
                let (_, value) = entry?;
                let session: AuthSession = rmp_serde::from_slice(value.value())?;
                if session.user_id == user_id && !session.revoked {
                    live.push(session);
                }
            }

            let count = live.len();
            for mut session in live {
                session.revoked = true;
                let data = rmp_serde::to_vec_named(&session)?;
                sessions.insert(session.id.as_str(), data.as_slice())?;
            }
            count
        };
        write_txn.commit()?;
        Ok(revoked)
    }

    // ========================================================================
    // Access tokens
    // ========================================================================

    /// Store an access token under its hash
    pub fn put_access_token(&self, hash: &str, token: &AccessToken) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCESS_TOKENS)?;
            let data = rmp_serde::to_vec_named(token)?;
            table.insert(hash, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get an access token by hash
    pub fn get_access_token(&self, hash: &str) -> Result<Option<AccessToken>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ACCESS_TOKENS)?;
        match table.get(hash)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Delete an access token by hash
    pub fn delete_access_token(&self, hash: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(ACCESS_TOKENS)?;
            let deleted = table.remove(hash)?.is_some();
            deleted
        };
        write_txn.commit()?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_auth_session, setup_db};

    fn rotate(db: &Database, presented: &str, new_hash: &str) -> RotateOutcome {
        let now = Utc::now();
        db.rotate_session(presented, new_hash, now + chrono::Duration::hours(1), now)
            .unwrap()
    }

    #[test]
    fn test_rotation_keeps_previous_hash_resolvable() {
        let (db, _temp) = setup_db();

        let session = make_auth_session("s1", "u1", "hash-a");
        assert!(db.insert_session(&session).unwrap());
        assert!(matches!(rotate(&db, "hash-a", "hash-b"), RotateOutcome::Rotated(_)));

        // Both the new current and the superseded hash resolve to s1
        let by_new = db.get_session_by_refresh_hash("hash-b").unwrap().unwrap();
        assert_eq!(by_new.current_hash, "hash-b");
        assert_eq!(by_new.previous_hash.as_deref(), Some("hash-a"));
        assert!(db.get_session_by_refresh_hash("hash-a").unwrap().is_some());

        // A second rotation drops the oldest link of the chain
        assert!(matches!(rotate(&db, "hash-b", "hash-c"), RotateOutcome::Rotated(_)));
        assert!(db.get_session_by_refresh_hash("hash-a").unwrap().is_none());
        assert!(db.get_session_by_refresh_hash("hash-b").unwrap().is_some());
        assert!(matches!(rotate(&db, "hash-a", "hash-d"), RotateOutcome::NotFound));
    }

    #[test]
    fn test_rotation_detects_hash_collision() {
        let (db, _temp) = setup_db();

        db.insert_session(&make_auth_session("s1", "u1", "hash-a")).unwrap();
        db.insert_session(&make_auth_session("s2", "u2", "hash-x")).unwrap();

        // A duplicate session hash is refused outright
        assert!(!db.insert_session(&make_auth_session("s3", "u3", "hash-a")).unwrap());

        assert!(matches!(
            rotate(&db, "hash-a", "hash-x"),
            RotateOutcome::HashCollision
        ));
        // Session unchanged after the collision
        let session = db.get_session("s1").unwrap().unwrap();
        assert_eq!(session.current_hash, "hash-a");
    }

    #[test]
    fn test_spent_hash_presented_again_trips_reuse() {
        let (db, _temp) = setup_db();
        db.insert_session(&make_auth_session("s1", "u1", "hash-a")).unwrap();

        assert!(matches!(rotate(&db, "hash-a", "hash-b"), RotateOutcome::Rotated(_)));

        // Replaying the spent hash is caught inside the write transaction
        // and revokes the session
        assert!(matches!(
            rotate(&db, "hash-a", "hash-c"),
            RotateOutcome::Reused { .. }
        ));
        assert!(db.get_session("s1").unwrap().unwrap().revoked);

        // The holder of the live hash is locked out too
        assert!(matches!(rotate(&db, "hash-b", "hash-d"), RotateOutcome::Revoked));
    }

    #[test]
    fn test_racing_rotations_of_one_hash_rotate_once() {
        let (db, _temp) = setup_db();
        db.insert_session(&make_auth_session("s1", "u1", "hash-a")).unwrap();

        // Two clients present the same token concurrently; the liveness
        // checks run inside the rotation write, so exactly one wins and the
        // loser revokes the session
        let mut threads = Vec::new();
        for new_hash in ["hash-b", "hash-c"] {
            let db = db.clone();
            threads.push(std::thread::spawn(move || rotate(&db, "hash-a", new_hash)));
        }
        let outcomes: Vec<RotateOutcome> =
            threads.into_iter().map(|t| t.join().unwrap()).collect();

        let rotations = outcomes
            .iter()
            .filter(|o| matches!(o, RotateOutcome::Rotated(_)))
            .count();
        assert_eq!(rotations, 1);
        assert!(outcomes.iter().any(|o| matches!(o, RotateOutcome::Reused { .. })));
        assert!(db.get_session("s1").unwrap().unwrap().revoked);
    }

    #[test]
    fn test_revoke_keeps_row() {
        let (db, _temp) = setup_db();

        db.insert_session(&make_auth_session("s1", "u1", "hash-a")).unwrap();
        assert!(db.revoke_session("s1").unwrap());

        let session = db.get_session("s1").unwrap().unwrap();
        assert!(session.revoked);
        // Still resolvable by hash (revoked, not deleted)
        assert!(db.get_session_by_refresh_hash("hash-a").unwrap().is_some());
    }

    #[test]
    fn test_revoke_all_for_user_spares_others() {
        let (db, _temp) = setup_db();

        db.insert_session(&make_auth_session("s1", "u1", "hash-a")).unwrap();
        db.insert_session(&make_auth_session("s2", "u1", "hash-b")).unwrap();
        db.insert_session(&make_auth_session("s3", "u2", "hash-c")).unwrap();

        assert_eq!(db.revoke_sessions_for_user("u1").unwrap(), 2);
        assert!(db.get_session("s1").unwrap().unwrap().revoked);
        assert!(db.get_session("s2").unwrap().unwrap().revoked);
        assert!(!db.get_session("s3").unwrap().unwrap().revoked);

        // Idempotent: nothing left to revoke
        assert_eq!(db.revoke_sessions_for_user("u1").unwrap(), 0);
    }
}
