//! Session lifecycle: login, refresh-token rotation, reuse detection, and
//! access-token validation.
//!
//! A session accepts exactly one refresh hash at a time. Rotation moves the
//! accepted hash into the previous slot and installs a new one, so the
//! index resolves both links of the chain. Presenting the previous hash
//! means that token was already spent, someone is replaying it, and the
//! whole session is revoked on the spot.

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::generator::{generate_token, hash_token};
use crate::config::TokenConfig;
use crate::storage::models::{AccessToken, AuthSession, User};
use crate::storage::{Database, DatabaseError, RotateOutcome};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("token expired")]
    ExpiredToken,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid token")]
    InvalidToken,
    /// An already-rotated refresh token was presented; the session has been
    /// revoked
    #[error("refresh token reuse detected")]
    ReusedToken,
    /// Could not mint a non-colliding token within the retry budget
    #[error("token generation failed")]
    TokenGeneration,
}

/// A freshly issued or rotated session, with the plaintext refresh token
/// that is returned to the client exactly once.
#[derive(Debug)]
pub struct IssuedSession {
    pub refresh_token: String,
    pub session: AuthSession,
}

/// Verify a username/password pair against the stored digest.
pub fn authenticate(db: &Database, username: &str, password: &str) -> Result<User, AuthError> {
    let user = db
        .get_user_by_username(username)?
        .ok_or(AuthError::InvalidCredentials)?;
    if hash_token(password) != user.password_hash {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(user)
}

/// Open a new session for `user_id`, retrying token generation on the
/// (astronomically unlikely) hash collision up to the configured budget.
pub fn issue_session(
    db: &Database,
    cfg: &TokenConfig,
    user_id: &str,
) -> Result<IssuedSession, AuthError> {
    let now = Utc::now();
    for _ in 0..cfg.max_token_generation_retries {
        let refresh_token = generate_token();
        let session = AuthSession {
            absolute_expires_at: now + Duration::seconds(cfg.refresh_absolute_ttl_seconds as i64),
            created_at: now,
            current_hash: hash_token(&refresh_token),
            expires_at: now + Duration::seconds(cfg.refresh_ttl_seconds as i64),
            id: Uuid::new_v4().to_string(),
            previous_hash: None,
            revoked: false,
            user_id: user_id.to_string(),
        };
        if db.insert_session(&session)? {
            info!(session_id = %session.id, user_id = %user_id, "session_issued");
            return Ok(IssuedSession { refresh_token, session });
        }
        warn!(user_id = %user_id, "Refresh hash collision on issue, regenerating");
    }
    Err(AuthError::TokenGeneration)
}

/// Exchange a refresh token for a rotated one.
///
/// The hash lookup, the revoked/expiry checks, and the reuse check all run
/// inside the rotation write transaction, so two concurrent presentations
/// of the same token serialize: the first rotates, the second trips reuse
/// detection and the session is revoked. Reuse and absolute expiry revoke
/// before reporting.
pub fn rotate_session(
    db: &Database,
    cfg: &TokenConfig,
    refresh_token: &str,
) -> Result<IssuedSession, AuthError> {
    let presented = hash_token(refresh_token);
    let now = Utc::now();

    for _ in 0..cfg.max_token_generation_retries {
        let refresh_token = generate_token();
        let new_hash = hash_token(&refresh_token);
        let new_expires_at = now + Duration::seconds(cfg.refresh_ttl_seconds as i64);
        match db.rotate_session(&presented, &new_hash, new_expires_at, now)? {
            RotateOutcome::Rotated(session) => {
                info!(session_id = %session.id, "session_rotated");
                return Ok(IssuedSession { refresh_token, session });
            }
            RotateOutcome::NotFound => return Err(AuthError::InvalidToken),
            RotateOutcome::Revoked => return Err(AuthError::ReusedToken),
            RotateOutcome::AbsoluteExpired | RotateOutcome::SlidingExpired => {
                return Err(AuthError::ExpiredToken)
            }
            RotateOutcome::Reused { session_id } => {
                warn!(session_id = %session_id, "refresh_token_reuse_detected");
                return Err(AuthError::ReusedToken);
            }
            RotateOutcome::HashCollision => {
                warn!("Refresh hash collision on rotate, regenerating");
            }
        }
    }
    Err(AuthError::TokenGeneration)
}

/// Logout: revoke the session a refresh token belongs to. Unknown tokens
/// report invalid rather than leaking whether they ever existed.
pub fn revoke_session_by_token(db: &Database, refresh_token: &str) -> Result<(), AuthError> {
    let session = db
        .get_session_by_refresh_hash(&hash_token(refresh_token))?
        .ok_or(AuthError::InvalidToken)?;
    db.revoke_session(&session.id)?;
    info!(session_id = %session.id, "session_revoked");
    Ok(())
}

/// Mint a short-lived access token for `user_id`.
pub fn issue_access_token(
    db: &Database,
    cfg: &TokenConfig,
    user_id: &str,
) -> Result<String, AuthError> {
    let token = generate_token();
    let record = AccessToken {
        expires_at: Utc::now() + Duration::seconds(cfg.access_ttl_seconds as i64),
        user_id: user_id.to_string(),
    };
    db.put_access_token(&hash_token(&token), &record)?;
    Ok(token)
}

/// Resolve a bearer access token to its active user. Expired tokens are
/// deleted as they are encountered.
pub fn validate_access_token(db: &Database, token: &str) -> Result<User, AuthError> {
    let hash = hash_token(token);
    let record = db.get_access_token(&hash)?.ok_or(AuthError::InvalidToken)?;
    if record.expires_at <= Utc::now() {
        db.delete_access_token(&hash)?;
        return Err(AuthError::ExpiredToken);
    }
    let user = db.get_user(&record.user_id)?.ok_or(AuthError::InvalidToken)?;
    if !user.is_active {
        return Err(AuthError::InvalidToken);
    }
    Ok(user)
}
