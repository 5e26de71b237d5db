use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::predictions::PREDICTIONS_SCOPE;
use super::training::MODELS_SCOPE;
use crate::api::response::{ApiError, JSend};
use crate::auth::{
    authenticate, hash_token, issue_access_token, issue_session, revoke_session_by_token,
    rotate_session,
};
use crate::billing::bump_version;
use crate::storage::models::User;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub created_at: String,
    pub email: String,
    pub id: String,
    pub tokens: u64,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub revoked: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    /// Must be set to deactivate while tokens remain on the balance
    #[serde(default)]
    pub confirm_delete_with_balance: bool,
    pub confirm_password: String,
    pub confirm_username: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteAccountResponse {
    pub deactivated: bool,
    pub sessions_revoked: usize,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<JSend<RegisterResponse>>, ApiError> {
    if req.username.len() < 3 {
        return Err(ApiError::bad_request("Username must be at least 3 characters"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::bad_request("Password must be at least 8 characters"));
    }
    if !req.email.contains('@') {
        return Err(ApiError::bad_request("Invalid email address"));
    }

    let user = User {
        created_at: Utc::now(),
        email: req.email,
        id: Uuid::new_v4().to_string(),
        is_active: true,
        password_hash: hash_token(&req.password),
        tokens: 0,
        username: req.username,
    };
    if !state.db.create_user(&user)? {
        return Err(ApiError::conflict("Username already taken"));
    }

    tracing::info!(user_id = %user.id, username = %user.username, "user_registered");
    Ok(JSend::success(RegisterResponse {
        id: user.id,
        username: user.username,
    }))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<JSend<TokenPairResponse>>, ApiError> {
    let user = authenticate(&state.db, &req.username, &req.password)?;
    let issued = issue_session(&state.db, &state.config.tokens, &user.id)?;
    let access_token = issue_access_token(&state.db, &state.config.tokens, &user.id)?;

    Ok(JSend::success(TokenPairResponse {
        access_token,
        expires_in: state.config.tokens.access_ttl_seconds,
        refresh_token: issued.refresh_token,
        token_type: "bearer",
    }))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<JSend<TokenPairResponse>>, ApiError> {
    let rotated = rotate_session(&state.db, &state.config.tokens, &req.refresh_token)?;
    let access_token = issue_access_token(&state.db, &state.config.tokens, &rotated.session.user_id)?;

    Ok(JSend::success(TokenPairResponse {
        access_token,
        expires_in: state.config.tokens.access_ttl_seconds,
        refresh_token: rotated.refresh_token,
        token_type: "bearer",
    }))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<JSend<LogoutResponse>>, ApiError> {
    revoke_session_by_token(&state.db, &req.refresh_token)?;
    Ok(JSend::success(LogoutResponse { revoked: true }))
}

/// Soft-delete the authenticated account. The caller re-confirms their
/// username and password, and must explicitly acknowledge forfeiting any
/// remaining tokens. The row survives as inactive and the username stays
/// reserved.
pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<DeleteAccountRequest>,
) -> Result<Json<JSend<DeleteAccountResponse>>, ApiError> {
    if req.confirm_username != user.username
        || hash_token(&req.confirm_password) != user.password_hash
    {
        return Err(ApiError::unauthorized("Account confirmation failed"));
    }
    if user.tokens > 0 && !req.confirm_delete_with_balance {
        return Err(ApiError::unprocessable(format!(
            "Account still holds {} tokens; set confirm_delete_with_balance to proceed",
            user.tokens
        )));
    }

    if !state.db.deactivate_user(&user.id)? {
        return Err(ApiError::conflict("Account is already deactivated"));
    }
    let sessions_revoked = state.db.revoke_sessions_for_user(&user.id)?;

    // The account's rows stop counting toward the global dataset versions
    bump_version(&state.cache, MODELS_SCOPE).await;
    bump_version(&state.cache, PREDICTIONS_SCOPE).await;

    tracing::info!(
        user_id = %user.id,
        username = %user.username,
        balance_forfeited = user.tokens,
        sessions_revoked,
        "account_deactivated"
    );
    Ok(JSend::success(DeleteAccountResponse {
        deactivated: true,
        sessions_revoked,
    }))
}

pub async fn me(
    Extension(user): Extension<User>,
) -> Result<Json<JSend<MeResponse>>, ApiError> {
    Ok(JSend::success(MeResponse {
        created_at: user.created_at.to_rfc3339(),
        email: user.email,
        id: user.id,
        tokens: user.tokens,
        username: user.username,
    }))
}
