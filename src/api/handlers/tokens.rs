use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, JSend};
use crate::billing::buy_tokens;
use crate::storage::models::{RowStatus, User};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub amount: u64,
    /// Client-supplied idempotency key; retries must reuse it
    pub idempotency_key: String,
}

#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    pub balance: u64,
    pub credited: bool,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: u64,
}

#[derive(Debug, Serialize)]
pub struct CreditResponse {
    pub created_at: String,
    pub key: String,
    pub open_balance: Option<u64>,
    pub status: RowStatus,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn purchase(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<PurchaseRequest>,
) -> Result<Json<JSend<PurchaseResponse>>, ApiError> {
    if req.idempotency_key.trim().is_empty() {
        return Err(ApiError::bad_request("Idempotency key is required"));
    }
    if req.amount == 0 || req.amount > state.config.tokens.max_purchase_amount {
        return Err(ApiError::unprocessable(format!(
            "Amount must be between 1 and {}",
            state.config.tokens.max_purchase_amount
        )));
    }

    let receipt = buy_tokens(
        &state.db,
        &user.id,
        req.idempotency_key.trim(),
        req.amount,
        state.config.tokens.max_balance,
    )?;

    Ok(JSend::success(PurchaseResponse {
        balance: receipt.balance,
        credited: receipt.credited,
    }))
}

pub async fn balance(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<JSend<BalanceResponse>>, ApiError> {
    let balance = state
        .db
        .get_tokens(&user.id)?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(JSend::success(BalanceResponse { balance }))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<JSend<Vec<CreditResponse>>>, ApiError> {
    let credits = state
        .db
        .token_history(&user.id)?
        .into_iter()
        .map(|c| CreditResponse {
            created_at: c.created_at.to_rfc3339(),
            key: c.key,
            open_balance: c.open_balance,
            status: c.status,
        })
        .collect();
    Ok(JSend::success(credits))
}
