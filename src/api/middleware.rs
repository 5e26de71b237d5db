//! Bearer-token authentication middleware.
//!
//! Applied to every route that reads or spends tokens. Resolves the access
//! token to its active user and stashes the user in request extensions for
//! the handler.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::response::ApiError;
use crate::auth::validate_access_token;
use crate::AppState;

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let token = match token {
        Some(token) => token,
        None => return ApiError::unauthorized("Missing bearer token").into_response(),
    };

    match validate_access_token(&state.db, token) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
