use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::middleware::require_auth;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Routes behind bearer-token auth -- everything that reads or spends
    // tokens
    let protected_routes = Router::new()
        .route(
            "/auth/me",
            get(handlers::auth::me).delete(handlers::auth::delete_account),
        )
        .route("/models", get(handlers::training::list_models))
        .route("/models/all", get(handlers::training::list_all_models))
        .route("/models/train", post(handlers::training::train_model))
        .route("/models/:id", get(handlers::training::get_model))
        .route(
            "/predictions",
            get(handlers::predictions::list_predictions).post(handlers::predictions::predict),
        )
        .route("/predictions/all", get(handlers::predictions::list_all_predictions))
        .route("/predictions/:id", get(handlers::predictions::get_prediction))
        .route("/tokens/balance", get(handlers::tokens::balance))
        .route("/tokens/history", get(handlers::tokens::history))
        .route("/tokens/purchase", post(handlers::tokens::purchase))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ));

    let public_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/register", post(handlers::auth::register))
        .route("/_internal/health", get(handlers::health));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
