pub mod auth;
pub mod predictions;
pub mod tokens;
pub mod training;

use axum::Json;
use serde::Serialize;

use super::response::JSend;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
