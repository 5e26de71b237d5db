use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::response::{ApiError, JSend};
use crate::billing::{
    bump_version, charge_once_per_version, list_cache_key, scope_version, MeterAction,
};
use crate::fingerprint::prediction_fingerprint;
use crate::ops::prediction::load_model_for_owner;
use crate::ops::run_prediction;
use crate::storage::models::{PredictionJob, RowStatus, User};
use crate::storage::PREDICTION;
use crate::AppState;

/// Metering scope for prediction listings
pub const PREDICTIONS_SCOPE: &str = "predictions";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub input: BTreeMap<String, serde_json::Value>,
    pub model_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub created_at: String,
    pub fingerprint: String,
    pub id: String,
    pub input: BTreeMap<String, serde_json::Value>,
    pub model_id: String,
    pub result: Option<String>,
    pub status: RowStatus,
}

impl From<PredictionJob> for PredictionResponse {
    fn from(job: PredictionJob) -> Self {
        Self {
            created_at: job.created_at.to_rfc3339(),
            fingerprint: job.fingerprint,
            id: job.id,
            input: job.input,
            model_id: job.model_id,
            result: job.result,
            status: job.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PredictOutcomeResponse {
    pub balance: u64,
    pub charged: bool,
    pub prediction: PredictionResponse,
}

#[derive(Debug, Serialize)]
pub struct ListPredictionsResponse {
    pub balance: Option<u64>,
    pub charged: bool,
    pub predictions: Vec<PredictionResponse>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn predict(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<JSend<PredictOutcomeResponse>>, ApiError> {
    let model = load_model_for_owner(&state.db, &user.id, &req.model_id)?;

    // The input must cover the trained feature set exactly
    for feature in &model.features {
        if !req.input.contains_key(feature) {
            return Err(ApiError::unprocessable(format!("Missing feature '{feature}'")));
        }
    }
    for key in req.input.keys() {
        if !model.features.contains(key) {
            return Err(ApiError::unprocessable(format!("Unknown feature '{key}'")));
        }
    }

    let fingerprint = prediction_fingerprint(&req.model_id, &req.input);
    let job = PredictionJob {
        created_at: Utc::now(),
        fingerprint,
        id: Uuid::new_v4().to_string(),
        input: req.input.clone(),
        model_id: req.model_id.clone(),
        model_type: model.model_type.clone(),
        owner_id: user.id.clone(),
        result: None,
        status: RowStatus::Pending,
    };

    // Inputs are handed to the worker in training order
    let ordered_inputs: Vec<(String, serde_json::Value)> = model
        .features
        .iter()
        .map(|f| (f.clone(), req.input[f].clone()))
        .collect();
    let predictor = Arc::clone(&state.predictor);
    let artifact = PathBuf::from(model.model_path);
    let model_type = model.model_type;
    let timeout = Duration::from_secs(state.config.compute.prediction_timeout_seconds);

    let outcome = run_prediction(
        state.db.clone(),
        state.config.costs.prediction,
        timeout,
        job,
        move || predictor.predict(&artifact, &model_type, &ordered_inputs, timeout),
    )
    .await?;

    if outcome.charged {
        bump_version(&state.cache, PREDICTIONS_SCOPE).await;
    }

    Ok(JSend::success(PredictOutcomeResponse {
        balance: outcome.balance,
        charged: outcome.charged,
        prediction: outcome.job.into(),
    }))
}

pub async fn list_predictions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<JSend<ListPredictionsResponse>>, ApiError> {
    let meter = meter_predictions_read(&state, &user.id).await?;
    let predictions = state
        .db
        .list_operations_for::<PredictionJob>(PREDICTION, &user.id)?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(JSend::success(ListPredictionsResponse {
        balance: meter.balance,
        charged: meter.charged,
        predictions,
    }))
}

/// All predictions across active owners, memoized per dataset version.
pub async fn list_all_predictions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<JSend<ListPredictionsResponse>>, ApiError> {
    let meter = meter_predictions_read(&state, &user.id).await?;
    let predictions = match state
        .cache
        .get_json::<Vec<PredictionResponse>>(&list_cache_key(PREDICTIONS_SCOPE))
        .await
    {
        Some(predictions) => predictions,
        None => {
            let predictions: Vec<PredictionResponse> = state
                .db
                .list_operations_all::<PredictionJob>(PREDICTION)?
                .into_iter()
                .map(Into::into)
                .collect();
            state
                .cache
                .set_json(&list_cache_key(PREDICTIONS_SCOPE), &predictions)
                .await;
            predictions
        }
    };

    Ok(JSend::success(ListPredictionsResponse {
        balance: meter.balance,
        charged: meter.charged,
        predictions,
    }))
}

async fn meter_predictions_read(
    state: &AppState,
    owner_id: &str,
) -> Result<crate::billing::MeterOutcome, ApiError> {
    let version =
        scope_version::<PredictionJob>(&state.db, &state.cache, PREDICTIONS_SCOPE, PREDICTION)
            .await?;
    let meter = charge_once_per_version(
        &state.db,
        &state.cache,
        MeterAction { cost: state.config.costs.metadata, scope: PREDICTIONS_SCOPE },
        owner_id,
        &version,
    )
    .await?;
    Ok(meter)
}

pub async fn get_prediction(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<JSend<PredictionResponse>>, ApiError> {
    let job: PredictionJob = state
        .db
        .get_operation_by_id(PREDICTION, &id)?
        .filter(|job: &PredictionJob| job.owner_id == user.id)
        .ok_or_else(|| ApiError::not_found("Prediction not found"))?;
    Ok(JSend::success(job.into()))
}
