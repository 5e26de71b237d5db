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
use crate::fingerprint::training_fingerprint;
use crate::ops::artifacts::artifact_path;
use crate::ops::worker::{build_train_worker_args, run_training_subprocess};
use crate::ops::run_training;
use crate::storage::models::{RowStatus, TrainingJob, User};
use crate::storage::TRAINING;
use crate::AppState;

const MODEL_TYPES: &[&str] = &["forest", "linear", "logistic"];

/// Metering scope for model listings
pub const MODELS_SCOPE: &str = "training_jobs";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TrainRequest {
    /// Raw CSV text, header row first
    pub csv_data: String,
    pub features: Vec<String>,
    pub label: String,
    #[serde(default)]
    pub model_params: BTreeMap<String, serde_json::Value>,
    pub model_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrainingJobResponse {
    pub created_at: String,
    pub feature_schema: BTreeMap<String, String>,
    pub features: Vec<String>,
    pub fingerprint: String,
    pub id: String,
    pub label: String,
    pub metrics: Option<serde_json::Value>,
    pub model_type: String,
    pub status: RowStatus,
}

impl From<TrainingJob> for TrainingJobResponse {
    fn from(job: TrainingJob) -> Self {
        Self {
            created_at: job.created_at.to_rfc3339(),
            feature_schema: job.feature_schema,
            features: job.features,
            fingerprint: job.fingerprint,
            id: job.id,
            label: job.label,
            metrics: job.metrics,
            model_type: job.model_type,
            status: job.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub balance: u64,
    pub charged: bool,
    pub job: TrainingJobResponse,
}

#[derive(Debug, Serialize)]
pub struct ListModelsResponse {
    pub balance: Option<u64>,
    pub charged: bool,
    pub models: Vec<TrainingJobResponse>,
}

// ============================================================================
// Validation
// ============================================================================

fn validate_train(req: &TrainRequest) -> Result<(), ApiError> {
    if req.features.is_empty() {
        return Err(ApiError::bad_request("At least one feature is required"));
    }
    if req.features.contains(&req.label) {
        return Err(ApiError::bad_request("Label cannot also be a feature"));
    }
    if !MODEL_TYPES.contains(&req.model_type.as_str()) {
        return Err(ApiError::unprocessable(format!(
            "Unknown model type, expected one of: {}",
            MODEL_TYPES.join(", ")
        )));
    }
    Ok(())
}

/// Capture the column types at submission: a column is numeric if its first
/// data value parses as a float, categorical otherwise.
fn infer_feature_schema(
    csv_data: &str,
    features: &[String],
    label: &str,
) -> Result<BTreeMap<String, String>, ApiError> {
    let mut lines = csv_data.lines();
    let header: Vec<&str> = lines
        .next()
        .map(|l| l.split(',').map(str::trim).collect())
        .unwrap_or_default();
    let first_row: Vec<&str> = lines
        .next()
        .map(|l| l.split(',').map(str::trim).collect())
        .ok_or_else(|| ApiError::bad_request("CSV needs a header and at least one data row"))?;

    let mut schema = BTreeMap::new();
    for column in features.iter().map(String::as_str).chain([label]) {
        let index = header
            .iter()
            .position(|&h| h == column)
            .ok_or_else(|| ApiError::bad_request(format!("Column '{column}' not found in CSV")))?;
        let value = first_row.get(index).copied().unwrap_or_default();
        let kind = if value.parse::<f64>().is_ok() { "numeric" } else { "categorical" };
        schema.insert(column.to_string(), kind.to_string());
    }
    Ok(schema)
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn train_model(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<TrainRequest>,
) -> Result<Json<JSend<TrainResponse>>, ApiError> {
    validate_train(&req)?;
    let feature_schema = infer_feature_schema(&req.csv_data, &req.features, &req.label)?;

    let fingerprint = training_fingerprint(
        req.csv_data.as_bytes(),
        &req.features,
        &req.label,
        &req.model_type,
        &req.model_params,
        &state.config.pipeline_version,
    );
    let model_path = artifact_path(&state.config.artifacts_dir, &user.id, &fingerprint);

    // Stage the dataset for the worker; removed once the run settles
    let csv_path = PathBuf::from(&state.config.data_dir)
        .join("uploads")
        .join(format!("{}.csv", Uuid::new_v4()));
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ApiError::internal(format!("Failed to stage dataset: {e}")))?;
    }
    std::fs::write(&csv_path, &req.csv_data)
        .map_err(|e| ApiError::internal(format!("Failed to stage dataset: {e}")))?;

    let job = TrainingJob {
        created_at: Utc::now(),
        feature_schema,
        features: req.features.clone(),
        fingerprint,
        id: Uuid::new_v4().to_string(),
        label: req.label.clone(),
        metrics: None,
        model_params: req.model_params.clone(),
        model_path: model_path.display().to_string(),
        model_type: req.model_type.clone(),
        owner_id: user.id.clone(),
        status: RowStatus::Pending,
    };

    let cmd = state.config.train_worker_cmd.clone();
    let timeout = Duration::from_secs(state.config.compute.training_timeout_seconds);
    let worker_csv = csv_path.clone();
    let outcome = run_training(
        state.db.clone(),
        state.config.costs.training,
        job,
        move |tmp| async move {
            let args = build_train_worker_args(
                &worker_csv,
                &req.features,
                &req.label,
                &req.model_type,
                &req.model_params,
                &tmp,
            );
            let result = run_training_subprocess(&cmd, args, timeout).await;
            let _ = std::fs::remove_file(&worker_csv);
            result
        },
    )
    .await;

    // Replays never run the worker, so their staged dataset is still here
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = std::fs::remove_file(&csv_path);
            return Err(e.into());
        }
    };
    if !outcome.charged {
        let _ = std::fs::remove_file(&csv_path);
    } else {
        bump_version(&state.cache, MODELS_SCOPE).await;
    }

    Ok(JSend::success(TrainResponse {
        balance: outcome.balance,
        charged: outcome.charged,
        job: outcome.job.into(),
    }))
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<JSend<ListModelsResponse>>, ApiError> {
    let meter = meter_models_read(&state, &user.id).await?;
    let models = state
        .db
        .list_operations_for::<TrainingJob>(TRAINING, &user.id)?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(JSend::success(ListModelsResponse {
        balance: meter.balance,
        charged: meter.charged,
        models,
    }))
}

/// All models across active owners, memoized per dataset version.
pub async fn list_all_models(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<JSend<ListModelsResponse>>, ApiError> {
    let meter = meter_models_read(&state, &user.id).await?;
    let models = match state
        .cache
        .get_json::<Vec<TrainingJobResponse>>(&list_cache_key(MODELS_SCOPE))
        .await
    {
        Some(models) => models,
        None => {
            let models: Vec<TrainingJobResponse> = state
                .db
                .list_operations_all::<TrainingJob>(TRAINING)?
                .into_iter()
                .map(Into::into)
                .collect();
            state
                .cache
                .set_json(&list_cache_key(MODELS_SCOPE), &models)
                .await;
            models
        }
    };

    Ok(JSend::success(ListModelsResponse {
        balance: meter.balance,
        charged: meter.charged,
        models,
    }))
}

async fn meter_models_read(
    state: &AppState,
    owner_id: &str,
) -> Result<crate::billing::MeterOutcome, ApiError> {
    let version =
        scope_version::<TrainingJob>(&state.db, &state.cache, MODELS_SCOPE, TRAINING).await?;
    let meter = charge_once_per_version(
        &state.db,
        &state.cache,
        MeterAction { cost: state.config.costs.metadata, scope: MODELS_SCOPE },
        owner_id,
        &version,
    )
    .await?;
    Ok(meter)
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<JSend<TrainingJobResponse>>, ApiError> {
    let job: TrainingJob = state
        .db
        .get_operation_by_id(TRAINING, &id)?
        .filter(|job: &TrainingJob| job.owner_id == user.id)
        .ok_or_else(|| ApiError::not_found("Model not found"))?;
    Ok(JSend::success(job.into()))
}
