use std::path::PathBuf;

use thiserror::Error;

use crate::fingerprint;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for published model artifacts
    pub artifacts_dir: String,
    pub bind_address: String,
    pub compute: ComputeConfig,
    pub costs: CostConfig,
    pub data_dir: String,
    /// Tag baked into training fingerprints: crate version + lockfile hash
    pub pipeline_version: String,
    pub tokens: TokenConfig,
    /// argv prefix of the training worker (e.g. ["python", "-m", "worker"])
    pub train_worker_cmd: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ComputeConfig {
    pub prediction_timeout_seconds: u64,
    pub training_timeout_seconds: u64,
}

/// Token cost per billable action
#[derive(Debug, Clone)]
pub struct CostConfig {
    pub metadata: u64,
    pub prediction: u64,
    pub training: u64,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_ttl_seconds: u64,
    pub max_balance: u64,
    pub max_purchase_amount: u64,
    pub max_token_generation_retries: u32,
    pub refresh_absolute_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            prediction_timeout_seconds: 10,
            training_timeout_seconds: 300,
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            metadata: 1,
            prediction: 5,
            training: 10,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl_seconds: 900,             // 15 minutes
            max_balance: 1000,
            max_purchase_amount: 100,
            max_token_generation_retries: 5,
            refresh_absolute_ttl_seconds: 86400, // 24 hours
            refresh_ttl_seconds: 3600,           // 1 hour, sliding
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let artifacts_dir =
            std::env::var("ARTIFACTS_DIR").unwrap_or_else(|_| "./saved_models".to_string());

        let lockfile = std::env::var("LOCKFILE_PATH").unwrap_or_else(|_| "Cargo.lock".to_string());
        let pipeline_version = fingerprint::pipeline_version(&PathBuf::from(lockfile));

        let train_worker_cmd: Vec<String> = std::env::var("TRAIN_WORKER_CMD")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|_| vec!["modelmint-train-worker".to_string()]);

        let training_timeout_seconds = env_u64("TRAINING_TIMEOUT_SECONDS", 300);
        let prediction_timeout_seconds = env_u64("PREDICTION_TIMEOUT_SECONDS", 10);

        let config = Config {
            artifacts_dir,
            bind_address,
            compute: ComputeConfig {
                prediction_timeout_seconds,
                training_timeout_seconds,
            },
            costs: CostConfig::default(),
            data_dir,
            pipeline_version,
            tokens: TokenConfig::default(),
            train_worker_cmd,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.train_worker_cmd.is_empty() {
            return Err(ConfigError::ValidationError(
                "TRAIN_WORKER_CMD cannot be empty".to_string(),
            ));
        }
        let max = self.tokens.max_balance;
        for (name, cost) in [
            ("metadata", self.costs.metadata),
            ("prediction", self.costs.prediction),
            ("training", self.costs.training),
        ] {
            if cost == 0 || cost > max {
                return Err(ConfigError::ValidationError(format!(
                    "{name} cost must be between 1 and the balance cap ({max})"
                )));
            }
        }
        if self.tokens.max_purchase_amount == 0 || self.tokens.max_purchase_amount > max {
            return Err(ConfigError::ValidationError(
                "max purchase amount must be between 1 and the balance cap".to_string(),
            ));
        }
        if self.tokens.max_token_generation_retries == 0 {
            return Err(ConfigError::ValidationError(
                "token generation retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
