//! Compute worker protocol.
//!
//! Training is invoked as a subprocess: argv carries the csv path, the
//! feature list and hyperparameters as JSON, the label, the model type, and
//! the temp output path. On success the worker writes the serialized
//! estimator to the temp path and a JSON metrics object to stdout; a
//! non-zero exit or malformed stdout is a hard failure. Prediction goes
//! through the [`Predictor`] trait; the estimator itself is a black box.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed worker output: {0}")]
    MalformedOutput(String),
    #[error("worker exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("compute timed out")]
    Timeout,
}

/// Worker argv tail for a training run (prepended with the configured
/// worker command).
pub fn build_train_worker_args(
    csv_path: &Path,
    features: &[String],
    label: &str,
    model_type: &str,
    params: &BTreeMap<String, serde_json::Value>,
    tmp_out: &Path,
) -> Vec<String> {
    vec![
        "--csv".to_string(),
        csv_path.display().to_string(),
        "--features".to_string(),
        serde_json::to_string(features).unwrap_or_else(|_| "[]".to_string()),
        "--label".to_string(),
        label.to_string(),
        "--model-type".to_string(),
        model_type.to_string(),
        "--params".to_string(),
        serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string()),
        "--tmp".to_string(),
        tmp_out.display().to_string(),
    ]
}

/// Run the training worker under a wall-clock timeout, returning its
/// metrics object. The child is killed if the timeout elapses or the
/// surrounding task is dropped.
pub async fn run_training_subprocess(
    cmd: &[String],
    args: Vec<String>,
    timeout: Duration,
) -> Result<serde_json::Value, ComputeError> {
    let (program, fixed_args) = cmd
        .split_first()
        .ok_or_else(|| ComputeError::MalformedOutput("empty worker command".to_string()))?;

    let child = tokio::process::Command::new(program)
        .args(fixed_args)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        // Dropping the future kills the child via kill_on_drop
        Err(_) => return Err(ComputeError::Timeout),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ComputeError::NonZeroExit {
            code: output.status.code().unwrap_or(-1),
            stderr: if stderr.is_empty() { "no stderr".to_string() } else { stderr },
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim())
        .map_err(|e| ComputeError::MalformedOutput(format!("metrics parse failed: {e}")))
}

/// Black-box estimator interface. Implementations load the published
/// artifact and evaluate it for one input row; they run on a blocking
/// worker thread and must not outlive `timeout`.
pub trait Predictor: Send + Sync + 'static {
    fn predict(
        &self,
        artifact: &Path,
        model_type: &str,
        ordered_inputs: &[(String, serde_json::Value)],
        timeout: Duration,
    ) -> Result<String, ComputeError>;
}

/// Predictor that shells out to the worker binary in predict mode.
pub struct CommandPredictor {
    cmd: Vec<String>,
}

impl CommandPredictor {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd }
    }
}

impl Predictor for CommandPredictor {
    fn predict(
        &self,
        artifact: &Path,
        model_type: &str,
        ordered_inputs: &[(String, serde_json::Value)],
        timeout: Duration,
    ) -> Result<String, ComputeError> {
        let (program, fixed_args) = self
            .cmd
            .split_first()
            .ok_or_else(|| ComputeError::MalformedOutput("empty worker command".to_string()))?;

        let inputs = serde_json::to_string(ordered_inputs)
            .map_err(|e| ComputeError::MalformedOutput(e.to_string()))?;
        let mut child = std::process::Command::new(program)
            .args(fixed_args)
            .arg("--predict")
            .arg("--artifact")
            .arg(artifact)
            .arg("--model-type")
            .arg(model_type)
            .arg("--inputs")
            .arg(inputs)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Poll with a hard deadline; the child never outlives the timeout
        let deadline = Instant::now() + timeout;
        while child.try_wait()?.is_none() {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ComputeError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ComputeError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: if stderr.is_empty() { "no stderr".to_string() } else { stderr },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
