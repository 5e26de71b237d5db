//! Deterministic request fingerprints.
//!
//! A fingerprint is the sole deduplication key for an operation: identical
//! logical input (including byte-identical dataset) always yields the
//! identical digest, and any change to data, feature/label selection,
//! hyperparameters, or pipeline code changes it. Fingerprints are never
//! used as secrets.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::json;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic JSON string: sorted keys, no spaces.
///
/// `serde_json::Map` is BTreeMap-backed, so object keys serialize in sorted
/// order; compact formatting has no whitespace.
fn stable_json(value: &serde_json::Value) -> String {
    value.to_string()
}

/// Pipeline-version tag: crate version plus a hash of the dependency
/// lockfile, so environment changes are captured in fingerprints.
pub fn pipeline_version(lockfile_path: &Path) -> String {
    let lock = match std::fs::read(lockfile_path) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(_) => "no-lock".to_string(),
    };
    format!("{}|lock={}", env!("CARGO_PKG_VERSION"), lock)
}

/// Fingerprint of a training request: dataset bytes, normalized metadata,
/// and the pipeline version.
pub fn training_fingerprint(
    csv_bytes: &[u8],
    features: &[String],
    label: &str,
    model_type: &str,
    params: &BTreeMap<String, serde_json::Value>,
    pipeline_version: &str,
) -> String {
    let mut sorted_features: Vec<&str> = features.iter().map(String::as_str).collect();
    sorted_features.sort_unstable();

    let parts = json!({
        "data_sha256": sha256_hex(csv_bytes),
        "features": sorted_features,
        "label": label,
        "model_type": model_type,
        "params": params,
        "pipeline_version": pipeline_version,
    });
    sha256_hex(stable_json(&parts).as_bytes())
}

/// Fingerprint of a prediction request: model id plus sorted feature pairs.
pub fn prediction_fingerprint(
    model_id: &str,
    feature_values: &BTreeMap<String, serde_json::Value>,
) -> String {
    let pairs: Vec<(&String, &serde_json::Value)> = feature_values.iter().collect();
    let canonical = json!({
        "features": pairs,
        "model_id": model_id,
    });
    sha256_hex(stable_json(&canonical).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_training_fingerprint_is_deterministic() {
        let p = params(&[("alpha", serde_json::json!(0.5)), ("depth", serde_json::json!(3))]);
        let features = vec!["b".to_string(), "a".to_string()];

        let fp1 = training_fingerprint(b"csv,data", &features, "y", "linear", &p, "v1|lock=x");
        // Feature order must not matter
        let reordered = vec!["a".to_string(), "b".to_string()];
        let fp2 = training_fingerprint(b"csv,data", &reordered, "y", "linear", &p, "v1|lock=x");
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
    }

    #[test]
    fn test_training_fingerprint_tracks_every_input() {
        let p = params(&[("alpha", serde_json::json!(0.5))]);
        let features = vec!["a".to_string()];
        let base = training_fingerprint(b"csv", &features, "y", "linear", &p, "v1");

        assert_ne!(base, training_fingerprint(b"csv2", &features, "y", "linear", &p, "v1"));
        assert_ne!(base, training_fingerprint(b"csv", &features, "z", "linear", &p, "v1"));
        assert_ne!(base, training_fingerprint(b"csv", &features, "y", "forest", &p, "v1"));
        assert_ne!(base, training_fingerprint(b"csv", &features, "y", "linear", &p, "v2"));
        let p2 = params(&[("alpha", serde_json::json!(0.6))]);
        assert_ne!(base, training_fingerprint(b"csv", &features, "y", "linear", &p2, "v1"));
    }

    #[test]
    fn test_prediction_fingerprint_sorts_features() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), serde_json::json!(1));
        a.insert("y".to_string(), serde_json::json!(2));

        let fp1 = prediction_fingerprint("m1", &a);
        let fp2 = prediction_fingerprint("m1", &a);
        assert_eq!(fp1, fp2);
        assert_ne!(fp1, prediction_fingerprint("m2", &a));
    }

    #[test]
    fn test_pipeline_version_missing_lockfile() {
        let v = pipeline_version(Path::new("/definitely/not/a/lockfile"));
        assert!(v.ends_with("|lock=no-lock"));
    }
}
