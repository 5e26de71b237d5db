//! Artifact paths and the two-phase temp/final publish step.
//!
//! A trained model is written first to `<path>.tmp` and becomes
//! authoritative only after the atomic rename to `<path>`, which happens
//! strictly after the job row flips to `Applied`. The reconciler completes
//! or undoes publishes interrupted by a crash.

use std::path::{Path, PathBuf};

/// Deterministic final artifact path for `(owner, fingerprint)`
pub fn artifact_path(artifacts_dir: &str, owner_id: &str, fingerprint: &str) -> PathBuf {
    Path::new(artifacts_dir)
        .join(owner_id)
        .join(format!("{fingerprint}.bin"))
}

/// Staging location for an artifact being written
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut tmp = final_path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Atomically move the staged artifact to its final path
pub fn publish(tmp_path: &Path, final_path: &Path) -> std::io::Result<()> {
    std::fs::rename(tmp_path, final_path)
}

/// Best-effort unlink; missing files and permission errors are ignored
pub fn safe_unlink(path: &Path) {
    let _ = std::fs::remove_file(path);
}
