//! Per-run on-disk workspace: `BASE/jobs/<job_id>/{outputs,logs}`.
//!
//! Atomic writes follow the write-temp-then-rename pattern; directories
//! and files are created owner-only.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::RngCore;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};

#[cfg(unix)]
fn set_owner_only_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_owner_only_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Restrict `path` to owner-only read/write (0600). Used for every file
/// under a job's `outputs/`/`logs/` tree, since both can hold arbitrary
/// AI-tool output.
#[cfg(unix)]
pub fn set_owner_only_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn set_owner_only_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Generate a job ID of the form `YYYYMMDD-HHMMSS-XXXXXXXX`, where X is
/// 4 cryptographically random bytes hex-encoded. Falls back to a 32-bit
/// slice of the monotonic clock if the RNG is unavailable (it practically
/// never is, but the fallback keeps job-ID generation infallible).
pub fn new_job_id() -> String {
    let ts = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = match std::panic::catch_unwind(random_suffix) {
        Ok(s) => s,
        Err(_) => {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0);
            format!("{:08x}", nanos)
        }
    };
    format!("{ts}-{suffix}")
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub job_id: String,
    pub job_dir: PathBuf,
}

impl Workspace {
    /// Create `jobs/<job_id>/{outputs,logs}` under `base_dir`, owner-only.
    pub fn new(base_dir: &Path) -> CoreResult<Self> {
        let job_id = new_job_id();
        let job_dir = base_dir.join("jobs").join(&job_id);
        let outputs = job_dir.join("outputs");
        let logs = job_dir.join("logs");

        for dir in [&job_dir, &outputs, &logs] {
            fs::create_dir_all(dir)
                .map_err(|e| CoreError::WorkspaceCreate(format!("{}: {e}", dir.display())))?;
            set_owner_only_dir(dir)
                .map_err(|e| CoreError::WorkspaceCreate(format!("{}: {e}", dir.display())))?;
        }

        Ok(Self { job_id, job_dir })
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.job_dir.join("outputs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.job_dir.join("logs")
    }

    pub fn output_path(&self, sanitized_name: &str) -> PathBuf {
        self.outputs_dir().join(format!("{sanitized_name}.json"))
    }

    pub fn log_path(&self, sanitized_name: &str) -> PathBuf {
        self.logs_dir().join(format!("{sanitized_name}.log"))
    }

    /// Serialize `object` as JSON and write atomically to
    /// `outputs/<sanitized_name>.json`: write to a temp file in the same
    /// directory, then rename. Returns the path written.
    pub fn write_output<T: Serialize>(
        &self,
        sanitized_name: &str,
        object: &T,
    ) -> CoreResult<PathBuf> {
        let final_path = self.output_path(sanitized_name);
        let tmp_path = self
            .outputs_dir()
            .join(format!("{sanitized_name}.json.tmp"));

        let json = serde_json::to_string(object)
            .map_err(|e| CoreError::WriteError(format!("serialize: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| CoreError::WriteError(format!("{}: {e}", tmp_path.display())))?;
        set_owner_only_file(&tmp_path)
            .map_err(|e| CoreError::WriteError(format!("{}: {e}", tmp_path.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| CoreError::WriteError(format!("{}: {e}", tmp_path.display())))?;
        file.flush()
            .map_err(|e| CoreError::WriteError(format!("{}: {e}", tmp_path.display())))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .map_err(|e| CoreError::WriteError(format!("{}: {e}", final_path.display())))?;

        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn creates_outputs_and_logs_dirs() {
        let base = tempdir().unwrap();
        let ws = Workspace::new(base.path()).unwrap();
        assert!(ws.outputs_dir().is_dir());
        assert!(ws.logs_dir().is_dir());
    }

    #[test]
    fn job_id_matches_expected_shape() {
        let id = new_job_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn write_output_is_atomic_and_readable() {
        let base = tempdir().unwrap();
        let ws = Workspace::new(base.path()).unwrap();
        let path = ws
            .write_output("my_step", &json!({"stdout": "hi", "stderr": ""}))
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let contents = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["stdout"], "hi");
    }

    #[cfg(unix)]
    #[test]
    fn outputs_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let base = tempdir().unwrap();
        let ws = Workspace::new(base.path()).unwrap();
        let mode = fs::metadata(ws.outputs_dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn two_workspaces_get_distinct_job_ids() {
        let base = tempdir().unwrap();
        let a = Workspace::new(base.path()).unwrap();
        let b = Workspace::new(base.path()).unwrap();
        assert_ne!(a.job_id, b.job_id);
    }
}
