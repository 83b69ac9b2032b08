//! Cross-process advisory lock serializing runs on the same working
//! tree, via `flock(2)` directly (not an RAII wrapper crate): the guard
//! only needs to own the `File` whose fd carries the lock, and `Drop`
//! calls `flock(fd, LOCK_UN)` explicitly for deterministic release
//! timing.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{CoreError, CoreResult};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const IDENTIFIER_MAX_LEN: usize = 100;

/// Replace control characters and path separators with `_`, truncate to
/// 100 characters, substitute `unknown` for an empty result.
pub fn sanitize_identifier(identifier: &str) -> String {
    let mut out: String = identifier
        .chars()
        .map(|c| {
            if c.is_control() || c == '/' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .collect();
    out.truncate(IDENTIFIER_MAX_LEN);
    if out.is_empty() {
        out = "unknown".to_string();
    }
    out
}

/// A held (or, when locking is disabled, no-op) lock. Release on `Drop`;
/// `release()` is also callable explicitly and is idempotent.
pub struct LockHandle {
    file: Option<File>,
    lock_path: Option<PathBuf>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl LockHandle {
    fn noop() -> Self {
        Self {
            file: None,
            lock_path: None,
        }
    }

    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // SAFETY: fd is valid and owned by `file`, about to be dropped.
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn locks_dir(home: &Path) -> PathBuf {
    home.join(".rcodegen").join("locks")
}

fn try_lock_once(lock_path: &Path) -> CoreResult<Result<File, ()>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| CoreError::WorkspaceCreate(format!("{}: {e}", lock_path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(lock_path, fs::Permissions::from_mode(0o600));
    }

    // SAFETY: fd is valid and owned by `file`. LOCK_EX|LOCK_NB never
    // blocks; the return value is checked below.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        Ok(Ok(file))
    } else {
        Ok(Err(()))
    }
}

fn read_holder_info(info_path: &Path) -> Option<String> {
    let mut f = File::open(info_path).ok()?;
    let mut contents = String::new();
    f.read_to_string(&mut contents).ok()?;
    Some(contents)
}

fn write_holder_info(info_path: &Path, identifier: &str) {
    // Best-effort: failure to write the info file does not abort the run.
    if let Ok(mut f) = File::create(info_path) {
        let _ = f.write_all(identifier.as_bytes());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(info_path, fs::Permissions::from_mode(0o600));
        }
    }
}

/// Acquire an exclusive advisory lock at `HOME/.rcodegen/locks/rcodegen.lock`.
/// When `enabled` is false, returns a no-op handle immediately.
///
/// On contention, polls every 5 seconds until acquired, the cancellation
/// token fires (`LOCK_CANCELLED`), or 5 minutes elapse (`LOCK_TIMEOUT`).
pub async fn acquire(
    home: &Path,
    identifier: &str,
    enabled: bool,
    cancel: &CancellationToken,
) -> CoreResult<LockHandle> {
    if !enabled {
        return Ok(LockHandle::noop());
    }

    let dir = locks_dir(home);
    fs::create_dir_all(&dir)
        .map_err(|e| CoreError::WorkspaceCreate(format!("{}: {e}", dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
    }

    let lock_path = dir.join("rcodegen.lock");
    let info_path = dir.join("rcodegen.lock.info");
    let sanitized = sanitize_identifier(identifier);

    let deadline = Instant::now() + ACQUIRE_TIMEOUT;
    loop {
        match try_lock_once(&lock_path)? {
            Ok(file) => {
                write_holder_info(&info_path, &sanitized);
                return Ok(LockHandle {
                    file: Some(file),
                    lock_path: Some(lock_path),
                });
            }
            Err(()) => {
                if let Some(holder) = read_holder_info(&info_path) {
                    debug!(holder = %holder, "lock held by another process, waiting");
                } else {
                    debug!("lock held by another process (no diagnostic info), waiting");
                }

                if Instant::now() >= deadline {
                    warn!("lock acquisition timed out after {:?}", ACQUIRE_TIMEOUT);
                    return Err(CoreError::LockTimeout(ACQUIRE_TIMEOUT));
                }

                tokio::select! {
                    _ = sleep(POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => {
                        return Err(CoreError::LockCancelled);
                    }
                }
            }
        }
    }
}
