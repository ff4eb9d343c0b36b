use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::BackupError;

const LOCK_FILE_NAME: &str = ".restore.lock";

/// Contents of the lock file, for whoever finds it held.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub created_at: String,
    pub operation: String,
}

/// Exclusive marker for a running restore. Released when dropped.
#[derive(Debug)]
pub struct RestoreLock {
    path: PathBuf,
}

impl RestoreLock {
    /// Take the restore lock in `lock_dir`.
    ///
    /// # Errors
    /// Returns [`BackupError::RestoreInProgress`] while another restore holds the lock and
    /// [`BackupError::Resource`] when the lock file cannot be written.
    pub fn acquire(lock_dir: &Path, operation: &str) -> Result<Self, BackupError> {
        fs::create_dir_all(lock_dir).map_err(|err| BackupError::io_at("create", lock_dir, err))?;
        let path = lock_dir.join(LOCK_FILE_NAME);

        let opened = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path);
        let mut file = match opened {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => {
                return Err(BackupError::RestoreInProgress(describe_holder(&path)));
            }
            Err(err) => return Err(BackupError::io_at("create lock", &path, err)),
        };

        let info = LockInfo {
            pid: std::process::id(),
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            operation: operation.to_string(),
        };
        let lock = Self { path };
        let body = serde_json::to_vec_pretty(&info)?;
        file.write_all(&body)
            .map_err(|err| BackupError::io_at("write lock", &lock.path, err))?;
        debug!(path = %lock.path.display(), operation, "acquired restore lock");
        Ok(lock)
    }
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove restore lock");
        }
    }
}

fn describe_holder(path: &Path) -> String {
    let holder = fs::read_to_string(path)
        .ok()
        .and_then(|body| serde_json::from_str::<LockInfo>(&body).ok());
    match holder {
        Some(info) => format!(
            "{} held by pid {} since {} (remove {} if that process is gone)",
            info.operation,
            info.pid,
            info.created_at,
            path.display()
        ),
        None => format!("lock file {} exists", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use anyhow::{anyhow, Result};
    use tempfile::TempDir;

    #[test]
    fn second_acquire_is_busy_until_release() -> Result<()> {
        let dir = TempDir::new()?;
        let lock_file = dir.path().join(LOCK_FILE_NAME);
        let held = RestoreLock::acquire(dir.path(), "restore")?;

        let Err(err) = RestoreLock::acquire(dir.path(), "restore") else {
            return Err(anyhow!("second acquire should fail while the lock is held"));
        };
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.to_string().contains("held by pid"));

        drop(held);
        assert!(!lock_file.exists());
        let again = RestoreLock::acquire(dir.path(), "restore")?;
        let info: LockInfo = serde_json::from_str(&fs::read_to_string(&lock_file)?)?;
        assert_eq!(info.operation, "restore");
        assert_eq!(info.pid, std::process::id());
        drop(again);
        assert!(!lock_file.exists());
        Ok(())
    }
}
