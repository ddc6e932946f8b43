//! Process boot and exit markers.
//!
//! A lock file under the data directory flags abnormal exits: when it
//! already exists at boot, the previous run never shut down cleanly
//! and `ABNORMAL_RESTART` is logged. The file is removed on graceful
//! exit. Nothing else is persisted; every boot starts from an empty
//! runtime by construction.

use chrono::Utc;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::warn;

/// Default lock location, next to where the original keeps it.
pub const RUNNING_LOCK: &str = "data/running.lock";

/// Holds the running-lock file for the process lifetime. Dropping it
/// removes the marker.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Write the marker, flagging a leftover from a previous run.
    pub fn acquire(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            warn!(path = %path.display(), "ABNORMAL_RESTART");
        }
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(&path, Utc::now().to_rfc3339())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("blocksignal-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_lock_written_and_removed() {
        let path = scratch("clean.lock");
        let _ = fs::remove_file(&path);

        let lock = RunLock::acquire(&path).unwrap();
        assert!(path.exists());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_is_overwritten() {
        let path = scratch("stale.lock");
        fs::write(&path, "leftover").unwrap();

        let lock = RunLock::acquire(&path).unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_ne!(contents, "leftover");

        drop(lock);
        assert!(!path.exists());
    }
}
