// Cross-process lock guarding daemon spawns
//
// The lock is a file created with O_EXCL holding the acquisition time in
// unix milliseconds. A holder that crashes leaves the file behind; once it is
// older than the expiry any other process may break it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A spawn lock older than this is considered abandoned
pub const SPAWN_LOCK_EXPIRY: Duration = Duration::from_secs(10);

/// Held spawn lock; the file is removed on drop
#[derive(Debug)]
pub struct SpawnLock {
    path: PathBuf,
}

impl SpawnLock {
    /// Try to take the lock without waiting
    ///
    /// Returns `Ok(None)` when another live holder owns it.
    pub fn try_acquire(path: &Path, expiry: Duration) -> std::io::Result<Option<Self>> {
        match create_lock_file(path) {
            Ok(lock) => return Ok(Some(lock)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        if !is_expired(path, expiry) {
            return Ok(None);
        }

        tracing::warn!(path = %path.display(), "Breaking expired spawn lock");
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        // Another process may have broken it first
        match create_lock_file(path) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpawnLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<SpawnLock> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    let lock = SpawnLock {
        path: path.to_path_buf(),
    };
    file.write_all(now_millis().to_string().as_bytes())?;
    Ok(lock)
}

/// Age from the recorded timestamp, or from the mtime when unreadable
fn is_expired(path: &Path, expiry: Duration) -> bool {
    let recorded = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u128>().ok());

    let age = match recorded {
        Some(ms) => Duration::from_millis(now_millis().saturating_sub(ms) as u64),
        None => match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default(),
            // Vanished between checks; let the caller retry the create
            Err(_) => return true,
        },
    };
    age > expiry
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
