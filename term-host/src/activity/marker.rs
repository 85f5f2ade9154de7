// Activity markers
// One small JSON file per key, used by the in-process manager to remember
// which sessions have a turn in flight across restarts

use crate::activity::bus::atomic_write;
use crate::activity::AgentKind;
use crate::session::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hint that a turn started in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMarker {
    pub agent: AgentKind,
    /// PTY child the agent was found under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub at: DateTime<Utc>,
}

impl ActivityMarker {
    pub fn now(agent: AgentKind, pid: Option<u32>) -> Self {
        Self {
            agent,
            pid,
            at: Utc::now(),
        }
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.markers_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`
    ///
    /// Keys are caller-supplied session ids; anything outside `[A-Za-z0-9_-]`
    /// is replaced and a short hash keeps the mapping unique.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let name = if sanitized == key && !key.is_empty() {
            sanitized
        } else {
            let digest = hex::encode(Sha256::digest(key.as_bytes()));
            format!("{}-{}", sanitized, &digest[..8])
        };
        self.dir.join(format!("{}.json", name))
    }

    pub fn write(&self, key: &str, marker: &ActivityMarker) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create markers directory: {}", self.dir.display()))?;
        let json = serde_json::to_vec(marker).context("Failed to serialize activity marker")?;
        atomic_write(&self.path_for(key), &json)
    }

    /// Read a marker no older than `max_age`; expired or unreadable markers are removed
    pub fn read(&self, key: &str, max_age: Duration) -> Option<ActivityMarker> {
        let path = self.path_for(key);
        let bytes = fs::read(&path).ok()?;

        match serde_json::from_slice::<ActivityMarker>(&bytes) {
            Ok(marker) if marker.age() <= max_age => Some(marker),
            Ok(_) => {
                tracing::debug!(key, "Removing expired activity marker");
                let _ = fs::remove_file(&path);
                None
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "Removing unreadable activity marker");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Read and remove
    pub fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove marker: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn store() -> (TempDir, MarkerStore) {
        let temp = TempDir::new().unwrap();
        let store = MarkerStore::new(temp.path().join("markers"));
        (temp, store)
    }

    #[test]
    fn test_write_read_clear() {
        let (_temp, store) = store();
        let marker = ActivityMarker::now(AgentKind::Codex, Some(77));

        assert!(store.read("s1", HOUR).is_none());
        store.write("s1", &marker).unwrap();
        assert_eq!(store.read("s1", HOUR), Some(marker.clone()));
        assert_eq!(store.read("s1", HOUR), Some(marker));

        store.clear("s1").unwrap();
        assert!(store.read("s1", HOUR).is_none());
    }

    #[test]
    fn test_expired_marker_is_removed() {
        let (_temp, store) = store();
        let marker = ActivityMarker {
            agent: AgentKind::Codex,
            pid: None,
            at: Utc::now() - chrono::Duration::hours(2),
        };
        store.write("old", &marker).unwrap();

        assert!(store.read("old", HOUR).is_none());
        assert!(!store.path_for("old").exists());
    }

    #[test]
    fn test_garbage_marker_is_removed() {
        let (_temp, store) = store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.path_for("bad"), b"{nope").unwrap();
        assert!(store.read("bad", HOUR).is_none());
        assert!(!store.path_for("bad").exists());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (_temp, store) = store();
        store
            .write("s1", &ActivityMarker::now(AgentKind::Gemini, None))
            .unwrap();
        store.clear("s1").unwrap();
        store.clear("s1").unwrap();
        assert!(store.read("s1", HOUR).is_none());
    }

    #[test]
    fn test_keys_are_sanitized_and_distinct() {
        let (_temp, store) = store();
        let a = store.path_for("../etc/passwd");
        let b = store.path_for("__etc_passwd");
        assert_eq!(a.parent(), Some(store.dir()));
        assert_ne!(a, b);
        assert_eq!(store.path_for("tab-1_x"), store.dir().join("tab-1_x.json"));
        assert_ne!(store.path_for("a/b"), store.path_for("a:b"));
    }

    #[test]
    fn test_markers_survive_new_store_instance() {
        let (temp, store) = store();
        store
            .write("s1", &ActivityMarker::now(AgentKind::Codex, Some(1)))
            .unwrap();
        let reopened = MarkerStore::new(temp.path().join("markers"));
        assert_eq!(reopened.read("s1", HOUR).unwrap().pid, Some(1));
    }
}
