// File-based turn event bus
// Each event is one JSON file in the events directory, written to
// `<name>.tmp` and renamed into place so readers never see a partial file

use crate::activity::{AgentKind, AgentTurnEvent, Outcome, TurnEventType, TURN_EVENT_SCHEMA};
use crate::session::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// Suffix of files still being written
pub const TMP_SUFFIX: &str = ".tmp";

/// Last timestamp handed out by `next_event_time`, in nanoseconds
static LAST_EVENT_NANOS: AtomicI64 = AtomicI64::new(0);

/// Writer side of the turn event directory
#[derive(Debug, Clone)]
pub struct TurnEventBus {
    dir: PathBuf,
}

impl TurnEventBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.events_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publish a turn boundary for a workspace
    ///
    /// Without a workspace there is nobody to notify, so nothing is written
    /// and `Ok(None)` is returned. `outcome` is dropped on `turn_started`.
    pub fn emit_turn_event(
        &self,
        workspace_id: Option<&str>,
        agent: AgentKind,
        event_type: TurnEventType,
        session_id: Option<&str>,
        outcome: Option<Outcome>,
    ) -> Result<Option<PathBuf>> {
        let Some(workspace_id) = workspace_id.map(str::trim).filter(|w| !w.is_empty()) else {
            return Ok(None);
        };

        let outcome = match event_type {
            TurnEventType::AwaitingUser => outcome,
            TurnEventType::TurnStarted => None,
        };
        let event = AgentTurnEvent {
            schema: TURN_EVENT_SCHEMA,
            workspace_id: workspace_id.to_string(),
            agent,
            event_type,
            outcome,
            session_id: session_id.map(str::to_string),
            at: next_event_time(),
        };
        self.emit(&event).map(Some)
    }

    /// Write a fully formed event
    pub fn emit(&self, event: &AgentTurnEvent) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create events directory: {}", self.dir.display()))?;

        let path = self.dir.join(event_file_name(event.at));
        let json = serde_json::to_vec(event).context("Failed to serialize turn event")?;
        atomic_write(&path, &json)?;

        tracing::debug!(
            workspace_id = %event.workspace_id,
            agent = %event.agent,
            event_type = ?event.event_type,
            path = %path.display(),
            "Emitted turn event"
        );
        Ok(path)
    }
}

/// Current time, strictly later than any earlier event from this process
///
/// Readers order events by `at`, so a start and finish emitted back to back
/// must never share a timestamp.
fn next_event_time() -> DateTime<Utc> {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
    let mut last = LAST_EVENT_NANOS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_EVENT_NANOS.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return DateTime::from_timestamp_nanos(next),
            Err(actual) => last = actual,
        }
    }
}

/// `<unix_ms>-<pid>-<8 hex>.json`
fn event_file_name(at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}.json",
        at.timestamp_millis(),
        std::process::id(),
        &suffix[..8]
    )
}

/// Write `contents` to `<path>.tmp`, then rename over `path`
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid path: {}", path.display()))?;
    let temp_path = path.with_file_name(format!("{}{}", file_name, TMP_SUFFIX));

    fs::write(&temp_path, contents)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
