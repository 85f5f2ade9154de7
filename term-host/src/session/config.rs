// Environment configuration helpers for the session host
// Resolves the installation-scoped home directory and the companion files
// (socket, token, PID, spawn lock, event bus) that live inside it

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the host home directory
pub const HOME_ENV: &str = "TERM_HOST_HOME";

/// Socket addresses longer than this are moved into the temp directory
/// (sun_path is 104 bytes on macOS, 108 on Linux)
pub const MAX_SOCKET_PATH_LEN: usize = 100;

const SOCKET_FILE: &str = "host.sock";

/// Paths used by the daemon and its clients
#[derive(Debug, Clone)]
pub struct Config {
    /// Installation-scoped home (token, PID, lock, event bus)
    pub home_dir: PathBuf,
    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,
    /// Shared secret presented in `hello`
    pub token_file: PathBuf,
    /// Daemon PID file
    pub pid_file: PathBuf,
    /// Optimistic lock guarding daemon spawns
    pub spawn_lock_file: PathBuf,
}

impl Config {
    /// Build a configuration rooted at `home_dir`
    pub fn for_home(home_dir: impl Into<PathBuf>) -> Self {
        let home_dir = home_dir.into();
        Self {
            socket_path: socket_path_for(&home_dir),
            token_file: home_dir.join("token"),
            pid_file: home_dir.join("daemon.pid"),
            spawn_lock_file: home_dir.join("spawn.lock"),
            home_dir,
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        if let Ok(override_dir) = std::env::var(HOME_ENV) {
            if !override_dir.trim().is_empty() {
                return Self::for_home(override_dir);
            }
        }
        Self::for_home(Self::default_home())
    }

    /// `~/.agent-term-host` (or a temp directory if home is unavailable)
    fn default_home() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".agent-term-host"))
            .unwrap_or_else(|| std::env::temp_dir().join("agent-term-host"))
    }

    /// Directory holding one JSON file per agent turn event
    pub fn events_dir(&self) -> PathBuf {
        self.home_dir.join("turn-events")
    }

    /// Directory holding activity markers for the in-process path
    pub fn markers_dir(&self) -> PathBuf {
        self.home_dir.join("activity-markers")
    }

    /// Log file a spawned daemon writes its stderr to
    pub fn log_file(&self) -> PathBuf {
        self.home_dir.join("daemon.log")
    }

    /// Optional detector tuning overrides
    pub fn activity_file(&self) -> PathBuf {
        self.home_dir.join("activity.json")
    }

    /// Ensure the home directory exists and is private to the owner
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.home_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(())
    }

    /// Read the shared secret, creating it on first use
    pub fn ensure_token(&self) -> std::io::Result<String> {
        if let Some(token) = self.read_token() {
            return Ok(token);
        }
        self.ensure_dirs()?;
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        write_private(&self.token_file, token.as_bytes())?;
        Ok(token)
    }

    /// Read the shared secret if it exists and is non-empty
    pub fn read_token(&self) -> Option<String> {
        std::fs::read_to_string(&self.token_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        remove_if_exists(&self.pid_file)
    }

    /// Remove the socket file
    pub fn remove_socket(&self) -> std::io::Result<()> {
        remove_if_exists(&self.socket_path)
    }

    /// True when the socket path exists and is a socket special file
    pub fn socket_ready(&self) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            std::fs::metadata(&self.socket_path)
                .map(|m| m.file_type().is_socket())
                .unwrap_or(false)
        }

        #[cfg(not(unix))]
        {
            self.socket_path.exists()
        }
    }

    /// Load detector tuning, falling back to defaults when absent or invalid
    pub fn load_activity_config(&self) -> ActivityConfig {
        match std::fs::read(self.activity_file()) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        path = %self.activity_file().display(),
                        error = %e,
                        "Ignoring invalid activity config"
                    );
                    ActivityConfig::default()
                }
            },
            Err(_) => ActivityConfig::default(),
        }
    }
}

/// Pick the socket path for a home, hashing long paths into the temp dir
pub fn socket_path_for(home_dir: &Path) -> PathBuf {
    let natural = home_dir.join(SOCKET_FILE);
    if natural.as_os_str().len() <= MAX_SOCKET_PATH_LEN {
        return natural;
    }
    let digest = Sha256::digest(home_dir.to_string_lossy().as_bytes());
    let short = &hex::encode(digest)[..16];
    std::env::temp_dir().join(format!("term-host-{}.sock", short))
}

/// Liveness check via signal 0
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // EPERM still means the process exists
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Write a file readable only by the owner
pub fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Detector tuning
// ============================================================================

/// Tunables for the agent activity detectors and the turn-event watcher
///
/// The defaults were picked empirically for the agents enumerated in
/// `AgentKind`; they are not expected to transfer to other agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActivityConfig {
    /// Chunks within this many bytes of the previous chunk count as repeating
    pub tolerance_bytes: usize,
    /// Silence after the last novel chunk that ends a turn
    pub silence_ms: u64,
    /// Window after a turn ends during which re-arming is suppressed
    pub grace_ms: u64,
    /// Minimum spacing between re-arm process checks
    pub rearm_check_ms: u64,
    /// Novel bytes needed before a re-arm is considered
    pub rearm_min_bytes: usize,
    /// Rolling text buffer for prompt matching
    pub prompt_buffer_bytes: usize,
    /// Rolling line buffer for structured JSON output
    pub line_buffer_bytes: usize,
    /// Interval of the periodic "is the agent still running" check
    pub process_poll_ms: u64,
    /// Turn-event directory poll interval
    pub watcher_interval_ms: u64,
    /// Event files younger than this are left for the next poll
    pub watcher_settle_ms: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            tolerance_bytes: 2,
            silence_ms: 5_000,
            grace_ms: 3_000,
            rearm_check_ms: 3_000,
            rearm_min_bytes: 256,
            prompt_buffer_bytes: 4 * 1024,
            line_buffer_bytes: 64 * 1024,
            process_poll_ms: 2_000,
            watcher_interval_ms: 1_000,
            watcher_settle_ms: 250,
        }
    }
}

impl ActivityConfig {
    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn rearm_check(&self) -> Duration {
        Duration::from_millis(self.rearm_check_ms)
    }

    pub fn process_poll(&self) -> Duration {
        Duration::from_millis(self.process_poll_ms)
    }

    pub fn watcher_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_interval_ms)
    }

    pub fn watcher_settle(&self) -> Duration {
        Duration::from_millis(self.watcher_settle_ms)
    }
}
