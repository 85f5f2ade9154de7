// Daemon binary resolution
// Shared by the host client (to spawn the daemon) and the diagnostic CLI.

use std::path::{Path, PathBuf};

/// Environment variable naming the daemon binary explicitly
pub const DAEMON_BIN_ENV: &str = "TERM_HOST_DAEMON_BIN";

/// File name of the daemon binary on this platform
pub fn daemon_binary_name() -> &'static str {
    if cfg!(windows) {
        "term-host-daemon.exe"
    } else {
        "term-host-daemon"
    }
}

/// Find the daemon binary.
/// Resolution order:
/// 1) The explicit path, if given and present
/// 2) `TERM_HOST_DAEMON_BIN`
/// 3) Next to `current_exe()` (installed layout / cargo target dir)
/// 4) A `PATH` lookup
pub fn resolve_daemon_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
    }

    if let Ok(from_env) = std::env::var(DAEMON_BIN_ENV) {
        let candidate = PathBuf::from(from_env.trim());
        if !from_env.trim().is_empty() && candidate.is_file() {
            return Some(candidate);
        }
    }

    if let Some(candidate) = sibling_of_current_exe() {
        return Some(candidate);
    }

    find_in_path(daemon_binary_name())
}

fn sibling_of_current_exe() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;

    let candidate = dir.join(daemon_binary_name());
    if candidate.is_file() {
        return Some(candidate);
    }

    // Test binaries live one level down in target/<profile>/deps
    let candidate = dir.parent()?.join(daemon_binary_name());
    candidate.is_file().then_some(candidate)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
