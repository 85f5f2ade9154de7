// Persistent terminal session host with heuristic agent turn detection

// Session daemon, client, protocol and in-process manager
pub mod session;

// Agent activity detectors and the turn event bus
pub mod activity;

// Locating the daemon binary (shared between client and CLI)
pub mod cli_paths;

pub mod logging;

// Polling helpers for unit tests
#[cfg(test)]
pub(crate) mod test_utils;
