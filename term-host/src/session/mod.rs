// Session management for the terminal host
// Shared between the daemon, the diagnostic CLI and embedders

pub mod config;
pub mod protocol;
pub mod registry;
pub mod replay;
pub mod runtime;
pub mod spawn_lock;

// In-process manager (no daemon)
pub mod local;

// Daemon and client speak over Unix sockets
#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;
