// term-host-daemon: owns PTY sessions independently of any GUI process
//
// Responsibilities:
// - Claim the host home (stale socket / PID cleanup, single instance)
// - Serve the newline-delimited JSON protocol on a Unix socket
// - Keep sessions alive across client reconnects
// - Shut down on request or on SIGINT/SIGTERM

use agent_term_host::logging;
use agent_term_host::session::config::Config;
use agent_term_host::session::server::HostServer;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "term-host-daemon", version, about = "Persistent terminal session host")]
struct Cli {
    /// Host home directory (defaults to $TERM_HOST_HOME or ~/.agent-term-host)
    #[arg(long)]
    home: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("info");

    let config = match cli.home {
        Some(home) => Config::for_home(home),
        None => Config::from_env(),
    };

    // Single-threaded event loop; PTY I/O runs on its own threads
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let server = HostServer::bind(config.clone())
        .await
        .with_context(|| format!("Failed to start terminal host in {}", config.home_dir.display()))?;

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Signal received, stopping");
        handle.shutdown(false);
    });

    server.run().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
