// term-host: diagnostics and hook entry point for the terminal host
//
// Commands:
//   term-host list
//   term-host kill <session-id>
//   term-host shutdown [--kill-sessions]
//   term-host watch
//   term-host emit-turn --workspace <id> --agent <agent> --type <type> [--outcome <o>] [--session <id>]
//
// Daemon commands never spawn a daemon; they report when none is running.

use agent_term_host::activity::{AgentKind, Outcome, TurnEventBus, TurnEventType, TurnEventWatcher};
use agent_term_host::logging;
use agent_term_host::session::client::{ClientError, ClientOptions, DaemonLauncher, HostClient};
use agent_term_host::session::config::Config;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "term-host", version, about = "Terminal host diagnostics and turn event hooks")]
struct Cli {
    /// Host home directory (defaults to $TERM_HOST_HOME or ~/.agent-term-host)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sessions hosted by the running daemon
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Kill a hosted session
    Kill { session_id: String },
    /// Stop the daemon
    Shutdown {
        /// Terminate every session first
        #[arg(long)]
        kill_sessions: bool,
    },
    /// Follow the turn event directory and print activity changes
    Watch,
    /// Publish one turn event (for agents with their own hooks)
    EmitTurn {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        agent: AgentKind,
        #[arg(long = "type")]
        event_type: TurnEventType,
        #[arg(long)]
        outcome: Option<Outcome>,
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("warn");

    let config = match cli.home {
        Some(home) => Config::for_home(home),
        None => Config::from_env(),
    };

    match cli.command {
        Command::List { json } => list(&config, json).await,
        Command::Kill { session_id } => {
            let client = connect(&config).await?;
            client
                .kill(&session_id)
                .await
                .with_context(|| format!("Failed to kill {}", session_id))?;
            println!("Killed {}", session_id);
            Ok(())
        }
        Command::Shutdown { kill_sessions } => {
            let client = connect(&config).await?;
            client.shutdown(kill_sessions).await.context("Shutdown failed")?;
            println!("Terminal host stopping");
            Ok(())
        }
        Command::Watch => watch(&config).await,
        Command::EmitTurn {
            workspace,
            agent,
            event_type,
            outcome,
            session,
        } => {
            let bus = TurnEventBus::from_config(&config);
            match bus.emit_turn_event(Some(&workspace), agent, event_type, session.as_deref(), outcome)? {
                Some(path) => println!("{}", path.display()),
                None => eprintln!("No workspace given; nothing written"),
            }
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> Result<HostClient> {
    let client = HostClient::new(
        config.clone(),
        ClientOptions {
            launcher: DaemonLauncher::Never,
            ..ClientOptions::default()
        },
    );
    match client.ensure_connected().await {
        Ok(()) => Ok(client),
        Err(ClientError::NotRunning(_)) => {
            anyhow::bail!("Terminal host is not running ({})", config.socket_path.display())
        }
        Err(e) => Err(e).context("Failed to connect to terminal host"),
    }
}

async fn list(config: &Config, json: bool) -> Result<()> {
    let client = connect(config).await?;
    let sessions = client.list_sessions().await.context("Failed to list sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    println!(
        "{:<24} {:<16} {:>8} {:>9} {:>12} {:>8}",
        "SESSION", "WORKSPACE", "PID", "SIZE", "OUTPUT", "CLIENTS"
    );
    for session in sessions {
        println!(
            "{:<24} {:<16} {:>8} {:>9} {:>12} {:>8}",
            session.session_id,
            session.workspace_id,
            session
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            format!("{}x{}", session.cols, session.rows),
            session.output_seq,
            session.attached_clients
        );
    }
    Ok(())
}

async fn watch(config: &Config) -> Result<()> {
    let activity = config.load_activity_config();
    let watcher = TurnEventWatcher::new(config.events_dir(), activity.watcher_settle());
    println!("Watching {}", watcher.dir().display());

    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn(watcher.run(activity.watcher_interval(), tx));

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                if let Some(active) = update.active_workspaces {
                    let list: Vec<&str> = active.iter().map(String::as_str).collect();
                    println!("active: [{}]", list.join(", "));
                }
                for n in update.notifications {
                    let agent = n.agent.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
                    let outcome = n
                        .outcome
                        .map(|o| format!("{:?}", o).to_lowercase())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "done: workspace={} agent={} outcome={} session={}{}",
                        n.workspace_id,
                        agent,
                        outcome,
                        n.session_id.as_deref().unwrap_or("-"),
                        if n.synthesized { " (inferred)" } else { "" }
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    task.abort();
    Ok(())
}
