// Skiff for Linux: signaling relay plus send/receive endpoints.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use skiff_core::RoomCode;
use skiff_linux::config::{self, Config};
use skiff_linux::files::DiskFile;
use skiff_linux::host::{Host, HostHandle, Mode};
use skiff_linux::storage::{SavePrompt, StdinPrompt};
use skiff_linux::{logging, relay};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "skiff", version, about = "Direct peer-to-peer file transfer")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Config file (default: ~/.config/skiff/config.toml, then /etc/skiff/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the signaling relay.
    Relay {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Open a room and send files to whoever joins it.
    Send {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        relay: Option<String>,
    },
    /// Join a room by code and receive its files.
    Receive {
        code: String,
        #[arg(long)]
        relay: Option<String>,
        /// Directory for received files.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let cfg = config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cli.command, cfg));
    // A pending stdin prompt would otherwise hold the runtime open.
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(command: Command, mut cfg: Config) -> anyhow::Result<()> {
    match command {
        Command::Relay { bind } => {
            let bind = bind.unwrap_or_else(|| cfg.relay_bind.clone());
            let listener = TcpListener::bind(&bind)
                .await
                .with_context(|| format!("binding relay to {bind}"))?;
            tokio::select! {
                res = relay::serve(listener, cfg.transfer.relay_disconnect_delay()) => res?,
                res = shutdown_signal() => {
                    res?;
                    info!(event = "relay_stopped");
                }
            }
            Ok(())
        }
        Command::Send { files, relay } => {
            if let Some(relay) = relay {
                cfg.relay_addr = relay;
            }
            DiskFile::open_all(&files).await.context("checking files to send")?;
            session(Mode::Send(files), cfg).await
        }
        Command::Receive { code, relay, out } => {
            let code = RoomCode::parse(&code).context("invalid room code")?;
            if let Some(relay) = relay {
                cfg.relay_addr = relay;
            }
            if let Some(out) = out {
                cfg.download_dir = out;
            }
            tokio::fs::create_dir_all(&cfg.download_dir)
                .await
                .with_context(|| format!("creating {}", cfg.download_dir.display()))?;
            session(Mode::Receive(code), cfg).await
        }
    }
}

async fn session(mode: Mode, cfg: Config) -> anyhow::Result<()> {
    let prompt = cfg
        .prompt_before_streaming
        .then(|| Box::new(StdinPrompt) as Box<dyn SavePrompt>);
    let (host, handle) = Host::connect(mode, cfg, prompt).await?;
    tokio::spawn(forward_signals(handle));
    let summary = host.run().await?;
    info!(
        event = "session_done",
        room = ?summary.room.as_ref().map(RoomCode::as_str),
        saved = summary.saved.len(),
        complete = summary.batch_complete
    );
    Ok(())
}

/// Ctrl+C cancels a running batch (or ends the session when idle), SIGTERM ends it,
/// SIGUSR1/SIGUSR2 mark the process as backgrounded/foregrounded.
async fn forward_signals(handle: HostHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut term), Ok(mut usr1), Ok(mut usr2)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        ) else {
            warn!(event = "signals_unavailable");
            return;
        };
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_err() {
                        return;
                    }
                    handle.interrupt();
                }
                _ = term.recv() => handle.terminate(),
                _ = usr1.recv() => handle.backgrounded(),
                _ = usr2.recv() => handle.foregrounded(),
            }
        }
    }
    #[cfg(not(unix))]
    while tokio::signal::ctrl_c().await.is_ok() {
        handle.interrupt();
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
