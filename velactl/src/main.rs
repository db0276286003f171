//! `velactl`: operator CLI for `vela-daemon`'s Unix control socket.
//!
//! Grounded on `kldctl`'s shape (a `clap::Subcommand` tree that builds a
//! `Request`, connects a `UnixStream`, and pretty-prints the `Response`),
//! trimmed to the commands spec §6's control protocol actually exposes.

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use vela_common::{Request, Response};

#[derive(Parser)]
#[command(name = "velactl", version, about = "Control utility for vela-daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon control socket path.
    #[arg(short, long, global = true, default_value = "/tmp/vela.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the orchestrator's current level and per-level player status.
    #[command(visible_alias = "st")]
    Status,

    /// Force a level change, as if a `change_play_level` request arrived.
    ChangeLevel { level: u32 },

    /// Override one AGD threshold (1-indexed).
    SetThreshold { level: u32, value: i64 },

    /// Change a namespace's log level at runtime.
    SetLogLevel { namespace: String, level: String },

    /// Stop the daemon gracefully.
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Status => Request::Status,
        Commands::ChangeLevel { level } => Request::ChangeLevel { level },
        Commands::SetThreshold { level, value } => Request::SetThreshold { level, value },
        Commands::SetLogLevel { namespace, level } => Request::SetLogLevel { namespace, level },
        Commands::Shutdown => Request::Shutdown,
    };

    let mut stream = match UnixStream::connect(&cli.socket).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("failed to connect to daemon at {}: {e}", cli.socket);
            eprintln!("is vela-daemon running?");
            std::process::exit(1);
        }
    };

    let encoded = serde_json::to_vec(&request)?;
    stream.write_all(&encoded).await?;
    stream.shutdown().await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;

    match serde_json::from_slice::<Response>(&raw) {
        Ok(Response::Ok) => println!("OK"),
        Ok(Response::Error { message }) => {
            eprintln!("error: {message}");
            std::process::exit(1);
        }
        Ok(Response::Status(status)) => {
            println!(
                "current level: {}",
                status
                    .current_level
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "none (rest loop)".to_string())
            );
            println!("agd: sum={} last_level={}", status.agd_sum, status.agd_last_level);
            println!("{:<6} | {:<10} | {:<40} | {}", "level", "state", "media", "bus name");
            println!("{}", "-".repeat(80));
            for level in status.levels {
                println!(
                    "{:<6} | {:<10} | {:<40} | {}",
                    level.level, level.state, level.media, level.bus_name
                );
            }
        }
        Err(e) => {
            eprintln!("malformed response from daemon: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}
