//! SPEED CLI - exercises the messaging bus from the command line.
//!
//! This is the main binary entry point. See the `speed` library for the
//! core runtime.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use speed::{Config, Coordinator, ThreadMode};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "speed")]
#[command(version)]
#[command(about = "Local filesystem-backed inter-process messaging bus")]
struct Cli {
    /// This process's name on the bus.
    #[arg(long)]
    name: String,

    /// Path to a file holding the Base64-encoded shared key.
    #[arg(long)]
    key_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize a peer and send it one message.
    Send {
        /// Peer name to authorize and message.
        receiver: String,
        /// Message text.
        text: String,
    },
    /// Send a PING to a peer.
    Ping {
        /// Peer name.
        receiver: String,
    },
    /// Authorize a peer without sending anything.
    AddProcess {
        /// Peer name to authorize.
        name: String,
    },
    /// Run the watcher and print every message received, until a signal.
    Listen,
    /// Announce exit and remove this process's marker file.
    Kill,
}

fn build_coordinator(cli: &Cli) -> Result<Coordinator> {
    let config = Config::from_env();
    let coordinator = Coordinator::new(cli.name.clone(), ThreadMode::Multi, config)
        .with_context(|| format!("failed to start coordinator for {}", cli.name))?;

    let key_contents = std::fs::read_to_string(&cli.key_file)
        .with_context(|| format!("failed to read key file {}", cli.key_file))?;
    coordinator.set_key_file(&key_contents)?;

    Ok(coordinator)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        default_hook(panic_info);
    }));

    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let cli = Cli::parse();
    let coordinator = build_coordinator(&cli)?;

    match &cli.command {
        Commands::Send { receiver, text } => {
            coordinator.add_process(receiver)?;
            // The handshake completes asynchronously once the watcher is
            // running; start it before retrying the send.
            coordinator.start(ThreadMode::Multi)?;
            let mut last_err = None;
            for _ in 0..50 {
                match coordinator.send(text, receiver) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        last_err = Some(e);
                        std::thread::sleep(std::time::Duration::from_millis(100));
                    }
                }
            }
            if let Some(e) = last_err {
                coordinator.kill()?;
                return Err(e.into());
            }
            println!("sent to {receiver}");
            coordinator.kill()?;
        }
        Commands::Ping { receiver } => {
            coordinator.add_process(receiver)?;
            coordinator.start(ThreadMode::Multi)?;
            coordinator.ping(receiver)?;
            println!("pinged {receiver}");
            coordinator.kill()?;
        }
        Commands::AddProcess { name } => {
            coordinator.start(ThreadMode::Multi)?;
            coordinator.add_process(name)?;
            println!("authorized {name}");
            coordinator.kill()?;
        }
        Commands::Listen => {
            coordinator.set_callback(Arc::new(|msg| {
                println!("[{}] {}", msg.sender_name, msg.payload_text);
            }));
            coordinator.start(ThreadMode::Multi)?;
            log::info!("{} listening on {}", cli.name, coordinator.bus_dir().display());

            while !SHUTDOWN_FLAG.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            println!("shutting down...");
            coordinator.kill()?;
        }
        Commands::Kill => {
            coordinator.kill()?;
            println!("{} left the bus", cli.name);
        }
    }

    Ok(())
}
