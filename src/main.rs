//! ime-broker: per-user launcher and message broker for input-method
//! backend processes.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};

use ime_broker::config::BrokerConfig;
use ime_broker::ipc::{self, EndpointPath};
use ime_broker::protocol::QUIT_MESSAGE;
use ime_broker::registry::Registry;
use ime_broker::server::PipeServer;

#[derive(Debug, Parser)]
#[command(name = "ime-broker", version, about = "Message broker for input-method backends")]
struct Cli {
    /// Ask a running broker instance to quit, then exit.
    #[arg(long)]
    quit: bool,

    /// Broker directory holding backend definitions (defaults to the
    /// directory containing this executable).
    #[arg(long, value_name = "PATH")]
    dir: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence all log output.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    run(cli)
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Off
    } else {
        match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_level(level)
        .try_init()
        .ok();
}

// The broker is one cooperative event loop; a single-threaded runtime
// is all it needs.
#[tokio::main(flavor = "current_thread")]
async fn run(cli: Cli) -> Result<()> {
    let endpoint = EndpointPath::per_user();

    if cli.quit {
        return quit_existing(&endpoint).await;
    }

    #[cfg(windows)]
    register_restart();

    let broker_dir = match cli.dir {
        Some(dir) => dir,
        None => BrokerConfig::default_dir()?,
    };
    let config = BrokerConfig::load(&broker_dir)?;
    if config.backends.is_empty() {
        warn!(
            "no backend definitions found in {}",
            config.broker_dir.display()
        );
    }

    let registry = Arc::new(Registry::from_config(&config));
    PipeServer::new(registry).run(&endpoint).await
}

/// Ask the broker instance on the well-known endpoint to exit. Finding
/// no running instance is not an error.
async fn quit_existing(endpoint: &EndpointPath) -> Result<()> {
    match ipc::connect(endpoint).await {
        Ok(connection) => {
            let (_reader, mut writer) = connection.split();
            writer
                .write_message(QUIT_MESSAGE)
                .await
                .context("sending quit to the running broker")?;
            info!("asked the running broker to quit");
        }
        Err(err) => info!("no running broker instance found: {err}"),
    }
    Ok(())
}

/// Ask the OS to relaunch the broker if it crashes.
#[cfg(windows)]
fn register_restart() {
    use windows_sys::Win32::System::Recovery::RegisterApplicationRestart;

    // SAFETY: a null command line restarts with the original arguments.
    let result = unsafe { RegisterApplicationRestart(std::ptr::null(), 0) };
    if result != 0 {
        warn!("RegisterApplicationRestart failed (hresult {result:#x})");
    }
}
