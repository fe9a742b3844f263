//! smser: forward SMS and USSD balance checks from GSM modems to Telegram.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use smser::config::DEFAULT_CONFIG_PATH;
use smser::{load_config, App};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Forward SMS and USSD balance checks from GSM modems to Telegram chats.
#[derive(Parser, Debug)]
#[command(name = "smser", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Same as CONFIG.
    #[arg(long = "config-file", value_name = "CONFIG", conflicts_with = "config")]
    config_file: Option<PathBuf>,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        self.config_file
            .clone()
            .or_else(|| self.config.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .init();

    let args = Args::parse();
    let path = args.config_path();

    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!("Failed to install Ctrl-C handler: {}", e);
        return ExitCode::FAILURE;
    }

    let app = match App::start(&config) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Initialized, reading from {} devices", app.devices().len());
    let _ = stop_rx.recv();
    app.shutdown();
    info!("Exiting");
    ExitCode::SUCCESS
}
