mod app;
mod availability;
mod config;
mod connectivity;
mod data_supplier;
mod download;
mod lifecycle;
mod logging;
mod protocol;
mod router;
mod signaling;
mod speed;
mod storage;

use std::{env, path::PathBuf, process::exit};

use clap::Parser;
use log::{error, info};

use crate::app::{App, Mode};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), long_about = None)]
struct Args {
    /// Location of configuration file
    #[arg(short, long, value_name = "/path/to/config.yaml")]
    config: String,

    /// Enable debug output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Download a share instead of running the sync session
    #[arg(long, value_name = "HASH", requires = "download_directory")]
    share: Option<String>,

    /// Where a share download is written
    #[arg(long, value_name = "/path/to/directory")]
    download_directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.verbose >= 1 {
        env::set_var("RUST_BACKTRACE", "1");
    }

    if let Err(e) = logging::setup_logger(logging::level_for_verbosity(args.verbose)) {
        eprintln!("Failed to initialize logger: {e}. ");
        exit(1);
    }

    info!("Started {} version {}. ", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received SIGINT, shutting down. ");
        exit(0);
    }) {
        error!("Failed to set SIGINT handler: {e}. ");
        exit(1);
    }

    let config = match config::Config::new(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to parse configuration file: {e}. ");
            exit(1);
        },
    };

    let mode = match (args.share, args.download_directory) {
        (Some(share_hash), Some(download_directory)) => Mode::Share {
            share_hash,
            download_directory,
        },
        _ => Mode::Sync,
    };

    let app = match App::new(&args.config, config, mode) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Program failed: {e}. ");
            exit(1);
        },
    };

    if let Err(e) = app.start().await {
        eprintln!("Program failed: {e}. ");
        exit(1);
    }
}
