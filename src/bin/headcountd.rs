//! headcountd - headcount HTTP service
//!
//! This daemon:
//! 1. Loads and validates the configuration
//! 2. Opens the camera and loads the detector (fatal on failure)
//! 3. Serves `/capture`, `/headcount` and `/health` until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use headcount::{api::ApiServer, HeadcountConfig, HeadcountService};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "HEADCOUNT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = HeadcountConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api.addr = addr;
    }

    log::info!("camera source: {}", config.camera.source);
    log::info!("detector: {:?}", config.detector.kind);
    let service = Arc::new(HeadcountService::from_config(&config)?);

    let api_handle = ApiServer::new(config.api.clone(), service).spawn()?;
    log::info!("headcount api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("headcountd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
