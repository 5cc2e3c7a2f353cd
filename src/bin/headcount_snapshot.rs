//! headcount_snapshot - run one capture-detect cycle and write the result
//!
//! Useful for checking camera placement and detector settings without
//! starting the service.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use headcount::{encoding::decode_base64_image, HeadcountConfig, HeadcountService};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "HEADCOUNT_CONFIG")]
    config: Option<PathBuf>,

    /// Where to write the annotated JPEG.
    #[arg(long, default_value = "headcount_snapshot.jpg")]
    out: PathBuf,

    /// Print the JSON payload instead of a summary line.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = HeadcountConfig::load_from(args.config.as_deref())?;
    let service = HeadcountService::from_config(&config)?;

    let payload = service
        .headcount()
        .map_err(|err| anyhow!("capture failed ({}): {}", err.kind(), err))?;
    let jpeg = decode_base64_image(&payload.image)?;
    std::fs::write(&args.out, &jpeg)
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    if args.json {
        println!("{}", serde_json::to_string(&payload)?);
    } else {
        println!("headcount: {} ({})", payload.headcount, args.out.display());
    }
    Ok(())
}
