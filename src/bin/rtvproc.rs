use chrono::NaiveDateTime;
use clap::Parser;
use rtvproc::config::{Config, RunMode};
use rtvproc::process;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub type BinResult<T, E = Box<dyn std::error::Error + Send + Sync>> = Result<T, E>;

fn main() {
    if let Err(e) = bin_main() {
        eprintln!("error: {e}");
        if let Some(e) = e.source() {
            eprintln!("error: {e}")
        }
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Processing domain, e.g. uswc
    #[arg(short, long)]
    domain: String,

    /// Grid resolution, e.g. 6km
    #[arg(short, long)]
    resolution: String,

    /// Configuration file path
    #[arg(short, long)]
    config: PathBuf,

    /// Hour to reprocess (RFC 3339 without zone, e.g. 2024-01-02T10:00:00);
    /// repeatable. Near real-time processing runs when absent.
    #[arg(long = "reprocess-time")]
    reprocess_times: Vec<NaiveDateTime>,

    /// Skip process locking while reprocessing
    #[arg(long)]
    no_reprocess_lock: bool,
}

fn bin_main() -> BinResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let c = Config::load(&args.config, &args.domain, &args.resolution)?;
    let mode = if args.reprocess_times.is_empty() {
        RunMode::Normal
    } else {
        RunMode::Reprocess {
            times: args.reprocess_times,
            lock: !args.no_reprocess_lock,
        }
    };

    process::process(&c, &mode)?;
    Ok(())
}
