//! autotest-drone-utility — executes a batch of drone calls.
//!
//! Reads a JSON array of calls on stdin and writes the JSON execution
//! report on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! autotest-drone-utility --max-transfer-processes 50 < calls.json
//! ```

use std::io::{Read, Write};

use anyhow::Context;
use autotest_drone::{DroneCall, DroneUtility};
use clap::Parser;
use tracing::debug;

#[derive(Parser)]
#[command(name = "autotest-drone-utility", about = "Autotest drone utility")]
struct Cli {
    /// Maximum concurrent file transfers.
    #[arg(long, default_value = "50")]
    max_transfer_processes: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading calls from stdin")?;
    let calls: Vec<DroneCall> = serde_json::from_str(&input).context("parsing drone calls")?;
    debug!(calls = calls.len(), "executing drone calls");

    let mut utility = DroneUtility::new(cli.max_transfer_processes);
    let report = utility.execute_calls(&calls);

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &report)?;
    stdout.flush()?;
    Ok(())
}
