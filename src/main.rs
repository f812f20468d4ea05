//! CLI entry point for rust-instr.
//!
//! Logs go to stderr, command output to stdout.

use anyhow::Result;
use clap::Parser;
use rust_instr::cli::{default_registry, execute, Cli};
use rust_instr::logging::{self, TracingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(TracingConfig::from_verbosity(cli.verbose).with_format(cli.log_format))
        .map_err(anyhow::Error::msg)?;

    let registry = default_registry();
    let output = execute(&cli, &registry).await?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}
