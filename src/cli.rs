//! Command line front end.
//!
//! ```bash
//! rust-instr drivers
//! rust-instr tree --driver SIM-FG100
//! rust-instr --config config/fg100.toml get frequency
//! rust-instr --config config/fg100.toml set output[main].offset 0.25
//! rust-instr --config config/fg100.toml call list_outputs
//! ```
//!
//! Every invocation opens the instrument, runs one operation and closes it,
//! so nothing is cached between invocations.

use crate::logging::OutputFormat;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use instr_core::{load_instrument_config, DriverRegistry, Value};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "rust-instr")]
#[command(about = "Query and configure instruments through declarative drivers", long_about = None)]
pub struct Cli {
    /// Instrument configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Compact, global = true)]
    pub log_format: OutputFormat,

    /// Print values as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List registered drivers and backends
    Drivers,

    /// Print the member tree of a driver
    Tree {
        /// Driver name, defaults to the one in the configuration file
        #[arg(long)]
        driver: Option<String>,
    },

    /// Read a feature, e.g. `trigger.level` or `output[main].enabled`
    Get {
        /// Member path
        path: String,
    },

    /// Write a feature
    Set {
        /// Member path
        path: String,
        /// Value, parsed as bool, integer, float or text
        value: String,
    },

    /// Invoke an action
    Call {
        /// Member path
        path: String,
        /// Arguments, parsed like `set` values
        args: Vec<String>,
    },
}

/// Registry with every built-in driver and backend.
pub fn default_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    instr_sim::register_all(&mut registry);
    registry
}

fn render(value: &Value, json: bool) -> Result<String> {
    if json {
        serde_json::to_string(value).context("failed to serialize value")
    } else {
        Ok(value.to_string())
    }
}

/// Run one command, returning what should be printed on stdout.
pub async fn execute(cli: &Cli, registry: &DriverRegistry) -> Result<String> {
    match &cli.command {
        Commands::Drivers => {
            let mut out = String::new();
            writeln!(out, "drivers:")?;
            for name in registry.driver_names() {
                writeln!(out, "  {}", name)?;
            }
            writeln!(out, "backends:")?;
            for name in registry.backend_names() {
                writeln!(out, "  {}", name)?;
            }
            Ok(out.trim_end().to_string())
        }
        Commands::Tree { driver } => {
            let name = match (driver, &cli.config) {
                (Some(name), _) => name.clone(),
                (None, Some(path)) => load_instrument_config(path)?.driver,
                (None, None) => bail!("tree needs --driver or --config"),
            };
            let schema = registry.schema(&name)?;
            Ok(schema.describe().trim_end().to_string())
        }
        Commands::Get { path } => {
            let driver = connect(cli, registry).await?;
            let value = driver.get_path(path).await?;
            driver.close().await?;
            render(&value, cli.json)
        }
        Commands::Set { path, value } => {
            let driver = connect(cli, registry).await?;
            driver.set_path(path, Value::parse_literal(value)).await?;
            info!(path = %path, value = %value, "feature written");
            driver.close().await?;
            Ok(String::new())
        }
        Commands::Call { path, args } => {
            let args: Vec<Value> = args.iter().map(|a| Value::parse_literal(a)).collect();
            let driver = connect(cli, registry).await?;
            let result = driver.invoke_path(path, &args).await?;
            driver.close().await?;
            render(&result, cli.json)
        }
    }
}

async fn connect(cli: &Cli, registry: &DriverRegistry) -> Result<instr_core::Driver> {
    let Some(path) = &cli.config else {
        bail!("--config is required for this command");
    };
    let config = load_instrument_config(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let driver = registry
        .connect(&config)
        .await
        .with_context(|| format!("failed to open {}", config.driver))?;
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::try_parse_from([
            "rust-instr",
            "-vv",
            "--config",
            "fg.toml",
            "set",
            "output[main].offset",
            "0.25",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, OutputFormat::Compact);
        match cli.command {
            Commands::Set { path, value } => {
                assert_eq!(path, "output[main].offset");
                assert_eq!(value, "0.25");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["rust-instr", "call", "list_outputs", "--json"]).unwrap();
        assert!(cli.json);
        assert!(Cli::try_parse_from(["rust-instr", "set", "frequency"]).is_err());
    }

    #[test]
    fn test_render_json() {
        let value = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(render(&value, true).unwrap(), "[1,2]");
        assert_eq!(render(&value, false).unwrap(), "[1, 2]");
    }
}
