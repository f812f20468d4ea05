//! CLI command execution against the simulated instruments.

use clap::Parser;
use rust_instr::cli::{default_registry, execute, Cli};
use std::io::Write;
use tempfile::NamedTempFile;

fn config_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn run(args: &[&str]) -> anyhow::Result<String> {
    let cli = Cli::try_parse_from(args).unwrap();
    let registry = default_registry();
    tokio_test::block_on(execute(&cli, &registry))
}

const FG100: &str = r#"
driver = "SIM-FG100"
backend = "sim"

[interfaces.sim]
preset = "SIM-FG100"
"#;

#[test]
fn test_drivers_lists_catalog() {
    let out = run(&["rust-instr", "drivers"]).unwrap();
    assert!(out.contains("SIM-FG100"));
    assert!(out.contains("SIM-FG200"));
    assert!(out.contains("sim"));
}

#[test]
fn test_tree_describes_members() {
    let out = run(&["rust-instr", "tree", "--driver", "SIM-FG200"]).unwrap();
    assert!(out.contains("frequency"));
    assert!(out.contains("phase"));
    assert!(out.contains("output"));

    assert!(run(&["rust-instr", "tree"]).is_err());
}

#[test]
fn test_get_and_call() {
    let file = config_file(FG100);
    let config = file.path().to_str().unwrap();

    let out = run(&["rust-instr", "--config", config, "get", "frequency"]).unwrap();
    assert_eq!(out, "1000.0");

    let out = run(&["rust-instr", "--config", config, "get", "output[main].load"]).unwrap();
    assert_eq!(out, "50");

    let out = run(&["rust-instr", "--config", config, "--json", "call", "list_outputs"]).unwrap();
    assert_eq!(out, "[1,2]");
}

#[test]
fn test_set_validates_before_io() {
    let file = config_file(FG100);
    let config = file.path().to_str().unwrap();

    let out = run(&["rust-instr", "--config", config, "set", "trigger.level", "1.5"]).unwrap();
    assert!(out.is_empty());

    let err = run(&["rust-instr", "--config", config, "set", "frequency", "200000"]).unwrap_err();
    assert!(err.to_string().contains("out of bound"));

    let err = run(&["rust-instr", "--config", config, "get", "sweep_time"]).unwrap_err();
    assert!(err.to_string().contains("not available"));
}

#[test]
fn test_missing_config() {
    let err = run(&["rust-instr", "get", "frequency"]).unwrap_err();
    assert!(err.to_string().contains("--config"));

    let err = run(&["rust-instr", "--config", "/nonexistent.toml", "get", "frequency"]).unwrap_err();
    assert!(err.to_string().contains("failed to load"));
}
