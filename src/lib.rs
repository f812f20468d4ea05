//! # rust-instr
//!
//! Command line front end and logging setup around the instrument engine.
//!
//! - **`instr_core`**: declarative driver schemas, cached feature
//!   resolution, options gating and the node tree.
//! - **`instr_sim`**: simulated function generators usable without hardware.
//! - **`cli`**: argument parsing and command execution.
//! - **`logging`**: tracing subscriber setup.

pub mod cli;
pub mod logging;

pub use instr_core;
pub use instr_sim;
