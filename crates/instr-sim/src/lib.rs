//! Simulated instruments for `instr-core`.
//!
//! Provides an in-memory SCPI style instrument usable without hardware and
//! the demonstration driver catalog built on it.
//!
//! - [`SimInstrument`]: register-table instrument with command log and
//!   failure injection
//! - [`SimBackendFactory`]: `sim` backend for [`DriverRegistry`](instr_core::DriverRegistry)
//! - [`catalog`]: `SIM-FG100` and the derived `SIM-FG200`
//!
//! ```rust,ignore
//! use instr_core::DriverRegistry;
//!
//! let mut registry = DriverRegistry::new();
//! instr_sim::register_all(&mut registry);
//! let driver = registry.connect(&config).await?;
//! ```

pub mod catalog;
mod sim;

pub use catalog::register_all;
pub use sim::{Exchange, ExchangeKind, SimBackend, SimBackendFactory, SimConfig, SimInstrument, NO_ERROR};
