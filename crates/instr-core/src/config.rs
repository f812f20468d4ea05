//! Instrument configuration.
//!
//! An instrument file names the driver to instantiate, the backend to talk
//! through and the session settings. `interfaces` and `defaults` are handed
//! to the backend factory untouched.
//!
//! Sources, later ones overriding earlier ones:
//! 1. the TOML file
//! 2. environment variables prefixed with `INSTR_`, nested keys separated by
//!    `__` (e.g. `INSTR_SESSION__TIMEOUT_MS=500`)
//!
//! ```toml
//! driver = "SIM-FG100"
//! backend = "sim"
//!
//! [session]
//! timeout_ms = 2000
//! caching_allowed = true
//!
//! [interfaces.sim]
//! preset = "SIM-FG100"
//! ```

use crate::error::{InstrError, InstrResult};
use crate::limits::{exchange_timeout, DEFAULT_EXCHANGE_TIMEOUT_MS};
use crate::session::SessionOptions;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "INSTR_";

/// One instrument to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Registered driver name, e.g. `SIM-FG100`.
    pub driver: String,
    /// Registered backend type, e.g. `sim`.
    pub backend: String,
    /// Per-backend connection parameters keyed by backend type.
    #[serde(default)]
    pub interfaces: toml::Table,
    /// Backend defaults shared by all interfaces.
    #[serde(default)]
    pub defaults: toml::Table,
    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
}

/// `[session]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Exchange timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// When false only options features are cached.
    #[serde(default = "default_caching_allowed")]
    pub caching_allowed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            caching_allowed: default_caching_allowed(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_EXCHANGE_TIMEOUT_MS
}

fn default_caching_allowed() -> bool {
    true
}

impl InstrumentConfig {
    /// Minimal configuration for `driver` over `backend`.
    pub fn new(driver: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            backend: backend.into(),
            interfaces: toml::Table::new(),
            defaults: toml::Table::new(),
            session: SessionConfig::default(),
        }
    }

    /// Connection parameters for the configured backend, empty if absent.
    pub fn interface(&self) -> toml::Table {
        self.interfaces
            .get(&self.backend)
            .and_then(|v| v.as_table())
            .cloned()
            .unwrap_or_default()
    }

    /// Check the configuration, reporting every problem at once.
    pub fn validate(&self) -> InstrResult<()> {
        let mut errors = Vec::new();
        if self.driver.trim().is_empty() {
            errors.push("driver must not be empty".to_string());
        }
        if self.backend.trim().is_empty() {
            errors.push("backend must not be empty".to_string());
        }
        if let Err(e) = exchange_timeout(self.session.timeout_ms) {
            errors.push(e.to_string());
        }
        if !self.interfaces.is_empty() && !self.interfaces.contains_key(&self.backend) {
            errors.push(format!(
                "no [interfaces.{}] table for the selected backend",
                self.backend
            ));
        }
        for (name, value) in &self.interfaces {
            if !value.is_table() {
                errors.push(format!("interfaces.{} must be a table", name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(InstrError::Config(errors.join("; ")))
        }
    }

    /// Session options derived from the `[session]` table.
    pub fn session_options(&self) -> InstrResult<SessionOptions> {
        Ok(SessionOptions {
            timeout: exchange_timeout(self.session.timeout_ms)?,
            caching_allowed: self.session.caching_allowed,
        })
    }
}

fn extract(figment: Figment) -> InstrResult<InstrumentConfig> {
    let config: InstrumentConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| InstrError::Config(e.to_string()))?;
    config.validate()?;
    debug!(driver = %config.driver, backend = %config.backend, "instrument config loaded");
    Ok(config)
}

/// Load an instrument file, apply environment overrides and validate.
pub fn load_instrument_config(path: &Path) -> InstrResult<InstrumentConfig> {
    if !path.exists() {
        return Err(InstrError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    extract(Figment::new().merge(Toml::file(path)))
}

/// Same as [`load_instrument_config`] for in-memory TOML.
pub fn load_instrument_config_from_str(text: &str) -> InstrResult<InstrumentConfig> {
    extract(Figment::new().merge(Toml::string(text)))
}
