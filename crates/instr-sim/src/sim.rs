//! In-memory SCPI style instrument.
//!
//! [`SimInstrument`] keeps a table of query responses ("registers"). A write
//! `HDR arg` stores `arg` as the response of `HDR?`, `*RST` restores the
//! initial table and `SYST:ERR?` pops the error queue. Every command is
//! logged so tests can assert exactly what went over the wire.
//!
//! Failure injection:
//! - [`reject_header`](SimInstrument::reject_header): writes to a header are
//!   answered with an error token and queued as an SCPI error
//! - [`stall_for`](SimInstrument::stall_for): every reply is delayed
//! - [`disconnect`](SimInstrument::disconnect): every exchange fails
//!
//! ```rust,ignore
//! let instrument = SimInstrument::preset("SIM-FG100")?;
//! let driver = Driver::open(catalog::fg100()?, instrument.backend(), SessionOptions::default());
//! driver.set("frequency", 250.5).await?;
//! assert_eq!(instrument.register("FREQ?").as_deref(), Some("250.50"));
//! ```

use crate::catalog;
use async_trait::async_trait;
use futures::future::BoxFuture;
use instr_core::error::{BackendError, InstrError, InstrResult};
use instr_core::registry::BackendFactory;
use instr_core::session::{substitute, BackendAdapter};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Reply to `SYST:ERR?` when the error queue is empty.
pub const NO_ERROR: &str = "0,\"No error\"";

const ERROR_QUERY: &str = "SYST:ERR?";
const RESET: &str = "*RST";

/// Direction of a logged exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// A `?` command.
    Query,
    /// A command without reply.
    Write,
}

/// One command received by the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Direction.
    pub kind: ExchangeKind,
    /// Command as received.
    pub command: String,
}

#[derive(Debug)]
struct SimState {
    registers: BTreeMap<String, String>,
    initial: BTreeMap<String, String>,
    ack: String,
    unknown_query: Option<String>,
    rejects: HashMap<String, String>,
    errors: VecDeque<String>,
    log: Vec<Exchange>,
    stall: Option<Duration>,
    connected: bool,
}

/// Shared handle to a simulated instrument.
///
/// Clones share state, so a test can keep one handle while the driver owns
/// the backend built from another.
#[derive(Debug, Clone)]
pub struct SimInstrument {
    state: Arc<Mutex<SimState>>,
}

impl SimInstrument {
    /// Instrument answering from `registers`, acknowledging writes with `ack`.
    pub fn new<K, V>(registers: impl IntoIterator<Item = (K, V)>, ack: impl Into<String>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let registers: BTreeMap<String, String> = registers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                initial: registers.clone(),
                registers,
                ack: ack.into(),
                unknown_query: None,
                rejects: HashMap::new(),
                errors: VecDeque::new(),
                log: Vec::new(),
                stall: None,
                connected: true,
            })),
        }
    }

    /// Instrument preloaded with the power-on state of a catalog model.
    pub fn preset(model: &str) -> InstrResult<Self> {
        let registers = catalog::preset_registers(model).ok_or_else(|| {
            InstrError::Config(format!("no simulator preset for model '{}'", model))
        })?;
        Ok(Self::new(registers, catalog::preset_ack(model)))
    }

    /// Reply used for queries with no register instead of failing.
    pub fn with_unknown_query(self, reply: impl Into<String>) -> Self {
        self.state.lock().unknown_query = Some(reply.into());
        self
    }

    /// Backend adapter talking to this instrument.
    pub fn backend(&self) -> Box<dyn BackendAdapter> {
        Box::new(SimBackend {
            instrument: self.clone(),
        })
    }

    /// Set the raw reply of a read-only `query`.
    pub fn set_register(&self, query: &str, reply: &str) {
        self.state
            .lock()
            .registers
            .insert(query.to_string(), reply.to_string());
    }

    /// Raw reply of `query`, if registered.
    pub fn register(&self, query: &str) -> Option<String> {
        self.state.lock().registers.get(query).cloned()
    }

    /// Answer writes to `header` with `token` and queue an SCPI error.
    pub fn reject_header(&self, header: &str, token: &str) {
        self.state
            .lock()
            .rejects
            .insert(header.to_string(), token.to_string());
    }

    /// Stop rejecting writes to `header`.
    pub fn accept_header(&self, header: &str) {
        self.state.lock().rejects.remove(header);
    }

    /// Queue an entry for the error query.
    pub fn push_error(&self, error: impl Into<String>) {
        self.state.lock().errors.push_back(error.into());
    }

    /// Delay every reply by `delay`, `None` to answer immediately.
    pub fn stall_for(&self, delay: Option<Duration>) {
        self.state.lock().stall = delay;
    }

    /// Fail every exchange until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Accept exchanges again.
    pub fn reconnect(&self) {
        self.state.lock().connected = true;
    }

    /// Number of commands received.
    pub fn exchange_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Every exchange received, in order.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.state.lock().log.clone()
    }

    /// Commands received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    /// Forget the exchange log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    // -------------------------------------------------------------------------
    // Command handling
    // -------------------------------------------------------------------------

    fn begin(&self, kind: ExchangeKind, command: &str) -> Result<Option<Duration>, BackendError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BackendError::Closed);
        }
        state.log.push(Exchange {
            kind,
            command: command.to_string(),
        });
        Ok(state.stall)
    }

    fn answer(&self, command: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        if command == ERROR_QUERY {
            return Ok(state
                .errors
                .pop_front()
                .unwrap_or_else(|| NO_ERROR.to_string()));
        }
        match state.registers.get(command) {
            Some(reply) => Ok(reply.clone()),
            None => match &state.unknown_query {
                Some(reply) => Ok(reply.clone()),
                None => {
                    state
                        .errors
                        .push_back("-113,\"Undefined header\"".to_string());
                    Err(BackendError::Protocol(format!(
                        "undefined header '{}'",
                        command
                    )))
                }
            },
        }
    }

    fn apply_write(&self, command: &str) -> String {
        let mut state = self.state.lock();
        if command == RESET {
            state.registers = state.initial.clone();
            state.errors.clear();
            debug!("simulator reset");
            return state.ack.clone();
        }
        let (header, arg) = match command.split_once(' ') {
            Some((header, arg)) => (header, Some(arg.trim())),
            None => (command, None),
        };
        if let Some(token) = state.rejects.get(header).cloned() {
            state.errors.push_back(format!("-222,\"{}\"", token));
            debug!(header, token = %token, "simulator rejected write");
            return token;
        }
        if let Some(arg) = arg {
            state
                .registers
                .insert(format!("{}?", header), arg.to_string());
        }
        state.ack.clone()
    }
}

async fn stall(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

// =============================================================================
// Backend adapter
// =============================================================================

/// [`BackendAdapter`] over a [`SimInstrument`].
#[derive(Debug)]
pub struct SimBackend {
    instrument: SimInstrument,
}

impl SimBackend {
    /// Backend talking to `instrument`.
    pub fn new(instrument: SimInstrument) -> Self {
        Self { instrument }
    }
}

#[async_trait]
impl BackendAdapter for SimBackend {
    async fn exchange(&mut self, template: &str, value: Option<&str>) -> Result<String, BackendError> {
        let command = substitute(template, value);
        let delay = self.instrument.begin(ExchangeKind::Write, &command)?;
        trace!(command = %command, "sim write");
        stall(delay).await;
        if command.ends_with('?') {
            return self.instrument.answer(&command);
        }
        Ok(self.instrument.apply_write(&command))
    }

    async fn query(&mut self, command: &str) -> Result<String, BackendError> {
        let delay = self.instrument.begin(ExchangeKind::Query, command)?;
        trace!(command, "sim query");
        stall(delay).await;
        self.instrument.answer(command)
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.instrument.disconnect();
        Ok(())
    }
}

// =============================================================================
// Backend factory
// =============================================================================

/// `[interfaces.sim]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimConfig {
    /// Catalog model whose power-on state is loaded.
    #[serde(default)]
    pub preset: Option<String>,
    /// Extra or overriding registers, query -> reply.
    #[serde(default)]
    pub registers: BTreeMap<String, String>,
    /// Write acknowledgement, defaults to the preset's.
    #[serde(default)]
    pub ack: Option<String>,
    /// Reply for queries with no register.
    #[serde(default)]
    pub unknown_query: Option<String>,
    /// Delay applied to every reply.
    #[serde(default)]
    pub latency_ms: u64,
}

impl SimConfig {
    fn from_tables(interface: &toml::Table, defaults: &toml::Table) -> InstrResult<Self> {
        let mut merged = defaults.clone();
        merged.extend(interface.clone());
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e| InstrError::Config(format!("invalid sim interface: {}", e)))
    }

    /// Build the instrument described by this configuration.
    pub fn instrument(&self) -> InstrResult<SimInstrument> {
        let mut registers = BTreeMap::new();
        let mut ack = String::new();
        if let Some(model) = &self.preset {
            registers = catalog::preset_registers(model)
                .ok_or_else(|| {
                    InstrError::Config(format!("no simulator preset for model '{}'", model))
                })?
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            ack = catalog::preset_ack(model).to_string();
        }
        registers.extend(self.registers.clone());
        if let Some(custom) = &self.ack {
            ack = custom.clone();
        }
        let instrument = SimInstrument::new(registers, ack);
        if let Some(reply) = &self.unknown_query {
            instrument.state.lock().unknown_query = Some(reply.clone());
        }
        if self.latency_ms > 0 {
            instrument.stall_for(Some(Duration::from_millis(self.latency_ms)));
        }
        Ok(instrument)
    }
}

/// Factory for the `sim` backend.
#[derive(Debug, Default)]
pub struct SimBackendFactory;

impl BackendFactory for SimBackendFactory {
    fn backend_type(&self) -> &'static str {
        "sim"
    }

    fn name(&self) -> &'static str {
        "Simulated SCPI instrument"
    }

    fn validate(&self, interface: &toml::Table, defaults: &toml::Table) -> InstrResult<()> {
        let config = SimConfig::from_tables(interface, defaults)?;
        if let Some(model) = &config.preset {
            if catalog::preset_registers(model).is_none() {
                return Err(InstrError::Config(format!(
                    "no simulator preset for model '{}'",
                    model
                )));
            }
        }
        Ok(())
    }

    fn build(
        &self,
        interface: toml::Table,
        defaults: toml::Table,
    ) -> BoxFuture<'static, InstrResult<Box<dyn BackendAdapter>>> {
        Box::pin(async move {
            let config = SimConfig::from_tables(&interface, &defaults)?;
            let instrument = config.instrument()?;
            debug!(preset = ?config.preset, "sim backend opened");
            Ok(instrument.backend())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument() -> SimInstrument {
        SimInstrument::new([("FREQ?", "1000.00"), ("*IDN?", "SIM")], "OK")
    }

    #[tokio::test]
    async fn test_write_updates_query_register() {
        let sim = instrument();
        let mut backend = sim.backend();
        assert_eq!(backend.exchange("FREQ {}", Some("5.00")).await.unwrap(), "OK");
        assert_eq!(backend.query("FREQ?").await.unwrap(), "5.00");

        backend.exchange("*RST", None).await.unwrap();
        assert_eq!(backend.query("FREQ?").await.unwrap(), "1000.00");
        assert_eq!(sim.exchange_count(), 4);
        assert_eq!(sim.exchanges()[0].kind, ExchangeKind::Write);
    }

    #[tokio::test]
    async fn test_rejected_header_queues_error() {
        let sim = instrument();
        sim.reject_header("FREQ", "ERR");
        let mut backend = sim.backend();
        assert_eq!(backend.exchange("FREQ 1", None).await.unwrap(), "ERR");
        assert_eq!(sim.register("FREQ?").as_deref(), Some("1000.00"));
        assert_eq!(backend.query("SYST:ERR?").await.unwrap(), "-222,\"ERR\"");
        assert_eq!(backend.query("SYST:ERR?").await.unwrap(), NO_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_query() {
        let sim = instrument();
        let mut backend = sim.backend();
        assert!(matches!(
            backend.query("VOLT?").await,
            Err(BackendError::Protocol(_))
        ));

        let sim = instrument().with_unknown_query("0");
        let mut backend = sim.backend();
        assert_eq!(backend.query("VOLT?").await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_disconnected_instrument() {
        let sim = instrument();
        let mut backend = sim.backend();
        sim.disconnect();
        assert!(matches!(backend.query("*IDN?").await, Err(BackendError::Closed)));
        sim.reconnect();
        assert_eq!(backend.query("*IDN?").await.unwrap(), "SIM");
    }

    #[test]
    fn test_sim_config_merges_defaults() {
        let defaults: toml::Table = toml::from_str("latency_ms = 5\nack = \"DONE\"").unwrap();
        let interface: toml::Table =
            toml::from_str("preset = \"SIM-FG100\"\n[registers]\n\"FREQ?\" = \"42.00\"").unwrap();
        let config = SimConfig::from_tables(&interface, &defaults).unwrap();
        assert_eq!(config.latency_ms, 5);
        let sim = config.instrument().unwrap();
        assert_eq!(sim.register("FREQ?").as_deref(), Some("42.00"));
        assert!(sim.register("*IDN?").unwrap().contains("FG100"));

        let bad: toml::Table = toml::from_str("preset = \"NOPE\"").unwrap();
        assert!(SimBackendFactory.validate(&bad, &toml::Table::new()).is_err());
    }
}
