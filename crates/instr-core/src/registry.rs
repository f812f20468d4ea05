//! Driver and backend registry.
//!
//! Drivers are registered by name as schema constructors and built lazily on
//! first use; the resulting [`DriverSchema`] is shared by every instance.
//! Backends are registered as [`BackendFactory`] trait objects keyed by the
//! `backend` field of an [`InstrumentConfig`].
//!
//! ```rust,ignore
//! let mut registry = DriverRegistry::new();
//! registry.register_driver("SIM-FG100", fg100_schema);
//! registry.register_backend(SimBackendFactory::new());
//!
//! let config = load_instrument_config(Path::new("config/fg100.toml"))?;
//! let driver = registry.connect(&config).await?;
//! ```

use crate::config::InstrumentConfig;
use crate::error::{InstrError, InstrResult};
use crate::node::Driver;
use crate::schema::DriverSchema;
use crate::session::BackendAdapter;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Backend Factory Trait
// =============================================================================

/// Creates backend adapters from configuration.
///
/// Factories are registered once and may be used from any task, so
/// `build()` returns a `'static` future and must not borrow `self`.
pub trait BackendFactory: Send + Sync + 'static {
    /// Value of the `backend` configuration field handled by this factory.
    fn backend_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages.
    fn name(&self) -> &'static str;

    /// Check the connection parameters without opening anything.
    fn validate(&self, interface: &toml::Table, defaults: &toml::Table) -> InstrResult<()>;

    /// Open the backend.
    fn build(
        &self,
        interface: toml::Table,
        defaults: toml::Table,
    ) -> BoxFuture<'static, InstrResult<Box<dyn BackendAdapter>>>;
}

type SchemaBuilder = Box<dyn Fn() -> InstrResult<Arc<DriverSchema>> + Send + Sync>;

struct DriverEntry {
    build: SchemaBuilder,
    built: Mutex<Option<Arc<DriverSchema>>>,
}

// =============================================================================
// Driver Registry
// =============================================================================

/// Named driver schemas and backend factories.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, DriverEntry>,
    backends: HashMap<&'static str, Arc<dyn BackendFactory>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.driver_names())
            .field("backends", &self.backend_names())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver schema constructor under `name`.
    ///
    /// Registering the same name twice replaces the previous entry.
    pub fn register_driver<F>(&mut self, name: impl Into<String>, build: F)
    where
        F: Fn() -> InstrResult<Arc<DriverSchema>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(driver = %name, "driver registered");
        self.drivers.insert(
            name,
            DriverEntry {
                build: Box::new(build),
                built: Mutex::new(None),
            },
        );
    }

    /// Register a backend factory under its backend type.
    pub fn register_backend(&mut self, factory: impl BackendFactory) {
        debug!(backend = factory.backend_type(), "backend registered");
        self.backends.insert(factory.backend_type(), Arc::new(factory));
    }

    /// Schema of a registered driver, built on first request.
    pub fn schema(&self, name: &str) -> InstrResult<Arc<DriverSchema>> {
        let entry = self.drivers.get(name).ok_or_else(|| {
            InstrError::Registry(format!(
                "unknown driver '{}' (registered: {})",
                name,
                self.driver_names().join(", ")
            ))
        })?;
        let mut built = entry.built.lock();
        if let Some(schema) = built.as_ref() {
            return Ok(Arc::clone(schema));
        }
        let schema = (entry.build)()?;
        info!(driver = %name, "driver schema built");
        *built = Some(Arc::clone(&schema));
        Ok(schema)
    }

    /// Names of the registered drivers, sorted.
    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    /// Names of the registered backends, sorted.
    pub fn backend_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn backend(&self, backend_type: &str) -> InstrResult<Arc<dyn BackendFactory>> {
        self.backends.get(backend_type).cloned().ok_or_else(|| {
            InstrError::Registry(format!(
                "unknown backend '{}' (registered: {})",
                backend_type,
                self.backend_names().join(", ")
            ))
        })
    }

    /// Validate `config`, open its backend and instantiate its driver.
    pub async fn connect(&self, config: &InstrumentConfig) -> InstrResult<Driver> {
        config.validate()?;
        let schema = self.schema(&config.driver)?;
        let factory = self.backend(&config.backend)?;
        let interface = config.interface();
        factory.validate(&interface, &config.defaults)?;
        let options = config.session_options()?;

        info!(
            driver = %config.driver,
            backend = factory.name(),
            "connecting instrument"
        );
        let backend = factory.build(interface, config.defaults.clone()).await?;
        Ok(Driver::open(schema, backend, options))
    }
}
