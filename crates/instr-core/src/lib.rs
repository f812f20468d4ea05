//! `instr-core`
//!
//! Declarative instrument drivers: features, actions, subsystems and channels
//! resolved against a request/response backend, with per-node value caching,
//! options-based capability gating and a lazily built composition tree.
//!
//! ## Layers
//!
//! - **Declarations** ([`schema`]): [`Feature`], [`Action`], [`Subsystem`] and
//!   [`Channel`] builders, compiled once into an immutable [`DriverSchema`].
//!   Derived drivers reuse a base schema with overrides. Ranges known only
//!   at runtime are declared as [`named_limits`].
//! - **Engine** ([`node`]): live [`Node`] tree under a [`Driver`]. Every
//!   get/set/invoke runs gates, checks, cache lookup and the exchange in a
//!   fixed order.
//! - **Session** ([`session`]): the [`BackendAdapter`] boundary, exchange
//!   timeout and acknowledgement policy.
//!
//! ## Example
//!
//! ```rust,ignore
//! use instr_core::prelude::*;
//!
//! let schema = DriverSchema::builder("PSU")
//!     .feature(
//!         Feature::new("voltage")
//!             .getter("VOLT?")
//!             .setter("VOLT {:.3f}")
//!             .float(FloatLimits::range(0.0, 30.0)?),
//!     )
//!     .build()?;
//!
//! let driver = Driver::open(schema, backend, SessionOptions::default());
//! driver.set("voltage", 12.0).await?;
//! ```

pub mod access;
pub mod action;
pub mod check;
pub mod config;
pub mod convert;
pub mod error;
pub mod gate;
pub mod limits;
pub mod named_limits;
pub mod node;
pub mod path;
pub mod registry;
pub mod schema;
pub mod session;
pub mod template;
pub mod validator;
pub mod value;

pub use access::Access;
pub use action::{CommandOperation, Operation};
pub use check::{Check, CheckInput, CheckScope, FeatureCheck, Operand};
pub use config::{load_instrument_config, load_instrument_config_from_str, InstrumentConfig};
pub use error::{BackendError, ErrorKind, InstrError, InstrResult};
pub use gate::{CompareOp, Gate};
pub use named_limits::{DerivedLimits, Limits, LimitsSource};
pub use node::{Driver, Node};
pub use registry::{BackendFactory, DriverRegistry};
pub use schema::{
    Action, ActionOverride, CachePolicy, Channel, DriverSchema, Feature, FeatureOverride,
    MemberDecl, NodeDecl, Returns, Subsystem,
};
pub use session::{AckPolicy, BackendAdapter, SessionOptions};
pub use value::{ChannelId, Value};

/// Common imports for driver authors.
pub mod prelude {
    pub use crate::access::Access;
    pub use crate::action::{CommandOperation, Operation};
    pub use crate::check::{Check, CheckInput, CheckScope, FeatureCheck, Operand};
    pub use crate::convert::{Mapping, OptionsFormat};
    pub use crate::error::{BackendError, InstrError, InstrResult};
    pub use crate::gate::CompareOp;
    pub use crate::named_limits::{DerivedLimits, Limits, LimitsSource};
    pub use crate::node::{Driver, Node};
    pub use crate::registry::{BackendFactory, DriverRegistry};
    pub use crate::schema::{
        Action, ActionOverride, CachePolicy, Channel, DriverSchema, Feature, FeatureOverride,
        MemberDecl, NodeDecl, Returns, Subsystem,
    };
    pub use crate::session::{AckPolicy, BackendAdapter, SessionOptions};
    pub use crate::validator::{FloatLimits, IntLimits, Validator};
    pub use crate::value::{ChannelId, Value};
}
