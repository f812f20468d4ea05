//! Limits computed from the instrument state at runtime.
//!
//! Some ranges are not known when the driver is declared: the amplitude an
//! output accepts depends on its load, the sweep time on the sweep span. A
//! node type declares such ranges by name with a [`LimitsSource`]; a
//! feature validated against named limits resolves them on first use and
//! the node keeps the result until a write listing the name in
//! `discard_limits` drops it.
//!
//! ```rust,ignore
//! NodeDecl::new()
//!     .limits(
//!         "amplitude",
//!         DerivedLimits::new(["load"], |values| {
//!             let max = if values["load"] == Value::Int(50) { 5.0 } else { 10.0 };
//!             Ok(Limits::Float(FloatLimits::range(0.0, max)?))
//!         }),
//!     )
//!     .feature(Feature::new("amplitude").getter("VOLT?").setter("VOLT {:.3f}").limits("amplitude"))
//!     .feature(Feature::new("load").getter("LOAD?").setter("LOAD {}").discard_limits(["amplitude"]))
//! ```

use crate::access::Access;
use crate::error::{InstrError, InstrResult};
use crate::validator::{FloatLimits, IntLimits, Validator};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Resolved range of a named limits declaration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Limits {
    /// Integer range.
    Int(IntLimits),
    /// Float range. Integers are widened before the check.
    Float(FloatLimits),
}

impl Limits {
    /// Check `value`, returning it normalized like the matching validator.
    pub fn check(&self, member: &str, value: &Value) -> InstrResult<Value> {
        match self {
            Limits::Int(limits) => Validator::Int(Some(*limits)).validate(member, value),
            Limits::Float(limits) => Validator::Float(Some(*limits)).validate(member, value),
        }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limits::Int(limits) => write!(f, "{}", limits),
            Limits::Float(limits) => write!(f, "{}", limits),
        }
    }
}

/// Computes named limits for the node reached through `access`.
#[async_trait]
pub trait LimitsSource: Send + Sync + fmt::Debug {
    /// Read whatever the range depends on and build it.
    async fn limits(&self, access: &mut Access<'_>) -> InstrResult<Limits>;
}

type Compute = dyn Fn(&BTreeMap<String, Value>) -> InstrResult<Limits> + Send + Sync;

/// Limits computed from the current values of features of the same node.
#[derive(Clone)]
pub struct DerivedLimits {
    features: Vec<String>,
    compute: Arc<Compute>,
}

impl DerivedLimits {
    /// `compute` receives the values of `features`, keyed by name.
    pub fn new<S, F>(features: impl IntoIterator<Item = S>, compute: F) -> Self
    where
        S: Into<String>,
        F: Fn(&BTreeMap<String, Value>) -> InstrResult<Limits> + Send + Sync + 'static,
    {
        Self {
            features: features.into_iter().map(Into::into).collect(),
            compute: Arc::new(compute),
        }
    }

    /// Fixed limits, useful when a derived driver pins a range.
    pub fn fixed(limits: Limits) -> Self {
        Self::new(Vec::<String>::new(), move |_| Ok(limits))
    }
}

impl fmt::Debug for DerivedLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedLimits")
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LimitsSource for DerivedLimits {
    async fn limits(&self, access: &mut Access<'_>) -> InstrResult<Limits> {
        let mut values = BTreeMap::new();
        for feature in &self.features {
            values.insert(feature.clone(), access.get(feature).await?);
        }
        (self.compute)(&values).map_err(|err| match err {
            InstrError::Declaration(message) => InstrError::Validation {
                member: access.node().path().to_string(),
                message: format!("cannot build limits: {}", message),
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_check_normalizes() {
        let limits = Limits::Float(FloatLimits::range(0.0, 5.0).unwrap());
        assert_eq!(limits.check("a", &Value::Int(2)).unwrap(), Value::Float(2.0));
        let err = limits.check("FG.amplitude", &Value::Float(7.5)).unwrap_err();
        assert!(err.to_string().contains("Maximum 5."));

        let limits = Limits::Int(IntLimits::new(Some(0), Some(10), Some(2)).unwrap());
        assert!(limits.check("n", &Value::Int(4)).is_ok());
        assert!(limits.check("n", &Value::Int(5)).is_err());
        assert!(limits.check("n", &Value::Float(4.0)).is_err());
    }
}
