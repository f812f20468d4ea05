//! Value validators applied before a value is sent to the instrument.
//!
//! Validation never touches the backend: a rejected value produces
//! [`InstrError::Validation`] and the request ends there.

use crate::error::{InstrError, InstrResult};
use crate::value::Value;
use std::fmt;

/// Tolerance used when checking that a float lies on its step grid.
pub const FLOAT_STEP_TOLERANCE: f64 = 1e-9;

// =============================================================================
// Limits
// =============================================================================

/// Inclusive integer bounds with an optional step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLimits {
    min: Option<i64>,
    max: Option<i64>,
    step: Option<i64>,
}

impl IntLimits {
    /// At least one of `min` or `max` is required and `step` must be positive.
    pub fn new(min: Option<i64>, max: Option<i64>, step: Option<i64>) -> InstrResult<Self> {
        if min.is_none() && max.is_none() {
            return Err(InstrError::Declaration(
                "integer limits need a minimum or a maximum".into(),
            ));
        }
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(InstrError::Declaration(format!(
                    "integer limits minimum {} exceeds maximum {}",
                    lo, hi
                )));
            }
        }
        if matches!(step, Some(s) if s <= 0) {
            return Err(InstrError::Declaration("integer step must be positive".into()));
        }
        Ok(Self { min, max, step })
    }

    /// Closed range without a step.
    pub fn range(min: i64, max: i64) -> InstrResult<Self> {
        Self::new(Some(min), Some(max), None)
    }

    /// Whether `value` is within bounds and on the step grid.
    pub fn contains(&self, value: i64) -> bool {
        if matches!(self.min, Some(lo) if value < lo) || matches!(self.max, Some(hi) if value > hi)
        {
            return false;
        }
        match (self.step, self.min.or(self.max)) {
            (Some(step), Some(base)) => {
                (i128::from(value) - i128::from(base)) % i128::from(step) == 0
            }
            _ => true,
        }
    }
}

impl fmt::Display for IntLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe_bounds(f, self.min, self.max, self.step)
    }
}

/// Inclusive float bounds with an optional step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatLimits {
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
}

impl FloatLimits {
    /// At least one of `min` or `max` is required and `step` must be positive.
    pub fn new(min: Option<f64>, max: Option<f64>, step: Option<f64>) -> InstrResult<Self> {
        if min.is_none() && max.is_none() {
            return Err(InstrError::Declaration(
                "float limits need a minimum or a maximum".into(),
            ));
        }
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(InstrError::Declaration(format!(
                    "float limits minimum {} exceeds maximum {}",
                    lo, hi
                )));
            }
        }
        if matches!(step, Some(s) if s.is_nan() || s <= 0.0) {
            return Err(InstrError::Declaration("float step must be positive".into()));
        }
        Ok(Self { min, max, step })
    }

    /// Closed range without a step.
    pub fn range(min: f64, max: f64) -> InstrResult<Self> {
        Self::new(Some(min), Some(max), None)
    }

    /// Whether `value` is finite, within bounds and on the step grid.
    pub fn contains(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        if matches!(self.min, Some(lo) if value < lo) || matches!(self.max, Some(hi) if value > hi)
        {
            return false;
        }
        match (self.step, self.min.or(self.max)) {
            (Some(step), Some(base)) => {
                let ratio = (value - base) / step;
                (ratio - ratio.round()).abs() <= FLOAT_STEP_TOLERANCE
            }
            _ => true,
        }
    }
}

impl fmt::Display for FloatLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe_bounds(f, self.min, self.max, self.step)
    }
}

fn describe_bounds<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    min: Option<T>,
    max: Option<T>,
    step: Option<T>,
) -> fmt::Result {
    let mut parts = Vec::new();
    if let Some(lo) = min {
        parts.push(format!("Minimum {}.", lo));
    }
    if let Some(hi) = max {
        parts.push(format!("Maximum {}.", hi));
    }
    if let Some(s) = step {
        parts.push(format!("Step {}.", s));
    }
    write!(f, "{}", parts.join(" "))
}

// =============================================================================
// Validator
// =============================================================================

/// Type and bounds of a feature value or action argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    /// Accept anything.
    Any,
    /// `true`/`false`.
    Bool,
    /// Integer, optionally bounded.
    Int(Option<IntLimits>),
    /// Float, optionally bounded. Integers are accepted and widened.
    Float(Option<FloatLimits>),
    /// Free text.
    Text,
    /// One of an enumerated set of values.
    OneOf(Vec<Value>),
    /// Bit field, each position named (empty names mark unused bits).
    Register(Vec<String>),
    /// Options mapping, read-only.
    Options,
}

impl Validator {
    /// Check `value` and return it normalized (ints widened for floats).
    pub fn validate(&self, member: &str, value: &Value) -> InstrResult<Value> {
        let reject = |message: String| InstrError::Validation {
            member: member.to_string(),
            message,
        };
        match self {
            Validator::Any => Ok(value.clone()),
            Validator::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                other => Err(reject(format!("expected bool, got {}", other.type_name()))),
            },
            Validator::Int(limits) => {
                let v = match value {
                    Value::Int(i) => *i,
                    other => {
                        return Err(reject(format!("expected int, got {}", other.type_name())))
                    }
                };
                match limits {
                    Some(l) if !l.contains(v) => Err(reject(format!(
                        "The provided value {} is out of bound for {}. {}",
                        v, member, l
                    ))),
                    _ => Ok(Value::Int(v)),
                }
            }
            Validator::Float(limits) => {
                let v = match value {
                    Value::Int(_) | Value::Float(_) => value.as_f64().unwrap_or(f64::NAN),
                    other => {
                        return Err(reject(format!("expected float, got {}", other.type_name())))
                    }
                };
                if !v.is_finite() {
                    return Err(reject(format!("{} is not a finite number", v)));
                }
                match limits {
                    Some(l) if !l.contains(v) => Err(reject(format!(
                        "The provided value {} is out of bound for {}. {}",
                        v, member, l
                    ))),
                    _ => Ok(Value::Float(v)),
                }
            }
            Validator::Text => match value {
                Value::Str(_) => Ok(value.clone()),
                other => Err(reject(format!("expected str, got {}", other.type_name()))),
            },
            Validator::OneOf(values) => values
                .iter()
                .find(|candidate| candidate.loosely_eq(value))
                .cloned()
                .ok_or_else(|| {
                    let allowed: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    reject(format!(
                        "{} is not one of [{}]",
                        value,
                        allowed.join(", ")
                    ))
                }),
            Validator::Register(names) => match value {
                Value::Int(i) if *i >= 0 && (*i >> names.len().min(63)) == 0 => Ok(value.clone()),
                Value::Int(i) => Err(reject(format!(
                    "{} does not fit in a {} bit register",
                    i,
                    names.len()
                ))),
                Value::Map(bits) => {
                    for (name, flag) in bits {
                        if name.is_empty() || !names.iter().any(|n| n == name) {
                            return Err(reject(format!("unknown register bit '{}'", name)));
                        }
                        if !matches!(flag, Value::Bool(_)) {
                            return Err(reject(format!("register bit '{}' must be a bool", name)));
                        }
                    }
                    Ok(value.clone())
                }
                other => Err(reject(format!(
                    "expected int or map of bits, got {}",
                    other.type_name()
                ))),
            },
            Validator::Options => Err(reject("options features are read-only".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_limits_require_a_bound() {
        assert!(IntLimits::new(None, None, Some(1)).is_err());
        assert!(FloatLimits::new(None, None, None).is_err());
        assert!(FloatLimits::new(Some(1.0), None, Some(0.0)).is_err());
        assert!(IntLimits::new(Some(5), Some(1), None).is_err());
    }

    #[test]
    fn test_int_limits_with_step() {
        let limits = IntLimits::new(Some(2), Some(20), Some(3)).unwrap();
        assert!(limits.contains(2));
        assert!(limits.contains(5));
        assert!(!limits.contains(6));
        assert!(!limits.contains(23));
    }

    #[test]
    fn test_int_step_at_extreme_values() {
        let from_min = IntLimits::new(Some(-10), None, Some(2)).unwrap();
        assert!(!from_min.contains(i64::MAX));
        assert!(from_min.contains(i64::MAX - 1));

        let from_max = IntLimits::new(None, Some(10), Some(3)).unwrap();
        assert!(from_max.contains(i64::MIN));
        assert!(!from_max.contains(i64::MIN + 1));

        let v = Validator::Int(Some(from_min));
        assert!(v.validate("n", &Value::Int(i64::MAX)).is_err());
    }

    #[test]
    fn test_float_step_tolerance() {
        let limits = FloatLimits::new(Some(0.0), Some(1.0), Some(0.1)).unwrap();
        assert!(limits.contains(0.3));
        assert!(!limits.contains(0.35));
        assert!(!limits.contains(f64::NAN));
    }

    #[test]
    fn test_float_validator_widens_ints_and_reports_bounds() {
        let v = Validator::Float(Some(FloatLimits::range(1.0, 100000.0).unwrap()));
        assert_eq!(v.validate("f", &Value::Int(5)).unwrap(), Value::Float(5.0));

        let err = v.validate("FG.frequency", &Value::Float(200000.0)).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("out of bound"));
        assert!(text.contains("Maximum 100000."));
    }

    #[test]
    fn test_one_of_validator() {
        let v = Validator::OneOf(vec!["sine".into(), "square".into()]);
        assert!(v.validate("w", &"sine".into()).is_ok());
        assert!(v.validate("w", &"noise".into()).is_err());
    }

    #[test]
    fn test_register_validator() {
        let v = Validator::Register(vec!["on".into(), "".into(), "err".into()]);
        assert!(v.validate("s", &Value::Int(5)).is_ok());
        assert!(v.validate("s", &Value::Int(8)).is_err());

        let mut bits = BTreeMap::new();
        bits.insert("on".to_string(), Value::Bool(true));
        assert!(v.validate("s", &Value::Map(bits.clone())).is_ok());
        bits.insert("bogus".to_string(), Value::Bool(true));
        assert!(v.validate("s", &Value::Map(bits)).is_err());
    }
}
