//! Conversion between values and the instrument's textual representation.
//!
//! Reading: raw response -> optional regex extraction -> mapping or
//! type-directed parse. Writing: validated value -> mapping or wire
//! encoding -> template formatting.

use crate::error::{InstrError, InstrResult};
use crate::validator::Validator;
use crate::value::Value;
use regex::Regex;
use std::collections::BTreeMap;

// =============================================================================
// Extraction
// =============================================================================

/// Regex applied to a raw response before conversion.
///
/// The named group `value` is used when present, otherwise the first
/// capture group, otherwise the whole match.
#[derive(Debug, Clone)]
pub struct Extract {
    pattern: Regex,
}

impl Extract {
    /// Compile `pattern`, failing with a declaration error.
    pub fn new(pattern: &str) -> InstrResult<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            InstrError::Declaration(format!("invalid extract pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern })
    }

    /// Source pattern.
    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Apply the pattern, `None` if it does not match.
    pub fn apply<'r>(&self, raw: &'r str) -> Option<&'r str> {
        let caps = self.pattern.captures(raw)?;
        caps.name("value")
            .or_else(|| caps.get(1))
            .or_else(|| caps.get(0))
            .map(|m| m.as_str())
    }
}

// =============================================================================
// Mapping
// =============================================================================

/// Translation table between user values and device strings.
///
/// A symmetric mapping uses the same pairs in both directions. An
/// asymmetric one has separate tables, e.g. a device that accepts `SIN`
/// but answers `SINE`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    to_device: Vec<(Value, String)>,
    from_device: Vec<(String, Value)>,
}

impl Mapping {
    /// Same representation in both directions.
    pub fn symmetric<V, S>(pairs: impl IntoIterator<Item = (V, S)>) -> Self
    where
        V: Into<Value>,
        S: Into<String>,
    {
        let to_device: Vec<(Value, String)> = pairs
            .into_iter()
            .map(|(v, s)| (v.into(), s.into()))
            .collect();
        let from_device = to_device
            .iter()
            .map(|(v, s)| (s.clone(), v.clone()))
            .collect();
        Self {
            to_device,
            from_device,
        }
    }

    /// Different representations for writing and reading.
    pub fn asymmetric<V, S, T, W>(
        set: impl IntoIterator<Item = (V, S)>,
        get: impl IntoIterator<Item = (T, W)>,
    ) -> Self
    where
        V: Into<Value>,
        S: Into<String>,
        T: Into<String>,
        W: Into<Value>,
    {
        Self {
            to_device: set.into_iter().map(|(v, s)| (v.into(), s.into())).collect(),
            from_device: get.into_iter().map(|(s, v)| (s.into(), v.into())).collect(),
        }
    }

    /// Device string for a user value.
    pub fn to_device(&self, value: &Value) -> Option<&str> {
        self.to_device
            .iter()
            .find(|(v, _)| v.loosely_eq(value))
            .map(|(_, s)| s.as_str())
    }

    /// User value for a device string, compared after trimming and
    /// ignoring ASCII case.
    pub fn from_device(&self, raw: &str) -> Option<&Value> {
        let raw = raw.trim();
        self.from_device
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(raw))
            .map(|(_, v)| v)
    }

    /// User values accepted for writing.
    pub fn user_values(&self) -> impl Iterator<Item = &Value> {
        self.to_device.iter().map(|(v, _)| v)
    }
}

// =============================================================================
// Options decoding
// =============================================================================

/// Layout of the response of an options query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsFormat {
    /// `key=value` pairs, e.g. `mod=1,sweep=0`. Values are parsed as literals.
    KeyValue {
        /// Pair separator.
        separator: char,
        /// Key/value separator.
        assign: char,
    },
    /// Bare installed option codes, e.g. `MOD,SWP`. Each present code maps
    /// to `true`.
    Flags {
        /// Code separator.
        separator: char,
    },
}

impl Default for OptionsFormat {
    fn default() -> Self {
        OptionsFormat::KeyValue {
            separator: ',',
            assign: '=',
        }
    }
}

impl OptionsFormat {
    /// Decode an options response into a mapping.
    pub fn decode(&self, raw: &str) -> Result<Value, String> {
        let mut options = BTreeMap::new();
        match self {
            OptionsFormat::KeyValue { separator, assign } => {
                for item in raw.trim().split(*separator).map(str::trim) {
                    if item.is_empty() {
                        continue;
                    }
                    let (key, value) = item
                        .split_once(*assign)
                        .ok_or_else(|| format!("option '{}' lacks '{}'", item, assign))?;
                    options.insert(key.trim().to_string(), Value::parse_literal(value));
                }
            }
            OptionsFormat::Flags { separator } => {
                for item in raw.trim().split(*separator).map(str::trim) {
                    if !item.is_empty() && item != "0" {
                        options.insert(item.to_string(), Value::Bool(true));
                    }
                }
            }
        }
        Ok(Value::Map(options))
    }
}

// =============================================================================
// Type directed conversion
// =============================================================================

/// Parse a device boolean (`1/0`, `ON/OFF`, `TRUE/FALSE`).
pub fn parse_bool(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw == "1" || raw.eq_ignore_ascii_case("on") || raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw == "0" || raw.eq_ignore_ascii_case("off") || raw.eq_ignore_ascii_case("false")
    {
        Some(false)
    } else {
        None
    }
}

/// Parse an integer, accepting `0x` prefixed hexadecimal and float text
/// with no fractional part (`"5.0"`).
pub fn parse_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.fract() == 0.0 && f.is_finite())
            .map(|f| f as i64)
    })
}

/// Decode a register integer into named bits.
pub fn decode_register(names: &[String], bits: i64) -> Value {
    let map = names
        .iter()
        .enumerate()
        .filter(|(i, name)| *i < 64 && !name.is_empty())
        .map(|(i, name)| (name.clone(), Value::Bool(bits & (1_i64 << i) != 0)))
        .collect();
    Value::Map(map)
}

/// Encode named bits (or a raw integer) into a register integer.
pub fn encode_register(names: &[String], value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Map(bits) => {
            let mut out = 0_i64;
            for (name, flag) in bits {
                let position = names
                    .iter()
                    .position(|n| n == name)
                    .filter(|p| *p < 64)
                    .ok_or_else(|| format!("unknown register bit '{}'", name))?;
                if flag.as_bool().unwrap_or(false) {
                    out |= 1_i64 << position;
                }
            }
            Ok(out)
        }
        other => Err(format!("cannot encode {} as a register", other.type_name())),
    }
}

/// Convert a device string to a value of the type described by `validator`.
///
/// Only the type is enforced, bounds are not: a reading outside the
/// declared limits is still the instrument's state.
pub fn parse_typed(validator: &Validator, raw: &str) -> Result<Value, String> {
    let text = raw.trim();
    match validator {
        Validator::Any | Validator::Text => Ok(Value::Str(text.to_string())),
        Validator::Bool => parse_bool(text)
            .map(Value::Bool)
            .ok_or_else(|| "expected a boolean".to_string()),
        Validator::Int(_) => parse_int(text)
            .map(Value::Int)
            .ok_or_else(|| "expected an integer".to_string()),
        Validator::Float(_) => text
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| "expected a number".to_string()),
        Validator::OneOf(values) => values
            .iter()
            .find(|v| match v {
                Value::Str(s) => s.eq_ignore_ascii_case(text),
                other => parse_typed(&kind_of(other), text)
                    .map(|parsed| parsed.loosely_eq(other))
                    .unwrap_or(false),
            })
            .cloned()
            .ok_or_else(|| "not one of the declared values".to_string()),
        Validator::Register(names) => parse_int(text)
            .map(|bits| decode_register(names, bits))
            .ok_or_else(|| "expected an integer register".to_string()),
        Validator::Options => OptionsFormat::default().decode(text),
    }
}

fn kind_of(value: &Value) -> Validator {
    match value {
        Value::Bool(_) => Validator::Bool,
        Value::Int(_) => Validator::Int(None),
        Value::Float(_) => Validator::Float(None),
        _ => Validator::Text,
    }
}

/// Wire form of a validated value, before template formatting.
///
/// Booleans go out as `1`/`0`, registers as their integer.
pub fn encode_typed(validator: &Validator, value: &Value) -> Result<Value, String> {
    match (validator, value) {
        (Validator::Register(names), v) => encode_register(names, v).map(Value::Int),
        (_, Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
        (_, v) => Ok(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_prefers_named_group() {
        let e = Extract::new(r"FREQ (?P<value>[\d.]+) Hz").unwrap();
        assert_eq!(e.apply("FREQ 250.50 Hz"), Some("250.50"));
        let e = Extract::new(r"V=(\S+)").unwrap();
        assert_eq!(e.apply("V=1.5 OK"), Some("1.5"));
        assert_eq!(e.apply("garbage"), None);
    }

    #[test]
    fn test_asymmetric_mapping() {
        let m = Mapping::asymmetric([("sine", "SIN")], [("SINE", "sine"), ("SIN", "sine")]);
        assert_eq!(m.to_device(&"sine".into()), Some("SIN"));
        assert_eq!(m.from_device(" sine\n"), Some(&Value::Str("sine".into())));
        assert_eq!(m.to_device(&"square".into()), None);
    }

    #[test]
    fn test_options_formats() {
        let kv = OptionsFormat::default().decode("mod=1, sweep=0,name='x'").unwrap();
        let map = kv.as_map().unwrap();
        assert_eq!(map["mod"], Value::Int(1));
        assert_eq!(map["sweep"], Value::Int(0));
        assert_eq!(map["name"], Value::Str("x".into()));

        let flags = OptionsFormat::Flags { separator: ',' }.decode("MOD,SWP").unwrap();
        assert_eq!(flags.as_map().unwrap()["SWP"], Value::Bool(true));

        assert!(OptionsFormat::default().decode("mod").is_err());
    }

    #[test]
    fn test_register_round_trip_through_names() {
        let names = vec!["output_on".to_string(), String::new(), "error".to_string()];
        let decoded = decode_register(&names, 0b101);
        let map = decoded.as_map().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["error"], Value::Bool(true));
        assert_eq!(encode_register(&names, &decoded).unwrap(), 0b101);
    }

    #[test]
    fn test_parse_typed() {
        assert_eq!(parse_typed(&Validator::Bool, "ON").unwrap(), Value::Bool(true));
        assert_eq!(parse_typed(&Validator::Int(None), "0x1F").unwrap(), Value::Int(31));
        assert_eq!(
            parse_typed(&Validator::Float(None), "250.50\n").unwrap(),
            Value::Float(250.5)
        );
        assert!(parse_typed(&Validator::Float(None), "abc").is_err());
        let one_of = Validator::OneOf(vec![Value::Int(50), Value::Int(10000)]);
        assert_eq!(parse_typed(&one_of, "50").unwrap(), Value::Int(50));
    }
}
