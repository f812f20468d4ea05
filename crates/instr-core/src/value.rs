//! Dynamic values exchanged with features and actions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A feature value or action argument.
///
/// Numbers compare loosely (`Int(1)` equals `Float(1.0)`) through
/// [`Value::loosely_eq`]; the derived `PartialEq` is strict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    Str(String),
    /// Ordered list, e.g. the result of an id-listing action.
    List(Vec<Value>),
    /// String keyed mapping, e.g. an options feature or a decoded register.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short type label used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Boolean value, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value; floats with no fraction convert.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// Numeric view of the value; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text value, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Map value, if this is one.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// List items, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Equality that treats integers and floats as the same number.
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.loosely_eq(vb))
            }
            _ => self == other,
        }
    }

    /// Truth value used by bare gate terms.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    /// Interpret user supplied text (CLI arguments, options lists).
    ///
    /// `true`/`false` become booleans, numbers become `Int` or `Float`,
    /// quoted text is unquoted, anything else is kept verbatim.
    pub fn parse_literal(text: &str) -> Value {
        let text = text.trim();
        match text {
            "true" | "True" => return Value::Bool(true),
            "false" | "False" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = text.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
        if text.len() >= 2 {
            let quoted = (text.starts_with('\'') && text.ends_with('\''))
                || (text.starts_with('"') && text.ends_with('"'));
            if quoted {
                return Value::Str(text[1..text.len() - 1].to_string());
            }
        }
        Value::Str(text.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

// =============================================================================
// Channel Ids
// =============================================================================

/// Canonical identifier of a channel instance, or a name to be resolved
/// through a channel family's alias table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelId {
    /// Numeric id, the common case (`OUTP1`, `CH2`).
    Index(i64),
    /// Symbolic id or alias.
    Name(String),
}

impl ChannelId {
    /// Parse user text: integers become `Index`, everything else `Name`.
    pub fn parse(text: &str) -> ChannelId {
        let text = text.trim();
        match text.parse::<i64>() {
            Ok(i) => ChannelId::Index(i),
            Err(_) => ChannelId::Name(text.to_string()),
        }
    }

    /// Convert an element of an id listing.
    pub fn from_value(value: &Value) -> Option<ChannelId> {
        match value {
            Value::Int(i) => Some(ChannelId::Index(*i)),
            Value::Float(_) => value.as_i64().map(ChannelId::Index),
            Value::Str(s) => Some(ChannelId::parse(s)),
            _ => None,
        }
    }

    /// Id as a value: an index becomes an int.
    pub fn to_value(&self) -> Value {
        match self {
            ChannelId::Index(i) => Value::Int(*i),
            ChannelId::Name(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Index(i) => write!(f, "{}", i),
            ChannelId::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ChannelId {
    fn from(v: i64) -> Self {
        ChannelId::Index(v)
    }
}

impl From<i32> for ChannelId {
    fn from(v: i32) -> Self {
        ChannelId::Index(i64::from(v))
    }
}

impl From<&str> for ChannelId {
    fn from(v: &str) -> Self {
        ChannelId::Name(v.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(v: String) -> Self {
        ChannelId::Name(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal() {
        assert_eq!(Value::parse_literal("true"), Value::Bool(true));
        assert_eq!(Value::parse_literal(" 42 "), Value::Int(42));
        assert_eq!(Value::parse_literal("250.5"), Value::Float(250.5));
        assert_eq!(Value::parse_literal("'sine'"), Value::Str("sine".into()));
        assert_eq!(Value::parse_literal("square"), Value::Str("square".into()));
    }

    #[test]
    fn test_loose_numeric_equality() {
        assert!(Value::Int(1).loosely_eq(&Value::Float(1.0)));
        assert!(!Value::Int(1).loosely_eq(&Value::Str("1".into())));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_float_display_keeps_decimal_point() {
        assert_eq!(Value::Float(50.0).to_string(), "50.0");
        assert_eq!(Value::Float(250.5).to_string(), "250.5");
    }

    #[test]
    fn test_channel_id_parse() {
        assert_eq!(ChannelId::parse("2"), ChannelId::Index(2));
        assert_eq!(ChannelId::parse("main"), ChannelId::Name("main".into()));
        assert_eq!(
            ChannelId::from_value(&Value::Str("3".into())),
            Some(ChannelId::Index(3))
        );
    }

    #[test]
    fn test_value_serde_untagged() {
        let v: Value = serde_json::from_str(r#"{"k": 1, "j": [true, "x"]}"#).unwrap();
        let map = v.as_map().unwrap();
        assert_eq!(map["k"], Value::Int(1));
        assert_eq!(
            map["j"],
            Value::List(vec![Value::Bool(true), Value::Str("x".into())])
        );
    }
}
