//! Command templates.
//!
//! A template is parsed once, when the driver schema is built. It may
//! contain:
//!
//! - `{}` or `{:spec}`: the value placeholder (set templates only)
//! - `{ch_id}`: id of the nearest enclosing channel
//! - `{family}`: id of the nearest enclosing channel of that family
//! - `{{` / `}}`: literal braces
//!
//! Supported value specs: `.Nf`, `.Ne`, `d`, `Nd`, `0Nd`, `x`, `X`.
//!
//! Before an exchange the channel placeholders are substituted and the
//! value placeholder is normalized to `{}`, which is the form handed to
//! [`BackendAdapter::exchange`](crate::session::BackendAdapter::exchange)
//! together with the formatted value.

use crate::error::{InstrError, InstrResult};
use crate::value::{ChannelId, Value};
use std::fmt;

/// Formatting applied to a value before it is placed in a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    /// `{}`: natural text form.
    Plain,
    /// `{:.Nf}`: fixed point with `N` decimals.
    Fixed(usize),
    /// `{:.Ne}`: scientific notation with `N` decimals and a signed two
    /// digit exponent (`2.505e+02`).
    Exponent(usize),
    /// `{:d}`, `{:Nd}`, `{:0Nd}`: integer, optionally padded to `width`.
    Integer {
        /// Minimum width.
        width: usize,
        /// Pad with zeros instead of spaces.
        zero_pad: bool,
    },
    /// `{:x}` / `{:X}`: hexadecimal integer.
    Hex {
        /// Upper case digits.
        upper: bool,
    },
}

impl ValueFormat {
    fn parse(spec: &str) -> Option<ValueFormat> {
        if spec.is_empty() {
            return Some(ValueFormat::Plain);
        }
        if let Some(precision) = spec.strip_prefix('.') {
            let (digits, kind) = precision.split_at(precision.len().saturating_sub(1));
            let digits: usize = digits.parse().ok()?;
            return match kind {
                "f" => Some(ValueFormat::Fixed(digits)),
                "e" => Some(ValueFormat::Exponent(digits)),
                _ => None,
            };
        }
        match spec {
            "x" => return Some(ValueFormat::Hex { upper: false }),
            "X" => return Some(ValueFormat::Hex { upper: true }),
            "d" => {
                return Some(ValueFormat::Integer {
                    width: 0,
                    zero_pad: false,
                })
            }
            _ => {}
        }
        let width = spec.strip_suffix('d')?;
        let zero_pad = width.starts_with('0');
        let width: usize = width.parse().ok()?;
        Some(ValueFormat::Integer { width, zero_pad })
    }

    /// Render `value` according to this format.
    pub fn render(&self, value: &Value) -> Result<String, String> {
        match self {
            ValueFormat::Plain => Ok(value.to_string()),
            ValueFormat::Fixed(digits) => value
                .as_f64()
                .map(|v| format!("{:.*}", digits, v))
                .ok_or_else(|| format!("cannot format {} as fixed point", value.type_name())),
            ValueFormat::Exponent(digits) => value
                .as_f64()
                .map(|v| scientific(v, *digits))
                .ok_or_else(|| format!("cannot format {} in scientific notation", value.type_name())),
            ValueFormat::Integer { width, zero_pad } => {
                let v = integer_of(value)?;
                Ok(if *zero_pad {
                    format!("{:0width$}", v, width = *width)
                } else {
                    format!("{:width$}", v, width = *width)
                })
            }
            ValueFormat::Hex { upper } => {
                let v = integer_of(value)?;
                Ok(if *upper {
                    format!("{:X}", v)
                } else {
                    format!("{:x}", v)
                })
            }
        }
    }
}

fn integer_of(value: &Value) -> Result<i64, String> {
    match value {
        Value::Bool(b) => Ok(i64::from(*b)),
        other => other
            .as_i64()
            .ok_or_else(|| format!("cannot format {} as an integer", other.type_name())),
    }
}

fn scientific(value: f64, digits: usize) -> String {
    let raw = format!("{:.*e}", digits, value);
    match raw.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => raw,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(ValueFormat),
    ChannelId,
    FamilyId(String),
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    /// Parse a template.
    pub fn parse(source: &str) -> InstrResult<Self> {
        let bad = |message: String| {
            InstrError::Declaration(format!("command template '{}': {}", source, message))
        };
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(bad("unmatched '}'".into())),
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(bad("unterminated placeholder".into())),
                            Some(other) => field.push(other),
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let field = field.trim();
                    let segment = if let Some(spec) = field.strip_prefix(':') {
                        ValueFormat::parse(spec)
                            .map(Segment::Value)
                            .ok_or_else(|| bad(format!("unsupported format spec '{}'", spec)))?
                    } else if field.is_empty() {
                        Segment::Value(ValueFormat::Plain)
                    } else if field == "ch_id" {
                        Segment::ChannelId
                    } else if is_identifier(field) {
                        Segment::FamilyId(field.to_string())
                    } else {
                        return Err(bad(format!("invalid placeholder '{{{}}}'", field)));
                    };
                    segments.push(segment);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        let template = Self {
            source: source.to_string(),
            segments,
        };
        if template.value_placeholders() > 1 {
            return Err(bad("more than one value placeholder".into()));
        }
        Ok(template)
    }

    /// Template as declared.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of value placeholders (0 or 1).
    pub fn value_placeholders(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Value(_)))
            .count()
    }

    /// Format of the value placeholder, if the template has one.
    pub fn value_format(&self) -> Option<ValueFormat> {
        self.segments.iter().find_map(|s| match s {
            Segment::Value(format) => Some(*format),
            _ => None,
        })
    }

    /// Whether `{ch_id}` appears in the template.
    pub fn uses_channel_id(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::ChannelId))
    }

    /// Channel families referenced by name.
    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::FamilyId(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Substitute channel placeholders, nearest channel first in `channels`.
    ///
    /// The value placeholder is emitted as `{}` and literal braces are
    /// re-escaped, so the result can be completed with
    /// [`substitute`](crate::session::substitute).
    pub fn resolve(&self, channels: &[(String, ChannelId)]) -> InstrResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(&escape_braces(text)),
                Segment::Value(_) => out.push_str("{}"),
                Segment::ChannelId => {
                    let (_, id) = channels.first().ok_or_else(|| {
                        InstrError::Declaration(format!(
                            "command template '{}' uses {{ch_id}} outside of a channel",
                            self.source
                        ))
                    })?;
                    out.push_str(&escape_braces(&id.to_string()));
                }
                Segment::FamilyId(family) => {
                    let (_, id) = channels
                        .iter()
                        .find(|(name, _)| name == family)
                        .ok_or_else(|| {
                            InstrError::Declaration(format!(
                                "command template '{}' references channel '{}' which does not enclose it",
                                self.source, family
                            ))
                        })?;
                    out.push_str(&escape_braces(&id.to_string()));
                }
            }
        }
        Ok(out)
    }

    /// Format `value` with this template's value placeholder.
    pub fn format_value(&self, value: &Value) -> Result<String, String> {
        self.value_format().unwrap_or(ValueFormat::Plain).render(value)
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn escape_braces(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::substitute;

    #[test]
    fn test_parse_value_specs() {
        let t = CommandTemplate::parse("FREQ {:.2f}").unwrap();
        assert_eq!(t.value_format(), Some(ValueFormat::Fixed(2)));
        assert_eq!(t.format_value(&Value::Float(250.5)).unwrap(), "250.50");

        let t = CommandTemplate::parse("ADDR {:03d}").unwrap();
        assert_eq!(t.format_value(&Value::Int(7)).unwrap(), "007");

        let t = CommandTemplate::parse("MASK {:X}").unwrap();
        assert_eq!(t.format_value(&Value::Int(255)).unwrap(), "FF");

        let t = CommandTemplate::parse("VOLT {:.3e}").unwrap();
        assert_eq!(t.format_value(&Value::Float(250.5)).unwrap(), "2.505e+02");
        assert_eq!(t.format_value(&Value::Float(0.0125)).unwrap(), "1.250e-02");
    }

    #[test]
    fn test_rejects_malformed_templates() {
        assert!(CommandTemplate::parse("FREQ {").is_err());
        assert!(CommandTemplate::parse("FREQ }").is_err());
        assert!(CommandTemplate::parse("FREQ {:q}").is_err());
        assert!(CommandTemplate::parse("A {} B {}").is_err());
        assert!(CommandTemplate::parse("A {1x}").is_err());
    }

    #[test]
    fn test_resolve_channels_and_escapes() {
        let t = CommandTemplate::parse("SOUR{output}:LIST{ch_id} {{x}} {}").unwrap();
        let channels = vec![
            ("marker".to_string(), ChannelId::Index(3)),
            ("output".to_string(), ChannelId::Index(1)),
        ];
        let resolved = t.resolve(&channels).unwrap();
        assert_eq!(resolved, "SOUR1:LIST3 {{x}} {}");
        assert_eq!(substitute(&resolved, Some("5")), "SOUR1:LIST3 {x} 5");
        assert_eq!(t.families().collect::<Vec<_>>(), vec!["output"]);
    }

    #[test]
    fn test_channel_ids_with_braces_survive_substitution() {
        let t = CommandTemplate::parse("OUTP{ch_id}:LOAD {}").unwrap();
        let channels = vec![("output".to_string(), ChannelId::Name("{rear}".into()))];
        let resolved = t.resolve(&channels).unwrap();
        assert_eq!(resolved, "OUTP{{rear}}:LOAD {}");
        assert_eq!(substitute(&resolved, Some("50")), "OUTP{rear}:LOAD 50");
    }

    #[test]
    fn test_channel_placeholder_requires_channel() {
        let t = CommandTemplate::parse("OUTP{ch_id}?").unwrap();
        assert!(t.uses_channel_id());
        assert!(t.resolve(&[]).is_err());
    }
}
