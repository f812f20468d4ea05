//! Options gate expressions.
//!
//! A gate restricts a member to instruments with the right hardware or
//! firmware options installed:
//!
//! ```text
//! opt['mod'] == 1; opt['sweep']
//! ```
//!
//! Terms are separated by `;` (a `;` inside a quoted key or literal is part
//! of it) and all of them must hold. A term is either a
//! bare lookup (`opt['sweep']`, tested for truth) or a lookup compared with
//! a literal using `==`, `!=`, `<`, `<=`, `>` or `>=`. Literals are integers,
//! floats, quoted strings and `true`/`false`.
//!
//! Expressions are parsed into a [`Gate`] when the driver schema is built so
//! a malformed gate never reaches runtime. Evaluation is a plain walk over
//! the parsed terms against the options mappings read from the instrument.
//! A key missing from the options mapping makes its term false.

use crate::error::{InstrError, InstrResult};
use crate::value::Value;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

const TERM_PATTERN: &str = r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\[\s*(?:'([^']*)'|"([^"]*)"|([A-Za-z0-9_.\-]+))\s*\]\s*(?:(==|!=|<=|>=|<|>)\s*(.+?))?\s*$"#;

/// Comparison operator of a gate term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            _ => return None,
        })
    }

    /// Apply the operator. Ordering comparisons between values of different
    /// kinds (text vs number) are false.
    pub fn apply(&self, left: &Value, right: &Value) -> bool {
        match self {
            CompareOp::Eq => left.loosely_eq(right),
            CompareOp::Ne => !left.loosely_eq(right),
            _ => {
                let ordering = match (left, right) {
                    (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                    _ => match (left.as_f64(), right.as_f64()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    },
                };
                match ordering {
                    Some(Ordering::Less) => matches!(self, CompareOp::Lt | CompareOp::Le),
                    Some(Ordering::Equal) => matches!(self, CompareOp::Le | CompareOp::Ge),
                    Some(Ordering::Greater) => matches!(self, CompareOp::Gt | CompareOp::Ge),
                    None => false,
                }
            }
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

/// One `;`-separated term of a gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateTerm {
    /// Name of the options feature.
    pub feature: String,
    /// Key looked up in the options mapping.
    pub key: String,
    /// Comparison, `None` for a bare truth test.
    pub comparison: Option<(CompareOp, Value)>,
}

impl GateTerm {
    fn evaluate(&self, options: &HashMap<String, Value>) -> bool {
        let Some(value) = options
            .get(&self.feature)
            .and_then(Value::as_map)
            .and_then(|map| map.get(&self.key))
        else {
            return false;
        };
        match &self.comparison {
            None => value.is_truthy(),
            Some((op, literal)) => op.apply(value, literal),
        }
    }
}

/// A parsed gate expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Gate {
    source: String,
    terms: Vec<GateTerm>,
}

impl Gate {
    /// Parse a gate expression, failing with [`InstrError::GateSyntax`].
    pub fn parse(source: &str) -> InstrResult<Self> {
        let syntax = |message: String| InstrError::GateSyntax {
            gate: source.to_string(),
            message,
        };
        let term_re = Regex::new(TERM_PATTERN).map_err(|e| syntax(e.to_string()))?;

        let raw_terms = split_terms(source).map_err(syntax)?;
        let last = raw_terms.len() - 1;
        let mut terms = Vec::new();
        for (index, raw) in raw_terms.into_iter().enumerate() {
            if raw.trim().is_empty() {
                // Tolerate a trailing separator only.
                if index > 0 && index == last {
                    continue;
                }
                return Err(syntax(format!("empty term at position {}", index + 1)));
            }
            let caps = term_re
                .captures(raw)
                .ok_or_else(|| syntax(format!("cannot parse term '{}'", raw.trim())))?;
            let feature = caps[1].to_string();
            let key = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let comparison = match (caps.get(5), caps.get(6)) {
                (Some(op), Some(literal)) => {
                    let op = CompareOp::parse(op.as_str())
                        .ok_or_else(|| syntax(format!("unknown operator '{}'", op.as_str())))?;
                    let literal = parse_gate_literal(literal.as_str())
                        .ok_or_else(|| syntax(format!("invalid literal '{}'", literal.as_str())))?;
                    Some((op, literal))
                }
                _ => None,
            };
            terms.push(GateTerm {
                feature,
                key,
                comparison,
            });
        }
        if terms.is_empty() {
            return Err(syntax("gate has no terms".into()));
        }
        Ok(Self {
            source: source.to_string(),
            terms,
        })
    }

    /// Source text, also the memoization key on a node.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parsed terms, in source order.
    pub fn terms(&self) -> &[GateTerm] {
        &self.terms
    }

    /// Distinct options features referenced, in order of appearance.
    pub fn features(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for term in &self.terms {
            if !names.contains(&term.feature.as_str()) {
                names.push(&term.feature);
            }
        }
        names
    }

    /// Evaluate against options mappings keyed by options feature name.
    pub fn evaluate(&self, options: &HashMap<String, Value>) -> bool {
        self.terms.iter().all(|term| term.evaluate(options))
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Split on `;` outside of quotes.
fn split_terms(source: &str) -> Result<Vec<&str>, String> {
    let mut terms = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (index, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ';') => {
                terms.push(&source[start..index]);
                start = index + 1;
            }
            (None, _) => {}
        }
    }
    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }
    terms.push(&source[start..]);
    Ok(terms)
}

fn parse_gate_literal(text: &str) -> Option<Value> {
    let text = text.trim();
    match text {
        "true" | "True" => return Some(Value::Bool(true)),
        "false" | "False" => return Some(Value::Bool(false)),
        _ => {}
    }
    if text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')))
    {
        return Some(Value::Str(text[1..text.len() - 1].to_string()));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::Int(i));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Value::Float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn options(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        let map: BTreeMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        HashMap::from([("opt".to_string(), Value::Map(map))])
    }

    #[test]
    fn test_parse_terms() {
        let gate = Gate::parse("opt['k'] == 1; opt[\"j\"] >= 2.5; opt[mod]").unwrap();
        assert_eq!(gate.terms().len(), 3);
        assert_eq!(gate.terms()[0].key, "k");
        assert_eq!(
            gate.terms()[1].comparison,
            Some((CompareOp::Ge, Value::Float(2.5)))
        );
        assert!(gate.terms()[2].comparison.is_none());
        assert_eq!(gate.features(), vec!["opt"]);
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "",
            "opt",
            "opt['k'] = 1",
            "opt['k'] == ",
            "opt['k'] == bare",
            "opt['k'] == 1;; opt['j']",
            "opt['k' == 1",
        ] {
            let err = Gate::parse(bad).unwrap_err();
            assert!(
                matches!(err, InstrError::GateSyntax { .. }),
                "expected syntax error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_all_terms_must_hold() {
        let gate = Gate::parse("opt['k'] == 1; opt['j'] == 2").unwrap();
        assert!(gate.evaluate(&options(&[("k", Value::Int(1)), ("j", Value::Int(2))])));
        assert!(!gate.evaluate(&options(&[("k", Value::Int(1)), ("j", Value::Int(3))])));
    }

    #[test]
    fn test_missing_key_is_false() {
        let gate = Gate::parse("opt['absent'] != 1").unwrap();
        assert!(!gate.evaluate(&options(&[("k", Value::Int(1))])));
        let bare = Gate::parse("opt['absent']").unwrap();
        assert!(!bare.evaluate(&options(&[])));
    }

    #[test]
    fn test_relational_type_mismatch_is_false() {
        let gate = Gate::parse("opt['fw'] > 2").unwrap();
        assert!(!gate.evaluate(&options(&[("fw", Value::Str("beta".into()))])));
        assert!(gate.evaluate(&options(&[("fw", Value::Float(2.1))])));
    }

    #[test]
    fn test_separator_inside_quotes() {
        let gate = Gate::parse("opt['m'] == 'a;b'; opt[\"k;2\"]").unwrap();
        assert_eq!(gate.terms().len(), 2);
        assert_eq!(
            gate.terms()[0].comparison,
            Some((CompareOp::Eq, Value::Str("a;b".into())))
        );
        assert_eq!(gate.terms()[1].key, "k;2");
        assert!(gate.evaluate(&options(&[
            ("m", Value::Str("a;b".into())),
            ("k;2", Value::Bool(true)),
        ])));

        let err = Gate::parse("opt['m'] == 'a;b").unwrap_err();
        assert!(matches!(err, InstrError::GateSyntax { .. }));
    }

    #[test]
    fn test_string_and_bool_literals() {
        let gate = Gate::parse("opt['model'] == 'B'; opt['ext'] == True").unwrap();
        assert!(gate.evaluate(&options(&[
            ("model", Value::Str("B".into())),
            ("ext", Value::Bool(true)),
        ])));
    }
}
