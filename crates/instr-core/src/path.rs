//! Dotted member paths: `frequency`, `trigger.level`, `output[main].offset`.

use crate::error::{InstrError, InstrResult};
use std::fmt;

/// One path segment, `name` or `name[id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Member name.
    pub name: String,
    /// Channel id or alias, as written.
    pub id: Option<String>,
}

/// A parsed member path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPath {
    segments: Vec<PathSegment>,
}

impl MemberPath {
    /// Parse `a.b[id].c`.
    pub fn parse(path: &str) -> InstrResult<Self> {
        let invalid = |message: &str| InstrError::InvalidPath {
            path: path.to_string(),
            message: message.to_string(),
        };
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty path"));
        }
        let mut segments = Vec::new();
        for raw in trimmed.split('.') {
            let (name, id) = match raw.split_once('[') {
                Some((name, rest)) => {
                    let id = rest
                        .strip_suffix(']')
                        .ok_or_else(|| invalid("unterminated '['"))?;
                    if id.is_empty() || id.contains(['[', ']']) {
                        return Err(invalid("invalid channel id"));
                    }
                    (name, Some(id.to_string()))
                }
                None => (raw, None),
            };
            let valid_name = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid_name {
                return Err(invalid(&format!("invalid segment '{}'", raw)));
            }
            segments.push(PathSegment {
                name: name.to_string(),
                id,
            });
        }
        Ok(Self { segments })
    }

    /// Segments in order, outermost first.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }
}

/// A member path relative to a node: each leading `.` climbs to the parent.
///
/// `frequency` is a sibling, `.frequency` a feature of the parent,
/// `..output[1].offset` goes up two levels then down into a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativePath {
    source: String,
    levels: usize,
    path: MemberPath,
}

impl RelativePath {
    /// Parse a relative path. The last segment must not carry an id.
    pub fn parse(text: &str) -> InstrResult<Self> {
        let trimmed = text.trim();
        let rest = trimmed.trim_start_matches('.');
        let levels = trimmed.len() - rest.len();
        let path = MemberPath::parse(rest)?;
        if path.segments().last().is_some_and(|last| last.id.is_some()) {
            return Err(InstrError::InvalidPath {
                path: text.to_string(),
                message: "path must end with a member name".into(),
            });
        }
        Ok(Self {
            source: trimmed.to_string(),
            levels,
            path,
        })
    }

    /// Number of parents to climb before walking the path.
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Path walked from the node reached after climbing.
    pub fn path(&self) -> &MemberPath {
        &self.path
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl fmt::Display for MemberPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg.name)?;
            if let Some(id) = &seg.id {
                write!(f, "[{}]", id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paths() {
        let p = MemberPath::parse("output[main].offset").unwrap();
        assert_eq!(p.segments().len(), 2);
        assert_eq!(p.segments()[0].id.as_deref(), Some("main"));
        assert_eq!(p.to_string(), "output[main].offset");

        assert!(MemberPath::parse("").is_err());
        assert!(MemberPath::parse("a..b").is_err());
        assert!(MemberPath::parse("output[1").is_err());
        assert!(MemberPath::parse("output[]").is_err());
        assert!(MemberPath::parse("out put").is_err());
    }

    #[test]
    fn test_parse_relative_paths() {
        let p = RelativePath::parse("..output[1].offset").unwrap();
        assert_eq!(p.levels(), 2);
        assert_eq!(p.path().to_string(), "output[1].offset");

        let sibling = RelativePath::parse("frequency").unwrap();
        assert_eq!(sibling.levels(), 0);

        assert!(RelativePath::parse("..").is_err());
        assert!(RelativePath::parse(".output[1]").is_err());
    }
}
