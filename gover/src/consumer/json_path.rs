//! Minimal JSON path language for provider response mapping.
//!
//! A path is a dot separated list of keys, each optionally followed by one or
//! more `[index]` suffixes: `data.items[0].user.name`. A leading `$` or `$.`
//! is ignored. Candidate lists separate alternative paths with `|` or `,`;
//! the first path that resolves to a non-null value wins.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathParseError {
    pub path: String,
    pub reason: &'static str,
}

impl fmt::Display for PathParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid json path '{}': {}", self.path, self.reason)
    }
}

impl std::error::Error for PathParseError {}

/// A parsed path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(raw: &str) -> Result<Self, PathParseError> {
        let err = |reason| PathParseError {
            path: raw.to_string(),
            reason,
        };

        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("$.")
            .or_else(|| trimmed.strip_prefix('$'))
            .unwrap_or(trimmed);

        let mut segments = Vec::new();
        if body.is_empty() {
            return Ok(Self { segments });
        }

        for part in body.split('.') {
            let part = part.trim();
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if key.is_empty() && rest.is_empty() {
                return Err(err("empty segment"));
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let inner = rest.strip_prefix('[').ok_or_else(|| err("expected '['"))?;
                let close = inner.find(']').ok_or_else(|| err("missing ']'"))?;
                let index = inner[..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| err("index is not a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &inner[close + 1..];
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Resolve against `root`. An empty path resolves to `root` itself.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |value, segment| match segment {
                Segment::Key(key) => value.as_object()?.get(key),
                Segment::Index(index) => value.as_array()?.get(*index),
            })
    }
}

/// Alternative paths tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathCandidates {
    paths: Vec<JsonPath>,
}

impl PathCandidates {
    /// Parse `configured` followed by `defaults`. Blank entries are skipped.
    pub fn parse(configured: &str, defaults: &str) -> Result<Self, PathParseError> {
        let mut paths = Vec::new();
        for raw in configured
            .split(['|', ','])
            .chain(defaults.split(['|', ',']))
        {
            if raw.trim().is_empty() {
                continue;
            }
            let path = JsonPath::parse(raw)?;
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Ok(Self { paths })
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// First non-null match.
    pub fn first<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.paths
            .iter()
            .filter_map(|path| path.resolve(root))
            .find(|value| !value.is_null())
    }

    /// First match that is an array.
    pub fn first_array<'a>(&self, root: &'a Value) -> Option<&'a Vec<Value>> {
        self.paths
            .iter()
            .filter_map(|path| path.resolve(root))
            .find_map(Value::as_array)
    }

    /// First match rendered as a non-empty string. Numbers and booleans are
    /// stringified.
    pub fn first_string(&self, root: &Value) -> Option<String> {
        self.paths
            .iter()
            .filter_map(|path| path.resolve(root))
            .filter_map(scalar_string)
            .find(|s| !s.is_empty())
    }

    /// First match readable as an integer, including numeric strings.
    pub fn first_i64(&self, root: &Value) -> Option<i64> {
        self.paths
            .iter()
            .filter_map(|path| path.resolve(root))
            .find_map(scalar_i64)
    }
}

pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn scalar_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
