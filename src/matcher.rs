//! Request matching logic.
//!
//! Path patterns select a route; condition sets decide whether the route's
//! primary response or its fallback is served.

use crate::config::ConditionSet;
use serde_json::{Map, Value};

/// The parts of a request a condition set can inspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestSections<'a> {
    pub query: Option<&'a Map<String, Value>>,
    /// Header names must be lowercase.
    pub headers: Option<&'a Map<String, Value>>,
    pub body: Option<&'a Value>,
}

/// Evaluates condition sets against requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionMatcher;

impl ConditionMatcher {
    /// Whether the request satisfies every section of the condition set.
    ///
    /// An absent or empty condition set always matches. A section required
    /// by the set but missing from the request never matches.
    pub fn matches(conditions: Option<&ConditionSet>, request: &RequestSections<'_>) -> bool {
        let Some(conditions) = conditions.filter(|c| !c.is_empty()) else {
            return true;
        };

        if let Some(expected) = &conditions.query {
            let actual = request.query.map(|q| Value::Object(q.clone()));
            if !match_values(expected, actual.as_ref()) {
                return false;
            }
        }

        if let Some(expected) = &conditions.headers {
            // Header names are case-insensitive.
            let expected: Map<String, Value> = expected
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect();
            let actual = request.headers.map(|h| Value::Object(h.clone()));
            if !match_values(&expected, actual.as_ref()) {
                return false;
            }
        }

        if let Some(expected) = &conditions.body {
            if !match_values(expected, request.body) {
                return false;
            }
        }

        true
    }
}

/// Subset match of `expected` against `actual`.
///
/// Every key of `expected` must be present in `actual`. Nested objects
/// recurse with the same rule; arrays and scalars must be exactly equal.
pub fn match_values(expected: &Map<String, Value>, actual: Option<&Value>) -> bool {
    let Some(Value::Object(actual)) = actual else {
        return false;
    };

    expected.iter().all(|(key, want)| {
        let got = actual.get(key);
        match want {
            Value::Object(nested) => match_values(nested, got),
            _ => got == Some(want),
        }
    })
}

/// A compiled route path such as `/users/:id/posts/*`.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    segments: Vec<PatternSegment>,
}

#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    Literal(String),
    Param(String),
    /// Matches the remainder of the path, captured as `0`
    Wildcard,
}

impl PathPattern {
    /// Parse a pattern. Returns an error message for malformed patterns.
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let parts: Vec<&str> = split_segments(pattern).collect();

        for (i, part) in parts.iter().enumerate() {
            let segment = if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(format!("invalid parameter `{}` in `{}`", part, pattern));
                }
                PatternSegment::Param(name.to_string())
            } else if *part == "*" {
                if i + 1 != parts.len() {
                    return Err(format!("wildcard must be the last segment in `{}`", pattern));
                }
                PatternSegment::Wildcard
            } else {
                PatternSegment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a request path, returning decoded path parameters.
    pub fn matches(&self, path: &str) -> Option<Map<String, Value>> {
        let mut params = Map::new();
        let mut parts = split_segments(path);

        for segment in &self.segments {
            match segment {
                PatternSegment::Literal(lit) => {
                    if parts.next()? != lit.as_str() {
                        return None;
                    }
                }
                PatternSegment::Param(name) => {
                    let raw = parts.next()?;
                    params.insert(name.clone(), Value::String(decode_segment(raw)));
                }
                PatternSegment::Wildcard => {
                    let rest: Vec<String> = parts.by_ref().map(decode_segment).collect();
                    params.insert("0".to_string(), Value::String(rest.join("/")));
                }
            }
        }

        // Must consume entire path
        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }
}

/// Path segments, ignoring leading/trailing slashes.
fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty())
}

fn decode_segment(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Parse a query string or urlencoded form into key-value pairs.
///
/// Repeated keys collect into an array.
pub fn parse_query_string(query: &str) -> Map<String, Value> {
    let mut params = Map::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match params.get_mut(&*key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                params.insert(key.into_owned(), value);
            }
        }
    }

    params
}
