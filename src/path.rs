//! Field paths.
//!
//! A [`FieldPath`] names a leaf or group inside the form's data shape using
//! dot/bracket notation (`address.street`, `items[0].qty`). Numeric dot
//! segments are normalised to bracket form, so `items.0.qty` and
//! `items[0].qty` are the same path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::FormSyncError;

/// Largest array index a path may name. Writing a path pads the array up
/// to its index, so the bound also caps that allocation.
pub const MAX_INDEX: usize = 100_000;

/// One step of a [`FieldPath`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Canonical dot/bracket path into the form value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl FieldPath {
    /// Parse a path, normalising it to canonical form.
    pub fn parse(input: &str) -> Result<Self, FormSyncError> {
        let segments = parse_segments(input)?;
        Ok(Self::from_segments(segments))
    }

    /// Build a path from already-split segments.
    ///
    /// Segments must be non-empty; an empty key segment is kept verbatim.
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        let raw = render(&segments);
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The enclosing group, or `None` for a top-level field.
    pub fn parent(&self) -> Option<FieldPath> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self::from_segments(
            self.segments[..self.segments.len() - 1].to_vec(),
        ))
    }

    /// Append a segment.
    pub fn join(&self, segment: PathSegment) -> FieldPath {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self::from_segments(segments)
    }

    /// Strictly below `ancestor` (not equal to it).
    pub fn is_descendant_of(&self, ancestor: &FieldPath) -> bool {
        self.segments.len() > ancestor.segments.len()
            && self.segments.starts_with(&ancestor.segments)
    }

    /// Equal to `prefix` or below it.
    pub fn is_within(&self, prefix: &FieldPath) -> bool {
        self == prefix || self.is_descendant_of(prefix)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FieldPath {
    type Err = FormSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = FormSyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for FieldPath {
    type Error = FormSyncError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl AsRef<str> for FieldPath {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

fn invalid(input: &str, reason: &str) -> FormSyncError {
    FormSyncError::InvalidPath {
        path: input.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_segments(input: &str) -> Result<Vec<PathSegment>, FormSyncError> {
    if input.is_empty() {
        return Err(invalid(input, "path is empty"));
    }

    let mut segments = Vec::new();
    let mut chars = input.chars().peekable();
    let mut key = String::new();
    // Set after `]` so that `a[0]b` is rejected but `a[0].b` / `a[0][1]` pass.
    let mut after_index = false;

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if key.is_empty() && !after_index {
                    return Err(invalid(input, "empty segment"));
                }
                if !key.is_empty() {
                    let first = segments.is_empty();
                    segments.push(key_segment(input, std::mem::take(&mut key), first)?);
                }
                after_index = false;
                if chars.peek().is_none() {
                    return Err(invalid(input, "trailing '.'"));
                }
            }
            '[' => {
                if !key.is_empty() {
                    let first = segments.is_empty();
                    segments.push(key_segment(input, std::mem::take(&mut key), first)?);
                } else if segments.is_empty() {
                    return Err(invalid(input, "path cannot start with an index"));
                }
                let mut digits = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == ']' {
                        closed = true;
                        break;
                    }
                    digits.push(d);
                }
                if !closed {
                    return Err(invalid(input, "unclosed '['"));
                }
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid(input, "index must be a non-negative integer"));
                }
                segments.push(PathSegment::Index(bounded_index(input, &digits)?));
                after_index = true;
            }
            ']' => return Err(invalid(input, "unexpected ']'")),
            other => {
                if after_index {
                    return Err(invalid(input, "expected '.' or '[' after ']'"));
                }
                key.push(other);
            }
        }
    }

    if !key.is_empty() {
        let first = segments.is_empty();
        segments.push(key_segment(input, key, first)?);
    }

    Ok(segments)
}

fn key_segment(input: &str, key: String, first: bool) -> Result<PathSegment, FormSyncError> {
    // `items.0` addresses the same slot as `items[0]`; a leading segment is always a key
    if first || !key.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(PathSegment::Key(key));
    }
    Ok(PathSegment::Index(bounded_index(input, &key)?))
}

fn bounded_index(input: &str, digits: &str) -> Result<usize, FormSyncError> {
    match digits.parse::<usize>() {
        Ok(index) if index <= MAX_INDEX => Ok(index),
        _ => Err(invalid(input, "index is too large")),
    }
}

fn render(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            PathSegment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSegment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

// ─── Value access ─────────────────────────────────────────────

/// Read the value at `path`, if every step exists.
pub fn get_in<'a>(value: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.segments() {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `new_value` at `path`, creating intermediate objects and arrays.
///
/// A scalar standing where a container is needed is replaced. Arrays are
/// padded with `null` up to the target index. Returns `false` without
/// touching `value` if the path names an index above [`MAX_INDEX`].
pub fn set_in(value: &mut Value, path: &FieldPath, new_value: Value) -> bool {
    let out_of_range = path
        .segments()
        .iter()
        .any(|s| matches!(s, PathSegment::Index(index) if *index > MAX_INDEX));
    if out_of_range {
        return false;
    }

    let mut current = value;
    for segment in path.segments() {
        current = match segment {
            PathSegment::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                let Value::Object(map) = current else {
                    return false;
                };
                map.entry(key.clone()).or_insert(Value::Null)
            }
            PathSegment::Index(index) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let Value::Array(items) = current else {
                    return false;
                };
                if items.len() <= *index {
                    items.resize(*index + 1, Value::Null);
                }
                &mut items[*index]
            }
        };
    }
    *current = new_value;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_dot_and_bracket() {
        let path = p("items[0].qty");
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("items".into()),
                PathSegment::Index(0),
                PathSegment::Key("qty".into()),
            ]
        );
        assert_eq!(path.as_str(), "items[0].qty");
    }

    #[test]
    fn test_numeric_dot_segment_normalises() {
        assert_eq!(p("items.0.qty"), p("items[0].qty"));
        assert_eq!(p("matrix[1][2]").as_str(), "matrix[1][2]");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", ".a", "a.", "a..b", "a[", "a[x]", "a[0]b", "[0]", "a]"] {
            assert!(FieldPath::parse(bad).is_err(), "expected {bad:?} to be rejected");
        }
    }

    #[test]
    fn test_parse_rejects_oversized_indices() {
        for bad in [
            "items[18446744073709551615]",
            "items[1000000000]",
            "items.1000000000",
            "items.99999999999999999999999",
        ] {
            assert!(
                matches!(FieldPath::parse(bad), Err(FormSyncError::InvalidPath { .. })),
                "expected {bad:?} to be rejected"
            );
        }
        assert_eq!(p(&format!("items[{MAX_INDEX}]")).depth(), 2);
    }

    #[test]
    fn test_parent_and_descendants() {
        let street = p("address.street");
        let address = p("address");
        assert_eq!(street.parent(), Some(address.clone()));
        assert!(street.is_descendant_of(&address));
        assert!(!address.is_descendant_of(&address));
        assert!(address.is_within(&address));
        // Prefix on the string level is not enough
        assert!(!p("addressLine").is_within(&address));
        assert_eq!(address.parent(), None);
    }

    #[test]
    fn test_get_in() {
        let value = json!({"items": [{"qty": 3}], "name": "x"});
        assert_eq!(get_in(&value, &p("items[0].qty")), Some(&json!(3)));
        assert_eq!(get_in(&value, &p("items[1].qty")), None);
        assert_eq!(get_in(&value, &p("name.first")), None);
    }

    #[test]
    fn test_set_in_creates_containers() {
        let mut value = json!({});
        set_in(&mut value, &p("items[2].qty"), json!(5));
        assert_eq!(value, json!({"items": [null, null, {"qty": 5}]}));

        set_in(&mut value, &p("name"), json!("a"));
        set_in(&mut value, &p("name.first"), json!("b"));
        assert_eq!(value["name"], json!({"first": "b"}));
    }

    #[test]
    fn test_set_in_refuses_out_of_range_index() {
        let mut value = json!({"items": "scalar"});
        let path = FieldPath::from_segments(vec![
            PathSegment::Key("items".into()),
            PathSegment::Index(usize::MAX),
        ]);
        assert!(!set_in(&mut value, &path, json!(1)));
        assert_eq!(value, json!({"items": "scalar"}));
    }

    #[test]
    fn test_serde_as_string() {
        let path: FieldPath = serde_json::from_str("\"a.b[1]\"").unwrap();
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"a.b[1]\"");
        assert!(serde_json::from_str::<FieldPath>("\"a..b\"").is_err());
    }

    fn segment_strategy() -> impl Strategy<Value = PathSegment> {
        prop_oneof![
            "[a-zA-Z_][a-zA-Z0-9_]{0,8}".prop_map(PathSegment::Key),
            (0usize..50).prop_map(PathSegment::Index),
        ]
    }

    proptest! {
        #[test]
        fn prop_render_then_parse_is_identity(
            first in "[a-zA-Z_][a-zA-Z0-9_]{0,8}",
            rest in proptest::collection::vec(segment_strategy(), 0..6),
        ) {
            let mut segments = vec![PathSegment::Key(first)];
            segments.extend(rest);
            let path = FieldPath::from_segments(segments.clone());
            let reparsed = FieldPath::parse(path.as_str()).unwrap();
            prop_assert_eq!(reparsed.segments(), segments.as_slice());
        }

        #[test]
        fn prop_set_then_get(
            first in "[a-z]{1,6}",
            rest in proptest::collection::vec(segment_strategy(), 0..4),
            n in any::<i64>(),
        ) {
            let mut segments = vec![PathSegment::Key(first)];
            segments.extend(rest);
            let path = FieldPath::from_segments(segments);
            let mut value = serde_json::json!({});
            set_in(&mut value, &path, serde_json::json!(n));
            prop_assert_eq!(get_in(&value, &path), Some(&serde_json::json!(n)));
        }
    }
}
