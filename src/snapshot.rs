//! Immutable form snapshots.

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;

use crate::path::{get_in, set_in, FieldPath};

/// The whole form's data at one point in time.
///
/// Cheap to clone (shared `Arc`); every "modification" produces a new
/// snapshot and leaves the original untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot(Arc<Value>);

impl Snapshot {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// An empty object.
    pub fn empty() -> Self {
        Self::new(Value::Object(Default::default()))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Arc::try_unwrap(self.0).unwrap_or_else(|shared| (*shared).clone())
    }

    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        get_in(&self.0, path)
    }

    /// A copy with `path` overwritten by `value`.
    pub fn with_value(&self, path: &FieldPath, value: Value) -> Snapshot {
        let mut next = (*self.0).clone();
        set_in(&mut next, path, value);
        Snapshot::new(next)
    }

    /// A copy with each `(path, value)` written in order.
    ///
    /// Only the listed paths are touched; array siblings and keys the
    /// writes do not name keep their current content.
    pub fn with_values(&self, leaves: &[(FieldPath, Value)]) -> Snapshot {
        let mut next = (*self.0).clone();
        for (path, value) in leaves {
            set_in(&mut next, path, value.clone());
        }
        Snapshot::new(next)
    }

    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for Snapshot {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_value_leaves_original() {
        let base = Snapshot::new(json!({"a": 1}));
        let path = FieldPath::parse("b.c").unwrap();
        let next = base.with_value(&path, json!(2));

        assert_eq!(base.value(), &json!({"a": 1}));
        assert_eq!(next.value(), &json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn test_with_values_touches_only_named_paths() {
        let base = Snapshot::new(json!({
            "keep": true,
            "address": {"street": "old", "city": "Oslo"},
            "items": [{"qty": 1, "sku": "A"}, {"qty": 5, "sku": "B"}]
        }));
        let next = base.with_values(&[
            (FieldPath::parse("address.street").unwrap(), json!("new")),
            (FieldPath::parse("items[0].qty").unwrap(), json!(2)),
        ]);
        assert_eq!(
            next.value(),
            &json!({
                "keep": true,
                "address": {"street": "new", "city": "Oslo"},
                "items": [{"qty": 2, "sku": "A"}, {"qty": 5, "sku": "B"}]
            })
        );
        assert_eq!(base.get(&FieldPath::parse("items[0].qty").unwrap()), Some(&json!(1)));
    }

    #[test]
    fn test_with_values_keeps_earlier_array_elements() {
        let base = Snapshot::new(json!({"items": [{"qty": 1}, {"qty": 5}]}));
        let next = base.with_values(&[(FieldPath::parse("items[1].qty").unwrap(), json!(7))]);
        assert_eq!(next.value(), &json!({"items": [{"qty": 1}, {"qty": 7}]}));
    }

    #[test]
    fn test_clone_shares_storage() {
        let a = Snapshot::new(json!({"x": 1}));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert_eq!(b.into_value(), json!({"x": 1}));
    }
}
