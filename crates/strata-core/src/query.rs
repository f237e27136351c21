//! # Query Module
//!
//! The two query shapes every backend must execute:
//! - `Property`: equality/containment filter over named static attributes
//! - `GetAll`: every state of one model
//!
//! Matching is deterministic and shared by the bundled backends through
//! [`Query::matches`]. No planning, no ranking.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Backend query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    /// Property → value or list of values.
    ///
    /// List members are OR'd, properties are AND'd.
    Property {
        property_values: BTreeMap<String, Value>,
    },
    /// Every state of the queried model.
    GetAll,
}

impl Query {
    /// Empty property filter.
    #[must_use]
    pub fn property() -> Self {
        Self::Property {
            property_values: BTreeMap::new(),
        }
    }

    /// Add one property predicate. No-op on `GetAll`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Self::Property { property_values } = &mut self {
            property_values.insert(name.into(), value.into());
        }
        self
    }

    /// Check a state's static attributes against this query.
    #[must_use]
    pub fn matches(&self, static_props: &BTreeMap<String, Value>) -> bool {
        match self {
            Self::GetAll => true,
            Self::Property { property_values } => property_values
                .iter()
                .all(|(name, expected)| match static_props.get(name) {
                    Some(actual) => predicate_matches(expected, actual),
                    None => false,
                }),
        }
    }
}

fn predicate_matches(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::Array(options) => options.iter().any(|o| scalar_matches(o, actual)),
        other => scalar_matches(other, actual),
    }
}

/// Equality, or containment when the stored attribute is a list.
fn scalar_matches(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    match actual {
        Value::Array(items) => items.iter().any(|item| item == expected),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn get_all_matches_everything() {
        assert!(Query::GetAll.matches(&BTreeMap::new()));
    }

    #[test]
    fn properties_are_anded() {
        let query = Query::property().with("a", 1).with("b", "x");
        assert!(query.matches(&props(&[("a", json!(1)), ("b", json!("x"))])));
        assert!(!query.matches(&props(&[("a", json!(1)), ("b", json!("y"))])));
        assert!(!query.matches(&props(&[("a", json!(1))])));
    }

    #[test]
    fn list_members_are_ored() {
        let query = Query::property().with("colour", json!(["red", "blue"]));
        assert!(query.matches(&props(&[("colour", json!("blue"))])));
        assert!(!query.matches(&props(&[("colour", json!("green"))])));
    }

    #[test]
    fn scalar_matches_list_attribute_by_containment() {
        let query = Query::property().with("tags", "new");
        assert!(query.matches(&props(&[("tags", json!(["old", "new"]))])));
        assert!(!query.matches(&props(&[("tags", json!(["old"]))])));
    }

    #[test]
    fn with_on_get_all_is_ignored() {
        assert_eq!(Query::GetAll.with("a", 1), Query::GetAll);
    }
}
