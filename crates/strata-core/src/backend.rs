//! # Backend Contract
//!
//! The primitives a storage driver implements for the engine. The engine
//! never reaches storage through anything else, so any driver satisfying
//! this trait (single substrate or split across several) runs the same
//! put/patch/get/delete/query algorithm.
//!
//! Reads take `&self`, writes take `&mut self`. A model name of
//! [`ANY_MODEL`](crate::primitives::ANY_MODEL) matches a uid of any model in
//! `uid_exists` and `get_state_by_uid`.

use crate::inspector::RelInspector;
use crate::model::TimeSeries;
use crate::primitives::ANY_MODEL;
use crate::query::Query;
use crate::{StoreError, Uid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Static attributes by field name.
pub type StaticProps = BTreeMap<String, Value>;

/// Time-versioned attributes by field name.
pub type DynamicProps = BTreeMap<String, TimeSeries>;

/// One end of a stored edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeTarget {
    pub uid: Uid,
    pub model_name: String,
}

impl EdgeTarget {
    #[must_use]
    pub fn new(uid: Uid, model_name: impl Into<String>) -> Self {
        Self {
            uid,
            model_name: model_name.into(),
        }
    }
}

/// A state as stored: attributes plus edge lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawState {
    pub model_name: String,
    pub static_props: StaticProps,
    pub dynamic_props: DynamicProps,
    /// Forward relationship and backref fields, by field name.
    pub relationships: BTreeMap<String, Vec<EdgeTarget>>,
}

/// True if a stored model satisfies a requested model name.
#[must_use]
pub fn model_matches(requested: &str, stored: &str) -> bool {
    requested == ANY_MODEL || requested == stored
}

/// Primitive operations of a storage driver.
///
/// All fallible operations return `Result<T, StoreError>`; driver failures
/// surface as [`StoreError::Backend`].
pub trait Backend {
    /// Check that `uid` exists as a state of `model_name`.
    fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError>;

    /// Create a state and return its new uid.
    fn create_model(
        &mut self,
        model_name: &str,
        static_props: &StaticProps,
        dynamic_props: &DynamicProps,
    ) -> Result<Uid, StoreError>;

    /// Remove a state with its attributes, its forward edges, every edge
    /// pointing at it and every backref entry it owns.
    fn delete_model(&mut self, uid: &Uid, model_name: &str) -> Result<(), StoreError>;

    /// Replace all static attributes.
    fn overwrite_static_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &StaticProps,
    ) -> Result<(), StoreError>;

    /// Replace all time-versioned attributes.
    fn overwrite_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError>;

    /// Append points to the given time-versioned attributes.
    fn extend_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError>;

    /// Drop every edge of one relationship field, with the mirrored backref
    /// entries. Returns the former targets in edge order.
    fn delete_all_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        field: &str,
    ) -> Result<Vec<EdgeTarget>, StoreError>;

    /// Record edges to every (already persisted) target of `rel`, and the
    /// mirrored backref entries when `rel.to_field` is set.
    fn create_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
    ) -> Result<(), StoreError>;

    /// Load a stored state.
    fn get_state_by_uid(&self, uid: &Uid, model_name: &str) -> Result<RawState, StoreError>;

    /// Run a query scoped to one model. States are loaded only when
    /// `include_states` is set.
    fn execute_query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<BTreeMap<Uid, Option<RawState>>, StoreError>;
}

/// Edge targets of a relationship descriptor, resolved from its references.
pub(crate) fn edge_targets(rel: &RelInspector) -> Result<Vec<EdgeTarget>, StoreError> {
    rel.to_refs
        .iter()
        .map(|r| {
            let uid = r.uid().ok_or(StoreError::UnresolvedReference)?;
            let model = r
                .model_name
                .clone()
                .or_else(|| r.state.as_ref().and_then(|s| s.model_name().map(str::to_string)))
                .unwrap_or_else(|| rel.to_model.clone());
            Ok(EdgeTarget::new(uid.clone(), model))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_every_model() {
        assert!(model_matches(ANY_MODEL, "Foo"));
        assert!(model_matches("Foo", "Foo"));
        assert!(!model_matches("Bar", "Foo"));
    }
}
