//! # In-Memory Backend
//!
//! Ordered maps for records, forward edges and backref lists. Uids are issued
//! from a counter. Iteration order is deterministic, so query results and
//! edge lists are reproducible across runs.

use crate::backend::{
    Backend, DynamicProps, EdgeTarget, RawState, StaticProps, edge_targets, model_matches,
};
use crate::inspector::RelInspector;
use crate::query::Query;
use crate::storage::{StoredEdge, StoredRecord};
use crate::{StoreError, Uid};
use std::collections::BTreeMap;
use tracing::trace;

type FieldEdges = BTreeMap<String, Vec<StoredEdge>>;
type FieldBackrefs = BTreeMap<String, Vec<EdgeTarget>>;

/// Backend keeping everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: BTreeMap<Uid, StoredRecord>,
    edges: BTreeMap<Uid, FieldEdges>,
    backrefs: BTreeMap<Uid, FieldBackrefs>,
    next_id: u64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record(&self, uid: &Uid, model_name: &str) -> Result<&StoredRecord, StoreError> {
        self.records
            .get(uid)
            .filter(|r| model_matches(model_name, &r.model_name))
            .ok_or_else(|| StoreError::NotFound {
                uid: uid.clone(),
                model: model_name.to_string(),
            })
    }

    fn record_mut(&mut self, uid: &Uid, model_name: &str) -> Result<&mut StoredRecord, StoreError> {
        self.records
            .get_mut(uid)
            .filter(|r| model_matches(model_name, &r.model_name))
            .ok_or_else(|| StoreError::NotFound {
                uid: uid.clone(),
                model: model_name.to_string(),
            })
    }

    /// Remove the backref entry mirroring one edge from `source`.
    fn unlink_backref(&mut self, edge: &StoredEdge, source: &EdgeTarget) {
        let Some(field) = &edge.inverse else {
            return;
        };
        if let Some(list) = self
            .backrefs
            .get_mut(&edge.target.uid)
            .and_then(|fields| fields.get_mut(field))
        {
            if let Some(pos) = list.iter().position(|e| e == source) {
                list.remove(pos);
            }
        }
    }

    fn raw_state(&self, uid: &Uid, record: &StoredRecord) -> RawState {
        let mut relationships: BTreeMap<String, Vec<EdgeTarget>> = BTreeMap::new();
        if let Some(fields) = self.edges.get(uid) {
            for (field, edges) in fields {
                relationships.insert(field.clone(), edges.iter().map(|e| e.target.clone()).collect());
            }
        }
        if let Some(fields) = self.backrefs.get(uid) {
            for (field, sources) in fields {
                relationships.insert(field.clone(), sources.clone());
            }
        }
        RawState {
            model_name: record.model_name.clone(),
            static_props: record.static_props.clone(),
            dynamic_props: record.dynamic_props.clone(),
            relationships,
        }
    }
}

impl Backend for MemoryBackend {
    fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .get(uid)
            .is_some_and(|r| model_matches(model_name, &r.model_name)))
    }

    fn create_model(
        &mut self,
        model_name: &str,
        static_props: &StaticProps,
        dynamic_props: &DynamicProps,
    ) -> Result<Uid, StoreError> {
        self.next_id = self.next_id.saturating_add(1);
        let uid = Uid::new(self.next_id.to_string());
        trace!(%uid, model = model_name, "memory create");
        self.records.insert(
            uid.clone(),
            StoredRecord {
                model_name: model_name.to_string(),
                static_props: static_props.clone(),
                dynamic_props: dynamic_props.clone(),
            },
        );
        Ok(uid)
    }

    fn delete_model(&mut self, uid: &Uid, model_name: &str) -> Result<(), StoreError> {
        let stored_model = self.record(uid, model_name)?.model_name.clone();
        let source = EdgeTarget::new(uid.clone(), stored_model);

        if let Some(fields) = self.edges.remove(uid) {
            for edge in fields.values().flatten() {
                self.unlink_backref(edge, &source);
            }
        }
        for fields in self.edges.values_mut() {
            for edges in fields.values_mut() {
                edges.retain(|e| &e.target.uid != uid);
            }
        }
        self.backrefs.remove(uid);
        self.records.remove(uid);
        trace!(%uid, model = model_name, "memory delete");
        Ok(())
    }

    fn overwrite_static_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &StaticProps,
    ) -> Result<(), StoreError> {
        self.record_mut(uid, model_name)?.static_props = props.clone();
        Ok(())
    }

    fn overwrite_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        self.record_mut(uid, model_name)?.dynamic_props = props.clone();
        Ok(())
    }

    fn extend_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        let record = self.record_mut(uid, model_name)?;
        for (field, series) in props {
            record
                .dynamic_props
                .entry(field.clone())
                .or_default()
                .extend(series.clone());
        }
        Ok(())
    }

    fn delete_all_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        field: &str,
    ) -> Result<Vec<EdgeTarget>, StoreError> {
        let stored_model = self.record(from_uid, from_model)?.model_name.clone();
        let source = EdgeTarget::new(from_uid.clone(), stored_model);
        let removed = self
            .edges
            .get_mut(from_uid)
            .and_then(|fields| fields.remove(field))
            .unwrap_or_default();
        for edge in &removed {
            self.unlink_backref(edge, &source);
        }
        Ok(removed.into_iter().map(|e| e.target).collect())
    }

    fn create_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
    ) -> Result<(), StoreError> {
        let stored_model = self.record(from_uid, from_model)?.model_name.clone();
        let source = EdgeTarget::new(from_uid.clone(), stored_model);
        let targets = edge_targets(rel)?;
        for target in &targets {
            self.record(&target.uid, &target.model_name)?;
        }
        let list = self
            .edges
            .entry(from_uid.clone())
            .or_default()
            .entry(rel.from_field.clone())
            .or_default();
        for target in targets {
            // One edge per (field, target) pair.
            if list.iter().any(|edge| edge.target.uid == target.uid) {
                continue;
            }
            if let Some(inverse) = &rel.to_field {
                let sources = self
                    .backrefs
                    .entry(target.uid.clone())
                    .or_default()
                    .entry(inverse.clone())
                    .or_default();
                if !sources.contains(&source) {
                    sources.push(source.clone());
                }
            }
            list.push(StoredEdge {
                target,
                inverse: rel.to_field.clone(),
            });
        }
        Ok(())
    }

    fn get_state_by_uid(&self, uid: &Uid, model_name: &str) -> Result<RawState, StoreError> {
        let record = self.record(uid, model_name)?;
        Ok(self.raw_state(uid, record))
    }

    fn execute_query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<BTreeMap<Uid, Option<RawState>>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|(_, r)| model_matches(model_name, &r.model_name))
            .filter(|(_, r)| query.matches(&r.static_props))
            .map(|(uid, r)| {
                let state = include_states.then(|| self.raw_state(uid, r));
                (uid.clone(), state)
            })
            .collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelKind, TimePoint, TimeSeries};
    use crate::reference::Ref;
    use crate::{StoreRecord, StoreRef};
    use serde_json::json;
    use uuid::Uuid;

    fn locator(uid: &Uid, model: &str) -> Ref {
        Ref::to_record(
            StoreRecord::new(StoreRef::new(Uuid::nil(), "mem"), uid.clone()),
            model,
        )
    }

    fn rel(field: &str, to_field: Option<&str>, targets: Vec<Ref>) -> RelInspector {
        RelInspector {
            from_field: field.to_string(),
            to_field: to_field.map(str::to_string),
            to_model: "Leaf".to_string(),
            to_refs: targets,
            kind: RelKind::Composition,
        }
    }

    fn props(value: i64) -> StaticProps {
        BTreeMap::from([("n".to_string(), json!(value))])
    }

    #[test]
    fn create_and_get() {
        let mut backend = MemoryBackend::new();
        let uid = backend
            .create_model("Leaf", &props(1), &DynamicProps::new())
            .expect("create");
        assert!(backend.uid_exists(&uid, "Leaf").expect("exists"));
        assert!(backend.uid_exists(&uid, "Any").expect("exists"));
        assert!(!backend.uid_exists(&uid, "Root").expect("exists"));
        let raw = backend.get_state_by_uid(&uid, "Leaf").expect("get");
        assert_eq!(raw.static_props["n"], json!(1));
    }

    #[test]
    fn missing_uid_is_not_found() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.get_state_by_uid(&Uid::new("9"), "Leaf"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn extend_appends_points() {
        let mut backend = MemoryBackend::new();
        let series = |t: f64| -> DynamicProps {
            BTreeMap::from([(
                "s".to_string(),
                TimeSeries::new(vec![TimePoint::new(t, json!(t))]),
            )])
        };
        let uid = backend
            .create_model("Leaf", &StaticProps::new(), &series(0.0))
            .expect("create");
        backend.extend_dynamic_props(&uid, "Leaf", &series(1.0)).expect("extend");
        let raw = backend.get_state_by_uid(&uid, "Leaf").expect("get");
        assert_eq!(raw.dynamic_props["s"].len(), 2);
    }

    #[test]
    fn edges_maintain_backrefs() {
        let mut backend = MemoryBackend::new();
        let root = backend
            .create_model("Root", &StaticProps::new(), &DynamicProps::new())
            .expect("root");
        let leaf = backend
            .create_model("Leaf", &StaticProps::new(), &DynamicProps::new())
            .expect("leaf");
        backend
            .create_relationships(&root, "Root", &rel("leaves", Some("roots"), vec![locator(&leaf, "Leaf")]))
            .expect("link");

        let raw_leaf = backend.get_state_by_uid(&leaf, "Leaf").expect("get");
        assert_eq!(raw_leaf.relationships["roots"], vec![EdgeTarget::new(root.clone(), "Root")]);

        let removed = backend
            .delete_all_relationships(&root, "Root", "leaves")
            .expect("unlink");
        assert_eq!(removed, vec![EdgeTarget::new(leaf.clone(), "Leaf")]);
        let raw_leaf = backend.get_state_by_uid(&leaf, "Leaf").expect("get");
        assert!(raw_leaf.relationships["roots"].is_empty());
    }

    #[test]
    fn delete_model_detaches_incoming_edges() {
        let mut backend = MemoryBackend::new();
        let root = backend
            .create_model("Root", &StaticProps::new(), &DynamicProps::new())
            .expect("root");
        let leaf = backend
            .create_model("Leaf", &StaticProps::new(), &DynamicProps::new())
            .expect("leaf");
        backend
            .create_relationships(&root, "Root", &rel("leaves", None, vec![locator(&leaf, "Leaf")]))
            .expect("link");
        backend.delete_model(&leaf, "Leaf").expect("delete");
        let raw_root = backend.get_state_by_uid(&root, "Root").expect("get");
        assert!(raw_root.relationships["leaves"].is_empty());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn edge_to_missing_target_is_rejected() {
        let mut backend = MemoryBackend::new();
        let root = backend
            .create_model("Root", &StaticProps::new(), &DynamicProps::new())
            .expect("root");
        let result = backend.create_relationships(
            &root,
            "Root",
            &rel("leaves", None, vec![locator(&Uid::new("404"), "Leaf")]),
        );
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn query_filters_by_model_and_props() {
        let mut backend = MemoryBackend::new();
        let a = backend
            .create_model("Leaf", &props(1), &DynamicProps::new())
            .expect("a");
        backend
            .create_model("Leaf", &props(2), &DynamicProps::new())
            .expect("b");
        backend
            .create_model("Root", &props(1), &DynamicProps::new())
            .expect("c");
        let found = backend
            .execute_query(&Query::property().with("n", 1), "Leaf", false)
            .expect("query");
        assert_eq!(found.keys().collect::<Vec<_>>(), vec![&a]);
        assert!(found[&a].is_none());
        let all = backend
            .execute_query(&Query::GetAll, "Leaf", true)
            .expect("query");
        assert_eq!(all.len(), 2);
        assert!(all.values().all(Option::is_some));
    }
}
