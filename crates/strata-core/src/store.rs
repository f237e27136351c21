//! # Store Engine
//!
//! The backend-independent put/patch/get/delete/query algorithm.
//!
//! Reference lifecycle:
//! - Detached (state only) → `put` creates → Persisted (record present)
//! - Persisted + state → `put` overwrites, `patch` extends
//! - Persisted → `delete` → gone, with composition targets cascaded
//!
//! Relationship discipline:
//!
//! | write     | association       | aggregation       | composition                  |
//! |-----------|-------------------|-------------------|------------------------------|
//! | create    | add               | add               | add                          |
//! | put       | replace           | replace           | replace, delete orphans      |
//! | patch     | replace           | add               | add                          |
//! | delete    | detach            | detach            | detach, delete targets       |
//!
//! Put/patch recursion through relationship targets is bounded by the
//! store's `max_depth`; delete cascades track visited uids.

use crate::backend::{Backend, RawState};
use crate::config::StoreConfig;
use crate::guid::{GuidMap, MemoryGuidMap};
use crate::inspector::{RelInspector, StateInspector};
use crate::model::{FieldValue, Parts, State};
use crate::primitives::{ANY_MODEL, DEFAULT_STORE_NAME, MAX_RELATIONSHIP_DEPTH};
use crate::query::Query;
use crate::reference::{Ref, StateSource};
use crate::registry::Registry;
use crate::storage::StorageBackend;
use crate::{Guid, StoreError, StoreMethod, StoreRecord, StoreRef, Uid};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

// =============================================================================
// SHARED ENGINE LOGIC
// =============================================================================

/// Backend-free part of the engine, shared by the blocking and async stores.
pub(crate) struct StoreCore {
    pub(crate) identity: StoreRef,
    pub(crate) registry: Arc<Registry>,
    pub(crate) guid_map: Option<Arc<dyn GuidMap>>,
    pub(crate) allowed_methods: BTreeSet<StoreMethod>,
    pub(crate) max_depth: usize,
}

impl std::fmt::Debug for StoreCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCore")
            .field("identity", &self.identity)
            .field("allowed_methods", &self.allowed_methods)
            .field("max_depth", &self.max_depth)
            .field("guid", &self.guid_map.is_some())
            .finish_non_exhaustive()
    }
}

impl StoreCore {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self {
            identity: StoreRef::new(Uuid::new_v4(), DEFAULT_STORE_NAME),
            registry,
            guid_map: None,
            allowed_methods: StoreMethod::ALL.into_iter().collect(),
            max_depth: MAX_RELATIONSHIP_DEPTH,
        }
    }

    pub(crate) fn from_config(config: &StoreConfig, registry: Arc<Registry>) -> Self {
        let guid_map: Option<Arc<dyn GuidMap>> = if config.guid {
            Some(Arc::new(MemoryGuidMap::new()))
        } else {
            None
        };
        Self {
            identity: config.identity(),
            registry,
            guid_map,
            allowed_methods: config.allowed_methods.iter().copied().collect(),
            max_depth: config.max_depth,
        }
    }

    pub(crate) fn validate_method(&self, method: StoreMethod) -> Result<(), StoreError> {
        if self.allowed_methods.contains(&method) {
            Ok(())
        } else {
            Err(StoreError::UnsupportedOperation {
                method,
                store: self.identity.name.clone(),
            })
        }
    }

    pub(crate) fn check_depth(&self, depth: usize) -> Result<(), StoreError> {
        if depth > self.max_depth {
            Err(StoreError::DepthExceeded(self.max_depth))
        } else {
            Ok(())
        }
    }

    /// Replace the record of a GUID-carrying reference with this store's
    /// record for that GUID, or clear it when the GUID is not linked here.
    pub(crate) fn fetch_record_by_guid(&self, reference: &mut Ref) -> Result<(), StoreError> {
        if let (Some(guid), Some(map)) = (&reference.guid, &self.guid_map) {
            reference.record = map
                .get_uid(guid, &self.identity)?
                .map(|uid| StoreRecord::new(self.identity.clone(), uid));
        }
        Ok(())
    }

    /// Uid of a reference whose record belongs to this store.
    pub(crate) fn local_uid(&self, reference: &Ref) -> Result<Uid, StoreError> {
        let record = reference
            .record
            .as_ref()
            .ok_or(StoreError::UnresolvedReference)?;
        if record.store.uid != self.identity.uid {
            return Err(StoreError::LocatorMismatch {
                expected: self.identity.uid,
                found: record.store.uid,
            });
        }
        Ok(record.uid.clone())
    }

    /// Declared model of a reference, checked against the registry.
    pub(crate) fn declared_model(&self, reference: &Ref) -> Result<String, StoreError> {
        let model = reference
            .model_name
            .clone()
            .or_else(|| {
                reference
                    .state
                    .as_ref()
                    .and_then(|s| s.model_name().map(str::to_string))
            })
            .ok_or(StoreError::MissingTypeTag)?;
        if model != ANY_MODEL && !self.registry.contains(&model) {
            return Err(StoreError::UnknownType(model));
        }
        Ok(model)
    }

    /// Classify an embedded state and check it against the declared model.
    pub(crate) fn inspect(&self, reference: &Ref, state: &dyn State) -> Result<StateInspector, StoreError> {
        let inspector = StateInspector::classify(state, &self.registry)?;
        if let Some(declared) = &reference.model_name {
            if declared != ANY_MODEL && declared != &inspector.model_name {
                return Err(StoreError::TypeMismatch {
                    expected: declared.clone(),
                    found: inspector.model_name,
                });
            }
        }
        Ok(inspector)
    }

    /// Fresh address for `uid`, with its GUID resolved or linked.
    pub(crate) fn generate_ref(
        &self,
        uid: Uid,
        model_name: String,
        guid: Option<Guid>,
    ) -> Result<Ref, StoreError> {
        let guid = match (guid, &self.guid_map) {
            (Some(guid), _) => {
                self.link_record(&uid, guid)?;
                Some(guid)
            }
            (None, Some(map)) => match map.get_guid(&uid, &self.identity)? {
                Some(existing) => Some(existing),
                None => Some(map.create_guid(&uid, &self.identity)?),
            },
            (None, None) => None,
        };
        Ok(Ref {
            record: Some(StoreRecord::new(self.identity.clone(), uid)),
            guid,
            model_name: Some(model_name),
            state: None,
        })
    }

    /// Reject an explicit GUID that contradicts the one linked to `uid`,
    /// before anything is written.
    pub(crate) fn check_guid(&self, uid: &Uid, guid: Option<Guid>) -> Result<(), StoreError> {
        let (Some(guid), Some(map)) = (guid, &self.guid_map) else {
            return Ok(());
        };
        match map.get_guid(uid, &self.identity)? {
            Some(existing) if existing != guid => Err(StoreError::IdentityConflict {
                uid: uid.clone(),
                existing,
                requested: guid,
            }),
            Some(_) => Ok(()),
            None => self.check_new_guid(Some(guid)),
        }
    }

    /// Reject an explicit GUID the map has never issued, before a state is
    /// created for it.
    pub(crate) fn check_new_guid(&self, guid: Option<Guid>) -> Result<(), StoreError> {
        match (guid, &self.guid_map) {
            (Some(guid), Some(map)) if !map.guid_exists(&guid)? => {
                Err(StoreError::UnknownGuid(guid))
            }
            _ => Ok(()),
        }
    }

    fn link_record(&self, uid: &Uid, guid: Guid) -> Result<(), StoreError> {
        let Some(map) = &self.guid_map else {
            return Ok(());
        };
        if let Some(existing) = map.get_guid(uid, &self.identity)? {
            if existing != guid {
                return Err(StoreError::IdentityConflict {
                    uid: uid.clone(),
                    existing,
                    requested: guid,
                });
            }
            return Ok(());
        }
        if !map.guid_exists(&guid)? {
            return Err(StoreError::UnknownGuid(guid));
        }
        map.link_uid(uid, &guid, &self.identity)
    }

    pub(crate) fn release_guid(&self, uid: &Uid) -> Result<(), StoreError> {
        match &self.guid_map {
            Some(map) => map.delete_uid(uid, &self.identity),
            None => Ok(()),
        }
    }

    /// Rebuild a typed state from its stored form. Relationship and backref
    /// fields become address-only references.
    pub(crate) fn assemble(&self, raw: RawState) -> Result<Arc<dyn State>, StoreError> {
        let mut parts = Parts::new();
        for (name, value) in raw.static_props {
            parts.insert(name, self.registry.static_value(value, false)?);
        }
        for (name, series) in raw.dynamic_props {
            parts.insert(name, FieldValue::Series(series));
        }
        for (name, targets) in raw.relationships {
            let refs = targets
                .into_iter()
                .map(|t| {
                    Ref::to_record(StoreRecord::new(self.identity.clone(), t.uid), t.model_name)
                })
                .collect();
            parts.insert(name, FieldValue::Refs(refs));
        }
        self.registry.construct(&raw.model_name, parts)
    }
}

/// Relationship descriptor pointing at already written targets.
pub(crate) fn with_targets(rel: &RelInspector, targets: Vec<Ref>) -> RelInspector {
    RelInspector {
        from_field: rel.from_field.clone(),
        to_field: rel.to_field.clone(),
        to_model: rel.to_model.clone(),
        to_refs: targets,
        kind: rel.kind,
    }
}

/// How an update treats the existing edge set of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeUpdate {
    /// Keep existing edges, add the new ones.
    Extend,
    /// Replace existing edges; former targets survive.
    Replace,
    /// Replace existing edges; former targets not re-linked are deleted.
    ///
    /// Only the same field's new targets count as re-linked: a target moved
    /// to another composition field in the same put is deleted.
    ReplaceDeleteOrphans,
}

impl EdgeUpdate {
    pub(crate) fn for_put(rel: &RelInspector) -> Self {
        match rel.kind {
            crate::model::RelKind::Composition => Self::ReplaceDeleteOrphans,
            _ => Self::Replace,
        }
    }

    pub(crate) fn for_patch(rel: &RelInspector) -> Self {
        match rel.kind {
            crate::model::RelKind::Association => Self::Replace,
            _ => Self::Extend,
        }
    }
}

// =============================================================================
// BLOCKING STORE
// =============================================================================

/// Store engine over a blocking [`Backend`].
#[derive(Debug)]
pub struct Store<B> {
    core: StoreCore,
    backend: B,
}

impl Store<StorageBackend> {
    /// Build a store and its backend from configuration.
    pub fn open(config: &StoreConfig, registry: Arc<Registry>) -> Result<Self, StoreError> {
        config.validate()?;
        let backend = config.backend.open()?;
        Ok(Self::from_config(config, backend, registry))
    }
}

impl<B: Backend> Store<B> {
    /// Store with a random identity, every method allowed and no GUID map.
    pub fn new(backend: B, registry: Arc<Registry>) -> Self {
        Self {
            core: StoreCore::new(registry),
            backend,
        }
    }

    /// Store described by `config` over an already opened backend.
    pub fn from_config(config: &StoreConfig, backend: B, registry: Arc<Registry>) -> Self {
        Self {
            core: StoreCore::from_config(config, registry),
            backend,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: StoreRef) -> Self {
        self.core.identity = identity;
        self
    }

    #[must_use]
    pub fn with_allowed_methods(mut self, methods: impl IntoIterator<Item = StoreMethod>) -> Self {
        self.core.allowed_methods = methods.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.core.max_depth = max_depth;
        self
    }

    pub fn set_guid_map(&mut self, guid_map: Arc<dyn GuidMap>) {
        self.core.guid_map = Some(guid_map);
    }

    pub fn disable_guid(&mut self) {
        self.core.guid_map = None;
    }

    #[must_use]
    pub fn identity(&self) -> &StoreRef {
        &self.core.identity
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Check that `uid` exists in this store as a state of `model_name`.
    pub fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError> {
        self.backend.uid_exists(uid, model_name)
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Resolve the reference's record (through its GUID when set) and check
    /// that it names an existing state of the declared model.
    fn validate_full(&self, reference: &mut Ref) -> Result<(Uid, String), StoreError> {
        self.core.fetch_record_by_guid(reference)?;
        let uid = self.core.local_uid(reference)?;
        let model = self.core.declared_model(reference)?;
        if !self.backend.uid_exists(&uid, &model)? {
            return Err(StoreError::NotFound { uid, model });
        }
        Ok((uid, model))
    }

    // -------------------------------------------------------------------------
    // Put
    // -------------------------------------------------------------------------

    /// Create or overwrite the referenced state.
    ///
    /// A reference without a state must already exist and is returned as is.
    pub fn put(&mut self, reference: Ref) -> Result<Ref, StoreError> {
        self.core.validate_method(StoreMethod::Put)?;
        self.put_at(reference, 0)
    }

    fn put_at(&mut self, mut reference: Ref, depth: usize) -> Result<Ref, StoreError> {
        self.core.check_depth(depth)?;
        let Some(state) = reference.state.clone() else {
            self.validate_full(&mut reference)?;
            return Ok(reference);
        };
        let inspector = self.core.inspect(&reference, state.as_ref())?;
        let model = inspector.model_name.clone();
        self.core.fetch_record_by_guid(&mut reference)?;

        if reference.record.is_none() {
            self.core.check_new_guid(reference.guid)?;
            let uid = self
                .backend
                .create_model(&model, &inspector.static_props, &inspector.dynamic_props)?;
            debug!(%uid, model = %model, "put: created");
            for rel in inspector.relationships() {
                self.update_relationships(&uid, &model, rel, EdgeUpdate::Extend, depth, false)?;
            }
            return self.core.generate_ref(uid, model, reference.guid);
        }

        let (uid, _) = self.validate_full(&mut reference)?;
        self.core.check_guid(&uid, reference.guid)?;
        debug!(%uid, model = %model, "put: overwrite");
        self.backend
            .overwrite_static_props(&uid, &model, &inspector.static_props)?;
        self.backend
            .overwrite_dynamic_props(&uid, &model, &inspector.dynamic_props)?;
        for rel in inspector.relationships() {
            self.update_relationships(&uid, &model, rel, EdgeUpdate::for_put(rel), depth, false)?;
        }
        self.core.generate_ref(uid, model, reference.guid)
    }

    // -------------------------------------------------------------------------
    // Patch
    // -------------------------------------------------------------------------

    /// Merge the embedded state into an existing one.
    ///
    /// Static attributes are replaced when any are given, time-versioned
    /// attributes are extended, composition and aggregation edges are added
    /// to, association edges are replaced.
    pub fn patch(&mut self, reference: Ref) -> Result<Ref, StoreError> {
        self.core.validate_method(StoreMethod::Patch)?;
        self.patch_at(reference, 0)
    }

    fn patch_at(&mut self, mut reference: Ref, depth: usize) -> Result<Ref, StoreError> {
        self.core.check_depth(depth)?;
        let (uid, _) = self.validate_full(&mut reference)?;
        let Some(state) = reference.state.clone() else {
            return Ok(reference);
        };
        let inspector = self.core.inspect(&reference, state.as_ref())?;
        let model = inspector.model_name.clone();
        self.core.check_guid(&uid, reference.guid)?;
        debug!(%uid, model = %model, "patch");

        if !inspector.static_props.is_empty() {
            self.backend
                .overwrite_static_props(&uid, &model, &inspector.static_props)?;
        }
        if !inspector.dynamic_props.is_empty() {
            self.backend
                .extend_dynamic_props(&uid, &model, &inspector.dynamic_props)?;
        }
        for rel in inspector.relationships() {
            self.update_relationships(&uid, &model, rel, EdgeUpdate::for_patch(rel), depth, true)?;
        }
        self.core.generate_ref(uid, model, reference.guid)
    }

    /// Patch a target that already lives in this store, create it otherwise.
    fn patch_target(&mut self, mut target: Ref, depth: usize) -> Result<Ref, StoreError> {
        self.core.fetch_record_by_guid(&mut target)?;
        if target.record.is_some() {
            self.patch_at(target, depth)
        } else {
            self.put_at(target, depth)
        }
    }

    // -------------------------------------------------------------------------
    // Relationships
    // -------------------------------------------------------------------------

    /// Write every target of `rel`, then update the stored edge set.
    fn update_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
        update: EdgeUpdate,
        depth: usize,
        patching: bool,
    ) -> Result<(), StoreError> {
        let mut targets = Vec::with_capacity(rel.to_refs.len());
        for target in &rel.to_refs {
            let written = if patching {
                self.patch_target(target.clone(), depth + 1)?
            } else {
                self.put_at(target.clone(), depth + 1)?
            };
            targets.push(written.strip());
        }

        if update != EdgeUpdate::Extend {
            let former = self
                .backend
                .delete_all_relationships(from_uid, from_model, &rel.from_field)?;
            if update == EdgeUpdate::ReplaceDeleteOrphans {
                let kept: BTreeSet<&Uid> = targets.iter().filter_map(Ref::uid).collect();
                let mut visited = BTreeSet::from([from_uid.clone()]);
                for orphan in former {
                    if kept.contains(&orphan.uid) {
                        continue;
                    }
                    self.delete_cascade(&orphan.uid, &orphan.model_name, &mut visited)?;
                }
            }
        }

        self.backend
            .create_relationships(from_uid, from_model, &with_targets(rel, targets))
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Delete the referenced state and, transitively, its composition targets.
    pub fn delete(&mut self, reference: &Ref) -> Result<(), StoreError> {
        self.core.validate_method(StoreMethod::Delete)?;
        let mut reference = reference.clone();
        let (uid, model) = self.validate_full(&mut reference)?;
        let mut visited = BTreeSet::new();
        self.delete_cascade(&uid, &model, &mut visited)
    }

    fn delete_cascade(
        &mut self,
        uid: &Uid,
        model_name: &str,
        visited: &mut BTreeSet<Uid>,
    ) -> Result<(), StoreError> {
        if !visited.insert(uid.clone()) {
            return Ok(());
        }
        if !self.backend.uid_exists(uid, model_name)? {
            warn!(%uid, model = model_name, "delete: state already gone");
            return Ok(());
        }
        let raw = self.backend.get_state_by_uid(uid, model_name)?;
        let model = raw.model_name.clone();
        let state = self.core.assemble(raw)?;
        let inspector = StateInspector::classify(state.as_ref(), &self.core.registry)?;
        debug!(%uid, model = %model, "delete");

        for rel in inspector.relationships() {
            let targets = self
                .backend
                .delete_all_relationships(uid, &model, &rel.from_field)?;
            if rel.kind == crate::model::RelKind::Composition {
                for target in targets {
                    self.delete_cascade(&target.uid, &target.model_name, visited)?;
                }
            }
        }

        self.core.release_guid(uid)?;
        self.backend.delete_model(uid, &model)
    }

    // -------------------------------------------------------------------------
    // Get / Query
    // -------------------------------------------------------------------------

    /// Load the referenced state.
    pub fn get(&self, reference: &Ref) -> Result<Ref, StoreError> {
        self.core.validate_method(StoreMethod::Get)?;
        let mut reference = reference.clone();
        let (uid, model) = self.validate_full(&mut reference)?;
        let raw = self.backend.get_state_by_uid(&uid, &model)?;
        debug!(%uid, model = %raw.model_name, "get");
        let model_name = raw.model_name.clone();
        let state = self.core.assemble(raw)?;
        let mut fetched = self.core.generate_ref(uid, model_name, None)?;
        fetched.state = Some(state);
        Ok(fetched)
    }

    /// Run a query scoped to one model. Without `include_states` the
    /// returned references are address-only.
    pub fn query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<Vec<Ref>, StoreError> {
        self.core.validate_method(StoreMethod::Query)?;
        if model_name != ANY_MODEL && !self.core.registry.contains(model_name) {
            return Err(StoreError::UnknownType(model_name.to_string()));
        }
        let found = self
            .backend
            .execute_query(query, model_name, include_states)?;
        debug!(model = model_name, hits = found.len(), "query");
        found
            .into_iter()
            .map(|(uid, raw)| match raw {
                Some(raw) => {
                    let model = raw.model_name.clone();
                    let state = self.core.assemble(raw)?;
                    let mut r = self.core.generate_ref(uid, model, None)?;
                    r.state = Some(state);
                    Ok(r)
                }
                None => self.core.generate_ref(uid, model_name.to_string(), None),
            })
            .collect()
    }
}

impl<B: Backend> StateSource for Store<B> {
    fn fetch(&self, reference: &Ref) -> Result<Ref, StoreError> {
        self.get(reference)
    }
}

// =============================================================================
// TESTS
// =============================================================================
