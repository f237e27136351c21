//! # Async Mode
//!
//! The store engine over a backend whose primitives suspend on I/O.
//!
//! - [`AsyncBackend`]: the backend contract with `&self` receivers and
//!   `Send` futures
//! - [`Blocking`]: runs any blocking [`Backend`] on tokio's blocking pool
//! - [`AsyncStore`]: the same put/patch/get/delete/query algorithm as
//!   [`Store`](crate::store::Store)
//!
//! Relationship targets of one field are written concurrently, and so are
//! the fields of a newly created state. Overwrites, patches and deletes walk
//! fields one at a time, so orphan removal never races a relink.

use crate::backend::{Backend, DynamicProps, EdgeTarget, RawState, StaticProps};
use crate::config::StoreConfig;
use crate::guid::GuidMap;
use crate::inspector::{RelInspector, StateInspector};
use crate::model::{RelKind, State};
use crate::primitives::ANY_MODEL;
use crate::query::Query;
use crate::reference::Ref;
use crate::registry::Registry;
use crate::storage::StorageBackend;
use crate::store::{EdgeUpdate, StoreCore, with_targets};
use crate::{StoreError, StoreMethod, StoreRef, Uid};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, try_join_all};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

// =============================================================================
// BACKEND CONTRACT
// =============================================================================

/// Backend primitives that suspend on I/O.
///
/// Same semantics as [`Backend`]; every method takes `&self` so the engine
/// can issue independent writes concurrently.
#[async_trait]
pub trait AsyncBackend: Send + Sync {
    async fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError>;

    async fn create_model(
        &self,
        model_name: &str,
        static_props: &StaticProps,
        dynamic_props: &DynamicProps,
    ) -> Result<Uid, StoreError>;

    async fn delete_model(&self, uid: &Uid, model_name: &str) -> Result<(), StoreError>;

    async fn overwrite_static_props(
        &self,
        uid: &Uid,
        model_name: &str,
        props: &StaticProps,
    ) -> Result<(), StoreError>;

    async fn overwrite_dynamic_props(
        &self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError>;

    async fn extend_dynamic_props(
        &self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError>;

    async fn delete_all_relationships(
        &self,
        from_uid: &Uid,
        from_model: &str,
        field: &str,
    ) -> Result<Vec<EdgeTarget>, StoreError>;

    async fn create_relationships(
        &self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
    ) -> Result<(), StoreError>;

    async fn get_state_by_uid(&self, uid: &Uid, model_name: &str) -> Result<RawState, StoreError>;

    async fn execute_query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<BTreeMap<Uid, Option<RawState>>, StoreError>;
}

// =============================================================================
// BLOCKING ADAPTER
// =============================================================================

/// A blocking backend driven from tokio's blocking thread pool.
///
/// Calls are serialized by a mutex; a poisoned lock or a panicked task
/// surfaces as [`StoreError::Backend`].
#[derive(Debug)]
pub struct Blocking<B> {
    inner: Arc<Mutex<B>>,
}

impl<B> Clone for Blocking<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend + Send + 'static> Blocking<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(backend)),
        }
    }

    /// Run `f` against the wrapped backend on the blocking pool.
    pub async fn run<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut B) -> Result<R, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut backend = inner
                .lock()
                .map_err(|_| StoreError::backend("backend lock poisoned"))?;
            f(&mut backend)
        })
        .await
        .map_err(StoreError::backend)?
    }
}

#[async_trait]
impl<B: Backend + Send + 'static> AsyncBackend for Blocking<B> {
    async fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError> {
        let (uid, model) = (uid.clone(), model_name.to_string());
        self.run(move |b| b.uid_exists(&uid, &model)).await
    }

    async fn create_model(
        &self,
        model_name: &str,
        static_props: &StaticProps,
        dynamic_props: &DynamicProps,
    ) -> Result<Uid, StoreError> {
        let model = model_name.to_string();
        let (statics, dynamics) = (static_props.clone(), dynamic_props.clone());
        self.run(move |b| b.create_model(&model, &statics, &dynamics))
            .await
    }

    async fn delete_model(&self, uid: &Uid, model_name: &str) -> Result<(), StoreError> {
        let (uid, model) = (uid.clone(), model_name.to_string());
        self.run(move |b| b.delete_model(&uid, &model)).await
    }

    async fn overwrite_static_props(
        &self,
        uid: &Uid,
        model_name: &str,
        props: &StaticProps,
    ) -> Result<(), StoreError> {
        let (uid, model, props) = (uid.clone(), model_name.to_string(), props.clone());
        self.run(move |b| b.overwrite_static_props(&uid, &model, &props))
            .await
    }

    async fn overwrite_dynamic_props(
        &self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        let (uid, model, props) = (uid.clone(), model_name.to_string(), props.clone());
        self.run(move |b| b.overwrite_dynamic_props(&uid, &model, &props))
            .await
    }

    async fn extend_dynamic_props(
        &self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        let (uid, model, props) = (uid.clone(), model_name.to_string(), props.clone());
        self.run(move |b| b.extend_dynamic_props(&uid, &model, &props))
            .await
    }

    async fn delete_all_relationships(
        &self,
        from_uid: &Uid,
        from_model: &str,
        field: &str,
    ) -> Result<Vec<EdgeTarget>, StoreError> {
        let (uid, model, field) = (from_uid.clone(), from_model.to_string(), field.to_string());
        self.run(move |b| b.delete_all_relationships(&uid, &model, &field))
            .await
    }

    async fn create_relationships(
        &self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
    ) -> Result<(), StoreError> {
        let (uid, model, rel) = (from_uid.clone(), from_model.to_string(), rel.stripped());
        self.run(move |b| b.create_relationships(&uid, &model, &rel))
            .await
    }

    async fn get_state_by_uid(&self, uid: &Uid, model_name: &str) -> Result<RawState, StoreError> {
        let (uid, model) = (uid.clone(), model_name.to_string());
        self.run(move |b| b.get_state_by_uid(&uid, &model)).await
    }

    async fn execute_query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<BTreeMap<Uid, Option<RawState>>, StoreError> {
        let (query, model) = (query.clone(), model_name.to_string());
        self.run(move |b| b.execute_query(&query, &model, include_states))
            .await
    }
}

// =============================================================================
// ASYNC STORE
// =============================================================================

/// Store engine over an [`AsyncBackend`].
#[derive(Debug)]
pub struct AsyncStore<B> {
    core: StoreCore,
    backend: B,
}

impl AsyncStore<Blocking<StorageBackend>> {
    /// Build a store and its backend from configuration.
    pub fn open(config: &StoreConfig, registry: Arc<Registry>) -> Result<Self, StoreError> {
        config.validate()?;
        let backend = Blocking::new(config.backend.open()?);
        Ok(Self::from_config(config, backend, registry))
    }
}

impl<B: AsyncBackend> AsyncStore<B> {
    pub fn new(backend: B, registry: Arc<Registry>) -> Self {
        Self {
            core: StoreCore::new(registry),
            backend,
        }
    }

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

    pub async fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError> {
        self.backend.uid_exists(uid, model_name).await
    }

    async fn validate_full(&self, reference: &mut Ref) -> Result<(Uid, String), StoreError> {
        self.core.fetch_record_by_guid(reference)?;
        let uid = self.core.local_uid(reference)?;
        let model = self.core.declared_model(reference)?;
        if !self.backend.uid_exists(&uid, &model).await? {
            return Err(StoreError::NotFound { uid, model });
        }
        Ok((uid, model))
    }

    // -------------------------------------------------------------------------
    // Put / Patch
    // -------------------------------------------------------------------------

    /// Create or overwrite the referenced state.
    pub async fn put(&self, reference: Ref) -> Result<Ref, StoreError> {
        self.core.validate_method(StoreMethod::Put)?;
        self.put_at(reference, 0).await
    }

    fn put_at(&self, mut reference: Ref, depth: usize) -> BoxFuture<'_, Result<Ref, StoreError>> {
        Box::pin(async move {
            self.core.check_depth(depth)?;
            let Some(state) = reference.state.clone() else {
                self.validate_full(&mut reference).await?;
                return Ok(reference);
            };
            let inspector = self.core.inspect(&reference, state.as_ref())?;
            let model = inspector.model_name.clone();
            self.core.fetch_record_by_guid(&mut reference)?;

            if reference.record.is_none() {
                self.core.check_new_guid(reference.guid)?;
                let uid = self
                    .backend
                    .create_model(&model, &inspector.static_props, &inspector.dynamic_props)
                    .await?;
                debug!(%uid, model = %model, "put: created");
                try_join_all(inspector.relationships().map(|rel| {
                    self.update_relationships(&uid, &model, rel, EdgeUpdate::Extend, depth, false)
                }))
                .await?;
                return self.core.generate_ref(uid, model, reference.guid);
            }

            let (uid, _) = self.validate_full(&mut reference).await?;
            self.core.check_guid(&uid, reference.guid)?;
            debug!(%uid, model = %model, "put: overwrite");
            self.backend
                .overwrite_static_props(&uid, &model, &inspector.static_props)
                .await?;
            self.backend
                .overwrite_dynamic_props(&uid, &model, &inspector.dynamic_props)
                .await?;
            for rel in inspector.relationships() {
                self.update_relationships(&uid, &model, rel, EdgeUpdate::for_put(rel), depth, false)
                    .await?;
            }
            self.core.generate_ref(uid, model, reference.guid)
        })
    }

    /// Merge the embedded state into an existing one.
    pub async fn patch(&self, reference: Ref) -> Result<Ref, StoreError> {
        self.core.validate_method(StoreMethod::Patch)?;
        self.patch_at(reference, 0).await
    }

    fn patch_at(&self, mut reference: Ref, depth: usize) -> BoxFuture<'_, Result<Ref, StoreError>> {
        Box::pin(async move {
            self.core.check_depth(depth)?;
            let (uid, _) = self.validate_full(&mut reference).await?;
            let Some(state) = reference.state.clone() else {
                return Ok(reference);
            };
            let inspector = self.core.inspect(&reference, state.as_ref())?;
            let model = inspector.model_name.clone();
            self.core.check_guid(&uid, reference.guid)?;
            debug!(%uid, model = %model, "patch");

            if !inspector.static_props.is_empty() {
                self.backend
                    .overwrite_static_props(&uid, &model, &inspector.static_props)
                    .await?;
            }
            if !inspector.dynamic_props.is_empty() {
                self.backend
                    .extend_dynamic_props(&uid, &model, &inspector.dynamic_props)
                    .await?;
            }
            for rel in inspector.relationships() {
                self.update_relationships(&uid, &model, rel, EdgeUpdate::for_patch(rel), depth, true)
                    .await?;
            }
            self.core.generate_ref(uid, model, reference.guid)
        })
    }

    async fn write_target(&self, mut target: Ref, depth: usize, patching: bool) -> Result<Ref, StoreError> {
        if patching {
            self.core.fetch_record_by_guid(&mut target)?;
            if target.record.is_some() {
                return self.patch_at(target, depth).await;
            }
        }
        self.put_at(target, depth).await
    }

    async fn update_relationships(
        &self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
        update: EdgeUpdate,
        depth: usize,
        patching: bool,
    ) -> Result<(), StoreError> {
        let written = try_join_all(
            rel.to_refs
                .iter()
                .map(|target| self.write_target(target.clone(), depth + 1, patching)),
        )
        .await?;
        let targets: Vec<Ref> = written.iter().map(Ref::strip).collect();

        if update != EdgeUpdate::Extend {
            let former = self
                .backend
                .delete_all_relationships(from_uid, from_model, &rel.from_field)
                .await?;
            if update == EdgeUpdate::ReplaceDeleteOrphans {
                let kept: BTreeSet<&Uid> = targets.iter().filter_map(Ref::uid).collect();
                let mut visited = BTreeSet::from([from_uid.clone()]);
                for orphan in former {
                    if kept.contains(&orphan.uid) {
                        continue;
                    }
                    self.delete_cascade(orphan.uid, orphan.model_name, &mut visited)
                        .await?;
                }
            }
        }

        self.backend
            .create_relationships(from_uid, from_model, &with_targets(rel, targets))
            .await
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Delete the referenced state and, transitively, its composition targets.
    pub async fn delete(&self, reference: &Ref) -> Result<(), StoreError> {
        self.core.validate_method(StoreMethod::Delete)?;
        let mut reference = reference.clone();
        let (uid, model) = self.validate_full(&mut reference).await?;
        let mut visited = BTreeSet::new();
        self.delete_cascade(uid, model, &mut visited).await
    }

    fn delete_cascade<'a>(
        &'a self,
        uid: Uid,
        model_name: String,
        visited: &'a mut BTreeSet<Uid>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if !visited.insert(uid.clone()) {
                return Ok(());
            }
            if !self.backend.uid_exists(&uid, &model_name).await? {
                warn!(%uid, model = %model_name, "delete: state already gone");
                return Ok(());
            }
            let raw = self.backend.get_state_by_uid(&uid, &model_name).await?;
            let model = raw.model_name.clone();
            let state = self.core.assemble(raw)?;
            let inspector = StateInspector::classify(state.as_ref(), &self.core.registry)?;
            debug!(%uid, model = %model, "delete");

            for rel in inspector.relationships() {
                let targets = self
                    .backend
                    .delete_all_relationships(&uid, &model, &rel.from_field)
                    .await?;
                if rel.kind == RelKind::Composition {
                    for target in targets {
                        self.delete_cascade(target.uid, target.model_name, visited)
                            .await?;
                    }
                }
            }

            self.core.release_guid(&uid)?;
            self.backend.delete_model(&uid, &model).await
        })
    }

    // -------------------------------------------------------------------------
    // Get / Query
    // -------------------------------------------------------------------------

    /// Load the referenced state.
    pub async fn get(&self, reference: &Ref) -> Result<Ref, StoreError> {
        self.core.validate_method(StoreMethod::Get)?;
        let mut reference = reference.clone();
        let (uid, model) = self.validate_full(&mut reference).await?;
        let raw = self.backend.get_state_by_uid(&uid, &model).await?;
        debug!(%uid, model = %raw.model_name, "get");
        let model_name = raw.model_name.clone();
        let state = self.core.assemble(raw)?;
        let mut fetched = self.core.generate_ref(uid, model_name, None)?;
        fetched.state = Some(state);
        Ok(fetched)
    }

    /// Embedded state of `reference`, fetched through this store when absent.
    pub async fn get_state(&self, reference: &mut Ref, cache: bool) -> Result<Arc<dyn State>, StoreError> {
        if let Some(state) = &reference.state {
            return Ok(Arc::clone(state));
        }
        if reference.record.is_none() && reference.guid.is_none() {
            return Err(StoreError::UnresolvedReference);
        }
        let fetched = self.get(reference).await?;
        let state = fetched.state.ok_or(StoreError::UnresolvedReference)?;
        if cache {
            reference.state = Some(Arc::clone(&state));
        }
        Ok(state)
    }

    /// Run a query scoped to one model.
    pub async fn query(
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
            .execute_query(query, model_name, include_states)
            .await?;
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

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::model::{Parts, Schema, StateType};
    use crate::registry::RegistryBuilder;
    use crate::storage::MemoryBackend;

    #[derive(Debug, Clone, PartialEq)]
    struct Crate {
        label: Option<String>,
        items: Option<Vec<Ref>>,
    }

    impl StateType for Crate {
        const MODEL_NAME: &'static str = "Crate";

        fn schema() -> Schema {
            Schema::new().static_field("label").composition("items", "Crate")
        }

        fn to_parts(&self) -> Result<Parts, StoreError> {
            Ok(Parts::new()
                .with_data("label", &self.label)?
                .with_refs("items", &self.items))
        }

        fn from_parts(mut parts: Parts) -> Result<Self, StoreError> {
            Ok(Self {
                label: parts.take_data("label")?,
                items: parts.take_refs("items")?,
            })
        }
    }

    fn boxed(label: &str, items: Vec<Crate>) -> Crate {
        Crate {
            label: Some(label.to_string()),
            items: (!items.is_empty()).then(|| items.into_iter().map(Ref::new).collect()),
        }
    }

    fn store() -> AsyncStore<Blocking<MemoryBackend>> {
        let registry = RegistryBuilder::new()
            .declare::<Crate>()
            .build()
            .expect("registry");
        AsyncStore::new(Blocking::new(MemoryBackend::new()), Arc::new(registry))
    }

    #[tokio::test]
    async fn concurrent_children_are_all_linked() {
        let store = store();
        let children = (0..8).map(|i| boxed(&format!("c{i}"), vec![])).collect();
        let root = store.put(Ref::new(boxed("root", children))).await.expect("put");

        let fetched = store.get(&root).await.expect("get");
        let items = fetched.state_as::<Crate>().and_then(|c| c.items.clone()).expect("items");
        assert_eq!(items.len(), 8);
        let all = store.query(&Query::GetAll, "Crate", false).await.expect("query");
        assert_eq!(all.len(), 9);
    }

    #[tokio::test]
    async fn delete_cascades_through_blocking_adapter() {
        let store = store();
        let tree = boxed("a", vec![boxed("b", vec![boxed("c", vec![])])]);
        let root = store.put(Ref::new(tree)).await.expect("put");
        store.delete(&root).await.expect("delete");
        let all = store.query(&Query::GetAll, "Crate", false).await.expect("query");
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn get_state_fetches_and_caches() {
        let store = store();
        let mut r = store.put(Ref::new(boxed("x", vec![]))).await.expect("put");
        assert!(r.state.is_none());
        let state = store.get_state(&mut r, true).await.expect("state");
        assert_eq!(
            state.downcast_ref::<Crate>().and_then(|c| c.label.as_deref()),
            Some("x")
        );
        assert!(r.state.is_some());
    }

    #[tokio::test]
    async fn blocking_run_surfaces_backend_errors() {
        let backend = Blocking::new(MemoryBackend::new());
        let result = backend
            .run(|b| b.get_state_by_uid(&Uid::new("9"), "Crate"))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}
