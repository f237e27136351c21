//! # Split Backend
//!
//! Structural data (static attributes, edges, backrefs) in one backend,
//! time-versioned data in a separate [`SeriesStore`]. The two substrates are
//! never written in one transaction.
//!
//! A failed series write while creating a state removes the structural row
//! again. Every other path accepts the gap: a failure between the two writes
//! leaves the state structurally complete but missing series data.

use crate::backend::{Backend, DynamicProps, EdgeTarget, RawState, StaticProps};
use crate::inspector::RelInspector;
use crate::query::Query;
use crate::{StoreError, Uid};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Time-series substrate keyed by structural uid.
pub trait SeriesStore {
    /// Replace every series of a state.
    fn write(&mut self, uid: &Uid, model_name: &str, props: &DynamicProps) -> Result<(), StoreError>;

    /// Append points to the given series of a state.
    fn extend(&mut self, uid: &Uid, model_name: &str, props: &DynamicProps) -> Result<(), StoreError>;

    /// Every series of a state; empty when none were written.
    fn read(&self, uid: &Uid, model_name: &str) -> Result<DynamicProps, StoreError>;

    /// Drop every series of a state.
    fn delete(&mut self, uid: &Uid, model_name: &str) -> Result<(), StoreError>;
}

/// In-memory series store.
#[derive(Debug, Default)]
pub struct MemorySeriesStore {
    series: BTreeMap<Uid, DynamicProps>,
}

impl MemorySeriesStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of states with series data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl SeriesStore for MemorySeriesStore {
    fn write(&mut self, uid: &Uid, _model_name: &str, props: &DynamicProps) -> Result<(), StoreError> {
        if props.is_empty() {
            self.series.remove(uid);
        } else {
            self.series.insert(uid.clone(), props.clone());
        }
        Ok(())
    }

    fn extend(&mut self, uid: &Uid, _model_name: &str, props: &DynamicProps) -> Result<(), StoreError> {
        let stored = self.series.entry(uid.clone()).or_default();
        for (field, series) in props {
            stored.entry(field.clone()).or_default().extend(series.clone());
        }
        Ok(())
    }

    fn read(&self, uid: &Uid, _model_name: &str) -> Result<DynamicProps, StoreError> {
        Ok(self.series.get(uid).cloned().unwrap_or_default())
    }

    fn delete(&mut self, uid: &Uid, _model_name: &str) -> Result<(), StoreError> {
        self.series.remove(uid);
        Ok(())
    }
}

/// Structure backend plus series store behind one [`Backend`].
#[derive(Debug, Default)]
pub struct SplitBackend<S, T> {
    structure: S,
    series: T,
}

impl<S: Backend, T: SeriesStore> SplitBackend<S, T> {
    pub fn new(structure: S, series: T) -> Self {
        Self { structure, series }
    }

    pub fn structure(&self) -> &S {
        &self.structure
    }

    pub fn series(&self) -> &T {
        &self.series
    }

    fn require(&self, uid: &Uid, model_name: &str) -> Result<(), StoreError> {
        if self.structure.uid_exists(uid, model_name)? {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                uid: uid.clone(),
                model: model_name.to_string(),
            })
        }
    }
}

impl<S: Backend, T: SeriesStore> Backend for SplitBackend<S, T> {
    fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError> {
        self.structure.uid_exists(uid, model_name)
    }

    fn create_model(
        &mut self,
        model_name: &str,
        static_props: &StaticProps,
        dynamic_props: &DynamicProps,
    ) -> Result<Uid, StoreError> {
        let uid = self
            .structure
            .create_model(model_name, static_props, &DynamicProps::new())?;
        if dynamic_props.is_empty() {
            return Ok(uid);
        }
        if let Err(e) = self.series.write(&uid, model_name, dynamic_props) {
            warn!(%uid, model = model_name, error = %e, "series write failed, removing structural row");
            if let Err(cleanup) = self.structure.delete_model(&uid, model_name) {
                warn!(%uid, model = model_name, error = %cleanup, "compensating delete failed");
            }
            return Err(e);
        }
        trace!(%uid, model = model_name, "split create");
        Ok(uid)
    }

    fn delete_model(&mut self, uid: &Uid, model_name: &str) -> Result<(), StoreError> {
        self.structure.delete_model(uid, model_name)?;
        self.series.delete(uid, model_name)
    }

    fn overwrite_static_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &StaticProps,
    ) -> Result<(), StoreError> {
        self.structure.overwrite_static_props(uid, model_name, props)
    }

    fn overwrite_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        self.require(uid, model_name)?;
        self.series.write(uid, model_name, props)
    }

    fn extend_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        self.require(uid, model_name)?;
        self.series.extend(uid, model_name, props)
    }

    fn delete_all_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        field: &str,
    ) -> Result<Vec<EdgeTarget>, StoreError> {
        self.structure.delete_all_relationships(from_uid, from_model, field)
    }

    fn create_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
    ) -> Result<(), StoreError> {
        self.structure.create_relationships(from_uid, from_model, rel)
    }

    fn get_state_by_uid(&self, uid: &Uid, model_name: &str) -> Result<RawState, StoreError> {
        let mut raw = self.structure.get_state_by_uid(uid, model_name)?;
        raw.dynamic_props = self.series.read(uid, &raw.model_name)?;
        Ok(raw)
    }

    fn execute_query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<BTreeMap<Uid, Option<RawState>>, StoreError> {
        let mut found = self
            .structure
            .execute_query(query, model_name, include_states)?;
        for (uid, state) in &mut found {
            if let Some(raw) = state {
                raw.dynamic_props = self.series.read(uid, &raw.model_name)?;
            }
        }
        Ok(found)
    }
}

// =============================================================================
// TESTS
// =============================================================================
