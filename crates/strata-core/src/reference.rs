//! # References
//!
//! A [`Ref`] addresses a state through any combination of:
//! - an embedded state value,
//! - a store record (store identity + store-local uid),
//! - a cross-store GUID.
//!
//! A ref used to create a state carries an embedded value and no record.
//! A ref used to update a state carries a record resolving to an existing
//! state of the declared model.

use crate::model::{State, StateType};
use crate::{Guid, StoreError, StoreRecord, Uid};
use std::sync::Arc;

/// Anything that can load a state for a locator-only reference.
pub trait StateSource {
    /// Fetch the referenced state, returning a ref with it embedded.
    fn fetch(&self, reference: &Ref) -> Result<Ref, StoreError>;
}

/// Handle to a state.
#[derive(Debug, Clone, Default)]
pub struct Ref {
    pub record: Option<StoreRecord>,
    pub guid: Option<Guid>,
    /// Declared model of the referenced state.
    pub model_name: Option<String>,
    pub state: Option<Arc<dyn State>>,
}

impl Ref {
    /// Detached reference to a new state.
    #[must_use]
    pub fn new<T: StateType>(state: T) -> Self {
        Self {
            record: None,
            guid: None,
            model_name: Some(T::MODEL_NAME.to_string()),
            state: Some(Arc::new(state)),
        }
    }

    /// Detached reference to an already type-erased state.
    #[must_use]
    pub fn from_state(state: Arc<dyn State>) -> Self {
        Self {
            record: None,
            guid: None,
            model_name: state.model_name().map(str::to_string),
            state: Some(state),
        }
    }

    /// Locator-only reference.
    #[must_use]
    pub fn to_record(record: StoreRecord, model_name: impl Into<String>) -> Self {
        Self {
            record: Some(record),
            guid: None,
            model_name: Some(model_name.into()),
            state: None,
        }
    }

    /// Reference known only by its GUID.
    #[must_use]
    pub fn to_guid(guid: Guid, model_name: impl Into<String>) -> Self {
        Self {
            record: None,
            guid: Some(guid),
            model_name: Some(model_name.into()),
            state: None,
        }
    }

    #[must_use]
    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = Some(guid);
        self
    }

    /// Replace the embedded state, keeping the address.
    #[must_use]
    pub fn with_state<T: StateType>(mut self, state: T) -> Self {
        self.state = Some(Arc::new(state));
        self
    }

    /// Store-local uid, if the reference has a record.
    #[must_use]
    pub fn uid(&self) -> Option<&Uid> {
        self.record.as_ref().map(|r| &r.uid)
    }

    /// Copy of this reference without the embedded state.
    #[must_use]
    pub fn strip(&self) -> Self {
        Self {
            record: self.record.clone(),
            guid: self.guid,
            model_name: self.model_name.clone(),
            state: None,
        }
    }

    /// Return the embedded state, fetching it from `source` when absent.
    ///
    /// With `cache` set, a fetched state is kept on this reference.
    pub fn get_state(
        &mut self,
        source: &impl StateSource,
        cache: bool,
    ) -> Result<Arc<dyn State>, StoreError> {
        if let Some(state) = &self.state {
            return Ok(Arc::clone(state));
        }
        if self.record.is_none() {
            return Err(StoreError::UnresolvedReference);
        }
        let fetched = source.fetch(self)?;
        let state = fetched.state.ok_or(StoreError::UnresolvedReference)?;
        if cache {
            self.state = Some(Arc::clone(&state));
        }
        Ok(state)
    }

    /// Embedded state as a concrete type.
    #[must_use]
    pub fn state_as<T: StateType>(&self) -> Option<&T> {
        self.state.as_deref().and_then(|s| s.downcast_ref::<T>())
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        let same_state = match (&self.state, &other.state) {
            (None, None) => true,
            (Some(a), Some(b)) => a.dyn_eq(b.as_ref()),
            _ => false,
        };
        same_state
            && self.record == other.record
            && self.guid == other.guid
            && self.model_name == other.model_name
    }
}

// =============================================================================
// TESTS
// =============================================================================
