//! # Entity Model
//!
//! Entities ("states") are ordinary Rust structs that implement [`StateType`]
//! explicitly: a model name, a field-kind [`Schema`], and a pair of methods
//! converting to and from [`Parts`], the decomposed form the engine works on.
//!
//! [`State`] is the object-safe view the engine and references hold. It is
//! implemented for every `StateType` and for [`FlexibleState`], the untyped
//! container produced by lenient resolution.

pub mod dynamic;
pub mod schema;

pub use dynamic::{Dynamic, IndexLevel, Tensor, TensorSchema, TimePoint, TimeSeries};
pub use schema::{FieldDecl, FieldKind, RelKind, Schema};

use crate::reference::Ref;
use crate::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// STATE TRAITS
// =============================================================================

/// A concrete entity type.
///
/// Implemented by hand per type; the schema is the static field-kind table
/// and `to_parts`/`from_parts` are the explicit decompose/assemble pair.
pub trait StateType: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Type tag written under `model_name`.
    const MODEL_NAME: &'static str;

    /// Field-kind table of this type.
    fn schema() -> Schema;

    /// Decompose into parts. `None` fields are left out.
    fn to_parts(&self) -> Result<Parts, StoreError>;

    /// Assemble from parts. Absent fields become `None`.
    fn from_parts(parts: Parts) -> Result<Self, StoreError>;
}

/// Object-safe view of any state.
pub trait State: fmt::Debug + Send + Sync + 'static {
    /// Type tag, or `None` for an untagged flexible container.
    fn model_name(&self) -> Option<&str>;

    fn parts(&self) -> Result<Parts, StoreError>;

    fn as_any(&self) -> &dyn Any;

    /// Structural equality across trait objects.
    fn dyn_eq(&self, other: &dyn State) -> bool;
}

impl<T: StateType> State for T {
    fn model_name(&self) -> Option<&str> {
        Some(T::MODEL_NAME)
    }

    fn parts(&self) -> Result<Parts, StoreError> {
        self.to_parts()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn State) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

impl dyn State {
    /// Downcast to a concrete state type.
    pub fn downcast_ref<T: StateType>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

// =============================================================================
// PARTS
// =============================================================================

/// A decomposed field value.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Static attribute data.
    Data(Value),
    /// Time-versioned points.
    Series(TimeSeries),
    /// A nested tagged state held as a static attribute.
    Nested(Arc<dyn State>),
    /// References of a relationship or backref field.
    Refs(Vec<Ref>),
}

impl FieldValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Data(Value::Null))
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Series(_) => "series",
            Self::Nested(_) => "nested state",
            Self::Refs(_) => "references",
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Data(a), Self::Data(b)) => a == b,
            (Self::Series(a), Self::Series(b)) => a == b,
            (Self::Nested(a), Self::Nested(b)) => a.dyn_eq(b.as_ref()),
            (Self::Refs(a), Self::Refs(b)) => a == b,
            _ => false,
        }
    }
}

fn unexpected(name: &str, expected: &str, found: &FieldValue) -> StoreError {
    StoreError::schema(format!(
        "field '{name}' expected {expected}, found {}",
        found.kind_name()
    ))
}

/// Field name → decomposed value, in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parts {
    values: BTreeMap<String, FieldValue>,
}

impl Parts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.values.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.values.remove(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.values.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    // -------------------------------------------------------------------------
    // Builders
    // -------------------------------------------------------------------------

    /// Add a required static attribute.
    pub fn with_value<V: Serialize>(mut self, name: &str, value: &V) -> Result<Self, StoreError> {
        self.insert(name, FieldValue::Data(serde_json::to_value(value)?));
        Ok(self)
    }

    /// Add an optional static attribute; `None` is left out.
    pub fn with_data<V: Serialize>(
        self,
        name: &str,
        value: &Option<V>,
    ) -> Result<Self, StoreError> {
        match value {
            Some(v) => self.with_value(name, v),
            None => Ok(self),
        }
    }

    /// Add an optional time-versioned attribute.
    pub fn with_series<V: Serialize>(
        mut self,
        name: &str,
        value: &Option<Dynamic<V>>,
    ) -> Result<Self, StoreError> {
        if let Some(series) = value {
            self.insert(name, FieldValue::Series(series.to_series()?));
        }
        Ok(self)
    }

    /// Add an optional nested tagged state.
    #[must_use]
    pub fn with_nested<S: StateType>(mut self, name: &str, value: &Option<S>) -> Self {
        if let Some(state) = value {
            self.insert(name, FieldValue::Nested(Arc::new(state.clone())));
        }
        self
    }

    /// Add an optional relationship or backref field.
    #[must_use]
    pub fn with_refs(mut self, name: &str, value: &Option<Vec<Ref>>) -> Self {
        if let Some(refs) = value {
            self.insert(name, FieldValue::Refs(refs.clone()));
        }
        self
    }

    // -------------------------------------------------------------------------
    // Extractors
    // -------------------------------------------------------------------------

    /// Take an optional static attribute.
    pub fn take_data<V: DeserializeOwned>(&mut self, name: &str) -> Result<Option<V>, StoreError> {
        match self.remove(name) {
            None | Some(FieldValue::Data(Value::Null)) => Ok(None),
            Some(FieldValue::Data(v)) => Ok(Some(serde_json::from_value(v)?)),
            Some(other) => Err(unexpected(name, "data", &other)),
        }
    }

    /// Take a required static attribute.
    pub fn take_value<V: DeserializeOwned>(&mut self, name: &str) -> Result<V, StoreError> {
        self.take_data(name)?
            .ok_or_else(|| StoreError::schema(format!("missing required field '{name}'")))
    }

    /// Take an optional time-versioned attribute.
    pub fn take_series<V: DeserializeOwned>(
        &mut self,
        name: &str,
    ) -> Result<Option<Dynamic<V>>, StoreError> {
        match self.remove(name) {
            None | Some(FieldValue::Data(Value::Null)) => Ok(None),
            Some(FieldValue::Series(series)) => Ok(Some(Dynamic::from_series(series)?)),
            Some(other) => Err(unexpected(name, "series", &other)),
        }
    }

    /// Take an optional nested state of a known type.
    pub fn take_nested<S: StateType>(&mut self, name: &str) -> Result<Option<S>, StoreError> {
        match self.remove(name) {
            None | Some(FieldValue::Data(Value::Null)) => Ok(None),
            Some(FieldValue::Nested(state)) => state
                .downcast_ref::<S>()
                .cloned()
                .map(Some)
                .ok_or_else(|| StoreError::TypeMismatch {
                    expected: S::MODEL_NAME.to_string(),
                    found: state.model_name().unwrap_or_default().to_string(),
                }),
            Some(other) => Err(unexpected(name, "nested state", &other)),
        }
    }

    /// Take an optional relationship or backref field.
    pub fn take_refs(&mut self, name: &str) -> Result<Option<Vec<Ref>>, StoreError> {
        match self.remove(name) {
            None | Some(FieldValue::Data(Value::Null)) => Ok(None),
            Some(FieldValue::Refs(refs)) => Ok(Some(refs)),
            Some(other) => Err(unexpected(name, "references", &other)),
        }
    }
}

impl IntoIterator for Parts {
    type Item = (String, FieldValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

// =============================================================================
// FLEXIBLE STATE
// =============================================================================

/// Fallback container for payloads whose type could not be resolved.
///
/// Keeps every key it was given. It can be converted into a concrete type
/// with [`FlexibleState::assemble`], but it cannot be written to a store
/// unless its tag names a registered type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlexibleState {
    pub model_name: Option<String>,
    pub values: Parts,
}

impl FlexibleState {
    #[must_use]
    pub fn new(model_name: Option<String>, values: Parts) -> Self {
        Self { model_name, values }
    }

    /// Reinterpret the kept values as a concrete type.
    pub fn assemble<T: StateType>(self) -> Result<T, StoreError> {
        T::from_parts(self.values)
    }
}

impl State for FlexibleState {
    fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    fn parts(&self) -> Result<Parts, StoreError> {
        Ok(self.values.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn State) -> bool {
        other.as_any().downcast_ref::<Self>() == Some(self)
    }
}

// =============================================================================
// TESTS
// =============================================================================
