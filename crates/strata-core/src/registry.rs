//! # Type Registry and Polymorphic Resolution
//!
//! A closed map from model name to schema and factory, built in two phases:
//!
//! 1. [`RegistryBuilder::declare`] records each type's shell (name, schema,
//!    factory). Types may reference each other, or themselves, before they are
//!    declared.
//! 2. [`RegistryBuilder::build`] binds every relationship target and backref
//!    owner, fills each forward field's inverse name, and rejects anything
//!    that does not bind.
//!
//! Resolution turns a tagged JSON payload into a concrete state by lookup,
//! recursing into nested tagged objects. [`Registry::decompose`] is the
//! inverse.

use crate::model::{FieldKind, FieldValue, FlexibleState, Parts, Schema, State, StateType, TimeSeries};
use crate::primitives::{ANY_MODEL, MODEL_NAME_KEY};
use crate::reference::Ref;
use crate::{Guid, StoreError, StoreRecord};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tag written on serialized references.
const REF_TAG: &str = "Ref";

type Factory = fn(Parts) -> Result<Arc<dyn State>, StoreError>;

fn build_state<T: StateType>(parts: Parts) -> Result<Arc<dyn State>, StoreError> {
    Ok(Arc::new(T::from_parts(parts)?))
}

struct Entry {
    schema: Schema,
    factory: Factory,
}

// =============================================================================
// BUILDER
// =============================================================================

/// First registration phase: collect type shells.
#[derive(Default)]
pub struct RegistryBuilder {
    shells: Vec<(String, Entry)>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a concrete state type.
    #[must_use]
    pub fn declare<T: StateType>(mut self) -> Self {
        self.shells.push((
            T::MODEL_NAME.to_string(),
            Entry {
                schema: T::schema(),
                factory: build_state::<T>,
            },
        ));
        self
    }

    /// Second registration phase: bind relationship targets and backrefs.
    pub fn build(self) -> Result<Registry, StoreError> {
        let mut entries: BTreeMap<String, Entry> = BTreeMap::new();
        for (name, entry) in self.shells {
            if name == ANY_MODEL || name == REF_TAG {
                return Err(StoreError::schema(format!("model name '{name}' is reserved")));
            }
            if entries.contains_key(&name) {
                return Err(StoreError::schema(format!("model '{name}' declared twice")));
            }
            entries.insert(name, entry);
        }

        // Relationship targets must exist.
        for (name, entry) in &entries {
            for field in entry.schema.fields() {
                if let FieldKind::Relationship { target, .. } = &field.kind {
                    if target != ANY_MODEL && !entries.contains_key(target) {
                        return Err(StoreError::schema(format!(
                            "{name}.{} targets undeclared model '{target}'",
                            field.name
                        )));
                    }
                }
            }
        }

        // Backrefs: (owner, forward field) -> backref field name.
        let mut inverses: BTreeMap<(String, String), String> = BTreeMap::new();
        for (name, entry) in &entries {
            for field in entry.schema.fields() {
                let FieldKind::Backref { owner, mirrors } = &field.kind else {
                    continue;
                };
                let owner_entry = entries.get(owner).ok_or_else(|| {
                    StoreError::schema(format!(
                        "{name}.{} mirrors undeclared model '{owner}'",
                        field.name
                    ))
                })?;
                match owner_entry.schema.field(mirrors).map(|f| &f.kind) {
                    Some(FieldKind::Relationship { target, .. })
                        if target == name || target == ANY_MODEL => {}
                    _ => {
                        return Err(StoreError::schema(format!(
                            "{name}.{} mirrors {owner}.{mirrors}, which is not a relationship to {name}",
                            field.name
                        )));
                    }
                }
                let key = (owner.clone(), mirrors.clone());
                if inverses.insert(key, field.name.clone()).is_some() {
                    return Err(StoreError::schema(format!(
                        "{owner}.{mirrors} is mirrored more than once"
                    )));
                }
            }
        }

        for (name, entry) in &mut entries {
            for field in entry.schema.fields_mut() {
                if let FieldKind::Relationship { inverse, .. } = &mut field.kind {
                    *inverse = inverses.get(&(name.clone(), field.name.clone())).cloned();
                }
            }
        }

        Ok(Registry { entries })
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Bound, immutable set of state types.
pub struct Registry {
    entries: BTreeMap<String, Entry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Bound schema of a model.
    pub fn schema(&self, model_name: &str) -> Result<&Schema, StoreError> {
        self.entries
            .get(model_name)
            .map(|e| &e.schema)
            .ok_or_else(|| StoreError::UnknownType(model_name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, model_name: &str) -> bool {
        self.entries.contains_key(model_name)
    }

    /// Registered model names, in order.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Build a concrete state from parts.
    pub fn construct(&self, model_name: &str, parts: Parts) -> Result<Arc<dyn State>, StoreError> {
        let entry = self
            .entries
            .get(model_name)
            .ok_or_else(|| StoreError::UnknownType(model_name.to_string()))?;
        (entry.factory)(parts)
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Resolve a tagged payload into its concrete state.
    ///
    /// With `lenient` set, a missing or unknown tag yields a
    /// [`FlexibleState`] keeping every key, and undeclared keys are dropped
    /// instead of rejected.
    pub fn resolve(&self, payload: Value, lenient: bool) -> Result<Arc<dyn State>, StoreError> {
        let Value::Object(mut map) = payload else {
            return Err(StoreError::serialization("state payload must be an object"));
        };
        let tag = match map.remove(MODEL_NAME_KEY) {
            Some(Value::String(tag)) if !tag.is_empty() => Some(tag),
            _ => None,
        };

        let Some(tag) = tag else {
            if lenient {
                return Ok(Arc::new(self.flexible(None, map)?));
            }
            return Err(StoreError::MissingTypeTag);
        };
        let Some(entry) = self.entries.get(&tag) else {
            if lenient {
                return Ok(Arc::new(self.flexible(Some(tag), map)?));
            }
            return Err(StoreError::UnknownType(tag));
        };

        let mut parts = Parts::new();
        for (key, value) in map {
            let Some(field) = entry.schema.field(&key) else {
                if lenient {
                    continue;
                }
                return Err(StoreError::schema(format!("'{tag}' has no field '{key}'")));
            };
            if value.is_null() {
                continue;
            }
            let field_value = match &field.kind {
                FieldKind::Static | FieldKind::Open => self.static_value(value, lenient)?,
                FieldKind::TimeVersioned { tensor } => {
                    let series: TimeSeries = serde_json::from_value(value)?;
                    if let Some(tensor) = tensor {
                        tensor.validate_series(&series)?;
                    }
                    FieldValue::Series(series)
                }
                FieldKind::Relationship { .. } | FieldKind::Backref { .. } => {
                    FieldValue::Refs(self.refs_from_value(value, lenient)?)
                }
            };
            parts.insert(key, field_value);
        }
        (entry.factory)(parts)
    }

    fn flexible(&self, tag: Option<String>, map: Map<String, Value>) -> Result<FlexibleState, StoreError> {
        let mut values = Parts::new();
        for (key, value) in map {
            values.insert(key, self.static_value(value, true)?);
        }
        Ok(FlexibleState::new(tag, values))
    }

    pub(crate) fn static_value(&self, value: Value, lenient: bool) -> Result<FieldValue, StoreError> {
        let tagged = value
            .as_object()
            .is_some_and(|m| m.contains_key(MODEL_NAME_KEY));
        if tagged {
            Ok(FieldValue::Nested(self.resolve(value, lenient)?))
        } else {
            Ok(FieldValue::Data(value))
        }
    }

    fn refs_from_value(&self, value: Value, lenient: bool) -> Result<Vec<Ref>, StoreError> {
        let Value::Array(items) = value else {
            return Err(StoreError::serialization("relationship value must be a list"));
        };
        items
            .into_iter()
            .map(|item| self.ref_from_value(item, lenient))
            .collect()
    }

    /// Decompose a state into its tagged payload.
    pub fn decompose(&self, state: &dyn State) -> Result<Value, StoreError> {
        let mut map = Map::new();
        if let Some(tag) = state.model_name() {
            map.insert(MODEL_NAME_KEY.to_string(), Value::String(tag.to_string()));
        }
        for (name, value) in state.parts()? {
            let json = match value {
                FieldValue::Data(v) => v,
                FieldValue::Series(series) => serde_json::to_value(series)?,
                FieldValue::Nested(nested) => self.decompose(nested.as_ref())?,
                FieldValue::Refs(refs) => Value::Array(
                    refs.iter()
                        .map(|r| self.ref_to_value(r))
                        .collect::<Result<_, _>>()?,
                ),
            };
            map.insert(name, json);
        }
        Ok(Value::Object(map))
    }

    // -------------------------------------------------------------------------
    // Reference wire form
    // -------------------------------------------------------------------------

    /// Serialize a reference: tag, record and GUID always, state when embedded.
    pub fn ref_to_value(&self, reference: &Ref) -> Result<Value, StoreError> {
        let mut map = Map::new();
        map.insert(MODEL_NAME_KEY.to_string(), Value::String(REF_TAG.to_string()));
        map.insert("record".to_string(), serde_json::to_value(&reference.record)?);
        map.insert("guid".to_string(), serde_json::to_value(reference.guid)?);
        map.insert(
            "state_model_name".to_string(),
            serde_json::to_value(&reference.model_name)?,
        );
        let state = match &reference.state {
            Some(state) => self.decompose(state.as_ref())?,
            None => Value::Null,
        };
        map.insert("state".to_string(), state);
        Ok(Value::Object(map))
    }

    /// Parse a serialized reference, resolving any embedded state.
    pub fn ref_from_value(&self, value: Value, lenient: bool) -> Result<Ref, StoreError> {
        let Value::Object(mut map) = value else {
            return Err(StoreError::serialization("reference must be an object"));
        };
        match map.remove(MODEL_NAME_KEY) {
            Some(Value::String(tag)) if tag == REF_TAG => {}
            Some(other) => {
                return Err(StoreError::serialization(format!(
                    "expected a reference, found tag {other}"
                )));
            }
            None => return Err(StoreError::MissingTypeTag),
        }
        let record: Option<StoreRecord> =
            serde_json::from_value(map.remove("record").unwrap_or(Value::Null))?;
        let guid: Option<Guid> = serde_json::from_value(map.remove("guid").unwrap_or(Value::Null))?;
        let mut model_name: Option<String> =
            serde_json::from_value(map.remove("state_model_name").unwrap_or(Value::Null))?;
        let state = match map.remove("state") {
            None | Some(Value::Null) => None,
            Some(payload) => Some(self.resolve(payload, lenient)?),
        };
        if model_name.is_none() {
            model_name = state
                .as_ref()
                .and_then(|s| s.model_name())
                .map(str::to_string);
        }
        Ok(Ref {
            record,
            guid,
            model_name,
            state,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Shelf {
        label: Option<String>,
        books: Option<Vec<Ref>>,
    }

    impl StateType for Shelf {
        const MODEL_NAME: &'static str = "Shelf";

        fn schema() -> Schema {
            Schema::new()
                .static_field("label")
                .composition("books", "Book")
        }

        fn to_parts(&self) -> Result<Parts, StoreError> {
            Ok(Parts::new()
                .with_data("label", &self.label)?
                .with_refs("books", &self.books))
        }

        fn from_parts(mut parts: Parts) -> Result<Self, StoreError> {
            Ok(Self {
                label: parts.take_data("label")?,
                books: parts.take_refs("books")?,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Book {
        title: Option<String>,
        shelves: Option<Vec<Ref>>,
    }

    impl StateType for Book {
        const MODEL_NAME: &'static str = "Book";

        fn schema() -> Schema {
            Schema::new()
                .static_field("title")
                .backref("shelves", "Shelf", "books")
        }

        fn to_parts(&self) -> Result<Parts, StoreError> {
            Ok(Parts::new()
                .with_data("title", &self.title)?
                .with_refs("shelves", &self.shelves))
        }

        fn from_parts(mut parts: Parts) -> Result<Self, StoreError> {
            Ok(Self {
                title: parts.take_data("title")?,
                shelves: parts.take_refs("shelves")?,
            })
        }
    }

    fn registry() -> Registry {
        RegistryBuilder::new()
            .declare::<Book>()
            .declare::<Shelf>()
            .build()
            .expect("registry")
    }

    #[test]
    fn build_fills_inverse_regardless_of_order() {
        let registry = registry();
        let field = registry.schema("Shelf").unwrap().field("books").unwrap();
        match &field.kind {
            FieldKind::Relationship { inverse, .. } => {
                assert_eq!(inverse.as_deref(), Some("shelves"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn build_rejects_undeclared_target() {
        let result = RegistryBuilder::new().declare::<Shelf>().build();
        assert!(matches!(result, Err(StoreError::Schema(_))));
    }

    #[test]
    fn build_rejects_duplicates() {
        let result = RegistryBuilder::new()
            .declare::<Book>()
            .declare::<Shelf>()
            .declare::<Book>()
            .build();
        assert!(matches!(result, Err(StoreError::Schema(_))));
    }

    #[test]
    fn resolve_builds_concrete_type() {
        let registry = registry();
        let state = registry
            .resolve(json!({"model_name": "Book", "title": "Dune"}), false)
            .expect("resolve");
        let book = state.downcast_ref::<Book>().expect("book");
        assert_eq!(book.title.as_deref(), Some("Dune"));
    }

    #[test]
    fn resolve_missing_tag() {
        let registry = registry();
        let strict = registry.resolve(json!({"title": "x"}), false);
        assert!(matches!(strict, Err(StoreError::MissingTypeTag)));
        let lenient = registry.resolve(json!({"title": "x"}), true).expect("lenient");
        assert_eq!(lenient.model_name(), None);
        assert!(lenient.as_any().downcast_ref::<FlexibleState>().is_some());
    }

    #[test]
    fn resolve_unknown_tag() {
        let registry = registry();
        let strict = registry.resolve(json!({"model_name": "Lamp"}), false);
        assert!(matches!(strict, Err(StoreError::UnknownType(name)) if name == "Lamp"));
        let lenient = registry
            .resolve(json!({"model_name": "Lamp", "watts": 60}), true)
            .expect("lenient");
        assert_eq!(lenient.model_name(), Some("Lamp"));
        assert_eq!(lenient.parts().unwrap().len(), 1);
    }

    #[test]
    fn resolve_rejects_undeclared_field_unless_lenient() {
        let registry = registry();
        let payload = json!({"model_name": "Book", "isbn": "123"});
        assert!(matches!(
            registry.resolve(payload.clone(), false),
            Err(StoreError::Schema(_))
        ));
        assert!(registry.resolve(payload, true).is_ok());
    }

    #[test]
    fn decompose_then_resolve_keeps_nested_refs() {
        let registry = registry();
        let shelf = Shelf {
            label: Some("top".to_string()),
            books: Some(vec![Ref::new(Book {
                title: Some("Emma".to_string()),
                shelves: None,
            })]),
        };
        let payload = registry.decompose(&shelf).expect("decompose");
        assert_eq!(payload["model_name"], "Shelf");
        assert_eq!(payload["books"][0]["model_name"], "Ref");
        let back = registry.resolve(payload, false).expect("resolve");
        assert_eq!(back.downcast_ref::<Shelf>(), Some(&shelf));
    }

    #[test]
    fn ref_wire_form_without_state() {
        let registry = registry();
        let r = Ref::to_guid(Guid::new_v4(), "Book");
        let value = registry.ref_to_value(&r).expect("to value");
        assert_eq!(value["state"], Value::Null);
        assert_eq!(value["state_model_name"], "Book");
        let back = registry.ref_from_value(value, false).expect("from value");
        assert_eq!(back, r);
    }
}
