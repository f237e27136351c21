//! # State Inspector
//!
//! Splits a state into the categories the engine persists separately:
//! static attributes, time-versioned attributes, and one relationship
//! descriptor per forward relationship field, grouped by kind.
//!
//! Classification is driven only by the bound schema of the state's model.
//! Null values and backref fields are skipped. Any part the schema does not
//! declare is rejected.

use crate::model::{FieldKind, FieldValue, RelKind, State, TimeSeries};
use crate::reference::Ref;
use crate::registry::Registry;
use crate::StoreError;
use serde_json::Value;
use std::collections::BTreeMap;

/// One relationship field of an inspected state.
#[derive(Debug, Clone, PartialEq)]
pub struct RelInspector {
    /// Forward field name on the source model.
    pub from_field: String,
    /// Backref field on the target model mirroring this one, if declared.
    pub to_field: Option<String>,
    /// Declared target model (may be `Any`).
    pub to_model: String,
    pub to_refs: Vec<Ref>,
    pub kind: RelKind,
}

impl RelInspector {
    /// Copy of this descriptor whose targets are address-only.
    #[must_use]
    pub fn stripped(&self) -> Self {
        Self {
            to_refs: self.to_refs.iter().map(Ref::strip).collect(),
            ..self.clone()
        }
    }
}

/// Classified view of a single state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateInspector {
    pub model_name: String,
    pub static_props: BTreeMap<String, Value>,
    pub dynamic_props: BTreeMap<String, TimeSeries>,
    pub associations: BTreeMap<String, RelInspector>,
    pub aggregations: BTreeMap<String, RelInspector>,
    pub compositions: BTreeMap<String, RelInspector>,
}

impl StateInspector {
    /// Classify every non-null declared field of `state`.
    pub fn classify(state: &dyn State, registry: &Registry) -> Result<Self, StoreError> {
        let model_name = state.model_name().ok_or(StoreError::MissingTypeTag)?;
        let schema = registry.schema(model_name)?;
        let mut parts = state.parts()?;

        let mut inspector = Self {
            model_name: model_name.to_string(),
            ..Self::default()
        };

        for field in schema.fields() {
            let Some(value) = parts.remove(&field.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            match (&field.kind, value) {
                (FieldKind::Backref { .. }, _) => {}
                (FieldKind::Static | FieldKind::Open, FieldValue::Data(v)) => {
                    inspector.static_props.insert(field.name.clone(), v);
                }
                (FieldKind::Static | FieldKind::Open, FieldValue::Nested(nested)) => {
                    let v = registry.decompose(nested.as_ref())?;
                    inspector.static_props.insert(field.name.clone(), v);
                }
                (FieldKind::TimeVersioned { tensor }, FieldValue::Series(series)) => {
                    if let Some(tensor) = tensor {
                        tensor.validate_series(&series)?;
                    }
                    inspector.dynamic_props.insert(field.name.clone(), series);
                }
                (
                    FieldKind::Relationship {
                        kind,
                        target,
                        inverse,
                    },
                    FieldValue::Refs(refs),
                ) => {
                    let rel = RelInspector {
                        from_field: field.name.clone(),
                        to_field: inverse.clone(),
                        to_model: target.clone(),
                        to_refs: refs,
                        kind: *kind,
                    };
                    inspector.category_mut(*kind).insert(field.name.clone(), rel);
                }
                (kind, _) => {
                    return Err(StoreError::schema(format!(
                        "{model_name}.{} holds a value that does not fit {kind:?}",
                        field.name
                    )));
                }
            }
        }

        if let Some((name, _)) = parts.iter().next() {
            return Err(StoreError::schema(format!(
                "'{model_name}' has no field '{name}'"
            )));
        }
        Ok(inspector)
    }

    /// Relationship descriptors of one kind.
    #[must_use]
    pub fn category(&self, kind: RelKind) -> &BTreeMap<String, RelInspector> {
        match kind {
            RelKind::Association => &self.associations,
            RelKind::Aggregation => &self.aggregations,
            RelKind::Composition => &self.compositions,
        }
    }

    fn category_mut(&mut self, kind: RelKind) -> &mut BTreeMap<String, RelInspector> {
        match kind {
            RelKind::Association => &mut self.associations,
            RelKind::Aggregation => &mut self.aggregations,
            RelKind::Composition => &mut self.compositions,
        }
    }

    /// Every relationship descriptor, associations first.
    pub fn relationships(&self) -> impl Iterator<Item = &RelInspector> {
        self.associations
            .values()
            .chain(self.aggregations.values())
            .chain(self.compositions.values())
    }
}

// =============================================================================
// TESTS
// =============================================================================
