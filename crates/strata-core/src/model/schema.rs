//! # Field-Kind Tables
//!
//! Every entity type declares a [`Schema`]: its fields in order, each tagged
//! with a [`FieldKind`]. The table is built once when the type is registered
//! and is the only thing the inspector consults to decide what a field is.
//!
//! Relationship targets and backref owners are plain model names. They are
//! bound (checked, and inverse names filled in) by
//! [`crate::registry::RegistryBuilder::build`], so types may name each other
//! in any declaration order, including themselves.

use crate::model::dynamic::TensorSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// UML-style relationship semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelKind {
    /// Shared reference. Never deletes targets.
    Association,
    /// Shared reference. Overwrite never deletes orphaned targets.
    Aggregation,
    /// Exclusive ownership. Orphans and cascades are deleted.
    Composition,
}

impl fmt::Display for RelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Association => "Association",
            Self::Aggregation => "Aggregation",
            Self::Composition => "Composition",
        };
        f.write_str(name)
    }
}

/// What a declared field holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Scalar, string, bool, nested structure or list of scalars.
    Static,
    /// A value the engine does not classify further (open unions).
    /// Stored like a static attribute.
    Open,
    /// Ordered `(timestamp, value)` points, optionally tensor-valued.
    TimeVersioned { tensor: Option<TensorSchema> },
    /// Ordered references to other states.
    Relationship {
        kind: RelKind,
        target: String,
        /// Backref field on `target` that mirrors this field, filled at bind time.
        inverse: Option<String>,
    },
    /// Read-only inverse of `owner.mirrors`. Never written directly.
    Backref { owner: String, mirrors: String },
}

impl FieldKind {
    /// True for the three forward relationship kinds.
    #[must_use]
    pub fn is_relationship(&self) -> bool {
        matches!(self, Self::Relationship { .. })
    }

    /// True for fields that carry references (forward or backref).
    #[must_use]
    pub fn carries_refs(&self) -> bool {
        matches!(self, Self::Relationship { .. } | Self::Backref { .. })
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
}

/// Ordered field-kind table of one entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDecl>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            kind,
        });
        self
    }

    #[must_use]
    pub fn static_field(self, name: &str) -> Self {
        self.with(name, FieldKind::Static)
    }

    #[must_use]
    pub fn open_field(self, name: &str) -> Self {
        self.with(name, FieldKind::Open)
    }

    #[must_use]
    pub fn time_versioned(self, name: &str) -> Self {
        self.with(name, FieldKind::TimeVersioned { tensor: None })
    }

    #[must_use]
    pub fn tensor_series(self, name: &str, tensor: TensorSchema) -> Self {
        self.with(
            name,
            FieldKind::TimeVersioned {
                tensor: Some(tensor),
            },
        )
    }

    #[must_use]
    pub fn relationship(self, name: &str, kind: RelKind, target: &str) -> Self {
        self.with(
            name,
            FieldKind::Relationship {
                kind,
                target: target.to_string(),
                inverse: None,
            },
        )
    }

    #[must_use]
    pub fn association(self, name: &str, target: &str) -> Self {
        self.relationship(name, RelKind::Association, target)
    }

    #[must_use]
    pub fn aggregation(self, name: &str, target: &str) -> Self {
        self.relationship(name, RelKind::Aggregation, target)
    }

    #[must_use]
    pub fn composition(self, name: &str, target: &str) -> Self {
        self.relationship(name, RelKind::Composition, target)
    }

    /// Declare `name` as the inverse of `owner.mirrors`.
    #[must_use]
    pub fn backref(self, name: &str, owner: &str, mirrors: &str) -> Self {
        self.with(
            name,
            FieldKind::Backref {
                owner: owner.to_string(),
                mirrors: mirrors.to_string(),
            },
        )
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDecl> {
        self.fields.iter()
    }

    pub(crate) fn fields_mut(&mut self) -> impl Iterator<Item = &mut FieldDecl> {
        self.fields.iter_mut()
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
