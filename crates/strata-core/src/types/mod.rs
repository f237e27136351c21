//! # Core Type Definitions
//!
//! Identifiers, store identity and the error taxonomy shared by every module:
//! - Store-local and cross-store identifiers (`Uid`, `Guid`)
//! - Store identity and record locators (`StoreRef`, `StoreRecord`)
//! - The operation vocabulary (`StoreMethod`)
//! - Error types (`StoreError`)
//!
//! All identifiers implement `Ord` so they can key `BTreeMap`/`BTreeSet`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Store-local identifier of a persisted state.
///
/// Only meaningful together with the store that issued it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub String);

impl Uid {
    /// Create a uid from anything string-like.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the uid as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-independent identifier reconciled through a [`crate::guid::GuidMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(pub Uuid);

impl Guid {
    /// Generate a fresh random GUID.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// STORE IDENTITY
// =============================================================================

/// Identity of a store instance.
///
/// The `uid` is what locators are checked against; `name` is informational.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreRef {
    pub uid: Uuid,
    pub name: String,
}

impl StoreRef {
    #[must_use]
    pub fn new(uid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uid,
            name: name.into(),
        }
    }
}

/// Locator of a state inside one store: (store identity, store-local id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreRecord {
    pub store: StoreRef,
    pub uid: Uid,
}

impl StoreRecord {
    #[must_use]
    pub fn new(store: StoreRef, uid: Uid) -> Self {
        Self { store, uid }
    }
}

// =============================================================================
// METHODS
// =============================================================================

/// Operations a store may declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StoreMethod {
    Put,
    Patch,
    Get,
    Delete,
    Query,
}

impl StoreMethod {
    /// Every method, in declaration order.
    pub const ALL: [StoreMethod; 5] = [
        StoreMethod::Put,
        StoreMethod::Patch,
        StoreMethod::Get,
        StoreMethod::Delete,
        StoreMethod::Query,
    ];
}

impl fmt::Display for StoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Get => "GET",
            Self::Delete => "DELETE",
            Self::Query => "QUERY",
        };
        f.write_str(name)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised by the engine, the registry and the backends.
///
/// - No silent failures: every fallible path returns `Result<T, StoreError>`
/// - Relationship recursion propagates the first error unchanged
/// - Nothing is retried inside the engine
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation is not in the store's allowed method set.
    #[error("{method} is not allowed for store '{store}'")]
    UnsupportedOperation { method: StoreMethod, store: String },

    /// The reference carries neither a state nor a usable locator.
    #[error("Reference has neither a state nor a store record")]
    UnresolvedReference,

    /// The reference's locator belongs to a different store.
    #[error("Reference store record is from store {found}, expected {expected}")]
    LocatorMismatch { expected: Uuid, found: Uuid },

    /// The uid does not exist for the declared model.
    #[error("State '{uid}' of model '{model}' not found")]
    NotFound { uid: Uid, model: String },

    /// The type tag is not known to the registry.
    #[error("Unknown model '{0}'")]
    UnknownType(String),

    /// A payload or reference carries no type tag.
    #[error("Model name is missing or empty")]
    MissingTypeTag,

    /// An explicit GUID conflicts with the one already linked to the uid.
    #[error("GUID mismatch for uid '{uid}': linked to {existing}, got {requested}")]
    IdentityConflict {
        uid: Uid,
        existing: Guid,
        requested: Guid,
    },

    /// An explicit GUID is absent from the GUID map.
    #[error("Could not find entity {0} in the GUID map")]
    UnknownGuid(Guid),

    /// The embedded state's model differs from the reference's declared model.
    #[error("Model mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    /// A value does not fit the declared field kind, or a schema failed to bind.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Relationship recursion went deeper than the configured bound.
    #[error("Relationship depth limit of {0} exceeded")]
    DepthExceeded(usize),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A backend primitive failed.
    #[error("Backend failure: {0}")]
    Backend(String),

    /// The configuration is invalid or could not be read.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Wrap any displayable backend error.
    pub fn backend(e: impl fmt::Display) -> Self {
        Self::Backend(e.to_string())
    }

    /// Wrap any displayable (de)serialization error.
    pub fn serialization(e: impl fmt::Display) -> Self {
        Self::Serialization(e.to_string())
    }

    /// Shorthand for a schema violation.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_serializes_upper_case() {
        let json = serde_json::to_string(&StoreMethod::Patch).expect("serialize");
        assert_eq!(json, "\"PATCH\"");
        let back: StoreMethod = serde_json::from_str("\"QUERY\"").expect("deserialize");
        assert_eq!(back, StoreMethod::Query);
    }

    #[test]
    fn method_display_matches_wire_name() {
        for method in StoreMethod::ALL {
            let json = serde_json::to_string(&method).expect("serialize");
            assert_eq!(json.trim_matches('"'), method.to_string());
        }
    }

    #[test]
    fn uid_is_transparent_string() {
        let uid = Uid::new("42");
        assert_eq!(serde_json::to_string(&uid).expect("serialize"), "\"42\"");
        assert_eq!(uid.to_string(), "42");
    }

    #[test]
    fn error_messages_name_the_operation() {
        let err = StoreError::UnsupportedOperation {
            method: StoreMethod::Delete,
            store: "lab".to_string(),
        };
        assert_eq!(err.to_string(), "DELETE is not allowed for store 'lab'");
    }
}
