//! # Storage Backends
//!
//! Concrete drivers for the [`Backend`] contract:
//! - `MemoryBackend`: ordered in-memory maps (fast, volatile)
//! - `RedbBackend`: disk-backed ACID storage using redb
//! - `SplitBackend`: a structure backend plus a separate time-series store
//!
//! [`StorageBackend`] picks between the first two at runtime, which is what
//! configuration opens.

pub mod memory;
pub mod redb_store;
pub mod split;

pub use memory::MemoryBackend;
pub use redb_store::RedbBackend;
pub use split::{MemorySeriesStore, SeriesStore, SplitBackend};

use crate::backend::{Backend, DynamicProps, EdgeTarget, RawState, StaticProps};
use crate::inspector::RelInspector;
use crate::primitives::{EDGE_MAGIC, FORMAT_VERSION};
use crate::query::Query;
use crate::{StoreError, Uid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// STORED FORMS
// =============================================================================

/// Attribute row of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub model_name: String,
    pub static_props: StaticProps,
    pub dynamic_props: DynamicProps,
}

/// One forward edge, with the backref field it is mirrored into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredEdge {
    pub target: EdgeTarget,
    pub inverse: Option<String>,
}

/// Header length: 4 magic bytes plus 1 version byte.
const HEADER_LEN: usize = 5;

/// Encode an edge-list value: header followed by postcard payload.
pub(crate) fn encode_edges<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let payload = postcard::to_allocvec(value).map_err(StoreError::serialization)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(EDGE_MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode an edge-list value, validating the header before the payload.
pub(crate) fn decode_edges<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.len() < HEADER_LEN {
        return Err(StoreError::serialization("edge header too short"));
    }
    if &bytes[0..4] != EDGE_MAGIC {
        return Err(StoreError::serialization("invalid edge magic bytes"));
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(StoreError::serialization(format!(
            "unsupported edge format version: {} (expected {FORMAT_VERSION})",
            bytes[4]
        )));
    }
    postcard::from_bytes(&bytes[HEADER_LEN..]).map_err(StoreError::serialization)
}

// =============================================================================
// RUNTIME SELECTION
// =============================================================================

/// Backend chosen at runtime.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory maps (fast, volatile).
    InMemory(MemoryBackend),
    /// Disk-backed storage using redb (ACID, persistent).
    Persistent(RedbBackend),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(MemoryBackend::new())
    }
}

impl StorageBackend {
    /// Open or create a redb database at `path`.
    pub fn with_redb(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::Persistent(RedbBackend::open(path)?))
    }

    /// True if data survives the process.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }
}

macro_rules! delegate {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            StorageBackend::InMemory($b) => $call,
            StorageBackend::Persistent($b) => $call,
        }
    };
}

impl Backend for StorageBackend {
    fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError> {
        delegate!(self, b => b.uid_exists(uid, model_name))
    }

    fn create_model(
        &mut self,
        model_name: &str,
        static_props: &StaticProps,
        dynamic_props: &DynamicProps,
    ) -> Result<Uid, StoreError> {
        delegate!(self, b => b.create_model(model_name, static_props, dynamic_props))
    }

    fn delete_model(&mut self, uid: &Uid, model_name: &str) -> Result<(), StoreError> {
        delegate!(self, b => b.delete_model(uid, model_name))
    }

    fn overwrite_static_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &StaticProps,
    ) -> Result<(), StoreError> {
        delegate!(self, b => b.overwrite_static_props(uid, model_name, props))
    }

    fn overwrite_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        delegate!(self, b => b.overwrite_dynamic_props(uid, model_name, props))
    }

    fn extend_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        delegate!(self, b => b.extend_dynamic_props(uid, model_name, props))
    }

    fn delete_all_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        field: &str,
    ) -> Result<Vec<EdgeTarget>, StoreError> {
        delegate!(self, b => b.delete_all_relationships(from_uid, from_model, field))
    }

    fn create_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
    ) -> Result<(), StoreError> {
        delegate!(self, b => b.create_relationships(from_uid, from_model, rel))
    }

    fn get_state_by_uid(&self, uid: &Uid, model_name: &str) -> Result<RawState, StoreError> {
        delegate!(self, b => b.get_state_by_uid(uid, model_name))
    }

    fn execute_query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<BTreeMap<Uid, Option<RawState>>, StoreError> {
        delegate!(self, b => b.execute_query(query, model_name, include_states))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_codec_round_trips_with_header() {
        let edges = vec![StoredEdge {
            target: EdgeTarget::new(Uid::new("5"), "Leaf"),
            inverse: Some("roots".to_string()),
        }];
        let bytes = encode_edges(&edges).expect("encode");
        assert_eq!(&bytes[0..4], EDGE_MAGIC);
        assert_eq!(bytes[4], FORMAT_VERSION);
        let back: Vec<StoredEdge> = decode_edges(&bytes).expect("decode");
        assert_eq!(back, edges);
    }

    #[test]
    fn edge_codec_rejects_bad_header() {
        assert!(decode_edges::<Vec<StoredEdge>>(b"XX").is_err());
        assert!(decode_edges::<Vec<StoredEdge>>(b"NOPE\x01").is_err());
        let mut bytes = encode_edges(&Vec::<StoredEdge>::new()).expect("encode");
        bytes[4] = FORMAT_VERSION.wrapping_add(1);
        assert!(decode_edges::<Vec<StoredEdge>>(&bytes).is_err());
    }

    #[test]
    fn default_backend_is_volatile() {
        assert!(!StorageBackend::default().is_persistent());
    }
}
