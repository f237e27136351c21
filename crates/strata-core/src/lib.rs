//! # strata-core
//!
//! A backend-agnostic persistence engine for typed entity graphs.
//!
//! Entities ("states") are Rust structs with a declared field-kind schema.
//! Their relationships carry association, aggregation or composition
//! semantics and may be mirrored by backrefs on the target type. One engine
//! runs put/patch/get/delete/query over any driver that implements the
//! [`Backend`] primitives.
//!
//! ## Layout
//!
//! - `model`, `registry`: entity type system and polymorphic resolution
//! - `inspector`: splits a state into what backends persist
//! - `reference`, `guid`: addressing and cross-store identity
//! - `store`, `asynchronous`: the engine, blocking and async
//! - `backend`, `storage`: the driver contract and bundled drivers
//!
//! ## Constraints
//!
//! - Deterministic ordering: every map the engine produces is a `BTreeMap`
//! - Backends see only JSON attributes, time series and edge lists
//! - Composition owns its targets; nothing else deletes across an edge

// =============================================================================
// MODULES
// =============================================================================

#[cfg(feature = "async")]
pub mod asynchronous;
pub mod backend;
pub mod config;
pub mod guid;
pub mod inspector;
pub mod model;
pub mod primitives;
pub mod query;
pub mod reference;
pub mod registry;
pub mod storage;
pub mod store;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{Guid, StoreError, StoreMethod, StoreRecord, StoreRef, Uid};

// =============================================================================
// RE-EXPORTS: Model and Engine
// =============================================================================

pub use backend::{Backend, DynamicProps, EdgeTarget, RawState, StaticProps};
pub use config::{BackendConfig, StoreConfig};
pub use guid::{GuidMap, MemoryGuidMap};
pub use inspector::{RelInspector, StateInspector};
pub use model::{
    Dynamic, FieldKind, FieldValue, FlexibleState, IndexLevel, Parts, RelKind, Schema, State,
    StateType, Tensor, TensorSchema, TimePoint, TimeSeries,
};
pub use query::Query;
pub use reference::{Ref, StateSource};
pub use registry::{Registry, RegistryBuilder};
pub use store::Store;

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use storage::{MemoryBackend, MemorySeriesStore, RedbBackend, SeriesStore, SplitBackend, StorageBackend};

#[cfg(feature = "async")]
pub use asynchronous::{AsyncBackend, AsyncStore, Blocking};
