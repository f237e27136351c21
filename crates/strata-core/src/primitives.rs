//! # Engine Primitives
//!
//! Fixed constants shared by the resolver, the engine and the backends.
//! They are part of the wire convention and must not change between releases
//! that share data.

/// Reserved payload key carrying a state's concrete type name.
pub const MODEL_NAME_KEY: &str = "model_name";

/// Model name of an intentionally untyped relationship target or reference.
///
/// A reference declared with this name resolves to whatever concrete type the
/// backend recorded for the uid.
pub const ANY_MODEL: &str = "Any";

/// Default bound on put/patch recursion through relationship targets.
///
/// A detached tree deeper than this is rejected with `DepthExceeded`
/// instead of recursing without limit.
pub const MAX_RELATIONSHIP_DEPTH: usize = 64;

/// Magic bytes prefixed to every edge list stored by the redb backend.
pub const EDGE_MAGIC: &[u8; 4] = b"STRE";

/// Current on-disk format version of the redb backend.
///
/// Increment this when making breaking changes to stored records or edges.
pub const FORMAT_VERSION: u8 = 1;

/// Default display name of a store built without configuration.
pub const DEFAULT_STORE_NAME: &str = "MemoryStore";
