//! # redb-backed Storage
//!
//! A disk-backed [`Backend`] using the redb embedded database:
//! - ACID transactions, one write transaction per primitive
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! Records are stored as JSON, edge and backref lists as postcard behind a
//! magic/version header. The uid counter lives in the metadata table, so a
//! reopened database keeps issuing fresh uids.

use crate::backend::{
    Backend, DynamicProps, EdgeTarget, RawState, StaticProps, edge_targets, model_matches,
};
use crate::inspector::RelInspector;
use crate::query::Query;
use crate::storage::{StoredEdge, StoredRecord, decode_edges, encode_edges};
use crate::{StoreError, Uid};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::trace;

/// Table for records: uid -> JSON `StoredRecord`
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Table for forward edges: uid -> field -> edges
const EDGES: TableDefinition<&str, &[u8]> = TableDefinition::new("edges");

/// Table for backrefs: uid -> backref field -> sources
const BACKREFS: TableDefinition<&str, &[u8]> = TableDefinition::new("backrefs");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_ID_KEY: &str = "next_id";

type FieldEdges = BTreeMap<String, Vec<StoredEdge>>;
type FieldBackrefs = BTreeMap<String, Vec<EdgeTarget>>;
type BytesTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

// =============================================================================
// TABLE HELPERS
// =============================================================================

fn load_record(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    uid: &Uid,
) -> Result<Option<StoredRecord>, StoreError> {
    match table.get(uid.as_str()).map_err(StoreError::backend)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        None => Ok(None),
    }
}

fn load_matching(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    uid: &Uid,
    model_name: &str,
) -> Result<StoredRecord, StoreError> {
    load_record(table, uid)?
        .filter(|r| model_matches(model_name, &r.model_name))
        .ok_or_else(|| StoreError::NotFound {
            uid: uid.clone(),
            model: model_name.to_string(),
        })
}

fn store_record(table: &mut BytesTable<'_>, uid: &Uid, record: &StoredRecord) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(record)?;
    table
        .insert(uid.as_str(), bytes.as_slice())
        .map_err(StoreError::backend)?;
    Ok(())
}

fn load_list<T: DeserializeOwned + Default>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    uid: &Uid,
) -> Result<T, StoreError> {
    match table.get(uid.as_str()).map_err(StoreError::backend)? {
        Some(bytes) => decode_edges(bytes.value()),
        None => Ok(T::default()),
    }
}

fn store_list<T: Serialize>(table: &mut BytesTable<'_>, uid: &Uid, value: &T) -> Result<(), StoreError> {
    let bytes = encode_edges(value)?;
    table
        .insert(uid.as_str(), bytes.as_slice())
        .map_err(StoreError::backend)?;
    Ok(())
}

/// Remove the backref entry mirroring one edge from `source`.
fn unlink_backref(
    backrefs: &mut BytesTable<'_>,
    edge: &StoredEdge,
    source: &EdgeTarget,
) -> Result<(), StoreError> {
    let Some(field) = &edge.inverse else {
        return Ok(());
    };
    let mut lists: FieldBackrefs = load_list(backrefs, &edge.target.uid)?;
    if let Some(list) = lists.get_mut(field) {
        if let Some(pos) = list.iter().position(|e| e == source) {
            list.remove(pos);
            store_list(backrefs, &edge.target.uid, &lists)?;
        }
    }
    Ok(())
}

fn read_state(
    edges: &impl ReadableTable<&'static str, &'static [u8]>,
    backrefs: &impl ReadableTable<&'static str, &'static [u8]>,
    uid: &Uid,
    record: StoredRecord,
) -> Result<RawState, StoreError> {
    let mut relationships: BTreeMap<String, Vec<EdgeTarget>> = BTreeMap::new();
    let forward: FieldEdges = load_list(edges, uid)?;
    for (field, list) in forward {
        relationships.insert(field, list.into_iter().map(|e| e.target).collect());
    }
    let inverse: FieldBackrefs = load_list(backrefs, uid)?;
    relationships.extend(inverse);
    Ok(RawState {
        model_name: record.model_name,
        static_props: record.static_props,
        dynamic_props: record.dynamic_props,
        relationships,
    })
}

// =============================================================================
// BACKEND
// =============================================================================

/// A disk-backed backend using redb.
pub struct RedbBackend {
    db: Database,
    next_id: u64,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(StoreError::backend)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(StoreError::backend)?;
            let _ = write_txn.open_table(RECORDS).map_err(StoreError::backend)?;
            let _ = write_txn.open_table(EDGES).map_err(StoreError::backend)?;
            let _ = write_txn.open_table(BACKREFS).map_err(StoreError::backend)?;
            let _ = write_txn.open_table(METADATA).map_err(StoreError::backend)?;
            write_txn.commit().map_err(StoreError::backend)?;
        }

        let next_id = {
            let read_txn = db.begin_read().map_err(StoreError::backend)?;
            let table = read_txn.open_table(METADATA).map_err(StoreError::backend)?;
            table
                .get(NEXT_ID_KEY)
                .map_err(StoreError::backend)?
                .map(|v| v.value())
                .unwrap_or(0)
        };

        Ok(Self { db, next_id })
    }

    /// Number of stored states.
    pub fn len(&self) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_txn.open_table(RECORDS).map_err(StoreError::backend)?;
        table.len().map_err(StoreError::backend)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        self.db.compact().map_err(StoreError::backend)?;
        Ok(())
    }

    /// Read-modify-write of one record inside a single transaction.
    fn update_record(
        &mut self,
        uid: &Uid,
        model_name: &str,
        update: impl FnOnce(&mut StoredRecord),
    ) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut records = write_txn.open_table(RECORDS).map_err(StoreError::backend)?;
            let mut record = load_matching(&records, uid, model_name)?;
            update(&mut record);
            store_record(&mut records, uid, &record)?;
        }
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }
}

impl Backend for RedbBackend {
    fn uid_exists(&self, uid: &Uid, model_name: &str) -> Result<bool, StoreError> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let records = read_txn.open_table(RECORDS).map_err(StoreError::backend)?;
        Ok(load_record(&records, uid)?.is_some_and(|r| model_matches(model_name, &r.model_name)))
    }

    fn create_model(
        &mut self,
        model_name: &str,
        static_props: &StaticProps,
        dynamic_props: &DynamicProps,
    ) -> Result<Uid, StoreError> {
        let next_id = self.next_id.saturating_add(1);
        let uid = Uid::new(next_id.to_string());
        let record = StoredRecord {
            model_name: model_name.to_string(),
            static_props: static_props.clone(),
            dynamic_props: dynamic_props.clone(),
        };

        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut records = write_txn.open_table(RECORDS).map_err(StoreError::backend)?;
            store_record(&mut records, &uid, &record)?;
            let mut meta = write_txn.open_table(METADATA).map_err(StoreError::backend)?;
            meta.insert(NEXT_ID_KEY, next_id).map_err(StoreError::backend)?;
        }
        write_txn.commit().map_err(StoreError::backend)?;

        // Update in-memory state only after successful commit.
        self.next_id = next_id;
        trace!(%uid, model = model_name, "redb create");
        Ok(uid)
    }

    fn delete_model(&mut self, uid: &Uid, model_name: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut records = write_txn.open_table(RECORDS).map_err(StoreError::backend)?;
            let mut edges = write_txn.open_table(EDGES).map_err(StoreError::backend)?;
            let mut backrefs = write_txn.open_table(BACKREFS).map_err(StoreError::backend)?;

            let record = load_matching(&records, uid, model_name)?;
            let source = EdgeTarget::new(uid.clone(), record.model_name);

            // Own forward edges and the backrefs they mirror.
            let own: FieldEdges = load_list(&edges, uid)?;
            for edge in own.values().flatten() {
                unlink_backref(&mut backrefs, edge, &source)?;
            }
            edges.remove(uid.as_str()).map_err(StoreError::backend)?;

            // Incoming edges from every other state.
            let mut touched: Vec<(String, FieldEdges)> = Vec::new();
            for entry in edges.iter().map_err(StoreError::backend)? {
                let (key, value) = entry.map_err(StoreError::backend)?;
                let mut fields: FieldEdges = decode_edges(value.value())?;
                let mut changed = false;
                for list in fields.values_mut() {
                    let before = list.len();
                    list.retain(|e| &e.target.uid != uid);
                    changed |= list.len() != before;
                }
                if changed {
                    touched.push((key.value().to_string(), fields));
                }
            }
            for (key, fields) in touched {
                store_list(&mut edges, &Uid::new(key), &fields)?;
            }

            backrefs.remove(uid.as_str()).map_err(StoreError::backend)?;
            records.remove(uid.as_str()).map_err(StoreError::backend)?;
        }
        write_txn.commit().map_err(StoreError::backend)?;
        trace!(%uid, model = model_name, "redb delete");
        Ok(())
    }

    fn overwrite_static_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &StaticProps,
    ) -> Result<(), StoreError> {
        self.update_record(uid, model_name, |r| r.static_props = props.clone())
    }

    fn overwrite_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        self.update_record(uid, model_name, |r| r.dynamic_props = props.clone())
    }

    fn extend_dynamic_props(
        &mut self,
        uid: &Uid,
        model_name: &str,
        props: &DynamicProps,
    ) -> Result<(), StoreError> {
        self.update_record(uid, model_name, |r| {
            for (field, series) in props {
                r.dynamic_props
                    .entry(field.clone())
                    .or_default()
                    .extend(series.clone());
            }
        })
    }

    fn delete_all_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        field: &str,
    ) -> Result<Vec<EdgeTarget>, StoreError> {
        let removed = {
            let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
            let removed = {
                let records = write_txn.open_table(RECORDS).map_err(StoreError::backend)?;
                let mut edges = write_txn.open_table(EDGES).map_err(StoreError::backend)?;
                let mut backrefs = write_txn.open_table(BACKREFS).map_err(StoreError::backend)?;

                let record = load_matching(&records, from_uid, from_model)?;
                let source = EdgeTarget::new(from_uid.clone(), record.model_name);

                let mut fields: FieldEdges = load_list(&edges, from_uid)?;
                let removed = fields.remove(field).unwrap_or_default();
                for edge in &removed {
                    unlink_backref(&mut backrefs, edge, &source)?;
                }
                store_list(&mut edges, from_uid, &fields)?;
                removed
            };
            write_txn.commit().map_err(StoreError::backend)?;
            removed
        };
        Ok(removed.into_iter().map(|e| e.target).collect())
    }

    fn create_relationships(
        &mut self,
        from_uid: &Uid,
        from_model: &str,
        rel: &RelInspector,
    ) -> Result<(), StoreError> {
        let targets = edge_targets(rel)?;
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let records = write_txn.open_table(RECORDS).map_err(StoreError::backend)?;
            let mut edges = write_txn.open_table(EDGES).map_err(StoreError::backend)?;
            let mut backrefs = write_txn.open_table(BACKREFS).map_err(StoreError::backend)?;

            let record = load_matching(&records, from_uid, from_model)?;
            let source = EdgeTarget::new(from_uid.clone(), record.model_name);
            for target in &targets {
                load_matching(&records, &target.uid, &target.model_name)?;
            }

            let mut fields: FieldEdges = load_list(&edges, from_uid)?;
            let list = fields.entry(rel.from_field.clone()).or_default();
            for target in targets {
                // One edge per (field, target) pair.
                if list.iter().any(|edge| edge.target.uid == target.uid) {
                    continue;
                }
                if let Some(inverse) = &rel.to_field {
                    let mut lists: FieldBackrefs = load_list(&backrefs, &target.uid)?;
                    let sources = lists.entry(inverse.clone()).or_default();
                    if !sources.contains(&source) {
                        sources.push(source.clone());
                    }
                    store_list(&mut backrefs, &target.uid, &lists)?;
                }
                list.push(StoredEdge {
                    target,
                    inverse: rel.to_field.clone(),
                });
            }
            store_list(&mut edges, from_uid, &fields)?;
        }
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn get_state_by_uid(&self, uid: &Uid, model_name: &str) -> Result<RawState, StoreError> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let records = read_txn.open_table(RECORDS).map_err(StoreError::backend)?;
        let edges = read_txn.open_table(EDGES).map_err(StoreError::backend)?;
        let backrefs = read_txn.open_table(BACKREFS).map_err(StoreError::backend)?;
        let record = load_matching(&records, uid, model_name)?;
        read_state(&edges, &backrefs, uid, record)
    }

    fn execute_query(
        &self,
        query: &Query,
        model_name: &str,
        include_states: bool,
    ) -> Result<BTreeMap<Uid, Option<RawState>>, StoreError> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let records = read_txn.open_table(RECORDS).map_err(StoreError::backend)?;
        let edges = read_txn.open_table(EDGES).map_err(StoreError::backend)?;
        let backrefs = read_txn.open_table(BACKREFS).map_err(StoreError::backend)?;

        let mut found = BTreeMap::new();
        for entry in records.iter().map_err(StoreError::backend)? {
            let (key, value) = entry.map_err(StoreError::backend)?;
            let record: StoredRecord = serde_json::from_slice(value.value())?;
            if !model_matches(model_name, &record.model_name) || !query.matches(&record.static_props)
            {
                continue;
            }
            let uid = Uid::new(key.value());
            let state = if include_states {
                Some(read_state(&edges, &backrefs, &uid, record)?)
            } else {
                None
            };
            found.insert(uid, state);
        }
        Ok(found)
    }
}

// =============================================================================
// TESTS
// =============================================================================
