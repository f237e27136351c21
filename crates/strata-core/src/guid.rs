//! # GUID Map
//!
//! Reconciles store-local uids with store-independent GUIDs. A GUID may be
//! linked to one uid in each of many stores; each `(store, uid)` pair has at
//! most one GUID.
//!
//! The engine consumes the [`GuidMap`] trait only. [`MemoryGuidMap`] keeps
//! the mapping in process and can be shared between stores.

use crate::{Guid, StoreError, StoreRef, Uid};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

/// Identity map contract.
pub trait GuidMap: Send + Sync {
    /// GUID linked to `uid` in `store`, if any.
    fn get_guid(&self, uid: &Uid, store: &StoreRef) -> Result<Option<Guid>, StoreError>;

    /// Issue a new GUID and link it to `uid` in `store`.
    fn create_guid(&self, uid: &Uid, store: &StoreRef) -> Result<Guid, StoreError>;

    /// Uid linked to `guid` in `store`, if any.
    fn get_uid(&self, guid: &Guid, store: &StoreRef) -> Result<Option<Uid>, StoreError>;

    /// True if `guid` was ever issued.
    fn guid_exists(&self, guid: &Guid) -> Result<bool, StoreError>;

    /// Link an existing GUID to `uid` in `store`.
    fn link_uid(&self, uid: &Uid, guid: &Guid, store: &StoreRef) -> Result<(), StoreError>;

    /// Release the link of `uid` in `store`. The GUID itself stays issued.
    fn delete_uid(&self, uid: &Uid, store: &StoreRef) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct GuidTables {
    by_record: BTreeMap<(Uuid, Uid), Guid>,
    by_guid: BTreeMap<Guid, BTreeMap<Uuid, Uid>>,
}

/// In-process GUID map.
#[derive(Debug, Default)]
pub struct MemoryGuidMap {
    tables: Mutex<GuidTables>,
}

impl MemoryGuidMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<R>(&self, f: impl FnOnce(&mut GuidTables) -> R) -> Result<R, StoreError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| StoreError::backend(format!("guid map lock poisoned: {e}")))?;
        Ok(f(&mut tables))
    }
}

impl GuidTables {
    fn link(&mut self, uid: &Uid, guid: Guid, store: &StoreRef) {
        if let Some(previous) = self.by_record.insert((store.uid, uid.clone()), guid) {
            if let Some(stores) = self.by_guid.get_mut(&previous) {
                stores.remove(&store.uid);
            }
        }
        self.by_guid
            .entry(guid)
            .or_default()
            .insert(store.uid, uid.clone());
    }
}

impl GuidMap for MemoryGuidMap {
    fn get_guid(&self, uid: &Uid, store: &StoreRef) -> Result<Option<Guid>, StoreError> {
        self.with_tables(|t| t.by_record.get(&(store.uid, uid.clone())).copied())
    }

    fn create_guid(&self, uid: &Uid, store: &StoreRef) -> Result<Guid, StoreError> {
        let guid = Guid::new_v4();
        trace!(%uid, %guid, store = %store.name, "create guid");
        self.with_tables(|t| t.link(uid, guid, store))?;
        Ok(guid)
    }

    fn get_uid(&self, guid: &Guid, store: &StoreRef) -> Result<Option<Uid>, StoreError> {
        self.with_tables(|t| {
            t.by_guid
                .get(guid)
                .and_then(|stores| stores.get(&store.uid))
                .cloned()
        })
    }

    fn guid_exists(&self, guid: &Guid) -> Result<bool, StoreError> {
        self.with_tables(|t| t.by_guid.contains_key(guid))
    }

    fn link_uid(&self, uid: &Uid, guid: &Guid, store: &StoreRef) -> Result<(), StoreError> {
        trace!(%uid, %guid, store = %store.name, "link guid");
        self.with_tables(|t| t.link(uid, *guid, store))
    }

    fn delete_uid(&self, uid: &Uid, store: &StoreRef) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if let Some(guid) = t.by_record.remove(&(store.uid, uid.clone())) {
                if let Some(stores) = t.by_guid.get_mut(&guid) {
                    stores.remove(&store.uid);
                }
            }
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str) -> StoreRef {
        StoreRef::new(Uuid::new_v4(), name)
    }

    #[test]
    fn create_then_lookup_both_ways() {
        let map = MemoryGuidMap::new();
        let lab = store("lab");
        let uid = Uid::new("7");
        let guid = map.create_guid(&uid, &lab).expect("create");
        assert_eq!(map.get_guid(&uid, &lab).expect("get guid"), Some(guid));
        assert_eq!(map.get_uid(&guid, &lab).expect("get uid"), Some(uid));
        assert!(map.guid_exists(&guid).expect("exists"));
    }

    #[test]
    fn one_guid_links_many_stores() {
        let map = MemoryGuidMap::new();
        let (a, b) = (store("a"), store("b"));
        let guid = map.create_guid(&Uid::new("1"), &a).expect("create");
        map.link_uid(&Uid::new("99"), &guid, &b).expect("link");
        assert_eq!(map.get_uid(&guid, &a).expect("a"), Some(Uid::new("1")));
        assert_eq!(map.get_uid(&guid, &b).expect("b"), Some(Uid::new("99")));
    }

    #[test]
    fn delete_releases_link_but_keeps_guid() {
        let map = MemoryGuidMap::new();
        let lab = store("lab");
        let uid = Uid::new("3");
        let guid = map.create_guid(&uid, &lab).expect("create");
        map.delete_uid(&uid, &lab).expect("delete");
        assert_eq!(map.get_guid(&uid, &lab).expect("get guid"), None);
        assert_eq!(map.get_uid(&guid, &lab).expect("get uid"), None);
        assert!(map.guid_exists(&guid).expect("exists"));
    }

    #[test]
    fn unknown_guid_does_not_exist() {
        let map = MemoryGuidMap::new();
        assert!(!map.guid_exists(&Guid::new_v4()).expect("exists"));
    }
}
