//! # Async Store Tests
//!
//! The async engine must agree with the blocking one on every relationship
//! rule; these run it over the blocking adapter for both bundled backends.

#![cfg(feature = "async")]

use std::sync::Arc;
use strata_core::{
    AsyncStore, BackendConfig, Blocking, Dynamic, Guid, MemoryBackend, MemoryGuidMap, Parts,
    Query, Ref, Registry, RegistryBuilder, Schema, StateType, StorageBackend, StoreConfig,
    StoreError, TimePoint,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Default)]
struct Vessel {
    name: Option<String>,
    level: Option<Dynamic<f64>>,
    contents: Option<Vec<Ref>>,
    supplier: Option<Vec<Ref>>,
    containers: Option<Vec<Ref>>,
}

impl Vessel {
    fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

impl StateType for Vessel {
    const MODEL_NAME: &'static str = "Vessel";

    fn schema() -> Schema {
        Schema::new()
            .static_field("name")
            .time_versioned("level")
            .composition("contents", "Vessel")
            .association("supplier", "Vessel")
            .backref("containers", "Vessel", "contents")
    }

    fn to_parts(&self) -> Result<Parts, StoreError> {
        Ok(Parts::new()
            .with_data("name", &self.name)?
            .with_series("level", &self.level)?
            .with_refs("contents", &self.contents)
            .with_refs("supplier", &self.supplier)
            .with_refs("containers", &self.containers))
    }

    fn from_parts(mut parts: Parts) -> Result<Self, StoreError> {
        Ok(Self {
            name: parts.take_data("name")?,
            level: parts.take_series("level")?,
            contents: parts.take_refs("contents")?,
            supplier: parts.take_refs("supplier")?,
            containers: parts.take_refs("containers")?,
        })
    }
}

fn registry() -> Arc<Registry> {
    Arc::new(
        RegistryBuilder::new()
            .declare::<Vessel>()
            .build()
            .expect("registry"),
    )
}

async fn fetch(store: &AsyncStore<Blocking<StorageBackend>>, r: &Ref) -> Vessel {
    store
        .get(r)
        .await
        .expect("get")
        .state_as::<Vessel>()
        .cloned()
        .expect("typed state")
}

/// Memory and redb stores opened from configuration.
fn stores(dir: &TempDir) -> Vec<AsyncStore<Blocking<StorageBackend>>> {
    let redb = StoreConfig {
        name: "async-redb".to_string(),
        backend: BackendConfig::Redb {
            path: dir.path().join("async.redb"),
        },
        ..StoreConfig::default()
    };
    vec![
        AsyncStore::open(&StoreConfig::default(), registry()).expect("memory"),
        AsyncStore::open(&redb, registry()).expect("redb"),
    ]
}

#[tokio::test]
async fn nested_composition_round_trips_and_cascades() {
    let dir = TempDir::new().expect("tempdir");
    for store in stores(&dir) {
        let inner = Vessel::named("inner");
        let outer = Vessel {
            contents: Some(vec![Ref::new(inner), Ref::new(Vessel::named("sibling"))]),
            ..Vessel::named("outer")
        };
        let r = store.put(Ref::new(outer)).await.expect("put");
        let contents = fetch(&store, &r).await.contents.expect("contents");
        assert_eq!(contents.len(), 2);

        let child = fetch(&store, &contents[0]).await;
        let containers = child.containers.expect("backref");
        assert_eq!(containers[0].uid(), r.uid());

        store.delete(&r).await.expect("delete");
        let left = store.query(&Query::GetAll, "Vessel", false).await.expect("query");
        assert!(left.is_empty());
    }
}

#[tokio::test]
async fn overwrite_and_patch_follow_blocking_rules() {
    let dir = TempDir::new().expect("tempdir");
    for store in stores(&dir) {
        let supplier = store.put(Ref::new(Vessel::named("supplier"))).await.expect("put");
        let tank = Vessel {
            level: Some(Dynamic::new(vec![TimePoint::new(0.0, 1.0)])),
            contents: Some(vec![Ref::new(Vessel::named("old"))]),
            supplier: Some(vec![supplier.strip()]),
            ..Vessel::named("tank")
        };
        let r = store.put(Ref::new(tank)).await.expect("put");
        let old = fetch(&store, &r).await.contents.expect("contents").remove(0);

        // Overwrite drops the composition orphan. The supplier field is absent
        // from the new value, so its edge is left alone.
        let replacement = Vessel {
            contents: Some(vec![Ref::new(Vessel::named("new"))]),
            ..Vessel::named("tank")
        };
        store.put(r.clone().with_state(replacement)).await.expect("overwrite");
        assert!(!store.uid_exists(old.uid().expect("uid"), "Vessel").await.expect("exists"));
        assert!(store.uid_exists(supplier.uid().expect("uid"), "Vessel").await.expect("exists"));
        let tank = fetch(&store, &r).await;
        assert!(tank.level.is_none());
        assert_eq!(tank.supplier.map(|s| s.len()), Some(1));

        // Patch appends series points and adds composition targets.
        for t in [1.0, 2.0] {
            let delta = Vessel {
                level: Some(Dynamic::new(vec![TimePoint::new(t, t * 10.0)])),
                contents: Some(vec![Ref::new(Vessel::named("added"))]),
                ..Vessel::default()
            };
            store.patch(r.clone().with_state(delta)).await.expect("patch");
        }
        let tank = fetch(&store, &r).await;
        assert_eq!(tank.level.expect("level").len(), 2);
        assert_eq!(tank.contents.expect("contents").len(), 3);
        assert_eq!(tank.name.as_deref(), Some("tank"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_from_many_tasks() {
    let store = Arc::new(AsyncStore::new(
        Blocking::new(MemoryBackend::new()),
        registry(),
    ));
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let vessel = Vessel {
                    contents: Some(vec![Ref::new(Vessel::named(&format!("child-{i}")))]),
                    ..Vessel::named(&format!("parent-{i}"))
                };
                store.put(Ref::new(vessel)).await
            })
        })
        .collect();

    let mut uids = Vec::new();
    for task in tasks {
        let r = task.await.expect("join").expect("put");
        uids.push(r.uid().cloned().expect("uid"));
    }
    uids.sort();
    uids.dedup();
    assert_eq!(uids.len(), 16);
    let all = store.query(&Query::GetAll, "Vessel", false).await.expect("query");
    assert_eq!(all.len(), 32);
}

#[tokio::test]
async fn errors_surface_unchanged() {
    let store = AsyncStore::new(Blocking::new(MemoryBackend::new()), registry()).with_max_depth(1);
    let deep = Vessel {
        contents: Some(vec![Ref::new(Vessel {
            contents: Some(vec![Ref::new(Vessel::named("too deep"))]),
            ..Vessel::default()
        })]),
        ..Vessel::default()
    };
    assert!(matches!(
        store.put(Ref::new(deep)).await,
        Err(StoreError::DepthExceeded(1))
    ));
    assert!(matches!(
        store.get(&Ref::default()).await,
        Err(StoreError::UnresolvedReference)
    ));
}

#[tokio::test]
async fn patch_does_not_relink_existing_targets() {
    let dir = TempDir::new().expect("tempdir");
    for store in stores(&dir) {
        let tank = Vessel {
            contents: Some(vec![Ref::new(Vessel::named("inner"))]),
            ..Vessel::named("tank")
        };
        let r = store.put(Ref::new(tank)).await.expect("put");
        let inner = fetch(&store, &r).await.contents.expect("contents").remove(0);

        for _ in 0..2 {
            let delta = Vessel {
                contents: Some(vec![inner.strip()]),
                ..Vessel::default()
            };
            store.patch(r.clone().with_state(delta)).await.expect("patch");
        }
        assert_eq!(fetch(&store, &r).await.contents.map(|c| c.len()), Some(1));
        let containers = fetch(&store, &inner).await.containers.expect("backref");
        assert_eq!(containers.len(), 1);
    }
}

#[tokio::test]
async fn unknown_guid_writes_nothing() {
    let mut store = AsyncStore::new(Blocking::new(MemoryBackend::new()), registry());
    store.set_guid_map(Arc::new(MemoryGuidMap::new()));
    let vessel = Vessel {
        contents: Some(vec![Ref::new(Vessel::named("inner"))]),
        ..Vessel::named("outer")
    };
    let result = store.put(Ref::new(vessel).with_guid(Guid::new_v4())).await;
    assert!(matches!(result, Err(StoreError::UnknownGuid(_))));
    let left = store.query(&Query::GetAll, "Vessel", false).await.expect("query");
    assert!(left.is_empty());
}
