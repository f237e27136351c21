//! # Polymorphic Resolution Tests
//!
//! Tagged payloads in, concrete states out, and back again.

use serde_json::json;
use std::sync::Arc;
use strata_core::{
    FlexibleState, MemoryBackend, Parts, Ref, Registry, RegistryBuilder, Schema, State,
    StateType, Store, StoreError,
};

#[derive(Debug, Clone, PartialEq)]
struct Calibration {
    offset: f64,
    operator: Option<String>,
}

impl StateType for Calibration {
    const MODEL_NAME: &'static str = "Calibration";

    fn schema() -> Schema {
        Schema::new().static_field("offset").static_field("operator")
    }

    fn to_parts(&self) -> Result<Parts, StoreError> {
        Parts::new()
            .with_value("offset", &self.offset)?
            .with_data("operator", &self.operator)
    }

    fn from_parts(mut parts: Parts) -> Result<Self, StoreError> {
        Ok(Self {
            offset: parts.take_value("offset")?,
            operator: parts.take_data("operator")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Probe {
    label: String,
    calibration: Option<Calibration>,
    peers: Option<Vec<Ref>>,
}

impl StateType for Probe {
    const MODEL_NAME: &'static str = "Probe";

    fn schema() -> Schema {
        Schema::new()
            .static_field("label")
            .static_field("calibration")
            .association("peers", "Probe")
    }

    fn to_parts(&self) -> Result<Parts, StoreError> {
        Ok(Parts::new()
            .with_value("label", &self.label)?
            .with_nested("calibration", &self.calibration)
            .with_refs("peers", &self.peers))
    }

    fn from_parts(mut parts: Parts) -> Result<Self, StoreError> {
        Ok(Self {
            label: parts.take_value("label")?,
            calibration: parts.take_nested("calibration")?,
            peers: parts.take_refs("peers")?,
        })
    }
}

fn registry() -> Registry {
    RegistryBuilder::new()
        .declare::<Probe>()
        .declare::<Calibration>()
        .build()
        .expect("registry")
}

fn probe() -> Probe {
    Probe {
        label: "p1".to_string(),
        calibration: Some(Calibration {
            offset: 0.25,
            operator: Some("ana".to_string()),
        }),
        peers: None,
    }
}

#[test]
fn decompose_then_resolve_yields_original_type() {
    let registry = registry();
    let original = probe();
    let payload = registry.decompose(&original).expect("decompose");
    assert_eq!(payload["model_name"], json!("Probe"));
    assert_eq!(payload["calibration"]["model_name"], json!("Calibration"));

    let text = serde_json::to_string(&payload).expect("serialize");
    let reparsed: serde_json::Value = serde_json::from_str(&text).expect("parse");
    let state = registry.resolve(reparsed, false).expect("resolve");
    assert_eq!(state.model_name(), Some("Probe"));
    assert_eq!(state.downcast_ref::<Probe>(), Some(&original));
}

#[test]
fn strict_resolution_rejects_bad_tags_and_keys() {
    let registry = registry();
    assert!(matches!(
        registry.resolve(json!({"label": "x"}), false),
        Err(StoreError::MissingTypeTag)
    ));
    assert!(matches!(
        registry.resolve(json!({"model_name": "Widget", "label": "x"}), false),
        Err(StoreError::UnknownType(name)) if name == "Widget"
    ));
    assert!(matches!(
        registry.resolve(json!({"model_name": "Probe", "label": "x", "colour": "red"}), false),
        Err(StoreError::Schema(_))
    ));
}

#[test]
fn lenient_resolution_falls_back_to_flexible_state() {
    let registry = registry();
    let state = registry
        .resolve(json!({"model_name": "Widget", "size": 3}), true)
        .expect("lenient");
    assert_eq!(state.model_name(), Some("Widget"));
    let flexible = state
        .as_any()
        .downcast_ref::<FlexibleState>()
        .expect("flexible");
    assert_eq!(flexible.values.len(), 1);

    let dropped = registry
        .resolve(json!({"model_name": "Probe", "label": "x", "colour": "red"}), true)
        .expect("lenient");
    assert_eq!(
        dropped.downcast_ref::<Probe>().map(|p| p.label.as_str()),
        Some("x")
    );
}

#[test]
fn fallback_without_tag_cannot_be_written() {
    let registry = Arc::new(registry());
    let state = registry
        .resolve(json!({"size": 3}), true)
        .expect("lenient");
    let mut store = Store::new(MemoryBackend::new(), Arc::clone(&registry));
    assert!(matches!(
        store.put(Ref::from_state(state)),
        Err(StoreError::MissingTypeTag)
    ));
}

#[test]
fn serialized_reference_keeps_locator_and_resolves() {
    let registry = Arc::new(registry());
    let mut store = Store::new(MemoryBackend::new(), Arc::clone(&registry));
    let peer = store.put(Ref::new(probe())).expect("put peer");
    let with_peer = Probe {
        label: "p2".to_string(),
        calibration: None,
        peers: Some(vec![peer.clone()]),
    };
    let r = store.put(Ref::new(with_peer)).expect("put");
    let fetched = store.get(&r).expect("get");

    // Locator and tag survive serialization with or without the state.
    let wire = registry.ref_to_value(&fetched).expect("to value");
    assert_eq!(wire["model_name"], json!("Ref"));
    assert_eq!(wire["state_model_name"], json!("Probe"));
    let back = registry.ref_from_value(wire, false).expect("from value");
    assert_eq!(back, fetched);

    let lazy = registry
        .ref_from_value(registry.ref_to_value(&r.strip()).expect("to value"), false)
        .expect("from value");
    assert!(lazy.state.is_none());
    let reloaded = store.get(&lazy).expect("get via wire ref");
    let peers = reloaded.state_as::<Probe>().and_then(|p| p.peers.clone()).expect("peers");
    assert_eq!(peers[0].uid(), peer.uid());
}

#[test]
fn registry_rejects_unbound_declarations() {
    #[derive(Debug, Clone, PartialEq)]
    struct Orphan;

    impl StateType for Orphan {
        const MODEL_NAME: &'static str = "Orphan";

        fn schema() -> Schema {
            Schema::new().composition("parts", "Missing")
        }

        fn to_parts(&self) -> Result<Parts, StoreError> {
            Ok(Parts::new())
        }

        fn from_parts(_parts: Parts) -> Result<Self, StoreError> {
            Ok(Self)
        }
    }

    assert!(matches!(
        RegistryBuilder::new().declare::<Orphan>().build(),
        Err(StoreError::Schema(_))
    ));
    assert!(matches!(
        RegistryBuilder::new().declare::<Probe>().declare::<Probe>().build(),
        Err(StoreError::Schema(_))
    ));
}
