//! # Store Configuration
//!
//! TOML-loadable description of one store instance: identity, allowed
//! methods, recursion bound, GUID support and backend selection.
//!
//! ```toml
//! name = "lab"
//! allowed_methods = ["PUT", "GET"]
//!
//! [backend]
//! kind = "redb"
//! path = "lab.redb"
//! ```

use crate::primitives::{DEFAULT_STORE_NAME, MAX_RELATIONSHIP_DEPTH};
use crate::storage::{MemoryBackend, RedbBackend, StorageBackend};
use crate::{StoreError, StoreMethod, StoreRef};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    #[default]
    Memory,
    Redb {
        path: PathBuf,
    },
}

impl BackendConfig {
    /// Open the configured backend.
    pub fn open(&self) -> Result<StorageBackend, StoreError> {
        match self {
            Self::Memory => Ok(StorageBackend::InMemory(MemoryBackend::new())),
            Self::Redb { path } => Ok(StorageBackend::Persistent(RedbBackend::open(path)?)),
        }
    }
}

fn default_name() -> String {
    DEFAULT_STORE_NAME.to_string()
}

fn default_uid() -> Uuid {
    Uuid::new_v4()
}

fn default_methods() -> Vec<StoreMethod> {
    StoreMethod::ALL.to_vec()
}

fn default_max_depth() -> usize {
    MAX_RELATIONSHIP_DEPTH
}

/// Configuration of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Store identity; a random one is drawn when absent.
    #[serde(default = "default_uid")]
    pub uid: Uuid,
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<StoreMethod>,
    /// Bound on put/patch recursion through relationship targets.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Attach an in-process GUID map.
    #[serde(default)]
    pub guid: bool,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            uid: default_uid(),
            allowed_methods: default_methods(),
            max_depth: default_max_depth(),
            guid: false,
            backend: BackendConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, StoreError> {
        let config: Self = toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::Config("store name must not be empty".to_string()));
        }
        if self.max_depth == 0 {
            return Err(StoreError::Config("max_depth must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Store identity described by this configuration.
    #[must_use]
    pub fn identity(&self) -> StoreRef {
        StoreRef::new(self.uid, self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = StoreConfig::from_toml_str("").expect("parse");
        assert_eq!(config.name, DEFAULT_STORE_NAME);
        assert_eq!(config.allowed_methods, StoreMethod::ALL.to_vec());
        assert_eq!(config.max_depth, MAX_RELATIONSHIP_DEPTH);
        assert!(!config.guid);
        assert_eq!(config.backend, BackendConfig::Memory);
    }

    #[test]
    fn full_document_parses() {
        let text = r#"
            name = "lab"
            uid = "78be519a-fdec-4e4a-85a5-26364ccf52e4"
            allowed_methods = ["PUT", "GET"]
            max_depth = 8
            guid = true

            [backend]
            kind = "redb"
            path = "lab.redb"
        "#;
        let config = StoreConfig::from_toml_str(text).expect("parse");
        assert_eq!(config.identity().name, "lab");
        assert_eq!(
            config.uid.to_string(),
            "78be519a-fdec-4e4a-85a5-26364ccf52e4"
        );
        assert_eq!(config.allowed_methods, vec![StoreMethod::Put, StoreMethod::Get]);
        assert_eq!(config.max_depth, 8);
        assert!(config.guid);
        assert_eq!(
            config.backend,
            BackendConfig::Redb {
                path: PathBuf::from("lab.redb")
            }
        );
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(matches!(
            StoreConfig::from_toml_str("max_depth = 0"),
            Err(StoreError::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("allowed_methods = [\"FETCH\"]"),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn load_reads_file_and_opens_backend() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let db = dir.path().join("cfg.redb");
        let file = dir.path().join("store.toml");
        let text = format!(
            "name = \"disk\"\n[backend]\nkind = \"redb\"\npath = {:?}\n",
            db.display().to_string()
        );
        std::fs::write(&file, text).expect("write config");
        let config = StoreConfig::load(&file).expect("load");
        let backend = config.backend.open().expect("open");
        assert!(backend.is_persistent());
    }

    #[test]
    fn missing_file_is_config_error() {
        assert!(matches!(
            StoreConfig::load("/nonexistent/strata.toml"),
            Err(StoreError::Config(_))
        ));
    }
}
