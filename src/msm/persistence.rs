use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything needed to rebuild an estimated model without the trajectories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub lag: usize,
    pub reversible: bool,
    pub n_states: usize, // Before restriction to the active set
    pub active_set: Vec<usize>,
    pub count_matrix: Vec<Vec<u64>>, // Full n_states x n_states counts
    pub transition_matrix: Vec<Vec<f64>>, // Over the active set
    pub stationary: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcca: Option<PccaRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PccaRecord {
    pub n_sets: usize,
    pub memberships: Vec<Vec<f64>>, // Active states x sets
}

/// Named models kept together in a single JSON file.
#[derive(Debug, Clone)]
pub struct ModelStore {
    path: PathBuf,
}

type Catalog = BTreeMap<String, ModelRecord>;

impl ModelStore {
    // The file is created on the first save
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, name: &str, record: &ModelRecord, overwrite: bool) -> Result<(), StoreError> {
        let mut catalog = self.read_catalog()?;
        if !overwrite && catalog.contains_key(name) {
            return Err(StoreError::ModelExists { name: name.to_string() });
        }
        catalog.insert(name.to_string(), record.clone());
        self.write_catalog(&catalog)?;
        log::info!("Saved model '{}' to {}", name, self.path.display());
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<ModelRecord, StoreError> {
        let mut catalog = self.read_catalog()?;
        catalog.remove(name).ok_or_else(|| StoreError::ModelNotFound { name: name.to_string() })
    }

    // Model names in lexicographic order
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.read_catalog()?.into_keys().collect())
    }

    pub fn remove(&self, name: &str) -> Result<ModelRecord, StoreError> {
        let mut catalog = self.read_catalog()?;
        let record = catalog.remove(name).ok_or_else(|| StoreError::ModelNotFound { name: name.to_string() })?;
        self.write_catalog(&catalog)?;
        log::info!("Removed model '{}' from {}", name, self.path.display());
        Ok(record)
    }

    fn read_catalog(&self) -> Result<Catalog, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Catalog::new()),
            Err(error) => Err(error.into()),
        }
    }

    // Write next to the target, then swap it in
    fn write_catalog(&self, catalog: &Catalog) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(catalog)?;
        let mut temp_name = self.path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        fs::write(&temp_path, text)?;
        if let Err(error) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(error.into());
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no model named '{name}' in the store")]
    ModelNotFound { name: String },
    #[error("a model named '{name}' already exists")]
    ModelExists { name: String },
    #[error("store I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
