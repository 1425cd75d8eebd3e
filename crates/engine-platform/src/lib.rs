//! Persistence backends for breadcrumbs (last selected room per group).

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

/// Persisted mapping `group key -> last selected room id`.
pub type Breadcrumbs = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreadcrumbStoreError {
    #[error("breadcrumb store unavailable: {0}")]
    Unavailable(String),
    #[error("breadcrumb store is corrupt: {0}")]
    Corrupt(String),
    #[error("breadcrumb store backend failure: {0}")]
    Backend(String),
}

pub trait BreadcrumbStore: Send + Sync {
    /// Load all breadcrumbs; a store that was never written is empty.
    fn load(&self) -> Result<Breadcrumbs, BreadcrumbStoreError>;

    /// Replace all breadcrumbs.
    fn save(&self, breadcrumbs: &Breadcrumbs) -> Result<(), BreadcrumbStoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBreadcrumbStore {
    data: Arc<RwLock<Breadcrumbs>>,
}

impl BreadcrumbStore for InMemoryBreadcrumbStore {
    fn load(&self) -> Result<Breadcrumbs, BreadcrumbStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| BreadcrumbStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.clone())
    }

    fn save(&self, breadcrumbs: &Breadcrumbs) -> Result<(), BreadcrumbStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| BreadcrumbStoreError::Backend("poisoned lock".to_owned()))?;
        *data = breadcrumbs.clone();
        Ok(())
    }
}

/// JSON object on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileBreadcrumbStore {
    path: PathBuf,
}

impl JsonFileBreadcrumbStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BreadcrumbStore for JsonFileBreadcrumbStore {
    fn load(&self) -> Result<Breadcrumbs, BreadcrumbStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Breadcrumbs::new()),
            Err(err) => {
                return Err(BreadcrumbStoreError::Unavailable(format!(
                    "failed reading breadcrumbs {}: {err}",
                    self.path.display()
                )));
            }
        };

        serde_json::from_str(&raw).map_err(|err| {
            BreadcrumbStoreError::Corrupt(format!(
                "failed parsing breadcrumbs {}: {err}",
                self.path.display()
            ))
        })
    }

    fn save(&self, breadcrumbs: &Breadcrumbs) -> Result<(), BreadcrumbStoreError> {
        let path = &self.path;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                BreadcrumbStoreError::Unavailable(format!(
                    "failed creating breadcrumb directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let encoded = serde_json::to_vec_pretty(breadcrumbs)
            .map_err(|err| BreadcrumbStoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(path);
        fs::write(&temp_path, encoded).map_err(|err| {
            BreadcrumbStoreError::Unavailable(format!(
                "failed writing temp breadcrumbs {}: {err}",
                temp_path.display()
            ))
        })?;

        if let Err(rename_err) = fs::rename(&temp_path, path) {
            // Windows refuses to rename over an existing file.
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(BreadcrumbStoreError::Unavailable(format!(
                        "failed replacing breadcrumbs {} after rename error ({rename_err}): {err}",
                        path.display()
                    )));
                }
            }
            fs::rename(&temp_path, path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                BreadcrumbStoreError::Unavailable(format!(
                    "failed writing breadcrumbs {} after temp write: {err}",
                    path.display()
                ))
            })?;
        }

        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("breadcrumbs.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}
