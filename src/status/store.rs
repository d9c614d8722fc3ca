use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use super::SessionStatus;
use crate::storage;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("status store I/O for '{id}': {source}")]
    Io {
        id: String,
        #[source]
        source: io::Error,
    },
}

/// One JSON snapshot per session id, replaced atomically on every write.
///
/// Each id has exactly one writer (its classifier), so no cross-process
/// locking is needed; readers see either the previous or the new record.
#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn write(&self, id: &str, status: &SessionStatus) -> Result<(), StoreError> {
        storage::write_json_atomic(&self.path(id), status).map_err(|source| StoreError::Io {
            id: id.to_string(),
            source,
        })
    }

    /// `None` when there is no record. Unreadable records are logged and
    /// reported as missing, i.e. unknown.
    pub fn read(&self, id: &str) -> Option<SessionStatus> {
        match storage::read_json(&self.path(id)) {
            Ok(status) => status,
            Err(e) => {
                warn!(session = %id, error = %e, "Unreadable status record");
                None
            }
        }
    }

    pub fn read_all(&self) -> HashMap<String, SessionStatus> {
        let ids = match storage::record_ids(&self.dir) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list status records");
                return HashMap::new();
            }
        };
        ids.into_iter()
            .filter_map(|id| self.read(&id).map(|status| (id, status)))
            .collect()
    }

    /// Ids that have a record file, readable or not.
    pub fn ids(&self) -> Result<Vec<String>, StoreError> {
        storage::record_ids(&self.dir).map_err(|source| StoreError::Io {
            id: "*".to_string(),
            source,
        })
    }

    /// Returns whether a record was removed.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        storage::remove_if_exists(&self.path(id)).map_err(|source| StoreError::Io {
            id: id.to_string(),
            source,
        })
    }
}
