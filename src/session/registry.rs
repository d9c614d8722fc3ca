use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

use super::Session;
use crate::storage;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("session '{0}' already exists")]
    DuplicateId(String),

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("registry I/O for '{id}': {source}")]
    Io {
        id: String,
        #[source]
        source: io::Error,
    },
}

/// Durable session metadata: one JSON record per id plus an in-memory index.
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    sessions: HashMap<String, Session>,
}

impl Registry {
    /// Open the registry rooted at `dir`, loading every readable record.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let mut registry = Self {
            dir: dir.into(),
            sessions: HashMap::new(),
        };
        registry.reload()?;
        Ok(registry)
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Rebuild the index from disk. Other processes may have added or
    /// removed records since we last looked.
    pub fn reload(&mut self) -> Result<(), RegistryError> {
        let ids = storage::record_ids(&self.dir).map_err(|source| RegistryError::Io {
            id: "*".to_string(),
            source,
        })?;

        let mut sessions = HashMap::with_capacity(ids.len());
        for id in ids {
            match storage::read_json::<Session>(&self.path(&id)) {
                Ok(Some(session)) if session.id == id => {
                    sessions.insert(id, session);
                }
                Ok(Some(session)) => {
                    warn!(file = %id, id = %session.id, "Session record id does not match file name, skipping");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session = %id, error = %e, "Skipping unreadable session record");
                }
            }
        }
        debug!(count = sessions.len(), "Loaded session registry");
        self.sessions = sessions;
        Ok(())
    }

    /// Persist a new record. Fails with `DuplicateId` if any process already
    /// created one under the same id.
    pub fn create(&mut self, session: Session) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&session.id) {
            return Err(RegistryError::DuplicateId(session.id));
        }
        match storage::create_json_exclusive(&self.path(&session.id), &session) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RegistryError::DuplicateId(session.id));
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    id: session.id.clone(),
                    source,
                })
            }
        }
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&Session, RegistryError> {
        self.sessions
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Apply `mutator` to a copy of the record and replace it atomically.
    /// The id and backend handle are identity and cannot be changed.
    pub fn update<F>(&mut self, id: &str, mutator: F) -> Result<&Session, RegistryError>
    where
        F: FnOnce(&mut Session),
    {
        let current = self.get(id)?;
        let mut updated = current.clone();
        mutator(&mut updated);
        updated.id = current.id.clone();
        updated.handle = current.handle.clone();

        storage::write_json_atomic(&self.path(id), &updated).map_err(|source| {
            RegistryError::Io {
                id: id.to_string(),
                source,
            }
        })?;
        self.sessions.insert(id.to_string(), updated);
        self.get(id)
    }

    pub fn delete(&mut self, id: &str) -> Result<Session, RegistryError> {
        if !self.sessions.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        storage::remove_if_exists(&self.path(id)).map_err(|source| RegistryError::Io {
            id: id.to_string(),
            source,
        })?;
        self.sessions
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}
