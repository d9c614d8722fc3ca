mod manager;
mod registry;

pub use manager::{NewSession, Orchestra, OrchestraError, SessionView};
pub use registry::{Registry, RegistryError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A supervised agent session and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub working_dir: PathBuf,
    /// Free-text task label
    pub label: String,
    /// Source-control branch, advisory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Backend session name, `<prefix>-<id>`
    pub handle: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: &str, prefix: &str, working_dir: PathBuf, label: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            working_dir,
            label: label.into(),
            branch: None,
            handle: handle_for(prefix, id),
            created_at: Utc::now(),
        }
    }

    /// Last component of the working directory.
    pub fn project_name(&self) -> String {
        self.working_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Backend session name for `id`.
pub fn handle_for(prefix: &str, id: &str) -> String {
    format!("{}-{}", prefix, id)
}

/// Inverse of [`handle_for`]; `None` for handles we did not create.
pub fn id_from_handle<'a>(prefix: &str, handle: &'a str) -> Option<&'a str> {
    handle
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|id| !id.is_empty())
}

/// Fresh 8-character session id.
pub fn new_session_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[..8].to_string()
}
