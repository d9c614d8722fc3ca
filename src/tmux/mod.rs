mod client;

pub use client::TmuxClient;

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// Multiplexer missing or unreachable
    #[error("terminal backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend session '{0}' not found")]
    NotFound(String),

    #[error("backend session '{0}' already exists")]
    AlreadyExists(String),

    #[error("backend command failed: {0}")]
    Command(String),
}

/// The slice of a terminal multiplexer the orchestra depends on.
///
/// Calls may block briefly on a subprocess. `NotFound` and `AlreadyExists`
/// are reported distinctly so callers can treat them as advisory.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Start a detached session named `handle` running `command` in `working_dir`.
    async fn create(
        &self,
        handle: &str,
        command: &[String],
        working_dir: &Path,
    ) -> Result<(), BackendError>;

    /// Names of every currently running session.
    async fn list_live(&self) -> Result<HashSet<String>, BackendError>;

    /// Type `bytes` into the session's active pane.
    async fn send_keys(&self, handle: &str, bytes: &[u8]) -> Result<(), BackendError>;

    /// Press a named key (`C-c`, `Tab`, `Up`) in the session's active pane.
    async fn send_key(&self, handle: &str, key: &str) -> Result<(), BackendError>;

    /// Visible contents of the session's active pane.
    async fn capture_pane(&self, handle: &str) -> Result<String, BackendError>;

    async fn kill(&self, handle: &str) -> Result<(), BackendError>;

    /// Current directory of the active pane, when the backend knows it.
    async fn pane_cwd(&self, _handle: &str) -> Result<Option<PathBuf>, BackendError> {
        Ok(None)
    }
}
