use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::{new_session_id, Registry, RegistryError, Session};
use crate::config::{Config, Paths};
use crate::git;
use crate::reconcile::{ReconcileError, ReconcileReport, Reconciler};
use crate::status::{SessionStatus, StatusStore, StoreError};
use crate::supervisor::{AttachLocks, Attacher};
use crate::tmux::{BackendError, TerminalBackend};

#[derive(Error, Debug)]
pub enum OrchestraError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("working directory {} does not exist", .0.display())]
    InvalidWorkingDir(PathBuf),

    #[error("invalid key name '{0}'")]
    InvalidKey(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Registry(RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl From<RegistryError> for OrchestraError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => OrchestraError::NotFound(id),
            other => OrchestraError::Registry(other),
        }
    }
}

/// What the user asks for when starting a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub working_dir: PathBuf,
    pub label: String,
    /// Detected from the working directory when absent
    pub branch: Option<String>,
    /// Overrides the configured agent command
    pub command: Option<Vec<String>>,
}

/// A session together with its latest status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session: Session,
    pub status: SessionStatus,
}

/// Consumer-facing entry point tying the registry, the status store and the
/// terminal backend together.
pub struct Orchestra {
    config: Config,
    registry: Registry,
    store: StatusStore,
    locks: AttachLocks,
    backend: Arc<dyn TerminalBackend>,
    attacher: Arc<dyn Attacher>,
    /// Binary whose `wrap` subcommand runs inside each backend session
    wrapper: PathBuf,
}

impl Orchestra {
    pub fn open(
        config: Config,
        paths: &Paths,
        backend: Arc<dyn TerminalBackend>,
        attacher: Arc<dyn Attacher>,
    ) -> Result<Self, OrchestraError> {
        let wrapper = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("orchestra"));
        Ok(Self {
            config,
            registry: Registry::open(paths.sessions_dir())?,
            store: StatusStore::new(paths.status_dir()),
            locks: AttachLocks::new(paths.locks_dir()),
            backend,
            attacher,
            wrapper,
        })
    }

    pub fn with_wrapper(mut self, exe: impl Into<PathBuf>) -> Self {
        self.wrapper = exe.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look `id` up, rescanning disk once if another process created it.
    fn lookup(&mut self, id: &str) -> Result<Session, OrchestraError> {
        if !self.registry.contains(id) {
            self.registry.reload()?;
        }
        Ok(self.registry.get(id)?.clone())
    }

    pub fn session(&mut self, id: &str) -> Result<Session, OrchestraError> {
        self.lookup(id)
    }

    fn wrapped_command(&self, id: &str, command: &[String]) -> Vec<String> {
        let mut wrapped = vec![
            self.wrapper.to_string_lossy().into_owned(),
            "wrap".to_string(),
            "--session-id".to_string(),
            id.to_string(),
            "--".to_string(),
        ];
        wrapped.extend(command.iter().cloned());
        wrapped
    }

    /// All sessions, oldest first, each with its current status (`Unknown`
    /// when none has been written yet).
    pub fn list_sessions(&mut self) -> Result<Vec<SessionView>, OrchestraError> {
        self.registry.reload()?;
        let mut statuses = self.store.read_all();
        Ok(self
            .registry
            .list()
            .into_iter()
            .map(|session| SessionView {
                status: statuses
                    .remove(&session.id)
                    .unwrap_or_else(SessionStatus::unknown),
                session: session.clone(),
            })
            .collect())
    }

    pub fn get_status(&mut self, id: &str) -> Result<SessionStatus, OrchestraError> {
        self.lookup(id)?;
        Ok(self.store.read(id).unwrap_or_else(SessionStatus::unknown))
    }

    /// Register a session and start its agent in a new backend session.
    /// The registry record is rolled back if the backend refuses.
    pub async fn create_session(&mut self, new: NewSession) -> Result<String, OrchestraError> {
        if !new.working_dir.is_dir() {
            return Err(OrchestraError::InvalidWorkingDir(new.working_dir));
        }
        self.registry.reload()?;
        let mut id = new_session_id();
        while self.registry.contains(&id) {
            id = new_session_id();
        }

        let branch = match new.branch {
            Some(branch) => Some(branch),
            None => git::current_branch(&new.working_dir).await,
        };
        let mut session = Session::new(
            &id,
            &self.config.backend.session_prefix,
            new.working_dir,
            new.label,
        );
        session.branch = branch;
        self.registry.create(session.clone())?;

        let agent = new.command.unwrap_or_else(|| self.config.agent.command.clone());
        let command = self.wrapped_command(&id, &agent);
        if let Err(e) = self
            .backend
            .create(&session.handle, &command, &session.working_dir)
            .await
        {
            if let Err(rollback) = self.registry.delete(&id) {
                warn!(session = %id, error = %rollback, "Failed to roll back session record");
            }
            return Err(e.into());
        }

        info!(session = %id, handle = %session.handle, "Session created");
        Ok(id)
    }

    /// Kill the backend session (if it still exists) and forget the session.
    pub async fn delete_session(&mut self, id: &str) -> Result<(), OrchestraError> {
        let session = self.lookup(id)?;
        match self.backend.kill(&session.handle).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.registry.delete(id)?;
        self.store.remove(id)?;
        info!(session = %id, "Session deleted");
        Ok(())
    }

    /// Type `bytes` into the session. Does not wait for the agent to react.
    pub async fn send_input(&mut self, id: &str, bytes: &[u8]) -> Result<(), OrchestraError> {
        let session = self.lookup(id)?;
        self.backend.send_keys(&session.handle, bytes).await?;
        Ok(())
    }

    /// Press one named key, such as `C-c` or `Escape`, in the session.
    pub async fn send_key(&mut self, id: &str, key: &str) -> Result<(), OrchestraError> {
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(OrchestraError::InvalidKey(key.to_string()));
        }
        let session = self.lookup(id)?;
        self.backend.send_key(&session.handle, key).await?;
        Ok(())
    }

    /// Visible pane contents, optionally limited to the last `lines` lines.
    pub async fn capture_output(
        &mut self,
        id: &str,
        lines: Option<usize>,
    ) -> Result<String, OrchestraError> {
        let session = self.lookup(id)?;
        let capture = self.backend.capture_pane(&session.handle).await?;
        Ok(match lines {
            Some(limit) => last_lines(&capture, limit),
            None => capture,
        })
    }

    pub fn update_label(&mut self, id: &str, label: &str) -> Result<Session, OrchestraError> {
        self.lookup(id)?;
        let session = self.registry.update(id, |s| s.label = label.to_string())?;
        Ok(session.clone())
    }

    /// Re-detect the session's branch, persisting it if it changed.
    pub async fn refresh_branch(&mut self, id: &str) -> Result<Option<String>, OrchestraError> {
        let session = self.lookup(id)?;
        let branch = git::current_branch(&session.working_dir).await;
        if branch != session.branch {
            let updated = branch.clone();
            self.registry.update(id, |s| s.branch = updated)?;
        }
        Ok(branch)
    }

    pub async fn reconcile(&mut self) -> Result<ReconcileReport, OrchestraError> {
        let report = Reconciler {
            registry: &mut self.registry,
            store: &self.store,
            backend: self.backend.as_ref(),
            locks: &self.locks,
            attacher: self.attacher.as_ref(),
            prefix: &self.config.backend.session_prefix,
            adopt_unregistered: self.config.reconcile.adopt_unregistered,
        }
        .run()
        .await?;
        Ok(report)
    }
}

fn last_lines(text: &str, limit: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(limit);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
