use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use super::lock::{AttachLocks, LockError, LockState};
use crate::config::{Config, Paths, HOME_ENV};
use crate::session::Session;

const PROBE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("failed to spawn watcher for '{id}': {source}")]
    Spawn {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("watcher for '{id}' exited ({status}) before attaching")]
    Exited { id: String, status: ExitStatus },

    #[error("watcher for '{id}' did not attach within {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Starts a classifier against a session's existing backend session.
#[async_trait]
pub trait Attacher: Send + Sync {
    async fn attach(&self, session: &Session) -> Result<(), AttachError>;
}

/// Attaches by spawning a detached `watch` process and waiting until it
/// holds the session's attach lock.
pub struct WatcherLauncher {
    exe: PathBuf,
    data_dir: PathBuf,
    locks: AttachLocks,
    timeout: Duration,
}

impl WatcherLauncher {
    pub fn new(exe: impl Into<PathBuf>, paths: &Paths, timeout: Duration) -> Self {
        Self {
            exe: exe.into(),
            data_dir: paths.root.clone(),
            locks: AttachLocks::new(paths.locks_dir()),
            timeout,
        }
    }

    /// Launch watchers from the running binary.
    pub fn from_current_exe(paths: &Paths, config: &Config) -> io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            paths,
            config.reconcile.attach_timeout(),
        ))
    }

    fn command(&self, id: &str) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.exe);
        cmd.args(["watch", "--session-id", id])
            .env(HOME_ENV, &self.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a Ctrl+C aimed at us does not reach it.
            cmd.process_group(0);
        }
        cmd
    }
}

#[async_trait]
impl Attacher for WatcherLauncher {
    async fn attach(&self, session: &Session) -> Result<(), AttachError> {
        let mut child = tokio::process::Command::from(self.command(&session.id))
            .spawn()
            .map_err(|source| AttachError::Spawn {
                id: session.id.clone(),
                source,
            })?;
        debug!(session = %session.id, pid = ?child.id(), "Spawned watcher");

        let live = HashSet::from([session.handle.clone()]);
        let deadline = Instant::now() + self.timeout;
        loop {
            if let LockState::Held(_) = self.locks.probe(&session.handle, &live)? {
                info!(session = %session.id, "Watcher attached");
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(AttachError::Exited {
                    id: session.id.clone(),
                    status,
                });
            }
            if Instant::now() >= deadline {
                return Err(AttachError::Timeout {
                    id: session.id.clone(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }
}
