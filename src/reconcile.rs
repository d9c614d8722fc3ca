//! Bringing the registry, the backend and the status store back into
//! agreement after crashes and restarts.
//!
//! Safe to run any number of times: a session that is attached stays
//! attached, an unreachable mark is written once, and nothing here ever
//! creates a backend session.

use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::{id_from_handle, Registry, RegistryError, Session};
use crate::status::{SessionStatus, StatusStore, StoreError};
use crate::supervisor::{AttachLocks, Attacher, LockState};
use crate::tmux::{BackendError, TerminalBackend};

pub const ADOPTED_LABEL: &str = "(reconnected session)";
pub const UNREACHABLE_MESSAGE: &str = "backend session not found";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Session ids touched by one reconciliation pass, by outcome.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live backend sessions with our prefix that had no registry record
    pub adopted: Vec<String>,
    pub reattached: Vec<String>,
    pub already_attached: Vec<String>,
    pub marked_unreachable: Vec<String>,
    pub stray_removed: Vec<String>,
}

impl ReconcileReport {
    /// True when the pass changed nothing.
    pub fn is_quiet(&self) -> bool {
        self.adopted.is_empty()
            && self.reattached.is_empty()
            && self.marked_unreachable.is_empty()
            && self.stray_removed.is_empty()
    }
}

pub struct Reconciler<'a> {
    pub registry: &'a mut Registry,
    pub store: &'a StatusStore,
    pub backend: &'a dyn TerminalBackend,
    pub locks: &'a AttachLocks,
    pub attacher: &'a dyn Attacher,
    pub prefix: &'a str,
    pub adopt_unregistered: bool,
}

impl Reconciler<'_> {
    pub async fn run(self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        self.registry.reload()?;
        let statuses = self.store.read_all();
        let live = self.backend.list_live().await?;
        debug!(
            registered = self.registry.list().len(),
            live = live.len(),
            statuses = statuses.len(),
            "Reconciling"
        );

        if self.adopt_unregistered {
            let mut orphans: Vec<(&str, &str)> = live
                .iter()
                .filter_map(|handle| {
                    id_from_handle(self.prefix, handle).map(|id| (id, handle.as_str()))
                })
                .filter(|(id, _)| !self.registry.contains(id))
                .collect();
            orphans.sort();

            for (id, handle) in orphans {
                let working_dir = match self.backend.pane_cwd(handle).await {
                    Ok(Some(dir)) => dir,
                    Ok(None) => fallback_dir(),
                    Err(e) => {
                        debug!(session = %id, error = %e, "No pane directory");
                        fallback_dir()
                    }
                };
                let session = Session::new(id, self.prefix, working_dir, ADOPTED_LABEL);
                match self.registry.create(session) {
                    Ok(()) => {
                        info!(session = %id, handle = %handle, "Adopted unregistered backend session");
                        report.adopted.push(id.to_string());
                    }
                    Err(e) => warn!(session = %id, error = %e, "Failed to adopt backend session"),
                }
            }
        }

        let sessions: Vec<Session> = self.registry.list().into_iter().cloned().collect();
        for session in &sessions {
            if live.contains(&session.handle) {
                match self.locks.probe(&session.handle, &live) {
                    Ok(LockState::Held(_)) => report.already_attached.push(session.id.clone()),
                    Ok(state) => {
                        debug!(session = %session.id, ?state, "Orphaned session, attaching");
                        match self.attacher.attach(session).await {
                            Ok(()) => report.reattached.push(session.id.clone()),
                            Err(e) => {
                                warn!(session = %session.id, error = %e, "Failed to re-attach")
                            }
                        }
                    }
                    Err(e) => warn!(session = %session.id, error = %e, "Failed to probe attach lock"),
                }
            } else if !statuses.get(&session.id).is_some_and(|s| s.unreachable) {
                match self
                    .store
                    .write(&session.id, &SessionStatus::unreachable(UNREACHABLE_MESSAGE))
                {
                    Ok(()) => {
                        info!(session = %session.id, "Backend session gone, marked unreachable");
                        report.marked_unreachable.push(session.id.clone());
                    }
                    Err(e) => warn!(session = %session.id, error = %e, "Failed to mark unreachable"),
                }
            }
        }

        for id in self.store.ids()? {
            if self.registry.contains(&id) {
                continue;
            }
            match self.store.remove(&id) {
                Ok(_) => {
                    info!(session = %id, "Removed stray status record");
                    report.stray_removed.push(id);
                }
                Err(e) => warn!(session = %id, error = %e, "Failed to remove stray status"),
            }
        }

        Ok(report)
    }
}

fn fallback_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}
