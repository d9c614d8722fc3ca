//! Processes that own a session's classifier.
//!
//! `wrap` runs the agent under a pty inside the backend session; `watch`
//! re-attaches to a session whose wrapper is gone by polling its pane. Either
//! way the attach lock guarantees a single writer per status record.

mod launcher;
mod lock;
mod pty;
mod watcher;
mod wrapper;

pub use launcher::{AttachError, Attacher, WatcherLauncher};
pub use lock::{Acquire, AttachGuard, AttachLocks, LockError, LockHolder, LockState, StaleReason};
pub use pty::{Pty, PtyError};
pub use watcher::{run_watch, PaneDiff};
pub use wrapper::{run_wrap, WrapOptions};

use tracing::{debug, warn};

use crate::status::{SessionStatus, StatusStore};

/// Writes one session's status records. Failures are logged; a missed
/// snapshot is superseded by the next one.
pub(crate) struct StatusSink {
    store: StatusStore,
    id: String,
}

impl StatusSink {
    pub(crate) fn new(store: StatusStore, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
        }
    }

    pub(crate) fn publish(&self, status: Option<SessionStatus>) {
        if let Some(status) = status {
            debug!(session = %self.id, state = %status.state, "Status update");
            if let Err(e) = self.store.write(&self.id, &status) {
                warn!(session = %self.id, error = %e, "Failed to write status");
            }
        }
    }
}
