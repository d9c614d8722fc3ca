use anyhow::{Context, Result};
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::lock::{Acquire, AttachLocks};
use super::StatusSink;
use crate::config::{Config, Paths};
use crate::reconcile::UNREACHABLE_MESSAGE;
use crate::session::Session;
use crate::status::{Classifier, SessionStatus, StatusStore};
use crate::tmux::{BackendError, TerminalBackend};

/// Turns successive pane captures into the output that is new since the
/// previous capture.
///
/// The pane is a window onto a scrolling stream: the longest suffix of the
/// previous capture that reappears as a prefix of the new one is taken to be
/// the overlap, and only the lines after it are new. Identical captures yield
/// nothing so the idle debounce can run.
#[derive(Debug, Default)]
pub struct PaneDiff {
    previous: Vec<String>,
}

impl PaneDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// New complete lines, newline-terminated, or `None` if nothing changed.
    pub fn next(&mut self, capture: &str) -> Option<String> {
        let mut lines: Vec<String> = capture
            .lines()
            .map(|line| line.trim_end().to_string())
            .collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        if lines == self.previous {
            return None;
        }

        let overlap = (0..=self.previous.len().min(lines.len()))
            .rev()
            .find(|&k| self.previous[self.previous.len() - k..] == lines[..k])
            .unwrap_or(0);

        let fresh = &lines[overlap..];
        let output = if fresh.is_empty() {
            None
        } else {
            let mut text = fresh.join("\n");
            text.push('\n');
            Some(text)
        };
        self.previous = lines;
        output
    }
}

/// Re-attach a classifier to a session whose wrapper is gone, by polling its
/// pane until the backend session disappears.
pub async fn run_watch(
    session: &Session,
    backend: &dyn TerminalBackend,
    config: &Config,
    paths: &Paths,
) -> Result<()> {
    let sink = StatusSink::new(StatusStore::new(paths.status_dir()), &session.id);
    let live = backend.list_live().await.context("failed to list backend sessions")?;
    if !live.contains(&session.handle) {
        info!(session = %session.id, "Backend session is gone, nothing to watch");
        sink.publish(Some(SessionStatus::unreachable(UNREACHABLE_MESSAGE)));
        return Ok(());
    }

    let locks = AttachLocks::new(paths.locks_dir());
    let guard = match locks.try_acquire(&session.handle, "watch", &live)? {
        Acquire::Acquired(guard) => guard,
        Acquire::Contended(holder) => {
            info!(session = %session.id, ?holder, "Session already attached");
            return Ok(());
        }
    };
    info!(session = %session.id, handle = %session.handle, "Watching pane");

    let mut classifier =
        Classifier::from_config(&config.classifier).context("invalid classifier rules")?;
    let mut diff = PaneDiff::new();
    let mut poll = tokio::time::interval(config.watcher.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticker = tokio::time::interval(config.classifier.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = poll.tick() => match backend.capture_pane(&session.handle).await {
                Ok(capture) => {
                    if let Some(fresh) = diff.next(&capture) {
                        sink.publish(classifier.feed(fresh.as_bytes(), Instant::now()));
                    }
                }
                Err(BackendError::NotFound(_)) => {
                    info!(session = %session.id, "Backend session ended");
                    sink.publish(Some(SessionStatus::unreachable(UNREACHABLE_MESSAGE)));
                    break;
                }
                Err(e) => warn!(session = %session.id, error = %e, "Pane capture failed"),
            },
            _ = ticker.tick() => {
                sink.publish(classifier.tick(Instant::now()));
            }
            _ = tokio::signal::ctrl_c() => {
                debug!(session = %session.id, "Interrupted");
                break;
            }
        }
    }

    drop(guard);
    Ok(())
}
