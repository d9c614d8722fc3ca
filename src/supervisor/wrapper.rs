use anyhow::{Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use portable_pty::ExitStatus;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::lock::{Acquire, AttachLocks};
use super::pty::Pty;
use super::StatusSink;
use crate::config::{Config, Paths};
use crate::status::{Classifier, ExitOutcome, SessionStatus, StatusStore};

/// How long to keep draining pty output after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WrapOptions {
    pub session_id: String,
    pub handle: String,
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Raw mode on the controlling terminal for as long as the guard lives, so
/// every keystroke (Ctrl+C included) goes to the agent.
struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    fn new() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// (rows, cols); crossterm reports (cols, rows).
fn terminal_size() -> std::io::Result<(u16, u16)> {
    let (cols, rows) = size()?;
    Ok((rows, cols))
}

fn publish(sink: &Option<StatusSink>, status: Option<SessionStatus>) {
    if let Some(sink) = sink {
        sink.publish(status);
    }
}

/// Run the agent under a pty, passing the terminal through and classifying
/// its output until it exits.
///
/// If another classifier already holds the attach lock the agent still runs,
/// but this process writes no status records.
pub async fn run_wrap(opts: WrapOptions, config: &Config, paths: &Paths) -> Result<ExitOutcome> {
    let locks = AttachLocks::new(paths.locks_dir());
    // We are running inside the backend session, so its handle is live.
    let live = HashSet::from([opts.handle.clone()]);
    let guard = match locks.try_acquire(&opts.handle, "wrap", &live) {
        Ok(Acquire::Acquired(guard)) => Some(guard),
        Ok(Acquire::Contended(holder)) => {
            warn!(session = %opts.session_id, ?holder, "Session already attached, running without status updates");
            None
        }
        Err(e) => {
            warn!(session = %opts.session_id, error = %e, "Attach lock unavailable, running without status updates");
            None
        }
    };

    let sink = guard
        .as_ref()
        .map(|_| StatusSink::new(StatusStore::new(paths.status_dir()), &opts.session_id));
    let mut classifier =
        Classifier::from_config(&config.classifier).context("invalid classifier rules")?;

    let (rows, cols) = terminal_size().unwrap_or((24, 80));
    let mut pty = Pty::spawn(&opts.command, opts.working_dir.as_deref(), rows, cols)
        .context("failed to start agent")?;
    let mut reader = pty.take_reader()?;
    let mut writer = pty.take_writer()?;
    let mut child = pty.take_child().context("agent process handle missing")?;
    info!(session = %opts.session_id, command = ?opts.command, "Agent started");

    let raw_mode = match RawModeGuard::new() {
        Ok(guard) => Some(guard),
        Err(e) => {
            debug!(error = %e, "Not a terminal, leaving input mode alone");
            None
        }
    };

    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Plain thread: a read on stdin never returns if nobody types.
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).and_then(|_| writer.flush()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (exit_tx, mut exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = exit_tx.send(child.wait());
    });

    let mut resize_rx = watch_resizes();
    let mut ticker = tokio::time::interval(config.classifier.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stdout = std::io::stdout();

    let outcome = loop {
        tokio::select! {
            Some(bytes) = output_rx.recv() => {
                let _ = stdout.write_all(&bytes).and_then(|_| stdout.flush());
                publish(&sink, classifier.feed(&bytes, Instant::now()));
            }
            _ = ticker.tick() => {
                publish(&sink, classifier.tick(Instant::now()));
            }
            Some((rows, cols)) = resize_rx.recv() => {
                if let Err(e) = pty.resize(rows, cols) {
                    debug!(error = %e, "Failed to resize pty");
                }
            }
            status = &mut exit_rx => break exit_outcome(status.ok()),
        }
    };

    let deadline = tokio::time::sleep(DRAIN_GRACE);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            chunk = output_rx.recv() => match chunk {
                Some(bytes) => {
                    let _ = stdout.write_all(&bytes).and_then(|_| stdout.flush());
                    publish(&sink, classifier.feed(&bytes, Instant::now()));
                }
                None => break,
            },
            _ = &mut deadline => break,
        }
    }

    drop(raw_mode);
    publish(&sink, Some(classifier.finish(outcome, Instant::now())));
    info!(session = %opts.session_id, ?outcome, "Agent exited");
    drop(guard);
    Ok(outcome)
}

fn exit_outcome(status: Option<std::io::Result<ExitStatus>>) -> ExitOutcome {
    match status {
        Some(Ok(status)) => ExitOutcome::from_code(status.exit_code()),
        Some(Err(e)) => {
            warn!(error = %e, "Failed to wait for agent");
            ExitOutcome::Failed { code: None }
        }
        None => ExitOutcome::Failed { code: None },
    }
}

#[cfg(unix)]
fn watch_resizes() -> mpsc::Receiver<(u16, u16)> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(_) => return,
        };
        while sigwinch.recv().await.is_some() {
            if let Ok(size) = terminal_size() {
                if tx.send(size).await.is_err() {
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(not(unix))]
fn watch_resizes() -> mpsc::Receiver<(u16, u16)> {
    mpsc::channel(1).1
}
