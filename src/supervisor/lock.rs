//! Advisory per-handle attach lock.
//!
//! At most one classifier may be attached to a backend session. The lock file
//! `<locks>/<handle>.lock` is created with an atomic create-if-absent open,
//! then held with an exclusive `flock` for the lifetime of the guard; the
//! holder record is written only after the flock is taken. The kernel drops
//! the flock when the holder dies, which is how a dead holder is recognised.
//!
//! A lock is stale when its backend handle is no longer live, when its
//! holder's flock has been released, or when it carries no record past a
//! short grace period (holder died between create and write).
//!
//! Every unlink of a lock file happens under a flock on the companion
//! `<handle>.unlink` file and only after checking that the path still names
//! the inode the caller inspected. A breaker also holds the stale file's own
//! flock across that check and the unlink, and a new holder confirms after
//! its flock that its file is still the one at the path. Together these keep
//! a slow breaker from deleting a lock someone else has just taken.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage;

const DEFAULT_GRACE: Duration = Duration::from_secs(5);
const ACQUIRE_ATTEMPTS: usize = 4;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("attach lock I/O for '{handle}': {source}")]
    Io {
        handle: String,
        #[source]
        source: io::Error,
    },
}

/// Who holds an attach lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub handle: String,
    pub pid: u32,
    /// `wrap` or `watch`
    pub role: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    BackendGone,
    HolderDead,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    /// Holder record is `None` while the holder is still writing it
    Held(Option<LockHolder>),
    Stale(StaleReason),
}

pub enum Acquire {
    Acquired(AttachGuard),
    Contended(Option<LockHolder>),
}

/// Directory of attach locks.
#[derive(Debug, Clone)]
pub struct AttachLocks {
    dir: PathBuf,
    grace: Duration,
}

impl AttachLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn path(&self, handle: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", handle))
    }

    fn unlink_path(&self, handle: &str) -> PathBuf {
        self.dir.join(format!("{}.unlink", handle))
    }

    fn io_err(handle: &str, source: io::Error) -> LockError {
        LockError::Io {
            handle: handle.to_string(),
            source,
        }
    }

    /// Inspect the lock for `handle` without taking it.
    pub fn probe(&self, handle: &str, live: &HashSet<String>) -> Result<LockState, LockError> {
        Ok(self.inspect(handle, live)?.0)
    }

    fn inspect(
        &self,
        handle: &str,
        live: &HashSet<String>,
    ) -> Result<(LockState, Option<File>), LockError> {
        let path = self.path(handle);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((LockState::Free, None)),
            Err(e) => return Err(Self::io_err(handle, e)),
        };

        if !live.contains(handle) {
            return Ok((LockState::Stale(StaleReason::BackendGone), Some(file)));
        }

        match file.try_lock_exclusive() {
            Ok(()) => {
                let holder = read_holder(&path);
                let _ = FileExt::unlock(&file);
                let state = match holder {
                    Some(_) => LockState::Stale(StaleReason::HolderDead),
                    None if file_age(&file) < self.grace => LockState::Held(None),
                    None => LockState::Stale(StaleReason::Abandoned),
                };
                Ok((state, Some(file)))
            }
            Err(e) if is_contended(&e) => Ok((LockState::Held(read_holder(&path)), Some(file))),
            Err(e) => Err(Self::io_err(handle, e)),
        }
    }

    /// Take the lock for `handle` unless a live holder already has it.
    /// Stale locks are broken and taken over.
    pub fn try_acquire(
        &self,
        handle: &str,
        role: &str,
        live: &HashSet<String>,
    ) -> Result<Acquire, LockError> {
        let path = self.path(handle);
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(handle, e))?;

        for _ in 0..ACQUIRE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => match self.hold(handle, role, path.clone(), file)? {
                    Some(guard) => return Ok(Acquire::Acquired(guard)),
                    None => continue,
                },
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Self::io_err(handle, e)),
            }

            match self.inspect(handle, live)? {
                (LockState::Free, _) => continue,
                (LockState::Held(holder), _) => return Ok(Acquire::Contended(holder)),
                (LockState::Stale(reason), Some(file)) => {
                    if self.break_stale(handle, &path, &file, reason)? {
                        warn!(session = %handle, ?reason, "Broke stale attach lock");
                    }
                }
                (LockState::Stale(_), None) => continue,
            }
        }

        Ok(Acquire::Contended(read_holder(&path)))
    }

    /// Unlink the stale lock file `file` if it is still the one at `path`
    /// and nobody has taken its flock since it was inspected.
    fn break_stale(
        &self,
        handle: &str,
        path: &Path,
        file: &File,
        reason: StaleReason,
    ) -> Result<bool, LockError> {
        let _serial = self.lock_unlinks(handle)?;
        if !same_file(path, file) {
            return Ok(false);
        }
        match file.try_lock_exclusive() {
            Ok(()) => {}
            // The holder of a gone backend session may still be running.
            Err(e) if is_contended(&e) && reason == StaleReason::BackendGone => {}
            Err(e) if is_contended(&e) => return Ok(false),
            Err(e) => return Err(Self::io_err(handle, e)),
        }
        let removed = storage::remove_if_exists(path).map_err(|e| Self::io_err(handle, e));
        let _ = FileExt::unlock(file);
        removed
    }

    fn lock_unlinks(&self, handle: &str) -> Result<UnlinkLock, LockError> {
        UnlinkLock::take(&self.unlink_path(handle)).map_err(|e| Self::io_err(handle, e))
    }

    /// Take the flock on a freshly created lock file and write the holder
    /// record. `None` when a breaker unlinked the file before the flock was
    /// taken; the caller starts over.
    fn hold(
        &self,
        handle: &str,
        role: &str,
        path: PathBuf,
        mut file: File,
    ) -> Result<Option<AttachGuard>, LockError> {
        let result = (|| -> io::Result<Option<LockHolder>> {
            file.lock_exclusive()?;
            if !same_file(&path, &file) {
                return Ok(None);
            }
            let holder = LockHolder {
                handle: handle.to_string(),
                pid: std::process::id(),
                role: role.to_string(),
                acquired_at: Utc::now(),
            };
            serde_json::to_writer(&mut file, &holder).map_err(io::Error::other)?;
            file.flush()?;
            file.sync_all()?;
            Ok(Some(holder))
        })();

        match result {
            Ok(Some(holder)) => {
                debug!(session = %handle, role, "Attach lock acquired");
                Ok(Some(AttachGuard {
                    file,
                    path,
                    unlink_path: self.unlink_path(handle),
                    holder,
                }))
            }
            Ok(None) => {
                debug!(session = %handle, "Lock file replaced while acquiring, retrying");
                Ok(None)
            }
            Err(e) => {
                remove_own(&self.unlink_path(handle), &path, &file);
                Err(Self::io_err(handle, e))
            }
        }
    }
}

/// Exclusive flock on a handle's `.unlink` file. The file itself is never
/// removed, so every process serializes on the same inode.
struct UnlinkLock(File);

impl UnlinkLock {
    fn take(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self(file))
    }
}

impl Drop for UnlinkLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Remove `path` if it still names `file`.
fn remove_own(unlink_path: &Path, path: &Path, file: &File) {
    match UnlinkLock::take(unlink_path) {
        Ok(_serial) => {
            if same_file(path, file) {
                let _ = fs::remove_file(path);
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Leaving attach lock file in place"),
    }
}

/// Held attach lock; released (and its file removed) on drop.
#[derive(Debug)]
pub struct AttachGuard {
    file: File,
    path: PathBuf,
    unlink_path: PathBuf,
    holder: LockHolder,
}

impl AttachGuard {
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        // Someone may have broken our lock and created their own.
        remove_own(&self.unlink_path, &self.path, &self.file);
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn file_age(file: &File) -> Duration {
    file.metadata()
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn same_file(path: &Path, file: &File) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(path), file.metadata()) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(path: &Path, _file: &File) -> bool {
    path.exists()
}
