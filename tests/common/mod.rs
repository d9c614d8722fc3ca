#![allow(dead_code)]

use agent_orchestra::config::{Config, Paths};
use agent_orchestra::session::Session;
use agent_orchestra::supervisor::{
    Acquire, AttachError, AttachGuard, AttachLocks, Attacher,
};
use agent_orchestra::{BackendError, Orchestra, TerminalBackend};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Default)]
pub struct FakeState {
    pub live: HashSet<String>,
    pub created: Vec<(String, Vec<String>, PathBuf)>,
    pub killed: Vec<String>,
    pub keys: Vec<(String, Vec<u8>)>,
    pub named_keys: Vec<(String, String)>,
    pub panes: HashMap<String, String>,
    pub cwd: HashMap<String, PathBuf>,
    pub fail_create: bool,
}

/// In-memory stand-in for tmux.
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn with_live(handles: &[&str]) -> Self {
        let backend = Self::default();
        backend
            .state()
            .live
            .extend(handles.iter().map(|h| h.to_string()));
        backend
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl TerminalBackend for FakeBackend {
    async fn create(
        &self,
        handle: &str,
        command: &[String],
        working_dir: &Path,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(BackendError::Unavailable("no server".into()));
        }
        if !state.live.insert(handle.to_string()) {
            return Err(BackendError::AlreadyExists(handle.to_string()));
        }
        state.created.push((
            handle.to_string(),
            command.to_vec(),
            working_dir.to_path_buf(),
        ));
        Ok(())
    }

    async fn list_live(&self) -> Result<HashSet<String>, BackendError> {
        Ok(self.state().live.clone())
    }

    async fn send_keys(&self, handle: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state();
        if !state.live.contains(handle) {
            return Err(BackendError::NotFound(handle.to_string()));
        }
        state.keys.push((handle.to_string(), bytes.to_vec()));
        Ok(())
    }

    async fn send_key(&self, handle: &str, key: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        if !state.live.contains(handle) {
            return Err(BackendError::NotFound(handle.to_string()));
        }
        state.named_keys.push((handle.to_string(), key.to_string()));
        Ok(())
    }

    async fn capture_pane(&self, handle: &str) -> Result<String, BackendError> {
        let state = self.state();
        if !state.live.contains(handle) {
            return Err(BackendError::NotFound(handle.to_string()));
        }
        Ok(state.panes.get(handle).cloned().unwrap_or_default())
    }

    async fn kill(&self, handle: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        if !state.live.remove(handle) {
            return Err(BackendError::NotFound(handle.to_string()));
        }
        state.killed.push(handle.to_string());
        Ok(())
    }

    async fn pane_cwd(&self, handle: &str) -> Result<Option<PathBuf>, BackendError> {
        Ok(self.state().cwd.get(handle).cloned())
    }
}

/// Attaches in-process by taking the attach lock and holding it, the way a
/// watcher process would.
pub struct FakeAttacher {
    locks: AttachLocks,
    guards: Mutex<Vec<AttachGuard>>,
    pub attached: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<String>>,
}

impl FakeAttacher {
    pub fn new(paths: &Paths) -> Self {
        Self {
            locks: AttachLocks::new(paths.locks_dir()),
            guards: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }

    /// Simulate every watcher dying.
    pub fn detach_all(&self) {
        self.guards.lock().unwrap().clear();
    }
}

#[async_trait]
impl Attacher for FakeAttacher {
    async fn attach(&self, session: &Session) -> Result<(), AttachError> {
        if self.failing.lock().unwrap().contains(&session.id) {
            return Err(AttachError::Timeout {
                id: session.id.clone(),
                timeout: Duration::from_millis(1),
            });
        }
        let live = HashSet::from([session.handle.clone()]);
        if let Acquire::Acquired(guard) = self.locks.try_acquire(&session.handle, "watch", &live)? {
            self.guards.lock().unwrap().push(guard);
        }
        self.attached.lock().unwrap().push(session.id.clone());
        Ok(())
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub paths: Paths,
    pub backend: Arc<FakeBackend>,
    pub attacher: Arc<FakeAttacher>,
}

impl Fixture {
    pub fn new(live: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path().join("data"));
        Self {
            backend: Arc::new(FakeBackend::with_live(live)),
            attacher: Arc::new(FakeAttacher::new(&paths)),
            paths,
            dir,
        }
    }

    pub fn orchestra(&self) -> Orchestra {
        self.orchestra_with(Config::default())
    }

    pub fn orchestra_with(&self, config: Config) -> Orchestra {
        Orchestra::open(
            config,
            &self.paths,
            self.backend.clone(),
            self.attacher.clone(),
        )
        .unwrap()
        .with_wrapper("/usr/local/bin/orchestra")
    }

    /// A project directory that exists.
    pub fn project(&self) -> PathBuf {
        let dir = self.dir.path().join("project");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
