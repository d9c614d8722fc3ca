use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::status::ActivityState;

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "AGENT_ORCHESTRA_HOME";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("no home directory; set AGENT_ORCHESTRA_HOME")]
    NoHome,
}

/// Top-level configuration, loaded from `<data_dir>/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub agent: AgentConfig,
    pub classifier: ClassifierConfig,
    pub watcher: WatcherConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// tmux binary
    pub program: String,
    /// Backend session names are `<session_prefix>-<id>`
    pub session_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "tmux".to_string(),
            session_prefix: "co".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command line launched under the wrapper
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Silence while working before the session is considered idle
    pub debounce_ms: u64,
    /// How long a partial line may sit before it is classified anyway
    pub flush_timeout_ms: u64,
    pub tick_ms: u64,
    pub snippet_max_chars: usize,
    /// Minimum spacing of writes that only refresh the snippet
    pub snippet_refresh_ms: u64,
    /// Unterminated output beyond this is discarded as unclassifiable
    pub partial_ceiling_bytes: usize,
    pub rules: Vec<RuleConfig>,
}

impl ClassifierConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }

    pub fn snippet_refresh(&self) -> Duration {
        Duration::from_millis(self.snippet_refresh_ms)
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 5_000,
            flush_timeout_ms: 500,
            tick_ms: 250,
            snippet_max_chars: 200,
            snippet_refresh_ms: 1_000,
            partial_ceiling_bytes: 4096,
            rules: default_rules(),
        }
    }
}

/// One entry of the classification table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
    pub state: ActivityState,
}

impl RuleConfig {
    fn new(name: &str, pattern: &str, state: ActivityState) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            state,
        }
    }
}

/// Waiting rules first, then errors, then explicit activity markers.
pub fn default_rules() -> Vec<RuleConfig> {
    use ActivityState::{Error, Waiting, Working};
    vec![
        RuleConfig::new("prompt", r"^>\s*$", Waiting),
        RuleConfig::new("question", r"^\?\s", Waiting),
        RuleConfig::new("do-you-want", r"^Do you want to", Waiting),
        RuleConfig::new("would-you-like", r"^Would you like", Waiting),
        RuleConfig::new("press-enter", r"^Press Enter", Waiting),
        RuleConfig::new("yes-no-bracket", r"(?i)\[y/n\]", Waiting),
        RuleConfig::new("yes-no-paren", r"(?i)\(y/n\)", Waiting),
        RuleConfig::new("error", r"(?i)^error:", Error),
        RuleConfig::new("failed", r"(?i)^failed:", Error),
        RuleConfig::new("exception", r"(?i)^exception:", Error),
        RuleConfig::new("reading", r"^Reading\s", Working),
        RuleConfig::new("writing", r"^Writing\s", Working),
        RuleConfig::new("editing", r"^Editing\s", Working),
        RuleConfig::new("running", r"^Running\s", Working),
        RuleConfig::new("searching", r"^Searching\s", Working),
        RuleConfig::new("tool", r"^\[.*\]", Working),
        RuleConfig::new("spinner", r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]", Working),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Register live backend sessions carrying our prefix but no record
    pub adopt_unregistered: bool,
    pub attach_timeout_ms: u64,
}

impl ReconcileConfig {
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            adopt_unregistered: true,
            attach_timeout_ms: 3_000,
        }
    }
}

impl Config {
    /// Load `config.toml` from `data_dir`, falling back to defaults when the
    /// file does not exist.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join("config.toml");
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Read(path, e)),
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path, e))
    }
}

/// Resolve the data directory: `$AGENT_ORCHESTRA_HOME`, else `~/.agent-orchestra`.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".agent-orchestra"))
        .ok_or(ConfigError::NoHome)
}

/// Directory layout under the data dir.
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.root.join("status")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("orchestra.log")
    }
}
