use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BackendError, TerminalBackend};

/// Client for interacting with tmux via CLI
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
}

/// A run of literal text, bytes that are not UTF-8, or an Enter key press.
#[derive(Debug, PartialEq, Eq)]
enum KeySegment {
    Text(String),
    Raw(Vec<u8>),
    Enter,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self::with_program("tmux")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            tmux_path: program.into(),
        }
    }

    /// Check that the tmux binary can be executed at all.
    pub async fn ensure_available(&self) -> Result<(), BackendError> {
        let output = self.run(&["-V"]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Get the command to attach to a session (for external execution)
    pub fn attach_command(&self, handle: &str) -> Vec<String> {
        vec![
            self.tmux_path.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            session_target(handle),
        ]
    }

    async fn run(&self, args: &[&str]) -> Result<Output, BackendError> {
        Command::new(&self.tmux_path)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BackendError::Unavailable(format!("'{}' not found in PATH", self.tmux_path))
                } else {
                    BackendError::Command(format!("failed to execute {}: {}", self.tmux_path, e))
                }
            })
    }

    /// Run a command addressed at `handle`, mapping tmux's complaints onto
    /// the backend error taxonomy.
    async fn run_for(&self, handle: &str, args: &[&str]) -> Result<Output, BackendError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(handle, &stderr))
        }
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBackend for TmuxClient {
    async fn create(
        &self,
        handle: &str,
        command: &[String],
        working_dir: &Path,
    ) -> Result<(), BackendError> {
        debug!(session = %handle, working_dir = %working_dir.display(), "Creating tmux session");
        let dir = working_dir.to_string_lossy();
        let mut args = vec!["new-session", "-d", "-s", handle, "-c", &*dir];
        args.extend(command.iter().map(String::as_str));

        self.run_for(handle, &args).await?;
        info!(session = %handle, "Tmux session created");
        Ok(())
    }

    async fn list_live(&self) -> Result<HashSet<String>, BackendError> {
        let output = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if no_server(&stderr) {
                return Ok(HashSet::new());
            }
            return Err(BackendError::Command(format!(
                "tmux list-sessions failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn send_keys(&self, handle: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let target = pane_target(handle);
        debug!(session = %handle, bytes = bytes.len(), "Sending keys to tmux session");
        for segment in key_segments(bytes) {
            match segment {
                KeySegment::Text(text) => {
                    self.run_for(handle, &["send-keys", "-t", &target, "-l", &text])
                        .await?;
                }
                KeySegment::Raw(bytes) => {
                    let mut args = vec!["send-keys".to_string(), "-t".into(), target.clone()];
                    args.push("-H".into());
                    args.extend(bytes.iter().map(|b| format!("{:02x}", b)));
                    let args: Vec<&str> = args.iter().map(String::as_str).collect();
                    self.run_for(handle, &args).await?;
                }
                KeySegment::Enter => {
                    self.run_for(handle, &["send-keys", "-t", &target, "Enter"])
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn send_key(&self, handle: &str, key: &str) -> Result<(), BackendError> {
        let target = pane_target(handle);
        debug!(session = %handle, key, "Sending key to tmux session");
        self.run_for(handle, &["send-keys", "-t", &target, key])
            .await?;
        Ok(())
    }

    async fn capture_pane(&self, handle: &str) -> Result<String, BackendError> {
        let target = pane_target(handle);
        let output = self
            .run_for(handle, &["capture-pane", "-p", "-t", &target])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn kill(&self, handle: &str) -> Result<(), BackendError> {
        let target = session_target(handle);
        self.run_for(handle, &["kill-session", "-t", &target]).await?;
        info!(session = %handle, "Tmux session killed");
        Ok(())
    }

    async fn pane_cwd(&self, handle: &str) -> Result<Option<PathBuf>, BackendError> {
        let target = pane_target(handle);
        let output = self
            .run_for(
                handle,
                &["display-message", "-p", "-t", &target, "#{pane_current_path}"],
            )
            .await?;
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!path.is_empty()).then(|| PathBuf::from(path)))
    }
}

/// Exact-match session target; a bare name would also prefix-match.
fn session_target(handle: &str) -> String {
    format!("={}", handle)
}

fn pane_target(handle: &str) -> String {
    format!("={}:", handle)
}

fn no_server(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("no sessions")
        || stderr.contains("error connecting to")
}

fn classify_failure(handle: &str, stderr: &str) -> BackendError {
    if stderr.contains("duplicate session") {
        BackendError::AlreadyExists(handle.to_string())
    } else if stderr.contains("can't find session")
        || stderr.contains("can't find pane")
        || stderr.contains("can't find window")
        || stderr.contains("session not found")
        || no_server(stderr)
    {
        BackendError::NotFound(handle.to_string())
    } else {
        BackendError::Command(stderr.trim().to_string())
    }
}

/// Split input into literal runs, raw byte runs and Enter presses.
/// `\r\n` counts once. Bytes that are not valid UTF-8 are kept as they are.
fn key_segments(bytes: &[u8]) -> Vec<KeySegment> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\r' || bytes[i] == b'\n' {
            push_run(&mut segments, &bytes[start..i]);
            segments.push(KeySegment::Enter);
            if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
                i += 1;
            }
            start = i + 1;
        }
        i += 1;
    }
    push_run(&mut segments, &bytes[start..]);
    segments
}

fn push_run(segments: &mut Vec<KeySegment>, mut run: &[u8]) {
    while !run.is_empty() {
        match std::str::from_utf8(run) {
            Ok(text) => {
                segments.push(KeySegment::Text(text.to_string()));
                return;
            }
            Err(e) => {
                let (valid, rest) = run.split_at(e.valid_up_to());
                if !valid.is_empty() {
                    segments.push(KeySegment::Text(
                        String::from_utf8_lossy(valid).into_owned(),
                    ));
                }
                let bad = e.error_len().unwrap_or(rest.len());
                segments.push(KeySegment::Raw(rest[..bad].to_vec()));
                run = &rest[bad..];
            }
        }
    }
}
