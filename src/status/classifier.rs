use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::rules::{strip_ansi, RuleError, RuleSet};
use super::{ActivityState, SessionStatus};
use crate::config::ClassifierConfig;

/// How the wrapped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Clean,
    /// Non-zero exit code, or `None` when killed by a signal
    Failed { code: Option<u32> },
}

impl ExitOutcome {
    pub fn from_code(code: u32) -> Self {
        if code == 0 {
            ExitOutcome::Clean
        } else {
            ExitOutcome::Failed { code: Some(code) }
        }
    }

    fn describe(&self) -> String {
        match self {
            ExitOutcome::Clean => "process exited".to_string(),
            ExitOutcome::Failed { code: Some(code) } => {
                format!("process exited with status {}", code)
            }
            ExitOutcome::Failed { code: None } => "process terminated by signal".to_string(),
        }
    }
}

/// Streaming activity classifier for one session.
///
/// Fed raw terminal bytes and periodic ticks; returns a status record
/// whenever something worth persisting happened. Time is always supplied by
/// the caller.
pub struct Classifier {
    rules: RuleSet,
    debounce: Duration,
    flush_timeout: Duration,
    snippet_refresh: Duration,
    snippet_max_chars: usize,
    partial_ceiling: usize,

    state: ActivityState,
    snippet: String,
    /// Bytes after the last line boundary
    pending: Vec<u8>,
    pending_visible: String,
    last_byte_at: Option<Instant>,
    last_activity: Option<Instant>,
    last_write: Option<Instant>,
    written_snippet: String,
    finished: bool,
}

impl Classifier {
    pub fn new(rules: RuleSet, config: &ClassifierConfig) -> Self {
        Self {
            rules,
            debounce: config.debounce(),
            flush_timeout: config.flush_timeout(),
            snippet_refresh: config.snippet_refresh(),
            snippet_max_chars: config.snippet_max_chars,
            partial_ceiling: config.partial_ceiling_bytes,
            state: ActivityState::Unknown,
            snippet: String::new(),
            pending: Vec::new(),
            pending_visible: String::new(),
            last_byte_at: None,
            last_activity: None,
            last_write: None,
            written_snippet: String::new(),
            finished: false,
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Result<Self, RuleError> {
        Ok(Self::new(RuleSet::compile(&config.rules)?, config))
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn snippet(&self) -> &str {
        &self.snippet
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume a chunk of raw output.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Option<SessionStatus> {
        if self.finished || bytes.is_empty() {
            return None;
        }
        let before = self.state;
        self.pending.extend_from_slice(bytes);
        self.last_byte_at = Some(now);

        for line in self.take_complete_lines() {
            self.observe_line(&line, now);
        }

        if self.pending.len() > self.partial_ceiling {
            warn!(
                bytes = self.pending.len(),
                state = %self.state,
                "classification ambiguous: unterminated output over ceiling, keeping state"
            );
            self.pending.clear();
            self.pending_visible.clear();
        } else {
            let visible = visible_text(&self.pending);
            if !visible.is_empty() && visible != self.pending_visible {
                self.last_activity = Some(now);
            }
            self.pending_visible = visible;
        }

        self.emit(before, now)
    }

    /// Advance timers: flush a stale partial line, apply the idle debounce
    /// and write out a snippet held back by the refresh throttle.
    pub fn tick(&mut self, now: Instant) -> Option<SessionStatus> {
        if self.finished {
            return None;
        }
        let before = self.state;

        if let Some(last_byte) = self.last_byte_at {
            if !self.pending.is_empty() && now.duration_since(last_byte) >= self.flush_timeout {
                let line = visible_text(&self.pending);
                self.pending.clear();
                self.pending_visible.clear();
                self.observe_line(&line, last_byte);
            }
        }

        if self.state == ActivityState::Working {
            if let Some(last) = self.last_activity {
                if now.duration_since(last) >= self.debounce {
                    self.state = ActivityState::Idle;
                }
            }
        }

        self.emit(before, now)
    }

    /// Record the end of the wrapped process. Always yields a final record;
    /// the classifier ignores all input afterwards.
    pub fn finish(&mut self, outcome: ExitOutcome, now: Instant) -> SessionStatus {
        if !self.finished {
            if !self.pending.is_empty() {
                let line = visible_text(&self.pending);
                self.pending.clear();
                self.observe_line(&line, now);
            }
            self.finished = true;
            let before = self.state;
            self.state = match outcome {
                ExitOutcome::Clean => ActivityState::Exited,
                ExitOutcome::Failed { .. } => ActivityState::Error,
            };
            self.snippet = outcome.describe();
            debug!(from = %before, to = %self.state, "process finished");
        }
        self.record(now)
    }

    /// Split `pending` at `\n`, `\r\n` and lone `\r`, returning the visible
    /// text of each completed line. A trailing `\r` stays pending until we
    /// know whether `\n` follows.
    fn take_complete_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;
        let len = self.pending.len();
        for i in 0..len {
            match self.pending[i] {
                b'\n' => {
                    let end = if i > start && self.pending[i - 1] == b'\r' {
                        i - 1
                    } else {
                        i
                    };
                    lines.push(visible_text(&self.pending[start..end]));
                    start = i + 1;
                }
                b'\r' if i + 1 < len && self.pending[i + 1] != b'\n' => {
                    lines.push(visible_text(&self.pending[start..i]));
                    start = i + 1;
                }
                _ => {}
            }
        }
        self.pending.drain(..start);
        if start > 0 {
            self.pending_visible.clear();
        }
        lines
    }

    /// Apply one completed line.
    fn observe_line(&mut self, line: &str, at: Instant) {
        let Some(state) = self.rules.classify(line) else {
            return;
        };
        self.state = state;
        self.last_activity = Some(at);
        self.snippet = line.chars().take(self.snippet_max_chars).collect();
    }

    /// A transition is written at once. A newer snippet in the same state
    /// waits until `snippet_refresh` has passed since the last write.
    fn emit(&mut self, before: ActivityState, now: Instant) -> Option<SessionStatus> {
        if self.state != before {
            debug!(from = %before, to = %self.state, "status transition");
            return Some(self.record(now));
        }
        let refresh_due = self
            .last_write
            .map_or(true, |at| now.duration_since(at) >= self.snippet_refresh);
        if refresh_due && self.snippet != self.written_snippet {
            return Some(self.record(now));
        }
        None
    }

    fn record(&mut self, now: Instant) -> SessionStatus {
        self.last_write = Some(now);
        self.written_snippet = self.snippet.clone();
        SessionStatus::new(self.state, self.snippet.clone())
    }
}

fn visible_text(bytes: &[u8]) -> String {
    strip_ansi(&String::from_utf8_lossy(bytes)).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            debounce_ms: 5_000,
            flush_timeout_ms: 500,
            snippet_refresh_ms: 1_000,
            partial_ceiling_bytes: 64,
            ..ClassifierConfig::default()
        }
    }

    fn classifier() -> Classifier {
        Classifier::from_config(&config()).unwrap()
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_working_then_idle_after_silence() {
        let t0 = Instant::now();
        let mut c = classifier();
        let mut seen = vec![c.state()];

        let update = c.feed(b"Running tests...\n", t0).unwrap();
        seen.push(update.state);
        assert_eq!(update.last_output, "Running tests...");

        assert!(c.tick(t0 + secs(2.0)).is_none());
        assert!(c.tick(t0 + secs(4.9)).is_none());
        let update = c.tick(t0 + secs(6.0)).unwrap();
        seen.push(update.state);

        assert_eq!(
            seen,
            vec![ActivityState::Unknown, ActivityState::Working, ActivityState::Idle]
        );
        assert!(c.tick(t0 + secs(7.0)).is_none());
    }

    #[test]
    fn test_prompt_without_newline_waits_after_flush() {
        let t0 = Instant::now();
        let mut c = classifier();

        assert!(c.feed(b"Proceed? [y/n] ", t0).is_none());
        assert_eq!(c.state(), ActivityState::Unknown);
        assert!(c.tick(t0 + secs(0.2)).is_none());

        let update = c.tick(t0 + secs(0.6)).unwrap();
        assert_eq!(update.state, ActivityState::Waiting);
        assert_eq!(update.last_output, "Proceed? [y/n]");

        // Waiting does not decay to idle.
        assert!(c.tick(t0 + secs(30.0)).is_none());
        assert_eq!(c.state(), ActivityState::Waiting);
    }

    #[test]
    fn test_plain_output_always_ends_idle_never_error() {
        let sequences: Vec<Vec<&[u8]>> = vec![
            vec![b"compiling\n"],
            vec![b"a", b"b\n", b"\x1b[32mok\x1b[0m\n"],
            vec![b"line one\r\nline two\r\n", b"partial tail"],
            vec![b"\xe2\x9c\x93 done\n", b"\n\n"],
        ];

        for chunks in sequences {
            let t0 = Instant::now();
            let mut c = classifier();
            let mut states = Vec::new();
            for (i, chunk) in chunks.iter().enumerate() {
                let at = t0 + secs(i as f64 * 0.1);
                states.extend(c.feed(chunk, at).map(|s| s.state));
                states.extend(c.tick(at).map(|s| s.state));
            }
            for step in 1..=20 {
                states.extend(c.tick(t0 + secs(step as f64)).map(|s| s.state));
            }
            assert!(!states.contains(&ActivityState::Error), "{:?}", states);
            assert_eq!(c.state(), ActivityState::Idle, "{:?}", chunks);
        }
    }

    #[test]
    fn test_partial_line_does_not_transition_early() {
        let t0 = Instant::now();
        let mut c = classifier();
        assert!(c.feed(b"Error: disk", t0).is_none());
        assert_eq!(c.state(), ActivityState::Unknown);

        // Completed before the flush timeout; the whole line is classified.
        let update = c.feed(b" full\n", t0 + secs(0.1)).unwrap();
        assert_eq!(update.state, ActivityState::Error);
        assert_eq!(update.last_output, "Error: disk full");
    }

    #[test]
    fn test_last_line_in_chunk_wins() {
        let t0 = Instant::now();
        let mut c = classifier();
        let update = c
            .feed(b"Error: transient\nretrying\nDo you want to continue?\n", t0)
            .unwrap();
        assert_eq!(update.state, ActivityState::Waiting);
        assert_eq!(update.last_output, "Do you want to continue?");
    }

    #[test]
    fn test_ansi_is_stripped_before_matching() {
        let t0 = Instant::now();
        let mut c = classifier();
        let update = c.feed(b"\x1b[1;31mError:\x1b[0m boom\r\n", t0).unwrap();
        assert_eq!(update.state, ActivityState::Error);
        assert_eq!(update.last_output, "Error: boom");
    }

    #[test]
    fn test_carriage_return_redraw_is_a_boundary() {
        let t0 = Instant::now();
        let mut c = classifier();
        let update = c.feed(b"\xe2\xa0\x8b Thinking\r\xe2\xa0\x99 Thinking\r", t0).unwrap();
        assert_eq!(update.state, ActivityState::Working);
        // The trailing "\r" is held until we know whether "\n" follows.
        assert_eq!(c.snippet(), "⠋ Thinking");
    }

    #[test]
    fn test_idle_returns_to_working_on_output() {
        let t0 = Instant::now();
        let mut c = classifier();
        c.feed(b"building\n", t0);
        assert_eq!(c.tick(t0 + secs(5.0)).unwrap().state, ActivityState::Idle);

        let update = c.feed(b"more output\n", t0 + secs(9.0)).unwrap();
        assert_eq!(update.state, ActivityState::Working);
    }

    #[test]
    fn test_new_output_resets_inactivity_timer() {
        let t0 = Instant::now();
        let mut c = classifier();
        c.feed(b"step 1\n", t0);
        c.feed(b"step 2\n", t0 + secs(4.0));
        assert!(c.tick(t0 + secs(6.0)).is_none());
        assert_eq!(c.state(), ActivityState::Working);
        assert_eq!(c.tick(t0 + secs(9.0)).unwrap().state, ActivityState::Idle);
    }

    #[test]
    fn test_growing_partial_line_keeps_working() {
        let t0 = Instant::now();
        let mut c = classifier();
        c.feed(b"downloading\n", t0);
        c.feed(b"[=====", t0 + secs(3.0));
        c.feed(b"=====", t0 + secs(6.0));
        // The partial is flushed here and counts as activity at 6s.
        assert!(c.tick(t0 + secs(7.0)).is_some());
        assert_eq!(c.state(), ActivityState::Working);
        assert_eq!(c.tick(t0 + secs(11.5)).unwrap().state, ActivityState::Idle);
    }

    #[test]
    fn test_invisible_bytes_do_not_count_as_activity() {
        let t0 = Instant::now();
        let mut c = classifier();
        c.feed(b"work\n", t0);
        // Cursor blink sequences only.
        c.feed(b"\x1b[?25l", t0 + secs(2.0));
        c.feed(b"\x1b[?25h", t0 + secs(4.0));
        assert_eq!(c.tick(t0 + secs(5.0)).unwrap().state, ActivityState::Idle);
    }

    #[test]
    fn test_unterminated_flood_keeps_previous_state() {
        let t0 = Instant::now();
        let mut c = classifier();
        c.feed(b"> \n", t0);
        assert_eq!(c.state(), ActivityState::Waiting);

        let flood = vec![b'x'; 100];
        assert!(c.feed(&flood, t0 + secs(1.0)).is_none());
        assert_eq!(c.state(), ActivityState::Waiting);
        // Nothing left to flush.
        assert!(c.tick(t0 + secs(3.0)).is_none());
        assert_eq!(c.state(), ActivityState::Waiting);
    }

    #[test]
    fn test_snippet_only_writes_are_throttled() {
        let t0 = Instant::now();
        let mut c = classifier();
        assert!(c.feed(b"one\n", t0).is_some());
        assert!(c.feed(b"two\n", t0 + secs(0.2)).is_none());
        let update = c.feed(b"three\n", t0 + secs(1.5)).unwrap();
        assert_eq!(update.state, ActivityState::Working);
        assert_eq!(update.last_output, "three");
    }

    #[test]
    fn test_throttled_snippet_is_written_on_a_later_tick() {
        let t0 = Instant::now();
        let mut c = classifier();
        let first = c.feed(b"Error: first\n", t0).unwrap();
        assert_eq!(first.last_output, "Error: first");
        assert!(c.feed(b"Error: second\n", t0 + secs(0.2)).is_none());
        assert!(c.tick(t0 + secs(0.5)).is_none());

        // Error never decays, so only the refresh can carry the newer line.
        let update = c.tick(t0 + secs(1.1)).unwrap();
        assert_eq!(update.state, ActivityState::Error);
        assert_eq!(update.last_output, "Error: second");
        assert!(c.tick(t0 + secs(30.0)).is_none());
    }

    #[test]
    fn test_snippet_is_bounded() {
        let t0 = Instant::now();
        let mut c = Classifier::from_config(&ClassifierConfig {
            snippet_max_chars: 5,
            ..config()
        })
        .unwrap();
        let update = c.feed("héllo wörld\n".as_bytes(), t0).unwrap();
        assert_eq!(update.last_output, "héllo");
    }

    #[test]
    fn test_clean_exit_is_terminal() {
        let t0 = Instant::now();
        let mut c = classifier();
        c.feed(b"bye\n", t0);
        let last = c.finish(ExitOutcome::Clean, t0 + secs(1.0));
        assert_eq!(last.state, ActivityState::Exited);
        assert!(c.is_finished());

        assert!(c.feed(b"Error: late\n", t0 + secs(2.0)).is_none());
        assert!(c.tick(t0 + secs(60.0)).is_none());
        assert_eq!(c.state(), ActivityState::Exited);
    }

    #[test]
    fn test_abnormal_exit_is_error() {
        let t0 = Instant::now();
        let mut c = classifier();
        c.feed(b"working\n", t0);
        let last = c.finish(ExitOutcome::from_code(2), t0 + secs(1.0));
        assert_eq!(last.state, ActivityState::Error);
        assert_eq!(last.last_output, "process exited with status 2");

        let mut killed = classifier();
        let last = killed.finish(ExitOutcome::Failed { code: None }, t0);
        assert_eq!(last.state, ActivityState::Error);
    }
}
