use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::ActivityState;
use crate::config::RuleConfig;

/// OSC, CSI, charset designation, other two-byte escapes, then bare controls.
static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b\[[0-?]*[ -/]*[@-~]|\x1b[()*+][0-9A-Za-z]|\x1b[ -~]?|[\x00-\x08\x0b-\x1f\x7f]",
    )
    .unwrap()
});

/// Strip ANSI escape sequences and control characters, keeping visible text
/// and tabs.
pub fn strip_ansi(input: &str) -> String {
    RE_ANSI.replace_all(input, "").into_owned()
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid pattern for rule '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// A single entry of the classification table.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub pattern: Regex,
    pub state: ActivityState,
}

/// Ordered table of (pattern, state) pairs. The first rule whose pattern
/// matches a visible line decides that line's state.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Compile the configured table.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, RuleError> {
        let rules = configs
            .iter()
            .map(|config| {
                let pattern =
                    Regex::new(&config.pattern).map_err(|source| RuleError::InvalidPattern {
                        name: config.name.clone(),
                        source,
                    })?;
                Ok(Rule {
                    name: config.name.clone(),
                    pattern,
                    state: config.state,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        Ok(Self { rules })
    }

    /// First rule matching `line`, which must already be stripped and trimmed.
    pub fn matching(&self, line: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.pattern.is_match(line))
    }

    /// State implied by one visible line. `None` for blank lines, which never
    /// change state. Output matching no rule is still activity.
    pub fn classify(&self, line: &str) -> Option<ActivityState> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(
            self.matching(line)
                .map(|rule| rule.state)
                .unwrap_or(ActivityState::Working),
        )
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::compile(&crate::config::default_rules()).unwrap()
    }
}
