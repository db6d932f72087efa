//! Pattern-based classification of commenters as "the agent itself".
//!
//! Classification is purely textual on the login name: an exact match on the
//! configured bot login, the `[bot]` suffix convention, or any declared
//! substring. There is deliberately no identity lookup against the
//! authenticated-user endpoint, which is unreliable under
//! constrained-permission credentials. Known limitation: a human whose login
//! contains a matched substring is classified as the agent and their
//! follow-up comments are skipped; erring toward ignoring is the safe
//! direction, since the opposite mistake re-triggers processing on the
//! agent's own comments.

/// Declared allow-list/pattern set for self-comment classification.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    bot_login: Option<String>,
    patterns: Vec<String>,
}

const DEFAULT_PATTERNS: [&str; 3] = ["issuesmith", "ai-agent", "smith-bot"];

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            bot_login: None,
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl AgentIdentity {
    pub fn new(bot_login: Option<String>, extra_patterns: Vec<String>) -> Self {
        let mut identity = Self {
            bot_login: bot_login
                .map(|login| login.trim().to_string())
                .filter(|login| !login.is_empty()),
            ..Self::default()
        };
        identity.patterns.extend(
            extra_patterns
                .into_iter()
                .map(|pattern| pattern.trim().to_ascii_lowercase())
                .filter(|pattern| !pattern.is_empty()),
        );
        identity
    }

    /// Pure, side-effect-free check; no network access.
    pub fn is_agent_authored(&self, author_login: &str) -> bool {
        let login = author_login.trim();
        if login.is_empty() {
            return false;
        }
        if let Some(bot_login) = self.bot_login.as_deref() {
            if login.eq_ignore_ascii_case(bot_login) {
                return true;
            }
        }
        let lowered = login.to_ascii_lowercase();
        if lowered.ends_with("[bot]") {
            return true;
        }
        self.patterns.iter().any(|pattern| lowered.contains(pattern))
    }
}
