//! Deterministic branch naming and the PR↔issue back-reference token.

use regex::Regex;
use std::sync::OnceLock;

const BRANCH_PREFIX: &str = "smith/issue-";

/// Branch name derived solely from the issue number, so repeated processing
/// of the same issue converges on one branch.
pub fn branch_name_for_issue(issue_number: u64) -> String {
    format!("{BRANCH_PREFIX}{issue_number}")
}

/// Back-reference token embedded in every PR body this system creates.
pub fn render_issue_reference(issue_number: u64) -> String {
    format!("Resolves #{issue_number}")
}

fn resolves_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)resolves\s+#(\d+)").expect("valid regex"))
}

fn issue_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#(\d+)").expect("valid regex"))
}

/// Resolves the originating issue number from a PR's title and body.
///
/// The explicit `Resolves #N` token wins. Without it, a bare `#N` reference
/// is accepted only when every reference in the title and body names the
/// same number; anything ambiguous yields `None` so callers skip rather
/// than guess.
pub fn issue_number_from_pull_request(title: &str, body: &str) -> Option<u64> {
    for text in [body, title] {
        if let Some(captures) = resolves_pattern().captures(text) {
            if let Ok(number) = captures[1].parse::<u64>() {
                return Some(number);
            }
        }
    }

    let mut candidate: Option<u64> = None;
    for text in [title, body] {
        for captures in issue_ref_pattern().captures_iter(text) {
            let Ok(number) = captures[1].parse::<u64>() else {
                continue;
            };
            match candidate {
                None => candidate = Some(number),
                Some(existing) if existing == number => {}
                Some(_) => return None,
            }
        }
    }
    candidate
}
