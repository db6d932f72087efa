//! Per-run processed-state tracking.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

/// What one completed issue produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEntry {
    pub branch_name: String,
    pub pr_number: Option<u64>,
    pub processed_at: DateTime<Utc>,
}

/// Issue numbers that already produced a pull request during this process
/// run. Process-lifetime only; cross-restart idempotency comes from the
/// open-PR back-reference check during discovery.
#[derive(Debug, Default)]
pub struct ProcessedLedger {
    entries: BTreeMap<u64, ProcessedEntry>,
}

impl ProcessedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, issue_number: u64) -> bool {
        self.entries.contains_key(&issue_number)
    }

    pub fn get(&self, issue_number: u64) -> Option<&ProcessedEntry> {
        self.entries.get(&issue_number)
    }

    /// Records a completed issue. Re-recording replaces the prior entry,
    /// which only happens on an explicit follow-up re-trigger.
    pub fn record(&mut self, issue_number: u64, branch_name: String, pr_number: Option<u64>) {
        self.entries.insert(
            issue_number,
            ProcessedEntry {
                branch_name,
                pr_number,
                processed_at: Utc::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounds the next PR-comment scan. The timestamp only narrows the fetch
/// window; actual de-duplication is by comment id, so a comment posted
/// within the same second as a scan start is never dropped. Both are
/// monotonically non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentCheckpoint {
    last_checked: DateTime<Utc>,
    last_comment_id: u64,
}

impl CommentCheckpoint {
    pub fn starting_now() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(instant: DateTime<Utc>) -> Self {
        Self {
            last_checked: instant,
            last_comment_id: 0,
        }
    }

    /// RFC3339 rendering suitable for the `since` query parameter.
    pub fn since_rfc3339(&self) -> String {
        self.last_checked.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn is_new_comment(&self, comment_id: u64) -> bool {
        comment_id > self.last_comment_id
    }

    /// Marks a comment id as handled; ids at or below the mark are ignored
    /// on later scans. A lower id leaves the mark unchanged.
    pub fn mark_comment_seen(&mut self, comment_id: u64) {
        if comment_id > self.last_comment_id {
            self.last_comment_id = comment_id;
        }
    }

    /// Advances the fetch-window bound; an earlier instant leaves it
    /// unchanged. Callers advance only after a scan in which every PR was
    /// listed and handled, so comments behind a failed listing stay inside
    /// the next window.
    pub fn advance_to(&mut self, instant: DateTime<Utc>) {
        if instant > self.last_checked {
            self.last_checked = instant;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommentCheckpoint, ProcessedLedger};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn unit_ledger_records_each_issue_at_most_once() {
        let mut ledger = ProcessedLedger::new();
        assert!(!ledger.contains(91));

        ledger.record(91, "smith/issue-91".to_string(), Some(92));
        assert!(ledger.contains(91));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(91).unwrap().pr_number, Some(92));

        ledger.record(91, "smith/issue-91".to_string(), Some(93));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(91).unwrap().pr_number, Some(93));
    }

    #[test]
    fn unit_checkpoint_is_monotonically_non_decreasing() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let mut checkpoint = CommentCheckpoint::starting_at(start);
        assert_eq!(checkpoint.since_rfc3339(), "2026-01-01T12:00:00Z");

        checkpoint.advance_to(start - Duration::hours(1));
        assert_eq!(checkpoint.since_rfc3339(), "2026-01-01T12:00:00Z");

        checkpoint.advance_to(start + Duration::hours(1));
        assert_eq!(checkpoint.since_rfc3339(), "2026-01-01T13:00:00Z");
    }

    #[test]
    fn unit_checkpoint_deduplicates_comments_by_id() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let mut checkpoint = CommentCheckpoint::starting_at(start);
        assert!(checkpoint.is_new_comment(501));

        checkpoint.mark_comment_seen(501);
        assert!(!checkpoint.is_new_comment(501));
        assert!(!checkpoint.is_new_comment(400));
        // A comment posted within the same second is still new.
        assert!(checkpoint.is_new_comment(502));

        checkpoint.mark_comment_seen(400);
        assert!(checkpoint.is_new_comment(502));
    }
}
