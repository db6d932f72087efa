//! Repository gateway: the sole boundary to the GitHub REST API, plus the
//! pure helpers (agent-identity classification, branch naming, PR↔issue
//! back-references) the orchestration layer depends on.

mod client;
mod identity;
mod issue_link;
mod transport;
mod types;

pub use client::{BranchCreated, GithubClient, PullRequestCreated, RepoRef};
pub use identity::AgentIdentity;
pub use issue_link::{branch_name_for_issue, issue_number_from_pull_request, render_issue_reference};
pub use transport::{
    is_retryable_github_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};
pub use types::{
    CommentCreated, DirectoryEntry, DirectoryEntryKind, Issue, IssueComment, IssueLabel,
    PullRequest, User,
};
