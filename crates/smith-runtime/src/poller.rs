//! Orchestrator: the top-level poll loop and per-issue state machine.
//!
//! Issues are processed one at a time, fully serialized end to end, so no
//! two issues ever mutate the target repository concurrently. One issue's
//! failure never aborts the cycle; it is logged, commented where a terminal
//! outcome was reached, and revisited on the next cycle.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use smith_github::{
    branch_name_for_issue, issue_number_from_pull_request, render_issue_reference, AgentIdentity,
    GithubClient, Issue, PullRequest, PullRequestCreated,
};

use crate::engine::{ProcessingOutcome, ProcessingTask, TaskExecutionEngine, TaskOutcomeKind};
use crate::ledger::{CommentCheckpoint, ProcessedLedger};
use crate::session::SessionStore;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub label: String,
    pub base_branch: String,
    pub poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            label: "ai-agent".to_string(),
            base_branch: "main".to_string(),
            poll_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCycleReport {
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub follow_ups: usize,
}

pub struct IssuePoller {
    gateway: GithubClient,
    engine: TaskExecutionEngine,
    identity: AgentIdentity,
    config: PollerConfig,
    ledger: ProcessedLedger,
    checkpoint: CommentCheckpoint,
    sessions: SessionStore,
}

impl IssuePoller {
    pub fn new(
        gateway: GithubClient,
        engine: TaskExecutionEngine,
        identity: AgentIdentity,
        config: PollerConfig,
    ) -> Self {
        Self {
            gateway,
            engine,
            identity,
            config,
            ledger: ProcessedLedger::new(),
            checkpoint: CommentCheckpoint::starting_now(),
            sessions: SessionStore::new(),
        }
    }

    pub fn ledger(&self) -> &ProcessedLedger {
        &self.ledger
    }

    /// One full poll cycle: discovery, per-issue processing, then the
    /// follow-up comment scan.
    pub async fn run_cycle(&mut self) -> Result<PollCycleReport> {
        let mut report = PollCycleReport::default();

        let issues = self
            .gateway
            .list_labeled_issues(&self.config.label)
            .await
            .context("failed to list labeled issues")?;
        report.discovered = issues.len();

        let open_prs = self
            .gateway
            .list_open_pull_requests()
            .await
            .context("failed to list open pull requests")?;

        for issue in issues {
            if self.ledger.contains(issue.number) {
                report.skipped += 1;
                continue;
            }
            // An open PR whose back-reference resolves to this issue is
            // evidence of prior completion, possibly from a previous process
            // run; fold it into the ledger instead of re-processing.
            if let Some(existing) = open_prs.iter().find(|pr| {
                issue_number_from_pull_request(&pr.title, pr.body.as_deref().unwrap_or(""))
                    == Some(issue.number)
            }) {
                tracing::info!(
                    issue = issue.number,
                    pr = existing.number,
                    "open pull request already references issue, skipping"
                );
                self.ledger.record(
                    issue.number,
                    existing.head.branch.clone(),
                    Some(existing.number),
                );
                report.skipped += 1;
                continue;
            }

            let issue_number = issue.number;
            match self.process_issue(issue).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.failed += 1,
                Err(error) => {
                    tracing::warn!(
                        issue = issue_number,
                        error = %format!("{error:#}"),
                        "issue processing failed, will retry next cycle"
                    );
                    report.failed += 1;
                }
            }
        }

        match self.scan_follow_ups().await {
            Ok(count) => report.follow_ups = count,
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "follow-up scan failed");
            }
        }

        tracing::info!(
            discovered = report.discovered,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            follow_ups = report.follow_ups,
            "poll cycle complete"
        );
        Ok(report)
    }

    pub async fn run_once(&mut self) -> Result<PollCycleReport> {
        self.run_cycle().await
    }

    /// Polls on the configured interval until a shutdown signal arrives.
    /// A failed cycle is logged and the loop continues.
    pub async fn run_daemon(&mut self) -> Result<()> {
        loop {
            if let Err(error) = self.run_cycle().await {
                tracing::warn!(error = %format!("{error:#}"), "poll cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for shutdown signal")?;
                    tracing::info!("shutdown signal received, stopping poller");
                    return Ok(());
                }
            }
        }
    }

    /// Drives one issue through branch → execute → PR → comment. Returns
    /// `Ok(true)` when a PR was opened and the ledger updated. A terminal
    /// outcome posts exactly one comment on the issue; transient gateway or
    /// provider errors propagate without commenting so the issue is retried
    /// on a later cycle.
    async fn process_issue(&mut self, issue: Issue) -> Result<bool> {
        let issue_number = issue.number;
        let branch_name = branch_name_for_issue(issue_number);
        self.gateway
            .create_branch(&branch_name, &self.config.base_branch)
            .await
            .with_context(|| format!("failed to ensure branch {branch_name}"))?;

        let issue_title = issue.title.clone();
        let task = ProcessingTask::for_issue(issue);
        let outcome = self
            .engine
            .execute(&self.gateway, &task, &mut self.sessions)
            .await?;

        if !outcome.is_success() {
            let diagnostic = diagnostic_for_outcome(&outcome);
            self.post_issue_comment(issue_number, &diagnostic).await;
            return Ok(false);
        }

        let title = format!("Resolve issue #{issue_number}: {issue_title}");
        let body = pull_request_body(issue_number, &outcome);
        match self
            .gateway
            .open_pull_request(&title, &body, &branch_name, &self.config.base_branch)
            .await
            .context("failed to open pull request")?
        {
            PullRequestCreated::Created(pr) => {
                let link = pr
                    .html_url
                    .clone()
                    .unwrap_or_else(|| format!("pull request #{}", pr.number));
                let comment = format!(
                    "Opened {link} with the proposed changes.\n\n{}",
                    outcome.summary_text
                );
                self.post_issue_comment(issue_number, &comment).await;
                self.ledger
                    .record(issue_number, branch_name, Some(pr.number));
                Ok(true)
            }
            PullRequestCreated::NoDiff => {
                let comment = format!(
                    "The run completed but branch `{branch_name}` has no diff against \
                     `{}`, so no pull request was opened. The requested change may \
                     already be in place.",
                    self.config.base_branch
                );
                self.post_issue_comment(issue_number, &comment).await;
                Ok(false)
            }
        }
    }

    /// Scans open PRs for fresh non-agent comments and re-executes the
    /// originating issue with those comments as additional context, on the
    /// same branch. Comment ids are marked seen per handled PR, and the
    /// fetch-window bound advances only after a scan in which every PR was
    /// listed and handled, so a failed PR's comments are retried next cycle
    /// instead of falling behind the checkpoint.
    async fn scan_follow_ups(&mut self) -> Result<usize> {
        let since = self.checkpoint.since_rfc3339();
        let scan_started = Utc::now();

        let open_prs = self
            .gateway
            .list_open_pull_requests()
            .await
            .context("failed to list open pull requests")?;

        let mut reprocessed = 0usize;
        let mut scan_clean = true;
        for pr in open_prs {
            let comments = match self.gateway.list_comments_since(pr.number, &since).await {
                Ok(comments) => comments,
                Err(error) => {
                    tracing::warn!(
                        pr = pr.number,
                        error = %format!("{error:#}"),
                        "failed to list pull request comments, will rescan next cycle"
                    );
                    scan_clean = false;
                    continue;
                }
            };
            let newest_id = comments.iter().map(|comment| comment.id).max();
            let fresh: Vec<String> = comments
                .iter()
                .filter(|comment| self.checkpoint.is_new_comment(comment.id))
                .filter(|comment| !self.identity.is_agent_authored(&comment.user.login))
                .filter_map(|comment| comment.body.clone())
                .filter(|body| !body.trim().is_empty())
                .collect();
            if fresh.is_empty() {
                if let Some(id) = newest_id {
                    self.checkpoint.mark_comment_seen(id);
                }
                continue;
            }

            let Some(issue_number) =
                issue_number_from_pull_request(&pr.title, pr.body.as_deref().unwrap_or(""))
            else {
                tracing::warn!(
                    pr = pr.number,
                    "cannot resolve originating issue for pull request, skipping follow-up"
                );
                // An unresolvable back-reference never resolves later, so
                // its comments are marked seen rather than refetched forever.
                if let Some(id) = newest_id {
                    self.checkpoint.mark_comment_seen(id);
                }
                continue;
            };

            let additional_context = fresh.join("\n\n");
            match self
                .reprocess_follow_up(&pr, issue_number, additional_context)
                .await
            {
                Ok(()) => {
                    reprocessed += 1;
                    if let Some(id) = newest_id {
                        self.checkpoint.mark_comment_seen(id);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        pr = pr.number,
                        issue = issue_number,
                        error = %format!("{error:#}"),
                        "follow-up re-processing failed, will retry next cycle"
                    );
                    scan_clean = false;
                }
            }
        }

        if scan_clean {
            self.checkpoint.advance_to(scan_started);
        }
        Ok(reprocessed)
    }

    async fn reprocess_follow_up(
        &mut self,
        pr: &PullRequest,
        issue_number: u64,
        additional_context: String,
    ) -> Result<()> {
        let issue = self
            .gateway
            .get_issue(issue_number)
            .await
            .context("failed to fetch originating issue")?;
        let task = ProcessingTask::for_issue(issue)
            .with_additional_context(additional_context)
            .with_branch(pr.head.branch.clone());
        let outcome = self
            .engine
            .execute(&self.gateway, &task, &mut self.sessions)
            .await?;

        if outcome.is_success() {
            let note = format!(
                "Updated branch `{}` in response to new comments; pull request #{} \
                 now carries the changes.\n\n{}",
                pr.head.branch, pr.number, outcome.summary_text
            );
            self.post_issue_comment(issue_number, &note).await;
            if let Err(error) = self.gateway.comment_on_pull_request(pr.number, &note).await {
                tracing::warn!(
                    pr = pr.number,
                    error = %format!("{error:#}"),
                    "failed to comment on pull request"
                );
            }
            self.ledger
                .record(issue_number, pr.head.branch.clone(), Some(pr.number));
        } else {
            let diagnostic = diagnostic_for_outcome(&outcome);
            if let Err(error) = self
                .gateway
                .comment_on_pull_request(pr.number, &diagnostic)
                .await
            {
                tracing::warn!(
                    pr = pr.number,
                    error = %format!("{error:#}"),
                    "failed to comment on pull request"
                );
            }
        }
        Ok(())
    }

    async fn post_issue_comment(&self, issue_number: u64, text: &str) {
        if let Err(error) = self.gateway.comment_on_issue(issue_number, text).await {
            tracing::warn!(
                issue = issue_number,
                error = %format!("{error:#}"),
                "failed to comment on issue"
            );
        }
    }
}

fn pull_request_body(issue_number: u64, outcome: &ProcessingOutcome) -> String {
    let mut body = format!(
        "{}\n\n{}\n",
        render_issue_reference(issue_number),
        outcome.summary_text
    );
    if !outcome.files_changed.is_empty() {
        body.push_str("\n### Files changed\n");
        for path in &outcome.files_changed {
            body.push_str(&format!("- `{path}`\n"));
        }
    }
    body
}

fn diagnostic_for_outcome(outcome: &ProcessingOutcome) -> String {
    match &outcome.kind {
        TaskOutcomeKind::NoChangesProduced => format!(
            "The run finished without producing any file changes, so no pull \
             request was opened. The task may have been misunderstood or already \
             satisfied.\n\nRun summary: {}",
            outcome.summary_text
        ),
        TaskOutcomeKind::BudgetExceeded => format!(
            "The run was stopped after reaching its execution budget before \
             completing the task ({}). No pull request was opened; the issue will \
             be retried on a later poll cycle while the label remains.",
            outcome.summary_text
        ),
        TaskOutcomeKind::ToolExecutionFailed { tool_name, error } => format!(
            "A repository operation failed during the run (tool `{tool_name}`): \
             {error}\n\nNo pull request was opened; the issue will be retried on a \
             later poll cycle while the label remains."
        ),
        TaskOutcomeKind::Success => outcome.summary_text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{diagnostic_for_outcome, IssuePoller, PollerConfig};
    use crate::engine::{EngineConfig, ProcessingOutcome, TaskExecutionEngine, TaskOutcomeKind};
    use async_trait::async_trait;
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use smith_ai::{
        AiError, ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message,
    };
    use smith_github::{AgentIdentity, GithubClient, RepoRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replays a fixed sequence of assistant messages, one per model call.
    struct ScriptedClient {
        script: Mutex<Vec<Message>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<Message>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(AiError::InvalidResponse(
                    "scripted client ran out of messages".to_string(),
                ));
            }
            Ok(ChatResponse {
                message: script.remove(0),
                finish_reason: None,
                usage: ChatUsage::default(),
            })
        }
    }

    fn tool_call(id: &str, name: &str, arguments: Value) -> Message {
        Message::assistant_blocks(vec![ContentBlock::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }])
    }

    fn poller_for(server: &MockServer, client: Arc<ScriptedClient>) -> IssuePoller {
        let gateway = GithubClient::new(
            server.base_url(),
            "test-token".to_string(),
            RepoRef::parse("owner/repo").unwrap(),
            2_000,
            1,
            1,
        )
        .unwrap();
        let engine = TaskExecutionEngine::new(client, EngineConfig::default());
        let identity = AgentIdentity::new(Some("issuesmith".to_string()), Vec::new());
        IssuePoller::new(
            gateway,
            engine,
            identity,
            PollerConfig {
                poll_interval: Duration::from_millis(1),
                ..PollerConfig::default()
            },
        )
    }

    fn issue_json(number: u64, title: &str, body: &str) -> Value {
        json!({
            "id": number,
            "number": number,
            "title": title,
            "body": body,
            "user": { "login": "alice" },
            "labels": [{ "name": "ai-agent" }],
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        })
    }

    fn pull_request_json(number: u64, body: &str, head: &str) -> Value {
        json!({
            "number": number,
            "title": format!("Resolve issue: PR {number}"),
            "body": body,
            "html_url": format!("https://example.invalid/pull/{number}"),
            "head": { "ref": head },
            "base": { "ref": "main" }
        })
    }

    async fn mock_branch_setup(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/git/ref/heads/main");
                then.status(200)
                    .json_body(json!({ "object": { "sha": "basesha" } }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/git/refs");
                then.status(201).json_body(json!({ "ref": "created" }));
            })
            .await;
    }

    #[tokio::test]
    async fn integration_issue_flows_from_discovery_to_pull_request_and_ledger() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/owner/repo/issues")
                    .query_param("labels", "ai-agent");
                then.status(200)
                    .json_body(json!([issue_json(91, "Create TEST.md", "write a short note")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/pulls");
                then.status(200).json_body(json!([]));
            })
            .await;
        mock_branch_setup(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/contents/TEST.md");
                then.status(404).json_body(json!({ "message": "Not Found" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/repos/owner/repo/contents/TEST.md");
                then.status(201).json_body(json!({ "commit": { "sha": "c1" } }));
            })
            .await;
        let open_pr = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/owner/repo/pulls")
                    .json_body_includes(json!({ "head": "smith/issue-91" }).to_string())
                    .body_includes("Resolves #91");
                then.status(201)
                    .json_body(pull_request_json(92, "Resolves #91", "smith/issue-91"));
            })
            .await;
        let issue_comment = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/owner/repo/issues/91/comments")
                    .body_includes("pull/92");
                then.status(201)
                    .json_body(json!({ "id": 1, "html_url": "https://example.invalid/c1" }));
            })
            .await;

        let client = ScriptedClient::new(vec![
            tool_call(
                "1",
                "create_files",
                json!({ "files": [{ "filename": "TEST.md", "file_content": "a short note" }] }),
            ),
            Message::assistant_text("Created TEST.md with a short note."),
        ]);
        let mut poller = poller_for(&server, client);

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let entry = poller.ledger().get(91).unwrap();
        assert_eq!(entry.branch_name, "smith/issue-91");
        assert_eq!(entry.pr_number, Some(92));

        open_pr.assert_async().await;
        assert_eq!(issue_comment.hits_async().await, 1);
    }

    #[tokio::test]
    async fn integration_no_op_run_posts_one_diagnostic_and_opens_no_pr() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/owner/repo/issues")
                    .query_param("labels", "ai-agent");
                then.status(200)
                    .json_body(json!([issue_json(14, "Do nothing", "unactionable")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/pulls");
                then.status(200).json_body(json!([]));
            })
            .await;
        mock_branch_setup(&server).await;
        let pr_create = server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/pulls");
                then.status(500);
            })
            .await;
        let issue_comment = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/owner/repo/issues/14/comments")
                    .body_includes("without producing any file changes");
                then.status(201)
                    .json_body(json!({ "id": 2, "html_url": "https://example.invalid/c2" }));
            })
            .await;

        let client =
            ScriptedClient::new(vec![Message::assistant_text("I cannot act on this issue.")]);
        let mut poller = poller_for(&server, client);

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 1);
        assert!(poller.ledger().is_empty());
        assert_eq!(pr_create.hits_async().await, 0);
        assert_eq!(issue_comment.hits_async().await, 1);
    }

    #[tokio::test]
    async fn integration_follow_up_comment_reprocesses_on_the_existing_branch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/owner/repo/issues")
                    .query_param("labels", "ai-agent");
                then.status(200).json_body(json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/pulls");
                then.status(200)
                    .json_body(json!([pull_request_json(92, "Resolves #91", "smith/issue-91")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/92/comments");
                then.status(200).json_body(json!([
                    {
                        "id": 500,
                        "body": "Opened a pull request earlier.",
                        "user": { "login": "issuesmith" },
                        "created_at": "2099-01-01T00:00:00Z",
                        "updated_at": "2099-01-01T00:00:00Z"
                    },
                    {
                        "id": 501,
                        "body": "also add a second section",
                        "user": { "login": "alice" },
                        "created_at": "2099-01-01T00:00:01Z",
                        "updated_at": "2099-01-01T00:00:01Z"
                    }
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/91");
                then.status(200)
                    .json_body(issue_json(91, "Create TEST.md", "write a short note"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/contents/TEST.md");
                then.status(200).json_body(json!({ "sha": "oldsha" }));
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/repos/owner/repo/contents/TEST.md")
                    .json_body_includes(json!({ "branch": "smith/issue-91" }).to_string());
                then.status(200).json_body(json!({ "commit": { "sha": "c2" } }));
            })
            .await;
        let pr_create = server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/pulls");
                then.status(500);
            })
            .await;
        let issue_comment = server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/issues/91/comments");
                then.status(201)
                    .json_body(json!({ "id": 3, "html_url": "https://example.invalid/c3" }));
            })
            .await;
        let pr_comment = server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/issues/92/comments");
                then.status(201)
                    .json_body(json!({ "id": 4, "html_url": "https://example.invalid/c4" }));
            })
            .await;

        let client = ScriptedClient::new(vec![
            tool_call(
                "1",
                "edit_file",
                json!({ "filename": "TEST.md", "file_content": "note\n\n## Second section\n" }),
            ),
            Message::assistant_text("Added the requested second section."),
        ]);
        let mut poller = poller_for(&server, client);

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.follow_ups, 1);
        assert_eq!(report.processed, 0);

        // Re-processing reuses branch smith/issue-91 and PR #92.
        update.assert_async().await;
        assert_eq!(pr_create.hits_async().await, 0);
        assert_eq!(issue_comment.hits_async().await, 1);
        assert_eq!(pr_comment.hits_async().await, 1);
        assert_eq!(poller.ledger().get(91).unwrap().pr_number, Some(92));
    }

    #[tokio::test]
    async fn functional_open_pr_back_reference_short_circuits_discovery() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/owner/repo/issues")
                    .query_param("labels", "ai-agent");
                then.status(200)
                    .json_body(json!([issue_json(91, "Create TEST.md", "write a short note")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/pulls");
                then.status(200)
                    .json_body(json!([pull_request_json(92, "Resolves #91", "smith/issue-91")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/92/comments");
                then.status(200).json_body(json!([]));
            })
            .await;

        // The scripted client has no messages: any model call would fail the
        // cycle, proving the engine is never invoked.
        let client = ScriptedClient::new(Vec::new());
        let mut poller = poller_for(&server, client.clone());

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(poller.ledger().get(91).unwrap().pr_number, Some(92));
    }

    #[tokio::test]
    async fn regression_unresolvable_back_reference_is_skipped_never_guessed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/owner/repo/issues")
                    .query_param("labels", "ai-agent");
                then.status(200).json_body(json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/pulls");
                // Two conflicting bare references and no explicit token.
                then.status(200).json_body(json!([
                    pull_request_json(40, "see #7 and #8", "feature-branch")
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/40/comments");
                then.status(200).json_body(json!([
                    {
                        "id": 600,
                        "body": "please update",
                        "user": { "login": "alice" },
                        "created_at": "2099-01-01T00:00:00Z",
                        "updated_at": "2099-01-01T00:00:00Z"
                    }
                ]));
            })
            .await;

        let client = ScriptedClient::new(Vec::new());
        let mut poller = poller_for(&server, client.clone());

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.follow_ups, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn regression_comment_listing_failure_defers_checkpoint_until_retry() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/owner/repo/issues")
                    .query_param("labels", "ai-agent");
                then.status(200).json_body(json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/pulls");
                then.status(200)
                    .json_body(json!([pull_request_json(92, "Resolves #91", "smith/issue-91")]));
            })
            .await;
        let mut comments_down = server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/92/comments");
                then.status(500);
            })
            .await;

        let client = ScriptedClient::new(vec![
            tool_call(
                "1",
                "edit_file",
                json!({ "filename": "TEST.md", "file_content": "note, revised" }),
            ),
            Message::assistant_text("Applied the requested revision."),
        ]);
        let mut poller = poller_for(&server, client.clone());

        // First cycle: the comments endpoint is down, so no follow-up runs
        // and no model call is made.
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.follow_ups, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        // The endpoint recovers and serves a human comment that predates the
        // poller's start time; it must still be picked up on the next cycle.
        comments_down.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/92/comments");
                then.status(200).json_body(json!([
                    {
                        "id": 501,
                        "body": "please also revise the note",
                        "user": { "login": "alice" },
                        "created_at": "2001-01-01T00:00:00Z",
                        "updated_at": "2001-01-01T00:00:00Z"
                    }
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/91");
                then.status(200)
                    .json_body(issue_json(91, "Create TEST.md", "write a short note"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/contents/TEST.md");
                then.status(200).json_body(json!({ "sha": "oldsha" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/repos/owner/repo/contents/TEST.md");
                then.status(200).json_body(json!({ "commit": { "sha": "c2" } }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/issues/91/comments");
                then.status(201)
                    .json_body(json!({ "id": 5, "html_url": "https://example.invalid/c5" }));
            })
            .await;
        let pr_comment = server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/issues/92/comments");
                then.status(201)
                    .json_body(json!({ "id": 6, "html_url": "https://example.invalid/c6" }));
            })
            .await;

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.follow_ups, 1);
        assert_eq!(pr_comment.hits_async().await, 1);
        assert_eq!(poller.ledger().get(91).unwrap().pr_number, Some(92));
    }

    #[tokio::test]
    async fn regression_follow_up_comments_deduplicate_by_id_not_timestamp() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/owner/repo/issues")
                    .query_param("labels", "ai-agent");
                then.status(200).json_body(json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/pulls");
                then.status(200)
                    .json_body(json!([pull_request_json(92, "Resolves #91", "smith/issue-91")]));
            })
            .await;
        // Both comments share one created_at second and predate the poller's
        // start. Every cycle re-serves the same rows.
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/92/comments");
                then.status(200).json_body(json!([
                    {
                        "id": 500,
                        "body": "Opened a pull request earlier.",
                        "user": { "login": "issuesmith" },
                        "created_at": "2001-01-01T00:00:00Z",
                        "updated_at": "2001-01-01T00:00:00Z"
                    },
                    {
                        "id": 501,
                        "body": "also add a second section",
                        "user": { "login": "alice" },
                        "created_at": "2001-01-01T00:00:00Z",
                        "updated_at": "2001-01-01T00:00:00Z"
                    }
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/issues/91");
                then.status(200)
                    .json_body(issue_json(91, "Create TEST.md", "write a short note"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/contents/TEST.md");
                then.status(200).json_body(json!({ "sha": "oldsha" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/repos/owner/repo/contents/TEST.md");
                then.status(200).json_body(json!({ "commit": { "sha": "c2" } }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/issues/91/comments");
                then.status(201)
                    .json_body(json!({ "id": 7, "html_url": "https://example.invalid/c7" }));
            })
            .await;
        let pr_comment = server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/owner/repo/issues/92/comments");
                then.status(201)
                    .json_body(json!({ "id": 8, "html_url": "https://example.invalid/c8" }));
            })
            .await;

        let client = ScriptedClient::new(vec![
            tool_call(
                "1",
                "edit_file",
                json!({ "filename": "TEST.md", "file_content": "note\n\n## Second section\n" }),
            ),
            Message::assistant_text("Added the requested second section."),
        ]);
        let mut poller = poller_for(&server, client.clone());

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.follow_ups, 1);

        // The same rows come back on the next cycle; nothing is re-run.
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.follow_ups, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pr_comment.hits_async().await, 1);
    }

    #[test]
    fn unit_diagnostics_name_the_failure_mode() {
        let no_changes = ProcessingOutcome {
            kind: TaskOutcomeKind::NoChangesProduced,
            files_changed: Vec::new(),
            summary_text: "nothing applied".to_string(),
        };
        assert!(diagnostic_for_outcome(&no_changes).contains("without producing any file changes"));

        let budget = ProcessingOutcome {
            kind: TaskOutcomeKind::BudgetExceeded,
            files_changed: Vec::new(),
            summary_text: "agent exceeded max turns (20)".to_string(),
        };
        assert!(diagnostic_for_outcome(&budget).contains("execution budget"));

        let tool_failed = ProcessingOutcome {
            kind: TaskOutcomeKind::ToolExecutionFailed {
                tool_name: "edit_file".to_string(),
                error: "write rejected".to_string(),
            },
            files_changed: Vec::new(),
            summary_text: String::new(),
        };
        let text = diagnostic_for_outcome(&tool_failed);
        assert!(text.contains("edit_file"));
        assert!(text.contains("write rejected"));
    }
}
