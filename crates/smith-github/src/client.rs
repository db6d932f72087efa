//! Typed GitHub REST client with bounded retry.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::transport::{
    is_retryable_github_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};
use crate::types::{
    CommentCreated, DirectoryEntry, DirectoryEntryKind, Issue, IssueComment, PullRequest,
};

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (owner, name) = trimmed
            .split_once('/')
            .with_context(|| format!("invalid repository '{raw}', expected owner/repo"))?;
        let owner = owner.trim();
        let name = name.trim();
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            bail!("invalid repository '{raw}', expected owner/repo");
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn as_slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Outcome of `create_branch`. An existing branch is success, not an error,
/// so re-processing the same issue never aborts on the branch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCreated {
    Created,
    AlreadyExists,
}

/// Outcome of `open_pull_request`. `NoDiff` is the reportable, non-fatal
/// "nothing to merge" condition.
#[derive(Debug, Clone)]
pub enum PullRequestCreated {
    Created(PullRequest),
    NoDiff,
}

#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl GithubClient {
    pub fn new(
        api_base: String,
        token: String,
        repo: RepoRef,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("issuesmith"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        let auth_header = format!("Bearer {}", token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid github authorization header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create github api client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo,
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    fn repo_url(&self, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.repo.owner, self.repo.name, tail
        )
    }

    /// Open issues carrying `label`, excluding rows the API conflates with
    /// pull requests. Order is whatever the API returns, stable within one
    /// call.
    pub async fn list_labeled_issues(&self, label: &str) -> Result<Vec<Issue>> {
        let mut page = 1_u32;
        let mut rows = Vec::new();
        loop {
            let page_value = page.to_string();
            let chunk: Vec<Issue> = self
                .request_json("list issues", || {
                    self.http.get(self.repo_url("issues")).query(&[
                        ("state", "open"),
                        ("labels", label),
                        ("per_page", "100"),
                        ("page", page_value.as_str()),
                    ])
                })
                .await?;
            let chunk_len = chunk.len();
            rows.extend(chunk.into_iter().filter(|issue| issue.pull_request.is_none()));
            if chunk_len < PAGE_SIZE as usize {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(rows)
    }

    pub async fn get_issue(&self, issue_number: u64) -> Result<Issue> {
        self.request_json("get issue", || {
            self.http.get(self.repo_url(&format!("issues/{issue_number}")))
        })
        .await
    }

    /// Creates `name` from the tip of `from_branch`. A branch that already
    /// exists reports `AlreadyExists`, which callers treat as success.
    pub async fn create_branch(&self, name: &str, from_branch: &str) -> Result<BranchCreated> {
        #[derive(Deserialize)]
        struct GitRef {
            object: GitRefObject,
        }
        #[derive(Deserialize)]
        struct GitRefObject {
            sha: String,
        }

        let base_ref: GitRef = self
            .request_json("get base branch ref", || {
                self.http
                    .get(self.repo_url(&format!("git/ref/heads/{from_branch}")))
            })
            .await?;

        let payload = json!({
            "ref": format!("refs/heads/{name}"),
            "sha": base_ref.object.sha,
        });
        let (status, body) = self
            .send_with_retry("create branch", || {
                self.http.post(self.repo_url("git/refs")).json(&payload)
            })
            .await?;
        if status.is_success() {
            return Ok(BranchCreated::Created);
        }
        if status.as_u16() == 422 && body.to_ascii_lowercase().contains("already exists") {
            return Ok(BranchCreated::AlreadyExists);
        }
        bail!(
            "github api create branch failed with status {}: {}",
            status.as_u16(),
            truncate_for_error(&body, 800)
        );
    }

    /// Creates the file if absent on `branch`, otherwise updates it, carrying
    /// the blob SHA handshake internally. Content travels base64-encoded and
    /// is otherwise opaque to this client.
    pub async fn create_or_update_file(
        &self,
        branch: &str,
        path: &str,
        content: &str,
        commit_message: &str,
    ) -> Result<()> {
        let existing_sha = self.file_sha(path, branch).await?;
        let mut payload = json!({
            "message": commit_message,
            "content": BASE64.encode(content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            payload["sha"] = json!(sha);
        }
        let _: serde_json::Value = self
            .request_json("create or update file", || {
                self.http
                    .put(self.repo_url(&format!("contents/{path}")))
                    .json(&payload)
            })
            .await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str, branch: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct ContentsFile {
            content: String,
        }

        let (status, body) = self
            .send_with_retry("read file", || {
                self.http
                    .get(self.repo_url(&format!("contents/{path}")))
                    .query(&[("ref", branch)])
            })
            .await?;
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!(
                "github api read file failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        let parsed: ContentsFile =
            serde_json::from_str(&body).context("failed to decode github read file")?;
        let compact: String = parsed
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = BASE64
            .decode(compact.as_bytes())
            .context("failed to decode file content base64")?;
        let text = String::from_utf8(bytes).context("file content is not valid UTF-8")?;
        Ok(Some(text))
    }

    pub async fn list_directory(&self, path: &str, branch: &str) -> Result<Vec<DirectoryEntry>> {
        #[derive(Deserialize)]
        struct ContentsEntry {
            name: String,
            #[serde(rename = "type")]
            entry_type: String,
            #[serde(default)]
            size: u64,
        }

        let tail = if path.is_empty() {
            "contents".to_string()
        } else {
            format!("contents/{path}")
        };
        let entries: Vec<ContentsEntry> = self
            .request_json("list directory", || {
                self.http.get(self.repo_url(&tail)).query(&[("ref", branch)])
            })
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| DirectoryEntry {
                name: entry.name,
                kind: match entry.entry_type.as_str() {
                    "file" => DirectoryEntryKind::File,
                    "dir" => DirectoryEntryKind::Dir,
                    _ => DirectoryEntryKind::Other,
                },
                size: entry.size,
            })
            .collect())
    }

    /// Deletes `path` on `branch`; `Ok(None)` when the file does not exist.
    pub async fn delete_file(
        &self,
        path: &str,
        branch: &str,
        commit_message: &str,
    ) -> Result<Option<()>> {
        let Some(sha) = self.file_sha(path, branch).await? else {
            return Ok(None);
        };
        let payload = json!({
            "message": commit_message,
            "sha": sha,
            "branch": branch,
        });
        let _: serde_json::Value = self
            .request_json("delete file", || {
                self.http
                    .delete(self.repo_url(&format!("contents/{path}")))
                    .json(&payload)
            })
            .await?;
        Ok(Some(()))
    }

    pub async fn open_pull_request(
        &self,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> Result<PullRequestCreated> {
        let payload = json!({
            "title": title,
            "body": body,
            "head": head_branch,
            "base": base_branch,
        });
        let (status, response_body) = self
            .send_with_retry("open pull request", || {
                self.http.post(self.repo_url("pulls")).json(&payload)
            })
            .await?;
        if status.is_success() {
            let pull_request: PullRequest = serde_json::from_str(&response_body)
                .context("failed to decode github open pull request")?;
            return Ok(PullRequestCreated::Created(pull_request));
        }
        if status.as_u16() == 422 && response_body.contains("No commits between") {
            return Ok(PullRequestCreated::NoDiff);
        }
        bail!(
            "github api open pull request failed with status {}: {}",
            status.as_u16(),
            truncate_for_error(&response_body, 800)
        );
    }

    pub async fn comment_on_issue(&self, issue_number: u64, text: &str) -> Result<CommentCreated> {
        let payload = json!({ "body": text });
        self.request_json("create issue comment", || {
            self.http
                .post(self.repo_url(&format!("issues/{issue_number}/comments")))
                .json(&payload)
        })
        .await
    }

    /// PR comments ride the issues endpoint; a pull request number is valid
    /// there.
    pub async fn comment_on_pull_request(
        &self,
        pr_number: u64,
        text: &str,
    ) -> Result<CommentCreated> {
        self.comment_on_issue(pr_number, text).await
    }

    pub async fn close_issue(&self, issue_number: u64) -> Result<()> {
        let payload = json!({ "state": "closed" });
        let _: serde_json::Value = self
            .request_json("close issue", || {
                self.http
                    .patch(self.repo_url(&format!("issues/{issue_number}")))
                    .json(&payload)
            })
            .await?;
        Ok(())
    }

    pub async fn close_pull_request(&self, pr_number: u64) -> Result<()> {
        let payload = json!({ "state": "closed" });
        let _: serde_json::Value = self
            .request_json("close pull request", || {
                self.http
                    .patch(self.repo_url(&format!("pulls/{pr_number}")))
                    .json(&payload)
            })
            .await?;
        Ok(())
    }

    pub async fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>> {
        let mut page = 1_u32;
        let mut rows = Vec::new();
        loop {
            let page_value = page.to_string();
            let chunk: Vec<PullRequest> = self
                .request_json("list pull requests", || {
                    self.http.get(self.repo_url("pulls")).query(&[
                        ("state", "open"),
                        ("per_page", "100"),
                        ("page", page_value.as_str()),
                    ])
                })
                .await?;
            let chunk_len = chunk.len();
            rows.extend(chunk);
            if chunk_len < PAGE_SIZE as usize {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(rows)
    }

    /// Comments on a PR created at or after `since` (RFC3339), oldest first.
    pub async fn list_comments_since(
        &self,
        pr_number: u64,
        since: &str,
    ) -> Result<Vec<IssueComment>> {
        let mut page = 1_u32;
        let mut rows = Vec::new();
        loop {
            let page_value = page.to_string();
            let chunk: Vec<IssueComment> = self
                .request_json("list pull request comments", || {
                    self.http
                        .get(self.repo_url(&format!("issues/{pr_number}/comments")))
                        .query(&[
                            ("since", since),
                            ("per_page", "100"),
                            ("page", page_value.as_str()),
                        ])
                })
                .await?;
            let chunk_len = chunk.len();
            rows.extend(chunk);
            if chunk_len < PAGE_SIZE as usize {
                break;
            }
            page = page.saturating_add(1);
        }
        rows.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then(left.id.cmp(&right.id))
        });
        Ok(rows)
    }

    async fn file_sha(&self, path: &str, branch: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct ContentsSha {
            sha: String,
        }

        let (status, body) = self
            .send_with_retry("get file sha", || {
                self.http
                    .get(self.repo_url(&format!("contents/{path}")))
                    .query(&[("ref", branch)])
            })
            .await?;
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!(
                "github api get file sha failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        let parsed: ContentsSha =
            serde_json::from_str(&body).context("failed to decode github file metadata")?;
        Ok(Some(parsed.sha))
    }

    async fn request_json<T, F>(&self, operation: &str, request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let (status, body) = self.send_with_retry(operation, request_builder).await?;
        if !status.is_success() {
            bail!(
                "github api {operation} failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        serde_json::from_str(&body).with_context(|| format!("failed to decode github {operation}"))
    }

    /// Sends with bounded retry on transient statuses and transport errors,
    /// then hands the final status and body to the caller for
    /// operation-specific interpretation.
    async fn send_with_retry<F>(
        &self,
        operation: &str,
        mut request_builder: F,
    ) -> Result<(reqwest::StatusCode, String)>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder()
                .header("x-smith-retry-attempt", attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    let retry_after = parse_retry_after(response.headers());
                    let body = response
                        .text()
                        .await
                        .with_context(|| format!("failed to read github {operation} body"))?;
                    if !status.is_success()
                        && attempt < self.retry_max_attempts
                        && is_retryable_github_status(status.as_u16())
                    {
                        tracing::debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            "retrying github request"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }
                    return Ok((status, body));
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("github api {operation} request failed"));
                }
            }
        }
    }
}
