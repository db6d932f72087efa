//! Repository tools exposed to the reasoning engine.
//!
//! Every mutating tool commits through the gateway onto the task's branch,
//! and reports the touched path in its result payload; the engine derives
//! `files_changed` from those payloads, never from model prose.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use smith_agent::{AgentTool, ToolExecutionResult};
use smith_ai::ToolDefinition;
use smith_github::GithubClient;

/// Tool names whose successful results count as file mutations.
pub const MUTATING_TOOL_NAMES: [&str; 3] = ["create_files", "edit_file", "delete_file"];

/// Shared state for the gateway-backed tools of one processing attempt.
pub struct ToolContext {
    pub client: GithubClient,
    pub branch: String,
    pub issue_number: u64,
}

impl ToolContext {
    fn commit_message(&self, action: &str, filename: &str) -> String {
        format!("{action} {filename} for issue #{}", self.issue_number)
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct FileSpec {
    filename: String,
    file_content: String,
}

#[derive(Debug, Deserialize)]
struct CreateFilesArguments {
    files: Vec<FileSpec>,
}

/// Strictly parses the `create_files` payload. Accepted shapes: an object
/// `{"files": [{filename, file_content}, ...]}`, a bare array of file
/// objects, or either of those JSON-encoded as a string. Anything else is a
/// descriptive parse error the model can react to.
fn parse_create_files_arguments(arguments: &Value) -> Result<Vec<FileSpec>, String> {
    let parsed_from_string;
    let candidate = match arguments {
        Value::String(raw) => {
            parsed_from_string = serde_json::from_str::<Value>(raw).map_err(|error| {
                format!(
                    "create_files arguments were a string that is not valid JSON ({error}); \
                     control characters inside string values must be escaped, for example a \
                     literal newline must be written as \\n. Re-emit the call with properly \
                     escaped JSON."
                )
            })?;
            &parsed_from_string
        }
        other => other,
    };

    let files = match candidate {
        Value::Object(_) => serde_json::from_value::<CreateFilesArguments>(candidate.clone())
            .map_err(|error| {
                format!(
                    "create_files expects {{\"files\": [{{\"filename\", \"file_content\"}}]}}: \
                     {error}"
                )
            })?
            .files,
        Value::Array(_) => serde_json::from_value::<Vec<FileSpec>>(candidate.clone()).map_err(
            |error| {
                format!(
                    "create_files array entries must be {{\"filename\", \"file_content\"}} \
                     objects: {error}"
                )
            },
        )?,
        other => {
            return Err(format!(
                "create_files expects a files object or array, got {}",
                value_kind(other)
            ))
        }
    };

    if files.is_empty() {
        return Err("create_files requires at least one file".to_string());
    }
    for file in &files {
        if file.filename.trim().is_empty() {
            return Err("create_files entries require a non-empty filename".to_string());
        }
    }
    Ok(files)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn file_spec_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "filename": { "type": "string", "description": "Relative path of the file" },
            "file_content": { "type": "string", "description": "Full UTF-8 file content" }
        },
        "required": ["filename", "file_content"],
        "additionalProperties": false
    })
}

/// Batch file creation, the compatibility-critical tool surface.
pub struct CreateFilesTool {
    context: Arc<ToolContext>,
}

impl CreateFilesTool {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AgentTool for CreateFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "create_files".to_string(),
            description: "Create one or more files on the working branch. Pass {\"files\": \
                          [{\"filename\", \"file_content\"}, ...]}. Escape control characters \
                          inside file_content (a literal newline must be written as \\n)."
                .to_string(),
            parameters: json!({
                "anyOf": [
                    {
                        "type": "object",
                        "properties": { "files": { "type": "array", "items": file_spec_schema() } },
                        "required": ["files"],
                        "additionalProperties": false
                    },
                    { "type": "array", "items": file_spec_schema() }
                ]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let files = match parse_create_files_arguments(&arguments) {
            Ok(files) => files,
            Err(error) => {
                return ToolExecutionResult::error(json!({ "success": false, "error": error }))
            }
        };

        let mut created = Vec::with_capacity(files.len());
        for file in &files {
            let message = self.context.commit_message("Add", &file.filename);
            if let Err(error) = self
                .context
                .client
                .create_or_update_file(
                    &self.context.branch,
                    &file.filename,
                    &file.file_content,
                    &message,
                )
                .await
            {
                return ToolExecutionResult::error(json!({
                    "success": false,
                    "error": format!("failed to write {}: {error:#}", file.filename),
                }));
            }
            created.push(json!({
                "filename": file.filename,
                "content": file.file_content,
                "path": file.filename,
                "message": message,
            }));
        }
        ToolExecutionResult::ok(json!({
            "success": true,
            "files": created,
            "count": files.len(),
        }))
    }
}

pub struct ReadFileTool {
    context: Arc<ToolContext>,
}

impl ReadFileTool {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AgentTool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read a file from the working branch.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative path of the file" }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let Some(path) = arguments.get("path").and_then(Value::as_str) else {
            return ToolExecutionResult::error(json!({
                "success": false,
                "error": "read_file requires a string 'path'",
            }));
        };
        match self.context.client.read_file(path, &self.context.branch).await {
            Ok(Some(content)) => ToolExecutionResult::ok(json!({
                "success": true,
                "path": path,
                "content": content,
            })),
            Ok(None) => ToolExecutionResult::error(json!({
                "success": false,
                "error": format!("file not found: {path}"),
            })),
            Err(error) => ToolExecutionResult::error(json!({
                "success": false,
                "error": format!("failed to read {path}: {error:#}"),
            })),
        }
    }
}

pub struct ListDirectoryTool {
    context: Arc<ToolContext>,
}

impl ListDirectoryTool {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AgentTool for ListDirectoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_directory".to_string(),
            description: "List a directory on the working branch. Use an empty path for the \
                          repository root."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative directory path" }
                },
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let path = arguments
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim_matches('/');
        match self
            .context
            .client
            .list_directory(path, &self.context.branch)
            .await
        {
            Ok(entries) => {
                let rows: Vec<Value> = entries
                    .iter()
                    .map(|entry| {
                        json!({
                            "name": entry.name,
                            "kind": match entry.kind {
                                smith_github::DirectoryEntryKind::File => "file",
                                smith_github::DirectoryEntryKind::Dir => "dir",
                                smith_github::DirectoryEntryKind::Other => "other",
                            },
                            "size": entry.size,
                        })
                    })
                    .collect();
                ToolExecutionResult::ok(json!({
                    "success": true,
                    "path": path,
                    "entries": rows,
                }))
            }
            Err(error) => ToolExecutionResult::error(json!({
                "success": false,
                "error": format!("failed to list {path}: {error:#}"),
            })),
        }
    }
}

pub struct EditFileTool {
    context: Arc<ToolContext>,
}

impl EditFileTool {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AgentTool for EditFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "edit_file".to_string(),
            description: "Replace the full content of one file on the working branch, creating \
                          it if absent."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "filename": { "type": "string", "description": "Relative path of the file" },
                    "file_content": { "type": "string", "description": "Full replacement content" }
                },
                "required": ["filename", "file_content"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let (Some(filename), Some(content)) = (
            arguments.get("filename").and_then(Value::as_str),
            arguments.get("file_content").and_then(Value::as_str),
        ) else {
            return ToolExecutionResult::error(json!({
                "success": false,
                "error": "edit_file requires string 'filename' and 'file_content'",
            }));
        };
        let message = self.context.commit_message("Update", filename);
        match self
            .context
            .client
            .create_or_update_file(&self.context.branch, filename, content, &message)
            .await
        {
            Ok(()) => ToolExecutionResult::ok(json!({
                "success": true,
                "filename": filename,
                "path": filename,
                "message": message,
            })),
            Err(error) => ToolExecutionResult::error(json!({
                "success": false,
                "error": format!("failed to edit {filename}: {error:#}"),
            })),
        }
    }
}

pub struct DeleteFileTool {
    context: Arc<ToolContext>,
}

impl DeleteFileTool {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AgentTool for DeleteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_file".to_string(),
            description: "Delete a file from the working branch.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "filename": { "type": "string", "description": "Relative path of the file" }
                },
                "required": ["filename"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let Some(filename) = arguments.get("filename").and_then(Value::as_str) else {
            return ToolExecutionResult::error(json!({
                "success": false,
                "error": "delete_file requires a string 'filename'",
            }));
        };
        let message = self.context.commit_message("Delete", filename);
        match self
            .context
            .client
            .delete_file(filename, &self.context.branch, &message)
            .await
        {
            Ok(Some(())) => ToolExecutionResult::ok(json!({
                "success": true,
                "filename": filename,
                "path": filename,
                "message": message,
            })),
            Ok(None) => ToolExecutionResult::error(json!({
                "success": false,
                "error": format!("file not found: {filename}"),
            })),
            Err(error) => ToolExecutionResult::error(json!({
                "success": false,
                "error": format!("failed to delete {filename}: {error:#}"),
            })),
        }
    }
}

type ExtensionFuture = Pin<Box<dyn Future<Output = ToolExecutionResult> + Send>>;

/// Open slot for externally supplied tools (for example MCP-sourced ones):
/// a name, a description, a JSON schema, and an invoke capability. The
/// runtime dispatches on the registered name without knowing the origin.
pub struct ExtensionTool {
    definition: ToolDefinition,
    invoke: Arc<dyn Fn(Value) -> ExtensionFuture + Send + Sync>,
}

impl ExtensionTool {
    pub fn new<F>(definition: ToolDefinition, invoke: F) -> Self
    where
        F: Fn(Value) -> ExtensionFuture + Send + Sync + 'static,
    {
        Self {
            definition,
            invoke: Arc::new(invoke),
        }
    }
}

#[async_trait]
impl AgentTool for ExtensionTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        (self.invoke)(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_create_files_arguments, CreateFilesTool, ExtensionTool, ToolContext};
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use smith_agent::{AgentTool, ToolExecutionResult};
    use smith_ai::ToolDefinition;
    use smith_github::{GithubClient, RepoRef};
    use std::sync::Arc;

    fn context(base_url: &str) -> Arc<ToolContext> {
        Arc::new(ToolContext {
            client: GithubClient::new(
                base_url.to_string(),
                "test-token".to_string(),
                RepoRef::parse("owner/repo").unwrap(),
                2_000,
                1,
                1,
            )
            .unwrap(),
            branch: "smith/issue-91".to_string(),
            issue_number: 91,
        })
    }

    #[test]
    fn unit_parse_accepts_object_and_bare_array_shapes() {
        let object_form = json!({
            "files": [{ "filename": "TEST.md", "file_content": "note" }]
        });
        let files = parse_create_files_arguments(&object_form).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "TEST.md");

        let array_form = json!([{ "filename": "a.md", "file_content": "a" }]);
        let files = parse_create_files_arguments(&array_form).unwrap();
        assert_eq!(files[0].filename, "a.md");
    }

    #[test]
    fn unit_parse_accepts_escaped_json_string_payload() {
        let raw = Value::String(
            "[{\"filename\":\"TEST.md\",\"file_content\":\"line1\\nline2\"}]".to_string(),
        );
        let files = parse_create_files_arguments(&raw).unwrap();
        assert_eq!(files[0].file_content, "line1\nline2");
    }

    #[test]
    fn unit_parse_rejects_unescaped_newline_with_descriptive_error() {
        let raw = Value::String(
            "[{\"filename\":\"TEST.md\",\"file_content\":\"line1\nline2\"}]".to_string(),
        );
        let error = parse_create_files_arguments(&raw).unwrap_err();
        assert!(error.contains("escaped"));
        assert!(error.contains("\\n"));
    }

    #[test]
    fn unit_parse_rejects_missing_fields_and_empty_batches() {
        let missing = json!({ "files": [{ "filename": "TEST.md" }] });
        assert!(parse_create_files_arguments(&missing).is_err());

        let empty = json!({ "files": [] });
        let error = parse_create_files_arguments(&empty).unwrap_err();
        assert!(error.contains("at least one file"));
    }

    #[tokio::test]
    async fn functional_create_files_writes_through_gateway() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/owner/repo/contents/TEST.md");
                then.status(404).json_body(json!({ "message": "Not Found" }));
            })
            .await;
        let put = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/repos/owner/repo/contents/TEST.md")
                    .json_body_includes(json!({ "branch": "smith/issue-91" }).to_string());
                then.status(201).json_body(json!({ "commit": { "sha": "abc" } }));
            })
            .await;

        let tool = CreateFilesTool::new(context(&server.base_url()));
        let result = tool
            .execute(json!({
                "files": [{ "filename": "TEST.md", "file_content": "a short note" }]
            }))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content["count"], 1);
        assert_eq!(result.content["files"][0]["path"], "TEST.md");
        put.assert_async().await;
    }

    #[tokio::test]
    async fn functional_create_files_reports_parse_error_as_tool_error() {
        let server = MockServer::start_async().await;
        let tool = CreateFilesTool::new(context(&server.base_url()));
        let result = tool.execute(json!({ "files": "not-an-array" })).await;
        assert!(result.is_error);
        assert_eq!(result.content["success"], false);
    }

    #[tokio::test]
    async fn unit_extension_tool_dispatches_through_invoke() {
        let tool = ExtensionTool::new(
            ToolDefinition {
                name: "external_lookup".to_string(),
                description: "Externally supplied tool".to_string(),
                parameters: json!({ "type": "object" }),
            },
            |arguments| Box::pin(async move { ToolExecutionResult::ok(arguments) }),
        );
        let result = tool.execute(json!({ "query": "x" })).await;
        assert!(!result.is_error);
        assert_eq!(result.content["query"], "x");
    }
}
