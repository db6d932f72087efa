//! Prompt assembly for issue processing runs.

use smith_github::Issue;

pub fn system_prompt(repo_slug: &str) -> String {
    format!(
        "You are an autonomous coding agent working on the repository {repo_slug}.\n\
         You resolve GitHub issues by creating, editing, and deleting files on a \
         dedicated branch using the provided tools. Rules:\n\
         - Inspect the repository with read_file and list_directory before writing.\n\
         - Make every file change through the tools; never claim a change you did \
         not make with a tool call.\n\
         - Tool arguments must be valid JSON. Escape control characters inside \
         string values: a literal newline inside file_content must be written as \\n.\n\
         - When the work is complete, reply with a short summary of what you \
         changed and why. Do not call any further tools after the summary."
    )
}

pub fn task_prompt(issue: &Issue, additional_context: Option<&str>) -> String {
    let body = issue.body.as_deref().unwrap_or("(no description provided)");
    let mut prompt = format!(
        "Resolve GitHub issue #{number}.\n\nTitle: {title}\n\nDescription:\n{body}\n",
        number = issue.number,
        title = issue.title,
    );
    if let Some(context) = additional_context {
        prompt.push_str(
            "\nNew follow-up comments were posted on the pull request for this \
             issue. Address them on the same branch:\n",
        );
        prompt.push_str(context);
        prompt.push('\n');
    }
    prompt
}
