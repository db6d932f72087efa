//! Issue-to-pull-request orchestration: poll loop, task execution engine,
//! repository tools exposed to the reasoning engine, and the per-run
//! processed-state tracker.

mod engine;
mod ledger;
mod poller;
mod prompts;
mod session;
mod tools;

pub use engine::{
    EngineConfig, ProcessingOutcome, ProcessingTask, TaskExecutionEngine, TaskOutcomeKind,
};
pub use ledger::{CommentCheckpoint, ProcessedEntry, ProcessedLedger};
pub use poller::{IssuePoller, PollCycleReport, PollerConfig};
pub use session::SessionStore;
pub use tools::{
    CreateFilesTool, DeleteFileTool, EditFileTool, ExtensionTool, ListDirectoryTool, ReadFileTool,
    ToolContext,
};
