//! Messages in and out of the session reducer.
//!
//! Every input, whether a keypress relayed by a presenter or a
//! completion notice from a background task, arrives as a
//! [`SessionEvent`] on the loop's inbox. The reducer answers with
//! [`SessionCommand`]s, which the runtime executes against the
//! executor, the stream coordinator, and the filesystem.

use crate::catalog::CatalogResult;
use crate::exec::{ExecRequest, ExecResult, Job, JobEvent};
use crate::providers::ProviderError;
use crate::stream::{StreamId, StreamMessage, StreamPhase};

/// Commands issued by a presenter on behalf of the user.
#[derive(Debug, Clone)]
pub enum UserCommand {
    /// A submitted input line: a prompt, a `/` command, or a `!` shell
    /// escape.
    Submit(String),
    /// Escape: dismiss overlays, else cancel the foreground command,
    /// else cancel the active stream.
    Cancel,
    CatalogMove(i64),
    CatalogActivate,
    PaletteFilter(String),
    PaletteCycle { forward: bool },
    Run(ExecRequest),
    Quit,
}

#[derive(Debug, Clone)]
pub enum ForegroundOutcome {
    Finished(ExecResult),
    Canceled,
    Error(String),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    User(UserCommand),
    Job(JobEvent),
    /// Authoritative job listing pulled from the executor.
    JobsSnapshot(Vec<Job>),
    JobCancelOutcome { id: String, canceled: bool },
    Stream(StreamMessage),
    StreamStarted { id: StreamId },
    /// `id` is `None` when the failure happened before a stream was
    /// allocated, such as an unknown provider name.
    StreamOpenFailed { id: Option<StreamId>, error: ProviderError },
    ForegroundFinished { command: String, outcome: ForegroundOutcome },
    Catalog(CatalogResult),
    HistorySaved { error: Option<String> },
    PlanSaved { path: String, error: Option<String> },
}

/// Side effects requested by the reducer.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    BeginStream { prompt: String },
    RequestNextChunk { id: StreamId },
    CancelStream,
    /// Record the terminal phase the identified stream reported about
    /// itself.
    FinishStream { id: StreamId, phase: StreamPhase },
    Run { request: ExecRequest },
    CancelForeground,
    CancelJob { id: String },
    FetchCatalog,
    SyncJobs,
    SaveHistory,
    SavePlan,
    Quit,
}
