//! Shell command execution.
//!
//! Foreground runs block the caller until the process exits or the
//! exclusive foreground slot is canceled. Background runs return a job
//! id immediately and report progress through a best-effort event
//! channel plus an authoritative [`JobExecutor::active_jobs`] snapshot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capacity of the job event channel. Sends never block; events beyond
/// this backlog are dropped and recovered from the snapshot instead.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// A request to run a command, either foreground or background.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub background: bool,
}

impl ExecRequest {
    pub fn foreground(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    pub fn background(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            background: true,
            ..Self::foreground(command, args)
        }
    }

    /// Rendered command line, for transcripts and job listings.
    pub fn display(&self) -> String {
        display_command(&self.command, &self.args)
    }
}

fn display_command(command: &str, args: &[String]) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Output of a completed foreground run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Combined stdout and stderr.
    pub output: String,
    pub exit_code: i32,
}

#[derive(Debug)]
pub enum RunOutcome {
    Foreground(ExecResult),
    /// The foreground slot was canceled before the process exited.
    ForegroundCanceled,
    Background { job_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Bookkeeping record for a background job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub exit_code: i32,
    pub output: String,
    pub error: Option<String>,
}

impl Job {
    pub fn display_command(&self) -> String {
        display_command(&self.command, &self.args)
    }
}

/// Lifecycle notification for a background job. One event is sent when
/// the job starts and one when it reaches a terminal status, buffer
/// permitting.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: Job,
}

#[derive(Default)]
struct Registry {
    foreground: Option<CancellationToken>,
    jobs: HashMap<String, Job>,
    cancels: HashMap<String, CancellationToken>,
}

/// Runs shell commands and tracks background jobs.
pub struct JobExecutor {
    registry: Arc<Mutex<Registry>>,
    events_tx: mpsc::Sender<JobEvent>,
}

impl JobExecutor {
    /// Returns the executor and the receiving end of its job event
    /// channel.
    pub fn new() -> (Self, mpsc::Receiver<JobEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let executor = Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            events_tx,
        };
        (executor, events_rx)
    }

    /// Run a command. Foreground requests resolve when the process
    /// exits or the foreground slot is canceled; background requests
    /// resolve immediately with the new job id.
    ///
    /// `cancel`, when given, bounds the foreground run from the
    /// caller's side in addition to [`Self::cancel_foreground`].
    pub async fn run(
        &self,
        req: ExecRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<RunOutcome> {
        if req.command.trim().is_empty() {
            bail!("command is required");
        }
        if req.background {
            let job_id = self.start_background(req);
            return Ok(RunOutcome::Background { job_id });
        }
        self.run_foreground(req, cancel).await
    }

    /// Cancel whatever currently occupies the foreground slot. Returns
    /// true exactly once per occupied slot.
    pub fn cancel_foreground(&self) -> bool {
        let token = self.registry().foreground.take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel a background job by id. Returns false for unknown ids
    /// and for jobs that already finished or were already canceled.
    pub fn cancel_job(&self, id: &str) -> bool {
        let token = self.registry().cancels.remove(id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Authoritative snapshot of every tracked job, oldest first.
    pub fn active_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.registry().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_foreground(
        &self,
        req: ExecRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<RunOutcome> {
        let token = cancel.map_or_else(CancellationToken::new, |parent| parent.child_token());
        let child = spawn_process(&req)
            .with_context(|| format!("failed to start '{}'", req.command))?;

        self.registry().foreground = Some(token.clone());

        let waited = tokio::select! {
            output = child.wait_with_output() => Some(output),
            () = token.cancelled() => None,
        };
        self.registry().foreground = None;

        let Some(output) = waited else {
            return Ok(RunOutcome::ForegroundCanceled);
        };
        let output = output.with_context(|| format!("failed to wait for '{}'", req.command))?;

        Ok(RunOutcome::Foreground(ExecResult {
            output: collect_output(&output.stdout, &output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        }))
    }

    fn start_background(&self, req: ExecRequest) -> String {
        let id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let job = Job {
            id: id.clone(),
            command: req.command.clone(),
            args: req.args.clone(),
            workdir: req.workdir.clone(),
            started_at: Utc::now(),
            ended_at: None,
            status: JobStatus::Running,
            exit_code: 0,
            output: String::new(),
            error: None,
        };

        {
            let mut registry = self.registry();
            registry.jobs.insert(id.clone(), job.clone());
            registry.cancels.insert(id.clone(), token.clone());
        }
        emit_event(&self.events_tx, job);

        let registry = Arc::clone(&self.registry);
        let events_tx = self.events_tx.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            let finish = run_to_finish(&req, &token).await;
            let finished_job = {
                let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
                registry.cancels.remove(&job_id);
                registry.jobs.get_mut(&job_id).map(|job| {
                    job.ended_at = Some(Utc::now());
                    job.status = finish.status;
                    job.exit_code = finish.exit_code;
                    job.output = finish.output;
                    job.error = finish.error;
                    job.clone()
                })
            };
            if let Some(job) = finished_job {
                emit_event(&events_tx, job);
            }
        });

        id
    }
}

struct JobFinish {
    status: JobStatus,
    exit_code: i32,
    output: String,
    error: Option<String>,
}

async fn run_to_finish(req: &ExecRequest, cancel: &CancellationToken) -> JobFinish {
    let mut child = match spawn_process(req) {
        Ok(child) => child,
        Err(err) => {
            return JobFinish {
                status: JobStatus::Failed,
                exit_code: -1,
                output: String::new(),
                error: Some(format!("failed to start '{}': {err}", req.command)),
            };
        }
    };

    // The pipes are drained as the process writes, so a canceled job
    // still keeps whatever it produced before the kill.
    let stdout = drain_pipe(child.stdout.take());
    let stderr = drain_pipe(child.stderr.take());

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        () = cancel.cancelled() => None,
    };
    if waited.is_none() {
        let _ = child.kill().await;
    }
    let output = collect_output(
        &stdout.await.unwrap_or_default(),
        &stderr.await.unwrap_or_default(),
    );

    match waited {
        None => JobFinish {
            status: JobStatus::Failed,
            exit_code: -1,
            output,
            error: Some("canceled".to_string()),
        },
        Some(Ok(status)) => {
            let exit_code = status.code().unwrap_or(-1);
            if status.success() {
                JobFinish {
                    status: JobStatus::Success,
                    exit_code,
                    output,
                    error: None,
                }
            } else {
                JobFinish {
                    status: JobStatus::Failed,
                    exit_code,
                    output,
                    error: Some(format!("exit status {exit_code}")),
                }
            }
        }
        Some(Err(err)) => JobFinish {
            status: JobStatus::Failed,
            exit_code: -1,
            output,
            error: Some(format!("failed to wait for '{}': {err}", req.command)),
        },
    }
}

/// Read a child pipe to the end on its own task. Partial output
/// survives a kill; read errors leave whatever arrived before them.
fn drain_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

fn spawn_process(req: &ExecRequest) -> std::io::Result<tokio::process::Child> {
    let mut cmd = Command::new(&req.command);
    cmd.args(&req.args)
        .env("TERM", "dumb")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &req.workdir {
        cmd.current_dir(dir);
    }
    cmd.spawn()
}

fn collect_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(stderr));
    output
}

fn emit_event(tx: &mpsc::Sender<JobEvent>, job: Job) {
    if tx.try_send(JobEvent { job }).is_err() {
        tracing::debug!("job event dropped, channel full or closed");
    }
}
