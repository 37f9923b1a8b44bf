//! End-to-end session loop tests with a scripted in-process provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rill_core::config::Config;
use rill_core::exec::ExecRequest;
use rill_core::history::{HistoryStore, Session};
use rill_core::providers::{
    ChatRequest, ChunkReceiver, Model, Provider, ProviderError, ProviderErrorKind, ProviderKind,
    ProviderRegistry, ProviderResult, StreamChunk,
};
use rill_core::session::{Presenter, SessionLoop, SessionState, UserCommand};

/// Serves pre-scripted chunk sequences, one per stream. The producer
/// stays open after its script until canceled, like a real connection.
struct ScriptedProvider {
    name: &'static str,
    models: Vec<Model>,
    fail_listing: bool,
    hang_open: bool,
    scripts: Mutex<VecDeque<Vec<StreamChunk>>>,
}

impl ScriptedProvider {
    fn new(name: &'static str, models: &[&str], scripts: Vec<Vec<StreamChunk>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            models: models
                .iter()
                .map(|name| Model {
                    name: (*name).to_string(),
                    ..Model::default()
                })
                .collect(),
            fail_listing: false,
            hang_open: false,
            scripts: Mutex::new(scripts.into()),
        })
    }

    fn broken(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            models: vec![],
            fail_listing: true,
            hang_open: false,
            scripts: Mutex::new(VecDeque::new()),
        })
    }

    /// The model listing works, but the chat connection never opens.
    fn stalled(name: &'static str, models: &[&str]) -> Arc<Self> {
        let mut provider = Arc::into_inner(Self::new(name, models, vec![])).unwrap();
        provider.hang_open = true;
        Arc::new(provider)
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    fn list_models(&self) -> BoxFuture<'_, ProviderResult<Vec<Model>>> {
        Box::pin(async move {
            if self.fail_listing {
                return Err(ProviderError::new(ProviderErrorKind::Api, "backend down"));
            }
            Ok(self.models.clone())
        })
    }

    fn stream_chat(
        &self,
        _req: ChatRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ProviderResult<ChunkReceiver>> {
        if self.hang_open {
            return Box::pin(std::future::pending());
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                for chunk in script {
                    tokio::select! {
                        sent = tx.send(chunk) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        () = cancel.cancelled() => return,
                    }
                }
                cancel.cancelled().await;
            });
            Ok(rx)
        })
    }
}

struct Recorder {
    tx: mpsc::UnboundedSender<SessionState>,
}

impl Presenter for Recorder {
    fn present(&mut self, state: &SessionState) {
        let _ = self.tx.send(state.clone());
    }
}

struct Harness {
    handle: rill_core::session::SessionHandle,
    snapshots: mpsc::UnboundedReceiver<SessionState>,
    home: TempDir,
}

impl Harness {
    fn start(registry: ProviderRegistry, config: Config) -> Self {
        rill_core::logging::init();
        let home = TempDir::new().unwrap();
        let history = HistoryStore::open(home.path()).unwrap();
        let (tx, snapshots) = mpsc::unbounded_channel();
        let session_loop = SessionLoop::new(
            config,
            registry,
            history,
            Session::new("test"),
            home.path().to_path_buf(),
            Recorder { tx },
        );
        let handle = session_loop.handle();
        tokio::spawn(session_loop.run());
        Self {
            handle,
            snapshots,
            home,
        }
    }

    /// Drain snapshots until one satisfies the predicate.
    async fn wait_until(&mut self, what: &str, pred: impl Fn(&SessionState) -> bool) -> SessionState {
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                let state = self.snapshots.recv().await.expect("loop ended");
                if pred(&state) {
                    return state;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    /// Pick a model through the catalog flow.
    async fn select_model(&mut self) {
        self.handle.submit("/model");
        self.wait_until("catalog rows", |state| !state.catalog.rows.is_empty())
            .await;
        self.handle
            .send(rill_core::session::SessionEvent::User(UserCommand::CatalogActivate));
        self.wait_until("model selection", |state| state.model.is_some())
            .await;
    }
}

fn transcript_contains(state: &SessionState, needle: &str) -> bool {
    state.transcript.iter().any(|line| line.contains(needle))
}

#[tokio::test]
async fn streams_a_full_response_end_to_end() {
    let provider = ScriptedProvider::new(
        "scripted",
        &["m1"],
        vec![vec![
            StreamChunk::Content("Hello ".to_string()),
            StreamChunk::Content("world".to_string()),
            StreamChunk::Done,
        ]],
    );
    let registry = ProviderRegistry::new(vec![provider]);
    let mut harness = Harness::start(registry, Config::default());

    harness.select_model().await;
    harness.handle.submit("what's up?");

    let state = harness
        .wait_until("completed response", |state| {
            state.status == "Response complete"
        })
        .await;
    assert!(transcript_contains(&state, "Hello world"));
    assert!(state.stream.is_none());
    assert!(transcript_contains(&state, "what's up?"));

    harness.handle.quit();
}

#[tokio::test]
async fn a_new_prompt_supersedes_the_active_stream() {
    let provider = ScriptedProvider::new(
        "scripted",
        &["m1"],
        vec![
            // Never completes on its own.
            vec![StreamChunk::Content("first-answer".to_string())],
            vec![
                StreamChunk::Content("second-answer".to_string()),
                StreamChunk::Done,
            ],
        ],
    );
    let registry = ProviderRegistry::new(vec![provider]);
    let mut harness = Harness::start(registry, Config::default());

    harness.select_model().await;
    harness.handle.submit("first question");
    harness
        .wait_until("first chunk", |state| {
            transcript_contains(state, "first-answer")
        })
        .await;

    harness.handle.submit("second question");
    let state = harness
        .wait_until("second response", |state| {
            state.status == "Response complete"
        })
        .await;
    assert!(transcript_contains(&state, "second-answer"));
    // The superseded block stays rendered where it was.
    assert!(transcript_contains(&state, "first-answer"));
    assert!(state.stream.is_none());

    harness.handle.quit();
}

#[tokio::test]
async fn canceling_a_stream_keeps_delivered_content() {
    let provider = ScriptedProvider::new(
        "scripted",
        &["m1"],
        vec![vec![StreamChunk::Content("partial".to_string())]],
    );
    let registry = ProviderRegistry::new(vec![provider]);
    let mut harness = Harness::start(registry, Config::default());

    harness.select_model().await;
    harness.handle.submit("question");
    harness
        .wait_until("partial chunk", |state| {
            transcript_contains(state, "partial")
        })
        .await;

    harness.handle.cancel();
    let state = harness
        .wait_until("canceled response", |state| {
            state.status == "Response canceled"
        })
        .await;
    assert!(transcript_contains(&state, "partial"));
    assert!(transcript_contains(&state, "(canceled)"));
    assert!(state.stream.is_none());

    harness.handle.quit();
}

#[tokio::test]
async fn loop_stays_responsive_while_the_connection_hangs() {
    let provider = ScriptedProvider::stalled("scripted", &["m1"]);
    let registry = ProviderRegistry::new(vec![provider]);
    let mut harness = Harness::start(registry, Config::default());

    harness.select_model().await;
    harness.handle.submit("question");

    // The connection never opens, but the loop keeps serving commands.
    harness.handle.submit("/status");
    harness
        .wait_until("status block", |state| {
            transcript_contains(state, "streaming: yes")
        })
        .await;

    harness.handle.cancel();
    let state = harness
        .wait_until("canceled response", |state| {
            state.status == "Response canceled"
        })
        .await;
    assert!(state.stream.is_none());

    harness.handle.quit();
}

#[tokio::test]
async fn stream_failure_lands_in_the_transcript() {
    let provider = ScriptedProvider::new(
        "scripted",
        &["m1"],
        vec![vec![
            StreamChunk::Content("before".to_string()),
            StreamChunk::Failed(ProviderError::new(ProviderErrorKind::Api, "Overloaded")),
        ]],
    );
    let registry = ProviderRegistry::new(vec![provider]);
    let mut harness = Harness::start(registry, Config::default());

    harness.select_model().await;
    harness.handle.submit("question");
    let state = harness
        .wait_until("failed response", |state| state.status == "Response failed")
        .await;
    assert!(transcript_contains(&state, "before"));
    assert!(transcript_contains(&state, "stream error: Overloaded"));

    harness.handle.quit();
}

#[tokio::test]
async fn catalog_mixes_rows_and_error_rows() {
    let good = ScriptedProvider::new("good", &["m1", "m2"], vec![]);
    let broken = ScriptedProvider::broken("broken");
    let registry = ProviderRegistry::new(vec![good, broken]);
    let mut harness = Harness::start(registry, Config::default());

    harness.handle.submit("/model");
    let state = harness
        .wait_until("all catalog rows", |state| state.catalog.rows.len() == 3)
        .await;
    assert!(state.catalog.pending.is_empty());
    let selectable = state
        .catalog
        .rows
        .iter()
        .filter(|row| row.selectable())
        .count();
    assert_eq!(selectable, 2);
    assert!(
        state
            .catalog
            .rows
            .iter()
            .any(|row| row.provider == "broken" && row.display().contains("backend down"))
    );

    harness.handle.quit();
}

#[tokio::test]
async fn whitelist_can_empty_a_provider_into_a_no_match_row() {
    let provider = ScriptedProvider::new("scripted", &["m1", "m2"], vec![]);
    let registry = ProviderRegistry::new(vec![provider]);
    let mut config = Config::default();
    config.models.whitelist = vec!["something-else".to_string()];
    let mut harness = Harness::start(registry, config);

    harness.handle.submit("/model");
    let state = harness
        .wait_until("no-match row", |state| !state.catalog.rows.is_empty())
        .await;
    assert_eq!(state.catalog.rows.len(), 1);
    assert!(state.catalog.rows[0].display().contains("no models match"));

    harness.handle.quit();
}

#[tokio::test]
async fn foreground_command_output_reaches_the_transcript() {
    let registry = ProviderRegistry::new(vec![]);
    let mut harness = Harness::start(registry, Config::default());

    harness.handle.run(ExecRequest::foreground(
        "sh",
        vec!["-c".to_string(), "echo hi".to_string()],
    ));
    let state = harness
        .wait_until("command output", |state| transcript_contains(state, "hi"))
        .await;
    assert!(state.foreground.is_none());
    assert!(state.status.contains("status 0"));

    harness.handle.quit();
}

#[tokio::test]
async fn cancel_interrupts_the_foreground_command() {
    let registry = ProviderRegistry::new(vec![]);
    let mut harness = Harness::start(registry, Config::default());

    harness.handle.run(ExecRequest::foreground(
        "sh",
        vec!["-c".to_string(), "sleep 30".to_string()],
    ));
    harness
        .wait_until("foreground running", |state| state.foreground.is_some())
        .await;

    harness.handle.cancel();
    let state = harness
        .wait_until("foreground canceled", |state| {
            state.status == "Command canceled"
        })
        .await;
    assert!(state.foreground.is_none());

    harness.handle.quit();
}

#[tokio::test]
async fn background_job_lifecycle_flows_through_events() {
    let registry = ProviderRegistry::new(vec![]);
    let mut harness = Harness::start(registry, Config::default());

    harness.handle.run(ExecRequest::background(
        "sh",
        vec!["-c".to_string(), "echo done".to_string()],
    ));
    let state = harness
        .wait_until("job finished", |state| {
            transcript_contains(state, "finished (exit 0)")
        })
        .await;
    assert_eq!(state.jobs.len(), 1);

    // The snapshot listing agrees with the mirror.
    harness.handle.submit("/jobs");
    let state = harness
        .wait_until("job listing", |state| {
            transcript_contains(state, "success")
        })
        .await;
    assert!(transcript_contains(&state, "sh -c echo done"));

    harness.handle.quit();
}

#[tokio::test]
async fn background_job_can_be_canceled_by_id() {
    let registry = ProviderRegistry::new(vec![]);
    let mut harness = Harness::start(registry, Config::default());

    harness.handle.run(ExecRequest::background(
        "sh",
        vec!["-c".to_string(), "sleep 30".to_string()],
    ));
    let state = harness
        .wait_until("job started", |state| !state.jobs.is_empty())
        .await;
    let id = state.jobs.keys().next().unwrap().clone();

    harness.handle.submit(format!("/jobs cancel {id}"));
    let state = harness
        .wait_until("job canceled", |state| {
            state
                .jobs
                .values()
                .any(|job| job.error.as_deref() == Some("canceled"))
        })
        .await;
    let job = state.jobs.values().next().unwrap();
    assert_eq!(job.exit_code, -1);

    harness.handle.quit();
}

#[tokio::test]
async fn plan_save_writes_the_markdown_file() {
    let registry = ProviderRegistry::new(vec![]);
    let mut harness = Harness::start(registry, Config::default());

    harness.handle.submit("/plan add step one");
    harness.handle.submit("/plan done 1");
    harness.handle.submit("/plan save");
    let state = harness
        .wait_until("plan saved", |state| state.status.contains("Plan written"))
        .await;

    let path = harness.home.path().join("PLAN.md");
    let written = std::fs::read_to_string(path).unwrap();
    assert_eq!(written, "# Plan\n\n- [x] step one\n");
    assert!(state.plan.steps[0].done);

    harness.handle.quit();
}

#[tokio::test]
async fn prompts_update_the_history_store() {
    let provider = ScriptedProvider::new(
        "scripted",
        &["m1"],
        vec![vec![StreamChunk::Done]],
    );
    let registry = ProviderRegistry::new(vec![provider]);
    let mut harness = Harness::start(registry, Config::default());

    harness.select_model().await;
    harness.handle.submit("remember this prompt");
    harness
        .wait_until("response done", |state| state.status == "Response complete")
        .await;

    let store = HistoryStore::open(harness.home.path()).unwrap();
    let sessions = store.list("test").unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].title, "remember this prompt");

    harness.handle.quit();
}
