//! Session loop runtime.
//!
//! Owns the state, the executor, and the stream coordinator. Events
//! from presenters and background tasks funnel into one inbox; the
//! loop applies the reducer and executes the returned commands, so
//! state is only ever touched from here.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog;
use crate::config::Config;
use crate::exec::{ExecRequest, JobExecutor, RunOutcome};
use crate::history::{HistoryStore, Session};
use crate::providers::{ChatMessage, ChatRequest, ProviderError, ProviderErrorKind, ProviderRegistry};
use crate::session::events::{ForegroundOutcome, SessionCommand, SessionEvent, UserCommand};
use crate::session::state::SessionState;
use crate::session::update::update;
use crate::stream::{StreamCoordinator, StreamUpdate};

/// Receives a state snapshot after every applied event.
pub trait Presenter: Send {
    fn present(&mut self, state: &SessionState);
}

/// Presenter for headless use.
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn present(&mut self, _state: &SessionState) {}
}

/// Cloneable sender half of the loop's inbox.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn send(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn submit(&self, text: impl Into<String>) {
        self.send(SessionEvent::User(UserCommand::Submit(text.into())));
    }

    pub fn cancel(&self) {
        self.send(SessionEvent::User(UserCommand::Cancel));
    }

    pub fn run(&self, request: ExecRequest) {
        self.send(SessionEvent::User(UserCommand::Run(request)));
    }

    pub fn quit(&self) {
        self.send(SessionEvent::User(UserCommand::Quit));
    }
}

pub struct SessionLoop<P: Presenter> {
    state: SessionState,
    config: Config,
    registry: ProviderRegistry,
    executor: Arc<JobExecutor>,
    coordinator: StreamCoordinator,
    history: HistoryStore,
    /// Directory `/plan save` writes into.
    plan_dir: PathBuf,
    inbox_tx: mpsc::UnboundedSender<SessionEvent>,
    inbox_rx: mpsc::UnboundedReceiver<SessionEvent>,
    presenter: P,
    shutdown: CancellationToken,
}

impl<P: Presenter> SessionLoop<P> {
    pub fn new(
        config: Config,
        registry: ProviderRegistry,
        history: HistoryStore,
        session: Session,
        plan_dir: PathBuf,
        presenter: P,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (executor, mut job_events) = JobExecutor::new();

        // Executor notifications flow into the inbox like everything
        // else.
        let job_tx = inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = job_events.recv().await {
                if job_tx.send(SessionEvent::Job(event)).is_err() {
                    break;
                }
            }
        });

        let provider_names = registry
            .providers()
            .iter()
            .map(|provider| provider.name().to_string())
            .collect();
        let state = SessionState::new(session, &config, provider_names);

        Self {
            state,
            config,
            registry,
            executor: Arc::new(executor),
            coordinator: StreamCoordinator::new(),
            history,
            plan_dir,
            inbox_tx,
            inbox_rx,
            presenter,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.inbox_tx.clone(),
        }
    }

    /// Drive the loop until quit. One event at a time: apply the
    /// reducer, execute its commands, present the new state.
    pub async fn run(mut self) -> Result<()> {
        self.presenter.present(&self.state);
        while let Some(event) = self.inbox_rx.recv().await {
            tracing::trace!(?event, "session event");
            let commands = update(&mut self.state, event);
            for command in commands {
                self.execute(command).await;
            }
            self.presenter.present(&self.state);
            if self.state.should_quit {
                break;
            }
        }
        self.coordinator.cancel();
        self.shutdown.cancel();
        Ok(())
    }

    async fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::BeginStream { prompt } => self.begin_stream(prompt),
            SessionCommand::RequestNextChunk { id } => self.coordinator.request_next(id),
            SessionCommand::CancelStream => {
                self.coordinator.cancel();
            }
            SessionCommand::FinishStream { id, phase } => self.coordinator.finish(id, phase),
            SessionCommand::Run { request } => self.run_command(request).await,
            SessionCommand::CancelForeground => {
                if !self.executor.cancel_foreground() {
                    tracing::debug!("cancel requested with no foreground command");
                }
            }
            SessionCommand::CancelJob { id } => {
                let canceled = self.executor.cancel_job(&id);
                self.send(SessionEvent::JobCancelOutcome { id, canceled });
            }
            SessionCommand::FetchCatalog => self.fetch_catalog(),
            SessionCommand::SyncJobs => {
                self.send(SessionEvent::JobsSnapshot(self.executor.active_jobs()));
            }
            SessionCommand::SaveHistory => {
                let error = self
                    .history
                    .save(&self.state.session)
                    .err()
                    .map(|err| err.to_string());
                self.send(SessionEvent::HistorySaved { error });
            }
            SessionCommand::SavePlan => self.save_plan(),
            SessionCommand::Quit => {}
        }
    }

    fn send(&self, event: SessionEvent) {
        let _ = self.inbox_tx.send(event);
    }

    /// Hand the prompt to the coordinator. The provider connection is
    /// opened on the stream's own task, so the loop keeps draining its
    /// inbox while the open is in flight.
    fn begin_stream(&mut self, prompt: String) {
        let provider = self
            .state
            .provider
            .as_deref()
            .and_then(|name| self.registry.by_name(name));
        let Some(provider) = provider else {
            let name = self.state.provider.clone().unwrap_or_default();
            self.send(SessionEvent::StreamOpenFailed {
                id: None,
                error: ProviderError::new(
                    ProviderErrorKind::Api,
                    format!("unknown provider '{name}'"),
                ),
            });
            return;
        };

        let request = ChatRequest {
            model: self.state.model.clone().unwrap_or_default(),
            messages: vec![ChatMessage::user(prompt)],
        };
        let tx = self.inbox_tx.clone();
        self.coordinator.begin(provider, request, move |notice| {
            let event = match notice {
                StreamUpdate::Started(id) => SessionEvent::StreamStarted { id },
                StreamUpdate::OpenFailed { id, error } => SessionEvent::StreamOpenFailed {
                    id: Some(id),
                    error,
                },
                StreamUpdate::Chunk(message) => SessionEvent::Stream(message),
            };
            let _ = tx.send(event);
        });
    }

    async fn run_command(&mut self, request: ExecRequest) {
        if request.background {
            if let Err(err) = self.executor.run(request, None).await {
                tracing::warn!(%err, "background run rejected");
            }
            return;
        }

        // Foreground runs block until exit, so they get their own task;
        // the outcome comes back through the inbox.
        let executor = Arc::clone(&self.executor);
        let tx = self.inbox_tx.clone();
        let command = request.display();
        tokio::spawn(async move {
            let outcome = match executor.run(request, None).await {
                Ok(RunOutcome::Foreground(result)) => ForegroundOutcome::Finished(result),
                Ok(RunOutcome::ForegroundCanceled) => ForegroundOutcome::Canceled,
                Ok(RunOutcome::Background { .. }) => {
                    return;
                }
                Err(err) => ForegroundOutcome::Error(err.to_string()),
            };
            let _ = tx.send(SessionEvent::ForegroundFinished { command, outcome });
        });
    }

    fn fetch_catalog(&self) {
        for provider in self.registry.providers() {
            let whitelist = self
                .config
                .models
                .whitelist_for(provider.name(), provider.kind());
            let tx = self.inbox_tx.clone();
            catalog::spawn_fetch(
                Arc::clone(provider),
                whitelist,
                self.shutdown.child_token(),
                move |result| {
                    let _ = tx.send(SessionEvent::Catalog(result));
                },
            );
        }
    }

    fn save_plan(&self) {
        let path = self.plan_dir.join(&self.state.plan.file_path);
        let error = std::fs::write(&path, self.state.plan.render())
            .err()
            .map(|err| err.to_string());
        self.send(SessionEvent::PlanSaved {
            path: path.display().to_string(),
            error,
        });
    }
}
