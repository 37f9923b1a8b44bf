//! The session reducer.
//!
//! Pure state transition: `(state, event) -> commands`. No I/O happens
//! here; the runtime executes the returned commands.

use crate::exec::{ExecRequest, JobStatus};
use crate::providers::StreamChunk;
use crate::session::events::{
    ForegroundOutcome, SessionCommand, SessionEvent, UserCommand,
};
use crate::session::state::{PlanMode, PlanStep, SessionState, StreamBlock};
use crate::stream::StreamPhase;

const TITLE_MAX: usize = 60;

pub fn update(state: &mut SessionState, event: SessionEvent) -> Vec<SessionCommand> {
    match event {
        SessionEvent::User(command) => handle_user(state, command),
        SessionEvent::Job(event) => {
            record_job_event(state, &event.job);
            state.jobs.insert(event.job.id.clone(), event.job);
            vec![]
        }
        SessionEvent::JobsSnapshot(jobs) => {
            for job in &jobs {
                state.jobs.insert(job.id.clone(), job.clone());
            }
            list_jobs(state);
            vec![]
        }
        SessionEvent::JobCancelOutcome { id, canceled } => {
            if canceled {
                state.push_line(format!("job {}: cancel requested", short_id(&id)));
            } else {
                state.push_line(format!(
                    "job {}: not found or already finished",
                    short_id(&id)
                ));
            }
            vec![]
        }
        SessionEvent::Stream(message) => handle_stream_chunk(state, message),
        SessionEvent::StreamStarted { id } => {
            // Accept the open if one is awaited, or if a later stream
            // supersedes the one currently rendering. Anything else is
            // a stale open that was already canceled.
            let supersedes = state.stream.as_ref().is_some_and(|stream| stream.id < id);
            if !state.stream_pending && !supersedes {
                return vec![];
            }
            state.stream_pending = false;
            let title = state.stream_title();
            let block = state.append_block(&title, "");
            state.stream = Some(StreamBlock {
                id,
                buffer: String::new(),
                block,
            });
            state.set_status("Streaming response...");
            vec![SessionCommand::RequestNextChunk { id }]
        }
        SessionEvent::StreamOpenFailed { id, error } => {
            state.stream_pending = false;
            state.push_line(format!("rill: failed to start response: {error}"));
            state.set_status("Response failed");
            match id {
                Some(id) => vec![SessionCommand::FinishStream {
                    id,
                    phase: StreamPhase::Failed,
                }],
                None => vec![],
            }
        }
        SessionEvent::ForegroundFinished { command, outcome } => {
            state.foreground = None;
            match outcome {
                ForegroundOutcome::Finished(result) => {
                    state.append_block(&format!("$ {command}"), &result.output);
                    state.set_status(format!("Command exited with status {}", result.exit_code));
                }
                ForegroundOutcome::Canceled => {
                    state.push_line(format!("$ {command}: canceled"));
                    state.set_status("Command canceled");
                }
                ForegroundOutcome::Error(error) => {
                    state.push_line(format!("$ {command}: {error}"));
                    state.set_status("Command failed to start");
                }
            }
            vec![]
        }
        SessionEvent::Catalog(result) => {
            let provider = result.provider.clone();
            state.catalog.absorb(result.rows(), &provider);
            if state.catalog.pending.is_empty() {
                state.set_status(format!(
                    "Model list ready ({} rows)",
                    state.catalog.rows.len()
                ));
            }
            vec![]
        }
        SessionEvent::HistorySaved { error } => {
            if let Some(error) = error {
                state.set_status(format!("History save failed: {error}"));
            }
            vec![]
        }
        SessionEvent::PlanSaved { path, error } => {
            match error {
                Some(error) => state.set_status(format!("Plan save failed: {error}")),
                None => state.set_status(format!("Plan written to {path}")),
            }
            vec![]
        }
    }
}

fn handle_user(state: &mut SessionState, command: UserCommand) -> Vec<SessionCommand> {
    match command {
        UserCommand::Submit(text) => submit(state, text.trim()),
        UserCommand::Cancel => cancel_active(state),
        UserCommand::CatalogMove(delta) => {
            state.catalog.move_selection(delta);
            vec![]
        }
        UserCommand::CatalogActivate => activate_catalog_selection(state),
        UserCommand::PaletteFilter(filter) => {
            state.palette.set_filter(&filter);
            vec![]
        }
        UserCommand::PaletteCycle { forward } => {
            state.palette.cycle(forward);
            vec![]
        }
        UserCommand::Run(request) => run_request(state, request),
        UserCommand::Quit => {
            state.should_quit = true;
            vec![SessionCommand::Quit]
        }
    }
}

fn submit(state: &mut SessionState, text: &str) -> Vec<SessionCommand> {
    if text.is_empty() {
        return vec![];
    }
    state.palette.reset();
    if let Some(command) = text.strip_prefix('/') {
        return handle_command(state, command);
    }
    if let Some(rest) = text.strip_prefix('!') {
        return submit_shell_escape(state, rest);
    }
    submit_prompt(state, text)
}

/// `!cmd args` runs foreground, `!& cmd args` runs in the background.
fn submit_shell_escape(state: &mut SessionState, rest: &str) -> Vec<SessionCommand> {
    let (background, rest) = match rest.strip_prefix('&') {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let mut words = rest.split_whitespace().map(ToString::to_string);
    let Some(command) = words.next() else {
        state.set_status("Nothing to run");
        return vec![];
    };
    let request = ExecRequest {
        command,
        args: words.collect(),
        workdir: None,
        background,
    };
    run_request(state, request)
}

fn run_request(state: &mut SessionState, request: ExecRequest) -> Vec<SessionCommand> {
    if request.command.trim().is_empty() {
        state.set_status("Nothing to run");
        return vec![];
    }
    if !request.background {
        if state.foreground.is_some() {
            state.set_status("A foreground command is already running");
            return vec![];
        }
        state.foreground = Some(request.display());
        state.set_status(format!("Running {}", request.display()));
    }
    vec![SessionCommand::Run { request }]
}

fn submit_prompt(state: &mut SessionState, text: &str) -> Vec<SessionCommand> {
    if state.provider.is_none() || state.model.is_none() {
        state.set_status("Select a model first (/model)");
        return vec![];
    }

    // A new prompt supersedes whatever is still streaming. The old
    // block's lines stay in the transcript as already rendered.
    state.stream = None;
    state.stream_pending = true;

    state.prompt_history.push(text.to_string());
    state.append_block("you", text);
    if state.session.title.is_empty() {
        state.session.title = truncate(text, TITLE_MAX);
    }
    state.session.summary = truncate(text, TITLE_MAX);

    vec![
        SessionCommand::SaveHistory,
        SessionCommand::BeginStream {
            prompt: text.to_string(),
        },
    ]
}

fn cancel_active(state: &mut SessionState) -> Vec<SessionCommand> {
    if state.palette.visible {
        state.palette.reset();
        return vec![];
    }
    if state.catalog.visible {
        state.catalog.visible = false;
        return vec![];
    }
    if state.foreground.is_some() {
        state.set_status("Canceling foreground command...");
        return vec![SessionCommand::CancelForeground];
    }
    if state.stream_pending {
        state.stream_pending = false;
        state.set_status("Response canceled");
        return vec![SessionCommand::CancelStream];
    }
    if let Some(stream) = state.stream.take() {
        let title = state.stream_title();
        let mut body = stream.buffer;
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("(canceled)");
        state.replace_block(stream.block, &title, &body);
        state.set_status("Response canceled");
        return vec![SessionCommand::CancelStream];
    }
    vec![]
}

fn activate_catalog_selection(state: &mut SessionState) -> Vec<SessionCommand> {
    let selected = state.catalog.selected().map(|row| {
        (
            row.provider.clone(),
            row.model.as_ref().map(|model| model.name.clone()),
        )
    });
    let Some((provider, model)) = selected else {
        return vec![];
    };
    let Some(model) = model else {
        state.set_status("That row is not selectable");
        return vec![];
    };
    state.catalog.visible = false;
    state.set_status(format!("Using {provider}/{model}"));
    state.provider = Some(provider);
    state.model = Some(model);
    vec![]
}

fn handle_command(state: &mut SessionState, command: &str) -> Vec<SessionCommand> {
    let mut words = command.split_whitespace();
    let name = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();
    match name {
        "model" => {
            if state.provider_names.is_empty() {
                state.set_status("No providers configured");
                return vec![];
            }
            state.catalog.reset(state.provider_names.clone());
            state.set_status("Fetching models...");
            vec![SessionCommand::FetchCatalog]
        }
        "provider" => {
            match rest.first() {
                Some(provider) => {
                    state.provider = Some((*provider).to_string());
                    state.set_status(format!("Provider set to {provider}"));
                }
                None => state.set_status("Usage: /provider <name>"),
            }
            vec![]
        }
        "jobs" => handle_jobs_command(state, &rest),
        "plan" => handle_plan_command(state, &rest),
        "mode" => {
            let mode = match rest.first() {
                Some(value) => match PlanMode::parse(value) {
                    Some(mode) => mode,
                    None => {
                        state.set_status("Usage: /mode [plan|auto|off]");
                        return vec![];
                    }
                },
                None => state.plan.mode.next(),
            };
            state.plan.mode = mode;
            state.set_status(format!("Mode: {}", mode.label()));
            vec![]
        }
        "status" => {
            show_status(state);
            vec![]
        }
        "help" => {
            show_help(state);
            vec![]
        }
        "quit" => {
            state.should_quit = true;
            vec![SessionCommand::Quit]
        }
        other => {
            state.set_status(format!("Unknown command: /{other}"));
            vec![]
        }
    }
}

fn handle_jobs_command(state: &mut SessionState, rest: &[&str]) -> Vec<SessionCommand> {
    match rest {
        [] => vec![SessionCommand::SyncJobs],
        ["cancel", id] => {
            state.set_status(format!("Canceling job {}", short_id(id)));
            vec![SessionCommand::CancelJob {
                id: (*id).to_string(),
            }]
        }
        _ => {
            state.set_status("Usage: /jobs [cancel <id>]");
            vec![]
        }
    }
}

fn handle_plan_command(state: &mut SessionState, rest: &[&str]) -> Vec<SessionCommand> {
    match rest {
        [] => {
            show_plan(state);
            vec![]
        }
        ["add", step @ ..] if !step.is_empty() => {
            state.plan.steps.push(PlanStep {
                text: step.join(" "),
                done: false,
            });
            state.set_status(format!("Plan: {} steps", state.plan.steps.len()));
            plan_autosave(state)
        }
        ["done", index] => {
            let Ok(number) = index.parse::<usize>() else {
                state.set_status("Usage: /plan done <number>");
                return vec![];
            };
            match number
                .checked_sub(1)
                .and_then(|index| state.plan.steps.get_mut(index))
            {
                Some(step) => {
                    step.done = true;
                    state.set_status(format!("Plan: step {number} done"));
                    plan_autosave(state)
                }
                None => {
                    state.set_status(format!("Plan has no step {number}"));
                    vec![]
                }
            }
        }
        ["clear"] => {
            state.plan.steps.clear();
            state.set_status("Plan cleared");
            plan_autosave(state)
        }
        ["save"] => vec![SessionCommand::SavePlan],
        _ => {
            state.set_status("Usage: /plan [add <step>|done <n>|clear|save]");
            vec![]
        }
    }
}

fn plan_autosave(state: &SessionState) -> Vec<SessionCommand> {
    if state.plan.file_backed && state.plan.auto_write {
        vec![SessionCommand::SavePlan]
    } else {
        vec![]
    }
}

fn show_plan(state: &mut SessionState) {
    if state.plan.steps.is_empty() {
        state.push_line("plan: empty".to_string());
        return;
    }
    let body: Vec<String> = state
        .plan
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let mark = if step.done { "x" } else { " " };
            format!("{}. [{mark}] {}", index + 1, step.text)
        })
        .collect();
    let body = body.join("\n");
    let title = format!("plan ({})", state.plan.mode.label());
    state.append_block(&title, &body);
}

fn show_status(state: &mut SessionState) {
    let model = match (&state.provider, &state.model) {
        (Some(provider), Some(model)) => format!("{provider}/{model}"),
        _ => "none".to_string(),
    };
    let running = state
        .jobs
        .values()
        .filter(|job| job.status == JobStatus::Running)
        .count();
    let body = format!(
        "session: {}\nmodel: {model}\nstreaming: {}\njobs running: {running}\nmode: {}",
        state.session.id,
        if state.stream.is_some() || state.stream_pending {
            "yes"
        } else {
            "no"
        },
        state.plan.mode.label(),
    );
    state.append_block("status", &body);
}

fn show_help(state: &mut SessionState) {
    let body = "/model            choose a model\n\
                /provider <name>  set the provider directly\n\
                /jobs             list background jobs\n\
                /jobs cancel <id> cancel a background job\n\
                /plan ...         manage the plan\n\
                /mode             cycle plan/auto/off\n\
                /status           show session status\n\
                /quit             leave\n\
                !cmd / !& cmd     run a shell command (fg / bg)";
    state.append_block("help", body);
}

fn handle_stream_chunk(
    state: &mut SessionState,
    message: crate::stream::StreamMessage,
) -> Vec<SessionCommand> {
    // Chunks from a superseded or canceled stream are dropped.
    let Some(stream) = &state.stream else {
        return vec![];
    };
    if stream.id != message.id {
        return vec![];
    }

    let id = message.id;
    match message.chunk {
        StreamChunk::Content(text) => {
            let Some(mut stream) = state.stream.take() else {
                return vec![];
            };
            stream.buffer.push_str(&text);
            let title = state.stream_title();
            stream.block = state.replace_block(stream.block, &title, &stream.buffer);
            state.stream = Some(stream);
            vec![SessionCommand::RequestNextChunk { id }]
        }
        StreamChunk::Done => {
            state.stream = None;
            state.set_status("Response complete");
            vec![SessionCommand::FinishStream {
                id,
                phase: StreamPhase::Completed,
            }]
        }
        StreamChunk::Failed(error) => {
            let Some(stream) = state.stream.take() else {
                return vec![];
            };
            let title = state.stream_title();
            let mut body = stream.buffer;
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&format!("(stream error: {error})"));
            state.replace_block(stream.block, &title, &body);
            state.set_status("Response failed");
            vec![SessionCommand::FinishStream {
                id,
                phase: StreamPhase::Failed,
            }]
        }
    }
}

fn record_job_event(state: &mut SessionState, job: &crate::exec::Job) {
    let id = short_id(&job.id);
    match job.status {
        JobStatus::Running => {
            state.push_line(format!("job {id} started: {}", job.display_command()));
        }
        JobStatus::Success => {
            state.push_line(format!("job {id} finished (exit 0)"));
        }
        JobStatus::Failed => {
            let reason = job
                .error
                .clone()
                .unwrap_or_else(|| format!("exit status {}", job.exit_code));
            state.push_line(format!("job {id} failed: {reason}"));
        }
    }
}

fn list_jobs(state: &mut SessionState) {
    if state.jobs.is_empty() {
        state.push_line("jobs: none".to_string());
        return;
    }
    let mut jobs: Vec<&crate::exec::Job> = state.jobs.values().collect();
    jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    let body: Vec<String> = jobs
        .iter()
        .map(|job| {
            format!(
                "{}  {:8}  {}",
                short_id(&job.id),
                job.status.label(),
                job.display_command()
            )
        })
        .collect();
    let body = body.join("\n");
    state.append_block("jobs", &body);
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}
