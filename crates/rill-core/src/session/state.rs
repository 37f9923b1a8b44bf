//! Session state. Owned by the session loop; presenters only ever see
//! immutable snapshots of it.

use std::collections::BTreeMap;

use crate::catalog::CatalogRow;
use crate::config::Config;
use crate::exec::Job;
use crate::history::Session;
use crate::stream::StreamId;

/// Span of transcript lines occupied by one rendered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub start: usize,
    pub len: usize,
}

/// Frame a titled block as transcript lines.
pub fn block_lines(title: &str, body: &str) -> Vec<String> {
    let mut lines = vec![format!("\u{250c} {title}")];
    for line in body.lines() {
        lines.push(format!("\u{2502} {line}"));
    }
    lines.push("\u{2514}".to_string());
    lines
}

/// The in-flight response block being grown chunk by chunk.
#[derive(Debug, Clone)]
pub struct StreamBlock {
    pub id: StreamId,
    pub buffer: String,
    pub block: BlockRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanMode {
    #[default]
    Plan,
    Auto,
    Off,
}

impl PlanMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Auto => "auto",
            Self::Off => "off",
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::Plan => Self::Auto,
            Self::Auto => Self::Off,
            Self::Off => Self::Plan,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plan" => Some(Self::Plan),
            "auto" => Some(Self::Auto),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct PlanState {
    pub steps: Vec<PlanStep>,
    pub mode: PlanMode,
    pub file_backed: bool,
    pub auto_write: bool,
    pub file_path: String,
}

impl PlanState {
    fn from_config(config: &Config) -> Self {
        Self {
            steps: Vec::new(),
            mode: PlanMode::default(),
            file_backed: config.plan.file_backed(),
            auto_write: config.plan.auto_write,
            file_path: config.plan.file_path.clone(),
        }
    }

    /// Markdown rendering used for `/plan save` and auto-writes.
    pub fn render(&self) -> String {
        let mut out = String::from("# Plan\n\n");
        for step in &self.steps {
            let mark = if step.done { 'x' } else { ' ' };
            out.push_str(&format!("- [{mark}] {}\n", step.text));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CatalogState {
    pub visible: bool,
    pub rows: Vec<CatalogRow>,
    /// Providers whose fetch has not reported back yet.
    pub pending: Vec<String>,
    pub selection: usize,
}

impl CatalogState {
    pub fn reset(&mut self, pending: Vec<String>) {
        self.visible = true;
        self.rows.clear();
        self.pending = pending;
        self.selection = 0;
    }

    pub fn move_selection(&mut self, delta: i64) {
        if self.rows.is_empty() {
            self.selection = 0;
            return;
        }
        let len = self.rows.len() as i64;
        let next = (self.selection as i64 + delta).rem_euclid(len);
        self.selection = next as usize;
    }

    pub fn selected(&self) -> Option<&CatalogRow> {
        self.rows.get(self.selection)
    }

    fn clamp_selection(&mut self) {
        if self.selection >= self.rows.len() {
            self.selection = self.rows.len().saturating_sub(1);
        }
    }

    pub fn absorb(&mut self, rows: Vec<CatalogRow>, provider: &str) {
        self.pending.retain(|name| name != provider);
        self.rows.extend(rows);
        self.clamp_selection();
    }
}

pub const PALETTE_COMMANDS: &[&str] = &[
    "/help", "/jobs", "/mode", "/model", "/plan", "/provider", "/quit", "/status",
];

/// Slash-command palette with prefix filtering and cycling.
#[derive(Debug, Clone, Default)]
pub struct CommandPalette {
    pub visible: bool,
    pub filter: String,
    pub matches: Vec<&'static str>,
    pub selection: Option<usize>,
}

impl CommandPalette {
    pub fn set_filter(&mut self, filter: &str) {
        if !filter.starts_with('/') {
            self.reset();
            return;
        }
        self.visible = true;
        self.filter = filter.to_string();
        self.matches = PALETTE_COMMANDS
            .iter()
            .copied()
            .filter(|command| command.starts_with(filter))
            .collect();
        self.selection = None;
    }

    /// Step the highlighted match. Returns the newly selected command.
    pub fn cycle(&mut self, forward: bool) -> Option<&'static str> {
        if self.matches.is_empty() {
            return None;
        }
        let len = self.matches.len();
        let next = match (self.selection, forward) {
            (None, true) => 0,
            (None, false) => len - 1,
            (Some(current), true) => (current + 1) % len,
            (Some(current), false) => (current + len - 1) % len,
        };
        self.selection = Some(next);
        self.matches.get(next).copied()
    }

    pub fn current(&self) -> Option<&'static str> {
        self.selection.and_then(|index| self.matches.get(index).copied())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Everything the session loop tracks between events.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub transcript: Vec<String>,
    pub status: String,
    pub stream: Option<StreamBlock>,
    /// A stream open is in flight but has not reported back yet.
    pub stream_pending: bool,
    /// Mirror of executor jobs, updated from events and snapshots.
    pub jobs: BTreeMap<String, Job>,
    /// Display line of the running foreground command, if any.
    pub foreground: Option<String>,
    pub plan: PlanState,
    pub catalog: CatalogState,
    pub palette: CommandPalette,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub provider_names: Vec<String>,
    pub prompt_history: Vec<String>,
    pub session: Session,
    pub should_quit: bool,
}

impl SessionState {
    pub fn new(session: Session, config: &Config, provider_names: Vec<String>) -> Self {
        Self {
            transcript: Vec::new(),
            status: String::new(),
            stream: None,
            stream_pending: false,
            jobs: BTreeMap::new(),
            foreground: None,
            plan: PlanState::from_config(config),
            catalog: CatalogState::default(),
            palette: CommandPalette::default(),
            provider: None,
            model: None,
            provider_names,
            prompt_history: Vec::new(),
            session,
            should_quit: false,
        }
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.transcript.push(line.into());
    }

    /// Append a framed block and return its span.
    pub fn append_block(&mut self, title: &str, body: &str) -> BlockRef {
        let lines = block_lines(title, body);
        let start = self.transcript.len();
        let len = lines.len();
        self.transcript.extend(lines);
        BlockRef { start, len }
    }

    /// Re-render a block in place. Lines after it shift as needed.
    pub fn replace_block(&mut self, block: BlockRef, title: &str, body: &str) -> BlockRef {
        let lines = block_lines(title, body);
        let len = lines.len();
        let start = block.start.min(self.transcript.len());
        let end = (block.start + block.len).min(self.transcript.len());
        self.transcript.splice(start..end, lines);
        BlockRef { start, len }
    }

    /// Title for the streaming response block.
    pub fn stream_title(&self) -> String {
        match (&self.provider, &self.model) {
            (Some(provider), Some(model)) => format!("rill ({provider}/{model})"),
            _ => "rill".to_string(),
        }
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }
}
