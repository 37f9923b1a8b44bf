//! Chat completion providers.
//!
//! Each provider exposes a model catalog and a streaming chat call.
//! Streams are delivered through a bounded channel so consumers pull
//! chunks at their own pace; the provider task blocks on the channel
//! between pulls.

pub mod anthropic;
pub mod openai;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One queued chunk per stream keeps the producer in lockstep with the
/// consumer's pull cadence.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Custom,
}

impl ProviderKind {
    pub fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Custom => "custom",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::Custom => "Custom",
        }
    }
}

/// Catalog entry returned by [`Provider::list_models`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Model {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Non-success HTTP status from the provider endpoint.
    HttpStatus,
    /// The request did not complete within its deadline.
    Timeout,
    /// The response body or stream could not be decoded.
    Parse,
    /// The provider reported an application-level error.
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        if !details.trim().is_empty() {
            self.details = Some(details);
        }
        self
    }

    pub fn http_status(status: reqwest::StatusCode, body: &str) -> Self {
        Self::new(
            ProviderErrorKind::HttpStatus,
            format!("unexpected status {}", status.as_u16()),
        )
        .with_details(body)
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("timed out after {seconds}s"),
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {details}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// One pull's worth of streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Content(String),
    /// Terminal. The stream died mid-flight.
    Failed(ProviderError),
    /// Terminal. The provider signaled completion.
    Done,
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Content(_))
    }
}

pub type ChunkReceiver = mpsc::Receiver<StreamChunk>;

/// A chat completion backend.
///
/// `stream_chat` resolves once the response stream is open; chunks
/// then arrive on the returned receiver. Canceling the token stops the
/// producer task promptly, though a chunk already in the channel may
/// still be delivered.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn list_models(&self) -> BoxFuture<'_, ProviderResult<Vec<Model>>>;
    fn stream_chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ProviderResult<ChunkReceiver>>;
}

/// Registered providers, in configuration order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|provider| provider.name().eq_ignore_ascii_case(name))
            .cloned()
    }
}

/// Flatten a conversation into a single prompt string, newest last.
pub(crate) fn join_content(messages: &[ChatMessage]) -> String {
    let parts: Vec<&str> = messages
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    parts.join("\n")
}
