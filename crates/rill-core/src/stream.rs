//! Streaming response coordination.
//!
//! At most one stream is active at a time. Each stream gets a fresh
//! [`StreamId`], so chunks from a superseded or canceled stream can be
//! recognized and dropped by the consumer. The provider connection is
//! opened inside the stream's own task; [`StreamCoordinator::begin`]
//! never blocks the caller. Chunks are forwarded one per
//! [`StreamCoordinator::request_next`] call, which gives the consumer
//! pull-based backpressure over the producer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::providers::{ChatRequest, Provider, ProviderError, StreamChunk};

/// Identity of one streaming attempt. Monotonic per coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

impl StreamId {
    #[cfg(test)]
    pub(crate) fn fixed(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    Completed,
    Canceled,
    Failed,
}

impl StreamPhase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

/// A chunk tagged with the stream it belongs to.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: StreamId,
    pub chunk: StreamChunk,
}

/// Notifications from a stream's task. `Started` arrives once the
/// provider connection is open; a canceled open emits nothing.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Started(StreamId),
    OpenFailed { id: StreamId, error: ProviderError },
    Chunk(StreamMessage),
}

struct ActiveStream {
    id: StreamId,
    cancel: CancellationToken,
    pull_tx: mpsc::UnboundedSender<()>,
}

pub struct StreamCoordinator {
    next_id: u64,
    phase: StreamPhase,
    active: Option<ActiveStream>,
}

impl Default for StreamCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCoordinator {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            phase: StreamPhase::Idle,
            active: None,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_id(&self) -> Option<StreamId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// Start a new stream, canceling any active one first. Returns
    /// immediately; the provider connection is opened on the stream's
    /// own task, which reports back through `emit`. Pulls issued
    /// before the open completes are queued.
    pub fn begin<F>(&mut self, provider: Arc<dyn Provider>, req: ChatRequest, emit: F) -> StreamId
    where
        F: Fn(StreamUpdate) + Send + 'static,
    {
        self.cancel();

        let id = StreamId(self.next_id);
        self.next_id += 1;

        let cancel = CancellationToken::new();
        let (pull_tx, mut pull_rx) = mpsc::unbounded_channel::<()>();

        let token = cancel.clone();
        tokio::spawn(async move {
            let opened = tokio::select! {
                opened = provider.stream_chat(req, token.clone()) => opened,
                () = token.cancelled() => return,
            };
            let mut chunks = match opened {
                Ok(chunks) => chunks,
                Err(error) => {
                    emit(StreamUpdate::OpenFailed { id, error });
                    return;
                }
            };
            emit(StreamUpdate::Started(id));
            while pull_rx.recv().await.is_some() {
                // A closed chunk channel means the producer died without
                // a terminal chunk; treat that as completion.
                let chunk = chunks.recv().await.unwrap_or(StreamChunk::Done);
                let terminal = chunk.is_terminal();
                emit(StreamUpdate::Chunk(StreamMessage { id, chunk }));
                if terminal {
                    break;
                }
            }
        });

        self.active = Some(ActiveStream {
            id,
            cancel,
            pull_tx,
        });
        self.phase = StreamPhase::Streaming;
        id
    }

    /// Pull one more chunk from the identified stream. Pulls against a
    /// superseded stream are ignored.
    pub fn request_next(&self, id: StreamId) {
        if let Some(active) = &self.active
            && active.id == id
        {
            let _ = active.pull_tx.send(());
        }
    }

    /// Cancel the active stream. Chunks already emitted are unaffected;
    /// nothing further is pulled. Returns false when idle.
    pub fn cancel(&mut self) -> bool {
        self.close(StreamPhase::Canceled)
    }

    /// Record the terminal phase the identified stream reported about
    /// itself. Ignored when that stream is no longer the active one.
    pub fn finish(&mut self, id: StreamId, phase: StreamPhase) {
        if self.active.as_ref().is_some_and(|active| active.id == id) {
            self.close(phase);
        }
    }

    fn close(&mut self, phase: StreamPhase) -> bool {
        match self.active.take() {
            Some(active) => {
                active.cancel.cancel();
                self.phase = phase;
                true
            }
            None => false,
        }
    }
}
