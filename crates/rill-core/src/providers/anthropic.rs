//! Anthropic messages client (SSE streaming).

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    CHUNK_CHANNEL_CAPACITY, ChatRequest, ChunkReceiver, Model, Provider, ProviderError,
    ProviderErrorKind, ProviderKind, ProviderResult, StreamChunk, join_content,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(base_url: Option<&str>, api_key: &str) -> Self {
        Self::with_name("anthropic", base_url, api_key)
    }

    pub fn with_name(name: &str, base_url: Option<&str>, api_key: &str) -> Self {
        let base_url = base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            name: name.to_string(),
            base_url,
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn check_api_key(&self) -> ProviderResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::Api,
                "API key missing; set [providers.anthropic] api_key",
            ));
        }
        Ok(())
    }

    async fn open_stream(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ChunkReceiver> {
        self.check_api_key()?;

        let payload = json!({
            "model": req.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": join_content(&req.messages)}],
            "stream": true,
        });
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                ProviderError::new(ProviderErrorKind::Api, "request failed")
                    .with_details(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status, &body));
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let mut events = response.bytes_stream().eventsource();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.next() => event,
                    () = cancel.cancelled() => break,
                };
                let Some(event) = event else {
                    let _ = tx.send(StreamChunk::Done).await;
                    break;
                };
                let chunk = match event {
                    Ok(event) => parse_event(&event.data),
                    Err(err) => Some(StreamChunk::Failed(
                        ProviderError::new(ProviderErrorKind::Parse, "stream read failed")
                            .with_details(err.to_string()),
                    )),
                };
                let Some(chunk) = chunk else { continue };
                let terminal = chunk.is_terminal();
                if tx.send(chunk).await.is_err() || terminal {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

fn parse_event(data: &str) -> Option<StreamChunk> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(err) => {
            return Some(StreamChunk::Failed(
                ProviderError::new(ProviderErrorKind::Parse, "malformed stream event")
                    .with_details(err.to_string()),
            ));
        }
    };
    match event.kind.as_str() {
        "content_block_delta" => event
            .delta
            .and_then(|delta| delta.text)
            .filter(|text| !text.is_empty())
            .map(StreamChunk::Content),
        "message_delta" => event
            .delta
            .and_then(|delta| delta.stop_reason)
            .map(|_| StreamChunk::Done),
        "message_stop" => Some(StreamChunk::Done),
        "error" => {
            let message = event
                .error
                .map_or_else(|| "provider error".to_string(), |err| err.message);
            Some(StreamChunk::Failed(ProviderError::new(
                ProviderErrorKind::Api,
                message,
            )))
        }
        // ping, message_start, content_block_start, content_block_stop
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl Provider for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn list_models(&self) -> BoxFuture<'_, ProviderResult<Vec<Model>>> {
        Box::pin(async move {
            Ok(vec![
                model(
                    "claude-4.5-sonnet",
                    "Balanced intelligence and speed",
                    &["chat", "tools"],
                    &[("tier", "balanced")],
                ),
                model(
                    "claude-4.5-haiku",
                    "Fast, lightweight model",
                    &["chat"],
                    &[("tier", "fast")],
                ),
                model(
                    "claude-4.1-opus",
                    "Deep reasoning model",
                    &["chat", "tools"],
                    &[("tier", "deep")],
                ),
            ])
        })
    }

    fn stream_chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ProviderResult<ChunkReceiver>> {
        Box::pin(self.open_stream(req, cancel))
    }
}

fn model(name: &str, description: &str, capabilities: &[&str], tags: &[(&str, &str)]) -> Model {
    Model {
        name: name.to_string(),
        description: description.to_string(),
        capabilities: capabilities.iter().map(ToString::to_string).collect(),
        tags: tags
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_delta_yields_text() {
        let chunk = parse_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert_eq!(chunk, Some(StreamChunk::Content("Hi".to_string())));
    }

    #[test]
    fn message_delta_with_stop_reason_ends_the_stream() {
        let chunk =
            parse_event(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#);
        assert_eq!(chunk, Some(StreamChunk::Done));
    }

    #[test]
    fn message_stop_ends_the_stream() {
        assert_eq!(parse_event(r#"{"type":"message_stop"}"#), Some(StreamChunk::Done));
    }

    #[test]
    fn ping_and_block_boundaries_are_skipped() {
        assert_eq!(parse_event(r#"{"type":"ping"}"#), None);
        assert_eq!(parse_event(r#"{"type":"message_start","message":{}}"#), None);
        assert_eq!(
            parse_event(r#"{"type":"content_block_stop","index":0}"#),
            None
        );
    }

    #[test]
    fn error_event_fails_the_stream() {
        let chunk = parse_event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(matches!(
            chunk,
            Some(StreamChunk::Failed(err))
                if err.kind == ProviderErrorKind::Api && err.message == "Overloaded"
        ));
    }

    #[test]
    fn malformed_event_fails_the_stream() {
        assert!(matches!(
            parse_event("{broken"),
            Some(StreamChunk::Failed(err)) if err.kind == ProviderErrorKind::Parse
        ));
    }
}
