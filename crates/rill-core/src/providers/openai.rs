//! OpenAI chat completions client (SSE streaming).

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiClient {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: &str) -> Self {
        Self::with_name("openai", base_url, api_key)
    }

    /// A named instance, for configurations that register the same
    /// wire dialect under several endpoints.
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
                "API key missing; set [providers.openai] api_key",
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
            "messages": [{"role": "user", "content": join_content(&req.messages)}],
            "stream": true,
        });
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
                    Ok(event) => parse_chunk(&event.data),
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

fn parse_chunk(data: &str) -> Option<StreamChunk> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(StreamChunk::Done);
    }
    let chunk: CompletionChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(err) => {
            return Some(StreamChunk::Failed(
                ProviderError::new(ProviderErrorKind::Parse, "malformed stream chunk")
                    .with_details(err.to_string()),
            ));
        }
    };
    let choice = chunk.choices.into_iter().next()?;
    if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
        return Some(StreamChunk::Content(content));
    }
    if choice.finish_reason.is_some() {
        return Some(StreamChunk::Done);
    }
    None
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl Provider for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn list_models(&self) -> BoxFuture<'_, ProviderResult<Vec<Model>>> {
        Box::pin(async move {
            Ok(vec![
                model(
                    "gpt-5",
                    "Flagship general model",
                    &["chat", "tools"],
                    &[("tier", "flagship")],
                ),
                model(
                    "gpt-5.1",
                    "Latest general model",
                    &["chat", "tools"],
                    &[("tier", "latest")],
                ),
                model(
                    "gpt-5.1-codex",
                    "Code-focused model",
                    &["chat", "code"],
                    &[("tier", "code")],
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
