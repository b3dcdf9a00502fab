//! Streaming chat client for the local llama-server backend.
//!
//! Speaks the OpenAI-compatible `/v1/chat/completions` endpoint with
//! `stream: true` and parses the SSE-style `data:` chunk framing off the
//! raw byte stream. Each chunk read carries an inactivity deadline; a
//! stalled or broken stream is reported to the supervisor so the health
//! loop rechecks the process immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::supervisor::Supervisor;
use super::{ChatBackend, ChatMessage};
use crate::error::PipelineError;
use crate::retry::{with_retry, RetryPolicy};

/// Soft inactivity deadline for each streamed chunk read.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for one backend instance.
pub struct LlamaClient {
    http: reqwest::Client,
    base_url: String,
    idle_timeout: Duration,
}

impl LlamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }

    /// Open a streaming completion request. 4xx responses are permanent;
    /// everything else that fails here is transient.
    async fn open(&self, messages: &[ChatMessage]) -> Result<reqwest::Response, PipelineError> {
        let request = ChatRequest {
            model: "local",
            messages,
            stream: true,
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::BackendTransient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::BackendRejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::BackendTransient(format!("{status}: {body}")));
        }

        Ok(response)
    }

    /// Drain the SSE body, forwarding content deltas as they arrive.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        deltas: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let mut stream = response.bytes_stream();
        let mut full = String::new();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                read = tokio::time::timeout(self.idle_timeout, stream.next()) => match read {
                    Err(_) => {
                        return Err(PipelineError::Timeout {
                            stage: "llm stream",
                            limit: self.idle_timeout,
                        })
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => return Err(PipelineError::BackendTransient(e.to_string())),
                    Ok(Some(Ok(bytes))) => bytes,
                },
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Events are separated by a blank line; each carries data lines.
            while let Some(pos) = buffer.find("\n\n") {
                let event: String = buffer.drain(..pos + 2).collect();
                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) {
                        if let Some(content) = parsed
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_deref())
                        {
                            full.push_str(content);
                            if deltas.send(content.to_string()).await.is_err() {
                                // downstream hung up: the turn is over
                                return Err(PipelineError::Cancelled);
                            }
                        }
                    }
                }
            }
        }

        debug!(chars = full.len(), "llm stream complete");
        Ok(full)
    }
}

/// The production [`ChatBackend`]: health-gated, retry-wrapped calls to the
/// supervised backend process.
pub struct LlamaChat {
    client: LlamaClient,
    supervisor: Arc<Supervisor>,
    retry: RetryPolicy,
}

impl LlamaChat {
    pub fn new(client: LlamaClient, supervisor: Arc<Supervisor>) -> Self {
        Self {
            client,
            supervisor,
            retry: RetryPolicy::backend(),
        }
    }
}

#[async_trait]
impl ChatBackend for LlamaChat {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        deltas: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        self.supervisor.await_healthy().await?;

        // Retries cover connection establishment only. Once streaming has
        // begun, deltas have already reached the splitter and cannot be
        // replayed; a mid-stream fault surfaces as one transient error.
        let response = with_retry(
            &self.retry,
            || self.client.open(messages),
            PipelineError::is_transient,
        )
        .await?;

        match self.client.read_stream(response, &deltas, cancel).await {
            Ok(full) => Ok(full),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(error = %e, "llm stream failed, flagging backend");
                self.supervisor.report_unhealthy();
                match e {
                    PipelineError::Timeout { .. } => Err(PipelineError::BackendTransient(
                        "stream stalled past inactivity deadline".to_string(),
                    )),
                    other => Err(other),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_response_parsing() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("Hel"));

        // role-only first chunk has no content
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        assert!(parsed.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_chat_request_shape() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "local",
            messages: &messages,
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[tokio::test]
    async fn test_open_against_closed_port_is_transient() {
        let client = LlamaClient::new("http://127.0.0.1:1");
        let err = client.open(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(err.is_transient(), "got {err}");
    }
}
