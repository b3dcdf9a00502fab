//! LLM backend integration: supervised child process, streaming client,
//! and the dialog engine that maintains conversation history.

pub mod client;
pub mod dialog;
pub mod supervisor;

pub use client::{LlamaChat, LlamaClient};
pub use dialog::{DialogEngine, History, Role, Turn};
pub use supervisor::{BackendConfig, BackendState, Supervisor};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// One message in an OpenAI-compatible chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Streaming chat seam between the dialog engine and the backend.
///
/// Implementations send each text delta through `deltas` as it arrives and
/// return the full reply on completion. A fired `cancel` token must abort
/// the stream with [`PipelineError::Cancelled`]; deltas already sent stand.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        deltas: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError>;
}
