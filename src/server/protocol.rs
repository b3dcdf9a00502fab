//! WebSocket protocol frames.
//!
//! Text frames are tagged JSON in both directions; binary frames carry PCM
//! audio (float32 LE 16 kHz inbound, PCM16LE outbound at the advertised
//! rate).

use serde::{Deserialize, Serialize};

/// Frames accepted from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Required first message.
    #[serde(rename = "hello")]
    Hello {
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Barge-in: cancel the current reply.
    #[serde(rename = "interrupt")]
    Interrupt,
    /// Load a saved conversation mid-connection.
    #[serde(rename = "load_session")]
    LoadSession { session_id: String },
    #[serde(rename = "ping")]
    Ping,
}

fn default_sample_rate() -> u32 {
    crate::audio::INPUT_SAMPLE_RATE
}

/// Frames sent to the client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake reply carrying the effective session id.
    #[serde(rename = "ready")]
    Ready { session_id: String },
    /// Final hypothesis for one utterance.
    #[serde(rename = "transcription")]
    Transcription { text: String },
    /// Complete assistant reply, sent once the dialog stream finishes.
    #[serde(rename = "llm_response")]
    LlmResponse { text: String },
    /// Opens a TTS audio burst; advertises the PCM rate of what follows.
    #[serde(rename = "tts_start")]
    TtsStart { sample_rate: u32 },
    /// Closes a TTS audio burst.
    #[serde(rename = "tts_stop")]
    TtsStop,
    /// Turn phase, for clients that surface it.
    #[serde(rename = "status")]
    Status { state: String },
    /// Non-fatal error notice.
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn status(state: &str) -> Self {
        ServerMessage::Status {
            state: state.to_string(),
        }
    }
}

/// Outbound queue entries: JSON frames pass through untouched, audio is
/// generation-stamped so the sender can drop stale chunks after barge-in.
#[derive(Debug)]
pub enum Outbound {
    Json(ServerMessage),
    Audio { generation: u64, pcm: Vec<u8> },
}
