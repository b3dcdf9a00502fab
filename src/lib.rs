//! Parley - real-time full-duplex voice dialogue server.
//!
//! Accepts a continuous microphone stream over WebSocket, segments it into
//! utterances with VAD, transcribes each one, streams a reply from a
//! supervised local LLM backend, and speaks it back sentence-by-sentence
//! with prefetched TTS - all interruptible by barge-in.
//!
//! Pipeline per connection:
//!
//! ```text
//! ingress ─► segmenter ─► transcriber ─► dialog engine ─► splitter ─► synthesizer ─► egress
//!                ▲                                                        │
//!                └──── barge-in ── interrupt controller ◄─────────────────┘
//! ```

pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod retry;
pub mod segmenter;
pub mod server;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::Config;
pub use error::{ConfigError, PipelineError};
pub use server::start as start_server;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
