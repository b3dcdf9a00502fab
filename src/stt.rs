//! Speech-to-text.
//!
//! The transcriber is a black box behind [`SpeechToText`]: one utterance in,
//! one trimmed (possibly empty) hypothesis out. The bundled adapter drives a
//! whisper-style helper process: the utterance is packed into an in-memory
//! WAV, base64-encoded onto the child's stdin, and the child answers with a
//! JSON object on stdout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::audio::{f32_to_i16, INPUT_SAMPLE_RATE};
use crate::error::PipelineError;
use crate::retry::{with_retry, RetryPolicy};

/// Transcription contract. One call in flight per session.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe mono 16 kHz samples to text. May return an empty string.
    async fn transcribe(&self, samples: &[f32]) -> Result<String, PipelineError>;
}

/// STT engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SttConfig {
    /// Helper executable (reads base64 WAV on stdin, prints JSON).
    pub command: PathBuf,
    /// Model name passed to the helper (tiny, base, small, ...).
    pub model: String,
    /// Per-utterance transcription deadline.
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("whisper-stdin"),
            model: "base".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Whisper-style subprocess transcriber.
pub struct WhisperSubprocess {
    config: SttConfig,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    error: String,
}

impl WhisperSubprocess {
    pub fn new(config: SttConfig) -> Self {
        Self {
            config,
            retry: RetryPolicy::transcription(),
        }
    }

    async fn run_once(&self, audio_b64: &str) -> Result<String, PipelineError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let mut child = tokio::process::Command::new(&self.config.command)
            .arg("-") // read from stdin
            .arg(&self.config.model)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(PipelineError::Io)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Stt("no stdin handle".to_string()))?;
        let payload = audio_b64.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| PipelineError::Timeout {
                stage: "transcription",
                limit: timeout,
            })?
            .map_err(PipelineError::Io)?;

        if !output.status.success() {
            return Err(PipelineError::Stt(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let response: SttResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Stt(format!("malformed engine output: {e}")))?;
        if !response.error.is_empty() {
            return Err(PipelineError::Stt(response.error));
        }

        Ok(response.text.trim().to_string())
    }
}

#[async_trait]
impl SpeechToText for WhisperSubprocess {
    async fn transcribe(&self, samples: &[f32]) -> Result<String, PipelineError> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        debug!(
            samples = samples.len(),
            secs = samples.len() as f32 / INPUT_SAMPLE_RATE as f32,
            "transcribing utterance"
        );

        let wav = pcm_to_wav(&f32_to_i16(samples), INPUT_SAMPLE_RATE)
            .map_err(|e| PipelineError::Stt(e.to_string()))?;
        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(&wav);

        // One retry covers the engine's model cold start.
        let text = with_retry(
            &self.retry,
            || self.run_once(&audio_b64),
            |e| !matches!(e, PipelineError::Timeout { .. }),
        )
        .await?;

        info!(chars = text.len(), "transcription complete");
        Ok(text)
    }
}

/// Pack PCM i16 samples into an in-memory mono WAV.
fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).context("failed to create WAV writer")?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_wav_layout() {
        let samples = vec![0i16; 16000]; // 1 s of silence
        let wav = pcm_to_wav(&samples, 16000).unwrap();
        // 44-byte header plus 2 bytes per sample
        assert_eq!(wav.len(), 44 + 32000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[tokio::test]
    async fn test_empty_utterance_short_circuits() {
        let stt = WhisperSubprocess::new(SttConfig::default());
        let text = stt.transcribe(&[]).await.unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn test_stt_response_parsing() {
        let ok: SttResponse = serde_json::from_str(r#"{"text":" hello there "}"#).unwrap();
        assert_eq!(ok.text.trim(), "hello there");

        let err: SttResponse = serde_json::from_str(r#"{"error":"model not found"}"#).unwrap();
        assert_eq!(err.error, "model not found");
    }
}
