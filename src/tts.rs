//! Text-to-speech.
//!
//! The synthesizer contract is one sentence in, raw PCM16LE mono bytes out,
//! gathered to completion. The bundled adapter spawns a piper-style binary
//! per sentence: the text goes to the child's stdin, the raw samples come
//! back on stdout. Spawn and pipe faults get a short fixed-delay retry; a
//! sentence that exceeds its deadline is abandoned (the caller moves on to
//! the next one).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::retry::{with_retry, RetryPolicy};

/// Output sample rate advertised to clients in `tts_start`.
pub const TTS_SAMPLE_RATE: u32 = 22_050;

/// Synthesis contract. One call in flight per session.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize a sentence to PCM16LE mono bytes at [`sample_rate`].
    ///
    /// [`sample_rate`]: TextToSpeech::sample_rate
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PipelineError>;

    /// Output sample rate of the produced PCM.
    fn sample_rate(&self) -> u32 {
        TTS_SAMPLE_RATE
    }
}

/// TTS engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TtsConfig {
    /// Synthesizer executable.
    pub exe_path: PathBuf,
    /// Voice model file passed via `--model`.
    pub model_path: PathBuf,
    /// Output sample rate of the voice model.
    pub sample_rate: u32,
    /// Per-sentence synthesis deadline.
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            exe_path: PathBuf::from("piper"),
            model_path: PathBuf::from("voice.onnx"),
            sample_rate: TTS_SAMPLE_RATE,
            timeout_secs: 15,
        }
    }
}

/// Piper-style subprocess synthesizer.
pub struct PiperTts {
    config: TtsConfig,
    retry: RetryPolicy,
}

impl PiperTts {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            config,
            retry: RetryPolicy::synthesis(),
        }
    }

    async fn run_once(&self, text: &str) -> Result<Vec<u8>, PipelineError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let mut child = tokio::process::Command::new(&self.config.exe_path)
            .arg("--model")
            .arg(&self.config.model_path)
            .arg("--output_raw")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(PipelineError::Io)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Tts("no stdin handle".to_string()))?;
        let mut line = text.trim().to_string();
        line.push('\n');
        tokio::spawn(async move {
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| PipelineError::Timeout {
                stage: "synthesis",
                limit: timeout,
            })?
            .map_err(PipelineError::Io)?;

        if !output.status.success() {
            return Err(PipelineError::Tts(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        if output.stdout.is_empty() {
            return Err(PipelineError::Tts("engine produced no audio".to_string()));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl TextToSpeech for PiperTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        debug!(chars = text.len(), "synthesizing sentence");

        // Spawn/pipe faults are worth a second try; a timed-out sentence is
        // abandoned so the rest of the reply keeps flowing.
        let pcm = with_retry(
            &self.retry,
            || self.run_once(text),
            |e| matches!(e, PipelineError::Io(_)),
        )
        .await?;

        info!(
            bytes = pcm.len(),
            secs = pcm.len() as f64 / (self.config.sample_rate as f64 * 2.0),
            "synthesis complete"
        );
        Ok(pcm)
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_text_produces_no_audio() {
        let tts = PiperTts::new(TtsConfig::default());
        let pcm = tts.synthesize("   ").await.unwrap();
        assert!(pcm.is_empty());
    }

    #[test]
    fn test_default_sample_rate_is_advertised() {
        let tts = PiperTts::new(TtsConfig::default());
        assert_eq!(tts.sample_rate(), 22_050);
    }

    #[test]
    fn test_configured_sample_rate_overrides_default() {
        let tts = PiperTts::new(TtsConfig {
            sample_rate: 24_000,
            ..Default::default()
        });
        assert_eq!(tts.sample_rate(), 24_000);
    }
}
