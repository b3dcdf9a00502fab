//! Configuration.
//!
//! A typed TOML file with per-field defaults; unknown keys are rejected at
//! load. Environment variables override the file for deployment paths and
//! the bind address. Missing executable/model paths are a startup error
//! (exit code 2), not a runtime surprise.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::llm::BackendConfig;
use crate::segmenter::SegmenterConfig;
use crate::stt::SttConfig;
use crate::tts::TtsConfig;

/// Default config file, consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "parley.toml";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant in a real-time spoken \
conversation. Keep replies short and conversational, one to three sentences unless asked for \
detail. Do not use markdown, bullet points, or code blocks; your words are spoken aloud.";

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: ServerConfig,
    pub segmenter: SegmenterConfig,
    pub backend: BackendConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub session: SessionConfig,
}

/// Bind address for the public endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Per-session behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    /// System prompt pinned at position 0 of every conversation.
    pub system_prompt: String,
    /// Exchanges kept before FIFO pair eviction.
    pub max_history_turns: usize,
    /// Directory of persisted `<id>.json` conversations.
    pub sessions_dir: PathBuf,
    /// Sentences pre-synthesized ahead of playback.
    pub prefetch_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_history_turns: 16,
            sessions_dir: PathBuf::from("sessions"),
            prefetch_depth: 2,
        }
    }
}

impl Config {
    /// Load from the given file (or the default path when present), then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Environment overrides for deployment-specific values.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Env {
                var: "SERVER_PORT",
                value: port,
            })?;
        }
        if let Ok(path) = std::env::var("LLAMA_EXE_PATH") {
            self.backend.exe_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("LLAMA_MODEL_PATH") {
            self.backend.model_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PIPER_EXE_PATH") {
            self.tts.exe_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PIPER_MODEL_PATH") {
            self.tts.model_path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Check the paths the engines cannot run without. Executables given as
    /// bare names are resolved from `PATH` and not checked here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_exe("backend.exe_path", &self.backend.exe_path)?;
        check_file("backend.model_path", &self.backend.model_path)?;
        check_exe("tts.exe_path", &self.tts.exe_path)?;
        check_file("tts.model_path", &self.tts.model_path)?;
        Ok(())
    }
}

fn check_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingPath {
            what,
            path: path.display().to_string(),
        })
    }
}

fn check_exe(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    // a bare command name is left to PATH resolution at spawn time
    if path.components().count() <= 1 {
        return Ok(());
    }
    check_file(what, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.max_history_turns, 16);
        assert_eq!(config.session.prefetch_depth, 2);
        assert_eq!(config.segmenter.speech_threshold, 0.45);
        assert_eq!(config.backend.max_restarts, 5);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [session]
            max_history_turns = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.session.max_history_turns, 4);
        assert_eq!(config.backend.startup_timeout_secs, 60);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [server]
            prot = 9000
            "#,
        );
        assert!(result.is_err());

        let result: Result<Config, _> = toml::from_str(
            r#"
            [telemetry]
            enabled = true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_flags_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.backend.model_path = dir.path().join("missing.gguf");
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingPath {
                what: "backend.model_path",
                ..
            }
        ));
    }

    #[test]
    fn test_bare_exe_names_skip_existence_check() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.bin");
        std::fs::write(&model, b"stub").unwrap();

        let mut config = Config::default();
        config.backend.exe_path = PathBuf::from("llama-server");
        config.backend.model_path = model.clone();
        config.tts.exe_path = PathBuf::from("piper");
        config.tts.model_path = model;
        assert!(config.validate().is_ok());
    }
}
