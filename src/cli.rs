//! Command-line interface.
//!
//! Exit codes: 0 clean shutdown, 2 configuration error, 3 backend
//! permanently dead at startup, 1 anything else.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use crate::config::Config;
use crate::error::PipelineError;

#[derive(Parser)]
#[command(name = "parley-server", version, about = "Real-time voice dialogue server")]
pub struct Cli {
    /// Configuration file (TOML). Defaults to ./parley.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the dialogue server (the default).
    Serve {
        /// Bind host, overriding config and SERVER_HOST.
        #[arg(long)]
        host: Option<String>,
        /// Bind port, overriding config and SERVER_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate the configuration and print the effective values.
    CheckConfig,
}

/// Parse arguments and run. Returns the process exit code.
pub async fn run() -> u8 {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            eprintln!("configuration error: {e}");
            return 2;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => {
            if let Err(e) = config.validate() {
                eprintln!("configuration error: {e}");
                return 2;
            }
            print_config(&config);
            0
        }
        Some(Command::Serve { host, port }) => serve(config, host, port).await,
        None => serve(config, None, None).await,
    }
}

async fn serve(mut config: Config, host: Option<String>, port: Option<u16>) -> u8 {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    if let Err(e) = config.validate() {
        error!("configuration error: {e}");
        eprintln!("configuration error: {e}");
        return 2;
    }

    match crate::server::start(config).await {
        Ok(()) => 0,
        Err(PipelineError::BackendUnavailable) => {
            error!("backend never became healthy, giving up");
            3
        }
        Err(e) => {
            error!("server failed: {e}");
            1
        }
    }
}

fn print_config(config: &Config) {
    println!("server:   {}:{}", config.server.host, config.server.port);
    println!(
        "backend:  {} -m {} ({})",
        config.backend.exe_path.display(),
        config.backend.model_path.display(),
        config.backend.base_url()
    );
    println!(
        "tts:      {} --model {} @ {} Hz",
        config.tts.exe_path.display(),
        config.tts.model_path.display(),
        config.tts.sample_rate
    );
    println!(
        "stt:      {} (model {})",
        config.stt.command.display(),
        config.stt.model
    );
    println!(
        "sessions: {} (history {} turns, prefetch {})",
        config.session.sessions_dir.display(),
        config.session.max_history_turns,
        config.session.prefetch_depth
    );
}
