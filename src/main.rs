//! parley-server - real-time voice dialogue server.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Logging defaults to info; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    ExitCode::from(parley::cli::run().await)
}
