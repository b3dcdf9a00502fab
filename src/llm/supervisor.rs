//! LLM backend process supervision.
//!
//! The supervisor owns the backend child process and presents a single
//! health gate to the dialog path. Lifecycle:
//!
//! 1. Start: spawn, poll the HTTP health endpoint until 200 or the startup
//!    timeout; on timeout kill and mark dead.
//! 2. Health loop: probe every `health_interval_secs`; three consecutive
//!    failures (or an exited child) trigger a restart.
//! 3. Restart: SIGTERM, 5 s grace, SIGKILL; back off `2^n` seconds capped
//!    at 30 s; re-run start. After `max_restarts` failed attempts the
//!    backend is permanently dead and callers get `BackendUnavailable`.
//! 4. Shutdown: terminate the child and reap it.
//!
//! The supervisor is the single writer of its state; readers watch the
//! channel and callers that need a healthy backend await it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::process::Child;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;

/// Backend process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendConfig {
    /// Server executable (llama-server or compatible).
    pub exe_path: PathBuf,
    /// GGUF model file passed via `-m`.
    pub model_path: PathBuf,
    /// Bind host for the backend HTTP endpoint.
    pub host: String,
    /// Bind port for the backend HTTP endpoint.
    pub port: u16,
    /// Additional flags appended verbatim.
    pub extra_args: Vec<String>,
    /// Seconds to wait for the health endpoint after spawn.
    pub startup_timeout_secs: u64,
    /// Health probe period.
    pub health_interval_secs: u64,
    /// Health probe request timeout.
    pub health_timeout_secs: u64,
    /// Consecutive probe failures before a restart.
    pub unhealthy_after: u32,
    /// Failed restart attempts before the backend is declared dead.
    pub max_restarts: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            exe_path: PathBuf::from("llama-server"),
            model_path: PathBuf::from("model.gguf"),
            host: "127.0.0.1".to_string(),
            port: 8601,
            extra_args: Vec::new(),
            startup_timeout_secs: 60,
            health_interval_secs: 30,
            health_timeout_secs: 5,
            unhealthy_after: 3,
            max_restarts: 5,
        }
    }
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Observable backend health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Starting,
    Healthy,
    Unhealthy,
    Restarting,
    Dead,
}

/// Owns the backend child process and its health state.
pub struct Supervisor {
    config: BackendConfig,
    http: reqwest::Client,
    state_tx: watch::Sender<BackendState>,
    child: Mutex<Option<Child>>,
    restarts: AtomicU32,
    booted_at: std::sync::Mutex<Option<Instant>>,
    recheck: Notify,
    shutdown_token: CancellationToken,
}

impl Supervisor {
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(BackendState::Starting);
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            state_tx,
            child: Mutex::new(None),
            restarts: AtomicU32::new(0),
            booted_at: std::sync::Mutex::new(None),
            recheck: Notify::new(),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn state(&self) -> BackendState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state_tx.subscribe()
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Time since the current process passed its startup health check.
    pub fn uptime(&self) -> Option<Duration> {
        self.booted_at.lock().unwrap().map(|t| t.elapsed())
    }

    fn set_state(&self, state: BackendState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            info!(?previous, current = ?state, "backend state changed");
            self.state_tx.send_replace(state);
        }
    }

    /// Spawn the backend and wait for it to come up.
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.set_state(BackendState::Starting);
        self.spawn_child().await?;

        if self.wait_for_startup().await {
            *self.booted_at.lock().unwrap() = Some(Instant::now());
            self.set_state(BackendState::Healthy);
            Ok(())
        } else {
            error!(
                timeout_secs = self.config.startup_timeout_secs,
                "backend failed to become healthy, giving up"
            );
            self.stop_child().await;
            self.set_state(BackendState::Dead);
            Err(PipelineError::BackendUnavailable)
        }
    }

    async fn spawn_child(&self) -> Result<(), PipelineError> {
        let mut command = tokio::process::Command::new(&self.config.exe_path);
        command
            .arg("-m")
            .arg(&self.config.model_path)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .args(&self.config.extra_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(PipelineError::Io)?;
        info!(pid = child.id(), exe = %self.config.exe_path.display(), "backend spawned");
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Poll the health endpoint once per second until the startup deadline.
    async fn wait_for_startup(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);
        while Instant::now() < deadline {
            if self.shutdown_token.is_cancelled() {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.probe(Duration::from_secs(2)).await {
                return true;
            }
        }
        false
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let url = format!("{}/health", self.config.base_url());
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health probe failed");
                false
            }
        }
    }

    /// External evidence of trouble (e.g. a stalled completion stream).
    /// Flags the state and wakes the health loop for an immediate recheck.
    pub fn report_unhealthy(&self) {
        if self.state() == BackendState::Healthy {
            self.set_state(BackendState::Unhealthy);
        }
        self.recheck.notify_one();
    }

    /// Resolve once the backend is healthy; error once it is dead.
    pub async fn await_healthy(&self) -> Result<(), PipelineError> {
        let mut rx = self.subscribe();
        loop {
            match *rx.borrow_and_update() {
                BackendState::Healthy => return Ok(()),
                BackendState::Dead => return Err(PipelineError::BackendUnavailable),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(PipelineError::BackendUnavailable);
            }
        }
    }

    /// Run the health loop on a dedicated task.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run().await })
    }

    async fn run(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.health_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = self.recheck.notified() => {}
                _ = ticker.tick() => {}
            }

            if self.state() == BackendState::Dead {
                break;
            }

            // An exited child is restarted without waiting out the probe
            // failure budget.
            let exited = {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => child.try_wait().ok().flatten().is_some(),
                    None => true,
                }
            };
            if exited {
                warn!("backend process exited");
                self.restart_cycle().await;
                failures = 0;
                continue;
            }

            if self
                .probe(Duration::from_secs(self.config.health_timeout_secs))
                .await
            {
                failures = 0;
                self.set_state(BackendState::Healthy);
            } else {
                failures += 1;
                warn!(failures, "backend health probe failed");
                if failures >= self.config.unhealthy_after {
                    self.set_state(BackendState::Unhealthy);
                    self.restart_cycle().await;
                    failures = 0;
                }
            }
        }
        debug!("health loop stopped");
    }

    /// Kill the current child and retry startup with exponential backoff
    /// until it comes up or the restart budget is exhausted.
    async fn restart_cycle(&self) {
        self.set_state(BackendState::Restarting);
        self.stop_child().await;

        loop {
            let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_restarts {
                error!(
                    attempts = attempt - 1,
                    "restart budget exhausted, backend is dead"
                );
                self.set_state(BackendState::Dead);
                return;
            }

            let backoff = restart_backoff(attempt);
            warn!(attempt, ?backoff, "restarting backend");
            tokio::select! {
                _ = self.shutdown_token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            if self.spawn_child().await.is_err() {
                continue;
            }
            if self.wait_for_startup().await {
                *self.booted_at.lock().unwrap() = Some(Instant::now());
                self.set_state(BackendState::Healthy);
                info!(attempt, "backend restarted");
                return;
            }
            self.stop_child().await;
        }
    }

    /// Graceful child shutdown: SIGTERM, 5 s grace, then SIGKILL and reap.
    async fn stop_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                if let Ok(status) =
                    tokio::time::timeout(Duration::from_secs(5), child.wait()).await
                {
                    debug!(?status, "backend exited on SIGTERM");
                    return;
                }
            }
        }

        let _ = child.kill().await;
        let _ = child.wait().await;
        debug!("backend force-killed");
    }

    /// Stop the health loop and the child.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.shutdown_token.cancel();
        self.stop_child().await;
        self.set_state(BackendState::Dead);
    }
}

/// Backoff before restart attempt `n` (1-based): `2^(n-1)` s capped at 30 s.
fn restart_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt.saturating_sub(1)).min(5)).min(Duration::from_secs(30))
}
