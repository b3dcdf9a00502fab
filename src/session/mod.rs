//! Per-connection session: the streaming pipeline orchestrator.
//!
//! Each WebSocket connection owns one session. The connection task feeds
//! audio through the segmenter and posts utterances to the session's turn
//! driver, a dedicated task that processes exactly one turn at a time:
//!
//! ```text
//! utterance ─► transcribe ─► dialog stream ─► splitter ─► prefetch ─► egress
//!                  ▲               ▲              ▲            ▲
//!                  └───────────────┴── generation stamp + cancel token ──┘
//! ```
//!
//! Barge-in bumps the generation and cancels the current token; the driver
//! rewinds the dialog with whatever partial reply the user heard, stale
//! audio is dropped before it reaches the socket, and the next queued
//! utterance starts a fresh turn.

pub mod interrupt;
pub mod prefetch;
pub mod splitter;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::llm::{ChatBackend, DialogEngine};
use crate::segmenter::Utterance;
use crate::server::protocol::{Outbound, ServerMessage};
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use interrupt::InterruptController;
use splitter::SentenceSplitter;
use store::{SavedSession, SessionStore};

/// Everything a session needs, constructed once at server startup and
/// passed into the session factory.
pub struct SessionServices {
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub chat: Arc<dyn ChatBackend>,
    pub store: Arc<SessionStore>,
    pub system_prompt: String,
    pub max_history_turns: usize,
    pub prefetch_depth: usize,
}

/// Work posted to the turn driver. Processed strictly in order, one at a
/// time, which is what defers a `load_session` to the end of the turn
/// currently running.
#[derive(Debug)]
pub enum DriverMsg {
    Utterance(Utterance),
    LoadSession(String),
}

/// Connection-side handle to a running session.
pub struct SessionHandle {
    pub driver_tx: mpsc::Sender<DriverMsg>,
    pub ctrl: Arc<InterruptController>,
    pub tts_active: Arc<AtomicBool>,
    pub turn_busy: Arc<AtomicBool>,
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    /// Fire a barge-in: bump the generation, cancel the running turn, and
    /// close the audio burst if one was open. `tts_stop` is sent only when
    /// a `tts_start` went out this turn.
    pub async fn interrupt(&self, outbound: &mpsc::Sender<Outbound>) {
        self.ctrl.interrupt();
        if self.tts_active.swap(false, Ordering::SeqCst) {
            let _ = outbound.send(Outbound::Json(ServerMessage::TtsStop)).await;
        }
    }
}

/// Spawn the turn driver for one connection.
pub fn spawn_session(
    id: String,
    restored: Option<SavedSession>,
    services: Arc<SessionServices>,
    ctrl: Arc<InterruptController>,
    outbound: mpsc::Sender<Outbound>,
) -> SessionHandle {
    let (driver_tx, driver_rx) = mpsc::channel(4);
    let tts_active = Arc::new(AtomicBool::new(false));
    let turn_busy = Arc::new(AtomicBool::new(false));

    let mut dialog = DialogEngine::new(
        Arc::clone(&services.chat),
        &services.system_prompt,
        services.max_history_turns,
    );

    let created_at = match restored {
        Some(saved) => {
            dialog.restore_history(saved.turns);
            saved.created_at
        }
        None => Utc::now(),
    };

    let driver = SessionDriver {
        id,
        created_at,
        dialog,
        services,
        ctrl: Arc::clone(&ctrl),
        outbound,
        tts_active: Arc::clone(&tts_active),
        turn_busy: Arc::clone(&turn_busy),
    };

    let task = tokio::spawn(driver.run(driver_rx));

    SessionHandle {
        driver_tx,
        ctrl,
        tts_active,
        turn_busy,
        task,
    }
}

struct SessionDriver {
    id: String,
    created_at: DateTime<Utc>,
    dialog: DialogEngine,
    services: Arc<SessionServices>,
    ctrl: Arc<InterruptController>,
    outbound: mpsc::Sender<Outbound>,
    tts_active: Arc<AtomicBool>,
    turn_busy: Arc<AtomicBool>,
}

impl SessionDriver {
    async fn run(mut self, mut rx: mpsc::Receiver<DriverMsg>) {
        info!(session = %self.id, "session driver started");

        while let Some(msg) = rx.recv().await {
            match msg {
                DriverMsg::Utterance(utterance) => {
                    self.turn_busy.store(true, Ordering::SeqCst);
                    self.process_turn(utterance).await;
                    self.turn_busy.store(false, Ordering::SeqCst);
                }
                DriverMsg::LoadSession(id) => self.load_session(&id).await,
            }
        }

        // disconnect: final persistence write
        self.persist();
        info!(session = %self.id, "session driver stopped");
    }

    async fn process_turn(&mut self, utterance: Utterance) {
        let generation = self.ctrl.generation();
        let cancel = self.ctrl.token();
        debug!(
            session = %self.id,
            utterance = utterance.id,
            generation,
            secs = utterance.duration_secs(),
            "turn started"
        );
        self.send_status("processing").await;

        // Transcription completes before the dialog engine is invoked;
        // further utterances queue behind this turn.
        let text = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.services.stt.transcribe(&utterance.samples) => match result {
                Ok(text) => text,
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    warn!(session = %self.id, error = %e, "transcription failed, turn skipped");
                    self.send_error(&e).await;
                    self.send_status("listening").await;
                    return;
                }
            },
        };

        // interrupted while transcribing: the utterance is dropped
        if self.ctrl.is_stale(generation) {
            return;
        }

        if text.is_empty() {
            debug!(session = %self.id, "empty transcription, no turn");
            self.send_status("listening").await;
            return;
        }

        self.send_json(ServerMessage::Transcription { text: text.clone() })
            .await;
        self.dialog.append_user(&text);
        self.send_status("speaking").await;

        // splitter feed, bounded prefetch, in-order delivery
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let (sentence_tx, sentence_rx) = mpsc::channel::<String>(8);
        let (ready_tx, ready_rx) = mpsc::channel(self.services.prefetch_depth.max(1));

        let producer = tokio::spawn(prefetch::synthesize_sentences(
            sentence_rx,
            ready_tx,
            Arc::clone(&self.services.tts),
            Arc::clone(&self.ctrl),
            generation,
            cancel.clone(),
        ));
        let consumer = tokio::spawn(prefetch::deliver_chunks(
            ready_rx,
            self.outbound.clone(),
            Arc::clone(&self.ctrl),
            cancel.clone(),
            Arc::clone(&self.tts_active),
            self.services.tts.sample_rate(),
        ));

        // Pump deltas into the splitter while the reply streams, tracking
        // the partial text in case of barge-in.
        let pump = async {
            let mut splitter = SentenceSplitter::new();
            let mut partial = String::new();
            while let Some(delta) = delta_rx.recv().await {
                partial.push_str(&delta);
                for sentence in splitter.push(&delta) {
                    if sentence_tx.send(sentence).await.is_err() {
                        return partial;
                    }
                }
            }
            if let Some(rest) = splitter.flush() {
                let _ = sentence_tx.send(rest).await;
            }
            partial
        };

        let (reply, partial) = tokio::join!(self.dialog.stream_reply(delta_tx, &cancel), pump);
        drop(sentence_tx);

        match reply {
            Ok(full) => {
                // a barge-in can land between stream completion and here;
                // frames of a superseded turn are withheld
                if !self.ctrl.is_stale(generation) {
                    self.send_json(ServerMessage::LlmResponse { text: full }).await;
                }
            }
            Err(e) if e.is_cancelled() => {
                debug!(session = %self.id, heard = partial.len(), "turn interrupted");
                self.dialog.rewind_on_interrupt(partial.trim());
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "dialog stream failed, turn abandoned");
                self.send_error(&e).await;
                let heard = partial.trim();
                if heard.is_empty() {
                    self.dialog.abandon_turn();
                } else {
                    self.dialog.rewind_on_interrupt(heard);
                }
            }
        }

        // the next turn must not begin until this one's audio has drained
        let _ = producer.await;
        let _ = consumer.await;

        self.persist();
        self.send_status("listening").await;
    }

    /// Swap in a saved conversation. Runs between turns by construction.
    async fn load_session(&mut self, id: &str) {
        match self.services.store.load(id) {
            Some(saved) => {
                self.id = saved.id.clone();
                self.created_at = saved.created_at;
                self.dialog.restore_history(saved.turns);
            }
            None => {
                // best-effort: adopt the id with an empty history
                self.id = id.to_string();
                self.created_at = Utc::now();
                self.dialog.restore_history(Vec::new());
            }
        }
        self.send_json(ServerMessage::Ready {
            session_id: self.id.clone(),
        })
        .await;
    }

    fn persist(&self) {
        let session = SavedSession {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            turns: self.dialog.turns_snapshot(),
        };
        if session.turns.is_empty() {
            return;
        }
        if let Err(e) = self.services.store.save(&session) {
            warn!(session = %self.id, error = %e, "failed to persist session");
        }
    }

    async fn send_json(&self, msg: ServerMessage) {
        let _ = self.outbound.send(Outbound::Json(msg)).await;
    }

    async fn send_status(&self, state: &str) {
        self.send_json(ServerMessage::status(state)).await;
    }

    async fn send_error(&self, error: &PipelineError) {
        self.send_json(ServerMessage::error(error.code(), error.to_string()))
            .await;
    }
}
