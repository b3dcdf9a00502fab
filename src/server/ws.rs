//! WebSocket session handler.
//!
//! One connection, one session. The receive loop is the ingress: binary
//! frames are reframed and run through the segmenter inline (the energy VAD
//! is cheap), completed utterances are posted to the turn driver, and
//! control frames act immediately — which is what makes barge-in O(1) even
//! while a turn is running. A dedicated sender task serializes all output
//! and drops audio whose generation has been superseded.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, Outbound, ServerMessage};
use super::ServerState;
use crate::audio::{FrameAssembler, INPUT_SAMPLE_RATE};
use crate::segmenter::Segmenter;
use crate::session::interrupt::InterruptController;
use crate::session::{spawn_session, DriverMsg};
use crate::vad::EnergyVad;

/// Bytes of pre-hello audio tolerated before an error frame: 1 s of f32
/// samples at the input rate.
const PRE_HELLO_LIMIT_BYTES: usize = INPUT_SAMPLE_RATE as usize * 4;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    info!("voice session connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);
    let ctrl = Arc::new(InterruptController::new());

    let sender = tokio::spawn(run_sender(out_rx, ws_tx, Arc::clone(&ctrl)));

    // ── handshake ────────────────────────────────────────────
    let Some((session_id, restored)) = await_hello(&mut ws_rx, &out_tx, &state).await else {
        drop(out_tx);
        let _ = sender.await;
        return;
    };

    send_json(&out_tx, ServerMessage::Ready {
        session_id: session_id.clone(),
    })
    .await;
    send_json(&out_tx, ServerMessage::status("listening")).await;

    let handle = spawn_session(
        session_id,
        restored,
        Arc::clone(&state.services),
        Arc::clone(&ctrl),
        out_tx.clone(),
    );

    // ── ingress + control loop ───────────────────────────────
    let mut assembler = FrameAssembler::new();
    let mut segmenter = Segmenter::new(
        state.config.segmenter.clone(),
        Box::new(EnergyVad::new()),
    );

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Binary(data) => {
                for frame in assembler.push_bytes(&data) {
                    if let Some(utterance) = segmenter.push_frame(frame) {
                        // never block the control path on a busy driver
                        if let Err(e) = handle
                            .driver_tx
                            .try_send(DriverMsg::Utterance(utterance))
                        {
                            warn!(error = %e, "utterance queue full, dropped");
                        }
                    }
                }
            }
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Interrupt) => {
                    debug!("barge-in received");
                    handle.interrupt(&out_tx).await;
                }
                Ok(ClientMessage::LoadSession { session_id }) => {
                    if handle.turn_busy.load(std::sync::atomic::Ordering::SeqCst) {
                        send_json(
                            &out_tx,
                            ServerMessage::error("busy", "turn in progress, retry after it ends"),
                        )
                        .await;
                    } else if handle
                        .driver_tx
                        .try_send(DriverMsg::LoadSession(session_id))
                        .is_err()
                    {
                        send_json(&out_tx, ServerMessage::error("busy", "session queue full"))
                            .await;
                    }
                }
                Ok(ClientMessage::Ping) => send_json(&out_tx, ServerMessage::Pong).await,
                Ok(ClientMessage::Hello { .. }) => {
                    send_json(
                        &out_tx,
                        ServerMessage::error("protocol", "hello already received"),
                    )
                    .await;
                }
                Err(e) => {
                    debug!(error = %e, "malformed client frame dropped");
                    send_json(
                        &out_tx,
                        ServerMessage::error("protocol", format!("malformed message: {e}")),
                    )
                    .await;
                }
            },
            Message::Close(_) => {
                info!("client closed connection");
                break;
            }
            _ => {}
        }
    }

    // closing the driver channel lets the driver finish its queue and make
    // the final persistence write
    drop(handle.driver_tx);
    let _ = handle.task.await;
    drop(out_tx);
    let _ = sender.await;
    info!("voice session finished");
}

/// Wait for the `hello` frame. Pre-hello audio is discarded; after one
/// second's worth an error frame tells the client what is wrong.
async fn await_hello(
    ws_rx: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    out_tx: &mpsc::Sender<Outbound>,
    state: &ServerState,
) -> Option<(String, Option<crate::session::store::SavedSession>)> {
    let mut discarded_bytes = 0usize;
    let mut warned = false;

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Hello {
                    sample_rate,
                    session_id,
                }) => {
                    if sample_rate != INPUT_SAMPLE_RATE {
                        send_json(
                            out_tx,
                            ServerMessage::error(
                                "protocol",
                                format!("unsupported sample rate {sample_rate}"),
                            ),
                        )
                        .await;
                        return None;
                    }
                    let restored = session_id
                        .as_deref()
                        .and_then(|id| state.services.store.load(id));
                    let id = match (&restored, session_id) {
                        (Some(saved), _) => saved.id.clone(),
                        (None, Some(requested)) => requested,
                        (None, None) => uuid::Uuid::new_v4().to_string(),
                    };
                    return Some((id, restored));
                }
                Ok(ClientMessage::Ping) => send_json(out_tx, ServerMessage::Pong).await,
                _ => {
                    send_json(
                        out_tx,
                        ServerMessage::error("protocol", "hello must be the first message"),
                    )
                    .await;
                }
            },
            Message::Binary(data) => {
                discarded_bytes += data.len();
                if discarded_bytes > PRE_HELLO_LIMIT_BYTES && !warned {
                    warned = true;
                    send_json(
                        out_tx,
                        ServerMessage::error("protocol", "audio before hello is discarded"),
                    )
                    .await;
                }
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Forward outbound frames to the socket, dropping audio stamped with a
/// superseded generation so no stale bytes reach the client after barge-in.
async fn run_sender(
    mut out_rx: mpsc::Receiver<Outbound>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    ctrl: Arc<InterruptController>,
) {
    while let Some(outbound) = out_rx.recv().await {
        let result = match outbound {
            Outbound::Json(msg) => {
                ws_tx
                    .send(Message::Text(
                        serde_json::to_string(&msg).unwrap_or_default().into(),
                    ))
                    .await
            }
            Outbound::Audio { generation, pcm } => {
                if ctrl.is_stale(generation) {
                    debug!(generation, "stale audio dropped");
                    continue;
                }
                ws_tx.send(Message::Binary(pcm.into())).await
            }
        };
        if result.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn send_json(out_tx: &mpsc::Sender<Outbound>, msg: ServerMessage) {
    let _ = out_tx.send(Outbound::Json(msg)).await;
}
