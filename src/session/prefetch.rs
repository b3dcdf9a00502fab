//! TTS prefetch-and-stream.
//!
//! A producer task synthesizes sentences one at a time (never more than one
//! synthesis in flight per session) and parks finished chunks in a bounded
//! channel, keeping up to `prefetch_depth` sentences ready ahead of
//! playback. A consumer task delivers chunks strictly in splitter order,
//! bracketing the burst with `tts_start`/`tts_stop`. Both tasks carry the
//! turn's generation stamp and its cancellation token; a barge-in stops the
//! producer at its next suspension point and the stamped audio is dropped
//! before it reaches the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::interrupt::InterruptController;
use crate::error::PipelineError;
use crate::server::protocol::{Outbound, ServerMessage};
use crate::tts::TextToSpeech;

/// One synthesized (or failed) sentence, in splitter order.
#[derive(Debug)]
pub struct SentenceChunk {
    pub index: usize,
    pub text: String,
    pub generation: u64,
    pub audio: Result<Vec<u8>, PipelineError>,
}

/// Producer half: synthesize sentences serially, pushing results into the
/// bounded `ready` channel (its capacity is the prefetch depth).
pub async fn synthesize_sentences(
    mut sentences: mpsc::Receiver<String>,
    ready: mpsc::Sender<SentenceChunk>,
    tts: Arc<dyn TextToSpeech>,
    ctrl: Arc<InterruptController>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut index = 0;
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            text = sentences.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };

        if ctrl.is_stale(generation) {
            break;
        }

        let audio = tokio::select! {
            _ = cancel.cancelled() => break,
            audio = tts.synthesize(&text) => audio,
        };

        if let Err(e) = &audio {
            warn!(index, error = %e, "sentence synthesis failed");
        }

        let chunk = SentenceChunk {
            index,
            text,
            generation,
            audio,
        };
        index += 1;

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = ready.send(chunk) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(synthesized = index, "synthesis producer finished");
}

/// Consumer half: deliver chunks in order, opening the burst with
/// `tts_start` before the first audio and closing it with `tts_stop`.
///
/// A failed sentence surfaces as an `error` frame and the burst continues.
/// On cancellation the function returns without sending `tts_stop`; the
/// interrupt path owns that frame.
pub async fn deliver_chunks(
    mut ready: mpsc::Receiver<SentenceChunk>,
    outbound: mpsc::Sender<Outbound>,
    ctrl: Arc<InterruptController>,
    cancel: CancellationToken,
    tts_active: Arc<AtomicBool>,
    sample_rate: u32,
) -> usize {
    let mut delivered = 0;
    let mut started = false;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return delivered,
            chunk = ready.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        if ctrl.is_stale(chunk.generation) {
            continue;
        }

        match chunk.audio {
            Ok(pcm) if !pcm.is_empty() => {
                if !started {
                    started = true;
                    tts_active.store(true, Ordering::SeqCst);
                    if outbound
                        .send(Outbound::Json(ServerMessage::TtsStart { sample_rate }))
                        .await
                        .is_err()
                    {
                        return delivered;
                    }
                }
                if outbound
                    .send(Outbound::Audio {
                        generation: chunk.generation,
                        pcm,
                    })
                    .await
                    .is_err()
                {
                    return delivered;
                }
                delivered += 1;
            }
            Ok(_) => {}
            Err(e) if e.is_cancelled() => return delivered,
            Err(e) => {
                let _ = outbound
                    .send(Outbound::Json(ServerMessage::error(e.code(), e.to_string())))
                    .await;
            }
        }
    }

    if started && !cancel.is_cancelled() {
        let _ = outbound.send(Outbound::Json(ServerMessage::TtsStop)).await;
        tts_active.store(false, Ordering::SeqCst);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Echoes the text back as audio bytes, with an optional per-text delay.
    struct EchoTts {
        slow: Option<(&'static str, Duration)>,
    }

    #[async_trait]
    impl TextToSpeech for EchoTts {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PipelineError> {
            if let Some((slow_text, delay)) = &self.slow {
                if text == *slow_text {
                    tokio::time::sleep(*delay).await;
                }
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    struct FailingTts;

    #[async_trait]
    impl TextToSpeech for FailingTts {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PipelineError> {
            if text.contains("bad") {
                Err(PipelineError::Tts("boom".to_string()))
            } else {
                Ok(text.as_bytes().to_vec())
            }
        }
    }

    async fn run_burst(
        tts: Arc<dyn TextToSpeech>,
        sentences: Vec<&str>,
    ) -> Vec<Outbound> {
        let ctrl = Arc::new(InterruptController::new());
        let cancel = ctrl.token();
        let generation = ctrl.generation();
        let tts_active = Arc::new(AtomicBool::new(false));

        let (sent_tx, sent_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = mpsc::channel(2);
        let (out_tx, mut out_rx) = mpsc::channel(64);

        let producer = tokio::spawn(synthesize_sentences(
            sent_rx,
            ready_tx,
            tts,
            Arc::clone(&ctrl),
            generation,
            cancel.clone(),
        ));
        let consumer = tokio::spawn(deliver_chunks(
            ready_rx,
            out_tx,
            ctrl,
            cancel,
            tts_active,
            22_050,
        ));

        for sentence in sentences {
            sent_tx.send(sentence.to_string()).await.unwrap();
        }
        drop(sent_tx);

        producer.await.unwrap();
        consumer.await.unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = out_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn audio_texts(frames: &[Outbound]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Outbound::Audio { pcm, .. } => Some(String::from_utf8(pcm.clone()).unwrap()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_middle_sentence_keeps_order() {
        let tts = Arc::new(EchoTts {
            slow: Some(("second one", Duration::from_secs(5))),
        });
        let frames = run_burst(tts, vec!["first one", "second one", "third one"]).await;

        assert_eq!(
            audio_texts(&frames),
            vec!["first one", "second one", "third one"]
        );
        assert!(matches!(frames.first(), Some(Outbound::Json(ServerMessage::TtsStart { .. }))));
        assert!(matches!(frames.last(), Some(Outbound::Json(ServerMessage::TtsStop))));
    }

    #[tokio::test]
    async fn test_failed_sentence_surfaces_error_and_continues() {
        let frames = run_burst(Arc::new(FailingTts), vec!["good one", "bad one", "fine one"]).await;

        assert_eq!(audio_texts(&frames), vec!["good one", "fine one"]);
        assert!(frames.iter().any(|f| matches!(
            f,
            Outbound::Json(ServerMessage::Error { code, .. }) if code == "tts_failed"
        )));
        assert!(matches!(frames.last(), Some(Outbound::Json(ServerMessage::TtsStop))));
    }

    #[tokio::test]
    async fn test_interrupt_stops_burst_without_tts_stop() {
        let ctrl = Arc::new(InterruptController::new());
        let cancel = ctrl.token();
        let generation = ctrl.generation();
        let tts_active = Arc::new(AtomicBool::new(false));

        let (sent_tx, sent_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = mpsc::channel(2);
        let (out_tx, mut out_rx) = mpsc::channel(64);

        let tts: Arc<dyn TextToSpeech> = Arc::new(EchoTts { slow: None });
        let producer = tokio::spawn(synthesize_sentences(
            sent_rx,
            ready_tx,
            tts,
            Arc::clone(&ctrl),
            generation,
            cancel.clone(),
        ));
        let consumer = tokio::spawn(deliver_chunks(
            ready_rx,
            out_tx,
            Arc::clone(&ctrl),
            cancel,
            Arc::clone(&tts_active),
            22_050,
        ));

        sent_tx.send("hello there friend".to_string()).await.unwrap();
        // wait for the first audio frame to be delivered
        loop {
            match out_rx.recv().await.unwrap() {
                Outbound::Audio { .. } => break,
                _ => {}
            }
        }
        assert!(tts_active.load(Ordering::SeqCst));

        ctrl.interrupt();
        drop(sent_tx);
        producer.await.unwrap();
        consumer.await.unwrap();

        // everything still queued must not include tts_stop
        while let Ok(frame) = out_rx.try_recv() {
            assert!(!matches!(frame, Outbound::Json(ServerMessage::TtsStop)));
        }
    }
}
