//! Microphone capture and fixed-cadence framing.
//!
//! A [`CaptureSource`] hands raw i16 sample batches off the realtime
//! audio thread; the [`AudioChunker`] re-frames them into 100 ms
//! [`AudioFrame`]s with per-turn sequence numbers.

mod cpal_source;

pub use cpal_source::{CpalSource, CpalSourceConfig, InputDeviceInfo};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::protocol::{AudioFrame, FRAME_SAMPLES};

/// A raw audio source delivering i16 mono samples at the protocol rate.
///
/// `start` must be atomic: on failure no device is held. `stop` releases
/// the device and is safe to call when not started.
pub trait CaptureSource: Send {
    fn start(&mut self) -> Result<mpsc::Receiver<Vec<i16>>>;
    fn stop(&mut self);
}

/// Engine-facing capture seam. The production implementation is
/// [`AudioChunker`]; tests substitute scripted fakes.
#[async_trait]
pub trait Capture: Send {
    /// Start a capture session. Frames flow through the sender given at
    /// construction. Fails with `AlreadyCapturing` if a session is
    /// active and `DeviceUnavailable` if the device cannot be acquired.
    async fn begin(&mut self) -> Result<()>;

    /// Stop capture and flush the partial buffer as the final
    /// end-of-utterance frame. Returns `None` when no session is active.
    async fn end(&mut self) -> Option<AudioFrame>;

    /// Stop capture discarding any partial buffer (disconnect path).
    async fn abort(&mut self);

    fn is_active(&self) -> bool;
}

struct ActiveCapture {
    cancel: CancellationToken,
    flush_rx: oneshot::Receiver<AudioFrame>,
}

/// Turns a raw capture stream into sequence-numbered fixed-size frames.
pub struct AudioChunker<S: CaptureSource> {
    source: S,
    frame_tx: mpsc::Sender<AudioFrame>,
    active: Option<ActiveCapture>,
}

impl<S: CaptureSource> AudioChunker<S> {
    pub fn new(source: S, frame_tx: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            source,
            frame_tx,
            active: None,
        }
    }
}

#[async_trait]
impl<S: CaptureSource> Capture for AudioChunker<S> {
    async fn begin(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyCapturing);
        }

        let mut raw_rx = self.source.start()?;
        let frame_tx = self.frame_tx.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let (flush_tx, flush_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut buffer: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 2);
            let mut sequence: u32 = 0;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    batch = raw_rx.recv() => {
                        let Some(batch) = batch else { break };
                        buffer.extend_from_slice(&batch);
                        while buffer.len() >= FRAME_SAMPLES {
                            let samples: Vec<i16> = buffer.drain(..FRAME_SAMPLES).collect();
                            let frame = AudioFrame {
                                sequence,
                                samples,
                                end_of_utterance: false,
                            };
                            log::debug!(
                                "Captured frame {} ({:.1}ms)",
                                frame.sequence,
                                frame.duration_ms()
                            );
                            if frame_tx.send(frame).await.is_err() {
                                log::warn!("Frame receiver dropped, stopping capture task");
                                return;
                            }
                            sequence += 1;
                        }
                    }
                }
            }

            // Whatever is left becomes the end-of-utterance frame; the
            // flush receiver decides whether it is sent or discarded.
            let _ = flush_tx.send(AudioFrame {
                sequence,
                samples: std::mem::take(&mut buffer),
                end_of_utterance: true,
            });
        });

        self.active = Some(ActiveCapture { cancel, flush_rx });
        log::info!("Capture started");
        Ok(())
    }

    async fn end(&mut self) -> Option<AudioFrame> {
        let active = self.active.take()?;
        active.cancel.cancel();
        self.source.stop();
        match active.flush_rx.await {
            Ok(frame) => {
                log::info!(
                    "Capture ended, flushing final frame {} ({} samples)",
                    frame.sequence,
                    frame.len()
                );
                Some(frame)
            }
            Err(_) => {
                log::warn!("Capture task exited without flushing");
                None
            }
        }
    }

    async fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            self.source.stop();
            // Drain the flush so the task can exit, then discard it.
            let _ = active.flush_rx.await;
            log::info!("Capture aborted, partial buffer discarded");
        }
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }
}
