//! Reply audio playback.
//!
//! The backend sends complete WAV payloads; decoding happens up front
//! (so malformed audio fails fast and leaves playback state untouched)
//! and the decoded samples are drained by a dedicated CPAL output
//! thread, resampled to the device rate by linear interpolation.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

use crate::error::{Result, SessionError};

/// How a playback session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Complete,
    Cancelled,
}

/// Engine-facing playback seam.
#[async_trait]
pub trait Player: Send {
    /// Decode and start playing a complete WAV payload. Fails with
    /// `Decode` on malformed input and `AlreadyPlaying` if busy; the
    /// outcome arrives later on the channel given at construction.
    async fn play(&mut self, wav: Vec<u8>) -> Result<()>;

    /// Cancel playback, clearing anything buffered. Idempotent.
    async fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Decode a WAV blob to f32 mono samples plus the source sample rate.
/// Multi-channel audio is downmixed by averaging.
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| SessionError::Decode(e.to_string()))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(SessionError::Decode("zero channels".to_string()));
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SessionError::Decode(e.to_string()))?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SessionError::Decode(e.to_string()))?,
        (format, bits) => {
            return Err(SessionError::Decode(format!(
                "unsupported WAV format: {:?} {} bit",
                format, bits
            )))
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok((samples, spec.sample_rate))
}

struct ActivePlayback {
    samples: Vec<f32>,
    // f64 cursor: an f32 accumulator stops advancing once the
    // position passes 2^23, minutes into a long reply.
    position: f64,
    step: f64,
    outcome_tx: mpsc::Sender<PlaybackOutcome>,
}

impl ActivePlayback {
    /// Next interpolated output sample, or `None` once the queue is
    /// exhausted.
    fn next_sample(&mut self) -> Option<f32> {
        let idx = self.position as usize;
        if idx >= self.samples.len() {
            return None;
        }
        let next = self.samples.get(idx + 1).copied().unwrap_or(0.0);
        let fract = (self.position - idx as f64) as f32;
        let sample = self.samples[idx] * (1.0 - fract) + next * fract;
        self.position += self.step;
        Some(sample)
    }
}

/// CPAL speaker output. The device is held for the lifetime of the
/// player; play/stop only swap the sample queue the output callback
/// drains.
pub struct CpalPlayer {
    playback: Arc<Mutex<Option<ActivePlayback>>>,
    outcome_tx: mpsc::Sender<PlaybackOutcome>,
    active: Arc<AtomicBool>,
    output_rate: u32,
    shutdown_tx: Sender<()>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalPlayer {
    pub fn new(outcome_tx: mpsc::Sender<PlaybackOutcome>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| SessionError::DeviceUnavailable("no output device".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;
        log::debug!("Playback output config: {:?}", supported);

        let output_rate = supported.sample_rate().0;
        let output_channels = supported.channels() as usize;

        let playback: Arc<Mutex<Option<ActivePlayback>>> = Arc::new(Mutex::new(None));
        let active = Arc::new(AtomicBool::new(false));
        let playback_cb = Arc::clone(&playback);
        let active_cb = Arc::clone(&active);
        let (shutdown_tx, shutdown_rx) = channel::<()>();

        // The stream lives on its own thread; cpal streams are not Send,
        // so it is created and dropped there.
        let audio_thread = thread::spawn(move || {
            let stream = match device.build_output_stream(
                &supported.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut guard = playback_cb.lock().unwrap();
                    let mut finished = false;

                    if let Some(play) = guard.as_mut() {
                        for frame in data.chunks_mut(output_channels) {
                            let sample = match play.next_sample() {
                                Some(sample) => sample,
                                None => {
                                    finished = true;
                                    0.0
                                }
                            };
                            for channel in frame.iter_mut() {
                                *channel = sample;
                            }
                        }
                    } else {
                        data.fill(0.0);
                    }

                    if finished {
                        if let Some(play) = guard.take() {
                            let _ = play.outcome_tx.try_send(PlaybackOutcome::Complete);
                        }
                        active_cb.store(false, Ordering::Release);
                    }
                },
                |err| log::error!("Playback stream error: {}", err),
                None,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Failed to create playback stream: {}", e);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                log::error!("Failed to start playback stream: {}", e);
                return;
            }

            // Park until shutdown; the callback does all the work.
            let _ = shutdown_rx.recv();
            log::debug!("Playback thread exiting");
        });

        Ok(Self {
            playback,
            outcome_tx,
            active,
            output_rate,
            shutdown_tx,
            audio_thread: Some(audio_thread),
        })
    }
}

#[async_trait]
impl Player for CpalPlayer {
    async fn play(&mut self, wav: Vec<u8>) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            return Err(SessionError::AlreadyPlaying);
        }

        // Decode before touching any state.
        let (samples, rate) = decode_wav(&wav)?;
        log::info!(
            "Starting playback: {} samples @ {}Hz ({:.1}s)",
            samples.len(),
            rate,
            samples.len() as f32 / rate as f32
        );

        let step = f64::from(rate) / f64::from(self.output_rate);
        *self.playback.lock().unwrap() = Some(ActivePlayback {
            samples,
            position: 0.0,
            step,
            outcome_tx: self.outcome_tx.clone(),
        });
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&mut self) {
        let cancelled = self.playback.lock().unwrap().take();
        if let Some(play) = cancelled {
            self.active.store(false, Ordering::Release);
            let _ = play.outcome_tx.try_send(PlaybackOutcome::Cancelled);
            log::info!("Playback cancelled");
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for CpalPlayer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.audio_thread.take() {
            if handle.join().is_err() {
                log::error!("Failed to join playback thread");
            }
        }
    }
}

/// Build an in-memory 16-bit mono WAV from samples; shared by tests.
#[cfg(test)]
pub fn encode_wav(samples: &[i16], rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buffer, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    buffer.into_inner()
}
