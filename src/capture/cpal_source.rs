//! CPAL-backed microphone source.

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use tokio::sync::mpsc;

use super::CaptureSource;
use crate::error::{Result, SessionError};
use crate::protocol::SAMPLE_RATE;

/// Microphone selection.
#[derive(Debug, Clone, Default)]
pub struct CpalSourceConfig {
    /// Device name to capture from (None = default input device).
    pub device_id: Option<String>,
    /// Channel to extract from interleaved frames (0-based).
    pub channel: u32,
}

/// Basic information about an input device, for `--list-devices`.
#[derive(Debug, Clone)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channel_count: u32,
}

/// Capture source using CPAL. The device is acquired in `start` and
/// released in `stop`, so the speaker side can hold its device while
/// this one is idle.
pub struct CpalSource {
    config: CpalSourceConfig,
    stream: Option<CpalStream>,
}

impl CpalSource {
    pub fn new(config: CpalSourceConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    fn open_device(&self) -> Result<Device> {
        let host = cpal::default_host();
        if let Some(id) = &self.config.device_id {
            host.devices()
                .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == *id).unwrap_or(false))
                .ok_or_else(|| {
                    SessionError::DeviceUnavailable(format!("device not found: {}", id))
                })
        } else {
            host.default_input_device()
                .ok_or_else(|| SessionError::DeviceUnavailable("no default input device".into()))
        }
    }

    fn build_stream<T>(
        device: &Device,
        config: &cpal::StreamConfig,
        tx: mpsc::Sender<Vec<i16>>,
        channel: u32,
    ) -> Result<CpalStream>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        i16: FromSample<T>,
    {
        let channels = config.channels as usize;
        let mut batch = Vec::with_capacity(256);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(channels) {
                        if let Some(sample) = frame.get(channel as usize) {
                            batch.push(i16::from_sample(*sample));
                        }
                    }
                    if !batch.is_empty() {
                        // Off the realtime thread without blocking; a full
                        // channel drops the batch rather than stalling CPAL.
                        let _ = tx.try_send(std::mem::take(&mut batch));
                    }
                },
                |err| log::error!("Capture stream error: {}", err),
                None,
            )
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))
    }

    /// Enumerate input devices.
    pub fn list_devices() -> Result<Vec<InputDeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host
            .default_input_device()
            .and_then(|d| d.name().ok())
            .unwrap_or_default();

        let mut result = Vec::new();
        for device in host
            .devices()
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?
        {
            let Ok(name) = device.name() else { continue };
            let Ok(config) = device.default_input_config() else {
                continue;
            };
            result.push(InputDeviceInfo {
                is_default: name == default_name,
                channel_count: u32::from(config.channels()),
                name,
            });
        }
        Ok(result)
    }
}

impl CaptureSource for CpalSource {
    fn start(&mut self) -> Result<mpsc::Receiver<Vec<i16>>> {
        if self.stream.is_some() {
            return Err(SessionError::AlreadyCapturing);
        }

        let device = self.open_device()?;
        let supported = device
            .default_input_config()
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

        if self.config.channel >= u32::from(supported.channels()) {
            return Err(SessionError::DeviceUnavailable(format!(
                "channel {} not available (device has {})",
                self.config.channel,
                supported.channels()
            )));
        }

        let stream_config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        log::info!(
            "Opening capture: {} channels @ {}Hz (format: {:?})",
            stream_config.channels,
            SAMPLE_RATE,
            supported.sample_format()
        );

        let (tx, rx) = mpsc::channel(32);
        let channel = self.config.channel;
        let stream = match supported.sample_format() {
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &stream_config, tx, channel)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &stream_config, tx, channel)?,
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &stream_config, tx, channel)?,
            other => {
                return Err(SessionError::DeviceUnavailable(format!(
                    "unsupported sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

        self.stream = Some(stream);
        Ok(rx)
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("Capture stream released");
        }
    }
}
