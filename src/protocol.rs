//! Wire protocol for the voice backend connection.
//!
//! Everything travels over one duplex websocket. Outbound audio is sent
//! as tagged binary frames, all control traffic (both directions) is
//! JSON text tagged by a `"type"` field.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// PCM format shared with the backend: 16 kHz, mono, 16-bit.
pub const SAMPLE_RATE: u32 = 16_000;

/// Cadence of captured audio frames.
pub const FRAME_INTERVAL_MS: u32 = 100;

/// Samples per full audio frame at the fixed cadence.
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize * FRAME_INTERVAL_MS as usize) / 1000;

/// Type tag prefixed to binary audio frames.
pub const AUDIO_FRAME_TAG: u8 = 0x01;

/// One chunk of captured microphone audio.
///
/// Sequence numbers restart at 0 for every turn and increase by one per
/// frame. The final frame of an utterance carries whatever partial
/// buffer was left when capture stopped and is flagged accordingly.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sequence: u32,
    pub samples: Vec<i16>,
    pub end_of_utterance: bool,
}

impl AudioFrame {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this frame in milliseconds at the protocol rate.
    pub fn duration_ms(&self) -> f32 {
        (self.samples.len() as f32 / SAMPLE_RATE as f32) * 1000.0
    }
}

/// Messages sent from the client to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    AudioFrame(AudioFrame),
    EndOfUtterance,
}

/// Messages received from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PartialTranscript {
        text: String,
    },
    FinalReply {
        transcript: String,
        response_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_base64: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Transport-agnostic representation of an encoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Binary(Vec<u8>),
    Text(String),
}

impl ClientMessage {
    /// Serialize for the websocket. Audio frames become binary
    /// `[tag][sequence: u32 LE][pcm: i16 LE]`, control messages JSON text.
    pub fn encode(&self) -> WireFrame {
        match self {
            ClientMessage::AudioFrame(frame) => {
                let mut bytes = Vec::with_capacity(5 + frame.samples.len() * 2);
                bytes.push(AUDIO_FRAME_TAG);
                bytes.extend_from_slice(&frame.sequence.to_le_bytes());
                bytes.extend_from_slice(&samples_to_pcm(&frame.samples));
                WireFrame::Binary(bytes)
            }
            ClientMessage::EndOfUtterance => {
                WireFrame::Text(r#"{"type":"end_of_utterance"}"#.to_string())
            }
        }
    }

    /// Parse a client message back out of its wire form (used by test
    /// servers and kept symmetric with `encode`).
    pub fn decode(frame: &WireFrame) -> Result<Self, SessionError> {
        match frame {
            WireFrame::Binary(bytes) => {
                if bytes.len() < 5 {
                    return Err(SessionError::Protocol(format!(
                        "binary frame too short: {} bytes",
                        bytes.len()
                    )));
                }
                if bytes[0] != AUDIO_FRAME_TAG {
                    return Err(SessionError::Protocol(format!(
                        "unknown binary frame tag: {:#04x}",
                        bytes[0]
                    )));
                }
                let sequence = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                let pcm = &bytes[5..];
                if pcm.len() % 2 != 0 {
                    return Err(SessionError::Protocol(
                        "audio payload has odd byte length".to_string(),
                    ));
                }
                Ok(ClientMessage::AudioFrame(AudioFrame {
                    sequence,
                    samples: pcm_to_samples(pcm),
                    end_of_utterance: false,
                }))
            }
            WireFrame::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text)
                    .map_err(|e| SessionError::Protocol(format!("invalid JSON: {}", e)))?;
                match value.get("type").and_then(|t| t.as_str()) {
                    Some("end_of_utterance") => Ok(ClientMessage::EndOfUtterance),
                    Some(other) => Err(SessionError::Protocol(format!(
                        "unknown client message type: {}",
                        other
                    ))),
                    None => Err(SessionError::Protocol("missing message type".to_string())),
                }
            }
        }
    }
}

impl ServerMessage {
    /// Parse an inbound text message from the backend.
    pub fn decode(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::Protocol(format!("{}: {}", e, text)))
    }

    pub fn encode(&self) -> String {
        // Serialization of these enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The decoded contents of a `final_reply`, ready for the state machine.
#[derive(Debug, Clone)]
pub struct ReplyPayload {
    pub transcript: String,
    pub response_text: String,
    pub audio: Option<Vec<u8>>,
}

impl ReplyPayload {
    /// Build a payload from `final_reply` fields, decoding the optional
    /// base64 audio blob. A malformed blob is not fatal to the turn:
    /// the error is returned alongside a text-only payload so the
    /// caller can surface it and continue.
    pub fn from_reply(
        transcript: String,
        response_text: String,
        audio_base64: Option<String>,
    ) -> (Self, Option<SessionError>) {
        let (audio, decode_err) = match audio_base64 {
            None => (None, None),
            Some(b64) => match base64::engine::general_purpose::STANDARD.decode(b64.as_bytes()) {
                Ok(bytes) => (Some(bytes), None),
                Err(e) => (
                    None,
                    Some(SessionError::Decode(format!("base64 audio: {}", e))),
                ),
            },
        };
        (
            Self {
                transcript,
                response_text,
                audio,
            },
            decode_err,
        )
    }
}

/// Convert i16 samples to PCM 16-bit little-endian bytes.
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    pcm
}

/// Convert PCM 16-bit little-endian bytes back to i16 samples.
pub fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
