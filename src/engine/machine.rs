//! The turn state machine.
//!
//! All concurrent activity sources (user intents, capture frames,
//! inbound network events, playback completion) are serialized into
//! [`SessionEvent`]s; the machine is a synchronous transition function
//! from events to [`Effect`]s and never performs I/O itself, which
//! keeps every transition deterministic and directly testable.

use std::sync::Arc;

use crate::conversation::{ConversationLog, Role};
use crate::error::SessionError;
use crate::playback::PlaybackOutcome;
use crate::protocol::{AudioFrame, ClientMessage, ReplyPayload, ServerMessage};

/// Externally observable session state. Exactly one value at any time,
/// owned by the machine; transitions are the only way it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Listening,
    Processing,
    Speaking,
}

/// Everything that can happen to a session, from any source.
#[derive(Debug)]
pub enum SessionEvent {
    /// User pressed the talk control (or hands-free auto-start).
    Pressed,
    /// User released the talk control (or hands-free auto-release).
    Released,
    /// A captured audio frame ready to send.
    Frame(AudioFrame),
    /// Capture could not start or died mid-turn.
    CaptureFailed(SessionError),
    /// Inbound protocol message, in arrival order.
    Server(ServerMessage),
    /// Link established; `reconnected` marks recovery after a drop.
    LinkOpen { reconnected: bool },
    /// Link lost; any in-flight turn is abandoned.
    LinkLost,
    /// Playback finished or was cancelled.
    PlaybackDone(PlaybackOutcome),
    /// Reply audio could not be played.
    PlaybackFailed(SessionError),
    /// User cleared the conversation history.
    ClearHistory,
}

/// I/O the driver must perform as a result of a transition, in order.
#[derive(Debug)]
pub enum Effect {
    /// Begin a capture session.
    StartCapture,
    /// End capture, flushing the final frame, then signal end of
    /// utterance to the backend.
    FinishUtterance,
    /// Stop capture discarding the partial buffer.
    AbortCapture,
    /// Send a protocol message.
    Send(ClientMessage),
    /// Start playing a WAV reply payload.
    Play(Vec<u8>),
    /// Cancel any active playback.
    StopPlayback,
    /// Report an error to observers; the session stays usable.
    SurfaceError(SessionError),
}

pub struct TurnStateMachine {
    status: SessionStatus,
    connected: bool,
    live_transcript: String,
    log: Arc<ConversationLog>,
}

impl TurnStateMachine {
    pub fn new(log: Arc<ConversationLog>) -> Self {
        Self {
            status: SessionStatus::Idle,
            connected: false,
            live_transcript: String::new(),
            log,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn live_transcript(&self) -> &str {
        &self.live_transcript
    }

    pub fn log(&self) -> &Arc<ConversationLog> {
        &self.log
    }

    /// Apply one event, returning the effects to execute in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::Pressed => self.on_pressed(),
            SessionEvent::Released => self.on_released(),
            SessionEvent::Frame(frame) => self.on_frame(frame),
            SessionEvent::CaptureFailed(err) => self.on_capture_failed(err),
            SessionEvent::Server(message) => self.on_server(message),
            SessionEvent::LinkOpen { reconnected } => {
                self.connected = true;
                if reconnected {
                    log::info!("Reconnected to backend");
                } else {
                    log::info!("Connected to backend");
                }
                vec![]
            }
            SessionEvent::LinkLost => {
                self.connected = false;
                if self.status == SessionStatus::Idle {
                    vec![]
                } else {
                    log::warn!("Connection lost during {}, abandoning turn", self.status);
                    self.abandon(SessionError::ConnectionLost)
                }
            }
            SessionEvent::PlaybackDone(outcome) => self.on_playback_done(outcome),
            SessionEvent::PlaybackFailed(err) => {
                if self.status == SessionStatus::Speaking {
                    // Audio is best-effort; the text turns are already
                    // in the log.
                    self.transition(SessionStatus::Idle);
                    vec![Effect::SurfaceError(err)]
                } else {
                    vec![Effect::SurfaceError(err)]
                }
            }
            SessionEvent::ClearHistory => {
                self.log.clear();
                vec![]
            }
        }
    }

    fn on_pressed(&mut self) -> Vec<Effect> {
        if self.status != SessionStatus::Idle {
            // Half-duplex: a press during speaking (or a repeat press
            // mid-turn) is dropped, not queued.
            log::debug!("Press ignored while {}", self.status);
            return vec![];
        }
        if !self.connected {
            log::debug!("Press ignored while disconnected");
            return vec![];
        }
        self.live_transcript.clear();
        self.transition(SessionStatus::Listening);
        vec![Effect::StartCapture]
    }

    fn on_released(&mut self) -> Vec<Effect> {
        if self.status != SessionStatus::Listening {
            log::debug!("Release ignored while {}", self.status);
            return vec![];
        }
        self.transition(SessionStatus::Processing);
        vec![Effect::FinishUtterance]
    }

    fn on_frame(&mut self, frame: AudioFrame) -> Vec<Effect> {
        if self.status != SessionStatus::Listening {
            // The driver drains queued frames when the utterance
            // finishes; anything reaching here is left over from an
            // aborted turn.
            log::debug!("Dropping frame {} while {}", frame.sequence, self.status);
            return vec![];
        }
        vec![Effect::Send(ClientMessage::AudioFrame(frame))]
    }

    fn on_capture_failed(&mut self, err: SessionError) -> Vec<Effect> {
        if self.status == SessionStatus::Listening {
            log::warn!("Capture failed, abandoning turn: {}", err);
            self.abandon(err)
        } else {
            vec![Effect::SurfaceError(err)]
        }
    }

    fn on_server(&mut self, message: ServerMessage) -> Vec<Effect> {
        match message {
            ServerMessage::PartialTranscript { text } => {
                match self.status {
                    // Partials may keep arriving after release while the
                    // backend drains buffered audio.
                    SessionStatus::Listening | SessionStatus::Processing => {
                        self.live_transcript = text;
                    }
                    _ => log::warn!("Ignoring partial transcript while {}", self.status),
                }
                vec![]
            }
            ServerMessage::FinalReply {
                transcript,
                response_text,
                audio_base64,
            } => {
                if self.status != SessionStatus::Processing {
                    log::warn!("Ignoring final reply while {}", self.status);
                    return vec![];
                }
                let (payload, decode_err) =
                    ReplyPayload::from_reply(transcript, response_text, audio_base64);
                self.complete_turn(payload, decode_err)
            }
            ServerMessage::Error { code, message } => {
                let err = SessionError::Protocol(format!("backend error {}: {}", code, message));
                if self.status == SessionStatus::Idle {
                    vec![Effect::SurfaceError(err)]
                } else {
                    log::warn!("Backend error during {}, abandoning turn", self.status);
                    self.abandon(err)
                }
            }
        }
    }

    /// Record both halves of the turn and start playback if there is
    /// audio to play. Text is authoritative; audio failures degrade to
    /// a text-only turn.
    fn complete_turn(
        &mut self,
        payload: ReplyPayload,
        decode_err: Option<SessionError>,
    ) -> Vec<Effect> {
        self.live_transcript = payload.transcript.clone();
        self.log.append(Role::User, payload.transcript);
        self.log.append(Role::Assistant, payload.response_text);

        let mut effects = Vec::new();
        if let Some(err) = decode_err {
            effects.push(Effect::SurfaceError(err));
        }
        match payload.audio {
            Some(wav) => {
                self.transition(SessionStatus::Speaking);
                effects.push(Effect::Play(wav));
            }
            None => self.transition(SessionStatus::Idle),
        }
        effects
    }

    fn on_playback_done(&mut self, outcome: PlaybackOutcome) -> Vec<Effect> {
        match outcome {
            PlaybackOutcome::Complete => {
                if self.status == SessionStatus::Speaking {
                    self.transition(SessionStatus::Idle);
                }
            }
            // Cancellation follows an abandon that already left speaking.
            PlaybackOutcome::Cancelled => {
                log::debug!("Playback cancelled while {}", self.status)
            }
        }
        vec![]
    }

    /// Tear down whatever the current turn was doing and return to
    /// idle without recording anything.
    fn abandon(&mut self, err: SessionError) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.status {
            SessionStatus::Listening => effects.push(Effect::AbortCapture),
            SessionStatus::Speaking => effects.push(Effect::StopPlayback),
            SessionStatus::Processing | SessionStatus::Idle => {}
        }
        self.live_transcript.clear();
        self.transition(SessionStatus::Idle);
        effects.push(Effect::SurfaceError(err));
        effects
    }

    fn transition(&mut self, next: SessionStatus) {
        if self.status != next {
            log::info!("Session: {} -> {}", self.status, next);
            self.status = next;
        }
    }
}
