//! Session orchestration.
//!
//! [`TurnStateMachine`] decides, the [`SessionEngine`] driver executes:
//! it serializes every activity source (user intents, captured frames,
//! link events, playback outcomes, settings changes) through one event
//! loop and performs the machine's effects against the capture,
//! playback and connection seams.

pub mod machine;

pub use machine::{Effect, SessionEvent, SessionStatus, TurnStateMachine};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::capture::Capture;
use crate::channel::ChannelEvent;
use crate::conversation::{ConversationLog, ConversationTurn};
use crate::error::{Result, SessionError};
use crate::playback::{PlaybackOutcome, Player};
use crate::protocol::{AudioFrame, ClientMessage, ServerMessage};
use crate::settings::{CaptureMode, SessionSettings};

/// Engine-facing view of the connection: framed send plus target change.
pub trait Outbound: Send {
    fn send(&self, message: &ClientMessage) -> Result<()>;
    fn retarget(&self, url: &Url);
}

/// Decides when a hands-free utterance ends. The shipped policy is a
/// fixed max-utterance timeout; silence-detection variants plug in
/// here.
pub trait ReleasePolicy: Send {
    fn max_utterance(&self) -> Duration;
}

/// Auto-release after a fixed utterance length.
pub struct FixedTimeout(pub Duration);

impl Default for FixedTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(8))
    }
}

impl ReleasePolicy for FixedTimeout {
    fn max_utterance(&self) -> Duration {
        self.0
    }
}

/// Caller-facing handle: posts intents, reads observables.
#[derive(Clone)]
pub struct SessionHandle {
    event_tx: mpsc::Sender<SessionEvent>,
    status_rx: watch::Receiver<SessionStatus>,
    connected_rx: watch::Receiver<bool>,
    transcript_rx: watch::Receiver<String>,
    error_rx: watch::Receiver<Option<String>>,
    log: Arc<ConversationLog>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub async fn press(&self) {
        let _ = self.event_tx.send(SessionEvent::Pressed).await;
    }

    pub async fn release(&self) {
        let _ = self.event_tx.send(SessionEvent::Released).await;
    }

    pub async fn clear_history(&self) {
        let _ = self.event_tx.send(SessionEvent::ClearHistory).await;
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Whether the session currently has a usable backend link (a
    /// press only starts a turn while this is true).
    pub fn connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn live_transcript(&self) -> String {
        self.transcript_rx.borrow().clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<String> {
        self.transcript_rx.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.error_rx.borrow().clone()
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.log.snapshot()
    }

    /// Stop the engine loop. Capture and playback are torn down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Everything the engine consumes besides its own intent queue.
pub struct EngineInputs {
    /// Frames from the audio chunker.
    pub frame_rx: mpsc::Receiver<AudioFrame>,
    /// Link and inbound-message events from the connection.
    pub channel_rx: mpsc::Receiver<ChannelEvent>,
    /// Playback outcomes from the player.
    pub outcome_rx: mpsc::Receiver<PlaybackOutcome>,
    /// Settings changes from the resolver.
    pub settings_rx: watch::Receiver<SessionSettings>,
}

pub struct SessionEngine {
    machine: TurnStateMachine,
    capture: Box<dyn Capture>,
    player: Box<dyn Player>,
    outbound: Box<dyn Outbound>,

    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
    inputs: EngineInputs,

    status_tx: watch::Sender<SessionStatus>,
    connected_tx: watch::Sender<bool>,
    transcript_tx: watch::Sender<String>,
    error_tx: watch::Sender<Option<String>>,

    settings: SessionSettings,
    capture_mode: CaptureMode,
    pending_mode: Option<CaptureMode>,
    release_policy: Box<dyn ReleasePolicy>,
    release_timer: Option<CancellationToken>,

    shutdown: CancellationToken,
}

impl SessionEngine {
    pub fn new(
        capture: Box<dyn Capture>,
        player: Box<dyn Player>,
        outbound: Box<dyn Outbound>,
        log: Arc<ConversationLog>,
        inputs: EngineInputs,
        release_policy: Box<dyn ReleasePolicy>,
    ) -> (Self, SessionHandle) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (transcript_tx, transcript_rx) = watch::channel(String::new());
        let (error_tx, error_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let settings = inputs.settings_rx.borrow().clone();
        let capture_mode = settings.capture_mode;

        let handle = SessionHandle {
            event_tx: event_tx.clone(),
            status_rx,
            connected_rx,
            transcript_rx,
            error_rx,
            log: Arc::clone(&log),
            shutdown: shutdown.clone(),
        };

        let engine = Self {
            machine: TurnStateMachine::new(log),
            capture,
            player,
            outbound,
            event_tx,
            event_rx,
            inputs,
            status_tx,
            connected_tx,
            transcript_tx,
            error_tx,
            settings,
            capture_mode,
            pending_mode: None,
            release_policy,
            release_timer: None,
            shutdown,
        };

        (engine, handle)
    }

    /// Run until shutdown. All state mutation happens on this task.
    pub async fn run(mut self) {
        log::info!("Session engine started ({} mode)", self.capture_mode);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(event) = self.event_rx.recv() => {
                    self.dispatch(event).await;
                }

                Some(frame) = self.inputs.frame_rx.recv() => {
                    self.dispatch(SessionEvent::Frame(frame)).await;
                }

                Some(channel_event) = self.inputs.channel_rx.recv() => {
                    let event = match channel_event {
                        ChannelEvent::Open { reconnected } => {
                            SessionEvent::LinkOpen { reconnected }
                        }
                        ChannelEvent::Lost => SessionEvent::LinkLost,
                        ChannelEvent::Message(message) => SessionEvent::Server(message),
                    };
                    self.dispatch(event).await;
                }

                Some(outcome) = self.inputs.outcome_rx.recv() => {
                    self.dispatch(SessionEvent::PlaybackDone(outcome)).await;
                }

                changed = self.inputs.settings_rx.changed() => {
                    if changed.is_ok() {
                        let next = self.inputs.settings_rx.borrow_and_update().clone();
                        self.apply_settings(next);
                    }
                }

                else => break,
            }
        }

        // Deterministic teardown: nothing keeps the devices after the
        // loop exits.
        self.cancel_release_timer();
        self.capture.abort().await;
        self.player.stop().await;
        log::info!("Session engine stopped");
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::new();
        queue.push_back(event);

        while let Some(event) = queue.pop_front() {
            let previous = self.machine.status();
            let completes_turn = matches!(
                event,
                SessionEvent::LinkOpen { .. }
                    | SessionEvent::PlaybackDone(PlaybackOutcome::Complete)
                    | SessionEvent::Server(ServerMessage::FinalReply { .. })
            );

            let effects = self.machine.handle(event);
            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }

            self.publish_observables();
            self.manage_release_timer(previous);
            self.apply_pending_mode();

            // Hands-free restarts capture once the link is up and the
            // previous turn has fully completed; error paths do not
            // auto-restart.
            if completes_turn
                && self.capture_mode == CaptureMode::HandsFree
                && self.machine.status() == SessionStatus::Idle
                && self.machine.connected()
            {
                log::debug!("Hands-free: starting next capture");
                queue.push_back(SessionEvent::Pressed);
            }
        }
    }

    /// Perform one effect, possibly feeding an event back in.
    async fn execute(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::StartCapture => match self.capture.begin().await {
                Ok(()) => None,
                Err(e) => Some(SessionEvent::CaptureFailed(e)),
            },

            Effect::FinishUtterance => {
                let final_frame = self.capture.end().await;

                // The chunk task has exited by now, but frames it
                // produced before the release may still sit in the
                // queue; they are part of the utterance and go out
                // ahead of the flush.
                while let Ok(frame) = self.inputs.frame_rx.try_recv() {
                    if let Some(event) = self.send_frame(frame) {
                        return Some(event);
                    }
                }
                if let Some(final_frame) = final_frame {
                    if !final_frame.is_empty() {
                        if let Some(event) = self.send_frame(final_frame) {
                            return Some(event);
                        }
                    }
                }
                match self.outbound.send(&ClientMessage::EndOfUtterance) {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("Failed to send end of utterance: {}", e);
                        Some(SessionEvent::LinkLost)
                    }
                }
            }

            Effect::AbortCapture => {
                self.capture.abort().await;
                None
            }

            Effect::Send(message) => match message {
                ClientMessage::AudioFrame(frame) => self.send_frame(frame),
                other => match self.outbound.send(&other) {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("Send failed mid-turn: {}", e);
                        Some(SessionEvent::LinkLost)
                    }
                },
            },

            Effect::Play(wav) => match self.player.play(wav).await {
                Ok(()) => None,
                Err(e) => Some(SessionEvent::PlaybackFailed(e)),
            },

            Effect::StopPlayback => {
                self.player.stop().await;
                None
            }

            Effect::SurfaceError(err) => {
                log::warn!("Session error: {}", err);
                let _ = self.error_tx.send(Some(err.to_string()));
                None
            }
        }
    }

    /// Send one audio frame. A saturated outbound queue drops the
    /// frame and keeps the turn alive; any other failure means the
    /// link is gone.
    fn send_frame(&mut self, frame: AudioFrame) -> Option<SessionEvent> {
        let sequence = frame.sequence;
        match self.outbound.send(&ClientMessage::AudioFrame(frame)) {
            Ok(()) => None,
            Err(SessionError::SendQueueFull) => {
                log::warn!("Outbound queue full, dropping frame {}", sequence);
                None
            }
            Err(e) => {
                log::warn!("Failed to send frame {}: {}", sequence, e);
                Some(SessionEvent::LinkLost)
            }
        }
    }

    fn publish_observables(&self) {
        let status = self.machine.status();
        let connected = self.machine.connected();
        self.connected_tx.send_if_modified(|current| {
            if *current != connected {
                *current = connected;
                true
            } else {
                false
            }
        });
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        let transcript = self.machine.live_transcript();
        self.transcript_tx.send_if_modified(|current| {
            if current != transcript {
                current.clear();
                current.push_str(transcript);
                true
            } else {
                false
            }
        });
    }

    /// In hands-free mode an utterance auto-releases after the policy's
    /// maximum; the timer is bound to the listening period it guards.
    fn manage_release_timer(&mut self, previous: SessionStatus) {
        let now = self.machine.status();
        if previous != SessionStatus::Listening && now == SessionStatus::Listening {
            if self.capture_mode == CaptureMode::HandsFree {
                let token = self.shutdown.child_token();
                let event_tx = self.event_tx.clone();
                let limit = self.release_policy.max_utterance();
                let timer = token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => {}
                        _ = tokio::time::sleep(limit) => {
                            log::info!("Hands-free utterance limit reached, releasing");
                            let _ = event_tx.send(SessionEvent::Released).await;
                        }
                    }
                });
                self.release_timer = Some(token);
            }
        } else if previous == SessionStatus::Listening && now != SessionStatus::Listening {
            self.cancel_release_timer();
        }
    }

    fn cancel_release_timer(&mut self) {
        if let Some(token) = self.release_timer.take() {
            token.cancel();
        }
    }

    fn apply_settings(&mut self, next: SessionSettings) {
        if next.server_url != self.settings.server_url {
            log::info!("Backend address changed, reconnecting to {}", next.server_url);
            self.outbound.retarget(&next.server_url);
        }
        if next.capture_mode != self.settings.capture_mode {
            // Mode switches only take effect between turns.
            self.pending_mode = Some(next.capture_mode);
            self.apply_pending_mode();
        }
        self.settings = next;
    }

    fn apply_pending_mode(&mut self) {
        if self.machine.status() != SessionStatus::Idle {
            return;
        }
        if let Some(mode) = self.pending_mode.take() {
            log::info!("Capture mode now {}", mode);
            self.capture_mode = mode;
            if mode == CaptureMode::HandsFree && self.machine.connected() {
                let _ = self.event_tx.try_send(SessionEvent::Pressed);
            }
        }
    }
}
