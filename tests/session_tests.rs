//! End-to-end session scenarios against the engine loop, with scripted
//! capture, playback and connection fakes standing in for the devices
//! and the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use url::Url;

use voice_session_rs::capture::Capture;
use voice_session_rs::channel::ChannelEvent;
use voice_session_rs::conversation::{ConversationLog, Role};
use voice_session_rs::engine::{
    EngineInputs, FixedTimeout, Outbound, SessionEngine, SessionHandle, SessionStatus,
};
use voice_session_rs::playback::{decode_wav, PlaybackOutcome, Player};
use voice_session_rs::protocol::{AudioFrame, ClientMessage, ServerMessage};
use voice_session_rs::settings::{SessionSettings, SettingsResolver};
use voice_session_rs::{Result, SessionError};

/// Sends its scripted frames on `begin` and hands back the flush frame
/// on `end`, like the chunker does for a real utterance.
struct FakeCapture {
    frames: Vec<AudioFrame>,
    flush: Option<AudioFrame>,
    frame_tx: mpsc::Sender<AudioFrame>,
    active: Arc<AtomicBool>,
    fail_begin: bool,
}

#[async_trait]
impl Capture for FakeCapture {
    async fn begin(&mut self) -> Result<()> {
        if self.fail_begin {
            return Err(SessionError::DeviceUnavailable("scripted failure".into()));
        }
        self.active.store(true, Ordering::SeqCst);
        for frame in self.frames.clone() {
            let _ = self.frame_tx.send(frame).await;
        }
        Ok(())
    }

    async fn end(&mut self) -> Option<AudioFrame> {
        self.active.store(false, Ordering::SeqCst);
        self.flush.clone()
    }

    async fn abort(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Records played payloads; validates them like the real player does.
struct FakePlayer {
    outcome_tx: mpsc::Sender<PlaybackOutcome>,
    active: Arc<AtomicBool>,
    auto_complete: bool,
    played: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl Player for FakePlayer {
    async fn play(&mut self, wav: Vec<u8>) -> Result<()> {
        decode_wav(&wav)?;
        self.played.lock().unwrap().push(wav);
        self.active.store(true, Ordering::SeqCst);
        if self.auto_complete {
            self.active.store(false, Ordering::SeqCst);
            let _ = self.outcome_tx.send(PlaybackOutcome::Complete).await;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.outcome_tx.send(PlaybackOutcome::Cancelled).await;
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Records outbound messages while the scripted link is up. `full`
/// simulates a saturated outbound queue on a healthy link.
struct FakeLink {
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    up: Arc<AtomicBool>,
    full: Arc<AtomicBool>,
    retargets: Arc<Mutex<Vec<Url>>>,
}

impl Outbound for FakeLink {
    fn send(&self, message: &ClientMessage) -> Result<()> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        if self.full.load(Ordering::SeqCst) {
            return Err(SessionError::SendQueueFull);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn retarget(&self, url: &Url) {
        self.retargets.lock().unwrap().push(url.clone());
    }
}

struct HarnessConfig {
    frames: Vec<AudioFrame>,
    flush: Option<AudioFrame>,
    fail_begin: bool,
    auto_complete_playback: bool,
    mode: &'static str,
    release: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            flush: None,
            fail_begin: false,
            auto_complete_playback: true,
            mode: "push-to-talk",
            release: Duration::from_secs(8),
        }
    }
}

struct Harness {
    handle: SessionHandle,
    channel_tx: mpsc::Sender<ChannelEvent>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    link_up: Arc<AtomicBool>,
    link_full: Arc<AtomicBool>,
    capture_active: Arc<AtomicBool>,
    player_active: Arc<AtomicBool>,
    played: Arc<Mutex<Vec<Vec<u8>>>>,
    retargets: Arc<Mutex<Vec<Url>>>,
    outcome_tx: mpsc::Sender<PlaybackOutcome>,
    history: Arc<ConversationLog>,
    resolver: SettingsResolver,
    engine: JoinHandle<()>,
}

fn spawn_session(config: HarnessConfig) -> Harness {
    let (frame_tx, frame_rx) = mpsc::channel(32);
    let (channel_tx, channel_rx) = mpsc::channel(32);
    let (outcome_tx, outcome_rx) = mpsc::channel(8);

    let capture_active = Arc::new(AtomicBool::new(false));
    let capture = FakeCapture {
        frames: config.frames,
        flush: config.flush,
        frame_tx,
        active: Arc::clone(&capture_active),
        fail_begin: config.fail_begin,
    };

    let player_active = Arc::new(AtomicBool::new(false));
    let played = Arc::new(Mutex::new(Vec::new()));
    let player = FakePlayer {
        outcome_tx: outcome_tx.clone(),
        active: Arc::clone(&player_active),
        auto_complete: config.auto_complete_playback,
        played: Arc::clone(&played),
    };

    let sent = Arc::new(Mutex::new(Vec::new()));
    let link_up = Arc::new(AtomicBool::new(false));
    let link_full = Arc::new(AtomicBool::new(false));
    let retargets = Arc::new(Mutex::new(Vec::new()));
    let link = FakeLink {
        sent: Arc::clone(&sent),
        up: Arc::clone(&link_up),
        full: Arc::clone(&link_full),
        retargets: Arc::clone(&retargets),
    };

    let settings = SessionSettings::from_parts("ws://127.0.0.1:9/session", config.mode).unwrap();
    let resolver = SettingsResolver::new(settings);
    let history = Arc::new(ConversationLog::new());

    let inputs = EngineInputs {
        frame_rx,
        channel_rx,
        outcome_rx,
        settings_rx: resolver.subscribe(),
    };
    let (engine, handle) = SessionEngine::new(
        Box::new(capture),
        Box::new(player),
        Box::new(link),
        Arc::clone(&history),
        inputs,
        Box::new(FixedTimeout(config.release)),
    );
    let engine = tokio::spawn(engine.run());

    Harness {
        handle,
        channel_tx,
        sent,
        link_up,
        link_full,
        capture_active,
        player_active,
        played,
        retargets,
        outcome_tx,
        history,
        resolver,
        engine,
    }
}

impl Harness {
    async fn open_link(&self) {
        self.link_up.store(true, Ordering::SeqCst);
        self.channel_tx
            .send(ChannelEvent::Open { reconnected: false })
            .await
            .unwrap();
        self.wait_connected(true).await;
    }

    async fn reopen_link(&self) {
        self.link_up.store(true, Ordering::SeqCst);
        self.channel_tx
            .send(ChannelEvent::Open { reconnected: true })
            .await
            .unwrap();
        self.wait_connected(true).await;
    }

    async fn drop_link(&self) {
        self.link_up.store(false, Ordering::SeqCst);
        self.channel_tx.send(ChannelEvent::Lost).await.unwrap();
        self.wait_connected(false).await;
    }

    async fn wait_connected(&self, want: bool) {
        let mut rx = self.handle.subscribe_connected();
        timeout(Duration::from_secs(2), async {
            loop {
                if *rx.borrow_and_update() == want {
                    return;
                }
                rx.changed().await.expect("engine stopped");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for connected = {}", want));
    }

    async fn server(&self, message: ServerMessage) {
        self.channel_tx
            .send(ChannelEvent::Message(message))
            .await
            .unwrap();
    }

    fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    async fn wait_status(&self, want: SessionStatus) {
        let mut rx = self.handle.subscribe_status();
        timeout(Duration::from_secs(2), async {
            loop {
                if *rx.borrow_and_update() == want {
                    return;
                }
                rx.changed().await.expect("engine stopped");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for status {}", want));
    }

    async fn wait_sent(&self, count: usize) {
        timeout(Duration::from_secs(2), async {
            while self.sent.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {} sent messages, got {:?}",
                count,
                self.sent()
            )
        });
    }

    async fn wait_error(&self) -> String {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(error) = self.handle.last_error() {
                    return error;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a surfaced error")
    }

    async fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.engine.await;
    }
}

fn frame(sequence: u32, samples: usize) -> AudioFrame {
    AudioFrame {
        sequence,
        samples: vec![100; samples],
        end_of_utterance: false,
    }
}

fn flush_frame(sequence: u32, samples: usize) -> AudioFrame {
    AudioFrame {
        sequence,
        samples: vec![100; samples],
        end_of_utterance: true,
    }
}

/// A short valid mono WAV, base64-encoded the way replies carry audio.
fn reply_audio_base64() -> String {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buffer, spec).unwrap();
        for i in 0..160i16 {
            writer.write_sample(i * 100).unwrap();
        }
        writer.finalize().unwrap();
    }
    base64::engine::general_purpose::STANDARD.encode(buffer.into_inner())
}

#[tokio::test]
async fn test_full_turn_without_reply_audio() {
    let harness = spawn_session(HarnessConfig {
        frames: vec![frame(0, 1600), frame(1, 1600)],
        flush: Some(flush_frame(2, 800)),
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.wait_sent(2).await;

    harness.handle.release().await;
    harness.wait_status(SessionStatus::Processing).await;
    harness.wait_sent(4).await;

    // Frames in capture order, then the flushed remainder, then the
    // end-of-utterance marker.
    let sent = harness.sent();
    match (&sent[0], &sent[1], &sent[2]) {
        (
            ClientMessage::AudioFrame(a),
            ClientMessage::AudioFrame(b),
            ClientMessage::AudioFrame(c),
        ) => {
            assert_eq!((a.sequence, b.sequence, c.sequence), (0, 1, 2));
            assert!(!a.end_of_utterance);
            assert!(c.end_of_utterance);
            assert_eq!(c.len(), 800);
        }
        other => panic!("expected three audio frames, got {:?}", other),
    }
    assert_eq!(sent[3], ClientMessage::EndOfUtterance);

    harness
        .server(ServerMessage::PartialTranscript {
            text: "hel".to_string(),
        })
        .await;
    harness
        .server(ServerMessage::PartialTranscript {
            text: "hello".to_string(),
        })
        .await;
    harness
        .server(ServerMessage::FinalReply {
            transcript: "hello".to_string(),
            response_text: "hi there".to_string(),
            audio_base64: None,
        })
        .await;

    harness.wait_status(SessionStatus::Idle).await;
    assert_eq!(harness.handle.live_transcript(), "hello");
    assert!(harness.handle.last_error().is_none());
    assert!(harness.played.lock().unwrap().is_empty());

    let turns = harness.history.snapshot();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "hello");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].text, "hi there");
    assert!(turns[0].id < turns[1].id);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_reply_audio_is_played() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.handle.release().await;
    harness.wait_sent(2).await;

    harness
        .server(ServerMessage::FinalReply {
            transcript: "play something".to_string(),
            response_text: "here you go".to_string(),
            audio_base64: Some(reply_audio_base64()),
        })
        .await;

    // Playback auto-completes, so the session settles back to idle.
    harness.wait_status(SessionStatus::Idle).await;
    assert_eq!(harness.played.lock().unwrap().len(), 1);
    assert!(harness.handle.last_error().is_none());
    assert_eq!(harness.history.snapshot().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_reply_audio_degrades_to_text() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.handle.release().await;
    harness.wait_sent(2).await;

    harness
        .server(ServerMessage::FinalReply {
            transcript: "hello".to_string(),
            response_text: "hi".to_string(),
            audio_base64: Some("!!! not base64 !!!".to_string()),
        })
        .await;

    // Text still lands; nothing is played and the failure is surfaced.
    harness.wait_status(SessionStatus::Idle).await;
    harness.wait_error().await;
    assert!(harness.played.lock().unwrap().is_empty());
    let turns = harness.history.snapshot();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].text, "hi");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unplayable_reply_audio_surfaces_error() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.handle.release().await;
    harness.wait_sent(2).await;

    // Valid base64 wrapping bytes that are not a WAV file.
    let junk = base64::engine::general_purpose::STANDARD.encode(b"junk");
    harness
        .server(ServerMessage::FinalReply {
            transcript: "hello".to_string(),
            response_text: "hi".to_string(),
            audio_base64: Some(junk),
        })
        .await;

    harness.wait_status(SessionStatus::Idle).await;
    harness.wait_error().await;
    assert!(harness.played.lock().unwrap().is_empty());
    assert_eq!(harness.history.snapshot().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_mid_listening_abandons_turn() {
    let harness = spawn_session(HarnessConfig {
        frames: vec![frame(0, 1600)],
        flush: Some(flush_frame(1, 320)),
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.wait_sent(1).await;

    harness.drop_link().await;
    harness.wait_status(SessionStatus::Idle).await;
    harness.wait_error().await;
    assert!(!harness.capture_active.load(Ordering::SeqCst));
    assert!(harness.history.snapshot().is_empty());

    // Recovery: after the link comes back a new turn works.
    harness.reopen_link().await;
    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_send_failure_abandons_turn() {
    let harness = spawn_session(HarnessConfig {
        frames: vec![frame(0, 1600)],
        flush: Some(flush_frame(1, 320)),
        ..Default::default()
    });
    harness.open_link().await;

    // The link dies underneath the session without a loss event yet;
    // the first failed send is treated as the loss.
    harness.link_up.store(false, Ordering::SeqCst);
    harness.handle.press().await;

    harness.wait_error().await;
    harness.wait_status(SessionStatus::Idle).await;
    assert!(!harness.capture_active.load(Ordering::SeqCst));
    assert!(harness.sent().is_empty());
    assert!(harness.history.snapshot().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_release_racing_frames_sends_all_audio() {
    // Releasing right after pressing can overtake frames still queued
    // from capture; every produced frame must reach the backend, in
    // order, before the end-of-utterance marker.
    for _ in 0..20 {
        let harness = spawn_session(HarnessConfig {
            frames: vec![frame(0, 1600), frame(1, 1600), frame(2, 1600)],
            flush: Some(flush_frame(3, 800)),
            ..Default::default()
        });
        harness.open_link().await;

        harness.handle.press().await;
        harness.wait_status(SessionStatus::Listening).await;
        harness.handle.release().await;
        harness.wait_sent(5).await;

        let sent = harness.sent();
        let sequences: Vec<u32> = sent[..4]
            .iter()
            .map(|message| match message {
                ClientMessage::AudioFrame(f) => f.sequence,
                other => panic!("expected audio frame, got {:?}", other),
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(sent[4], ClientMessage::EndOfUtterance);

        harness.shutdown().await;
    }
}

#[tokio::test]
async fn test_send_backpressure_drops_frame_but_keeps_turn() {
    let harness = spawn_session(HarnessConfig {
        frames: vec![frame(0, 1600)],
        flush: Some(flush_frame(1, 320)),
        ..Default::default()
    });
    harness.open_link().await;

    // The link is up but its write queue is saturated; the frame is
    // dropped without killing the turn.
    harness.link_full.store(true, Ordering::SeqCst);
    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.handle.status(), SessionStatus::Listening);
    assert!(harness.sent().is_empty());
    assert!(harness.handle.last_error().is_none());

    // Congestion clears and the rest of the turn proceeds.
    harness.link_full.store(false, Ordering::SeqCst);
    harness.handle.release().await;
    harness.wait_sent(2).await;
    assert_eq!(harness.sent()[1], ClientMessage::EndOfUtterance);

    harness
        .server(ServerMessage::FinalReply {
            transcript: "hello".to_string(),
            response_text: "hi".to_string(),
            audio_base64: None,
        })
        .await;
    harness.wait_status(SessionStatus::Idle).await;
    assert_eq!(harness.history.snapshot().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_press_ignored_while_disconnected() {
    let harness = spawn_session(HarnessConfig::default());

    harness.handle.press().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.handle.status(), SessionStatus::Idle);
    assert!(!harness.capture_active.load(Ordering::SeqCst));
    assert!(harness.sent().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_capture_failure_surfaces_and_recovers_state() {
    let harness = spawn_session(HarnessConfig {
        fail_begin: true,
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_error().await;
    assert_eq!(harness.handle.status(), SessionStatus::Idle);
    assert!(harness.sent().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_press_during_speaking_is_ignored() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        auto_complete_playback: false,
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.handle.release().await;
    harness.wait_sent(2).await;
    harness
        .server(ServerMessage::FinalReply {
            transcript: "hello".to_string(),
            response_text: "hi".to_string(),
            audio_base64: Some(reply_audio_base64()),
        })
        .await;
    harness.wait_status(SessionStatus::Speaking).await;

    harness.handle.press().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.handle.status(), SessionStatus::Speaking);

    // Playback finishing releases the session.
    harness.outcome_tx.send(PlaybackOutcome::Complete).await.unwrap();
    harness.wait_status(SessionStatus::Idle).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_during_speaking_stops_playback() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        auto_complete_playback: false,
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.handle.release().await;
    harness.wait_sent(2).await;
    harness
        .server(ServerMessage::FinalReply {
            transcript: "hello".to_string(),
            response_text: "hi".to_string(),
            audio_base64: Some(reply_audio_base64()),
        })
        .await;
    harness.wait_status(SessionStatus::Speaking).await;

    harness.drop_link().await;
    harness.wait_status(SessionStatus::Idle).await;
    assert!(!harness.player_active.load(Ordering::SeqCst));
    // The exchange was already committed before playback started.
    assert_eq!(harness.history.snapshot().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_hands_free_cycles_turns_automatically() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        mode: "hands-free",
        release: Duration::from_millis(50),
        ..Default::default()
    });

    // Connecting starts the first capture; the release policy ends it.
    harness.open_link().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.wait_sent(2).await;
    assert_eq!(harness.sent()[1], ClientMessage::EndOfUtterance);

    harness
        .server(ServerMessage::FinalReply {
            transcript: "first".to_string(),
            response_text: "reply".to_string(),
            audio_base64: None,
        })
        .await;

    // Turn completion rolls straight into the next capture.
    harness.wait_status(SessionStatus::Listening).await;
    harness.wait_sent(4).await;
    assert_eq!(harness.history.snapshot().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_address_change_retargets_connection() {
    let harness = spawn_session(HarnessConfig::default());
    harness.open_link().await;

    let moved = SessionSettings::from_parts("ws://10.0.0.2:9000/session", "push-to-talk").unwrap();
    harness.resolver.apply(moved.clone());

    timeout(Duration::from_secs(2), async {
        while harness.retargets.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("engine never retargeted the connection");
    assert_eq!(harness.retargets.lock().unwrap()[0], moved.server_url);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_mode_switch_to_hands_free_starts_capture() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        release: Duration::from_secs(8),
        ..Default::default()
    });
    harness.open_link().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.handle.status(), SessionStatus::Idle);

    let settings = SessionSettings::from_parts("ws://127.0.0.1:9/session", "hands-free").unwrap();
    harness.resolver.apply(settings);

    harness.wait_status(SessionStatus::Listening).await;
    assert!(harness.capture_active.load(Ordering::SeqCst));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_clear_history() {
    let harness = spawn_session(HarnessConfig {
        flush: Some(flush_frame(0, 320)),
        ..Default::default()
    });
    harness.open_link().await;

    harness.handle.press().await;
    harness.wait_status(SessionStatus::Listening).await;
    harness.handle.release().await;
    harness
        .server(ServerMessage::FinalReply {
            transcript: "hello".to_string(),
            response_text: "hi".to_string(),
            audio_base64: None,
        })
        .await;
    harness.wait_status(SessionStatus::Idle).await;
    assert_eq!(harness.history.snapshot().len(), 2);

    harness.handle.clear_history().await;
    timeout(Duration::from_secs(2), async {
        while !harness.history.snapshot().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("history never cleared");

    harness.shutdown().await;
}
