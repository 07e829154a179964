use anyhow::Context;
use clap::Parser;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use voice_session_rs::{
    capture::{AudioChunker, CpalSource, CpalSourceConfig},
    channel::ConnectionChannel,
    conversation::ConversationLog,
    engine::{EngineInputs, FixedTimeout, SessionEngine, SessionStatus},
    playback::CpalPlayer,
    settings::{CaptureMode, SessionSettings, SettingsResolver},
};

#[derive(Parser, Debug)]
#[command(name = "voice-session", about = "Push-to-talk voice conversation client")]
struct Args {
    /// Backend websocket URL (overrides VOICE_BACKEND_URL)
    #[arg(long)]
    server_url: Option<String>,

    /// Capture mode: push-to-talk | hands-free (overrides VOICE_CAPTURE_MODE)
    #[arg(long)]
    capture_mode: Option<String>,

    /// List audio input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Input device name (default: system default input)
    #[arg(long)]
    input_device: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TalkAction {
    Press,
    Release,
}

/// Enter toggles talking. Deriving the direction from the session
/// status keeps the toggle in phase when a press was rejected
/// (disconnected, or the assistant is still speaking).
fn talk_action(status: SessionStatus) -> TalkAction {
    if status == SessionStatus::Listening {
        TalkAction::Release
    } else {
        TalkAction::Press
    }
}

fn resolve_settings(args: &Args) -> anyhow::Result<SessionSettings> {
    if let Some(url) = &args.server_url {
        let mode = args.capture_mode.as_deref().unwrap_or("push-to-talk");
        return SessionSettings::from_parts(url, mode).context("invalid command-line settings");
    }
    let mut settings = SessionSettings::load().context(
        "no --server-url given and environment settings incomplete (set VOICE_BACKEND_URL)",
    )?;
    if let Some(mode) = &args.capture_mode {
        settings.capture_mode = CaptureMode::from_str(mode)
            .map_err(|_| anyhow::anyhow!("invalid capture mode '{}'", mode))?;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        for device in CpalSource::list_devices().context("device enumeration failed")? {
            println!(
                "{}{} ({} channels)",
                device.name,
                if device.is_default { " [default]" } else { "" },
                device.channel_count
            );
        }
        return Ok(());
    }

    let settings = resolve_settings(&args)?;
    log::info!(
        "Starting session: {} ({} mode)",
        settings.server_url,
        settings.capture_mode
    );

    let resolver = SettingsResolver::new(settings.clone());
    let history = Arc::new(ConversationLog::new());

    let (frame_tx, frame_rx) = mpsc::channel(32);
    let (channel_tx, channel_rx) = mpsc::channel(64);
    let (outcome_tx, outcome_rx) = mpsc::channel(8);

    let chunker = AudioChunker::new(
        CpalSource::new(CpalSourceConfig {
            device_id: args.input_device.clone(),
            channel: 0,
        }),
        frame_tx,
    );
    let player = CpalPlayer::new(outcome_tx).context("speaker unavailable")?;
    let channel = ConnectionChannel::connect(settings.server_url.clone(), channel_tx);
    let mut connection_status = channel.subscribe_status();

    let inputs = EngineInputs {
        frame_rx,
        channel_rx,
        outcome_rx,
        settings_rx: resolver.subscribe(),
    };
    let (engine, handle) = SessionEngine::new(
        Box::new(chunker),
        Box::new(player),
        Box::new(channel),
        Arc::clone(&history),
        inputs,
        Box::new(FixedTimeout::default()),
    );
    let engine_task = tokio::spawn(engine.run());

    // Status reporter: session state, live transcript, completed turns.
    let reporter_handle = handle.clone();
    let reporter_history = Arc::clone(&history);
    let mut status_rx = handle.subscribe_status();
    let mut transcript_rx = handle.subscribe_transcript();
    tokio::spawn(async move {
        let mut printed_turns = 0;
        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *status_rx.borrow_and_update();
                    println!("-- {} --", status);
                    if status == SessionStatus::Idle {
                        let turns = reporter_history.snapshot();
                        for turn in turns.iter().skip(printed_turns) {
                            println!("{}: {}", turn.role, turn.text);
                        }
                        printed_turns = turns.len();
                        if let Some(error) = reporter_handle.last_error() {
                            log::warn!("Last error: {}", error);
                        }
                    }
                }
                changed = transcript_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let text = transcript_rx.borrow_and_update().clone();
                    if !text.is_empty() {
                        println!("   ... {}", text);
                    }
                }
                changed = connection_status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    println!("== connection: {} ==", *connection_status.borrow_and_update());
                }
            }
        }
    });

    if settings.capture_mode == CaptureMode::PushToTalk {
        println!("Press Enter to talk, Enter again to stop. 'clear' clears history, 'quit' exits.");
    } else {
        println!("Hands-free mode: capture starts when connected. 'quit' exits.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(input)) => match input.trim() {
                        "quit" | "q" => break,
                        "clear" => {
                            handle.clear_history().await;
                            println!("History cleared");
                        }
                        _ => match talk_action(handle.status()) {
                            TalkAction::Press => handle.press().await,
                            TalkAction::Release => handle.release().await,
                        },
                    },
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("stdin error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    log::info!("Shutting down");
    handle.shutdown();
    let _ = engine_task.await;
    Ok(())
}
