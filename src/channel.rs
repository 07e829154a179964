//! Duplex backend connection over a websocket.
//!
//! Owns the socket lifecycle: connect, framed send in order, in-order
//! inbound delivery, and reconnect with exponential backoff after
//! unexpected closure. Outbound messages queued but not yet written
//! when the link drops are discarded, so no stale audio reaches a
//! restarted backend.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Result, SessionError};
use crate::protocol::{ClientMessage, ServerMessage, WireFrame};

pub const BACKOFF_BASE_MS: u64 = 500;
pub const BACKOFF_CAP_MS: u64 = 10_000;

/// Delay before reconnection attempt `attempt` (0-based): base 500 ms,
/// doubling, capped at 10 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

/// Connection lifecycle, independent of the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events delivered to the orchestrator, in arrival order.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Link established. `reconnected` distinguishes a recovery (the
    /// orchestrator abandons any in-flight turn) from the first open.
    Open { reconnected: bool },
    /// Link lost; reconnection begins automatically.
    Lost,
    /// Inbound protocol message.
    Message(ServerMessage),
}

enum LinkExit {
    Lost,
    Shutdown,
}

/// Handle to the connection task.
pub struct ConnectionChannel {
    outbound_tx: mpsc::Sender<WireFrame>,
    status_rx: watch::Receiver<ConnectionStatus>,
    url_tx: watch::Sender<Url>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionChannel {
    /// Open a connection to `url`, delivering events to `event_tx`.
    /// Connection management runs on its own task; this returns
    /// immediately.
    pub fn connect(url: Url, event_tx: mpsc::Sender<ChannelEvent>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<WireFrame>(64);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (url_tx, url_rx) = watch::channel(url);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_connection(
            url_rx,
            status_tx,
            event_tx,
            outbound_rx,
            shutdown.clone(),
        ));

        Self {
            outbound_tx,
            status_rx,
            url_tx,
            shutdown,
            task: Some(task),
        }
    }

    /// Point the channel at a new backend. The current link is dropped
    /// (delivered as `Lost`) and reconnection targets the new address.
    pub fn retarget(&self, url: Url) {
        if *self.url_tx.borrow() != url {
            let _ = self.url_tx.send(url);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Enqueue a message for in-order delivery. Fails with
    /// `NotConnected` unless the link is up and `SendQueueFull` when
    /// the link is up but the write queue is saturated; there is no
    /// queueing across reconnects.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        if self.status() != ConnectionStatus::Connected {
            return Err(SessionError::NotConnected);
        }
        self.outbound_tx
            .try_send(message.encode())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::SendQueueFull,
                mpsc::error::TrySendError::Closed(_) => SessionError::NotConnected,
            })
    }

    /// Terminal close: stops reconnection and drops the socket.
    pub async fn disconnect(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConnectionChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_connection(
    mut url_rx: watch::Receiver<Url>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<ChannelEvent>,
    mut outbound_rx: mpsc::Receiver<WireFrame>,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let url = url_rx.borrow_and_update().clone();
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        let ws_stream = match connected {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                let delay = backoff_delay(attempt);
                log::warn!(
                    "Connection attempt {} to {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    url,
                    e,
                    delay
                );
                attempt += 1;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    // A new target restarts the schedule immediately.
                    changed = url_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        attempt = 0;
                        continue;
                    }
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        log::info!("Connected to {}", url);
        attempt = 0;
        let _ = status_tx.send(ConnectionStatus::Connected);
        if event_tx
            .send(ChannelEvent::Open {
                reconnected: ever_connected,
            })
            .await
            .is_err()
        {
            break;
        }
        ever_connected = true;

        match run_link(ws_stream, &event_tx, &mut outbound_rx, &mut url_rx, &shutdown).await {
            LinkExit::Shutdown => break,
            LinkExit::Lost => {
                // Anything still queued was never delivered; drop it so a
                // restarted backend never receives stale audio.
                let mut dropped = 0;
                while outbound_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    log::warn!("Dropped {} undelivered outbound messages", dropped);
                }

                let _ = status_tx.send(ConnectionStatus::Reconnecting);
                if event_tx.send(ChannelEvent::Lost).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = status_tx.send(ConnectionStatus::Disconnected);
    log::info!("Connection task stopped");
}

async fn run_link(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    event_tx: &mpsc::Sender<ChannelEvent>,
    outbound_rx: &mut mpsc::Receiver<WireFrame>,
    url_rx: &mut watch::Receiver<Url>,
    shutdown: &CancellationToken,
) -> LinkExit {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.close().await;
                return LinkExit::Shutdown;
            }

            changed = url_rx.changed() => {
                let _ = write.close().await;
                if changed.is_err() {
                    return LinkExit::Shutdown;
                }
                log::info!("Target changed, dropping current link");
                return LinkExit::Lost;
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = write.close().await;
                    return LinkExit::Shutdown;
                };
                let message = match frame {
                    WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
                    WireFrame::Text(text) => Message::Text(text.into()),
                };
                if let Err(e) = write.send(message).await {
                    log::warn!("Send failed: {}", e);
                    return LinkExit::Lost;
                }
            }

            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match ServerMessage::decode(&text.to_string()) {
                            Ok(message) => {
                                log::debug!("Inbound message: {:?}", message);
                                if event_tx.send(ChannelEvent::Message(message)).await.is_err() {
                                    return LinkExit::Shutdown;
                                }
                            }
                            // Unrecognized inbound traffic is not fatal.
                            Err(e) => log::warn!("Ignoring inbound message: {}", e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::warn!("Ignoring unexpected binary message ({} bytes)", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        return LinkExit::Lost;
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        return LinkExit::Lost;
                    }
                    None => {
                        log::info!("Connection stream ended");
                        return LinkExit::Lost;
                    }
                }
            }
        }
    }
}

impl crate::engine::Outbound for ConnectionChannel {
    fn send(&self, message: &ClientMessage) -> Result<()> {
        ConnectionChannel::send(self, message)
    }

    fn retarget(&self, url: &Url) {
        ConnectionChannel::retarget(self, url.clone());
    }
}
