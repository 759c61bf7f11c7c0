//! Streaming connection manager with automatic recovery
//!
//! One connection task owns the socket and the subscription registry.
//! Callers talk to it over a command channel and observe it through a
//! broadcast of feed events plus a watch of the connection state. On every
//! reconnect, active subscriptions are resent in their original order; a
//! missed re-subscription would silently stop price updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ReconnectConfig;
use crate::types::ConnectionState;
use crate::ws::events::{parse_frame, ControlFrame, FeedEvent, WireFrame};

#[derive(Error, Debug)]
pub enum WsError {
    #[error("connection error: {0}")]
    Connection(#[from] tungstenite::Error),
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection task is gone")]
    ChannelSend,
}

/// Identifies one active subscription for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Debug)]
enum ConnCommand {
    Connect,
    Disconnect,
    Subscribe {
        handle: SubscriptionHandle,
        topic: String,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
    },
}

enum SessionEnd {
    /// Explicit disconnect; no reconnection
    Disconnected,
    /// Manager was dropped; the task should exit
    CommandChannelClosed,
}

pub struct ConnectionManager {
    command_tx: mpsc::UnboundedSender<ConnCommand>,
    event_tx: broadcast::Sender<FeedEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    next_handle: AtomicU64,
}

impl ConnectionManager {
    /// Create the manager and spawn its connection task
    ///
    /// The task starts idle in `Disconnected`; nothing touches the network
    /// until `connect()` is called.
    pub fn new(ws_url: &str, token: &str, config: ReconnectConfig) -> Result<Self, WsError> {
        let endpoint = Url::parse_with_params(ws_url, &[("token", token)])?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(1024);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task_event_tx = event_tx.clone();
        tokio::spawn(async move {
            connection_task(endpoint.to_string(), config, command_rx, task_event_tx, state_tx)
                .await;
        });

        Ok(Self {
            command_tx,
            event_tx,
            state_rx,
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn connect(&self) -> Result<(), WsError> {
        self.send(ConnCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), WsError> {
        self.send(ConnCommand::Disconnect)
    }

    /// Register interest in a topic; active immediately if connected, and
    /// replayed automatically on every reconnect
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<SubscriptionHandle, WsError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.send(ConnCommand::Subscribe {
            handle,
            topic: topic.into(),
        })?;
        Ok(handle)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), WsError> {
        self.send(ConnCommand::Unsubscribe { handle })
    }

    /// Receiver for typed feed events
    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.event_tx.subscribe()
    }

    /// Watch of the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn send(&self, command: ConnCommand) -> Result<(), WsError> {
        self.command_tx.send(command).map_err(|_| WsError::ChannelSend)
    }
}

/// Delay before reconnect attempt `n` (1-indexed): `min(base * n, max)`
fn reconnect_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = Duration::from_millis(config.base_interval_ms);
    let max = Duration::from_millis(config.max_interval_ms);
    (base * attempt).min(max)
}

async fn connection_task(
    endpoint: String,
    config: ReconnectConfig,
    mut command_rx: mpsc::UnboundedReceiver<ConnCommand>,
    event_tx: broadcast::Sender<FeedEvent>,
    state_tx: watch::Sender<ConnectionState>,
) {
    // Subscriptions in original subscribe order, replayed on reconnect
    let mut subscriptions: Vec<(SubscriptionHandle, String)> = Vec::new();
    let mut attempt: u32 = 0;
    let mut want_connected = false;

    loop {
        if !want_connected {
            // Idle until told to connect; subscriptions can still be
            // registered and take effect on the next session
            match command_rx.recv().await {
                Some(ConnCommand::Connect) => {
                    want_connected = true;
                    attempt = 0;
                }
                Some(ConnCommand::Subscribe { handle, topic }) => {
                    subscriptions.push((handle, topic));
                }
                Some(ConnCommand::Unsubscribe { handle }) => {
                    subscriptions.retain(|(h, _)| *h != handle);
                }
                Some(ConnCommand::Disconnect) => {}
                None => return,
            }
            continue;
        }

        let _ = state_tx.send(ConnectionState::Connecting);
        match run_session(
            &endpoint,
            &config,
            &mut subscriptions,
            &mut command_rx,
            &event_tx,
            &state_tx,
        )
        .await
        {
            Ok(SessionEnd::Disconnected) => {
                info!("feed disconnected on request");
                want_connected = false;
                attempt = 0;
                let _ = state_tx.send(ConnectionState::Disconnected);
            }
            Ok(SessionEnd::CommandChannelClosed) => {
                let _ = state_tx.send(ConnectionState::Disconnected);
                return;
            }
            Err(err) => {
                attempt += 1;
                if config.max_attempts > 0 && attempt > config.max_attempts {
                    error!(
                        error = %err,
                        attempts = config.max_attempts,
                        "reconnect attempts exhausted, giving up until manual connect"
                    );
                    want_connected = false;
                    attempt = 0;
                    // Failed, not Disconnected: observers must be able to
                    // tell exhaustion apart from a requested disconnect
                    let _ = state_tx.send(ConnectionState::Failed);
                    continue;
                }

                let delay = reconnect_delay(attempt, &config);
                warn!(
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "feed connection lost, scheduling reconnect"
                );
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let _ = state_tx.send(ConnectionState::Reconnecting {
                    attempt,
                    next_attempt_at,
                });

                // The backoff timer still honors disconnects and
                // subscription changes
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = command_rx.recv() => match cmd {
                            Some(ConnCommand::Disconnect) => {
                                want_connected = false;
                                attempt = 0;
                                let _ = state_tx.send(ConnectionState::Disconnected);
                                break;
                            }
                            Some(ConnCommand::Connect) => {}
                            Some(ConnCommand::Subscribe { handle, topic }) => {
                                subscriptions.push((handle, topic));
                            }
                            Some(ConnCommand::Unsubscribe { handle }) => {
                                subscriptions.retain(|(h, _)| *h != handle);
                            }
                            None => {
                                let _ = state_tx.send(ConnectionState::Disconnected);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn run_session(
    endpoint: &str,
    config: &ReconnectConfig,
    subscriptions: &mut Vec<(SubscriptionHandle, String)>,
    command_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
    event_tx: &broadcast::Sender<FeedEvent>,
    state_tx: &watch::Sender<ConnectionState>,
) -> Result<SessionEnd, WsError> {
    debug!("connecting to market feed");
    let (ws_stream, response) = connect_async(endpoint).await?;
    info!(status = ?response.status(), "market feed connected");
    let (mut write, mut read) = ws_stream.split();

    let _ = state_tx.send(ConnectionState::Connected);

    // Replay subscriptions before anything else, one frame per topic, in
    // the order they were originally made
    for (_, topic) in subscriptions.iter() {
        let msg = serde_json::to_string(&ControlFrame::subscribe(vec![topic.clone()]))?;
        write.send(Message::Text(msg.into())).await?;
    }
    if !subscriptions.is_empty() {
        info!(count = subscriptions.len(), "resubscribed active topics");
    }

    let mut heartbeat = interval(Duration::from_secs(config.heartbeat_interval_secs));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_pong = Instant::now();
    let pong_timeout = Duration::from_secs(config.heartbeat_interval_secs * 2);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WireFrame>(&text) {
                        Ok(frame) => match parse_frame(&frame) {
                            Ok(Some(event)) => {
                                if event_tx.send(event).is_err() {
                                    debug!("no feed subscribers");
                                }
                            }
                            Ok(None) => {
                                debug!(frame_type = %frame.frame_type, "ignoring unknown frame type");
                            }
                            Err(err) => {
                                warn!(frame_type = %frame.frame_type, error = %err, "malformed frame payload");
                            }
                        },
                        Err(err) => {
                            warn!(error = %err, "unparseable frame");
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    last_pong = Instant::now();
                }
                Some(Ok(Message::Close(_))) => {
                    info!("feed closed by server");
                    return Err(WsError::Connection(tungstenite::Error::ConnectionClosed));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(WsError::Connection(err)),
                None => {
                    return Err(WsError::Connection(tungstenite::Error::ConnectionClosed));
                }
            },
            cmd = command_rx.recv() => match cmd {
                Some(ConnCommand::Subscribe { handle, topic }) => {
                    subscriptions.push((handle, topic.clone()));
                    let msg = serde_json::to_string(&ControlFrame::subscribe(vec![topic]))?;
                    write.send(Message::Text(msg.into())).await?;
                }
                Some(ConnCommand::Unsubscribe { handle }) => {
                    if let Some(index) = subscriptions.iter().position(|(h, _)| *h == handle) {
                        let (_, topic) = subscriptions.remove(index);
                        // Another handle may still hold the same topic
                        if !subscriptions.iter().any(|(_, t)| *t == topic) {
                            let msg = serde_json::to_string(&ControlFrame::unsubscribe(vec![topic]))?;
                            write.send(Message::Text(msg.into())).await?;
                        }
                    }
                }
                Some(ConnCommand::Disconnect) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Disconnected);
                }
                Some(ConnCommand::Connect) => {}
                None => return Ok(SessionEnd::CommandChannelClosed),
            },
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    warn!("heartbeat timeout, no pong received");
                    return Err(WsError::Connection(tungstenite::Error::ConnectionClosed));
                }
                write.send(Message::Ping(vec![].into())).await?;
            }
        }
    }
}
