//! Management channel — persistent outbound WS connection to the server.
//!
//! Spawned on startup. Maintains a WebSocket to
//! `ws(s)://<server>/api/v1/devices/ws` with exponential-backoff reconnect,
//! sends a capability report as the first frame, and dispatches inbound
//! messages to a [`MessageHandler`] strictly in arrival order.
//!
//! ```text
//! Disconnected ──sleep(backoff)──▶ Connecting ──token + upgrade──▶ Connected
//!       ▲                              │                              │
//!       └──────── auth / connect error ┘◀──── close / failure ────────┘
//! ```
//!
//! A connection that delivers no frame at all (not even a pong) for three
//! ping intervals is treated as lost.
//!
//! The backoff is not reset by a successful connection unless
//! `reset_backoff_on_connect` is set, so a flapping network settles at the
//! ceiling delay.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::proto::ManagementMessage;
use super::{WS_CLOSE_INVALID_ENCODING, WS_CLOSE_INVALID_PAYLOAD};
use crate::auth::{bearer_header, TokenProvider};
use crate::backoff::BackoffCounter;
use crate::config::ManagementConfig;
use crate::error::ChannelError;

/// Type alias for the WS sink to reduce verbosity.
pub(crate) type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

/// How long to wait for the peer to finish a close handshake we started.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping intervals without any inbound frame before the peer counts as gone.
const MISSED_PINGS: u32 = 3;

/// Silence after which a connection with the given ping interval is dead.
///
/// Every ping we send is answered by a pong, so a healthy peer is never
/// quiet for this long.
pub(crate) fn liveness_timeout(ping_interval: Duration) -> Duration {
    ping_interval * MISSED_PINGS
}

/// Receives decoded server messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_alert(&self, message: &str);
    async fn on_shell_attach(&self, mac_addr: &str, uuid: &str);
}

/// Connection state of the management channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }
}

/// How an established connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// Close frame or EOF from the server.
    Closed,
    /// We closed the connection after a protocol violation.
    ProtocolViolation(String),
    /// Transport error after the connection was established.
    Failed(String),
}

/// Build a WS upgrade request carrying the device bearer token.
pub(crate) fn authorized_request(url: &str, token: &str) -> Result<Request, ChannelError> {
    let mut request = url.into_client_request()?;
    let value = HeaderValue::from_str(&bearer_header(token))
        .map_err(|e| ChannelError::ConnectionFailed(format!("invalid token header: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

pub(crate) fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// Persistent management connection.
pub struct ManagementChannel {
    ws_url: String,
    config: ManagementConfig,
    tokens: Arc<dyn TokenProvider>,
    handler: Arc<dyn MessageHandler>,
    state: AtomicU8,
    reconnects: AtomicU64,
}

impl ManagementChannel {
    /// `ws_base` is the server address with a `ws://` or `wss://` scheme.
    pub fn new(
        ws_base: &str,
        config: ManagementConfig,
        tokens: Arc<dyn TokenProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            ws_url: format!("{}/api/v1/devices/ws", ws_base.trim_end_matches('/')),
            config,
            tokens,
            handler,
            state: AtomicU8::new(ChannelState::Disconnected.as_u8()),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    /// Spawn the reconnect loop. Returns a `JoinHandle` that runs until aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.reconnect_loop().await })
    }

    /// Main loop: wait, connect, run until the connection dies, repeat.
    async fn reconnect_loop(&self) {
        let mut backoff =
            BackoffCounter::from_millis(self.config.backoff_min_ms, self.config.backoff_max_ms);

        loop {
            let delay = backoff.next();
            debug!("Management: next connection attempt in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;

            self.reconnects.fetch_add(1, Ordering::Relaxed);
            let result = self.connect_and_run().await;
            let established = result.is_ok();
            match result {
                Ok(Disconnect::Closed) => info!("Management: connection closed by server"),
                Ok(Disconnect::ProtocolViolation(reason)) => {
                    warn!("Management: closed connection after protocol violation: {reason}");
                }
                Ok(Disconnect::Failed(reason)) => {
                    warn!("Management: connection lost: {reason}");
                }
                Err(ChannelError::Auth(e)) => {
                    warn!("Management: cannot connect, device not authorized: {e}");
                }
                Err(e) => warn!("Management: connection error: {e}"),
            }
            if self.config.reset_backoff_on_connect && established {
                backoff.reset();
            }
            self.set_state(ChannelState::Disconnected);
        }
    }

    /// A single connection attempt.
    ///
    /// `Err` means the connection was never established; `Ok` reports how an
    /// established connection ended.
    pub async fn connect_and_run(&self) -> Result<Disconnect, ChannelError> {
        self.set_state(ChannelState::Connecting);
        let token = self.tokens.fetch_token().await?;
        let request = authorized_request(&self.ws_url, &token)?;

        info!("Management: connecting to {}", self.ws_url);
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        self.set_state(ChannelState::Connected);
        let (ws_sink, mut ws_stream) = ws_stream.split();
        let ws_sink: WsSink = Arc::new(Mutex::new(ws_sink));

        info!("Management: connected, sending capability report");
        {
            let report = ManagementMessage::capability_report(true).encode();
            let mut sink = ws_sink.lock().await;
            if let Err(e) = sink.send(Message::Text(report.into())).await {
                return Ok(Disconnect::Failed(e.to_string()));
            }
        }

        let ping_interval = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let heartbeat_task = spawn_heartbeat(ws_sink.clone(), ping_interval);
        let idle_limit = liveness_timeout(ping_interval);

        let outcome = loop {
            let Ok(next) = tokio::time::timeout(idle_limit, ws_stream.next()).await else {
                break Disconnect::Failed(format!(
                    "no frames from server for {}s",
                    idle_limit.as_secs()
                ));
            };
            let Some(msg) = next else {
                break Disconnect::Closed;
            };
            let msg = match msg {
                Ok(m) => m,
                Err(e) => break Disconnect::Failed(e.to_string()),
            };
            match msg {
                Message::Text(text) => match ManagementMessage::decode(text.as_str()) {
                    Ok(Some(message)) => self.dispatch(message).await,
                    Ok(None) => debug!("Management: ignoring message with unknown method"),
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = ws_sink
                            .lock()
                            .await
                            .send(close_message(WS_CLOSE_INVALID_PAYLOAD, "malformed message"))
                            .await;
                        drain_until_closed(&mut ws_stream).await;
                        break Disconnect::ProtocolViolation(reason);
                    }
                },
                Message::Binary(_) => {
                    // The protocol only uses text frames.
                    let _ = ws_sink
                        .lock()
                        .await
                        .send(close_message(
                            WS_CLOSE_INVALID_ENCODING,
                            "protocol expects text-mode messages",
                        ))
                        .await;
                    drain_until_closed(&mut ws_stream).await;
                    break Disconnect::ProtocolViolation("binary frame received".to_string());
                }
                Message::Close(frame) => {
                    if let Some(f) = frame {
                        debug!("Management: close frame {} {}", u16::from(f.code), f.reason);
                    }
                    break Disconnect::Closed;
                }
                _ => {}
            }
        };

        heartbeat_task.abort();
        Ok(outcome)
    }

    async fn dispatch(&self, message: ManagementMessage) {
        match message {
            ManagementMessage::Alert { alert } => {
                info!("Management: server alert: {}", alert.message);
                self.handler.on_alert(&alert.message).await;
            }
            ManagementMessage::ShellAttach { mac_addr, uuid } => {
                info!("Management: shell attach request {uuid}");
                self.handler.on_shell_attach(&mac_addr, &uuid).await;
            }
            ManagementMessage::CapabilityReport { .. } => {
                debug!("Management: ignoring capability report from server");
            }
        }
    }
}

/// Periodic WS pings on a shared sink; ends when a send fails.
pub(crate) fn spawn_heartbeat(sink: WsSink, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut sink = sink.lock().await;
            if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                break;
            }
        }
    })
}

/// After sending our close frame, read until the peer answers or goes away.
pub(crate) async fn drain_until_closed<S>(stream: &mut S)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
        while let Some(Ok(msg)) = stream.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
}
