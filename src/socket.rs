//! WebSocket client for the workflow service channel.
//!
//! The socket is owned by a workflow session. Inbound frames are decoded
//! and forwarded as typed events on a channel the session drains, keeping
//! ownership acyclic. Outbound traffic (client events, heartbeats,
//! keepalive pings, the close frame) funnels through one writer task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::protocol::{ClientEvent, Heartbeat};

/// Typed event delivered from the socket to its owning session.
#[derive(Debug)]
pub enum SocketEvent {
    /// A decoded JSON frame.
    Frame(Value),
    /// A frame that was not valid JSON, or a transport error.
    Error(String),
    /// The connection ended, with the close code and reason if one was
    /// received.
    Closed { code: u16, reason: String },
}

/// Timer and timeout settings for one connection.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub keepalive_interval: Duration,
}

enum Outbound {
    Text(String),
    Ping(Vec<u8>),
    Close,
}

/// Cheaply cloneable handle to one open connection.
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<SocketShared>,
}

struct SocketShared {
    out_tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    heartbeat_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

impl SocketClient {
    /// Opens the socket within the configured connect timeout and spawns
    /// the reader, writer, and timer tasks. Returns the handle plus the
    /// event channel the session drains.
    pub async fn connect(
        url: &str,
        bearer_token: Option<&str>,
        config: SocketConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SocketEvent>)> {
        let mut request = url
            .into_client_request()
            .map_err(|err| Error::ConnectFailed(err.to_string()))?;
        if let Some(token) = bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| Error::ConnectFailed(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| Error::ConnectTimeout(config.connect_timeout))?
            .map_err(|err| Error::ConnectFailed(err.to_string()))?;
        debug!(url, "socket connected");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    Outbound::Text(text) => sink.send(Message::Text(text)).await,
                    Outbound::Ping(payload) => sink.send(Message::Ping(payload)).await,
                    Outbound::Close => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            })))
                            .await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let reader_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut close_reported = false;
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => deliver_frame(&reader_tx, &text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => deliver_frame(&reader_tx, &text),
                        Err(err) => {
                            let _ = reader_tx
                                .send(SocketEvent::Error(format!("frame is not UTF-8: {err}")));
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = reader_tx.send(SocketEvent::Closed { code, reason });
                        close_reported = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "socket read failed");
                        let _ = reader_tx.send(SocketEvent::Error(format!("socket error: {err}")));
                        break;
                    }
                }
            }
            if !close_reported {
                let _ = reader_tx.send(SocketEvent::Closed {
                    code: 1006,
                    reason: String::new(),
                });
            }
        });

        let heartbeat_tx = out_tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut tick = interval(config.heartbeat_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                let event = ClientEvent::Heartbeat(Heartbeat {
                    timestamp: unix_millis(),
                });
                let Ok(json) = serde_json::to_string(&event) else {
                    break;
                };
                if heartbeat_tx.send(Outbound::Text(json)).is_err() {
                    break;
                }
            }
        });

        let keepalive_tx = out_tx.clone();
        let keepalive_task = tokio::spawn(async move {
            let mut tick = interval(config.keepalive_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                let payload = unix_millis().to_string().into_bytes();
                if keepalive_tx.send(Outbound::Ping(payload)).is_err() {
                    break;
                }
            }
        });

        let client = Self {
            inner: Arc::new(SocketShared {
                out_tx,
                closed: AtomicBool::new(false),
                heartbeat_task,
                keepalive_task,
            }),
        };
        Ok((client, event_rx))
    }

    /// Sends a client event. Returns false when the socket is not open.
    pub fn send(&self, event: &ClientEvent) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(json) = serde_json::to_string(event) else {
            return false;
        };
        self.inner.out_tx.send(Outbound::Text(json)).is_ok()
    }

    /// Stops the timers and closes the connection with code 1000.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.heartbeat_task.abort();
        self.inner.keepalive_task.abort();
        let _ = self.inner.out_tx.send(Outbound::Close);
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }
}

fn deliver_frame(tx: &mpsc::UnboundedSender<SocketEvent>, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            let _ = tx.send(SocketEvent::Frame(value));
        }
        Err(err) => {
            let _ = tx.send(SocketEvent::Error(
                Error::Decode(err.to_string()).to_string(),
            ));
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
