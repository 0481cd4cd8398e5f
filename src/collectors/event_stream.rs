use crate::error::{ConnectionError, MonitorError, StoreError};
use crate::events::RawEvent;
use crate::monitoring::PipelineStats;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBPROTOCOL: &str = "homeassistant";

/// What the sink did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Ignored,
    /// The event triggered and counts towards the message cap
    Accepted,
}

/// Single consumer of the decoded event stream
pub trait EventSink: Send {
    fn on_event<'a>(
        &'a mut self,
        event: RawEvent,
    ) -> Pin<Box<dyn Future<Output = Result<EventOutcome, StoreError>> + Send + 'a>>;

    /// Called at the end of every session, before reconnecting or returning
    fn flush<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

/// Reconnect delay schedule: doubles per failure up to a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a schedule starting at `initial`; `max` below `initial` is raised to it
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double, capped at the maximum
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum SessionEnd {
    Stopped,
    CapReached,
}

/// Long-lived Home Assistant WebSocket client
///
/// Connects, authenticates, subscribes to the core and supervisor event buses
/// and hands every event to an [`EventSink`]. Connection failures of any kind
/// are retried with exponential backoff; only sink (persistence) failures end
/// the loop with an error.
pub struct EventStreamCollector {
    url: String,
    token: String,
    offer_subprotocol: bool,
    backoff: Backoff,
    healthy_after: Duration,
    message_cap: Option<u64>,
    accepted: u64,
    stats: Arc<PipelineStats>,
}

impl EventStreamCollector {
    /// Create a collector for a Home Assistant WebSocket endpoint
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket URL, e.g. `ws://supervisor/core/websocket`
    /// * `token` - Long-lived or supervisor access token
    ///
    /// Reconnects back off from 1 s to 30 s, and a session lasting 30 s
    /// counts as healthy.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            offer_subprotocol: true,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            healthy_after: Duration::from_secs(30),
            message_cap: None,
            accepted: 0,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Reconnect delays: start at `initial`, double per failure up to `max`
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(initial, max);
        self
    }

    /// Sessions lasting at least this long reset the backoff
    pub fn with_healthy_session(mut self, duration: Duration) -> Self {
        self.healthy_after = duration;
        self
    }

    /// Stop after `cap` accepted events; `Some(0)` returns right after subscribing
    pub fn with_message_cap(mut self, cap: Option<u64>) -> Self {
        self.message_cap = cap;
        self
    }

    /// Share pipeline counters; reconnects and received events are recorded here
    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Events accepted by the sink so far, across reconnects
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Run until stopped, the message cap is reached or the sink fails
    ///
    /// A stop is a `true` on the watch channel or the sender going away. The
    /// sink is flushed at the end of every session.
    ///
    /// # Errors
    ///
    /// Only [`MonitorError::Storage`]; connection problems are retried.
    pub async fn run<S: EventSink>(
        &mut self,
        sink: &mut S,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), MonitorError> {
        loop {
            let started = Instant::now();
            let outcome = self.session(sink, &mut stop).await;
            sink.flush().await?;

            let graceful = match outcome {
                Ok(SessionEnd::Stopped) => {
                    info!("Stop requested, event stream closed");
                    return Ok(());
                }
                Ok(SessionEnd::CapReached) => {
                    info!(
                        "Message cap reached after {} accepted events",
                        self.accepted
                    );
                    return Ok(());
                }
                Err(MonitorError::Connection(ConnectionError::Closed)) => {
                    info!("Server closed the event stream");
                    true
                }
                Err(MonitorError::Connection(e)) => {
                    warn!("Event stream failed: {}", e);
                    false
                }
                Err(e) => return Err(e),
            };

            if graceful || started.elapsed() >= self.healthy_after {
                self.backoff.reset();
            }

            self.stats.record_reconnect();
            let delay = self.backoff.next_delay();
            info!("Reconnecting to {} in {:?}", self.url, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_stop(&mut stop) => {
                    info!("Stop requested while waiting to reconnect");
                    return Ok(());
                }
            }
        }
    }

    async fn session<S: EventSink>(
        &mut self,
        sink: &mut S,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, MonitorError> {
        let mut socket = tokio::select! {
            socket = self.open_authenticated() => socket?,
            _ = wait_for_stop(stop) => return Ok(SessionEnd::Stopped),
        };
        subscribe(&mut socket).await?;
        info!("Subscribed to events at {}", self.url);

        if self.cap_reached() {
            let _ = socket.close(None).await;
            return Ok(SessionEnd::CapReached);
        }

        loop {
            let message = tokio::select! {
                message = next_json(&mut socket) => message?,
                _ = wait_for_stop(stop) => {
                    let _ = socket.close(None).await;
                    return Ok(SessionEnd::Stopped);
                }
            };

            let Some(event) = RawEvent::from_message(message) else {
                continue;
            };
            self.stats.record_event_received();

            if sink.on_event(event).await? == EventOutcome::Accepted {
                self.accepted += 1;
                if self.cap_reached() {
                    let _ = socket.close(None).await;
                    return Ok(SessionEnd::CapReached);
                }
            }
        }
    }

    fn cap_reached(&self) -> bool {
        self.message_cap.is_some_and(|cap| self.accepted >= cap)
    }

    fn request(&self) -> Result<Request<()>, ConnectionError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ConnectionError::Handshake(format!("invalid token header: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        if self.offer_subprotocol {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok(request)
    }

    async fn connect(&mut self) -> Result<Socket, ConnectionError> {
        loop {
            match tokio_tungstenite::connect_async(self.request()?).await {
                Ok((socket, response)) => {
                    debug!("Connected to {} ({})", self.url, response.status());
                    return Ok(socket);
                }
                Err(e @ (WsError::Http(_) | WsError::Protocol(_))) if self.offer_subprotocol => {
                    warn!(
                        "Handshake with {} rejected ({}), retrying without the {} subprotocol",
                        self.url, e, SUBPROTOCOL
                    );
                    self.offer_subprotocol = false;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Token auth first; on rejection one retry relying on the header alone
    async fn open_authenticated(&mut self) -> Result<Socket, ConnectionError> {
        let mut socket = self.connect().await?;
        match authenticate(&mut socket, Some(&self.token)).await {
            Ok(()) => Ok(socket),
            Err(ConnectionError::Authentication(reason)) => {
                warn!(
                    "Token authentication failed ({}), retrying with header authentication",
                    reason
                );
                let _ = socket.close(None).await;
                let mut socket = self.connect().await?;
                authenticate(&mut socket, None).await?;
                Ok(socket)
            }
            Err(e) => Err(e),
        }
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn message_type(message: &Value) -> &str {
    message.get("type").and_then(Value::as_str).unwrap_or("")
}

async fn next_json(socket: &mut Socket) -> Result<Value, ConnectionError> {
    loop {
        let message = match socket.next().await {
            Some(message) => message?,
            None => return Err(ConnectionError::Closed),
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => return Err(ConnectionError::Closed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        return serde_json::from_str(&text).map_err(|e| ConnectionError::Decode(e.to_string()));
    }
}

async fn send_json(socket: &mut Socket, message: &Value) -> Result<(), ConnectionError> {
    socket.send(Message::Text(message.to_string())).await?;
    Ok(())
}

/// A close while authenticating is how transport-authenticating proxies reject
fn during_auth(err: ConnectionError) -> ConnectionError {
    match err {
        ConnectionError::Closed => {
            ConnectionError::Authentication("connection closed during authentication".to_string())
        }
        other => other,
    }
}

/// Run the auth exchange; `None` sends a token-less auth message
async fn authenticate(socket: &mut Socket, token: Option<&str>) -> Result<(), ConnectionError> {
    let greeting = next_json(socket).await.map_err(during_auth)?;
    match message_type(&greeting) {
        "auth_ok" => {
            debug!("Authenticated at transport level");
            return Ok(());
        }
        "auth_required" => {}
        other => {
            return Err(ConnectionError::Handshake(format!(
                "expected auth_required, got {:?}",
                other
            )))
        }
    }

    let auth = match token {
        Some(token) => json!({"type": "auth", "access_token": token}),
        None => json!({"type": "auth"}),
    };
    send_json(socket, &auth).await?;

    let reply = next_json(socket).await.map_err(during_auth)?;
    match message_type(&reply) {
        "auth_ok" => Ok(()),
        "auth_invalid" => Err(ConnectionError::Authentication(
            reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("auth_invalid")
                .to_string(),
        )),
        other => Err(ConnectionError::Handshake(format!(
            "unexpected auth reply {:?}",
            other
        ))),
    }
}

async fn subscribe(socket: &mut Socket) -> Result<(), ConnectionError> {
    send_json(socket, &json!({"id": 1, "type": "subscribe_events"})).await?;
    send_json(socket, &json!({"id": 2, "type": "supervisor/subscribe"})).await
}
