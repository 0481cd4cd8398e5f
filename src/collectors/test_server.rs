//! Scripted Home Assistant WebSocket endpoint for tests

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerSocket = WebSocketStream<TcpStream>;

/// How a session answers authentication
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMode {
    /// `auth_required`, then `auth_ok` for any auth message
    Accept,
    /// `auth_ok` straight away, as behind an authenticating proxy
    Transport,
    /// `auth_invalid` for token auth, `auth_ok` for header-only auth
    RejectToken,
    /// `auth_invalid` for every auth message
    RejectAll,
}

/// One connection that authenticated and subscribed
#[derive(Debug, Clone)]
pub struct Session {
    pub auth: AuthMode,
    /// Raw text frames sent after the subscriptions arrive
    pub frames: Vec<String>,
    /// Close after the frames instead of holding the connection open
    pub close: bool,
}

impl Session {
    pub fn new(frames: Vec<String>) -> Self {
        Self {
            auth: AuthMode::Accept,
            frames,
            close: false,
        }
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }
}

/// An `{"type":"event"}` frame
pub fn event_frame(event_type: &str, data: Value, time_fired: &str) -> String {
    json!({
        "type": "event",
        "event": {"event_type": event_type, "data": data, "time_fired": time_fired}
    })
    .to_string()
}

pub struct TestServer {
    pub url: String,
    received: Arc<Mutex<Vec<Value>>>,
    sessions: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Serve `sessions` in order to whoever connects
    ///
    /// A session is used up only once the client has authenticated and sent
    /// both subscriptions; rejected or dropped connections leave it pending.
    /// Once the script is exhausted, further connections are authenticated
    /// and held open silently.
    pub async fn start(sessions: Vec<Session>) -> Self {
        Self::serve(sessions, true).await
    }

    /// Like [`TestServer::start`], but never accepts the subprotocol, so a
    /// client offering it fails the handshake
    pub async fn without_subprotocol(sessions: Vec<Session>) -> Self {
        Self::serve(sessions, false).await
    }

    async fn serve(sessions: Vec<Session>, echo: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/api/websocket", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let served = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn({
            let received = Arc::clone(&received);
            let served = Arc::clone(&served);
            async move {
                let mut script = sessions.into_iter();
                let mut pending = script.next();
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let accepted = if echo {
                        tokio_tungstenite::accept_hdr_async(stream, echo_subprotocol).await
                    } else {
                        tokio_tungstenite::accept_async(stream).await
                    };
                    let Ok(mut socket) = accepted else {
                        continue;
                    };
                    let session = pending
                        .clone()
                        .unwrap_or_else(|| Session::new(Vec::new()));
                    if !authenticate(&mut socket, session.auth, &received).await
                        || !await_subscriptions(&mut socket, &received).await
                    {
                        continue;
                    }
                    served.fetch_add(1, Ordering::SeqCst);
                    if pending.is_some() {
                        pending = script.next();
                    }
                    play(&mut socket, &session, &received).await;
                }
            }
        });

        Self {
            url,
            received,
            sessions: served,
            handle,
        }
    }

    /// Every JSON message the client sent, across connections
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Number of connections that authenticated and subscribed
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Accept the `homeassistant` subprotocol when offered, like the real server
fn echo_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|p| p.trim() == "homeassistant"));
    if offered {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("homeassistant"));
    }
    Ok(response)
}

async fn read_json(socket: &mut ServerSocket, received: &Mutex<Vec<Value>>) -> Option<Value> {
    loop {
        match socket.next().await? {
            Ok(Message::Text(text)) => {
                let value: Value = serde_json::from_str(&text).ok()?;
                received.lock().unwrap().push(value.clone());
                return Some(value);
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn send(socket: &mut ServerSocket, value: Value) -> bool {
    socket.send(Message::Text(value.to_string())).await.is_ok()
}

async fn authenticate(
    socket: &mut ServerSocket,
    mode: AuthMode,
    received: &Mutex<Vec<Value>>,
) -> bool {
    if mode == AuthMode::Transport {
        return send(socket, json!({"type": "auth_ok"})).await;
    }
    if !send(socket, json!({"type": "auth_required"})).await {
        return false;
    }
    let Some(auth) = read_json(socket, received).await else {
        return false;
    };
    let rejected = match mode {
        AuthMode::RejectAll => true,
        AuthMode::RejectToken => auth.get("access_token").is_some(),
        AuthMode::Accept | AuthMode::Transport => false,
    };
    if rejected {
        send(socket, json!({"type": "auth_invalid", "message": "Invalid access token"})).await;
        let _ = socket.close(None).await;
        return false;
    }
    send(socket, json!({"type": "auth_ok"})).await
}

/// Both subscribe messages must arrive before a session counts
async fn await_subscriptions(socket: &mut ServerSocket, received: &Mutex<Vec<Value>>) -> bool {
    for _ in 0..2 {
        if read_json(socket, received).await.is_none() {
            return false;
        }
    }
    true
}

async fn play(socket: &mut ServerSocket, session: &Session, received: &Mutex<Vec<Value>>) {
    for frame in &session.frames {
        if socket.send(Message::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if session.close {
        let _ = socket.close(None).await;
        // drain until the client acknowledges the close
        while let Some(Ok(_)) = socket.next().await {}
        return;
    }
    while read_json(socket, received).await.is_some() {}
}
