//! Websocket transport over tokio-tungstenite, speaking Socket.IO.
//!
//! The room server is a Socket.IO server, so the session runs the
//! Engine.IO handshake (open packet, then a namespace connect carrying
//! `{"token": ...}` as auth) before it is handed out. Afterwards every
//! [`Frame`] travels as a `42["event", data]` packet and server pings are
//! answered with pongs. A session that sees no ping within the advertised
//! interval plus timeout is treated as closed.
//!
//! The token is also sent as `Authorization: Bearer <token>` on the upgrade
//! request.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::socketio::{self, Handshake, Packet};
use super::{closed_receiver, Session, Transport};
use crate::config::SyncConfig;
use crate::connection::Credential;
use crate::error::{Result, SyncError};
use crate::protocol::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WsStream, WsMessage>>>;

/// Connects to the room server at `url`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
    buffer: usize,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(3),
            buffer: 256,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            url: config.socket_url.clone(),
            connect_timeout: config.connect_timeout(),
            buffer: config.event_buffer,
        }
    }

    /// Override the handshake timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the inbound frame buffer (default 256).
    pub fn buffer(mut self, frames: usize) -> Self {
        self.buffer = frames.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, credential: &Credential) -> Result<Request> {
        let endpoint = socketio::endpoint(&self.url)?;
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::transport("connect", e))?;
        let bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|e| SyncError::transport("connect", e))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        Ok(request)
    }
}

impl Transport for WsTransport {
    type Session = WsSession;

    async fn connect(&self, credential: &Credential) -> Result<WsSession> {
        let request = self.request(credential)?;
        let (stream, handshake) = tokio::time::timeout(self.connect_timeout, open(request, credential))
            .await
            .map_err(|_| {
                SyncError::transport("connect", format!("timed out after {:?}", self.connect_timeout))
            })??;

        let (sink, source) = stream.split();
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        let (tx, _rx) = broadcast::channel(self.buffer);
        let shared = Arc::new(Shared {
            inbound: Mutex::new(Some(tx.clone())),
            connected: AtomicBool::new(true),
        });
        let id = handshake.sid.clone();
        let reader = tokio::spawn(read_loop(
            id.clone(),
            source,
            Arc::clone(&sink),
            tx,
            Arc::clone(&shared),
            handshake.liveness_window(),
        ));

        debug!(session = %id, url = %self.url, "socket.io session open");
        Ok(WsSession {
            id,
            sink,
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }
}

/// Upgrade, read the open packet, and connect the default namespace.
async fn open(request: Request, credential: &Credential) -> Result<(WsStream, Handshake)> {
    let (mut stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| SyncError::transport("connect", e))?;

    let handshake = match next_packet(&mut stream).await? {
        Packet::Open(handshake) => handshake,
        other => {
            return Err(SyncError::protocol(format!("expected open packet, got {other:?}")));
        }
    };

    let auth = Packet::Connect(Some(json!({ "token": credential.token() })));
    send_raw(&mut stream, &auth).await?;

    loop {
        match next_packet(&mut stream).await? {
            Packet::Connect(_) => return Ok((stream, handshake)),
            Packet::ConnectError(message) => {
                return Err(SyncError::transport("connect", format!("refused: {message}")));
            }
            Packet::Ping => send_raw(&mut stream, &Packet::Pong).await?,
            Packet::Close | Packet::Disconnect => {
                return Err(SyncError::transport("connect", "server closed during handshake"));
            }
            _ => {}
        }
    }
}

async fn next_packet(stream: &mut WsStream) -> Result<Packet> {
    while let Some(msg) = stream.next().await {
        match msg.map_err(|e| SyncError::transport("connect", e))? {
            WsMessage::Text(text) => return Packet::decode(&text),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(SyncError::transport("connect", "socket closed during handshake"))
}

async fn send_raw(stream: &mut WsStream, packet: &Packet) -> Result<()> {
    stream
        .send(WsMessage::Text(packet.encode()?))
        .await
        .map_err(|e| SyncError::transport("connect", e))
}

async fn send_packet(sink: &SharedSink, event: &str, packet: &Packet) -> Result<()> {
    let text = packet.encode()?;
    let mut sink = sink.lock().await;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| SyncError::transport(event, e))
}

#[derive(Debug)]
struct Shared {
    /// Taken (dropped) when the socket closes so receivers observe `Closed`.
    inbound: Mutex<Option<broadcast::Sender<Frame>>>,
    connected: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.take();
        }
    }
}

async fn read_loop(
    session_id: String,
    mut source: SplitStream<WsStream>,
    sink: SharedSink,
    tx: broadcast::Sender<Frame>,
    shared: Arc<Shared>,
    liveness: Duration,
) {
    loop {
        let msg = match tokio::time::timeout(liveness, source.next()).await {
            Err(_) => {
                warn!(session = %session_id, ?liveness, "no ping from server, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(session = %session_id, error = %e, "websocket read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        match Packet::decode(&text) {
            Ok(Packet::Event(frame)) => {
                // No subscribers yet is fine; the frame is simply dropped.
                let _ = tx.send(frame);
            }
            Ok(Packet::Ping) => {
                if let Err(e) = send_packet(&sink, "pong", &Packet::Pong).await {
                    warn!(session = %session_id, error = %e, "pong failed");
                    break;
                }
            }
            Ok(Packet::Close | Packet::Disconnect) => {
                debug!(session = %session_id, "server ended the session");
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(session = %session_id, error = %e, "unparseable packet ignored"),
        }
    }
    drop(tx);
    shared.close();
    debug!(session = %session_id, "websocket reader finished");
}

/// A live Socket.IO connection.
pub struct WsSession {
    id: String,
    sink: SharedSink,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session for WsSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::transport(frame.event, "session closed"));
        }
        let event = frame.event.clone();
        send_packet(&self.sink, &event, &Packet::Event(frame)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        match self.shared.inbound.lock() {
            Ok(inbound) => inbound.as_ref().map_or_else(closed_receiver, |tx| tx.subscribe()),
            Err(_) => closed_receiver(),
        }
    }

    async fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = send_packet(&self.sink, "disconnect", &Packet::Disconnect).await {
            debug!(session = %self.id, error = %e, "disconnect packet not delivered");
        }
        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(WsMessage::Close(None)).await {
                debug!(session = %self.id, error = %e, "close frame not delivered");
            }
        }
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shared.close();
        debug!(session = %self.id, "socket.io session closed");
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response as ServerResponse,
    };

    type ServerSocket = WebSocketStream<TcpStream>;

    async fn next_text(ws: &mut ServerSocket) -> String {
        loop {
            if let WsMessage::Text(text) = ws.next().await.unwrap().unwrap() {
                return text;
            }
        }
    }

    /// Accept one client and run the server half of the handshake up to
    /// the namespace connect. Returns the socket, the request target and
    /// the auth payload.
    async fn accept_client(listener: TcpListener, ping_interval: u64, ping_timeout: u64) -> (ServerSocket, String, Value) {
        let (tcp, _) = listener.accept().await.unwrap();
        let (target_tx, target_rx) = std::sync::mpsc::channel();
        let mut ws = tokio_tungstenite::accept_hdr_async(tcp, move |req: &ServerRequest, resp: ServerResponse| {
            target_tx.send(req.uri().to_string()).unwrap();
            Ok::<_, ErrorResponse>(resp)
        })
        .await
        .unwrap();
        let target = target_rx.recv().unwrap();

        let open = format!(
            r#"0{{"sid":"s1","upgrades":[],"pingInterval":{ping_interval},"pingTimeout":{ping_timeout},"maxPayload":1000000}}"#
        );
        ws.send(WsMessage::Text(open)).await.unwrap();
        let connect = next_text(&mut ws).await;
        assert!(connect.starts_with("40"), "{connect}");
        let auth: Value = serde_json::from_str(&connect[2..]).unwrap();
        (ws, target, auth)
    }

    #[test]
    fn test_builder_overrides() {
        let t = WsTransport::new("ws://localhost:5000")
            .connect_timeout(Duration::from_secs(9))
            .buffer(0);
        assert_eq!(t.url(), "ws://localhost:5000");
        assert_eq!(t.connect_timeout, Duration::from_secs(9));
        assert_eq!(t.buffer, 1, "buffer is clamped to at least one frame");
    }

    #[test]
    fn test_from_config_copies_socket_settings() {
        let cfg = SyncConfig {
            socket_url: "ws://example.test/rooms".into(),
            event_buffer: 64,
            ..SyncConfig::default()
        };
        let t = WsTransport::from_config(&cfg);
        assert_eq!(t.url(), "ws://example.test/rooms");
        assert_eq!(t.buffer, 64);
    }

    #[test]
    fn test_request_targets_socketio_endpoint_with_bearer() {
        let t = WsTransport::new("wss://klientel-backend.onrender.com");
        let request = t.request(&Credential::new("tok")).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://klientel-backend.onrender.com/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer tok");
    }

    #[tokio::test]
    async fn test_connect_fails_softly_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let t = WsTransport::new(format!("ws://{addr}")).connect_timeout(Duration::from_secs(1));
        let err = t.connect(&Credential::new("tok")).await.err().unwrap();
        assert!(matches!(err, SyncError::Transport { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_session_roundtrip_against_socketio_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut ws, target, auth) = accept_client(listener, 25_000, 20_000).await;
            ws.send(WsMessage::Text(r#"40{"sid":"n1"}"#.into())).await.unwrap();

            let join = next_text(&mut ws).await;
            ws.send(WsMessage::Text("2".into())).await.unwrap();
            let pong = next_text(&mut ws).await;
            ws.send(WsMessage::Text(
                r#"42["new_comment",{"id":"c1","lead_id":"lead-42","content":"hi"}]"#.into(),
            ))
            .await
            .unwrap();
            let goodbye = next_text(&mut ws).await;
            (target, auth, join, pong, goodbye)
        });

        let t = WsTransport::new(format!("ws://{addr}"));
        let session = t.connect(&Credential::new("tok")).await.unwrap();
        assert_eq!(session.id(), "s1");
        let mut rx = session.subscribe();
        session.emit(Frame::join("lead-42")).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.event, "new_comment");
        assert_eq!(inbound.lead_id().as_deref(), Some("lead-42"));

        session.disconnect().await;
        assert!(!session.is_connected());
        assert!(session.emit(Frame::leave("lead-42")).await.is_err());

        let (target, auth, join, pong, goodbye) = server.await.unwrap();
        assert_eq!(target, "/socket.io/?EIO=4&transport=websocket");
        assert_eq!(auth["token"], "tok");
        assert_eq!(join, r#"42["join_lead",{"lead_id":"lead-42"}]"#);
        assert_eq!(pong, "3");
        assert_eq!(goodbye, "41");
    }

    #[tokio::test]
    async fn test_refused_namespace_connect_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut ws, _, _) = accept_client(listener, 25_000, 20_000).await;
            ws.send(WsMessage::Text(r#"44{"message":"Not authorized"}"#.into()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let t = WsTransport::new(format!("ws://{addr}"));
        let err = t.connect(&Credential::new("expired")).await.err().unwrap();
        assert!(matches!(err, SyncError::Transport { .. }), "{err:?}");
        assert!(err.to_string().contains("Not authorized"), "{err}");
    }

    #[tokio::test]
    async fn test_silent_server_closes_session_after_liveness_window() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut ws, _, _) = accept_client(listener, 50, 50).await;
            ws.send(WsMessage::Text("40".into())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let t = WsTransport::new(format!("ws://{addr}"));
        let session = t.connect(&Credential::new("tok")).await.unwrap();
        let mut rx = session.subscribe();
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(closed, Err(broadcast::error::RecvError::Closed)));
        assert!(!session.is_connected());
    }
}
