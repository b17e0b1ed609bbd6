//! Transport session collaborator.
//!
//! A [`Transport`] turns a credential into a live [`Session`]: a persistent
//! bidirectional channel carrying [`Frame`]s. Reconnection policy belongs to
//! the transport, never to the sync core.
//!
//! Two implementations ship with the crate:
//! - [`ws::WsTransport`]: Socket.IO client over tokio-tungstenite (packet
//!   codec in [`socketio`])
//! - [`memory::MemoryTransport`]: in-process loopback with a room relay

use std::future::Future;
use tokio::sync::broadcast;

use crate::connection::Credential;
use crate::error::Result;
use crate::protocol::Frame;

pub mod memory;
pub mod socketio;
pub mod ws;

/// One live connection.
pub trait Session: Send + Sync + 'static {
    /// Unique id of this session, for logs.
    fn id(&self) -> &str;

    /// Send a frame. Resolves `Ok` once the transport accepted it; that is
    /// the acknowledgment the membership tracker waits for.
    fn emit(&self, frame: Frame) -> impl Future<Output = Result<()>> + Send;

    /// Register for inbound frames. Dropping the receiver unregisters.
    ///
    /// The receiver reports `Closed` once the session is gone.
    fn subscribe(&self) -> broadcast::Receiver<Frame>;

    /// Close the connection. Idempotent.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;
}

/// Factory for sessions.
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    fn connect(&self, credential: &Credential) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// A receiver that is already closed, for sessions that are gone.
pub(crate) fn closed_receiver() -> broadcast::Receiver<Frame> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}
