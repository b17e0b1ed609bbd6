//! In-process loopback transport.
//!
//! [`MemoryHub`] plays the room server: it tracks which sessions joined which
//! lead, relays `add_comment` to the room as `new_comment` (sender included),
//! and records every frame clients emit. Tests use it to inject inbound
//! frames, fail chosen events, slow emits down, and hold connects open.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::debug;

use super::{closed_receiver, Session, Transport};
use crate::connection::Credential;
use crate::error::{Result, SyncError};
use crate::protocol::{Frame, ADD_COMMENT, JOIN_LEAD, LEAVE_LEAD, NEW_COMMENT};

const DEFAULT_BUFFER: usize = 256;

#[derive(Debug)]
struct Peer {
    id: String,
    inbound: Mutex<Option<broadcast::Sender<Frame>>>,
    connected: AtomicBool,
}

impl Peer {
    fn deliver(&self, frame: Frame) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        match self.inbound.lock() {
            Ok(inbound) => inbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok()),
            Err(_) => false,
        }
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.take();
        }
    }
}

#[derive(Debug, Default)]
struct HubState {
    peers: HashMap<String, Arc<Peer>>,
    rooms: HashMap<String, HashSet<String>>,
    emitted: Vec<Frame>,
    failing_events: HashSet<String>,
    rejected_credentials: HashSet<String>,
    emit_latency: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    connects: usize,
}

/// Shared server side of every [`MemorySession`] created by one transport.
#[derive(Debug)]
pub struct MemoryHub {
    state: Mutex<HubState>,
    pending_connects: watch::Sender<usize>,
    next_id: AtomicUsize,
    buffer: usize,
}

/// Holds connects open until permits are released.
#[derive(Debug, Clone)]
pub struct ConnectGate {
    permits: Arc<Semaphore>,
}

impl ConnectGate {
    /// Let `n` waiting (or future) connects through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

impl MemoryHub {
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every frame clients emitted, in order.
    pub fn emitted(&self) -> Vec<Frame> {
        self.state().emitted.clone()
    }

    pub fn emitted_events(&self, event: &str) -> Vec<Frame> {
        self.state()
            .emitted
            .iter()
            .filter(|f| f.event == event)
            .cloned()
            .collect()
    }

    pub fn count_emitted(&self, event: &str) -> usize {
        self.state().emitted.iter().filter(|f| f.event == event).count()
    }

    pub fn clear_emitted(&self) {
        self.state().emitted.clear();
    }

    /// Deliver `frame` to every live session. Returns how many received it.
    pub fn inject(&self, frame: Frame) -> usize {
        let peers: Vec<Arc<Peer>> = self.state().peers.values().cloned().collect();
        peers.iter().filter(|p| p.deliver(frame.clone())).count()
    }

    /// Deliver `frame` to the sessions that joined `lead_id`.
    pub fn send_to_room(&self, lead_id: &str, frame: Frame) -> usize {
        let peers = self.room_peers(lead_id);
        peers.iter().filter(|p| p.deliver(frame.clone())).count()
    }

    /// Number of sessions currently in `lead_id`'s room.
    pub fn room_size(&self, lead_id: &str) -> usize {
        self.state().rooms.get(lead_id).map_or(0, HashSet::len)
    }

    /// Make every emit of `event` fail until [`MemoryHub::heal_event`].
    pub fn fail_event(&self, event: &str) {
        self.state().failing_events.insert(event.to_string());
    }

    pub fn heal_event(&self, event: &str) {
        self.state().failing_events.remove(event);
    }

    /// Delay each emit acknowledgment by `latency`.
    pub fn set_emit_latency(&self, latency: Option<Duration>) {
        self.state().emit_latency = latency;
    }

    pub fn reject_credential(&self, token: &str) {
        self.state().rejected_credentials.insert(token.to_string());
    }

    pub fn accept_credential(&self, token: &str) {
        self.state().rejected_credentials.remove(token);
    }

    /// Block subsequent connects until the returned gate releases them.
    pub fn hold_connects(&self) -> ConnectGate {
        let permits = Arc::new(Semaphore::new(0));
        self.state().gate = Some(Arc::clone(&permits));
        ConnectGate { permits }
    }

    /// Wait until at least `n` connects are parked behind the gate.
    pub async fn wait_for_pending_connects(&self, n: usize) {
        let mut rx = self.pending_connects.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|pending| *pending >= n).await;
    }

    /// Total successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn live_sessions(&self) -> usize {
        self.state()
            .peers
            .values()
            .filter(|p| p.connected.load(Ordering::SeqCst))
            .count()
    }

    /// Server-side hangup of every session.
    pub fn close_all(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state();
            state.rooms.clear();
            state.peers.drain().map(|(_, p)| p).collect()
        };
        for peer in peers {
            peer.close();
        }
    }

    fn room_peers(&self, lead_id: &str) -> Vec<Arc<Peer>> {
        let state = self.state();
        state
            .rooms
            .get(lead_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| state.peers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_peer(&self, peer_id: &str) {
        let mut state = self.state();
        state.peers.remove(peer_id);
        for members in state.rooms.values_mut() {
            members.remove(peer_id);
        }
        state.rooms.retain(|_, members| !members.is_empty());
    }

    /// Apply the room server's reaction to a client frame.
    fn relay(&self, peer_id: &str, frame: &Frame) {
        let Some(lead_id) = frame.lead_id() else {
            return;
        };
        match frame.event.as_str() {
            JOIN_LEAD => {
                self.state()
                    .rooms
                    .entry(lead_id)
                    .or_default()
                    .insert(peer_id.to_string());
            }
            LEAVE_LEAD => {
                let mut state = self.state();
                if let Some(members) = state.rooms.get_mut(&lead_id) {
                    members.remove(peer_id);
                }
            }
            ADD_COMMENT => {
                let delivered =
                    self.send_to_room(&lead_id, Frame::new(NEW_COMMENT, frame.data.clone()));
                debug!(lead_id = %lead_id, delivered, "relayed comment to room");
            }
            _ => {}
        }
    }
}

/// Loopback [`Transport`]. Clones share one hub.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        let (pending_connects, _rx) = watch::channel(0);
        Self {
            hub: Arc::new(MemoryHub {
                state: Mutex::new(HubState::default()),
                pending_connects,
                next_id: AtomicUsize::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn hub(&self) -> Arc<MemoryHub> {
        Arc::clone(&self.hub)
    }
}

impl Transport for MemoryTransport {
    type Session = MemorySession;

    async fn connect(&self, credential: &Credential) -> Result<MemorySession> {
        let gate = self.hub.state().gate.clone();
        if let Some(gate) = gate {
            self.hub.pending_connects.send_modify(|n| *n += 1);
            let permit = gate.acquire().await;
            self.hub.pending_connects.send_modify(|n| *n -= 1);
            match permit {
                Ok(permit) => permit.forget(),
                Err(e) => return Err(SyncError::transport("connect", e)),
            }
        }

        if self.hub.state().rejected_credentials.contains(credential.token()) {
            return Err(SyncError::transport("connect", "credential rejected"));
        }

        let id = format!("mem-{}", self.hub.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, _rx) = broadcast::channel(self.hub.buffer);
        let peer = Arc::new(Peer {
            id: id.clone(),
            inbound: Mutex::new(Some(tx)),
            connected: AtomicBool::new(true),
        });
        {
            let mut state = self.hub.state();
            state.peers.insert(id, Arc::clone(&peer));
            state.connects += 1;
        }
        Ok(MemorySession {
            peer,
            hub: Arc::clone(&self.hub),
        })
    }
}

/// One loopback connection.
#[derive(Debug)]
pub struct MemorySession {
    peer: Arc<Peer>,
    hub: Arc<MemoryHub>,
}

impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.peer.id
    }

    async fn emit(&self, frame: Frame) -> Result<()> {
        let latency = self.hub.state().emit_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_connected() {
            return Err(SyncError::transport(frame.event, "session closed"));
        }
        let failing = {
            let mut state = self.hub.state();
            state.emitted.push(frame.clone());
            state.failing_events.contains(&frame.event)
        };
        if failing {
            return Err(SyncError::transport(frame.event, "injected failure"));
        }
        self.hub.relay(&self.peer.id, &frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        match self.peer.inbound.lock() {
            Ok(inbound) => inbound.as_ref().map_or_else(closed_receiver, |tx| tx.subscribe()),
            Err(_) => closed_receiver(),
        }
    }

    async fn disconnect(&self) {
        self.peer.close();
        self.hub.remove_peer(&self.peer.id);
    }

    fn is_connected(&self) -> bool {
        self.peer.connected.load(Ordering::SeqCst)
    }
}
