//! Room membership tracker.
//!
//! One entry per lead id, moving through
//! `Left → Joining → Joined → Leaving → Left` (plus `Joining → Left` on a
//! failed or cancelled join). Callers only state what they *want*; a single
//! driver per room performs one transition at a time, so concurrent
//! `join`/`leave` calls coalesce instead of emitting duplicate messages.
//!
//! Joins requested while no session exists are queued and sent by
//! [`MembershipTracker::flush_pending`] once one is established.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::protocol::Frame;
use crate::transport::{Session, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    Joining,
    Joined,
    Leaving,
    Left,
}

struct RoomEntry<S> {
    state: MembershipState,
    /// The session the room was joined against. Never owned.
    session: Weak<S>,
    /// What the owning view asked for last.
    wanted: bool,
    /// Joining without a session: the join has not been sent yet.
    pending: bool,
    /// A join or leave emit is awaiting acknowledgment.
    in_flight: bool,
    /// Identifies the in-flight emit; bumped on reset to void late acks.
    attempt: u64,
}

impl<S> RoomEntry<S> {
    fn new() -> Self {
        Self {
            state: MembershipState::Left,
            session: Weak::new(),
            wanted: false,
            pending: false,
            in_flight: false,
            attempt: 0,
        }
    }

    fn effective_state(&self) -> MembershipState {
        if self.state == MembershipState::Joined && self.session.strong_count() == 0 {
            MembershipState::Left
        } else {
            self.state
        }
    }
}

enum Step<S> {
    Settled(MembershipState),
    SendJoin(Arc<S>, u64),
    SendLeave(Arc<S>, u64),
}

pub struct MembershipTracker<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    rooms: Mutex<HashMap<String, RoomEntry<T::Session>>>,
    next_attempt: Mutex<u64>,
}

impl<T: Transport> MembershipTracker<T> {
    pub fn new(connection: Arc<ConnectionManager<T>>) -> Self {
        Self {
            connection,
            rooms: Mutex::new(HashMap::new()),
            next_attempt: Mutex::new(0),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, RoomEntry<T::Session>>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn attempt_id(&self) -> u64 {
        let mut next = self.next_attempt.lock().unwrap_or_else(|p| p.into_inner());
        *next += 1;
        *next
    }

    /// Join `lead_id`'s room.
    ///
    /// Joining a room that is already Joined or Joining sends nothing.
    /// Without a session the join is queued and this returns `Joining`.
    /// Transport failures are logged and leave the room `Left`.
    pub async fn join(&self, lead_id: &str) -> MembershipState {
        {
            let mut rooms = self.rooms();
            let entry = rooms.entry(lead_id.to_string()).or_insert_with(RoomEntry::new);
            entry.wanted = true;
        }
        self.drive(lead_id).await
    }

    /// Leave `lead_id`'s room. Leaving a room that is already Left sends nothing.
    pub async fn leave(&self, lead_id: &str) -> MembershipState {
        {
            let mut rooms = self.rooms();
            match rooms.get_mut(lead_id) {
                Some(entry) => entry.wanted = false,
                None => return MembershipState::Left,
            }
        }
        self.drive(lead_id).await
    }

    /// Send every queued join now that a session may exist. Returns how many
    /// rooms reached `Joined`.
    pub async fn flush_pending(&self) -> usize {
        let queued: Vec<String> = self
            .rooms()
            .iter()
            .filter(|(_, e)| e.pending && e.wanted)
            .map(|(id, _)| id.clone())
            .collect();
        let mut joined = 0;
        for lead_id in queued {
            if self.drive(&lead_id).await == MembershipState::Joined {
                joined += 1;
            }
        }
        joined
    }

    /// Void every membership tied to the previous session.
    ///
    /// Joined, Leaving and in-flight Joining rooms are dropped (reading as
    /// `Left`) and are not rejoined automatically. Queued joins stay queued.
    /// Returns the lead ids that were reset.
    pub fn reset_all(&self) -> Vec<String> {
        let mut reset = Vec::new();
        let mut rooms = self.rooms();
        rooms.retain(|lead_id, entry| {
            if entry.pending {
                return true;
            }
            if entry.state == MembershipState::Left {
                // A join about to run its first step still wants the room.
                return entry.wanted;
            }
            reset.push(lead_id.clone());
            false
        });
        if !reset.is_empty() {
            debug!(rooms = reset.len(), "memberships reset after session change");
        }
        reset
    }

    /// Number of rooms with a tracked entry.
    pub fn tracked(&self) -> usize {
        self.rooms().len()
    }

    pub fn state(&self, lead_id: &str) -> MembershipState {
        self.rooms()
            .get(lead_id)
            .map_or(MembershipState::Left, RoomEntry::effective_state)
    }

    pub fn is_joined(&self, lead_id: &str) -> bool {
        self.state(lead_id) == MembershipState::Joined
    }

    pub fn is_queued(&self, lead_id: &str) -> bool {
        self.rooms().get(lead_id).is_some_and(|e| e.pending)
    }

    /// Lead ids currently `Joined`, sorted.
    pub fn joined(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .rooms()
            .iter()
            .filter(|(_, e)| e.effective_state() == MembershipState::Joined)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Run transitions for one room until it settles or another driver owns
    /// it, then drop the entry if nothing wants the room any more.
    async fn drive(&self, lead_id: &str) -> MembershipState {
        let state = self.run_transitions(lead_id).await;
        if state == MembershipState::Left {
            self.prune(lead_id);
        }
        state
    }

    fn prune(&self, lead_id: &str) {
        let mut rooms = self.rooms();
        let idle = rooms.get(lead_id).is_some_and(|e| {
            e.state == MembershipState::Left && !e.wanted && !e.pending && !e.in_flight
        });
        if idle {
            rooms.remove(lead_id);
        }
    }

    async fn run_transitions(&self, lead_id: &str) -> MembershipState {
        loop {
            let step = self.next_step(lead_id);
            match step {
                Step::Settled(state) => return state,
                Step::SendJoin(session, attempt) => {
                    debug!(lead_id = %lead_id, session = %session.id(), "joining room");
                    let result = session.emit(Frame::join(lead_id)).await;
                    let mut rooms = self.rooms();
                    let Some(entry) = rooms.get_mut(lead_id).filter(|e| e.attempt == attempt) else {
                        return MembershipState::Left;
                    };
                    entry.in_flight = false;
                    match result {
                        Ok(()) => entry.state = MembershipState::Joined,
                        Err(e) => {
                            warn!(lead_id = %lead_id, error = %e, "join failed");
                            entry.state = MembershipState::Left;
                            entry.session = Weak::new();
                            entry.wanted = false;
                            return MembershipState::Left;
                        }
                    }
                }
                Step::SendLeave(session, attempt) => {
                    debug!(lead_id = %lead_id, session = %session.id(), "leaving room");
                    let result = session.emit(Frame::leave(lead_id)).await;
                    if let Err(e) = &result {
                        warn!(lead_id = %lead_id, error = %e, "leave failed");
                    }
                    let mut rooms = self.rooms();
                    let Some(entry) = rooms.get_mut(lead_id).filter(|e| e.attempt == attempt) else {
                        return MembershipState::Left;
                    };
                    entry.in_flight = false;
                    entry.state = MembershipState::Left;
                    entry.session = Weak::new();
                }
            }
        }
    }

    fn next_step(&self, lead_id: &str) -> Step<T::Session> {
        let session = self.connection.session();
        let attempt = self.attempt_id();
        let mut rooms = self.rooms();
        let Some(entry) = rooms.get_mut(lead_id) else {
            return Step::Settled(MembershipState::Left);
        };
        if entry.in_flight {
            // The driver that owns the emit will act on `wanted` when it lands.
            return Step::Settled(entry.state);
        }

        if entry.state == MembershipState::Joined && entry.session.strong_count() == 0 {
            entry.state = MembershipState::Left;
        }

        match (entry.state, entry.wanted) {
            (MembershipState::Left, true) | (MembershipState::Joining, true) => match session {
                Some(session) => {
                    entry.state = MembershipState::Joining;
                    entry.pending = false;
                    entry.in_flight = true;
                    entry.attempt = attempt;
                    entry.session = Arc::downgrade(&session);
                    Step::SendJoin(session, attempt)
                }
                None => {
                    if !entry.pending {
                        debug!(lead_id = %lead_id, "no session, join queued");
                    }
                    entry.state = MembershipState::Joining;
                    entry.pending = true;
                    Step::Settled(MembershipState::Joining)
                }
            },
            (MembershipState::Joining, false) => {
                // Queued join cancelled before it was ever sent.
                entry.state = MembershipState::Left;
                entry.pending = false;
                Step::Settled(MembershipState::Left)
            }
            (MembershipState::Joined, false) => match entry.session.upgrade() {
                Some(session) => {
                    entry.state = MembershipState::Leaving;
                    entry.in_flight = true;
                    entry.attempt = attempt;
                    Step::SendLeave(session, attempt)
                }
                None => {
                    entry.state = MembershipState::Left;
                    Step::Settled(MembershipState::Left)
                }
            },
            (MembershipState::Leaving, _) => {
                // Only reachable without an emit in flight after a reset.
                entry.state = MembershipState::Left;
                Step::Settled(MembershipState::Left)
            }
            (state, _) => Step::Settled(state),
        }
    }
}
