//! Connection manager: zero or one live transport session, keyed by the
//! current auth credential.
//!
//! ## Guarantees
//! - Only this type creates or destroys sessions
//! - A session whose connect finishes after a newer [`ConnectionManager::set_credential`]
//!   call is disconnected and discarded on arrival (stale-session guard)
//! - [`ConnectionManager::session`] never blocks on I/O
//!
//! ## NOT Responsible For
//! - Retrying failed connects (the transport's policy, if any)
//! - Room membership (see [`crate::membership`])

use std::fmt;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::transport::{Session, Transport};

/// A bearer token. `Debug` never prints the secret.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Observable link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
}

/// What a [`ConnectionManager::set_credential`] call did.
pub enum SessionChange<S> {
    /// Same credential as before and a session is live or on its way.
    Unchanged,
    /// A new session is live. Every room joined on an older session is void.
    Established { generation: u64, session: Arc<S> },
    /// The credential was cleared; `had_session` tells whether one was closed.
    TornDown { had_session: bool },
    /// Connecting failed. Not retried here.
    Failed(SyncError),
    /// The connect completed after a newer credential change and was dropped.
    Discarded,
}

impl<S> fmt::Debug for SessionChange<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionChange::Unchanged => f.write_str("Unchanged"),
            SessionChange::Established { generation, .. } => f
                .debug_struct("Established")
                .field("generation", generation)
                .finish_non_exhaustive(),
            SessionChange::TornDown { had_session } => f
                .debug_struct("TornDown")
                .field("had_session", had_session)
                .finish(),
            SessionChange::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            SessionChange::Discarded => f.write_str("Discarded"),
        }
    }
}

struct Slot<S> {
    credential: Option<Credential>,
    session: Option<Arc<S>>,
    /// Bumped on every credential change and on session loss.
    generation: u64,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    slot: Mutex<Slot<T::Session>>,
    connectivity: watch::Sender<Connectivity>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        let (connectivity, _rx) = watch::channel(Connectivity::Disconnected);
        Self {
            transport,
            slot: Mutex::new(Slot {
                credential: None,
                session: None,
                generation: 0,
            }),
            connectivity,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Switch to `credential`, replacing or tearing down the current session.
    ///
    /// Never returns an error: failures are reported through the returned
    /// [`SessionChange`] and the connectivity channel.
    pub async fn set_credential(&self, credential: Option<Credential>) -> SessionChange<T::Session> {
        let (generation, previous) = {
            let mut slot = lock(&self.slot);
            if let (Some(next), Some(current)) = (&credential, &slot.credential) {
                if next == current && *self.connectivity.borrow() != Connectivity::Disconnected {
                    return SessionChange::Unchanged;
                }
            }
            slot.generation += 1;
            slot.credential = credential.clone();
            let previous = slot.session.take();
            let state = if credential.is_some() {
                Connectivity::Connecting
            } else {
                Connectivity::Disconnected
            };
            self.connectivity.send_replace(state);
            (slot.generation, previous)
        };

        let had_session = previous.is_some();
        if let Some(old) = previous {
            info!(session = %old.id(), generation, "tearing down session");
            old.disconnect().await;
        }

        let Some(credential) = credential else {
            return SessionChange::TornDown { had_session };
        };

        match self.transport.connect(&credential).await {
            Ok(session) => {
                let session = Arc::new(session);
                let stale = {
                    let mut slot = lock(&self.slot);
                    if slot.generation == generation {
                        slot.session = Some(Arc::clone(&session));
                        self.connectivity.send_replace(Connectivity::Connected);
                        false
                    } else {
                        true
                    }
                };
                if stale {
                    debug!(session = %session.id(), generation, "discarding stale session");
                    session.disconnect().await;
                    return SessionChange::Discarded;
                }
                info!(session = %session.id(), generation, "session established");
                SessionChange::Established { generation, session }
            }
            Err(e) => {
                let current = {
                    let slot = lock(&self.slot);
                    slot.generation == generation
                };
                if !current {
                    debug!(generation, error = %e, "stale connect attempt failed");
                    return SessionChange::Discarded;
                }
                warn!(generation, error = %e, "connect failed");
                self.connectivity.send_replace(Connectivity::Disconnected);
                SessionChange::Failed(e)
            }
        }
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<Arc<T::Session>> {
        lock(&self.slot).session.clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        lock(&self.slot).credential.clone()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.slot).generation
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connectivity.borrow() == Connectivity::Connected
    }

    /// Record that the session of `generation` went away on its own.
    ///
    /// Returns `false` (and does nothing) when a newer credential change has
    /// already superseded that session.
    pub fn mark_disconnected(&self, generation: u64) -> bool {
        let mut slot = lock(&self.slot);
        if slot.generation != generation || slot.session.is_none() {
            return false;
        }
        slot.session = None;
        slot.generation += 1;
        self.connectivity.send_replace(Connectivity::Disconnected);
        warn!(generation, "session lost");
        true
    }
}

/// The slot holds no invariant a panicking holder could break halfway.
fn lock<S>(slot: &Mutex<Slot<S>>) -> std::sync::MutexGuard<'_, Slot<S>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
