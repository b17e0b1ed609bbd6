//! Event reconciler: turns inbound room events into store updates.
//!
//! Every payload is validated into a canonical [`Comment`] before it reaches
//! the store. A payload without a server id is a contract violation: it is
//! rejected and kept in a bounded quarantine for diagnostics instead of being
//! stored under a guessed id.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::protocol::InboundComment;
use crate::store::{SharedStore, UpsertOutcome};

/// Default quarantine size.
pub const DEFAULT_QUARANTINE: usize = 32;

/// A rejected inbound payload.
#[derive(Debug, Clone)]
pub struct Quarantined {
    pub lead_id: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub received_at: DateTime<Utc>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

pub struct Reconciler {
    store: SharedStore,
    quarantine: Mutex<VecDeque<Quarantined>>,
    capacity: usize,
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl Reconciler {
    pub fn new(store: SharedStore) -> Self {
        Self::with_quarantine(store, DEFAULT_QUARANTINE)
    }

    pub fn with_quarantine(store: SharedStore, capacity: usize) -> Self {
        Self {
            store,
            quarantine: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            applied: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Merge one `new_comment` payload received in `lead_id`'s room.
    ///
    /// Redelivery of a known id returns [`UpsertOutcome::Duplicate`] and
    /// leaves the store untouched. Malformed payloads return a
    /// [`SyncError::Protocol`] and are quarantined.
    pub fn on_inbound_event(&self, lead_id: &str, payload: &serde_json::Value) -> Result<UpsertOutcome> {
        let received_at = Utc::now();
        let comment = match InboundComment::parse(payload)
            .and_then(|inbound| inbound.into_comment(lead_id, received_at))
        {
            Ok(comment) => comment,
            Err(e) => {
                self.reject(lead_id, payload, &e);
                return Err(e);
            }
        };

        let comment_id = comment.id.clone();
        let outcome = {
            let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
            store.upsert(lead_id, comment)
        };
        match outcome {
            UpsertOutcome::Inserted | UpsertOutcome::Upgraded => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                debug!(lead_id = %lead_id, comment_id = %comment_id, ?outcome, "inbound comment applied");
            }
            UpsertOutcome::Duplicate => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(lead_id = %lead_id, comment_id = %comment_id, "redelivered comment discarded");
            }
            UpsertOutcome::WrongLead => {
                // into_comment already checked the room, so this is a bug upstream.
                let e = SyncError::protocol(format!("comment '{comment_id}' filed under another lead"));
                self.reject(lead_id, payload, &e);
                return Err(e);
            }
        }
        Ok(outcome)
    }

    /// Record a payload that could not be applied.
    pub fn reject(&self, lead_id: &str, payload: &serde_json::Value, reason: &SyncError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(lead_id = %lead_id, error = %reason, "inbound payload quarantined");
        if self.capacity == 0 {
            return;
        }
        let mut quarantine = self.quarantine.lock().unwrap_or_else(|p| p.into_inner());
        if quarantine.len() == self.capacity {
            quarantine.pop_front();
        }
        quarantine.push_back(Quarantined {
            lead_id: lead_id.to_string(),
            payload: payload.clone(),
            reason: reason.to_string(),
            received_at: Utc::now(),
        });
    }

    /// Rejected payloads, oldest first.
    pub fn quarantined(&self) -> Vec<Quarantined> {
        self.quarantine
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
