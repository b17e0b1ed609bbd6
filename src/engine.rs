//! The UI-facing sync engine.
//!
//! [`SyncEngine`] wires the connection manager, membership tracker,
//! reconciler and store together for one mounted comment view:
//!
//! 1. [`SyncEngine::set_credential`] opens (or replaces, or closes) the
//!    session and starts the inbound pump for it.
//! 2. [`SyncEngine::subscribe`] makes a lead the active one: the previous
//!    lead's room is left, the new room joined, and its comments fetched.
//!    The returned [`RoomGuard`] leaves the room when released or dropped.
//! 3. Inbound `new_comment` frames for joined rooms go through the
//!    reconciler; [`SyncEngine::add_comment`] responses go straight into the
//!    store. Both paths deduplicate by comment id.
//!
//! Responses for a lead that is no longer active are discarded. A fetch
//! merges with whatever arrived live while it was in flight instead of
//! overwriting it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::comment::Comment;
use crate::config::SyncConfig;
use crate::connection::{Connectivity, ConnectionManager, Credential, SessionChange};
use crate::error::{Result, SyncError};
use crate::graphql::CommentApi;
use crate::membership::{MembershipState, MembershipTracker};
use crate::protocol::{Frame, NEW_COMMENT};
use crate::reconciler::{Quarantined, Reconciler, ReconcilerStats};
use crate::store::{new_shared_store, SharedStore, UpsertOutcome};
use crate::transport::{Session, Transport};

const NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// A toast-style message for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveLead {
    lead_id: String,
    ticket: u64,
}

#[derive(Debug, Default)]
struct ViewState {
    active: Option<ActiveLead>,
    next_ticket: u64,
}

pub struct SyncEngine<T: Transport, A: CommentApi> {
    /// Handle to ourselves for tasks spawned from `&self` methods.
    me: Weak<Self>,
    config: SyncConfig,
    connection: Arc<ConnectionManager<T>>,
    membership: Arc<MembershipTracker<T>>,
    reconciler: Arc<Reconciler>,
    store: SharedStore,
    api: A,
    view: Mutex<ViewState>,
    notices: broadcast::Sender<Notice>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport, A: CommentApi> SyncEngine<T, A> {
    pub fn new(config: SyncConfig, transport: T, api: A) -> Arc<Self> {
        let store = new_shared_store();
        let connection = Arc::new(ConnectionManager::new(transport));
        let membership = Arc::new(MembershipTracker::new(Arc::clone(&connection)));
        let reconciler = Arc::new(Reconciler::with_quarantine(
            store.clone(),
            config.quarantine_capacity,
        ));
        let (notices, _rx) = broadcast::channel(NOTICE_BUFFER);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            connection,
            membership,
            reconciler,
            store,
            api,
            view: Mutex::new(ViewState::default()),
            notices,
            pump: Mutex::new(None),
        })
    }

    fn view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut crate::store::CommentStore) -> R) -> R {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut store)
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        // Nobody listening is fine.
        let _ = self.notices.send(Notice::new(level, message));
    }

    // -- session -------------------------------------------------------------

    /// Log in, switch accounts, or log out (`None`).
    ///
    /// A new session voids every room membership; views must subscribe
    /// again. Queued joins are sent once the session is up.
    pub async fn set_credential(&self, credential: Option<Credential>) {
        let change = self.connection.set_credential(credential).await;
        match change {
            SessionChange::Unchanged | SessionChange::Discarded => {}
            SessionChange::Established {
                generation,
                session,
            } => {
                self.membership.reset_all();
                self.start_pump(generation, &session);
                self.with_store(|s| s.set_error(None));
                let flushed = self.membership.flush_pending().await;
                if flushed > 0 {
                    debug!(rooms = flushed, "queued joins sent");
                }
            }
            SessionChange::TornDown { had_session } => {
                self.stop_pump();
                let reset = self.membership.reset_all();
                if had_session {
                    info!(rooms = reset.len(), "logged out, session closed");
                }
            }
            SessionChange::Failed(e) => {
                self.stop_pump();
                self.membership.reset_all();
                self.with_store(|s| s.set_error(Some(e.to_string())));
                self.notify(NoticeLevel::Error, e.to_string());
            }
        }
    }

    fn start_pump(&self, generation: u64, session: &Arc<T::Session>) {
        let rx = session.subscribe();
        let handle = tokio::spawn(pump(
            generation,
            rx,
            self.me.clone(),
            Arc::clone(&self.connection),
            Arc::clone(&self.membership),
            Arc::clone(&self.reconciler),
            self.notices.clone(),
        ));
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_pump(&self) {
        let previous = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    // -- rooms ---------------------------------------------------------------

    /// Make `lead_id` the active lead: leave the previous room, join this
    /// one and load its comments.
    ///
    /// Never fails. Fetch problems land in [`SyncEngine::error`] and the
    /// notice channel.
    pub async fn subscribe(self: &Arc<Self>, lead_id: &str) -> RoomGuard<T, A> {
        let (previous, ticket) = {
            let mut view = self.view();
            view.next_ticket += 1;
            let ticket = view.next_ticket;
            let previous = view.active.replace(ActiveLead {
                lead_id: lead_id.to_string(),
                ticket,
            });
            (previous, ticket)
        };

        if let Some(previous) = previous.filter(|p| p.lead_id != lead_id) {
            self.membership.leave(&previous.lead_id).await;
            self.with_store(|s| s.forget(&previous.lead_id));
        }
        let state = self.membership.join(lead_id).await;
        debug!(lead_id = %lead_id, ?state, "subscribed");

        if let Err(e) = self.refresh(lead_id).await {
            if e.is_user_visible() {
                self.notify(NoticeLevel::Error, e.to_string());
            }
        }

        RoomGuard {
            engine: Arc::clone(self),
            lead_id: lead_id.to_string(),
            ticket,
            released: false,
        }
    }

    /// Leave `lead_id`'s room and drop its comments; if it was the active
    /// lead, no lead is active afterwards.
    pub async fn unsubscribe(&self, lead_id: &str) {
        {
            let mut view = self.view();
            if view.active.as_ref().is_some_and(|a| a.lead_id == lead_id) {
                view.active = None;
            }
        }
        self.membership.leave(lead_id).await;
        self.with_store(|s| s.forget(lead_id));
    }

    async fn release_ticket(&self, lead_id: &str, ticket: u64) {
        let owned = {
            let mut view = self.view();
            let owned = view
                .active
                .as_ref()
                .is_some_and(|a| a.lead_id == lead_id && a.ticket == ticket);
            if owned {
                view.active = None;
            }
            owned
        };
        // A superseded guard's room was already left by the newer subscribe.
        if owned {
            self.membership.leave(lead_id).await;
            self.with_store(|s| s.forget(lead_id));
        }
    }

    pub fn active_lead(&self) -> Option<String> {
        self.view().active.as_ref().map(|a| a.lead_id.clone())
    }

    fn is_active(&self, lead_id: &str) -> bool {
        self.view().active.as_ref().is_some_and(|a| a.lead_id == lead_id)
    }

    /// Fetch `lead_id`'s comments and replace the stored set.
    ///
    /// Comments that arrived over the room while the request was in flight
    /// are kept even when the fetched snapshot predates them. A response
    /// that arrives after the view moved to another lead is discarded and
    /// reported as [`SyncError::StaleResponse`].
    pub async fn refresh(&self, lead_id: &str) -> Result<usize> {
        let credential = self.require_credential()?;
        let mark = self.with_store(|s| {
            s.set_loading(true);
            s.arrival_mark()
        });
        let result = self.api.fetch_comments(&credential, lead_id).await;

        if !self.is_active(lead_id) {
            let active = self.active_lead();
            if active.is_none() {
                self.with_store(|s| s.set_loading(false));
            }
            let expected = active.unwrap_or_else(|| "<none>".to_string());
            debug!(expected = %expected, received = %lead_id, "stale fetch response discarded");
            return Err(SyncError::StaleResponse {
                expected,
                received: lead_id.to_string(),
            });
        }

        match result {
            Ok(comments) => {
                let count = comments.len();
                let carried = self.with_store(|s| {
                    let carried = s.merge_fetched(lead_id, comments, mark);
                    s.set_error(None);
                    s.set_loading(false);
                    carried
                });
                if carried > 0 {
                    debug!(lead_id = %lead_id, carried, "kept live comments missing from fetched snapshot");
                }
                Ok(count)
            }
            Err(e) => {
                warn!(lead_id = %lead_id, error = %e, "fetching comments failed");
                self.with_store(|s| {
                    s.set_error(Some(e.to_string()));
                    s.set_loading(false);
                });
                Err(e)
            }
        }
    }

    /// The inbound channel overflowed: flag the list as incomplete and
    /// reload the active lead in the background.
    fn recover_from_lag(&self, skipped: u64) {
        let Some(lead_id) = self.active_lead() else {
            return;
        };
        self.with_store(|s| {
            s.set_error(Some(format!("missed {skipped} live updates; reloading comments")))
        });
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = engine.refresh(&lead_id).await {
                debug!(lead_id = %lead_id, error = %e, "reload after lag failed");
            }
        });
    }

    fn require_credential(&self) -> Result<Credential> {
        match self.connection.credential() {
            Some(credential) => Ok(credential),
            None => {
                let e = SyncError::NoCredential;
                self.with_store(|s| s.set_error(Some(e.to_string())));
                Err(e)
            }
        }
    }

    // -- comments ------------------------------------------------------------

    /// Create a comment through the API.
    ///
    /// The confirmed comment is stored when `lead_id` is still active and,
    /// if configured, relayed to the room so other participants receive it
    /// with its server id.
    pub async fn add_comment(&self, lead_id: &str, content: &str) -> Result<Comment> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidInput("comment content is empty".into()));
        }
        let credential = self.require_credential()?;

        self.with_store(|s| s.set_loading(true));
        let result = self.api.add_comment(&credential, lead_id, content).await;
        self.with_store(|s| s.set_loading(false));

        let comment = match result {
            Ok(comment) => comment,
            Err(e) => {
                warn!(lead_id = %lead_id, error = %e, "adding comment failed");
                self.with_store(|s| s.set_error(Some(e.to_string())));
                self.notify(NoticeLevel::Error, e.to_string());
                return Err(e);
            }
        };

        if self.is_active(lead_id) {
            let outcome = self.with_store(|s| s.upsert(lead_id, comment.clone()));
            if outcome == UpsertOutcome::WrongLead {
                warn!(lead_id = %lead_id, comment_lead = %comment.lead_id, "server filed comment under another lead");
            }
        } else {
            debug!(lead_id = %lead_id, comment_id = %comment.id, "comment confirmed for inactive lead, not stored");
        }
        self.notify(NoticeLevel::Success, "Comment added");

        if self.config.broadcast_own_comments && self.membership.is_joined(lead_id) {
            if let Some(session) = self.connection.session() {
                if let Err(e) = session.emit(Frame::add_comment(&comment)).await {
                    warn!(lead_id = %lead_id, error = %e, "relaying comment to room failed");
                }
            }
        }
        Ok(comment)
    }

    /// Ordered comments for `lead_id`.
    pub fn comments(&self, lead_id: &str) -> Vec<Comment> {
        self.with_store(|s| s.comments(lead_id))
    }

    // -- observation ---------------------------------------------------------

    pub fn is_loading(&self) -> bool {
        self.with_store(|s| s.is_loading())
    }

    pub fn error(&self) -> Option<String> {
        self.with_store(|s| s.error().map(str::to_string))
    }

    /// Store revision; changes whenever comments or flags change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.with_store(|s| s.changes())
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connection.connectivity()
    }

    pub fn membership_state(&self, lead_id: &str) -> MembershipState {
        self.membership.state(lead_id)
    }

    pub fn reconciler_stats(&self) -> ReconcilerStats {
        self.reconciler.stats()
    }

    pub fn quarantined(&self) -> Vec<Quarantined> {
        self.reconciler.quarantined()
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl<T: Transport, A: CommentApi> Drop for SyncEngine<T, A> {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// Reads one session's inbound frames until it closes.
async fn pump<T: Transport, A: CommentApi>(
    generation: u64,
    mut rx: broadcast::Receiver<Frame>,
    engine: Weak<SyncEngine<T, A>>,
    connection: Arc<ConnectionManager<T>>,
    membership: Arc<MembershipTracker<T>>,
    reconciler: Arc<Reconciler>,
    notices: broadcast::Sender<Notice>,
) {
    loop {
        let frame = match rx.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(generation, skipped, "inbound frames lagged; reloading active lead");
                if let Some(engine) = engine.upgrade() {
                    engine.recover_from_lag(skipped);
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if connection.generation() != generation {
            break;
        }
        if frame.event != NEW_COMMENT {
            debug!(event = %frame.event, "ignoring inbound frame");
            continue;
        }
        let Some(lead_id) = frame.lead_id() else {
            reconciler.reject("", &frame.data, &SyncError::protocol("new_comment without lead_id"));
            continue;
        };
        if !membership.is_joined(&lead_id) {
            debug!(lead_id = %lead_id, "comment for a room we are not in");
            continue;
        }
        if let Ok(outcome) = reconciler.on_inbound_event(&lead_id, &frame.data) {
            if outcome.changed() {
                let _ = notices.send(Notice::new(NoticeLevel::Info, "New comment added in real-time"));
            }
        }
    }

    if connection.mark_disconnected(generation) {
        membership.reset_all();
    }
    debug!(generation, "inbound pump stopped");
}

/// Disposable room subscription returned by [`SyncEngine::subscribe`].
///
/// Call [`RoomGuard::release`] to leave explicitly. Dropping an unreleased
/// guard schedules the leave on the current tokio runtime.
pub struct RoomGuard<T: Transport, A: CommentApi> {
    engine: Arc<SyncEngine<T, A>>,
    lead_id: String,
    ticket: u64,
    released: bool,
}

impl<T: Transport, A: CommentApi> RoomGuard<T, A> {
    pub fn lead_id(&self) -> &str {
        &self.lead_id
    }

    pub async fn release(mut self) {
        self.released = true;
        self.engine.release_ticket(&self.lead_id, self.ticket).await;
    }
}

impl<T: Transport, A: CommentApi> Drop for RoomGuard<T, A> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lead_id = %self.lead_id, "room guard dropped outside a runtime; leave skipped");
            return;
        };
        let engine = Arc::clone(&self.engine);
        let lead_id = std::mem::take(&mut self.lead_id);
        let ticket = self.ticket;
        handle.spawn(async move {
            engine.release_ticket(&lead_id, ticket).await;
        });
    }
}
