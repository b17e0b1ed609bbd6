//! Local state store: the authoritative per-lead comment lists.
//!
//! ## Guarantees
//! - A comment id appears at most once per lead, whatever path delivered it
//! - Each list is kept in display order (`created_at`, then `id`)
//! - A fetched snapshot never erases comments that arrived while the fetch was in flight
//! - Every change bumps a revision counter observable through [`CommentStore::changes`]
//!
//! ## NOT Responsible For
//! - Deciding whether a response is stale (the engine checks the active lead first)
//! - Validating wire payloads (that is the reconciler)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::comment::{display_order, Comment};

/// Shared store handle: one per engine, injected into the reconciler.
pub type SharedStore = Arc<Mutex<CommentStore>>;

/// Create a new empty SharedStore.
pub fn new_shared_store() -> SharedStore {
    Arc::new(Mutex::new(CommentStore::new()))
}

/// What [`CommentStore::upsert`] did with a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New id, inserted at its ordered position.
    Inserted,
    /// Replaced a provisional entry with the confirmed record.
    Upgraded,
    /// Id already present; discarded.
    Duplicate,
    /// The comment belongs to a different lead; discarded.
    WrongLead,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Upgraded)
    }
}

/// Position in the store's upsert sequence, taken before a fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArrivalMark(u64);

#[derive(Debug, Default)]
struct Thread {
    comments: Vec<Comment>,
    /// Sequence number of the upsert that last changed each id. Cleared by
    /// snapshots; only ids newer than the oldest in-flight fetch matter.
    arrivals: HashMap<String, u64>,
}

/// Per-lead comment lists plus the UI status flags.
#[derive(Debug)]
pub struct CommentStore {
    threads: HashMap<String, Thread>,
    sequence: u64,
    loading: bool,
    error: Option<String>,
    revision: watch::Sender<u64>,
}

impl Default for CommentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommentStore {
    pub fn new() -> Self {
        let (revision, _rx) = watch::channel(0);
        Self {
            threads: HashMap::new(),
            sequence: 0,
            loading: false,
            error: None,
            revision,
        }
    }

    /// Replace the whole working set for `lead_id` with fetched data.
    ///
    /// Duplicate ids in the input collapse to one entry (a confirmed record
    /// wins over a provisional one); comments filed under another lead are
    /// dropped.
    pub fn replace_all(&mut self, lead_id: &str, comments: Vec<Comment>) {
        let list = snapshot(lead_id, comments);
        self.threads.insert(
            lead_id.to_string(),
            Thread {
                comments: list,
                arrivals: HashMap::new(),
            },
        );
        self.bump();
    }

    /// Mark the current point in the upsert sequence. Pass it to
    /// [`CommentStore::merge_fetched`] once the fetch resolves.
    pub fn arrival_mark(&self) -> ArrivalMark {
        ArrivalMark(self.sequence)
    }

    /// Replace `lead_id`'s set with a fetched snapshot, keeping every
    /// comment upserted after `since`.
    ///
    /// The snapshot was taken server-side somewhere between `since` and now,
    /// so anything that arrived live in that window may be missing from it.
    /// Returns how many such comments were carried over.
    pub fn merge_fetched(&mut self, lead_id: &str, fetched: Vec<Comment>, since: ArrivalMark) -> usize {
        let previous = self.threads.remove(lead_id).unwrap_or_default();
        let mut list = snapshot(lead_id, fetched);
        let mut arrivals = HashMap::new();
        let mut carried = 0;

        for comment in previous.comments {
            let Some(&seq) = previous.arrivals.get(&comment.id) else {
                continue;
            };
            if seq <= since.0 {
                continue;
            }
            arrivals.insert(comment.id.clone(), seq);
            match list.iter().position(|c| c.id == comment.id) {
                Some(idx) if list[idx].provisional && !comment.provisional => {
                    list.remove(idx);
                    insert_ordered(&mut list, comment);
                }
                Some(_) => {}
                None => {
                    insert_ordered(&mut list, comment);
                    carried += 1;
                }
            }
        }

        self.threads.insert(
            lead_id.to_string(),
            Thread {
                comments: list,
                arrivals,
            },
        );
        self.bump();
        carried
    }

    /// Insert `comment` unless its id is already present.
    pub fn upsert(&mut self, lead_id: &str, comment: Comment) -> UpsertOutcome {
        if comment.lead_id != lead_id {
            return UpsertOutcome::WrongLead;
        }
        let thread = self.threads.entry(lead_id.to_string()).or_default();
        let list = &mut thread.comments;
        let id = comment.id.clone();

        let outcome = match list.iter().position(|c| c.id == comment.id) {
            Some(idx) if list[idx].provisional && !comment.provisional => {
                list.remove(idx);
                insert_ordered(list, comment);
                UpsertOutcome::Upgraded
            }
            Some(_) => UpsertOutcome::Duplicate,
            None => {
                insert_ordered(list, comment);
                UpsertOutcome::Inserted
            }
        };
        if outcome.changed() {
            self.sequence += 1;
            thread.arrivals.insert(id, self.sequence);
            self.bump();
        }
        outcome
    }

    /// Drop everything held for `lead_id`. Used when its view goes away.
    pub fn forget(&mut self, lead_id: &str) -> bool {
        let existed = self.threads.remove(lead_id).is_some();
        if existed {
            self.bump();
        }
        existed
    }

    /// Ordered snapshot of the comments for `lead_id`.
    pub fn comments(&self, lead_id: &str) -> Vec<Comment> {
        self.threads
            .get(lead_id)
            .map(|t| t.comments.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, lead_id: &str) -> usize {
        self.threads.get(lead_id).map_or(0, |t| t.comments.len())
    }

    pub fn is_empty(&self, lead_id: &str) -> bool {
        self.len(lead_id) == 0
    }

    /// Number of leads with a thread in memory.
    pub fn lead_count(&self) -> usize {
        self.threads.len()
    }

    pub fn contains(&self, lead_id: &str, comment_id: &str) -> bool {
        self.threads
            .get(lead_id)
            .is_some_and(|t| t.comments.iter().any(|c| c.id == comment_id))
    }

    pub fn set_loading(&mut self, loading: bool) {
        if self.loading != loading {
            self.loading = loading;
            self.bump();
        }
    }

    /// Set or clear the error message. Existing comments stay visible.
    pub fn set_error(&mut self, message: Option<String>) {
        if self.error != message {
            self.error = message;
            self.bump();
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Revision counter; changes on every mutation.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }
}

/// Dedup and order a fetched list, dropping comments for other leads.
fn snapshot(lead_id: &str, comments: Vec<Comment>) -> Vec<Comment> {
    let mut list: Vec<Comment> = Vec::with_capacity(comments.len());
    for comment in comments.into_iter().filter(|c| c.lead_id == lead_id) {
        match list.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) if existing.provisional && !comment.provisional => *existing = comment,
            Some(_) => {}
            None => list.push(comment),
        }
    }
    list.sort_by(display_order);
    list
}

fn insert_ordered(list: &mut Vec<Comment>, comment: Comment) {
    let pos = list.partition_point(|c| display_order(c, &comment).is_lt());
    list.insert(pos, comment);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Ids present more than once in `comments`.
    fn duplicate_ids(comments: &[Comment]) -> Vec<String> {
        let mut seen = HashSet::new();
        comments
            .iter()
            .filter(|c| !seen.insert(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_000_000 + secs, 0).unwrap()
    }

    fn comment(id: &str, lead: &str, secs: i64) -> Comment {
        Comment::new(id, lead, Some("u1".into()), format!("content {id}"), at(secs))
    }

    // -- upsert --------------------------------------------------------------

    #[test]
    fn test_upsert_inserts_new_id() {
        let mut store = CommentStore::new();
        assert_eq!(store.upsert("lead-1", comment("c1", "lead-1", 0)), UpsertOutcome::Inserted);
        assert_eq!(store.len("lead-1"), 1);
    }

    #[test]
    fn test_upsert_same_id_twice_is_duplicate() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("c1", "lead-1", 0));
        let outcome = store.upsert("lead-1", comment("c1", "lead-1", 5));
        assert_eq!(outcome, UpsertOutcome::Duplicate);
        assert_eq!(store.len("lead-1"), 1);
    }

    #[test]
    fn test_upsert_wrong_lead_is_discarded() {
        let mut store = CommentStore::new();
        let outcome = store.upsert("lead-1", comment("c1", "lead-2", 0));
        assert_eq!(outcome, UpsertOutcome::WrongLead);
        assert!(store.is_empty("lead-1"));
        assert!(store.is_empty("lead-2"));
    }

    #[test]
    fn test_upsert_keeps_display_order() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("c3", "lead-1", 30));
        store.upsert("lead-1", comment("c1", "lead-1", 10));
        store.upsert("lead-1", comment("c2", "lead-1", 20));
        let ids: Vec<String> = store.comments("lead-1").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_upsert_timestamp_tie_broken_by_id() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("b", "lead-1", 10));
        store.upsert("lead-1", comment("a", "lead-1", 10));
        let ids: Vec<String> = store.comments("lead-1").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_upsert_confirmed_upgrades_provisional() {
        let mut store = CommentStore::new();
        let mut provisional = comment("c1", "lead-1", 99);
        provisional.provisional = true;
        provisional.user_id = None;
        store.upsert("lead-1", provisional);

        let confirmed = comment("c1", "lead-1", 1);
        assert_eq!(store.upsert("lead-1", confirmed.clone()), UpsertOutcome::Upgraded);
        let list = store.comments("lead-1");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0], confirmed);
    }

    #[test]
    fn test_upsert_provisional_never_downgrades_confirmed() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("c1", "lead-1", 1));
        let mut provisional = comment("c1", "lead-1", 50);
        provisional.provisional = true;
        assert_eq!(store.upsert("lead-1", provisional), UpsertOutcome::Duplicate);
        assert!(!store.comments("lead-1")[0].provisional);
    }

    #[test]
    fn test_same_content_different_ids_both_kept() {
        let mut store = CommentStore::new();
        let mut a = comment("c1", "lead-1", 0);
        let mut b = comment("c2", "lead-1", 0);
        a.content = "same".into();
        b.content = "same".into();
        store.upsert("lead-1", a);
        store.upsert("lead-1", b);
        assert_eq!(store.len("lead-1"), 2);
    }

    // -- replace_all ---------------------------------------------------------

    #[test]
    fn test_replace_all_overwrites_previous_set() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("old", "lead-1", 0));
        store.replace_all("lead-1", vec![comment("c2", "lead-1", 2), comment("c1", "lead-1", 1)]);
        let ids: Vec<String> = store.comments("lead-1").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_replace_all_collapses_duplicate_ids() {
        let mut store = CommentStore::new();
        store.replace_all("lead-1", vec![comment("c1", "lead-1", 1), comment("c1", "lead-1", 1)]);
        assert_eq!(store.len("lead-1"), 1);
    }

    #[test]
    fn test_replace_all_leaves_other_leads_alone() {
        let mut store = CommentStore::new();
        store.upsert("lead-2", comment("x", "lead-2", 0));
        store.replace_all("lead-1", vec![comment("c1", "lead-1", 1)]);
        assert_eq!(store.len("lead-2"), 1);
    }

    #[test]
    fn test_replace_all_filters_foreign_lead() {
        let mut store = CommentStore::new();
        store.replace_all("lead-1", vec![comment("c1", "lead-1", 1), comment("c2", "lead-9", 1)]);
        assert_eq!(store.len("lead-1"), 1);
        assert!(store.contains("lead-1", "c1"));
    }

    // -- merge_fetched -------------------------------------------------------

    #[test]
    fn test_merge_fetched_keeps_comment_that_arrived_during_fetch() {
        let mut store = CommentStore::new();
        let mark = store.arrival_mark();
        store.upsert("lead-1", comment("live", "lead-1", 5));

        let carried = store.merge_fetched("lead-1", vec![comment("a", "lead-1", 1)], mark);
        assert_eq!(carried, 1);
        let ids: Vec<String> = store.comments("lead-1").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "live"]);
    }

    #[test]
    fn test_merge_fetched_drops_comments_older_than_mark() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("gone", "lead-1", 0));
        let mark = store.arrival_mark();

        store.merge_fetched("lead-1", vec![comment("a", "lead-1", 1)], mark);
        assert!(!store.contains("lead-1", "gone"));
        assert_eq!(store.len("lead-1"), 1);
    }

    #[test]
    fn test_merge_fetched_snapshot_containing_live_id_keeps_one() {
        let mut store = CommentStore::new();
        let mark = store.arrival_mark();
        store.upsert("lead-1", comment("c1", "lead-1", 1));

        let carried = store.merge_fetched("lead-1", vec![comment("c1", "lead-1", 1)], mark);
        assert_eq!(carried, 0);
        assert_eq!(store.len("lead-1"), 1);
    }

    #[test]
    fn test_merge_fetched_confirmed_snapshot_upgrades_live_provisional() {
        let mut store = CommentStore::new();
        let mark = store.arrival_mark();
        let mut provisional = comment("c1", "lead-1", 40);
        provisional.provisional = true;
        store.upsert("lead-1", provisional);

        store.merge_fetched("lead-1", vec![comment("c1", "lead-1", 1)], mark);
        let list = store.comments("lead-1");
        assert_eq!(list.len(), 1);
        assert!(!list[0].provisional);
    }

    #[test]
    fn test_overlapping_fetches_both_keep_live_comment() {
        let mut store = CommentStore::new();
        let first = store.arrival_mark();
        let second = store.arrival_mark();
        store.upsert("lead-1", comment("live", "lead-1", 9));

        store.merge_fetched("lead-1", vec![], first);
        store.merge_fetched("lead-1", vec![], second);
        assert!(store.contains("lead-1", "live"));
    }

    // -- forget --------------------------------------------------------------

    #[test]
    fn test_forget_drops_thread() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("c1", "lead-1", 0));
        store.upsert("lead-2", comment("c2", "lead-2", 0));
        assert!(store.forget("lead-1"));
        assert!(!store.forget("lead-1"));
        assert!(store.is_empty("lead-1"));
        assert_eq!(store.lead_count(), 1);
    }

    // -- flags ---------------------------------------------------------------

    #[test]
    fn test_set_error_keeps_existing_comments() {
        let mut store = CommentStore::new();
        store.upsert("lead-1", comment("c1", "lead-1", 0));
        store.set_error(Some("network down".into()));
        assert_eq!(store.error(), Some("network down"));
        assert_eq!(store.len("lead-1"), 1);
    }

    #[test]
    fn test_set_loading_toggles() {
        let mut store = CommentStore::new();
        assert!(!store.is_loading());
        store.set_loading(true);
        assert!(store.is_loading());
        store.set_loading(false);
        assert!(!store.is_loading());
    }

    // -- change signal -------------------------------------------------------

    #[test]
    fn test_revision_bumps_on_insert_only() {
        let mut store = CommentStore::new();
        let rx = store.changes();
        store.upsert("lead-1", comment("c1", "lead-1", 0));
        let after_insert = *rx.borrow();
        store.upsert("lead-1", comment("c1", "lead-1", 0));
        assert_eq!(*rx.borrow(), after_insert, "duplicate must not signal a change");
        assert!(after_insert > 0);
    }

    #[test]
    fn test_unchanged_flag_does_not_bump() {
        let mut store = CommentStore::new();
        store.set_error(None);
        store.set_loading(false);
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_shared_store_starts_empty() {
        let shared = new_shared_store();
        let guard = shared.lock().unwrap();
        assert!(guard.is_empty("anything"));
        assert!(guard.error().is_none());
    }

    // -- properties ----------------------------------------------------------

    proptest! {
        #[test]
        fn prop_upsert_never_duplicates_ids(ops in prop::collection::vec((0u8..8, 0i64..50, any::<bool>()), 0..64)) {
            let mut store = CommentStore::new();
            for (id, secs, provisional) in ops {
                let mut c = comment(&format!("c{id}"), "lead-1", secs);
                c.provisional = provisional;
                store.upsert("lead-1", c);
            }
            let list = store.comments("lead-1");
            prop_assert!(duplicate_ids(&list).is_empty());
        }

        #[test]
        fn prop_list_is_in_display_order(ops in prop::collection::vec((0u16..500, 0i64..20), 0..64)) {
            let mut store = CommentStore::new();
            for (id, secs) in ops {
                store.upsert("lead-1", comment(&format!("c{id}"), "lead-1", secs));
            }
            let list = store.comments("lead-1");
            for pair in list.windows(2) {
                prop_assert!(display_order(&pair[0], &pair[1]).is_le());
            }
        }

        #[test]
        fn prop_final_set_independent_of_arrival_order(ids in prop::collection::vec(0u8..16, 1..24)) {
            let mut forward = CommentStore::new();
            let mut backward = CommentStore::new();
            for id in &ids {
                forward.upsert("lead-1", comment(&format!("c{id}"), "lead-1", i64::from(*id)));
            }
            for id in ids.iter().rev() {
                backward.upsert("lead-1", comment(&format!("c{id}"), "lead-1", i64::from(*id)));
            }
            prop_assert_eq!(forward.comments("lead-1"), backward.comments("lead-1"));
        }
    }
}
