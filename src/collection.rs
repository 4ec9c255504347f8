//! Collection (§4.8): a synced, queryable base table. The query compiler
//! treats every `CollectionRef` in a query's `from`/`join` list as a named
//! instance of this type; a [`crate::live_query::LiveQueryCollection`] reads
//! its current state and subscribes to its change stream the same way any
//! other subscriber would.
//!
//! The sync lifecycle (`idle -> loading -> ready -> error | cleaned_up`)
//! and the `begin`/`write`/`commit` session shape mirror how
//! `differential-dataflow::input::InputSession` stages updates before
//! `flush`, generalized here to carry application-facing insert/update/
//! delete messages instead of `(data, time, diff)` triples, since this
//! collection has no explicit logical time (§5).

use crate::change::ChangeMessage;
use crate::error::D2Error;
use crate::row::{GetKey, Key, Row};
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Loading,
    Ready,
    Error,
    CleanedUp,
}

pub type ChangeListener = Arc<dyn Fn(&[ChangeMessage]) + Send + Sync>;

/// Optional hooks a collection calls after an application-driven
/// `insert`/`update`/`delete` (as opposed to a change arriving via a sync
/// session) — the seam through which a caller wires up persistence (§4.8).
#[derive(Clone, Default)]
pub struct SyncHandlers {
    pub on_insert: Option<Arc<dyn Fn(&Key, &Row) + Send + Sync>>,
    pub on_update: Option<Arc<dyn Fn(&Key, &Row, &Row) + Send + Sync>>,
    pub on_delete: Option<Arc<dyn Fn(&Key, &Row) + Send + Sync>>,
}

pub struct CollectionOptions {
    pub id: Option<String>,
    pub get_key: GetKey,
    pub schema: Option<String>,
    pub start_sync: bool,
    pub gc_time_ms: Option<u64>,
    pub handlers: SyncHandlers,
}

impl CollectionOptions {
    pub fn new(get_key: GetKey) -> Self {
        CollectionOptions { id: None, get_key, schema: None, start_sync: true, gc_time_ms: None, handlers: SyncHandlers::default() }
    }
}

struct SyncSession {
    pending: Vec<ChangeMessage>,
}

struct CollectionState {
    rows: FnvHashMap<Key, Row>,
    status: SyncStatus,
    session: Option<SyncSession>,
    /// Set for the duration of `commit`'s `notify` call, so a listener that
    /// re-enters with `begin_sync` is rejected even though the session that
    /// triggered the commit has already been taken out of `session` (§4.8).
    committing: bool,
    listeners: Vec<(u64, ChangeListener)>,
}

static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A synced base collection (§3, §4.8). Cheap to clone via `Arc` since every
/// accessor takes `&self` and locks its own interior state.
pub struct Collection {
    id: String,
    get_key: GetKey,
    schema: Option<String>,
    handlers: SyncHandlers,
    state: Mutex<CollectionState>,
    next_listener_id: AtomicU64,
    /// Recorded for callers that implement their own idle-eviction sweep;
    /// this crate does not run a background GC timer (§5, single-threaded
    /// and synchronous end to end).
    pub gc_time_ms: Option<u64>,
}

impl Collection {
    pub fn new(options: CollectionOptions) -> Arc<Collection> {
        let id = options.id.unwrap_or_else(|| format!("collection-{}", NEXT_COLLECTION_ID.fetch_add(1, AtomicOrdering::Relaxed)));
        Arc::new(Collection {
            id,
            get_key: options.get_key,
            schema: options.schema,
            handlers: options.handlers,
            state: Mutex::new(CollectionState { rows: FnvHashMap::default(), status: SyncStatus::Idle, session: None, committing: false, listeners: Vec::new() }),
            next_listener_id: AtomicU64::new(1),
            gc_time_ms: options.gc_time_ms,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn get_key_fn(&self) -> GetKey {
        self.get_key.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.state.lock().unwrap().status
    }

    pub fn get(&self, key: &Key) -> Option<Row> {
        self.state.lock().unwrap().rows.get(key).cloned()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.state.lock().unwrap().rows.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    pub fn entries(&self) -> Vec<(Key, Row)> {
        self.state.lock().unwrap().rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// The collection's entire current state expressed as a batch of
    /// `Insert` messages, used by [`crate::live_query::LiveQueryCollection::preload`]
    /// to seed a newly compiled graph with data that arrived before it
    /// existed (§4.9).
    pub fn current_state_as_changes(&self) -> Vec<ChangeMessage> {
        self.state
            .lock()
            .unwrap()
            .rows
            .iter()
            .map(|(k, v)| ChangeMessage::Insert { key: k.clone(), value: v.clone() })
            .collect()
    }

    pub fn subscribe_changes(&self, listener: ChangeListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.state.lock().unwrap().listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&self, listener_id: u64) {
        self.state.lock().unwrap().listeners.retain(|(id, _)| *id != listener_id);
    }

    fn notify(&self, changes: &[ChangeMessage]) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.state.lock().unwrap().listeners.clone();
        for (_, listener) in listeners {
            listener(changes);
        }
    }

    /// Opens a sync session. Fails with [`D2Error::NestedSyncSession`] if a
    /// session from an earlier `begin` is still open, or if a `commit`'s
    /// listener notification is in progress, re-entering from a listener
    /// callback (§4.8, §7).
    pub fn begin_sync(&self) -> Result<(), D2Error> {
        let mut state = self.state.lock().unwrap();
        if state.session.is_some() || state.committing {
            return Err(D2Error::NestedSyncSession(Some(self.id.clone())));
        }
        if state.status == SyncStatus::Idle {
            state.status = SyncStatus::Loading;
        }
        state.session = Some(SyncSession { pending: Vec::new() });
        Ok(())
    }

    /// Stages changes within the open session; nothing is visible to
    /// readers or subscribers until `commit`.
    pub fn write(&self, changes: impl IntoIterator<Item = ChangeMessage>) -> Result<(), D2Error> {
        let mut state = self.state.lock().unwrap();
        let session = state.session.as_mut().ok_or_else(|| D2Error::NestedSyncSession(None))?;
        session.pending.extend(changes);
        Ok(())
    }

    /// Applies every change staged since `begin_sync`, updates the
    /// snapshot, and notifies subscribers with exactly the batch that was
    /// staged (§4.8).
    pub fn commit(&self) -> Result<Vec<ChangeMessage>, D2Error> {
        let applied = {
            let mut state = self.state.lock().unwrap();
            let session = state.session.take().ok_or_else(|| D2Error::NestedSyncSession(None))?;
            for change in &session.pending {
                match change {
                    ChangeMessage::Insert { key, value } | ChangeMessage::Update { key, value, .. } => {
                        state.rows.insert(key.clone(), value.clone());
                    }
                    ChangeMessage::Delete { key, .. } => {
                        state.rows.remove(key);
                    }
                }
            }
            state.committing = true;
            session.pending
        };
        self.notify(&applied);
        self.state.lock().unwrap().committing = false;
        Ok(applied)
    }

    /// Marks the collection ready without an accompanying commit — used
    /// when a sync source reports "caught up" with nothing to apply.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status != SyncStatus::CleanedUp {
            state.status = SyncStatus::Ready;
        }
    }

    pub fn mark_error(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = SyncStatus::Error;
    }

    /// Ends this collection's lifecycle: clears its snapshot and listener
    /// list and marks it `cleaned_up` (§4.8's GC-time teardown path).
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        state.rows.clear();
        state.listeners.clear();
        state.session = None;
        state.status = SyncStatus::CleanedUp;
    }

    /// Application-driven optimistic insert, independent of any sync
    /// session: updates the snapshot immediately, notifies subscribers, and
    /// invokes `on_insert` if one was configured (§4.8).
    pub fn insert(&self, row: Row) -> Key {
        let key = (self.get_key)(&row);
        self.state.lock().unwrap().rows.insert(key.clone(), row.clone());
        self.notify(&[ChangeMessage::Insert { key: key.clone(), value: row.clone() }]);
        if let Some(on_insert) = &self.handlers.on_insert {
            on_insert(&key, &row);
        }
        key
    }

    pub fn update(&self, key: Key, row: Row) -> Option<Row> {
        let previous = {
            let mut state = self.state.lock().unwrap();
            state.rows.insert(key.clone(), row.clone())
        };
        if let Some(previous) = &previous {
            self.notify(&[ChangeMessage::Update { key: key.clone(), value: row.clone(), previous_value: previous.clone() }]);
            if let Some(on_update) = &self.handlers.on_update {
                on_update(&key, &row, previous);
            }
        } else {
            self.notify(&[ChangeMessage::Insert { key: key.clone(), value: row.clone() }]);
            if let Some(on_insert) = &self.handlers.on_insert {
                on_insert(&key, &row);
            }
        }
        previous
    }

    pub fn delete(&self, key: &Key) -> Option<Row> {
        let removed = self.state.lock().unwrap().rows.remove(key);
        if let Some(removed) = &removed {
            self.notify(&[ChangeMessage::Delete { key: key.clone(), value: removed.clone() }]);
            if let Some(on_delete) = &self.handlers.on_delete {
                on_delete(key, removed);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;
    use std::sync::atomic::AtomicUsize;

    fn row(id: i64) -> Row {
        Row::new(Value::Object(vec![("id".into(), Value::Number(id as f64))]))
    }

    fn get_key() -> GetKey {
        Arc::new(|r: &Row| Key::Int(r.get("id").and_then(Value::as_f64).unwrap() as i64))
    }

    #[test]
    fn commit_applies_and_notifies() {
        let col = Collection::new(CollectionOptions::new(get_key()));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        col.subscribe_changes(Arc::new(move |changes| {
            count2.fetch_add(changes.len(), AtomicOrdering::Relaxed);
        }));

        col.begin_sync().unwrap();
        col.write([ChangeMessage::Insert { key: Key::Int(1), value: row(1) }]).unwrap();
        let applied = col.commit().unwrap();

        assert_eq!(applied.len(), 1);
        assert_eq!(col.size(), 1);
        assert_eq!(count.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn nested_begin_is_rejected() {
        let col = Collection::new(CollectionOptions::new(get_key()));
        col.begin_sync().unwrap();
        assert!(matches!(col.begin_sync(), Err(D2Error::NestedSyncSession(_))));
    }

    #[test]
    fn begin_sync_from_a_listener_during_commit_is_rejected() {
        let col = Collection::new(CollectionOptions::new(get_key()));
        let reentry_result = Arc::new(Mutex::new(None));
        let reentry_result2 = reentry_result.clone();
        let col_weak = Arc::downgrade(&col);
        col.subscribe_changes(Arc::new(move |_changes| {
            let col = col_weak.upgrade().unwrap();
            *reentry_result2.lock().unwrap() = Some(col.begin_sync());
        }));

        col.begin_sync().unwrap();
        col.write([ChangeMessage::Insert { key: Key::Int(1), value: row(1) }]).unwrap();
        col.commit().unwrap();

        assert!(matches!(reentry_result.lock().unwrap().take(), Some(Err(D2Error::NestedSyncSession(_)))));

        // The guard is released once the commit's notification finishes: a
        // fresh session still works afterward.
        col.begin_sync().unwrap();
        col.write([ChangeMessage::Insert { key: Key::Int(2), value: row(2) }]).unwrap();
        col.commit().unwrap();
        assert_eq!(col.size(), 2);
    }

    #[test]
    fn direct_insert_updates_snapshot() {
        let col = Collection::new(CollectionOptions::new(get_key()));
        let key = col.insert(row(7));
        assert_eq!(key, Key::Int(7));
        assert!(col.has(&Key::Int(7)));
    }
}
