//! In-memory remote store (for testing/local development)
//!
//! Behaves like the real document database as far as the core can observe:
//! merge-upserts, per-batch size limit, `in` filter limit, and full-snapshot
//! pushes to every live subscription of a collection after each write.
//! Call counters and failure switches let tests observe and break it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::{check_in_filters, Filter, Push, RemoteStore, Subscription};
use crate::error::{Result, RosterError};
use crate::model::{Collection, Document, Fields};

struct Subscriber {
    collection: Collection,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<Push>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<Collection, BTreeMap<String, Fields>>,
    subscribers: Vec<Subscriber>,
}

impl StoreState {
    fn matching(&self, collection: Collection, filters: &[Filter]) -> Vec<Document> {
        self.collections
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| filters.iter().all(|f| f.matches(fields)))
                    .map(|(key, fields)| Document::new(key.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn merge(&mut self, collection: Collection, key: String, fields: Fields) {
        let existing = self
            .collections
            .entry(collection)
            .or_default()
            .entry(key)
            .or_default();
        for (name, value) in fields {
            existing.insert(name, value);
        }
    }

    /// Push the current matching set to every live subscriber of `collection`.
    fn notify(&mut self, collection: Collection) {
        let snapshots: Vec<Option<Vec<Document>>> = self
            .subscribers
            .iter()
            .map(|s| (s.collection == collection).then(|| self.matching(collection, &s.filters)))
            .collect();

        let mut index = 0;
        self.subscribers.retain(|sub| {
            let snapshot = snapshots[index].clone();
            index += 1;
            match snapshot {
                Some(docs) => sub.tx.send(Ok(docs)).is_ok(),
                None => !sub.tx.is_closed(),
            }
        });
    }
}

/// Counters of calls made against the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub queries: usize,
    pub single_writes: usize,
    pub batch_writes: usize,
    pub subscriptions: usize,
}

pub struct InMemoryRemoteStore {
    state: RwLock<StoreState>,
    batch_limit: usize,
    in_limit: usize,
    queries: AtomicUsize,
    single_writes: AtomicUsize,
    batch_writes: AtomicUsize,
    subscriptions: AtomicUsize,
    failing_queries: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::with_limits(500, 10)
    }

    pub fn with_limits(batch_limit: usize, in_limit: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            batch_limit,
            in_limit,
            queries: AtomicUsize::new(0),
            single_writes: AtomicUsize::new(0),
            batch_writes: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            failing_queries: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Insert a document directly (no counters), notifying subscribers.
    pub async fn seed(&self, collection: Collection, key: &str, fields: Fields) {
        let mut state = self.state.write().await;
        state.merge(collection, key.to_string(), fields);
        state.notify(collection);
    }

    /// Current stored body of a document.
    pub async fn document(&self, collection: Collection, key: &str) -> Option<Fields> {
        let state = self.state.read().await;
        state.collections.get(&collection)?.get(key).cloned()
    }

    pub async fn len(&self, collection: Collection) -> usize {
        let state = self.state.read().await;
        state.collections.get(&collection).map(|c| c.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> RemoteStats {
        RemoteStats {
            queries: self.queries.load(Ordering::SeqCst),
            single_writes: self.single_writes.load(Ordering::SeqCst),
            batch_writes: self.batch_writes.load(Ordering::SeqCst),
            subscriptions: self.subscriptions.load(Ordering::SeqCst),
        }
    }

    /// Make the next `n` queries fail.
    pub fn fail_next_queries(&self, n: usize) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    /// Make every write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Deliver an error to every live subscription of `collection`.
    pub async fn break_subscriptions(&self, collection: Collection, message: &str) {
        let mut state = self.state.write().await;
        state.subscribers.retain(|sub| {
            if sub.collection != collection {
                return true;
            }
            sub.tx
                .send(Err(RosterError::remote("subscribe", message)))
                .is_ok()
        });
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RosterError::remote(operation, "store rejected write"));
        }
        Ok(())
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn query(&self, collection: Collection, filters: &[Filter]) -> Result<Vec<Document>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RosterError::remote("query", "store unavailable"));
        }
        check_in_filters(filters, self.in_limit)?;

        let state = self.state.read().await;
        let docs = state.matching(collection, filters);
        debug!(%collection, count = docs.len(), "In-memory query");
        Ok(docs)
    }

    async fn upsert_merge(&self, collection: Collection, key: &str, fields: Fields) -> Result<()> {
        self.single_writes.fetch_add(1, Ordering::SeqCst);
        self.check_writable("upsert")?;

        let mut state = self.state.write().await;
        state.merge(collection, key.to_string(), fields);
        state.notify(collection);
        Ok(())
    }

    async fn batch_upsert_merge(
        &self,
        collection: Collection,
        writes: Vec<(String, Fields)>,
    ) -> Result<()> {
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        self.check_writable("batch upsert")?;
        if writes.len() > self.batch_limit {
            return Err(RosterError::BatchTooLarge {
                size: writes.len(),
                limit: self.batch_limit,
            });
        }

        let mut state = self.state.write().await;
        for (key, fields) in writes {
            state.merge(collection, key, fields);
        }
        state.notify(collection);
        Ok(())
    }

    async fn subscribe(&self, collection: Collection, filters: Vec<Filter>) -> Result<Subscription> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        check_in_filters(&filters, self.in_limit)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        // Live queries start with the current matching set.
        let _ = tx.send(Ok(state.matching(collection, &filters)));
        state.subscribers.push(Subscriber {
            collection,
            filters,
            tx,
        });
        Ok(Subscription::new(rx))
    }
}
