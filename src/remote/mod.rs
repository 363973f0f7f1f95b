//! Remote Store Adapter - the document database boundary
//!
//! The store is external; this module defines the operations the core needs
//! from it and ships an in-memory implementation for tests and local
//! development.
//!
//! ## Semantics
//!
//! - `query`: equality-filtered snapshot read
//! - `upsert_merge`: writes only the supplied fields, creating the document
//!   if absent
//! - `batch_upsert_merge`: same merge semantics, atomic per call, bounded by
//!   the store's per-batch limit
//! - `subscribe`: every change delivers the *entire* matching document set,
//!   never a diff

pub mod memory;

pub use memory::{InMemoryRemoteStore, RemoteStats};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, RosterError};
use crate::model::{Collection, Document, Fields};

/// Equality filter understood by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field == value`
    Eq { field: String, value: Value },
    /// `field in [values]`
    In { field: String, values: Vec<Value> },
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::Eq { field, value } => fields.get(field) == Some(value),
            Filter::In { field, values } => fields
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
        }
    }
}

/// A single push: the full matching set, or the subscription's error.
pub type Push = Result<Vec<Document>>;

/// Live query handle. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Push>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Push>) -> Self {
        Self { rx }
    }

    /// Next push; `None` once the store has dropped the subscription.
    pub async fn next(&mut self) -> Option<Push> {
        self.rx.recv().await
    }

    /// Stop receiving pushes. The store prunes a subscription once its
    /// receiver is gone.
    pub fn unsubscribe(self) {
        drop(self.rx);
    }
}

/// Operations the core requires from the document database.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Snapshot read of every document matching all filters.
    async fn query(&self, collection: Collection, filters: &[Filter]) -> Result<Vec<Document>>;

    /// Merge-write one document.
    async fn upsert_merge(&self, collection: Collection, key: &str, fields: Fields) -> Result<()>;

    /// Merge-write many documents in one atomic call.
    async fn batch_upsert_merge(
        &self,
        collection: Collection,
        writes: Vec<(String, Fields)>,
    ) -> Result<()>;

    /// Push the full matching set on every change.
    async fn subscribe(&self, collection: Collection, filters: Vec<Filter>) -> Result<Subscription>;
}

/// Ensure an `in` filter stays within the store's value limit.
pub(crate) fn check_in_filters(filters: &[Filter], limit: usize) -> Result<()> {
    for filter in filters {
        if let Filter::In { values, .. } = filter {
            if values.len() > limit {
                return Err(RosterError::FilterTooLarge {
                    size: values.len(),
                    limit,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matching() {
        let fields = json!({"cadetId": "7", "company": "Alpha"})
            .as_object()
            .unwrap()
            .clone();

        assert!(Filter::eq("company", "Alpha").matches(&fields));
        assert!(!Filter::eq("company", "Bravo").matches(&fields));
        assert!(!Filter::eq("missing", "x").matches(&fields));
        assert!(Filter::is_in("cadetId", ["1", "7"]).matches(&fields));
        assert!(!Filter::is_in("cadetId", ["1", "2"]).matches(&fields));
    }

    #[test]
    fn test_in_filter_limit() {
        let ids: Vec<String> = (0..11).map(|i| i.to_string()).collect();
        let filters = vec![Filter::is_in("cadetId", ids)];
        assert!(matches!(
            check_in_filters(&filters, 10),
            Err(RosterError::FilterTooLarge { size: 11, limit: 10 })
        ));
        assert!(check_in_filters(&filters, 11).is_ok());
    }
}
