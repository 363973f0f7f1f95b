//! Local Document Cache - persisted scope snapshots
//!
//! Stores the documents returned by a remote query, keyed by
//! `(collection, scope)`, in sled so they survive restarts.
//!
//! ## Layout
//!
//! ```text
//! cache.sled/
//! ├── attendance       scope -> [Document]   (e.g. "week:2026-01-19")
//! ├── cadets           scope -> [Document]   (e.g. "company:Alpha")
//! ├── trainingEvents   scope -> [Document]
//! ├── ptPlans          scope -> [Document]
//! └── refreshed_at     "collection:scope" -> unix millis
//! ```
//!
//! A put is always a full replace of one scope. The cache is an
//! optimization: every storage failure is logged and reported as a miss.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::model::{Collection, Document};

const REFRESHED_TREE: &str = "refreshed_at";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Cache encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Cache decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Corrupt timestamp for {0}")]
    Timestamp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Documents of one scope as of the last refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    pub documents: Vec<Document>,
    pub refreshed_at: DateTime<Utc>,
}

/// Summary of one cached scope.
#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    pub collection: Collection,
    pub scope: String,
    pub documents: usize,
    pub refreshed_at: Option<DateTime<Utc>>,
}

struct Backend {
    db: sled::Db,
    stores: HashMap<Collection, sled::Tree>,
    refreshed: sled::Tree,
}

/// Process-wide snapshot cache shared by every open view.
pub struct LocalCache {
    backend: Option<Backend>,
}

impl LocalCache {
    /// Open (or create) the cache database.
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.capacity_bytes)
            .open()?;

        let mut stores = HashMap::new();
        for collection in Collection::ALL {
            stores.insert(collection, db.open_tree(collection.as_str())?);
        }
        let refreshed = db.open_tree(REFRESHED_TREE)?;

        info!(path = %config.path.display(), "LocalCache opened");

        Ok(Self {
            backend: Some(Backend {
                db,
                stores,
                refreshed,
            }),
        })
    }

    /// Open the cache, falling back to a disabled cache on failure.
    pub fn open_or_disabled(config: &CacheConfig) -> Self {
        match Self::open(config) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(path = %config.path.display(), error = %e, "Cache unavailable, running without it");
                Self::disabled()
            }
        }
    }

    /// Open a cache at a specific path with default settings
    pub fn at_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::open(&CacheConfig {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    /// A cache that never hits and never stores.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Snapshot for a scope, or `None` on miss or storage failure.
    pub fn get(&self, collection: Collection, scope: &str) -> Option<CachedSnapshot> {
        let backend = self.backend.as_ref()?;
        match backend.read(collection, scope) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%collection, scope, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Replace the scope's document set and stamp it with `timestamp`.
    pub fn put(
        &self,
        collection: Collection,
        scope: &str,
        documents: &[Document],
        timestamp: DateTime<Utc>,
    ) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        match backend.write(collection, scope, documents, timestamp) {
            Ok(()) => debug!(%collection, scope, count = documents.len(), "Cached scope"),
            Err(e) => warn!(%collection, scope, error = %e, "Cache write failed"),
        }
    }

    /// Time since the scope was last refreshed, if known.
    pub fn age(&self, collection: Collection, scope: &str) -> Option<Duration> {
        let backend = self.backend.as_ref()?;
        let refreshed_at = match backend.refreshed_at(collection, scope) {
            Ok(ts) => ts?,
            Err(e) => {
                warn!(%collection, scope, error = %e, "Cache timestamp unreadable");
                return None;
            }
        };
        // A timestamp from the future (clock skew) counts as brand new.
        Some((Utc::now() - refreshed_at).to_std().unwrap_or(Duration::ZERO))
    }

    /// Drop one scope.
    pub fn invalidate(&self, collection: Collection, scope: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(e) = backend.remove(collection, scope) {
            warn!(%collection, scope, error = %e, "Cache invalidate failed");
        }
    }

    /// Drop every scope of a collection; returns how many were removed.
    pub fn invalidate_collection(&self, collection: Collection) -> usize {
        let scopes: Vec<String> = self
            .entries()
            .into_iter()
            .filter(|e| e.collection == collection)
            .map(|e| e.scope)
            .collect();
        for scope in &scopes {
            self.invalidate(collection, scope);
        }
        if !scopes.is_empty() {
            info!(%collection, count = scopes.len(), "Invalidated cached scopes");
        }
        scopes.len()
    }

    /// List cached scopes across all collections.
    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let Some(backend) = self.backend.as_ref() else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for collection in Collection::ALL {
            let Some(tree) = backend.stores.get(&collection) else {
                continue;
            };
            for item in tree.iter() {
                let (key, value) = match item {
                    Ok(kv) => kv,
                    Err(e) => {
                        warn!(%collection, error = %e, "Cache scan failed");
                        break;
                    }
                };
                let scope = String::from_utf8_lossy(&key).to_string();
                let documents = rmp_serde::from_slice::<Vec<Document>>(&value)
                    .map(|docs| docs.len())
                    .unwrap_or(0);
                let refreshed_at = backend.refreshed_at(collection, &scope).ok().flatten();
                entries.push(CacheEntryInfo {
                    collection,
                    scope,
                    documents,
                    refreshed_at,
                });
            }
        }
        entries
    }

    /// Flush changes to disk
    pub fn flush(&self) {
        if let Some(backend) = self.backend.as_ref() {
            if let Err(e) = backend.db.flush() {
                warn!(error = %e, "Cache flush failed");
            }
        }
    }

    /// Flush and release the database.
    pub fn close(self) {
        self.flush();
        debug!("LocalCache closed");
    }
}

impl Backend {
    fn store(&self, collection: Collection) -> &sled::Tree {
        // Every collection tree is opened in `LocalCache::open`.
        &self.stores[&collection]
    }

    fn read(&self, collection: Collection, scope: &str) -> Result<Option<CachedSnapshot>, CacheError> {
        let Some(bytes) = self.store(collection).get(scope.as_bytes())? else {
            return Ok(None);
        };
        let Some(refreshed_at) = self.refreshed_at(collection, scope)? else {
            // Documents without a stamp are a torn write; ignore them.
            return Ok(None);
        };
        let documents: Vec<Document> = rmp_serde::from_slice(&bytes)?;
        Ok(Some(CachedSnapshot {
            documents,
            refreshed_at,
        }))
    }

    fn write(
        &self,
        collection: Collection,
        scope: &str,
        documents: &[Document],
        timestamp: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let payload = rmp_serde::to_vec(documents)?;
        self.store(collection).insert(scope.as_bytes(), payload)?;
        // Stamp last so an interrupted write never looks fresh.
        self.refreshed.insert(
            stamp_key(collection, scope).as_bytes(),
            &timestamp.timestamp_millis().to_be_bytes()[..],
        )?;
        Ok(())
    }

    fn remove(&self, collection: Collection, scope: &str) -> Result<(), CacheError> {
        self.refreshed.remove(stamp_key(collection, scope).as_bytes())?;
        self.store(collection).remove(scope.as_bytes())?;
        Ok(())
    }

    fn refreshed_at(
        &self,
        collection: Collection,
        scope: &str,
    ) -> Result<Option<DateTime<Utc>>, CacheError> {
        let key = stamp_key(collection, scope);
        let Some(bytes) = self.refreshed.get(key.as_bytes())? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| CacheError::Timestamp(key.clone()))?;
        let millis = i64::from_be_bytes(raw);
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Some)
            .ok_or(CacheError::Timestamp(key))
    }
}

fn stamp_key(collection: Collection, scope: &str) -> String {
    format!("{}:{}", collection.as_str(), scope)
}
