//! Attendance Repository - cache-first reads, merge-writes
//!
//! ## Read path
//!
//! ```text
//! read_scope(collection, scope)
//!   ├── cache age < max_age ──► return cached docs, spawn background refresh
//!   └── absent / stale ───────► remote query (one retry) ──► cache.put ──► return
//! ```
//!
//! ## Write path
//!
//! Writes always send a full record (every slot) with merge semantics, so a
//! write never nulls out slots it did not mean to touch. Multi-record saves go
//! through `batch_update_records`, chunked to the store's batch limit and
//! issued sequentially.

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::cache::LocalCache;
use crate::config::Config;
use crate::error::Result;
use crate::model::{
    ensure_week_start, format_date, materialize_week, ActivityType, AttendanceMap,
    AttendanceRecord, Cadet, CadetId, Collection, Document, Fields, Slot, Status, Weekday,
    FIELD_CADET_ID, FIELD_COMPANY, FIELD_WEEK_START,
};
use crate::remote::{Filter, RemoteStore, Subscription};

/// Which cadets a roster shows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RosterScope {
    /// One company's roster
    Company(String),
    /// The Master roster: every cadet
    All,
}

impl RosterScope {
    /// Cache scope key for the cadet list.
    pub fn cache_key(&self) -> String {
        match self {
            RosterScope::Company(name) => format!("company:{}", name),
            RosterScope::All => "all".to_string(),
        }
    }

    pub fn filters(&self) -> Vec<Filter> {
        match self {
            RosterScope::Company(name) => vec![Filter::eq(FIELD_COMPANY, name.as_str())],
            RosterScope::All => vec![],
        }
    }
}

/// Cache scope key for a week's attendance documents.
pub fn week_scope_key(week_start: NaiveDate) -> String {
    format!("week:{}", format_date(week_start))
}

pub fn week_filters(week_start: NaiveDate) -> Vec<Filter> {
    vec![Filter::eq(FIELD_WEEK_START, format_date(week_start))]
}

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Cached snapshots younger than this are served without a synchronous fetch
    pub max_age: Duration,
    /// Maximum documents per batched write
    pub batch_limit: usize,
    /// Maximum values per `in` filter
    pub in_filter_limit: usize,
    /// Re-subscriptions a live view attempts after a subscription error
    pub resubscribe_attempts: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RepositoryConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_age: config.cache.max_age(),
            batch_limit: config.remote.batch_limit,
            in_filter_limit: config.remote.in_filter_limit,
            resubscribe_attempts: config.sync.resubscribe_attempts,
        }
    }
}

pub struct AttendanceRepository<R: RemoteStore> {
    remote: Arc<R>,
    cache: Arc<LocalCache>,
    config: RepositoryConfig,
}

impl<R: RemoteStore + 'static> AttendanceRepository<R> {
    pub fn new(remote: Arc<R>, cache: Arc<LocalCache>, config: RepositoryConfig) -> Self {
        Self {
            remote,
            cache,
            config,
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cache-first read of a scope's raw documents.
    ///
    /// A fresh snapshot is returned as is and refreshed in the background; an
    /// absent or stale one is replaced by a synchronous remote fetch.
    pub async fn read_scope(
        &self,
        collection: Collection,
        scope_key: &str,
        filters: Vec<Filter>,
    ) -> Result<Vec<Document>> {
        let fresh = self
            .cache
            .age(collection, scope_key)
            .map(|age| age < self.config.max_age)
            .unwrap_or(false);

        if fresh {
            if let Some(snapshot) = self.cache.get(collection, scope_key) {
                debug!(%collection, scope = scope_key, "Serving cached scope");
                self.spawn_refresh(collection, scope_key.to_string(), filters);
                return Ok(snapshot.documents);
            }
        }

        self.refresh_scope(collection, scope_key, &filters).await
    }

    /// Fetch a scope from the remote store and replace its cache entry.
    pub async fn refresh_scope(
        &self,
        collection: Collection,
        scope_key: &str,
        filters: &[Filter],
    ) -> Result<Vec<Document>> {
        fetch_and_cache(self.remote.as_ref(), &self.cache, collection, scope_key, filters).await
    }

    fn spawn_refresh(&self, collection: Collection, scope_key: String, filters: Vec<Filter>) {
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            if let Err(e) =
                fetch_and_cache(remote.as_ref(), &cache, collection, &scope_key, &filters).await
            {
                warn!(%collection, scope = %scope_key, error = %e, "Background refresh failed");
            }
        });
    }

    /// Cadets in scope, ordered by last then first name.
    pub async fn get_cadets(&self, scope: &RosterScope) -> Result<Vec<Cadet>> {
        let docs = self
            .read_scope(Collection::Cadets, &scope.cache_key(), scope.filters())
            .await?;
        let mut cadets: Vec<Cadet> = docs
            .iter()
            .filter_map(|doc| match Cadet::from_document(doc) {
                Ok(cadet) => Some(cadet),
                Err(e) => {
                    warn!(key = %doc.key, error = %e, "Skipping malformed cadet document");
                    None
                }
            })
            .collect();
        cadets.sort_by(|a, b| {
            (a.last_name.as_str(), a.first_name.as_str(), &a.id)
                .cmp(&(b.last_name.as_str(), b.first_name.as_str(), &b.id))
        });
        Ok(cadets)
    }

    /// Attendance for every cadet in scope for one week.
    pub async fn get_scoped_attendance(
        &self,
        scope: &RosterScope,
        week_start: NaiveDate,
    ) -> Result<AttendanceMap> {
        let week_start = ensure_week_start(week_start)?;
        let cadets: BTreeSet<CadetId> = self
            .get_cadets(scope)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        self.attendance_for_cadets(&cadets, week_start).await
    }

    /// Attendance for an explicit cadet set; missing records are synthesized.
    pub async fn attendance_for_cadets(
        &self,
        cadets: &BTreeSet<CadetId>,
        week_start: NaiveDate,
    ) -> Result<AttendanceMap> {
        let docs = self
            .read_scope(
                Collection::Attendance,
                &week_scope_key(week_start),
                week_filters(week_start),
            )
            .await?;
        Ok(materialize_week(cadets, week_start, &docs))
    }

    /// Current stored record, straight from the remote store.
    pub async fn fetch_record(
        &self,
        cadet_id: &CadetId,
        week_start: NaiveDate,
    ) -> Result<Option<AttendanceRecord>> {
        let mut filters = week_filters(week_start);
        filters.push(Filter::is_in(FIELD_CADET_ID, cadet_id_values(cadet_id)));
        let docs = query_with_retry(self.remote.as_ref(), Collection::Attendance, &filters).await?;
        for doc in &docs {
            let record = AttendanceRecord::from_document(doc)?;
            if &record.cadet_id == cadet_id && record.week_start == week_start {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Every stored record of the given cadets, across all weeks.
    pub async fn fetch_records_for_cadets(
        &self,
        cadets: &[CadetId],
    ) -> Result<Vec<AttendanceRecord>> {
        let limit = self.config.in_filter_limit.max(2);
        let wanted: BTreeSet<&CadetId> = cadets.iter().collect();

        let mut groups: Vec<Vec<Value>> = Vec::new();
        let mut current: Vec<Value> = Vec::new();
        for id in cadets {
            let values = cadet_id_values(id);
            if !current.is_empty() && current.len() + values.len() > limit {
                groups.push(std::mem::take(&mut current));
            }
            current.extend(values);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let mut records = Vec::new();
        for values in groups {
            let filters = vec![Filter::is_in(FIELD_CADET_ID, values)];
            let docs =
                query_with_retry(self.remote.as_ref(), Collection::Attendance, &filters).await?;
            records.extend(
                parse_records(&docs)
                    .into_iter()
                    .filter(|r| wanted.contains(&r.cadet_id)),
            );
        }
        Ok(records)
    }

    /// Subscribe to the week's attendance documents.
    pub async fn subscribe_week(&self, week_start: NaiveDate) -> Result<Subscription> {
        let filters = week_filters(week_start);
        match self
            .remote
            .subscribe(Collection::Attendance, filters.clone())
            .await
        {
            Ok(sub) => Ok(sub),
            Err(e) => {
                warn!(week = %week_start, error = %e, "Subscribe failed, retrying once");
                self.remote.subscribe(Collection::Attendance, filters).await
            }
        }
    }

    /// Record a pushed week snapshot as the cache entry for that week.
    pub fn cache_week_push(&self, week_start: NaiveDate, documents: &[Document]) {
        self.cache.put(
            Collection::Attendance,
            &week_scope_key(week_start),
            documents,
            Utc::now(),
        );
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Set exactly one slot, keeping every other slot at its stored value.
    pub async fn update_single_slot(
        &self,
        cadet_id: &CadetId,
        day: Weekday,
        status: Status,
        week_start: NaiveDate,
        activity: ActivityType,
    ) -> Result<AttendanceRecord> {
        let week_start = ensure_week_start(week_start)?;
        let slot = Slot::resolve(activity, day)?;

        let current = self.fetch_record(cadet_id, week_start).await?;
        let record =
            AttendanceRecord::materialize(current, cadet_id, week_start).with(slot, status);

        self.update_whole_record(&record).await?;
        debug!(cadet = %cadet_id, %slot, %status, "Updated single slot");
        Ok(record)
    }

    /// Merge-write all slots of one record.
    pub async fn update_whole_record(&self, record: &AttendanceRecord) -> Result<()> {
        ensure_week_start(record.week_start)?;
        self.remote
            .upsert_merge(Collection::Attendance, &record.key(), record.to_fields())
            .await?;
        self.cache
            .invalidate(Collection::Attendance, &week_scope_key(record.week_start));
        debug!(key = %record.key(), "Wrote attendance record");
        Ok(())
    }

    /// Merge-write many records in as few batch calls as the limit allows.
    ///
    /// Returns the number of batch calls issued.
    pub async fn batch_update_records(&self, records: &[AttendanceRecord]) -> Result<usize> {
        for record in records {
            ensure_week_start(record.week_start)?;
        }
        let writes: Vec<(String, Fields)> = records
            .iter()
            .map(|r| (r.key(), r.to_fields()))
            .collect();
        let weeks: BTreeSet<NaiveDate> = records.iter().map(|r| r.week_start).collect();

        let result = self.write_chunked(writes).await;
        for week in weeks {
            self.cache
                .invalidate(Collection::Attendance, &week_scope_key(week));
        }
        result
    }

    /// Reset every slot of every stored attendance record to unset.
    ///
    /// Records are not removed. Returns how many records were reset.
    pub async fn clear_all_attendance(&self) -> Result<usize> {
        let docs = query_with_retry(self.remote.as_ref(), Collection::Attendance, &[]).await?;
        let cleared = unset_slot_fields();
        let writes: Vec<(String, Fields)> = docs
            .into_iter()
            .map(|doc| (doc.key, cleared.clone()))
            .collect();
        let count = writes.len();

        let result = self.write_chunked(writes).await;
        self.cache.invalidate_collection(Collection::Attendance);
        result?;

        info!(records = count, "Cleared all attendance");
        Ok(count)
    }

    async fn write_chunked(&self, writes: Vec<(String, Fields)>) -> Result<usize> {
        if writes.is_empty() {
            return Ok(0);
        }
        let limit = self.config.batch_limit.max(1);
        let total_chunks = writes.len().div_ceil(limit);
        let mut committed = 0;

        for (index, chunk) in writes.chunks(limit).enumerate() {
            if let Err(e) = self
                .remote
                .batch_upsert_merge(Collection::Attendance, chunk.to_vec())
                .await
            {
                warn!(
                    chunk = index + 1,
                    total_chunks,
                    committed,
                    error = %e,
                    "Batch write failed"
                );
                return Err(e);
            }
            committed += chunk.len();
            debug!(chunk = index + 1, total_chunks, size = chunk.len(), "Batch committed");
        }

        info!(records = committed, batches = total_chunks, "Batch write complete");
        Ok(total_chunks)
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    /// Unexcused slots for a cadet across every week on record.
    pub async fn lifetime_unexcused(&self, cadet_id: &CadetId) -> Result<usize> {
        let records = self.cadet_history(cadet_id).await?;
        Ok(aggregate::count_unexcused(&records))
    }

    /// Lifetime unexcused counts for many cadets, using chunked `in` queries.
    pub async fn lifetime_unexcused_many(
        &self,
        cadets: &[CadetId],
    ) -> Result<BTreeMap<CadetId, usize>> {
        let mut counts: BTreeMap<CadetId, usize> = cadets.iter().map(|id| (id.clone(), 0)).collect();
        for record in self.fetch_records_for_cadets(cadets).await? {
            if let Some(count) = counts.get_mut(&record.cadet_id) {
                *count += aggregate::count_unexcused([&record]);
            }
        }
        Ok(counts)
    }

    /// Dates on which a cadet had an unexcused slot.
    pub async fn unexcused_dates(&self, cadet_id: &CadetId) -> Result<Vec<NaiveDate>> {
        let records = self.cadet_history(cadet_id).await?;
        Ok(aggregate::unexcused_dates(&records))
    }

    async fn cadet_history(&self, cadet_id: &CadetId) -> Result<Vec<AttendanceRecord>> {
        let filters = vec![Filter::is_in(FIELD_CADET_ID, cadet_id_values(cadet_id))];
        let docs = query_with_retry(self.remote.as_ref(), Collection::Attendance, &filters).await?;
        Ok(parse_records(&docs)
            .into_iter()
            .filter(|r| &r.cadet_id == cadet_id)
            .collect())
    }
}

async fn query_with_retry<R: RemoteStore + ?Sized>(
    remote: &R,
    collection: Collection,
    filters: &[Filter],
) -> Result<Vec<Document>> {
    match remote.query(collection, filters).await {
        Ok(docs) => Ok(docs),
        Err(first) => {
            warn!(%collection, error = %first, "Remote query failed, retrying once");
            remote.query(collection, filters).await
        }
    }
}

async fn fetch_and_cache<R: RemoteStore + ?Sized>(
    remote: &R,
    cache: &LocalCache,
    collection: Collection,
    scope_key: &str,
    filters: &[Filter],
) -> Result<Vec<Document>> {
    let docs = query_with_retry(remote, collection, filters).await?;
    cache.put(collection, scope_key, &docs, Utc::now());
    debug!(%collection, scope = scope_key, count = docs.len(), "Fetched scope");
    Ok(docs)
}

/// Stored forms of a cadet id. Older documents hold numeric ids.
fn cadet_id_values(cadet_id: &CadetId) -> Vec<Value> {
    let mut values = vec![Value::from(cadet_id.as_str())];
    if let Ok(n) = cadet_id.as_str().parse::<i64>() {
        values.push(Value::from(n));
    }
    values
}

fn parse_records(docs: &[Document]) -> Vec<AttendanceRecord> {
    docs.iter()
        .filter_map(|doc| match AttendanceRecord::from_document(doc) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %doc.key, error = %e, "Skipping malformed attendance document");
                None
            }
        })
        .collect()
}

fn unset_slot_fields() -> Fields {
    Slot::ALL
        .into_iter()
        .map(|slot| {
            (
                slot.field_name().to_string(),
                Value::String(Status::Unset.as_str().to_string()),
            )
        })
        .collect()
}
