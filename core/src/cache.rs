use crate::clock::Clock;
use crate::error::LiftError;
use crate::key::{KeyFilter, QueryKey};
use crate::retry::{run_with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_QUERY_RETRY: u32 = 2;
pub const DEFAULT_MUTATION_RETRY: u32 = 1;

pub type FetchFuture = BoxFuture<'static, Result<Value, LiftError>>;
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;
type SharedFetch = Shared<FetchFuture>;

/// Wrap a typed async loader into a cache fetcher.
pub fn fetcher<T, F, Fut>(load: F) -> Fetcher
where
    T: Serialize,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, LiftError>> + Send + 'static,
{
    Arc::new(move || {
        let pending = load();
        async move {
            let value = pending.await?;
            Ok::<_, LiftError>(serde_json::to_value(value)?)
        }
        .boxed()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub enabled: bool,
    pub retry: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
            enabled: true,
            retry: DEFAULT_QUERY_RETRY,
        }
    }
}

impl QueryOptions {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }
}

/// Cache-wide defaults, usually taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDefaults {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub query_retry: u32,
    pub mutation_retry: u32,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
            query_retry: DEFAULT_QUERY_RETRY,
            mutation_retry: DEFAULT_MUTATION_RETRY,
        }
    }
}

/// What a screen sees when it reads a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub status: QueryStatus,
    pub error: Option<LiftError>,
    pub is_stale: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QueryState<T> {
    fn idle() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            is_stale: true,
            updated_at: None,
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Fetching
    }

    /// Nothing to show yet and a request is running.
    pub fn is_loading(&self) -> bool {
        self.is_fetching() && self.data.is_none()
    }

    /// The first fetch for this key failed, so there is no content to fall back to.
    pub fn is_first_load_error(&self) -> bool {
        self.data.is_none() && self.error.is_some()
    }
}

/// A cached entry in serializable form, used to persist the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
    pub key: QueryKey,
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
}

struct InFlight {
    seq: u64,
    future: SharedFetch,
}

struct MountedQuery {
    fetcher: Fetcher,
    options: QueryOptions,
}

struct CacheEntry {
    data: Option<Value>,
    data_seq: u64,
    fetched_at: Option<DateTime<Utc>>,
    stale_time: Duration,
    gc_time: Duration,
    status: QueryStatus,
    error: Option<LiftError>,
    invalidated: bool,
    invalidated_seq: u64,
    last_used: DateTime<Utc>,
    in_flight: Option<InFlight>,
    observers: BTreeMap<u64, MountedQuery>,
    revision: watch::Sender<u64>,
}

impl CacheEntry {
    /// `created_seq` marks the entry's birth: fetches started before it, for
    /// a removed predecessor under the same key, never resolve into it.
    fn new(now: DateTime<Utc>, defaults: &CacheDefaults, created_seq: u64) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            data: None,
            data_seq: created_seq,
            fetched_at: None,
            stale_time: defaults.stale_time,
            gc_time: defaults.gc_time,
            status: QueryStatus::Idle,
            error: None,
            invalidated: false,
            invalidated_seq: 0,
            last_used: now,
            in_flight: None,
            observers: BTreeMap::new(),
            revision,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match (&self.data, self.fetched_at) {
            (Some(_), Some(fetched_at)) => {
                self.invalidated || older_than(fetched_at, now, self.stale_time)
            }
            _ => true,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.observers.is_empty()
            && self.in_flight.is_none()
            && older_than(self.last_used, now, self.gc_time)
    }

    fn touch(&mut self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn state(&self, now: DateTime<Utc>) -> QueryState<Value> {
        QueryState {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            is_stale: self.is_stale(now),
            updated_at: self.fetched_at,
        }
    }

    fn reset(&mut self) {
        self.data = None;
        self.fetched_at = None;
        self.status = QueryStatus::Idle;
        self.error = None;
        self.invalidated = false;
        self.in_flight = None;
    }
}

pub(crate) fn older_than(then: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    (now - then)
        .to_std()
        .map(|age| age > window)
        .unwrap_or(false)
}

fn decode_state<T: DeserializeOwned>(state: QueryState<Value>) -> QueryState<T> {
    let QueryState {
        data,
        status,
        mut error,
        is_stale,
        updated_at,
    } = state;
    let data = match data.map(serde_json::from_value::<T>) {
        Some(Ok(value)) => Some(value),
        Some(Err(err)) => {
            error = Some(LiftError::from(err));
            None
        }
        None => None,
    };
    QueryState {
        data,
        status,
        error,
        is_stale,
        updated_at,
    }
}

/// Keyed, time-aware cache of server data.
///
/// Handles are cheap to clone and all share the same entries. Fetches are
/// spawned on the ambient tokio runtime, so reads that may fetch must run
/// inside one.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: Mutex<HashMap<QueryKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
    defaults: CacheDefaults,
    next_seq: AtomicU64,
    next_observer: AtomicU64,
    online: AtomicBool,
    changes: watch::Sender<u64>,
}

impl QueryCache {
    pub fn new(defaults: CacheDefaults, clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                clock,
                defaults,
                next_seq: AtomicU64::new(1),
                next_observer: AtomicU64::new(1),
                online: AtomicBool::new(true),
                changes,
            }),
        }
    }

    pub fn defaults(&self) -> &CacheDefaults {
        &self.inner.defaults
    }

    /// Query options seeded from the cache defaults.
    pub fn options(&self) -> QueryOptions {
        QueryOptions {
            stale_time: self.inner.defaults.stale_time,
            gc_time: self.inner.defaults.gc_time,
            enabled: true,
            retry: self.inner.defaults.query_retry,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn new_entry(&self, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(now, &self.inner.defaults, self.next_seq())
    }

    fn notify_changed(&self) {
        self.inner.changes.send_modify(|rev| *rev += 1);
    }

    /// Revision counter bumped whenever cached data changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// Return what is cached right now and start a background fetch when the
    /// entry is missing or stale.
    pub fn query<T: DeserializeOwned>(
        &self,
        key: QueryKey,
        fetcher: Fetcher,
        options: &QueryOptions,
    ) -> QueryState<T> {
        let now = self.now();
        let (state, started) = {
            let mut entries = self.inner.entries.lock();
            let entry = self.entry_for_read(&mut entries, &key, options, now);
            let started = if options.enabled && entry.is_stale(now) {
                self.attach_or_start(entry, &key, fetcher, options.retry)
                    .1
            } else {
                None
            };
            (entry.state(now), started)
        };
        if let Some(task) = started {
            tokio::spawn(task);
        }
        decode_state(state)
    }

    /// Resolve a query, waiting for the network only when the cached value is
    /// missing or stale.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        key: QueryKey,
        fetcher: Fetcher,
        options: &QueryOptions,
    ) -> Result<T, LiftError> {
        let now = self.now();
        let (pending, started) = {
            let mut entries = self.inner.entries.lock();
            let entry = self.entry_for_read(&mut entries, &key, options, now);
            if !entry.is_stale(now) || !options.enabled {
                return match &entry.data {
                    Some(data) => Ok(serde_json::from_value(data.clone())?),
                    None => Err(LiftError::Validation(format!("query {key} is disabled"))),
                };
            }
            self.attach_or_start(entry, &key, fetcher, options.retry)
        };
        if let Some(task) = started {
            tokio::spawn(task);
        }
        let value = pending.await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Current state without triggering a fetch.
    pub fn peek<T: DeserializeOwned>(&self, key: &QueryKey) -> QueryState<T> {
        let now = self.now();
        let entries = self.inner.entries.lock();
        match entries.get(key) {
            Some(entry) => decode_state(entry.state(now)),
            None => QueryState::idle(),
        }
    }

    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let entries = self.inner.entries.lock();
        let data = entries.get(key)?.data.clone()?;
        serde_json::from_value(data).ok()
    }

    /// Write data directly, as if a fetch had just returned it.
    pub fn set_query_data<T: Serialize>(&self, key: QueryKey, value: &T) -> Result<(), LiftError> {
        let data = serde_json::to_value(value)?;
        let now = self.now();
        let seq = self.next_seq();
        {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(key)
                .or_insert_with(|| self.new_entry(now));
            entry.data = Some(data);
            entry.data_seq = seq;
            entry.fetched_at = Some(now);
            entry.last_used = now;
            entry.error = None;
            entry.invalidated = false;
            if entry.in_flight.is_none() {
                entry.status = QueryStatus::Success;
            }
            entry.touch();
        }
        self.notify_changed();
        Ok(())
    }

    pub fn invalidate(&self, keys: &[QueryKey]) -> usize {
        keys.iter()
            .map(|key| self.invalidate_matching(&KeyFilter::Exact(key.clone())))
            .sum()
    }

    /// Mark matching entries stale. Data stays visible; mounted queries
    /// refetch right away, the rest on their next read.
    pub fn invalidate_matching(&self, filter: &KeyFilter) -> usize {
        let mut started = Vec::new();
        let mut matched = 0;
        {
            let mut entries = self.inner.entries.lock();
            for (key, entry) in entries.iter_mut().filter(|(key, _)| filter.matches(key)) {
                matched += 1;
                entry.invalidated = true;
                entry.invalidated_seq = self.next_seq();
                if entry.in_flight.take().is_some() {
                    tracing::debug!(%key, "superseding in-flight fetch after invalidation");
                }
                let mounted = entry
                    .observers
                    .values()
                    .find(|observer| observer.options.enabled)
                    .map(|observer| (observer.fetcher.clone(), observer.options.retry));
                match mounted {
                    Some((fetcher, retry)) => {
                        if let (_, Some(task)) = self.attach_or_start(entry, key, fetcher, retry) {
                            started.push(task);
                        }
                    }
                    None => {
                        if entry.status == QueryStatus::Fetching {
                            entry.status = settled_status(entry);
                        }
                        entry.touch();
                    }
                }
            }
        }
        for task in started {
            tokio::spawn(task);
        }
        if matched > 0 {
            tracing::debug!(?filter, matched, "invalidated queries");
        }
        matched
    }

    /// Drop matching entries. Entries that still have mounted observers are
    /// reset to idle instead of being removed.
    pub fn remove_matching(&self, filter: &KeyFilter) -> usize {
        let mut removed = 0;
        {
            let mut entries = self.inner.entries.lock();
            entries.retain(|key, entry| {
                if !filter.matches(key) {
                    return true;
                }
                removed += 1;
                if entry.observers.is_empty() {
                    false
                } else {
                    entry.reset();
                    entry.data_seq = self.next_seq();
                    entry.touch();
                    true
                }
            });
        }
        if removed > 0 {
            self.notify_changed();
        }
        removed
    }

    pub fn remove(&self, key: &QueryKey) -> bool {
        self.remove_matching(&KeyFilter::Exact(key.clone())) > 0
    }

    pub fn clear(&self) {
        self.remove_matching(&KeyFilter::All);
    }

    /// Mount a long-lived subscriber on `key`.
    pub fn observe(&self, key: QueryKey, fetcher: Fetcher, options: QueryOptions) -> QueryObserver {
        let id = self.inner.next_observer.fetch_add(1, Ordering::SeqCst);
        let now = self.now();
        let (receiver, started) = {
            let mut entries = self.inner.entries.lock();
            let entry = self.entry_for_read(&mut entries, &key, &options, now);
            let started = if options.enabled && entry.is_stale(now) {
                self.attach_or_start(entry, &key, fetcher.clone(), options.retry)
                    .1
            } else {
                None
            };
            entry
                .observers
                .insert(id, MountedQuery { fetcher, options });
            (entry.revision.subscribe(), started)
        };
        if let Some(task) = started {
            tokio::spawn(task);
        }
        QueryObserver {
            cache: self.clone(),
            key,
            id,
            receiver,
        }
    }

    fn unmount(&self, key: &QueryKey, id: u64) {
        let now = self.now();
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.observers.remove(&id);
            entry.last_used = now;
        }
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.observers.len())
            .unwrap_or(0)
    }

    /// Evict entries nobody has used within their gc window.
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let mut evicted = Vec::new();
        {
            let mut entries = self.inner.entries.lock();
            entries.retain(|key, entry| {
                if entry.is_expired(now) {
                    evicted.push(key.clone());
                    false
                } else {
                    true
                }
            });
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted unused queries");
            self.notify_changed();
        }
        evicted.len()
    }

    pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }

    /// The application came back to the foreground.
    pub fn on_focus(&self) -> usize {
        if !self.is_online() {
            return 0;
        }
        self.refetch_mounted_stale("focus")
    }

    /// Record connectivity; an offline to online transition revalidates.
    pub fn set_online(&self, online: bool) -> usize {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            tracing::info!("connectivity restored");
            self.refetch_mounted_stale("reconnect")
        } else {
            if !online && was_online {
                tracing::info!("connectivity lost");
            }
            0
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    fn refetch_mounted_stale(&self, reason: &str) -> usize {
        let now = self.now();
        let mut started = Vec::new();
        {
            let mut entries = self.inner.entries.lock();
            for (key, entry) in entries.iter_mut() {
                if entry.in_flight.is_some() || !entry.is_stale(now) {
                    continue;
                }
                let mounted = entry
                    .observers
                    .values()
                    .find(|observer| observer.options.enabled)
                    .map(|observer| (observer.fetcher.clone(), observer.options.retry));
                if let Some((fetcher, retry)) = mounted {
                    if let (_, Some(task)) = self.attach_or_start(entry, key, fetcher, retry) {
                        started.push(task);
                    }
                }
            }
        }
        let count = started.len();
        for task in started {
            tokio::spawn(task);
        }
        if count > 0 {
            tracing::debug!(reason, count, "revalidating mounted queries");
        }
        count
    }

    /// Entries worth persisting: everything holding a successful result.
    pub fn dehydrate(&self) -> Vec<DehydratedQuery> {
        let entries = self.inner.entries.lock();
        let mut snapshot: Vec<DehydratedQuery> = entries
            .iter()
            .filter_map(|(key, entry)| {
                Some(DehydratedQuery {
                    key: key.clone(),
                    data: entry.data.clone()?,
                    fetched_at: entry.fetched_at?,
                })
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    /// Seed entries from a persisted snapshot without clobbering newer data.
    pub fn hydrate(&self, queries: Vec<DehydratedQuery>) -> usize {
        let now = self.now();
        let mut seeded = 0;
        let mut entries = self.inner.entries.lock();
        for query in queries {
            let entry = entries
                .entry(query.key)
                .or_insert_with(|| self.new_entry(now));
            if entry
                .fetched_at
                .map(|existing| existing >= query.fetched_at)
                .unwrap_or(false)
            {
                continue;
            }
            entry.data = Some(query.data);
            entry.data_seq = self.next_seq();
            entry.fetched_at = Some(query.fetched_at);
            entry.last_used = now;
            if entry.in_flight.is_none() {
                entry.status = QueryStatus::Success;
            }
            entry.touch();
            seeded += 1;
        }
        seeded
    }

    fn entry_for_read<'a>(
        &self,
        entries: &'a mut HashMap<QueryKey, CacheEntry>,
        key: &QueryKey,
        options: &QueryOptions,
        now: DateTime<Utc>,
    ) -> &'a mut CacheEntry {
        if entries.get(key).map(|entry| entry.is_expired(now)).unwrap_or(false) {
            tracing::debug!(%key, "dropping expired query on access");
            entries.remove(key);
        }
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| self.new_entry(now));
        entry.stale_time = options.stale_time;
        entry.gc_time = options.gc_time;
        entry.last_used = now;
        entry
    }

    /// Join the in-flight fetch for `entry` or start a new one. A newly
    /// started fetch is returned a second time so the caller can spawn it
    /// once the lock is released.
    fn attach_or_start(
        &self,
        entry: &mut CacheEntry,
        key: &QueryKey,
        fetcher: Fetcher,
        retry: u32,
    ) -> (SharedFetch, Option<SharedFetch>) {
        if let Some(in_flight) = &entry.in_flight {
            return (in_flight.future.clone(), None);
        }
        let seq = self.next_seq();
        let cache = self.clone();
        let owned_key = key.clone();
        let future = async move {
            let label = owned_key.to_string();
            let result = run_with_retry(RetryPolicy::query(retry), &label, || fetcher()).await;
            cache.resolve(&owned_key, seq, &result);
            result
        }
        .boxed()
        .shared();
        tracing::debug!(%key, seq, "fetching query");
        entry.in_flight = Some(InFlight {
            seq,
            future: future.clone(),
        });
        entry.status = QueryStatus::Fetching;
        entry.touch();
        (future.clone(), Some(future))
    }

    fn resolve(&self, key: &QueryKey, seq: u64, result: &Result<Value, LiftError>) {
        let now = self.now();
        let mut data_changed = false;
        {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                tracing::debug!(%key, seq, "query removed before its fetch resolved");
                return;
            };
            if entry.in_flight.as_ref().map(|f| f.seq) == Some(seq) {
                entry.in_flight = None;
            }
            let superseded = seq < entry.data_seq.max(entry.invalidated_seq);
            match result {
                Ok(value) if !superseded => {
                    entry.data = Some(value.clone());
                    entry.data_seq = seq;
                    entry.fetched_at = Some(now);
                    entry.error = None;
                    if seq > entry.invalidated_seq {
                        entry.invalidated = false;
                    }
                    data_changed = true;
                }
                Err(err) if !superseded => {
                    entry.error = Some(err.clone());
                }
                _ => {
                    tracing::debug!(%key, seq, current = entry.data_seq, "discarding superseded fetch result");
                }
            }
            entry.status = settled_status(entry);
            entry.touch();
        }
        if data_changed {
            self.notify_changed();
        }
    }
}

fn settled_status(entry: &CacheEntry) -> QueryStatus {
    if entry.in_flight.is_some() {
        QueryStatus::Fetching
    } else if entry.error.is_some() {
        QueryStatus::Error
    } else if entry.data.is_some() {
        QueryStatus::Success
    } else {
        QueryStatus::Idle
    }
}

/// A mounted subscriber. Keeps its entry alive and takes part in focus and
/// reconnect revalidation until dropped.
pub struct QueryObserver {
    cache: QueryCache,
    key: QueryKey,
    id: u64,
    receiver: watch::Receiver<u64>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn state<T: DeserializeOwned>(&self) -> QueryState<T> {
        self.cache.peek(&self.key)
    }

    /// Wait for the next change to this entry. Returns `false` once the
    /// entry has been evicted.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.unmount(&self.key, self.id);
    }
}
