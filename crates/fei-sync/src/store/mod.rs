//! Local cache store
//!
//! Durable key-value persistence for every tracked collection, the cached
//! profile, the high-water marks and the outbound queue.
//!
//! Reads are synchronous and served from an in-memory snapshot. Writes are
//! serialized through one async lock: the new value is published in memory,
//! subscribers are notified, then the value is persisted to the backend.
//! A backend failure is logged and the store keeps running memory-only for
//! the rest of the session.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use crate::config::StoreBackend;
use crate::error::{SyncError, SyncResult};
use crate::record::{CollectionName, TrackedRecord, User};

pub mod filesystem;
pub mod memory;
pub mod sqlite;

pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Store key of the cached user profile
pub const PROFILE_KEY: &str = "profile";

/// Store key of the outbound mutation queue
pub const OUTBOUND_QUEUE_KEY: &str = "outbound_queue";

/// Trait for durable storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get a stored value by key
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value
    async fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Delete a stored value
    async fn delete(&self, key: &str) -> Result<()>;

    /// Get all stored keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Get storage backend name
    fn name(&self) -> &'static str;
}

/// Create a storage backend from config
pub async fn open_storage(backend: &StoreBackend) -> Result<Arc<dyn Storage>> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StoreBackend::Filesystem { path } => {
            Ok(Arc::new(FilesystemStorage::new(path.clone()).await?))
        }
        StoreBackend::Sqlite { path } => Ok(Arc::new(SqliteStorage::open(path).await?)),
    }
}

/// Immutable view of every key at one revision
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    values: HashMap<String, Arc<Value>>,
    revision: u64,
}

impl StoreState {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|v| v.as_ref())
    }

    /// Decode a value, `None` when absent or not decodable
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(key, error = %e, "cached value could not be decoded");
                None
            }
        }
    }

    /// Bumped once per completed write
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// What a [`CacheStore::merge_into`] call wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    /// Records in the collection after the merge
    pub kept: usize,
    /// Stored high-water mark after the merge
    pub mark: Option<DateTime<Utc>>,
}

/// Notification sent after each write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub keys: Vec<String>,
    pub revision: u64,
}

struct StoreInner {
    storage: Arc<dyn Storage>,
    state: RwLock<Arc<StoreState>>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
    degraded: AtomicBool,
}

/// Shared handle to the local cache; clones point at the same store
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Open the store and load everything the backend already holds.
    ///
    /// A backend that cannot be read is logged and the store starts empty.
    pub async fn open(storage: Arc<dyn Storage>) -> Self {
        let mut values = HashMap::new();

        match storage.keys().await {
            Ok(keys) => {
                for key in keys {
                    match storage.get(&key).await {
                        Ok(Some(value)) => {
                            values.insert(key, Arc::new(value));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(backend = storage.name(), key, error = %e, "failed to load cached key");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(backend = storage.name(), error = %e, "failed to list cached keys, starting empty");
            }
        }

        tracing::debug!(backend = storage.name(), keys = values.len(), "cache store opened");
        Self::with_state(storage, StoreState { values, revision: 0 })
    }

    /// Open the backend described by config
    pub async fn from_backend(backend: &StoreBackend) -> Result<Self> {
        let storage = open_storage(backend).await?;
        Ok(Self::open(storage).await)
    }

    /// Memory-only store, mostly for tests
    pub fn in_memory() -> Self {
        Self::with_state(Arc::new(MemoryStorage::new()), StoreState::default())
    }

    fn with_state(storage: Arc<dyn Storage>, state: StoreState) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(StoreInner {
                storage,
                state: RwLock::new(Arc::new(state)),
                write_lock: Mutex::new(()),
                events,
                degraded: AtomicBool::new(false),
            }),
        }
    }

    /// Synchronous snapshot of the whole store
    pub fn get_state(&self) -> Arc<StoreState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_state().decode(key)
    }

    /// True once a persistence write has failed this session
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.storage.name()
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.write(vec![(key.to_string(), Some(value))]).await,
            Err(e) => tracing::error!(key, error = %e, "value could not be serialized, write dropped"),
        }
    }

    pub async fn delete(&self, key: &str) {
        self.write(vec![(key.to_string(), None)]).await;
    }

    /// Read-modify-write of one key while holding the writer lock
    pub async fn update<T, F>(&self, key: &str, f: F) -> T
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let _guard = self.inner.write_lock.lock().await;
        let mut value: T = self.get(key).unwrap_or_default();
        f(&mut value);
        match serde_json::to_value(&value) {
            Ok(json) => self.write_locked(vec![(key.to_string(), Some(json))]).await,
            Err(e) => tracing::error!(key, error = %e, "value could not be serialized, write dropped"),
        }
        value
    }

    /// Raw change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Change notifications as a stream; lagged events are skipped
    pub fn changes(&self) -> impl Stream<Item = StoreEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move { event.ok() })
    }

    /// Reactive read: yields the selected value now and again every time a
    /// write changes it.
    pub fn select<T, F>(&self, selector: F) -> impl Stream<Item = T> + Send + 'static
    where
        T: PartialEq + Clone + Send + 'static,
        F: Fn(&StoreState) -> T + Send + Sync + 'static,
    {
        let store = self.clone();
        let selector = Arc::new(selector);
        let rx = self.subscribe();

        stream::unfold((rx, None::<T>), move |(mut rx, last)| {
            let store = store.clone();
            let selector = selector.clone();
            async move {
                loop {
                    let value = selector(&store.get_state());
                    if last.as_ref() != Some(&value) {
                        return Some((value.clone(), (rx, Some(value))));
                    }
                    match rx.recv().await {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
    }

    /// Cached records of a collection
    pub fn collection<T: TrackedRecord>(&self) -> Vec<T> {
        self.get(&T::COLLECTION.store_key()).unwrap_or_default()
    }

    /// High-water mark of a collection
    pub fn mark(&self, collection: CollectionName) -> Option<DateTime<Utc>> {
        self.get(&collection.mark_key())
    }

    pub fn profile(&self) -> Option<User> {
        self.get(PROFILE_KEY)
    }

    pub async fn set_profile(&self, user: &User) {
        self.set(PROFILE_KEY, user).await;
    }

    pub async fn set_collection<T: TrackedRecord>(&self, items: &[T]) {
        self.set(&T::COLLECTION.store_key(), &items).await;
    }

    /// Merge into a cached collection and optionally advance its mark, all
    /// under the writer lock so no other write can interleave.
    ///
    /// `merge` receives the current records and returns the new ones; an
    /// error leaves the store untouched. The stored mark never moves
    /// backwards.
    pub async fn merge_into<T, F>(&self, mark: Option<DateTime<Utc>>, merge: F) -> SyncResult<Commit>
    where
        T: TrackedRecord,
        F: FnOnce(Vec<T>) -> SyncResult<Vec<T>>,
    {
        let collection = T::COLLECTION;
        let _guard = self.inner.write_lock.lock().await;

        let merged = merge(self.collection::<T>())?;
        let items_json = serde_json::to_value(&merged).map_err(|source| SyncError::Decode {
            collection: collection.to_string(),
            source,
        })?;
        let mut changes = vec![(collection.store_key(), Some(items_json))];

        let current_mark = self.mark(collection);
        let mark = match (current_mark, mark) {
            (Some(current), Some(proposed)) if current > proposed => {
                tracing::warn!(%collection, %current, %proposed, "refusing to move high-water mark backwards");
                Some(current)
            }
            (_, Some(proposed)) => {
                let mark_json = serde_json::to_value(proposed).map_err(|source| SyncError::Decode {
                    collection: collection.to_string(),
                    source,
                })?;
                changes.push((collection.mark_key(), Some(mark_json)));
                Some(proposed)
            }
            (current, None) => current,
        };

        self.write_locked(changes).await;
        Ok(Commit {
            kept: merged.len(),
            mark,
        })
    }

    async fn write(&self, changes: Vec<(String, Option<Value>)>) {
        let _guard = self.inner.write_lock.lock().await;
        self.write_locked(changes).await;
    }

    /// Caller holds `write_lock`
    async fn write_locked(&self, changes: Vec<(String, Option<Value>)>) {
        if changes.is_empty() {
            return;
        }

        let event = {
            let mut guard = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = StoreState::clone(&guard);
            for (key, value) in &changes {
                match value {
                    Some(value) => {
                        next.values.insert(key.clone(), Arc::new(value.clone()));
                    }
                    None => {
                        next.values.remove(key);
                    }
                }
            }
            next.revision += 1;
            let event = StoreEvent {
                keys: changes.iter().map(|(k, _)| k.clone()).collect(),
                revision: next.revision,
            };
            *guard = Arc::new(next);
            event
        };

        // No receivers is fine
        let _ = self.inner.events.send(event);

        self.persist(changes).await;
    }

    async fn persist(&self, changes: Vec<(String, Option<Value>)>) {
        if self.is_degraded() {
            return;
        }

        for (key, value) in changes {
            let result = match &value {
                Some(value) => self.inner.storage.set(&key, value).await,
                None => self.inner.storage.delete(&key).await,
            };

            if let Err(e) = result {
                tracing::warn!(
                    backend = self.inner.storage.name(),
                    key,
                    error = %e,
                    "persistence failed, continuing in memory only"
                );
                self.inner.degraded.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}
