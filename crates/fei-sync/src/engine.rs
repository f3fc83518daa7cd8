// File: fei-sync/src/engine.rs
// Purpose: Sync orchestration between the remote backend and the local cache

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use crate::api::RemoteApi;
use crate::config::SyncOptions;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ApiError, SyncError, SyncResult};
use crate::freshness::{resolve_freshest, resolve_optional};
use crate::merge::{check_unique, merge_records};
use crate::queue::{OutboundQueue, QueuedMutation};
use crate::record::{
    Carcasse, CarcasseIntermediaire, CollectionName, Entity, Fei, TrackedRecord, User,
};
use crate::store::CacheStore;

/// One unit of work the engine knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    /// Everything, in dependency order
    All,
    /// Push queued local writes
    Outbound,
    /// The actor's own user record
    Profile,
    /// Entities and users related to the actor
    Relations,
    /// Open and closed form buckets (`/fei`, `/fei/done`)
    FeiBuckets,
    /// One collection; entities and users resolve to `Relations`
    Collection(CollectionName),
}

impl SyncTarget {
    /// Steps of `All`: local writes first, then relations before forms
    /// before carcasses before intermediaries
    pub fn steps(self) -> Vec<SyncTarget> {
        match self {
            SyncTarget::All => {
                let mut steps = vec![SyncTarget::Outbound, SyncTarget::Profile, SyncTarget::Relations];
                steps.extend(CollectionName::INCREMENTAL.into_iter().map(SyncTarget::Collection));
                steps
            }
            SyncTarget::Collection(CollectionName::Entities | CollectionName::Users) => {
                vec![SyncTarget::Relations]
            }
            other => vec![other],
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTarget::All => write!(f, "all"),
            SyncTarget::Outbound => write!(f, "outbound"),
            SyncTarget::Profile => write!(f, "profile"),
            SyncTarget::Relations => write!(f, "relations"),
            SyncTarget::FeiBuckets => write!(f, "fei-buckets"),
            SyncTarget::Collection(c) => write!(f, "{c}"),
        }
    }
}

impl std::str::FromStr for SyncTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(SyncTarget::All),
            "outbound" => Ok(SyncTarget::Outbound),
            "profile" => Ok(SyncTarget::Profile),
            "relations" => Ok(SyncTarget::Relations),
            "fei-buckets" => Ok(SyncTarget::FeiBuckets),
            other => other.parse().map(SyncTarget::Collection),
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Records fetched and merged
    Synced {
        fetched: usize,
        kept: usize,
        mark: Option<DateTime<Utc>>,
    },
    /// Queued mutations pushed
    Pushed { pushed: usize, remaining: usize },
    /// Offline: nothing was attempted
    SkippedOffline,
    /// Logged and swallowed; cache and mark untouched
    Failed(String),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

/// What one `sync` call did, step by step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub steps: Vec<(SyncTarget, StepOutcome)>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|(_, outcome)| !outcome.is_failure())
    }

    pub fn skipped_offline(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|(_, outcome)| *outcome == StepOutcome::SkippedOffline)
    }

    pub fn outcome(&self, target: SyncTarget) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(t, _)| *t == target)
            .map(|(_, outcome)| outcome)
    }
}

type InflightStep = Shared<BoxFuture<'static, StepOutcome>>;

struct EngineInner {
    store: CacheStore,
    api: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
    queue: OutboundQueue,
    options: SyncOptions,
    inflight: Mutex<HashMap<SyncTarget, InflightStep>>,
}

/// Coordinates fetch, merge and persistence for every collection.
///
/// Cheap to clone; clones share the same in-flight bookkeeping.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        store: CacheStore,
        api: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
        options: SyncOptions,
    ) -> Self {
        let queue = OutboundQueue::new(store.clone(), options.queue_max);
        Self {
            inner: Arc::new(EngineInner {
                store,
                api,
                monitor,
                queue,
                options,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.inner.monitor
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    /// App start: push what is pending, then refresh everything
    pub async fn on_start(&self) -> SyncReport {
        tracing::info!("sync: app start");
        self.sync(SyncTarget::All).await
    }

    pub async fn on_connectivity_regained(&self) -> SyncReport {
        tracing::info!("sync: connectivity regained");
        self.sync(SyncTarget::All).await
    }

    /// User asked for fresh data: full sync plus the form buckets
    pub async fn on_manual_refresh(&self) -> SyncReport {
        tracing::info!("sync: manual refresh");
        let mut report = self.sync(SyncTarget::All).await;
        report.steps.extend(self.sync(SyncTarget::FeiBuckets).await.steps);
        report
    }

    /// Fire-and-forget variant of [`SyncEngine::sync`]
    pub fn trigger_sync(&self, target: SyncTarget) -> JoinHandle<SyncReport> {
        let engine = self.clone();
        tokio::spawn(async move { engine.sync(target).await })
    }

    /// Run a target's steps in order. Never fails: every error is logged and
    /// reported as a step outcome.
    pub async fn sync(&self, target: SyncTarget) -> SyncReport {
        let mut report = SyncReport::default();
        for step in target.steps() {
            let outcome = self.run_coalesced(step).await;
            report.steps.push((step, outcome));
        }
        report
    }

    /// Call `on_connectivity_regained` once per Offline -> Online transition.
    /// Transitions that happen while a sync runs fold into the next one.
    pub async fn run_connectivity_loop(self) {
        let mut rx = self.inner.monitor.subscribe();
        let mut last_epoch = rx.borrow_and_update().online_epoch;

        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            if state.is_online() && state.online_epoch > last_epoch {
                last_epoch = state.online_epoch;
                self.on_connectivity_regained().await;
            }
        }
    }

    pub fn spawn_connectivity_loop(&self) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_connectivity_loop())
    }

    /// Write a record locally and queue it for the server.
    ///
    /// The record is stamped with the current time. When online a push is
    /// scheduled right away.
    pub async fn save_local<T: TrackedRecord>(&self, mut record: T) -> SyncResult<T> {
        record.set_updated_at(Utc::now());
        let mutation = QueuedMutation::upsert(&record).map_err(|source| SyncError::Decode {
            collection: T::COLLECTION.to_string(),
            source,
        })?;

        // Queue first so a concurrent fetch already sees the key as pending
        self.inner.queue.enqueue(mutation).await;

        let local = record.clone();
        self.inner
            .store
            .merge_into(None, move |items: Vec<T>| Ok(merge_records(items, vec![local])))
            .await?;

        self.schedule_push();
        Ok(record)
    }

    /// Soft-delete a cached record and queue the tombstone.
    ///
    /// Returns `false` when no live record has that key.
    pub async fn delete_local<T: TrackedRecord>(&self, key: &T::Key) -> SyncResult<bool> {
        let Some(mut record) = self
            .inner
            .store
            .collection::<T>()
            .into_iter()
            .find(|r| &r.key() == key)
        else {
            return Ok(false);
        };

        let now = Utc::now();
        record.set_updated_at(now);
        record.set_deleted_at(Some(now));
        let mutation = QueuedMutation::delete(&record).map_err(|source| SyncError::Decode {
            collection: T::COLLECTION.to_string(),
            source,
        })?;

        self.inner.queue.enqueue(mutation).await;
        self.inner
            .store
            .merge_into(None, move |items: Vec<T>| Ok(merge_records(items, vec![record])))
            .await?;

        self.schedule_push();
        Ok(true)
    }

    fn schedule_push(&self) {
        if self.inner.monitor.is_online() {
            drop(self.trigger_sync(SyncTarget::Outbound));
        }
    }

    /// Join an in-flight run of `step` or start one
    async fn run_coalesced(&self, step: SyncTarget) -> StepOutcome {
        let running = {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match inflight.get(&step) {
                Some(running) => {
                    tracing::debug!(%step, "joining in-flight sync");
                    running.clone()
                }
                None => {
                    let engine = self.clone();
                    let task = tokio::spawn(async move {
                        let outcome = engine.run_step(step).await;
                        engine
                            .inner
                            .inflight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&step);
                        outcome
                    });

                    let running = task
                        .map(|joined| {
                            joined.unwrap_or_else(|e| StepOutcome::Failed(format!("sync task aborted: {e}")))
                        })
                        .boxed()
                        .shared();
                    inflight.insert(step, running.clone());
                    running
                }
            }
        };

        running.await
    }

    async fn run_step(&self, step: SyncTarget) -> StepOutcome {
        let result = if self.inner.monitor.is_online() {
            self.execute(step).await
        } else {
            Err(SyncError::Offline)
        };

        match result {
            Ok(outcome) => outcome,
            Err(SyncError::Offline) => {
                tracing::debug!(%step, "offline, sync skipped");
                StepOutcome::SkippedOffline
            }
            Err(e) => {
                tracing::warn!(%step, error = %e, "sync step failed, serving cached data");
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    async fn execute(&self, step: SyncTarget) -> SyncResult<StepOutcome> {
        match step {
            SyncTarget::Outbound => self.replay_outbound().await,
            SyncTarget::Profile => self.sync_profile().await,
            SyncTarget::Relations => self.sync_relations().await,
            SyncTarget::FeiBuckets => self.sync_fei_buckets().await,
            SyncTarget::Collection(CollectionName::Feis) => {
                let (outcome, changed) = self.sync_incremental::<Fei>().await?;
                if self.inner.options.hydrate_feis {
                    self.hydrate_feis(changed).await;
                }
                Ok(outcome)
            }
            SyncTarget::Collection(CollectionName::Carcasses) => {
                Ok(self.sync_incremental::<Carcasse>().await?.0)
            }
            SyncTarget::Collection(CollectionName::CarcassesIntermediaires) => {
                Ok(self.sync_incremental::<CarcasseIntermediaire>().await?.0)
            }
            SyncTarget::Collection(CollectionName::Entities | CollectionName::Users) => {
                self.sync_relations().await
            }
            SyncTarget::All => unreachable!("`All` is expanded by SyncTarget::steps"),
        }
    }

    async fn sync_profile(&self) -> SyncResult<StepOutcome> {
        let remote = self.inner.api.fetch_profile().await?;
        let resolved = resolve_optional(self.inner.store.profile(), Some(remote));

        if let Some(user) = &resolved {
            self.inner.store.set_profile(user).await;
        }

        Ok(StepOutcome::Synced {
            fetched: 1,
            kept: usize::from(resolved.is_some()),
            mark: None,
        })
    }

    async fn sync_relations(&self) -> SyncResult<StepOutcome> {
        let relations = self.inner.api.fetch_relations().await?;
        let fetched = relations.entities.len() + relations.users.len();

        let entities = self.merge_fetched::<Entity>(relations.entities, None).await?;
        let users = self.merge_fetched::<User>(relations.users, None).await?;

        Ok(StepOutcome::Synced {
            fetched,
            kept: entities.kept + users.kept,
            mark: None,
        })
    }

    /// Fetch everything updated after the stored mark and merge it.
    ///
    /// Returns the live keys that changed, for hydration.
    async fn sync_incremental<T: TrackedRecord>(&self) -> SyncResult<(StepOutcome, Vec<T::Key>)> {
        let collection = T::COLLECTION;
        let previous_mark = self.inner.store.mark(collection);

        // Server clock, read before the fetch so nothing updated during the
        // fetch falls behind the next mark
        let server_now = self.inner.api.now().await?;
        let raw = self.inner.api.fetch_since(collection, previous_mark).await?;
        let fetched = decode_items::<T>(collection, raw);

        let fetched_count = fetched.len();
        let changed: Vec<T::Key> = fetched
            .iter()
            .filter(|r| !r.is_deleted())
            .map(TrackedRecord::key)
            .collect();

        let commit = self.merge_fetched(fetched, Some(server_now)).await?;
        tracing::info!(
            %collection,
            fetched = fetched_count,
            kept = commit.kept,
            mark = ?commit.mark,
            "collection synced"
        );

        Ok((
            StepOutcome::Synced {
                fetched: fetched_count,
                kept: commit.kept,
                mark: commit.mark,
            },
            changed,
        ))
    }

    /// Merge a server batch into the cache, keeping local copies of records
    /// with a queued write unless the server copy is newer
    async fn merge_fetched<T: TrackedRecord>(
        &self,
        fetched: Vec<T>,
        mark: Option<DateTime<Utc>>,
    ) -> SyncResult<crate::store::Commit> {
        let collection = T::COLLECTION;
        let pending = self.inner.queue.pending_writes(collection);

        self.inner
            .store
            .merge_into(mark, move |local: Vec<T>| {
                let incoming = protect_pending(&local, fetched, &pending);
                let merged = merge_records(local, incoming);
                check_unique(collection, &merged)?;
                Ok(merged)
            })
            .await
    }

    /// Load full detail of changed forms one at a time, pausing between
    /// items so a large sync does not monopolise the runtime. Failures stop
    /// hydration; the collection mark is already committed.
    async fn hydrate_feis(&self, numeros: Vec<String>) {
        let delay = self.inner.options.hydrate_delay();
        let total = numeros.len();
        let mut hydrated = 0;

        for (i, numero) in numeros.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }

            let detail = match self.inner.api.fetch_fei_detail(numero).await {
                Ok(detail) => detail,
                Err(e) => {
                    tracing::warn!(%numero, error = %e, "fei hydration stopped");
                    break;
                }
            };

            let result = async {
                self.merge_fetched(vec![detail.fei], None).await?;
                self.merge_fetched(detail.carcasses, None).await?;
                self.merge_fetched(detail.carcasses_intermediaires, None).await
            }
            .await;

            if let Err(e) = result {
                tracing::warn!(%numero, error = %e, "fei hydration stopped");
                break;
            }
            hydrated += 1;
        }

        tracing::debug!(hydrated, total, "fei hydration done");
    }

    /// `/fei` and `/fei/done` can return the same form in several buckets;
    /// the freshest copy of each is merged.
    async fn sync_fei_buckets(&self) -> SyncResult<StepOutcome> {
        let buckets = self.inner.api.fetch_fei_buckets().await?;
        let all = buckets.into_all();
        let fetched = all.len();

        let commit = self.merge_fetched::<Fei>(all, None).await?;
        Ok(StepOutcome::Synced {
            fetched,
            kept: commit.kept,
            mark: commit.mark,
        })
    }

    /// Push queued mutations in FIFO order until the queue is empty, the
    /// device goes offline, or a push fails.
    async fn replay_outbound(&self) -> SyncResult<StepOutcome> {
        let queue = &self.inner.queue;
        let mut pushed = 0;

        while let Some(mutation) = queue.front() {
            if !self.inner.monitor.is_online() {
                tracing::debug!(remaining = queue.len(), "went offline during replay");
                break;
            }

            match self.inner.api.push_mutation(&mutation).await {
                Ok(accepted) => {
                    queue.remove(mutation.id).await;
                    pushed += 1;
                    if let Some(item) = accepted.item {
                        // The push stands; the next pull brings the server copy
                        if let Err(e) = self.apply_server_copy(mutation.collection, item).await {
                            tracing::warn!(
                                collection = %mutation.collection,
                                key = %mutation.record_key,
                                error = %e,
                                "could not apply server copy of pushed mutation"
                            );
                        }
                    }
                }
                Err(ApiError::Status { status, message }) if is_permanent_rejection(status) => {
                    tracing::warn!(
                        collection = %mutation.collection,
                        key = %mutation.record_key,
                        status,
                        reason = %message,
                        "server rejected queued mutation, dropping it"
                    );
                    queue.remove(mutation.id).await;
                }
                Err(e) => {
                    tracing::warn!(
                        pushed,
                        remaining = queue.len(),
                        error = %e,
                        "outbound replay interrupted"
                    );
                    return Err(e.into());
                }
            }
        }

        if pushed > 0 {
            tracing::info!(pushed, "outbound mutations pushed");
        }
        Ok(StepOutcome::Pushed {
            pushed,
            remaining: queue.len(),
        })
    }

    async fn apply_server_copy(
        &self,
        collection: CollectionName,
        item: serde_json::Value,
    ) -> SyncResult<()> {
        match collection {
            CollectionName::Entities => self.apply_one::<Entity>(item).await,
            CollectionName::Users => self.apply_one::<User>(item).await,
            CollectionName::Feis => self.apply_one::<Fei>(item).await,
            CollectionName::Carcasses => self.apply_one::<Carcasse>(item).await,
            CollectionName::CarcassesIntermediaires => {
                self.apply_one::<CarcasseIntermediaire>(item).await
            }
        }
    }

    async fn apply_one<T: TrackedRecord>(&self, item: serde_json::Value) -> SyncResult<()> {
        let record: T = serde_json::from_value(item).map_err(|source| SyncError::Decode {
            collection: T::COLLECTION.to_string(),
            source,
        })?;
        self.merge_fetched(vec![record], None).await?;
        Ok(())
    }
}

/// 4xx other than timeout / rate limiting will never succeed on retry
fn is_permanent_rejection(status: u16) -> bool {
    (400..500).contains(&status) && status != 408 && status != 429
}

/// Decode a fetched batch item by item. A record that does not decode is
/// logged and skipped so it cannot hold the collection mark back forever.
fn decode_items<T: TrackedRecord>(collection: CollectionName, raw: Vec<serde_json::Value>) -> Vec<T> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(%collection, index, error = %e, "skipping undecodable record");
                None
            }
        })
        .collect()
}

/// For keys with a queued local write, keep whichever of the local and
/// server copies is fresher.
///
/// A queued delete has no cached copy left (the tombstone was consumed), so
/// the local side falls back to the queued payload. When that tombstone wins
/// it goes into the merge and removes the key again.
fn protect_pending<T: TrackedRecord>(
    local: &[T],
    fetched: Vec<T>,
    pending: &HashMap<String, QueuedMutation>,
) -> Vec<T> {
    if pending.is_empty() {
        return fetched;
    }

    fetched
        .into_iter()
        .map(|remote| {
            let key = remote.key();
            let Some(mutation) = pending.get(&key.to_string()) else {
                return remote;
            };
            let mine = local
                .iter()
                .find(|l| l.key() == key)
                .cloned()
                .or_else(|| OutboundQueue::decode_payload::<T>(mutation));
            match mine {
                Some(mine) => resolve_freshest(mine, remote),
                None => remote,
            }
        })
        .collect()
}
