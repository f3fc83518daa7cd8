// File: fei-sync/src/freshness.rs
// Purpose: Whole-record last-writer-wins between two versions of one record

use std::collections::HashMap;

use crate::record::TrackedRecord;

/// Pick the more recently updated of two versions of the same record.
///
/// The strictly later `updated_at` wins in full, no field is carried over
/// from the loser. On a tie the remote (server) copy wins.
pub fn resolve_freshest<T: TrackedRecord>(local: T, remote: T) -> T {
    if local.updated_at() > remote.updated_at() {
        local
    } else {
        remote
    }
}

/// Same as [`resolve_freshest`] for optional sides, e.g. a profile that
/// may not be cached yet.
pub fn resolve_optional<T: TrackedRecord>(local: Option<T>, remote: Option<T>) -> Option<T> {
    match (local, remote) {
        (Some(local), Some(remote)) => Some(resolve_freshest(local, remote)),
        (local, None) => local,
        (None, remote) => remote,
    }
}

/// Collapse a batch that may hold the same key several times (overlapping
/// query buckets) into one record per key. First-seen order is kept.
pub fn collapse_freshest<T, K, F>(items: Vec<T>, key_fn: F) -> Vec<T>
where
    T: TrackedRecord,
    K: Eq + std::hash::Hash,
    F: Fn(&T) -> K,
{
    let mut slots: HashMap<K, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<Option<T>> = Vec::with_capacity(items.len());

    for item in items {
        let key = key_fn(&item);
        match slots.get(&key) {
            Some(&idx) => {
                if let Some(current) = out[idx].take() {
                    out[idx] = Some(resolve_freshest(current, item));
                }
            }
            None => {
                slots.insert(key, out.len());
                out.push(Some(item));
            }
        }
    }

    out.into_iter().flatten().collect()
}
