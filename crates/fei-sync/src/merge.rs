// File: fei-sync/src/merge.rs
// Purpose: Reconcile a cached collection with a fresh server batch

use std::collections::HashSet;
use std::hash::Hash;

use crate::error::{SyncError, SyncResult};
use crate::freshness::collapse_freshest;
use crate::record::{CollectionName, TrackedRecord};

/// Merge a stale local collection with a fresh batch from the server.
///
/// - a key present in `new_items` is taken from `new_items` outright
/// - tombstones in `new_items` are consumed and never appear in the output
/// - old live records the batch did not mention are kept unchanged
///
/// Output is the retained old records followed by the live new ones.
pub fn merge_items<T, K, F>(old_items: Vec<T>, new_items: Vec<T>, key_fn: F) -> Vec<T>
where
    T: TrackedRecord,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let new_items = collapse_freshest(new_items, &key_fn);
    let new_keys: HashSet<K> = new_items.iter().map(&key_fn).collect();

    let mut merged: Vec<T> = old_items
        .into_iter()
        .filter(|item| !item.is_deleted() && !new_keys.contains(&key_fn(item)))
        .collect();
    merged.extend(new_items.into_iter().filter(|item| !item.is_deleted()));

    debug_assert!(
        has_unique_keys(&merged, &key_fn),
        "merge produced a duplicate identity key"
    );
    merged
}

/// [`merge_items`] keyed by the record's own identity key
pub fn merge_records<T: TrackedRecord>(old_items: Vec<T>, new_items: Vec<T>) -> Vec<T> {
    merge_items(old_items, new_items, T::key)
}

fn has_unique_keys<T, K, F>(items: &[T], key_fn: F) -> bool
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::with_capacity(items.len());
    items.iter().all(|item| seen.insert(key_fn(item)))
}

/// Fail with [`SyncError::MergeInvariant`] if two records share a key
pub fn check_unique<T: TrackedRecord>(collection: CollectionName, items: &[T]) -> SyncResult<()> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        let key = item.key();
        if !seen.insert(key.clone()) {
            return Err(SyncError::MergeInvariant {
                collection,
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Carcasse, Fei};
    use crate::test_support::{carcasse, deleted, fei};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn by_key(items: &[Fei]) -> BTreeMap<String, String> {
        items
            .iter()
            .map(|f| (f.numero.clone(), f.updated_at.to_rfc3339()))
            .collect()
    }

    #[test]
    fn test_new_copy_replaces_old_and_untouched_old_is_kept() {
        let old = vec![fei("A", "2024-01-01T00:00:00Z"), fei("B", "2024-01-01T00:00:00Z")];
        let new = vec![fei("A", "2024-01-02T00:00:00Z")];

        let merged = merge_records(old, new);

        assert_eq!(
            by_key(&merged),
            BTreeMap::from([
                ("A".to_string(), "2024-01-02T00:00:00+00:00".to_string()),
                ("B".to_string(), "2024-01-01T00:00:00+00:00".to_string()),
            ])
        );
    }

    #[test]
    fn test_tombstone_removes_live_local_copy() {
        let old = vec![fei("A", "2024-01-01T00:00:00Z")];
        let new = vec![deleted(fei("A", "2024-01-02T00:00:00Z"), "2024-01-01T00:00:00Z")];

        assert!(merge_records(old, new).is_empty());
    }

    #[test]
    fn test_old_tombstones_are_dropped() {
        let old = vec![deleted(fei("A", "2024-01-01T00:00:00Z"), "2024-01-01T00:00:00Z")];

        assert!(merge_records(old, Vec::new()).is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let old = vec![fei("A", "2024-01-01T00:00:00Z"), fei("B", "2024-01-01T00:00:00Z")];
        let new = vec![
            fei("A", "2024-01-02T00:00:00Z"),
            deleted(fei("B", "2024-01-02T00:00:00Z"), "2024-01-02T00:00:00Z"),
            fei("C", "2024-01-02T00:00:00Z"),
        ];

        let once = merge_records(old, new.clone());
        let twice = merge_records(once.clone(), new);

        assert_eq!(by_key(&once), by_key(&twice));
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn test_duplicate_keys_in_batch_collapse_to_freshest() {
        let new = vec![
            fei("A", "2024-01-03T00:00:00Z"),
            fei("A", "2024-01-02T00:00:00Z"),
        ];

        let merged = merge_records(Vec::new(), new);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].updated_at.to_rfc3339(), "2024-01-03T00:00:00+00:00");
        assert!(check_unique(CollectionName::Feis, &merged).is_ok());
    }

    #[test]
    fn test_composite_key_merge() {
        let old = vec![
            carcasse("F1", "B1", "2024-01-01T00:00:00Z"),
            carcasse("F1", "B2", "2024-01-01T00:00:00Z"),
        ];
        let new = vec![carcasse("F2", "B1", "2024-01-02T00:00:00Z")];

        let merged: Vec<Carcasse> = merge_records(old, new);

        assert_eq!(merged.len(), 3);
        assert!(check_unique(CollectionName::Carcasses, &merged).is_ok());
    }

    #[test]
    fn test_custom_key_selector() {
        let old = vec![carcasse("F1", "B1", "2024-01-01T00:00:00Z")];
        let mut replacement = carcasse("F9", "B9", "2024-01-02T00:00:00Z");
        replacement.zacharie_carcasse_id = old[0].zacharie_carcasse_id.clone();

        let merged = merge_items(old, vec![replacement], |c: &Carcasse| {
            c.zacharie_carcasse_id.clone()
        });

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].fei_numero, "F9");
    }

    #[test]
    fn test_check_unique_reports_duplicate() {
        let items = vec![fei("A", "2024-01-01T00:00:00Z"), fei("A", "2024-01-02T00:00:00Z")];

        let err = check_unique(CollectionName::Feis, &items).unwrap_err();
        assert!(matches!(
            err,
            SyncError::MergeInvariant { collection: CollectionName::Feis, ref key } if key == "A"
        ));
    }
}
