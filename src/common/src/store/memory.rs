use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{ErrorResult, IndexEntry, ListPage, MetadataStore, StoreError, StoreResult};

/// In-process index service.
///
/// Indexes are created on first write. Listing an unknown index yields an empty
/// page, matching the service's behaviour for an index without keys. Pages are
/// returned in key order with the last key of a page as its continuation marker.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    indexes: RwLock<HashMap<String, BTreeMap<String, String>>>,
    unavailable: RwLock<HashSet<String>>,
    mutations: AtomicUsize,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request against `index_id` fail with a 503 until cleared.
    pub fn set_unavailable(&self, index_id: &str, unavailable: bool) {
        let mut set = self.unavailable.write().unwrap_or_else(|e| e.into_inner());
        if unavailable {
            set.insert(index_id.to_string());
        } else {
            set.remove(index_id);
        }
    }

    /// Number of successful puts and deletes since creation.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Snapshot of an index, empty when it does not exist.
    pub fn snapshot(&self, index_id: &str) -> BTreeMap<String, String> {
        self.indexes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(index_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Seed an index without counting the writes as mutations.
    pub fn insert(&self, index_id: &str, key: &str, value: &str) {
        self.indexes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(index_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    fn check_available(&self, index_id: &str) -> StoreResult<()> {
        let unavailable = self.unavailable.read().unwrap_or_else(|e| e.into_inner());
        if unavailable.contains(index_id) {
            return Err(StoreError::unavailable(
                index_id,
                ErrorResult::new(503, "Service Unavailable", "index is unavailable"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, index_id: &str, key: &str) -> StoreResult<Option<String>> {
        self.check_available(index_id)?;
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        Ok(indexes.get(index_id).and_then(|index| index.get(key).cloned()))
    }

    async fn put(&self, index_id: &str, key: &str, value: &str) -> StoreResult<()> {
        self.check_available(index_id)?;
        self.insert(index_id, key, value);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, index_id: &str, key: &str) -> StoreResult<bool> {
        self.check_available(index_id)?;
        let mut indexes = self.indexes.write().unwrap_or_else(|e| e.into_inner());
        let existed = indexes
            .get_mut(index_id)
            .is_some_and(|index| index.remove(key).is_some());
        if existed {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(existed)
    }

    async fn list(
        &self,
        index_id: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ListPage> {
        self.check_available(index_id)?;
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        let Some(index) = indexes.get(index_id) else {
            return Ok(ListPage::default());
        };

        let lower = match marker {
            Some(m) => Bound::Excluded(m.to_string()),
            None => Bound::Unbounded,
        };
        let mut range = index.range((lower, Bound::Unbounded));

        let max_keys = max_keys.max(1);
        let entries: Vec<IndexEntry> = range
            .by_ref()
            .take(max_keys)
            .map(|(k, v)| IndexEntry::new(k.clone(), v.clone()))
            .collect();
        let is_truncated = range.next().is_some();
        let next_marker = if is_truncated {
            entries.last().map(|e| e.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            entries,
            is_truncated,
            next_marker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::list_all;

    #[tokio::test]
    async fn test_get_put_delete() {
        let store = InMemoryMetadataStore::new();

        assert_eq!(store.get("idx", "k").await.unwrap(), None);
        store.put("idx", "k", "v").await.unwrap();
        assert_eq!(store.get("idx", "k").await.unwrap().as_deref(), Some("v"));

        assert!(store.delete("idx", "k").await.unwrap());
        assert!(!store.delete("idx", "k").await.unwrap());
        assert_eq!(store.mutation_count(), 2);
    }

    #[tokio::test]
    async fn test_pagination_uses_last_key_as_marker() {
        let store = InMemoryMetadataStore::new();
        for key in ["a", "b", "c", "d", "e"] {
            store.insert("idx", key, "v");
        }

        let first = store.list("idx", None, 2).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.is_truncated);
        assert_eq!(first.next_marker.as_deref(), Some("b"));

        let second = store.list("idx", Some("b"), 2).await.unwrap();
        assert_eq!(second.entries[0].key, "c");

        let last = store.list("idx", Some("d"), 2).await.unwrap();
        assert_eq!(last.entries.len(), 1);
        assert!(!last.is_truncated);
        assert!(last.next_marker.is_none());

        let all = list_all(&store, "idx", 2).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_index_lists_empty() {
        let store = InMemoryMetadataStore::new();
        let page = store.list("missing", None, 10).await.unwrap();
        assert_eq!(page, ListPage::default());
    }

    #[tokio::test]
    async fn test_unavailable_index_fails_every_operation() {
        let store = InMemoryMetadataStore::new();
        store.insert("idx", "k", "v");
        store.set_unavailable("idx", true);

        assert!(store.get("idx", "k").await.is_err());
        assert!(store.put("idx", "k", "v2").await.is_err());
        assert!(store.delete("idx", "k").await.is_err());
        assert!(matches!(
            store.list("idx", None, 10).await,
            Err(StoreError::IndexUnavailable { .. })
        ));
        assert_eq!(store.mutation_count(), 0);

        store.set_unavailable("idx", false);
        assert_eq!(store.get("idx", "k").await.unwrap().as_deref(), Some("v"));
    }
}
