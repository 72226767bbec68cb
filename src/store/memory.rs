use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{Record, Store};
use crate::errors::StoreError;

/// In-process store. Ordered so prefix listings come back sorted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let version = records.get(key).map(|r| r.version + 1).unwrap_or(1);
        records.insert(key.to_string(), Record { version, value });
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let actual = records.get(key).map(|r| r.version);
        if actual != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        let version = actual.map(|v| v + 1).unwrap_or(1);
        records.insert(key.to_string(), Record { version, value });
        Ok(version)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_increments_version() {
        let store = MemoryStore::new();
        assert_eq!(store.put("a", json!(1)).await.unwrap(), 1);
        assert_eq!(store.put("a", json!(2)).await.unwrap(), 2);
        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.value, json!(2));
    }

    #[tokio::test]
    async fn test_compare_and_swap_create_only() {
        let store = MemoryStore::new();
        assert_eq!(store.compare_and_swap("k", None, json!("x")).await.unwrap(), 1);

        let err = store
            .compare_and_swap("k", None, json!("y"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: None, actual: Some(1), .. }
        ));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!("x"));
    }

    #[tokio::test]
    async fn test_compare_and_swap_stale_version_rejected() {
        let store = MemoryStore::new();
        store.put("k", json!(1)).await.unwrap();
        store.put("k", json!(2)).await.unwrap();

        assert!(store.compare_and_swap("k", Some(1), json!(3)).await.is_err());
        assert_eq!(store.compare_and_swap("k", Some(2), json!(3)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_list_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put("result/s1/02/0001", json!(2)).await.unwrap();
        store.put("result/s1/01/0001", json!(1)).await.unwrap();
        store.put("result/s2/01/0001", json!(3)).await.unwrap();
        store.put("session/s1", json!({})).await.unwrap();

        let listed = store.list_prefix("result/s1/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["result/s1/01/0001", "result/s1/02/0001"]);
        assert_eq!(store.len().await, 4);
    }
}
