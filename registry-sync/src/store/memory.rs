// In-process directory for local development and tests. It mirrors the
// semantics of the shared store: keyed upserts, idempotent deletes and a
// change feed delivered in commit order.
use super::{
    ChangeEvent, ChangeOperation, ChangeStream, DirectoryStore, ServiceFilter, StoreError,
};
use crate::types::{ServiceDocument, ServiceRecord, StoreKey};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const FEED_CAPACITY: usize = 1024;

pub struct InMemoryStore {
    records: Mutex<BTreeMap<StoreKey, ServiceDocument>>,
    feed: broadcast::Sender<ChangeEvent>,
    failing_writes: AtomicU32,
    failing_watches: AtomicU32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        InMemoryStore {
            records: Mutex::new(BTreeMap::new()),
            feed,
            failing_writes: AtomicU32::new(0),
            failing_watches: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` reads and writes fail as if the store was down.
    pub fn fail_next_operations(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` attempts to open a change feed fail.
    pub fn fail_next_watches(&self, count: u32) {
        self.failing_watches.store(count, Ordering::SeqCst);
    }

    /// Ends every open change feed, as a store failover would.
    pub fn close_feeds(&self) {
        let _ = self.feed.send(ChangeEvent {
            operation: ChangeOperation::Admin("invalidate".into()),
            key: None,
            document: None,
        });
    }

    /// Number of change feeds currently open.
    pub fn watchers(&self) -> usize {
        self.feed.receiver_count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.lock().keys().map(|k| k.to_string()).collect()
    }

    fn check_available(counter: &AtomicU32) -> Result<(), StoreError> {
        let failed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn publish(&self, operation: ChangeOperation, key: &StoreKey, doc: Option<&ServiceDocument>) {
        let document = doc.and_then(|d| serde_json::to_value(d).ok());
        // No receivers is fine: nobody is watching yet.
        let _ = self.feed.send(ChangeEvent {
            operation,
            key: Some(key.to_string()),
            document,
        });
    }
}

#[async_trait]
impl DirectoryStore for InMemoryStore {
    async fn upsert(&self, key: &StoreKey, record: &ServiceRecord) -> Result<(), StoreError> {
        Self::check_available(&self.failing_writes)?;

        let doc = ServiceDocument::new(key, record);
        // Publish while holding the lock so feed order equals commit order.
        let mut records = self.records.lock();
        let operation = match records.insert(key.clone(), doc.clone()) {
            None => ChangeOperation::Insert,
            Some(_) => ChangeOperation::Replace,
        };
        self.publish(operation, key, Some(&doc));
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        Self::check_available(&self.failing_writes)?;

        let mut records = self.records.lock();
        if records.remove(key).is_some() {
            self.publish(ChangeOperation::Delete, key, None);
        }
        Ok(())
    }

    async fn find_one(&self, key: &StoreKey) -> Result<Option<ServiceRecord>, StoreError> {
        Self::check_available(&self.failing_writes)?;

        Ok(self.records.lock().get(key).cloned().map(ServiceRecord::from))
    }

    async fn find_all(&self, filter: &ServiceFilter) -> Result<Vec<ServiceRecord>, StoreError> {
        Self::check_available(&self.failing_writes)?;

        Ok(self
            .records
            .lock()
            .values()
            .cloned()
            .map(ServiceRecord::from)
            .filter(|record| filter.matches(record))
            .collect())
    }

    async fn watch_changes(&self) -> Result<ChangeStream, StoreError> {
        Self::check_available(&self.failing_watches)?;

        let rx = self.feed.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) if event.operation == ChangeOperation::Admin("invalidate".into()) => {
                    None
                }
                Ok(event) => Some((Ok(event), rx)),
                Err(RecvError::Lagged(skipped)) => Some((Err(StoreError::FeedLagged(skipped)), rx)),
                Err(RecvError::Closed) => None,
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str, cluster: &str, address: &str) -> ServiceRecord {
        ServiceRecord::new(id, name, address, cluster, "pod-1")
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryStore::new();
        let key = StoreKey::new("clusterX", "svc1").unwrap();

        store
            .upsert(&key, &record("svc1", "app.tenantA", "clusterX", "10.0.0.1"))
            .await
            .unwrap();
        store
            .upsert(&key, &record("svc1", "app.tenantA", "clusterX", "10.0.0.2"))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let found = store.find_one(&key).await.unwrap().unwrap();
        assert_eq!(found.address, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_same_local_id_in_two_clusters() {
        let store = InMemoryStore::new();
        let a = StoreKey::new("clusterA", "svc1").unwrap();
        let b = StoreKey::new("clusterB", "svc1").unwrap();

        store.upsert(&a, &record("svc1", "app.t", "clusterA", "a")).await.unwrap();
        store.upsert(&b, &record("svc1", "app.t", "clusterB", "b")).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.find_one(&a).await.unwrap().unwrap().address, "a");
        assert_eq!(store.find_one(&b).await.unwrap().unwrap().address, "b");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryStore::new();
        let key = StoreKey::new("clusterX", "svc1").unwrap();
        store.upsert(&key, &record("svc1", "app.t", "clusterX", "a")).await.unwrap();

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_find_all_filters() {
        let store = InMemoryStore::new();
        for (cluster, id, name) in [
            ("clusterX", "svc1", "app.tenantA"),
            ("clusterY", "svc2", "app.tenantA"),
            ("clusterX", "svc3", "app.tenantB"),
        ] {
            let key = StoreKey::new(cluster, id).unwrap();
            store.upsert(&key, &record(id, name, cluster, "a")).await.unwrap();
        }

        let tenant = ServiceFilter::default().name_contains("tenantA");
        assert_eq!(store.find_all(&tenant).await.unwrap().len(), 2);

        let own = tenant.owning_cluster("clusterX");
        let found = store.find_all(&own).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "svc1");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryStore::new();
        let key = StoreKey::new("clusterX", "svc1").unwrap();
        let rec = record("svc1", "app.t", "clusterX", "a");

        store.fail_next_operations(2);
        assert!(store.upsert(&key, &rec).await.is_err());
        assert!(store.upsert(&key, &rec).await.is_err());
        assert!(store.upsert(&key, &rec).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_feed_order() {
        let store = InMemoryStore::new();
        let mut feed = store.watch_changes().await.unwrap();
        let key = StoreKey::new("clusterY", "svc2").unwrap();
        let rec = record("svc2", "app.tenantA", "clusterY", "a");

        store.upsert(&key, &rec).await.unwrap();
        store.upsert(&key, &rec).await.unwrap();
        store.delete(&key).await.unwrap();
        // Deleting again produces no event.
        store.delete(&key).await.unwrap();
        store.close_feeds();

        let mut operations = Vec::new();
        while let Some(event) = feed.next().await {
            let event = event.unwrap();
            assert_eq!(event.key.as_deref(), Some("clusterY?svc2"));
            operations.push(event.operation);
        }
        assert_eq!(
            operations,
            vec![
                ChangeOperation::Insert,
                ChangeOperation::Replace,
                ChangeOperation::Delete
            ]
        );
    }
}
