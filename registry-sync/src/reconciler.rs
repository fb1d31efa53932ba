//! Periodic mark-and-sweep between the local registry and this cluster's
//! records in the directory. Repairs adds and deletes the ingress path missed.
use crate::config::Identity;
use crate::metrics_defs::{
    RECONCILE_DELETES, RECONCILE_DURATION, RECONCILE_FAILURES, RECONCILE_UPSERTS,
};
use crate::registry::{RegistryClient, RegistryError};
use crate::retry::RetryPolicy;
use crate::store::{DirectoryStore, ServiceFilter, StoreError};
use crate::types::{ServiceRecord, StoreKey};
use shared::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("listing registry services failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("listing directory records failed: {0}")]
    Store(#[from] StoreError),
}

/// Local service id to "still present in the registry", built per pass.
#[derive(Debug, Default, PartialEq)]
pub struct ReconciliationSummary {
    entries: HashMap<String, bool>,
}

impl ReconciliationSummary {
    fn seed<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        ReconciliationSummary {
            entries: ids.into_iter().map(|id| (id.to_string(), false)).collect(),
        }
    }

    /// Marks `id` live. Returns false if the store had no record for it.
    fn mark(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(live) => {
                *live = true;
                true
            }
            None => false,
        }
    }

    fn insert_live(&mut self, id: &str) {
        self.entries.insert(id.to_string(), true);
    }

    pub fn is_live(&self, id: &str) -> Option<bool> {
        self.entries.get(id).copied()
    }

    /// Ids whose registry entry is gone, sorted.
    pub fn stale(&self) -> Vec<&str> {
        let mut stale: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, live)| !**live)
            .map(|(id, _)| id.as_str())
            .collect();
        stale.sort_unstable();
        stale
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct PassReport {
    pub upserted: usize,
    pub deleted: usize,
    /// Set when a detail lookup failed, in which case nothing is deleted.
    pub sweep_skipped: bool,
}

pub struct Reconciler {
    identity: Arc<Identity>,
    store: Arc<dyn DirectoryStore>,
    registry: Arc<dyn RegistryClient>,
    retry: RetryPolicy,
    period: Duration,
}

impl Reconciler {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<dyn DirectoryStore>,
        registry: Arc<dyn RegistryClient>,
        retry: RetryPolicy,
        period: Duration,
    ) -> Self {
        Reconciler {
            identity,
            store,
            registry,
            retry,
            period,
        }
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already synced.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let start = Instant::now();
            match self.reconcile_once().await {
                Ok(report) => {
                    tracing::info!(
                        upserted = report.upserted,
                        deleted = report.deleted,
                        sweep_skipped = report.sweep_skipped,
                        "reconciliation pass finished"
                    );
                }
                Err(e) => {
                    counter!(RECONCILE_FAILURES).increment(1);
                    tracing::error!(error = %e, "reconciliation pass aborted");
                }
            }
            histogram!(RECONCILE_DURATION).record(start.elapsed().as_secs_f64());
        }
    }

    pub async fn reconcile_once(&self) -> Result<PassReport, ReconcileError> {
        let names = self.registry.list_service_names().await?;

        let filter = ServiceFilter::default()
            .name_contains(self.identity.namespace.as_str())
            .owning_cluster(self.identity.cluster.as_str());
        let known = self.store.find_all(&filter).await?;
        let mut summary = ReconciliationSummary::seed(
            known
                .iter()
                .filter(|record| self.identity.sees(&record.name))
                .map(|record| record.id.as_str()),
        );

        let mut report = PassReport::default();
        for name in names.iter().filter(|name| self.identity.sees(name)) {
            let instances = match self.registry.service_detail(name).await {
                Ok(instances) => instances,
                Err(e) => {
                    // Without the full picture a live record could look stale.
                    tracing::warn!(name = %name, error = %e, "service detail lookup failed");
                    report.sweep_skipped = true;
                    continue;
                }
            };

            for record in instances {
                // Propagated registrations belong to their own cluster's pass.
                if !self.identity.is_own_cluster(record.owning_cluster())
                    || !self.identity.sees(&record.name)
                {
                    continue;
                }
                if summary.mark(&record.id) {
                    continue;
                }
                if self.adopt(&record).await {
                    summary.insert_live(&record.id);
                    report.upserted += 1;
                }
            }
        }

        if report.sweep_skipped {
            counter!(RECONCILE_FAILURES).increment(1);
            return Ok(report);
        }

        for id in summary.stale() {
            let key = match self.identity.key_for(id) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(id, error = %e, "cannot address stale record");
                    continue;
                }
            };
            tracing::info!(key = %key, "removing stale record from directory");
            self.retry
                .run_forever("store.delete", || self.store.delete(&key))
                .await;
            counter!(RECONCILE_DELETES).increment(1);
            report.deleted += 1;
        }

        Ok(report)
    }

    /// Writes a registry service the directory does not know about yet.
    async fn adopt(&self, record: &ServiceRecord) -> bool {
        let key: StoreKey = match self.identity.key_for(&record.id) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "skipping unaddressable service");
                return false;
            }
        };

        tracing::info!(key = %key, "adding missing record to directory");
        self.retry
            .run_forever("store.upsert", || self.store.upsert(&key, record))
            .await;
        counter!(RECONCILE_UPSERTS).increment(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::testutils::{FakeRegistry, identity, service};

    fn reconciler(store: Arc<InMemoryStore>, registry: Arc<FakeRegistry>) -> Reconciler {
        Reconciler::new(
            Arc::new(identity()),
            store,
            registry,
            RetryPolicy::forever(Duration::from_secs(2)),
            Duration::from_secs(300),
        )
    }

    async fn seed_store(store: &InMemoryStore, records: &[ServiceRecord]) {
        for record in records {
            let key = StoreKey::new(record.owning_cluster(), record.id.as_str()).unwrap();
            store.upsert(&key, record).await.unwrap();
        }
    }

    #[test]
    fn test_summary_mark_and_stale() {
        let mut summary = ReconciliationSummary::seed(["svc1", "svc3"]);
        assert!(summary.mark("svc1"));
        assert!(!summary.mark("svc2"));
        summary.insert_live("svc2");

        assert_eq!(summary.is_live("svc1"), Some(true));
        assert_eq!(summary.is_live("svc2"), Some(true));
        assert_eq!(summary.stale(), vec!["svc3"]);
    }

    #[tokio::test]
    async fn test_stale_record_is_swept() {
        let store = Arc::new(InMemoryStore::new());
        seed_store(
            &store,
            &[
                service("svc1", "app.tenantA", "clusterX"),
                service("svc3", "db.tenantA", "clusterX"),
            ],
        )
        .await;
        let registry =
            Arc::new(FakeRegistry::new().with_service(service("svc1", "app.tenantA", "clusterX")));

        let report = reconciler(store.clone(), registry.clone())
            .reconcile_once()
            .await
            .unwrap();

        assert_eq!(
            report,
            PassReport {
                upserted: 0,
                deleted: 1,
                sweep_skipped: false
            }
        );
        assert_eq!(store.keys(), vec!["clusterX?svc1".to_string()]);
        // The reconciler repairs the directory only.
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_record_is_added() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(
            FakeRegistry::new()
                .with_service(service("svc1", "app.tenantA", "clusterX"))
                .with_service(service("svc2", "app.tenantA", "clusterX")),
        );

        let report = reconciler(store.clone(), registry)
            .reconcile_once()
            .await
            .unwrap();

        assert_eq!(report.upserted, 2);
        assert_eq!(report.deleted, 0);
        assert_eq!(
            store.keys(),
            vec!["clusterX?svc1".to_string(), "clusterX?svc2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_other_clusters_and_tenants_are_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let foreign = [
            service("svc2", "app.tenantA", "clusterY"),
            service("svc4", "app.tenantB", "clusterX"),
        ];
        seed_store(&store, &foreign).await;
        // svc2 is a propagated registration, svc5 another tenant's service.
        let registry = Arc::new(
            FakeRegistry::new()
                .with_service(service("svc2", "app.tenantA", "clusterY"))
                .with_service(service("svc5", "app.tenantB", "clusterX")),
        );

        let report = reconciler(store.clone(), registry)
            .reconcile_once()
            .await
            .unwrap();

        assert_eq!(report, PassReport::default());
        assert_eq!(
            store.keys(),
            vec!["clusterX?svc4".to_string(), "clusterY?svc2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_registry_failure_aborts_pass() {
        let store = Arc::new(InMemoryStore::new());
        seed_store(&store, &[service("svc1", "app.tenantA", "clusterX")]).await;
        let registry = Arc::new(FakeRegistry::new());
        registry.fail_next(1);

        let err = reconciler(store.clone(), registry)
            .reconcile_once()
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Registry(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_pass() {
        let store = Arc::new(InMemoryStore::new());
        let registry =
            Arc::new(FakeRegistry::new().with_service(service("svc1", "app.tenantA", "clusterX")));
        store.fail_next_operations(1);

        let err = reconciler(store.clone(), registry)
            .reconcile_once()
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Store(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_detail_failure_skips_sweep() {
        let store = Arc::new(InMemoryStore::new());
        seed_store(
            &store,
            &[
                service("svc1", "app.tenantA", "clusterX"),
                service("svc3", "db.tenantA", "clusterX"),
            ],
        )
        .await;
        let registry = Arc::new(
            FakeRegistry::new()
                .with_service(service("svc1", "app.tenantA", "clusterX"))
                .with_service(service("svc3", "db.tenantA", "clusterX"))
                .with_service(service("svc6", "web.tenantA", "clusterX")),
        );
        registry.fail_detail("db.tenantA");

        let report = reconciler(store.clone(), registry)
            .reconcile_once()
            .await
            .unwrap();

        assert!(report.sweep_skipped);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_converges_after_dropped_notifications() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(FakeRegistry::new());
        let reconciler = reconciler(store.clone(), registry.clone());

        // Adds and removes whose ingress notifications never arrived.
        registry.add_service(service("svc1", "app.tenantA", "clusterX"));
        registry.add_service(service("svc2", "db.tenantA", "clusterX"));
        reconciler.reconcile_once().await.unwrap();
        registry.remove_service("svc1");
        registry.add_service(service("svc7", "web.tenantA", "clusterX"));
        reconciler.reconcile_once().await.unwrap();

        assert_eq!(
            store.keys(),
            vec!["clusterX?svc2".to_string(), "clusterX?svc7".to_string()]
        );
        // A further pass is a no-op.
        assert_eq!(
            reconciler.reconcile_once().await.unwrap(),
            PassReport::default()
        );
    }
}
