//! Mirrors services owned by other clusters of this tenant into the local
//! registry by following the directory's change feed.
use crate::config::Identity;
use crate::metrics_defs::{FEED_EVENTS_APPLIED, FEED_EVENTS_SKIPPED, FEED_RECONNECTS};
use crate::registry::RegistryClient;
use crate::retry::{RetryExhausted, RetryPolicy};
use crate::store::{ChangeEvent, ChangeOperation, DirectoryStore, ServiceFilter, StoreError};
use crate::types::{ServiceDocument, ServiceRecord, StoreKey};
use futures::StreamExt;
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(thiserror::Error, Debug)]
pub enum PropagatorError {
    #[error("change feed unavailable: {0}")]
    FeedUnavailable(#[from] RetryExhausted<StoreError>),
}

#[derive(Debug, PartialEq)]
enum FeedAction {
    Register(StoreKey, ServiceRecord),
    Deregister(StoreKey),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum SkipReason {
    Admin,
    InvalidKey,
    OwnCluster,
    MissingDocument,
    Decode,
    ForeignTenant,
    Untracked,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Admin => "admin",
            SkipReason::InvalidKey => "invalid_key",
            SkipReason::OwnCluster => "own_cluster",
            SkipReason::MissingDocument => "missing_document",
            SkipReason::Decode => "decode",
            SkipReason::ForeignTenant => "foreign_tenant",
            SkipReason::Untracked => "untracked",
        }
    }
}

pub struct ChangeFeedPropagator {
    identity: Arc<Identity>,
    store: Arc<dyn DirectoryStore>,
    registry: Arc<dyn RegistryClient>,
    reconnect: RetryPolicy,
    retry: RetryPolicy,
    // Keys registered locally by this propagator. Delete events carry no
    // document, so this is how a delete is known to concern our tenant.
    propagated: Mutex<HashSet<StoreKey>>,
    ready: AtomicBool,
}

impl ChangeFeedPropagator {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<dyn DirectoryStore>,
        registry: Arc<dyn RegistryClient>,
        reconnect: RetryPolicy,
        retry: RetryPolicy,
    ) -> Self {
        ChangeFeedPropagator {
            identity,
            store,
            registry,
            reconnect,
            retry,
            propagated: Mutex::new(HashSet::new()),
            ready: AtomicBool::new(false),
        }
    }

    /// True once the feed is open and the directory was resynced after
    /// opening it.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Follows the change feed forever. Only returns when the feed cannot be
    /// (re)opened within the reconnect budget, which is fatal.
    pub async fn run(&self) -> Result<(), PropagatorError> {
        let mut reopened = false;

        loop {
            let mut feed = self
                .reconnect
                .run("store.watch", || self.store.watch_changes())
                .await?;
            tracing::info!("change feed opened");
            if reopened {
                counter!(FEED_RECONNECTS).increment(1);
            }

            // The feed is already buffering, so anything committed from here
            // on is either in this read or delivered as an event.
            self.resync().await;
            self.ready.store(true, Ordering::Relaxed);

            // Strictly sequential so an insert and a later delete of the same
            // key are applied in commit order.
            while let Some(item) = feed.next().await {
                match item {
                    Ok(event) => self.apply(event).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "change feed failed");
                        break;
                    }
                }
            }

            self.ready.store(false, Ordering::Relaxed);
            tracing::warn!("change feed closed, reopening");
            reopened = true;
        }
    }

    async fn resync(&self) {
        let registered = self
            .retry
            .run_forever("store.find_all", || self.sync_existing())
            .await;
        tracing::info!(
            registered,
            namespace = %self.identity.namespace,
            "synchronized services from other clusters"
        );
    }

    /// Registers every visible record owned by another cluster, and drops
    /// local registrations whose record has since left the directory.
    pub async fn sync_existing(&self) -> Result<usize, StoreError> {
        let filter = ServiceFilter::default().name_contains(self.identity.namespace.as_str());
        let records = self.store.find_all(&filter).await?;

        let mut present = HashSet::new();
        for record in records {
            if self.identity.is_own_cluster(record.owning_cluster())
                || !self.identity.sees(&record.name)
            {
                continue;
            }
            let key = match StoreKey::new(record.owning_cluster(), record.id.as_str()) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "skipping record with invalid key");
                    continue;
                }
            };

            self.register(&key, &record).await;
            present.insert(key);
        }

        let gone: Vec<StoreKey> = self
            .propagated
            .lock()
            .difference(&present)
            .cloned()
            .collect();
        for key in gone {
            self.deregister(&key).await;
        }

        Ok(present.len())
    }

    pub async fn apply(&self, event: ChangeEvent) {
        match self.plan(event) {
            Ok(FeedAction::Register(key, record)) => {
                self.register(&key, &record).await;
                counter!(FEED_EVENTS_APPLIED, "op" => "register").increment(1);
            }
            Ok(FeedAction::Deregister(key)) => {
                self.deregister(&key).await;
                counter!(FEED_EVENTS_APPLIED, "op" => "deregister").increment(1);
            }
            Err(reason) => {
                tracing::debug!(reason = reason.as_str(), "skipping change event");
                counter!(FEED_EVENTS_SKIPPED, "reason" => reason.as_str()).increment(1);
            }
        }
    }

    fn plan(&self, event: ChangeEvent) -> Result<FeedAction, SkipReason> {
        if let ChangeOperation::Admin(op) = &event.operation {
            tracing::debug!(op = %op, "ignoring administrative change event");
            return Err(SkipReason::Admin);
        }

        let key: StoreKey = event
            .key
            .as_deref()
            .ok_or(SkipReason::InvalidKey)?
            .parse()
            .map_err(|e| {
                tracing::warn!(key = ?event.key, error = %e, "change event with invalid key");
                SkipReason::InvalidKey
            })?;

        // Our own services reach the directory through ingress already.
        if self.identity.is_own_cluster(key.cluster()) {
            return Err(SkipReason::OwnCluster);
        }

        let record = match event.document {
            Some(value) => Some(self.decode(&key, value)?),
            None => None,
        };

        match (event.operation, record) {
            (ChangeOperation::Delete, Some(record)) => {
                if !self.identity.sees(&record.name) {
                    return Err(SkipReason::ForeignTenant);
                }
                Ok(FeedAction::Deregister(key))
            }
            (ChangeOperation::Delete, None) => {
                if self.propagated.lock().contains(&key) {
                    Ok(FeedAction::Deregister(key))
                } else {
                    Err(SkipReason::Untracked)
                }
            }
            (_, None) => Err(SkipReason::MissingDocument),
            (_, Some(record)) => {
                if !self.identity.sees(&record.name) {
                    return Err(SkipReason::ForeignTenant);
                }
                Ok(FeedAction::Register(key, record))
            }
        }
    }

    fn decode(&self, key: &StoreKey, value: serde_json::Value) -> Result<ServiceRecord, SkipReason> {
        serde_json::from_value::<ServiceDocument>(value)
            .map(ServiceRecord::from)
            .map_err(|e| {
                tracing::warn!(key = %key, error = %e, "skipping undecodable change document");
                SkipReason::Decode
            })
    }

    async fn register(&self, key: &StoreKey, record: &ServiceRecord) {
        self.retry
            .run_forever("registry.register", || self.registry.register(record))
            .await;
        self.propagated.lock().insert(key.clone());
    }

    async fn deregister(&self, key: &StoreKey) {
        // The registry only knows the id local to the owning cluster.
        self.retry
            .run_forever("registry.deregister", || self.registry.deregister(key.id()))
            .await;
        self.propagated.lock().remove(key);
    }
}
