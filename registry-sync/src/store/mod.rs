//! The shared, multi-cluster service directory.

mod memory;
mod mongo;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

use crate::types::{ServiceRecord, StoreKey};
use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("mongo error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("could not encode document: {0}")]
    Encode(#[from] mongodb::bson::ser::Error),
    #[error("could not decode document: {0}")]
    Decode(#[from] mongodb::bson::de::Error),
    #[error("change feed fell behind, {0} events dropped")]
    FeedLagged(u64),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Kind of change reported by the feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
    /// Collection drop, database drop, invalidation and anything else that
    /// does not describe a single record.
    Admin(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    /// The record's primary key, as stored.
    pub key: Option<String>,
    /// Full document after the change, when the store delivers one.
    pub document: Option<serde_json::Value>,
}

/// Live, ordered sequence of change events. Ends when the feed is closed.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

/// Criteria for `find_all`. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    pub name_contains: Option<String>,
    pub owning_cluster: Option<String>,
}

impl ServiceFilter {
    pub fn name_contains<S: Into<String>>(mut self, pattern: S) -> Self {
        self.name_contains = Some(pattern.into());
        self
    }

    pub fn owning_cluster<S: Into<String>>(mut self, cluster: S) -> Self {
        self.owning_cluster = Some(cluster.into());
        self
    }

    pub fn matches(&self, record: &ServiceRecord) -> bool {
        self.name_contains
            .as_deref()
            .is_none_or(|pattern| record.name.contains(pattern))
            && self
                .owning_cluster
                .as_deref()
                .is_none_or(|cluster| record.owning_cluster() == cluster)
    }
}

/// Operations the synchronizer needs from the directory. Every write targets
/// exactly one keyed document, so concurrent writers need no extra locking.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Creates the record if absent, replaces it otherwise.
    async fn upsert(&self, key: &StoreKey, record: &ServiceRecord) -> Result<(), StoreError>;

    /// Removes the record. Deleting a missing key is not an error.
    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;

    async fn find_one(&self, key: &StoreKey) -> Result<Option<ServiceRecord>, StoreError>;

    async fn find_all(&self, filter: &ServiceFilter) -> Result<Vec<ServiceRecord>, StoreError>;

    /// Opens a new change feed starting at the current point in time.
    async fn watch_changes(&self) -> Result<ChangeStream, StoreError>;
}
