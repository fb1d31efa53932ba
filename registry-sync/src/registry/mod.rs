//! Client side of the local service-discovery agent.

mod consul;

pub use consul::ConsulClient;

use crate::types::ServiceRecord;
use async_trait::async_trait;
use std::collections::BTreeSet;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry answered {status} for {operation}")]
    Status { operation: &'static str, status: u16 },
    #[error("invalid registry URL: {0}")]
    InvalidUrl(String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Registers the service, or updates it if the id is already known.
    async fn register(&self, record: &ServiceRecord) -> Result<(), RegistryError>;

    /// Removes the service. An unknown id is treated as already removed.
    async fn deregister(&self, id: &str) -> Result<(), RegistryError>;

    /// All service names in the catalog, excluding the agent's own service.
    async fn list_service_names(&self) -> Result<BTreeSet<String>, RegistryError>;

    /// Every registered instance of the named service.
    async fn service_detail(&self, name: &str) -> Result<Vec<ServiceRecord>, RegistryError>;
}
