pub mod config;
pub mod ingress;
pub mod metrics_defs;
pub mod propagator;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use config::{Config, Identity, ValidationError};
use propagator::PropagatorError;
use registry::RegistryError;
use retry::RetryExhausted;
use service::SyncService;
use std::sync::Arc;
use store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),
    #[error("no directory store URI given")]
    MissingStoreUri,
    #[error("cannot reach directory store: {0}")]
    StoreConnect(#[from] RetryExhausted<StoreError>),
    #[error("registry client error: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Feed(#[from] PropagatorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connects to the store and registry agent and runs the synchronizer until a
/// fatal error.
pub async fn run(
    identity: Identity,
    config: Config,
    store_uri: Option<&str>,
) -> Result<(), SyncError> {
    config.validate()?;
    tracing::info!(
        cluster = %identity.cluster,
        namespace = %identity.namespace,
        node = %identity.node,
        "starting registry sync"
    );

    let service = SyncService::connect(Arc::new(identity), config, store_uri).await?;
    Arc::new(service).run().await
}
