//! Add/delete notifications pushed by the local registry agent.
//!
//! Nothing here retries: the agent redelivers on failure, and blocking the
//! request would stall the agent's own event delivery. Missed events are
//! repaired by the reconciler.
use crate::config::Identity;
use crate::metrics_defs::INGRESS_EVENTS;
use crate::store::{DirectoryStore, StoreError};
use crate::types::{KeyError, ServiceRecord, StoreKey};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use shared::counter;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum IngressError {
    #[error("malformed service record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid service identity: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("directory store error: {0}")]
    Store(#[from] StoreError),
}

impl IngressError {
    /// A body that does not decode, or a record whose key cannot be built, is
    /// the sender's fault and gets 400. Only a failing store answers 500.
    fn status(&self) -> StatusCode {
        match self {
            IngressError::Malformed(_) | IngressError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            IngressError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        (self.status(), format!("{self}\n")).into_response()
    }
}

pub struct IngressHandler {
    identity: Arc<Identity>,
    store: Arc<dyn DirectoryStore>,
}

impl IngressHandler {
    pub fn new(identity: Arc<Identity>, store: Arc<dyn DirectoryStore>) -> Self {
        IngressHandler { identity, store }
    }

    /// Records a service that appeared on this cluster's registry.
    pub async fn on_add(&self, mut record: ServiceRecord) -> Result<StoreKey, IngressError> {
        let key = self.identity.key_for(&record.id)?;
        // The key names this cluster as owner; keep the document consistent.
        record.meta.owning_cluster = self.identity.cluster.clone();

        self.store.upsert(&key, &record).await?;
        tracing::info!(key = %key, name = %record.name, "service added to directory");
        Ok(key)
    }

    /// Removes a service that disappeared from this cluster's registry.
    pub async fn on_delete(&self, record: ServiceRecord) -> Result<StoreKey, IngressError> {
        let key = StoreKey::new(record.meta.owning_cluster, record.id)?;

        self.store.delete(&key).await?;
        tracing::info!(key = %key, "service removed from directory");
        Ok(key)
    }
}

pub fn router(handler: Arc<IngressHandler>) -> Router {
    Router::new()
        .route("/event/add", post(add_event))
        .route("/event/del", post(delete_event))
        .with_state(handler)
}

fn decode(kind: &'static str, body: &[u8]) -> Result<ServiceRecord, IngressError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(kind, error = %e, "rejecting malformed notification");
        IngressError::from(e)
    })
}

fn record_outcome<T>(kind: &'static str, result: &Result<T, IngressError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) if e.status().is_client_error() => "rejected",
        Err(_) => "failed",
    };
    counter!(INGRESS_EVENTS, "kind" => kind, "outcome" => outcome).increment(1);
}

/// `POST /event/add`. Replies 200 once the record is in the directory, 400 for a
/// malformed body and 500 when the store write fails.
async fn add_event(
    State(handler): State<Arc<IngressHandler>>,
    body: Bytes,
) -> Result<&'static str, IngressError> {
    tracing::debug!("add event received from registry");
    let result = match decode("add", &body) {
        Ok(record) => handler.on_add(record).await,
        Err(e) => Err(e),
    };
    record_outcome("add", &result);

    if let Err(e) = &result {
        tracing::error!(error = %e, "failed to apply add event");
    }
    result.map(|_| "ok\n")
}

async fn delete_event(
    State(handler): State<Arc<IngressHandler>>,
    body: Bytes,
) -> Result<&'static str, IngressError> {
    tracing::debug!("delete event received from registry");
    let result = match decode("del", &body) {
        Ok(record) => handler.on_delete(record).await,
        Err(e) => Err(e),
    };
    record_outcome("del", &result);

    if let Err(e) = &result {
        tracing::error!(error = %e, "failed to apply delete event");
    }
    result.map(|_| "ok\n")
}
