use super::{RegistryClient, RegistryError};
use crate::types::{ServiceMeta, ServiceRecord};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use url::Url;

// The agent lists itself in the catalog under this name.
const AGENT_SERVICE: &str = "consul";

const META_CLUSTER: &str = "NextensioCluster";
const META_POD: &str = "NextensioPod";

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "ServiceID")]
    service_id: String,
    #[serde(rename = "ServiceName")]
    service_name: String,
    #[serde(rename = "ServiceAddress", default)]
    service_address: String,
    // Node address, used when the service did not register its own.
    #[serde(rename = "Address", default)]
    node_address: String,
    #[serde(rename = "ServiceMeta", default)]
    service_meta: Option<HashMap<String, String>>,
}

impl From<CatalogEntry> for ServiceRecord {
    fn from(entry: CatalogEntry) -> Self {
        let mut meta = entry.service_meta.unwrap_or_default();
        let address = if entry.service_address.is_empty() {
            entry.node_address
        } else {
            entry.service_address
        };

        ServiceRecord {
            id: entry.service_id,
            name: entry.service_name,
            address,
            meta: ServiceMeta {
                owning_cluster: meta.remove(META_CLUSTER).unwrap_or_default(),
                pod: meta.remove(META_POD).unwrap_or_default(),
            },
        }
    }
}

/// HTTP client for the Consul agent running on the local node.
pub struct ConsulClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ConsulClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, RegistryError> {
        if base_url.cannot_be_a_base() {
            return Err(RegistryError::InvalidUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ConsulClient { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn check_status(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, RegistryError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RegistryError::Status {
            operation,
            status: response.status().as_u16(),
        })
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn register(&self, record: &ServiceRecord) -> Result<(), RegistryError> {
        let url = self.endpoint(&["v1", "agent", "service", "register"])?;
        let response = self.client.put(url).json(record).send().await?;
        check_status("register", response)?;

        tracing::info!(id = %record.id, name = %record.name, "registered service");
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", id])?;
        let response = self.client.put(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(id, "service already absent from registry");
            return Ok(());
        }
        check_status("deregister", response)?;

        tracing::info!(id, "deregistered service");
        Ok(())
    }

    async fn list_service_names(&self) -> Result<BTreeSet<String>, RegistryError> {
        let url = self.endpoint(&["v1", "catalog", "services"])?;
        let response = check_status("list services", self.client.get(url).send().await?)?;

        // Service name to tags.
        let services: HashMap<String, Vec<String>> = response.json().await?;
        Ok(services
            .into_keys()
            .filter(|name| name != AGENT_SERVICE)
            .collect())
    }

    async fn service_detail(&self, name: &str) -> Result<Vec<ServiceRecord>, RegistryError> {
        let url = self.endpoint(&["v1", "catalog", "service", name])?;
        let response = check_status("service detail", self.client.get(url).send().await?)?;

        let entries: Vec<CatalogEntry> = response.json().await?;
        Ok(entries.into_iter().map(ServiceRecord::from).collect())
    }
}
