use crate::retry::{Backoff, RetryPolicy};
use crate::types::{KEY_SEPARATOR, KeyError, StoreKey, TenantNamespace};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("cluster identity cannot be empty")]
    EmptyCluster,
    #[error("cluster identity '{0}' contains the key separator '?'")]
    InvalidCluster(String),
    #[error("tenant namespace cannot be empty")]
    EmptyNamespace,
    #[error("tenant namespace '{0}' may only contain letters, digits, '-' and '_'")]
    InvalidNamespace(String),
    #[error("node name cannot be empty")]
    EmptyNode,
    #[error("invalid registry URL: {0}")]
    InvalidRegistryUrl(String),
    #[error("port cannot be 0")]
    InvalidPort,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Who this instance is. Built once at startup and shared read-only by every
/// component.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub cluster: String,
    pub namespace: TenantNamespace,
    pub node: String,
}

impl Identity {
    pub fn new<C, N, D>(cluster: C, namespace: N, node: D) -> Result<Self, ValidationError>
    where
        C: Into<String>,
        N: Into<String>,
        D: Into<String>,
    {
        let cluster = cluster.into();
        let namespace = namespace.into();
        let node = node.into();

        if cluster.is_empty() {
            return Err(ValidationError::EmptyCluster);
        }
        if cluster.contains(KEY_SEPARATOR) {
            return Err(ValidationError::InvalidCluster(cluster));
        }
        if namespace.is_empty() {
            return Err(ValidationError::EmptyNamespace);
        }
        // The namespace doubles as a store query pattern, so keep it to
        // characters without regex meaning.
        if !namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidNamespace(namespace));
        }
        if node.is_empty() {
            return Err(ValidationError::EmptyNode);
        }

        Ok(Identity {
            cluster,
            namespace: TenantNamespace::new(namespace),
            node,
        })
    }

    pub fn is_own_cluster(&self, cluster: &str) -> bool {
        self.cluster == cluster
    }

    /// Whether a service name belongs to this instance's tenant.
    pub fn sees(&self, service_name: &str) -> bool {
        self.namespace.owns(service_name)
    }

    /// Store key for a service registered on this cluster.
    pub fn key_for(&self, id: &str) -> Result<StoreKey, KeyError> {
        StoreKey::new(self.cluster.as_str(), id)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

fn default_listener() -> Listener {
    Listener {
        host: "0.0.0.0".into(),
        port: 80,
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "0.0.0.0".into(),
        port: 8081,
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Mongo,
    /// In-process store, for running a single instance locally.
    Memory,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub r#type: StoreType,
    pub database: String,
    pub collection: String,
    pub connect_attempts: u32,
    pub connect_delay_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            r#type: StoreType::Mongo,
            database: "NxtDB".into(),
            collection: "NxtServices".into(),
            connect_attempts: 60,
            connect_delay_secs: 1,
        }
    }
}

impl StoreConfig {
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            self.connect_attempts,
            Duration::from_secs(self.connect_delay_secs),
            Backoff::Fixed,
        )
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Overrides the agent address derived from the node name.
    pub url: Option<Url>,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            url: None,
            port: 8500,
            timeout_secs: 10,
        }
    }
}

impl RegistryConfig {
    /// Address of the agent on `node`, unless a URL is configured.
    pub fn base_url(&self, node: &str) -> Result<Url, ValidationError> {
        match &self.url {
            Some(url) => Ok(url.clone()),
            None => {
                let raw = format!("http://{node}.node.consul:{}/", self.port);
                Url::parse(&raw).map_err(|e| ValidationError::InvalidRegistryUrl(e.to_string()))
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub reconcile_interval_secs: u64,
    /// Fixed delay between attempts of background writes.
    pub retry_delay_secs: u64,
    pub feed_reconnect_attempts: u32,
    /// Base of the linear backoff between feed reconnect attempts.
    pub feed_reconnect_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            reconcile_interval_secs: 300,
            retry_delay_secs: 2,
            feed_reconnect_attempts: 5,
            feed_reconnect_delay_secs: 1,
        }
    }
}

impl SyncConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn background_policy(&self) -> RetryPolicy {
        RetryPolicy::forever(Duration::from_secs(self.retry_delay_secs))
    }

    pub fn feed_reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            self.feed_reconnect_attempts,
            Duration::from_secs(self.feed_reconnect_delay_secs),
            Backoff::Linear,
        )
    }
}

/// Tunables of the synchronizer. Everything has a default so an empty
/// section is a valid configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_listener")]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: default_listener(),
            admin_listener: default_admin_listener(),
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        let positive = [
            ("store.connect_attempts", u64::from(self.store.connect_attempts)),
            ("store.connect_delay_secs", self.store.connect_delay_secs),
            ("registry.timeout_secs", self.registry.timeout_secs),
            ("sync.reconcile_interval_secs", self.sync.reconcile_interval_secs),
            ("sync.retry_delay_secs", self.sync.retry_delay_secs),
            ("sync.feed_reconnect_attempts", u64::from(self.sync.feed_reconnect_attempts)),
            ("sync.feed_reconnect_delay_secs", self.sync.feed_reconnect_delay_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ValidationError::Zero(name));
            }
        }

        if let Some(url) = &self.registry.url
            && url.cannot_be_a_base()
        {
            return Err(ValidationError::InvalidRegistryUrl(url.to_string()));
        }

        Ok(())
    }
}
