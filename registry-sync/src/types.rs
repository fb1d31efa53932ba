use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separates the owning cluster from the local service id in a store key.
pub const KEY_SEPARATOR: char = '?';

/// Registry metadata attached to every service. The field names are the
/// ones the registry agent and the directory already use on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMeta {
    #[serde(rename = "NextensioCluster")]
    pub owning_cluster: String,
    #[serde(rename = "NextensioPod")]
    pub pod: String,
}

/// The unit of synchronization between the local registry and the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(rename = "ID")]
    pub id: String,
    /// Suffixed with the tenant namespace by convention.
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Meta")]
    pub meta: ServiceMeta,
}

impl ServiceRecord {
    pub fn new<I, N, A, C, P>(id: I, name: N, address: A, owning_cluster: C, pod: P) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        A: Into<String>,
        C: Into<String>,
        P: Into<String>,
    {
        ServiceRecord {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            meta: ServiceMeta {
                owning_cluster: owning_cluster.into(),
                pod: pod.into(),
            },
        }
    }

    pub fn owning_cluster(&self) -> &str {
        &self.meta.owning_cluster
    }
}

/// A record as persisted in the directory: the service fields plus its key.
///
/// Decoding is strict. Documents with unknown or missing top-level fields are
/// rejected so a foreign writer with a different schema cannot be half-read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDocument {
    #[serde(rename = "_id")]
    pub key: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Meta")]
    pub meta: ServiceMeta,
}

impl ServiceDocument {
    pub fn new(key: &StoreKey, record: &ServiceRecord) -> Self {
        ServiceDocument {
            key: key.to_string(),
            id: record.id.clone(),
            name: record.name.clone(),
            address: record.address.clone(),
            meta: record.meta.clone(),
        }
    }
}

impl From<ServiceDocument> for ServiceRecord {
    fn from(doc: ServiceDocument) -> Self {
        ServiceRecord {
            id: doc.id,
            name: doc.name,
            address: doc.address,
            meta: doc.meta,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum KeyError {
    #[error("cluster identity is empty")]
    EmptyCluster,
    #[error("service id is empty")]
    EmptyId,
    #[error("'{0}' contains the key separator")]
    ContainsSeparator(String),
    #[error("'{0}' is not a cluster-qualified key")]
    MissingSeparator(String),
}

/// Primary key of a directory record: `<owning cluster>?<local id>`.
///
/// Two clusters registering the same local id never collide, and the owning
/// cluster can be read back from the key alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    cluster: String,
    id: String,
}

impl StoreKey {
    pub fn new<C, I>(cluster: C, id: I) -> Result<Self, KeyError>
    where
        C: Into<String>,
        I: Into<String>,
    {
        let cluster = cluster.into();
        let id = id.into();

        if cluster.is_empty() {
            return Err(KeyError::EmptyCluster);
        }
        if id.is_empty() {
            return Err(KeyError::EmptyId);
        }
        for part in [&cluster, &id] {
            if part.contains(KEY_SEPARATOR) {
                return Err(KeyError::ContainsSeparator(part.clone()));
            }
        }

        Ok(StoreKey { cluster, id })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The service id as known to the owning cluster's registry.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.cluster, KEY_SEPARATOR, self.id)
    }
}

impl FromStr for StoreKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cluster, id) = s
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| KeyError::MissingSeparator(s.to_string()))?;
        StoreKey::new(cluster, id)
    }
}

/// The tenant namespace this cluster serves. A service belongs to the tenant
/// when its name ends with the namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantNamespace(String);

impl TenantNamespace {
    pub fn new<N: Into<String>>(namespace: N) -> Self {
        TenantNamespace(namespace.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Names are `<service>.<namespace>`, so the suffix must start at a dot.
    pub fn owns(&self, service_name: &str) -> bool {
        service_name
            .strip_suffix(self.0.as_str())
            .is_some_and(|rest| rest.ends_with('.'))
    }
}

impl fmt::Display for TenantNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
