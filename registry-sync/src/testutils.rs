use crate::config::Identity;
use crate::registry::{RegistryClient, RegistryError};
use crate::types::ServiceRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryCall {
    Register(String),
    Deregister(String),
}

#[derive(Default)]
struct FakeRegistryState {
    services: BTreeMap<String, ServiceRecord>,
    calls: Vec<RegistryCall>,
    failures_left: u32,
    detail_failures: BTreeSet<String>,
}

/// Registry double that keeps services in memory, records mutating calls and
/// can be told to fail.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<FakeRegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service without recording a call, as if registered out of band.
    pub fn with_service(self, record: ServiceRecord) -> Self {
        self.add_service(record);
        self
    }

    pub fn add_service(&self, record: ServiceRecord) {
        self.state
            .lock()
            .services
            .insert(record.id.clone(), record);
    }

    pub fn remove_service(&self, id: &str) {
        self.state.lock().services.remove(id);
    }

    /// The next `count` calls of any kind fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_left = count;
    }

    /// Detail lookups for `name` fail until cleared.
    pub fn fail_detail(&self, name: &str) {
        self.state.lock().detail_failures.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.state.lock().calls.clone()
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.state.lock().services.keys().cloned().collect()
    }

    fn check(state: &mut FakeRegistryState) -> Result<(), RegistryError> {
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(RegistryError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn register(&self, record: &ServiceRecord) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        Self::check(&mut state)?;
        state.calls.push(RegistryCall::Register(record.id.clone()));
        state.services.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        Self::check(&mut state)?;
        state.calls.push(RegistryCall::Deregister(id.to_string()));
        state.services.remove(id);
        Ok(())
    }

    async fn list_service_names(&self) -> Result<BTreeSet<String>, RegistryError> {
        let mut state = self.state.lock();
        Self::check(&mut state)?;
        Ok(state.services.values().map(|s| s.name.clone()).collect())
    }

    async fn service_detail(&self, name: &str) -> Result<Vec<ServiceRecord>, RegistryError> {
        let mut state = self.state.lock();
        Self::check(&mut state)?;
        if state.detail_failures.contains(name) {
            return Err(RegistryError::Unavailable(format!("detail for {name}")));
        }
        Ok(state
            .services
            .values()
            .filter(|s| s.name == name)
            .cloned()
            .collect())
    }
}

pub fn identity() -> Identity {
    Identity::new("clusterX", "tenantA", "node-1").unwrap()
}

pub fn service(id: &str, name: &str, cluster: &str) -> ServiceRecord {
    ServiceRecord::new(id, name, format!("10.0.0.{}", id.len()), cluster, format!("{id}-pod"))
}
