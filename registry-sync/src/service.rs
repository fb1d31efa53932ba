use crate::SyncError;
use crate::config::{Config, Identity, StoreConfig, StoreType};
use crate::ingress::{self, IngressHandler};
use crate::propagator::ChangeFeedPropagator;
use crate::reconciler::Reconciler;
use crate::registry::{ConsulClient, RegistryClient};
use crate::store::{DirectoryStore, InMemoryStore, MongoStore};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;

/// One cluster's synchronizer: the ingress endpoint, the change-feed
/// propagator and the reconciler, sharing one store and one registry client.
pub struct SyncService {
    config: Config,
    propagator: Arc<ChangeFeedPropagator>,
    reconciler: Reconciler,
    ingress: Arc<IngressHandler>,
}

impl SyncService {
    pub fn new(
        identity: Arc<Identity>,
        config: Config,
        store: Arc<dyn DirectoryStore>,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        let propagator = ChangeFeedPropagator::new(
            identity.clone(),
            store.clone(),
            registry.clone(),
            config.sync.feed_reconnect_policy(),
            config.sync.background_policy(),
        );
        let reconciler = Reconciler::new(
            identity.clone(),
            store.clone(),
            registry,
            config.sync.background_policy(),
            config.sync.reconcile_interval(),
        );
        let ingress = IngressHandler::new(identity, store);

        SyncService {
            config,
            propagator: Arc::new(propagator),
            reconciler,
            ingress: Arc::new(ingress),
        }
    }

    /// Connects to the configured store and registry agent.
    pub async fn connect(
        identity: Arc<Identity>,
        config: Config,
        store_uri: Option<&str>,
    ) -> Result<Self, SyncError> {
        let store = connect_store(&config.store, store_uri).await?;

        let base_url = config.registry.base_url(&identity.node)?;
        tracing::info!(url = %base_url, "using registry agent");
        let registry = ConsulClient::new(base_url, config.registry.timeout())?;

        Ok(Self::new(identity, config, store, Arc::new(registry)))
    }

    /// Ready once the change feed is open and existing records were synced.
    pub fn is_ready(&self) -> bool {
        self.propagator.is_ready()
    }

    /// Runs until a fatal error. The loops themselves never finish.
    pub async fn run(self: Arc<Self>) -> Result<(), SyncError> {
        let listener = &self.config.listener;
        let ingress_listener = TcpListener::bind((listener.host.as_str(), listener.port)).await?;
        tracing::info!(host = %listener.host, port = listener.port, "ingress listening");
        let ingress = axum::serve(ingress_listener, ingress::router(self.ingress.clone()));

        let readiness = self.clone();
        let admin = AdminService::new(move || readiness.is_ready());
        let admin_listener = &self.config.admin_listener;

        tokio::select! {
            result = self.propagator.run() => result?,
            _ = self.reconciler.run() => {},
            result = ingress.into_future() => result?,
            result = run_http_service(&admin_listener.host, admin_listener.port, admin) => result?,
        }
        Ok(())
    }
}

async fn connect_store(
    config: &StoreConfig,
    uri: Option<&str>,
) -> Result<Arc<dyn DirectoryStore>, SyncError> {
    match config.r#type {
        StoreType::Memory => {
            tracing::warn!("using the in-process store, records are not shared between clusters");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreType::Mongo => {
            let uri = uri.ok_or(SyncError::MissingStoreUri)?;
            let store = config
                .connect_policy()
                .run("store.connect", || {
                    MongoStore::connect(uri, &config.database, &config.collection)
                })
                .await?;
            Ok(Arc::new(store))
        }
    }
}
