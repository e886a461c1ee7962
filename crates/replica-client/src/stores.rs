use std::{
    any::{Any, type_name},
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use replica_core::{Resource, SyncPhase};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
    client::{CollectionRef, ResourceClient},
    credentials::CredentialSource,
    sync::{SyncOptions, Synchronizer},
    transport::Transport,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("collection {collection} is registered with another resource type ({requested})")]
    TypeMismatch {
        collection: String,
        requested: &'static str,
    },
}

#[async_trait]
trait ManagedStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn phase(&self) -> SyncPhase;
    async fn start(&self) -> bool;
    async fn stop(&self) -> bool;
}

#[async_trait]
impl<T> ManagedStore for Synchronizer<T>
where
    T: Resource + Serialize + DeserializeOwned,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn phase(&self) -> SyncPhase {
        Synchronizer::phase(self)
    }

    async fn start(&self) -> bool {
        self.sync().await
    }

    async fn stop(&self) -> bool {
        Synchronizer::stop(self).await
    }
}

/// Registry of synchronizers, one per collection, sharing a transport and
/// credential source.
pub struct ResourceStores {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    server: Url,
    options: SyncOptions,
    stores: Mutex<BTreeMap<String, Arc<dyn ManagedStore>>>,
}

impl std::fmt::Debug for ResourceStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStores")
            .field("server", &self.server.as_str())
            .field("collections", &self.collections())
            .finish()
    }
}

impl ResourceStores {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        server: Url,
        options: SyncOptions,
    ) -> Self {
        Self {
            transport,
            credentials,
            server,
            options,
            stores: Mutex::new(BTreeMap::new()),
        }
    }

    /// Synchronizer for a cluster-wide collection, created on first use.
    pub fn register<T>(&self, collection: CollectionRef) -> Result<Synchronizer<T>, StoreError>
    where
        T: Resource + Serialize + DeserializeOwned,
    {
        self.register_in(collection, None)
    }

    /// Synchronizer for `collection` scoped to `namespace`.
    pub fn register_namespaced<T>(
        &self,
        collection: CollectionRef,
        namespace: &str,
    ) -> Result<Synchronizer<T>, StoreError>
    where
        T: Resource + Serialize + DeserializeOwned,
    {
        self.register_in(collection, Some(namespace))
    }

    fn register_in<T>(
        &self,
        collection: CollectionRef,
        namespace: Option<&str>,
    ) -> Result<Synchronizer<T>, StoreError>
    where
        T: Resource + Serialize + DeserializeOwned,
    {
        let path = collection.path(namespace);
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = stores.get(&path) {
            return existing
                .as_any()
                .downcast_ref::<Synchronizer<T>>()
                .cloned()
                .ok_or(StoreError::TypeMismatch {
                    collection: path,
                    requested: type_name::<T>(),
                });
        }

        let mut client = ResourceClient::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.credentials),
            self.server.clone(),
            collection,
        );
        if let Some(namespace) = namespace {
            client = client.with_namespace(namespace);
        }
        let synchronizer = Synchronizer::new(client, self.options);
        info!(collection = %path, resource = type_name::<T>(), "collection registered");
        stores.insert(path, Arc::new(synchronizer.clone()));
        Ok(synchronizer)
    }

    /// Registered collection paths, sorted.
    pub fn collections(&self) -> Vec<String> {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn phases(&self) -> Vec<(String, SyncPhase)> {
        self.entries()
            .into_iter()
            .map(|(path, store)| (path, store.phase()))
            .collect()
    }

    /// Start every registered synchronizer. Returns how many were started.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for (_, store) in self.entries() {
            if store.start().await {
                started += 1;
            }
        }
        started
    }

    /// Stop every registered synchronizer. Returns how many were running.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for (_, store) in self.entries() {
            if store.stop().await {
                stopped += 1;
            }
        }
        stopped
    }

    fn entries(&self) -> Vec<(String, Arc<dyn ManagedStore>)> {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(path, store)| (path.clone(), Arc::clone(store)))
            .collect()
    }
}
