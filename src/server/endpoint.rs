//! The CA RPC surface of a datacenter, and in-process routing between
//! datacenters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tokio::time::timeout;

use crate::api::ca::{CaConfiguration, IndexedCaRoots, TrustDomain};
use crate::api::rpc::{
    ConfigurationGetRequest, ConfigurationSetRequest, RootsRequest,
    SignIntermediateRequest, SignRequest,
};
use crate::cluster::CaRpc;
use crate::commons::{CaEmptyResult, CaResult, Error};
use crate::store::CaStore;
use super::manager::CaManager;


//------------ ConnectCa -----------------------------------------------------

/// Serves CA requests for one datacenter. Requests naming another
/// datacenter are forwarded.
pub struct ConnectCa {
    manager: Arc<CaManager>,
    store: Arc<dyn CaStore>,
    rpc: Arc<dyn CaRpc>,
}

impl ConnectCa {
    pub fn new(
        manager: Arc<CaManager>,
        store: Arc<dyn CaStore>,
        rpc: Arc<dyn CaRpc>,
    ) -> Self {
        ConnectCa {
            manager,
            store,
            rpc,
        }
    }

    fn is_local(&self, datacenter: &str) -> bool {
        datacenter.is_empty() || datacenter == self.manager.config().datacenter
    }

    /// Returns the roots of the datacenter. With a minimum query index
    /// this blocks until the root list moves past it.
    pub async fn roots(&self, request: RootsRequest) -> CaResult<IndexedCaRoots> {
        if !self.is_local(&request.datacenter) {
            return self.rpc.roots(request).await;
        }

        let stored = if request.min_query_index > 0 {
            let max_wait = request
                .max_query_time
                .unwrap_or(self.manager.config().policy.roots_max_query_time);
            self.store
                .watch_roots(request.min_query_index, max_wait)
                .await?
        } else {
            self.store.ca_roots().await?
        };

        let trust_domain = match self.store.ca_config().await? {
            Some(config) if !config.cluster_id.is_empty() => {
                TrustDomain::from_cluster_id(&config.cluster_id).to_string()
            }
            _ => String::new(),
        };

        Ok(IndexedCaRoots {
            active_root_id: stored
                .active()
                .map(|root| root.id.clone())
                .unwrap_or_default(),
            trust_domain,
            roots: stored.roots,
            index: stored.index,
        })
    }

    pub async fn configuration_get(
        &self,
        request: ConfigurationGetRequest,
    ) -> CaResult<CaConfiguration> {
        if !self.is_local(&request.datacenter) {
            return self.rpc.configuration_get(request).await;
        }
        self.store
            .ca_config()
            .await?
            .ok_or(Error::CaNotInitialized)
    }

    /// Applies a new CA configuration, rotating the root if needed.
    pub async fn configuration_set(
        &self,
        request: ConfigurationSetRequest,
    ) -> CaEmptyResult {
        if !self.is_local(&request.datacenter) {
            return self.rpc.configuration_set(request).await;
        }
        self.manager.update_configuration(request.config).await
    }

    /// Signs the intermediate of a secondary datacenter. Only the primary
    /// serves this.
    pub async fn sign_intermediate(
        &self,
        request: SignIntermediateRequest,
    ) -> CaResult<String> {
        if !self.is_local(&request.datacenter) {
            return self.rpc.sign_intermediate(request).await;
        }
        self.manager.sign_intermediate_for_secondary(&request.csr).await
    }

    pub async fn sign(&self, request: SignRequest) -> CaResult<String> {
        if !self.is_local(&request.datacenter) {
            return self.rpc.sign(request).await;
        }
        self.manager.sign_leaf(&request.csr).await
    }
}


//------------ RpcRouter -----------------------------------------------------

/// Routes CA calls to the endpoints of datacenters running in the same
/// process.
pub struct RpcRouter {
    endpoints: RwLock<HashMap<String, Weak<ConnectCa>>>,
    timeout: Duration,
}

impl RpcRouter {
    pub fn new(timeout: Duration) -> Self {
        RpcRouter {
            endpoints: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn register(&self, datacenter: &str, endpoint: &Arc<ConnectCa>) {
        self.endpoints
            .write()
            .expect("poisoned lock")
            .insert(datacenter.to_string(), Arc::downgrade(endpoint));
    }

    pub fn deregister(&self, datacenter: &str) {
        self.endpoints
            .write()
            .expect("poisoned lock")
            .remove(datacenter);
    }

    fn endpoint(&self, datacenter: &str) -> CaResult<Arc<ConnectCa>> {
        self.endpoints
            .read()
            .expect("poisoned lock")
            .get(datacenter)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::UnknownDatacenter(datacenter.to_string()))
    }

    async fn call<T>(
        &self,
        datacenter: &str,
        extra_wait: Duration,
        call: impl Future<Output = CaResult<T>>,
    ) -> CaResult<T> {
        trace!("Routing CA call to datacenter {datacenter}");
        timeout(self.timeout + extra_wait, call)
            .await
            .map_err(|_| Error::rpc(format!("call to {datacenter} timed out")))?
    }
}

#[async_trait]
impl CaRpc for RpcRouter {
    async fn roots(&self, request: RootsRequest) -> CaResult<IndexedCaRoots> {
        let endpoint = self.endpoint(&request.datacenter)?;
        let datacenter = request.datacenter.clone();
        let extra_wait = request.max_query_time.unwrap_or_default();
        self.call(&datacenter, extra_wait, endpoint.roots(request)).await
    }

    async fn configuration_get(
        &self,
        request: ConfigurationGetRequest,
    ) -> CaResult<CaConfiguration> {
        let endpoint = self.endpoint(&request.datacenter)?;
        let datacenter = request.datacenter.clone();
        self.call(&datacenter, Duration::ZERO, endpoint.configuration_get(request))
            .await
    }

    async fn configuration_set(
        &self,
        request: ConfigurationSetRequest,
    ) -> CaEmptyResult {
        let endpoint = self.endpoint(&request.datacenter)?;
        let datacenter = request.datacenter.clone();
        self.call(&datacenter, Duration::ZERO, endpoint.configuration_set(request))
            .await
    }

    async fn sign_intermediate(
        &self,
        request: SignIntermediateRequest,
    ) -> CaResult<String> {
        let endpoint = self.endpoint(&request.datacenter)?;
        let datacenter = request.datacenter.clone();
        self.call(&datacenter, Duration::ZERO, endpoint.sign_intermediate(request))
            .await
    }

    async fn sign(&self, request: SignRequest) -> CaResult<String> {
        let endpoint = self.endpoint(&request.datacenter)?;
        let datacenter = request.datacenter.clone();
        self.call(&datacenter, Duration::ZERO, endpoint.sign(request)).await
    }
}


//------------ Tests ---------------------------------------------------------
