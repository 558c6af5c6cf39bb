#![allow(dead_code)] // Different tests use different parts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::{sleep, Instant};

use meshca::api::ca::{CaConfiguration, CaRoot, IndexedCaRoots, KeyType};
use meshca::api::rpc::{
    ConfigurationGetRequest, ConfigurationSetRequest, RootsRequest, SignRequest,
};
use meshca::cluster::StaticMembership;
use meshca::commons::{crypto, CaEmptyResult, CaResult};
use meshca::config::Config;
use meshca::server::{CaLeader, CaManager, ConnectCa, RpcRouter};
use meshca::store::{CaRequest, CaStore, MemoryCaStore};

pub mod vault;


//------------ Logging -------------------------------------------------------

/// Logs to stderr so that failing tests show what happened. Only the
/// first call in a test binary has any effect.
pub fn init_logging() {
    let _ = stderrlog::new()
        .module("meshca")
        .verbosity(3)
        .init();
}


//------------ TestCluster ---------------------------------------------------

/// Datacenters sharing one membership view and one RPC router.
pub struct TestCluster {
    pub router: Arc<RpcRouter>,
    pub membership: Arc<StaticMembership>,
}

impl TestCluster {
    pub fn new() -> Self {
        init_logging();
        TestCluster {
            router: Arc::new(RpcRouter::new(Duration::from_secs(5))),
            membership: Arc::new(StaticMembership::new()),
        }
    }

    /// Starts a server with an empty state store.
    pub fn server(&self, config: Config) -> TestServer {
        self.server_with_store(config, Arc::new(MemoryCaStore::new()))
    }

    /// Starts a server on an existing state store, as a newly elected
    /// leader would.
    pub fn server_with_store(
        &self,
        config: Config,
        store: Arc<MemoryCaStore>,
    ) -> TestServer {
        let config = Arc::new(config);
        self.membership.join(config.server_info());

        let manager = Arc::new(CaManager::new(
            config.clone(),
            store.clone(),
            self.router.clone(),
            self.membership.clone(),
        ));
        let leader = Arc::new(CaLeader::new(manager.clone()));
        let endpoint = Arc::new(ConnectCa::new(
            manager.clone(),
            store.clone(),
            self.router.clone(),
        ));
        self.router.register(&config.datacenter, &endpoint);

        TestServer {
            config,
            store,
            manager,
            leader,
            endpoint,
        }
    }
}


//------------ TestServer ----------------------------------------------------

pub struct TestServer {
    pub config: Arc<Config>,
    pub store: Arc<MemoryCaStore>,
    pub manager: Arc<CaManager>,
    pub leader: Arc<CaLeader>,
    pub endpoint: Arc<ConnectCa>,
}

impl TestServer {
    pub fn datacenter(&self) -> &str {
        &self.config.datacenter
    }

    pub async fn roots(&self) -> IndexedCaRoots {
        self.endpoint
            .roots(RootsRequest::new(self.datacenter()))
            .await
            .unwrap()
    }

    pub async fn active_root(&self) -> CaRoot {
        self.roots().await.active_root().cloned().unwrap()
    }

    pub async fn ca_config(&self) -> CaConfiguration {
        let request = ConfigurationGetRequest {
            datacenter: self.datacenter().to_string(),
        };
        self.endpoint.configuration_get(request).await.unwrap()
    }

    pub async fn set_ca_config(&self, config: CaConfiguration) -> CaEmptyResult {
        let request = ConfigurationSetRequest {
            datacenter: self.datacenter().to_string(),
            config,
        };
        self.endpoint.configuration_set(request).await
    }

    /// Rotates to a root with a different key type.
    pub async fn rotate_to(&self, key_type: &str) {
        let config = self.ca_config().await.with_option("PrivateKeyType", key_type);
        self.set_ca_config(config).await.unwrap();
    }

    /// Has the datacenter sign a leaf for `service` in its trust domain.
    pub async fn sign_leaf(&self, service: &str) -> CaResult<String> {
        let trust_domain = self.roots().await.trust_domain;
        let request = SignRequest {
            datacenter: self.datacenter().to_string(),
            csr: leaf_csr(&trust_domain, self.datacenter(), service),
        };
        self.endpoint.sign(request).await
    }

    /// Overwrites the signing key ID of the stored active root.
    pub async fn corrupt_signing_key_id(&self) {
        let stored = self.store.ca_roots().await.unwrap();
        let roots = stored
            .roots
            .iter()
            .cloned()
            .map(|mut root| {
                if root.active {
                    root.signing_key_id = "00:11:22".to_string();
                }
                root
            })
            .collect();
        let request = CaRequest::SetRoots {
            roots,
            cas: stored.index,
        };
        assert!(self.store.apply(request).await.unwrap());
    }
}


//------------ Certificates --------------------------------------------------

pub fn leaf_csr(trust_domain: &str, datacenter: &str, service: &str) -> String {
    let key = crypto::generate_private_key(KeyType::Ec, 256).unwrap();
    let uri = format!("spiffe://{trust_domain}/ns/default/dc/{datacenter}/svc/{service}");
    let csr = crypto::build_csr(&key, service, &[uri], false).unwrap();
    crypto::csr_to_pem(&csr).unwrap()
}

/// Verifies the leaf against `root` using the root's intermediates.
pub fn verify_leaf(leaf: &str, root: &CaRoot) {
    crypto::verify_chain(leaf, &root.intermediate_certs, &root.root_cert)
        .unwrap();
}


//------------ Waiting -------------------------------------------------------

/// Polls `check` until it returns true, panicking after ten seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            debug!("Done waiting for {what}");
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub fn primary_config(datacenter: &str) -> Config {
    Config::test(datacenter, datacenter)
}

pub fn secondary_config(datacenter: &str, primary: &str) -> Config {
    Config::test(datacenter, primary)
}
