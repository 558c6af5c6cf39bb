//! The cluster around the CA manager: who the servers are and how to reach
//! other datacenters.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::api::ca::{CaConfiguration, IndexedCaRoots};
use crate::api::rpc::{
    ConfigurationGetRequest, ConfigurationSetRequest, RootsRequest,
    SignIntermediateRequest, SignRequest,
};
use crate::commons::version::BuildVersion;
use crate::commons::{CaResult, Error};


//------------ ServerInfo ----------------------------------------------------

/// A server as seen through the membership layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub datacenter: String,
    pub build: BuildVersion,
}

impl ServerInfo {
    pub fn new(name: &str, datacenter: &str, build: BuildVersion) -> Self {
        ServerInfo {
            name: name.to_string(),
            datacenter: datacenter.to_string(),
            build,
        }
    }
}


//------------ Membership ----------------------------------------------------

/// The gossip view of the servers in all datacenters.
pub trait Membership: Send + Sync {
    fn servers(&self, datacenter: &str) -> Vec<ServerInfo>;
}


//------------ StaticMembership ----------------------------------------------

/// A membership view maintained by hand, e.g. from configuration or in
/// tests.
#[derive(Debug, Default)]
pub struct StaticMembership {
    servers: RwLock<HashMap<String, ServerInfo>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the server, or replaces it if its name is known.
    pub fn join(&self, server: ServerInfo) {
        let mut servers = self.servers.write().expect("poisoned lock");
        servers.insert(server.name.clone(), server);
    }

    pub fn leave(&self, name: &str) {
        self.servers.write().expect("poisoned lock").remove(name);
    }

    /// Updates the advertised build of a server, as happens on upgrade.
    pub fn set_build(&self, name: &str, build: &str) -> CaResult<()> {
        let build = BuildVersion::from_str(build).map_err(Error::custom)?;
        let mut servers = self.servers.write().expect("poisoned lock");
        match servers.get_mut(name) {
            Some(server) => {
                server.build = build;
                Ok(())
            }
            None => Err(Error::custom(format!("unknown server '{name}'"))),
        }
    }
}

impl Membership for StaticMembership {
    fn servers(&self, datacenter: &str) -> Vec<ServerInfo> {
        let servers = self.servers.read().expect("poisoned lock");
        let mut res: Vec<_> = servers
            .values()
            .filter(|s| s.datacenter == datacenter)
            .cloned()
            .collect();
        res.sort_by(|a, b| a.name.cmp(&b.name));
        res
    }
}


//------------ CaRpc ---------------------------------------------------------

/// The CA calls one datacenter makes to another. Every request names the
/// datacenter that should serve it.
#[async_trait]
pub trait CaRpc: Send + Sync {
    async fn roots(&self, request: RootsRequest) -> CaResult<IndexedCaRoots>;

    async fn configuration_get(
        &self,
        request: ConfigurationGetRequest,
    ) -> CaResult<CaConfiguration>;

    async fn configuration_set(
        &self,
        request: ConfigurationSetRequest,
    ) -> CaResult<()>;

    async fn sign_intermediate(
        &self,
        request: SignIntermediateRequest,
    ) -> CaResult<String>;

    async fn sign(&self, request: SignRequest) -> CaResult<String>;
}


//------------ Tests ---------------------------------------------------------
