//! Requests of the CA RPC surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ca::CaConfiguration;


/// Asks a datacenter for its roots.
///
/// With a non-zero `min_query_index` this is a blocking query: the call
/// returns once the root list index exceeds it, or when `max_query_time`
/// has passed.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RootsRequest {
    pub datacenter: String,
    #[serde(default)]
    pub min_query_index: u64,
    #[serde(default, with = "humantime_serde")]
    pub max_query_time: Option<Duration>,
}

impl RootsRequest {
    pub fn new(datacenter: &str) -> Self {
        RootsRequest {
            datacenter: datacenter.to_string(),
            ..Default::default()
        }
    }

    pub fn blocking(
        datacenter: &str,
        min_query_index: u64,
        max_query_time: Duration,
    ) -> Self {
        RootsRequest {
            datacenter: datacenter.to_string(),
            min_query_index,
            max_query_time: Some(max_query_time),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigurationGetRequest {
    pub datacenter: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigurationSetRequest {
    pub datacenter: String,
    pub config: CaConfiguration,
}

/// Asks the primary datacenter to sign an intermediate CSR.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignIntermediateRequest {
    pub datacenter: String,
    pub csr: String,
}

/// Asks a datacenter to sign a leaf CSR.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignRequest {
    pub datacenter: String,
    pub csr: String,
}
