//! Access to the replicated CA state.
//!
//! The consensus log itself lives outside this crate. The CA manager only
//! needs linearizable reads, compare-and-set writes and a way to block
//! until the root list changes, which is what [`CaStore`] captures.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::ca::{CaConfiguration, CaRoot};
use crate::commons::CaResult;

pub mod memory;

pub use self::memory::MemoryCaStore;


//------------ StoredRoots ---------------------------------------------------

/// The root list of a datacenter at a given index.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StoredRoots {
    pub index: u64,
    pub roots: Vec<CaRoot>,
}

impl StoredRoots {
    pub fn active(&self) -> Option<&CaRoot> {
        self.roots.iter().find(|r| r.active)
    }
}


//------------ ProviderKeyState ----------------------------------------------

/// Key material a provider keeps in the replicated state so that the next
/// leader can keep signing with it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProviderKeyState {
    pub id: String,
    pub private_key: String,
    #[serde(default)]
    pub root_cert: Option<String>,
    #[serde(default)]
    pub intermediate_cert: Option<String>,
}


//------------ CaRequest -----------------------------------------------------

/// A write against the CA state.
///
/// Writes guarded by an index only apply if the guarded record is still at
/// that index, see [`CaStore::apply`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CaRequest {
    /// Sets the configuration. With `cas` set the write only applies if
    /// the stored configuration's modify index equals it; zero means no
    /// configuration may exist yet.
    SetConfig {
        config: CaConfiguration,
        cas: Option<u64>,
    },

    /// Replaces the root list if its index still equals `cas`.
    SetRoots { roots: Vec<CaRoot>, cas: u64 },

    /// Replaces the root list and the configuration as one transaction.
    /// Guarded by the root list index and, like [`CaRequest::SetConfig`],
    /// optionally by the configuration's modify index.
    SetRootsAndConfig {
        roots: Vec<CaRoot>,
        config: CaConfiguration,
        roots_cas: u64,
        config_cas: Option<u64>,
    },

    SetProviderState(ProviderKeyState),

    DeleteProviderState { id: String },
}


//------------ CaStore -------------------------------------------------------

#[async_trait]
pub trait CaStore: Send + Sync {
    async fn ca_config(&self) -> CaResult<Option<CaConfiguration>>;

    async fn ca_roots(&self) -> CaResult<StoredRoots>;

    async fn provider_state(
        &self,
        id: &str,
    ) -> CaResult<Option<ProviderKeyState>>;

    /// Applies a write. Returns `false` if a compare-and-set guard did
    /// not match, in which case nothing was changed.
    async fn apply(&self, request: CaRequest) -> CaResult<bool>;

    /// Waits until the root list index exceeds `min_index` or `max_wait`
    /// has passed, then returns the current root list.
    async fn watch_roots(
        &self,
        min_index: u64,
        max_wait: Duration,
    ) -> CaResult<StoredRoots>;

    async fn active_root(&self) -> CaResult<Option<CaRoot>> {
        Ok(self.ca_roots().await?.active().cloned())
    }
}
