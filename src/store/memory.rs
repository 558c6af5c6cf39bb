//! In-memory CA state.
//!
//! Linearizable by virtue of a single lock. Every applied write bumps a
//! global index, mirroring the log index of a replicated store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::api::ca::{CaConfiguration, CaRoot};
use crate::commons::CaResult;
use super::{CaRequest, CaStore, ProviderKeyState, StoredRoots};


//------------ MemoryCaStore -------------------------------------------------

#[derive(Debug)]
pub struct MemoryCaStore {
    state: Mutex<MemoryState>,
    roots_index: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    index: u64,
    config: Option<CaConfiguration>,
    roots: StoredRoots,
    provider_states: HashMap<String, ProviderKeyState>,
}

impl Default for MemoryCaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCaStore {
    pub fn new() -> Self {
        MemoryCaStore {
            state: Mutex::new(MemoryState::default()),
            roots_index: watch::Sender::new(0),
        }
    }

    /// Returns the index of the last applied write.
    pub fn index(&self) -> u64 {
        self.state.lock().expect("poisoned lock").index
    }
}

impl MemoryState {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn config_cas_matches(&self, cas: Option<u64>) -> bool {
        match (cas, &self.config) {
            (None, _) => true,
            (Some(0), None) => true,
            (Some(cas), Some(config)) => config.modify_index == cas,
            (Some(_), None) => false,
        }
    }

    fn commit_config(&mut self, mut config: CaConfiguration, index: u64) {
        config.create_index = self
            .config
            .as_ref()
            .map(|c| c.create_index)
            .unwrap_or(index);
        config.modify_index = index;
        self.config = Some(config);
    }

    /// Keeps the indexes of roots that did not change.
    fn commit_roots(&mut self, mut roots: Vec<CaRoot>, index: u64) {
        for root in roots.iter_mut() {
            match self.roots.roots.iter().find(|r| r.id == root.id) {
                Some(previous) => {
                    root.create_index = previous.create_index;
                    root.modify_index = if same_content(previous, root) {
                        previous.modify_index
                    } else {
                        index
                    };
                }
                None => {
                    root.create_index = index;
                    root.modify_index = index;
                }
            }
        }
        self.roots = StoredRoots { index, roots };
    }
}

fn same_content(left: &CaRoot, right: &CaRoot) -> bool {
    let mut left = left.clone();
    let mut right = right.clone();
    left.create_index = 0;
    left.modify_index = 0;
    right.create_index = 0;
    right.modify_index = 0;
    left == right
}

#[async_trait]
impl CaStore for MemoryCaStore {
    async fn ca_config(&self) -> CaResult<Option<CaConfiguration>> {
        Ok(self.state.lock().expect("poisoned lock").config.clone())
    }

    async fn ca_roots(&self) -> CaResult<StoredRoots> {
        Ok(self.state.lock().expect("poisoned lock").roots.clone())
    }

    async fn provider_state(
        &self,
        id: &str,
    ) -> CaResult<Option<ProviderKeyState>> {
        let state = self.state.lock().expect("poisoned lock");
        Ok(state.provider_states.get(id).cloned())
    }

    async fn apply(&self, request: CaRequest) -> CaResult<bool> {
        let mut roots_changed = None;
        {
            let mut state = self.state.lock().expect("poisoned lock");
            match request {
                CaRequest::SetConfig { config, cas } => {
                    if !state.config_cas_matches(cas) {
                        trace!("Rejected CA config write, stale index {cas:?}");
                        return Ok(false);
                    }
                    let index = state.next_index();
                    state.commit_config(config, index);
                }
                CaRequest::SetRoots { roots, cas } => {
                    if state.roots.index != cas {
                        trace!("Rejected CA roots write, stale index {cas}");
                        return Ok(false);
                    }
                    let index = state.next_index();
                    state.commit_roots(roots, index);
                    roots_changed = Some(index);
                }
                CaRequest::SetRootsAndConfig {
                    roots,
                    config,
                    roots_cas,
                    config_cas,
                } => {
                    if state.roots.index != roots_cas
                        || !state.config_cas_matches(config_cas)
                    {
                        trace!(
                            "Rejected CA roots and config write, stale index \
                             {roots_cas} or {config_cas:?}"
                        );
                        return Ok(false);
                    }
                    let index = state.next_index();
                    state.commit_config(config, index);
                    state.commit_roots(roots, index);
                    roots_changed = Some(index);
                }
                CaRequest::SetProviderState(provider_state) => {
                    state.next_index();
                    state
                        .provider_states
                        .insert(provider_state.id.clone(), provider_state);
                }
                CaRequest::DeleteProviderState { id } => {
                    state.next_index();
                    state.provider_states.remove(&id);
                }
            }
        }

        if let Some(index) = roots_changed {
            self.roots_index.send_replace(index);
        }
        Ok(true)
    }

    async fn watch_roots(
        &self,
        min_index: u64,
        max_wait: Duration,
    ) -> CaResult<StoredRoots> {
        if min_index > 0 {
            let deadline = Instant::now() + max_wait;
            let mut index = self.roots_index.subscribe();
            while *index.borrow_and_update() <= min_index {
                match timeout_at(deadline, index.changed()).await {
                    Ok(Ok(())) => continue,
                    _ => break,
                }
            }
        }
        self.ca_roots().await
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::api::ca::KeyType;

    fn root(id: &str) -> CaRoot {
        CaRoot {
            id: id.to_string(),
            name: "Test".to_string(),
            serial_number: 1,
            signing_key_id: "aa:bb".to_string(),
            external_trust_domain: None,
            not_before: Utc::now(),
            not_after: Utc::now(),
            root_cert: String::new(),
            intermediate_certs: vec![],
            active: true,
            rotated_out_at: None,
            private_key_type: KeyType::Ec,
            private_key_bits: 256,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[tokio::test]
    async fn roots_cas() {
        let store = MemoryCaStore::new();
        assert!(store.apply(CaRequest::SetRoots { roots: vec![root("a")], cas: 0 }).await.unwrap());
        assert!(!store.apply(CaRequest::SetRoots { roots: vec![root("b")], cas: 0 }).await.unwrap());

        let stored = store.ca_roots().await.unwrap();
        assert_eq!(stored.index, 1);
        assert_eq!(stored.roots[0].create_index, 1);

        let mut a = stored.roots[0].clone();
        a.active = false;
        let roots = vec![a, root("b")];
        assert!(store.apply(CaRequest::SetRoots { roots, cas: 1 }).await.unwrap());

        let stored = store.ca_roots().await.unwrap();
        assert_eq!(stored.roots[0].create_index, 1);
        assert_eq!(stored.roots[0].modify_index, 2);
        assert_eq!(stored.roots[1].create_index, 2);
        assert_eq!(stored.active().unwrap().id, "b");
    }

    #[tokio::test]
    async fn config_cas() {
        let store = MemoryCaStore::new();
        let config = CaConfiguration::new("builtin", "abc");
        let set = |cas| CaRequest::SetConfig { config: config.clone(), cas };

        assert!(store.apply(set(Some(0))).await.unwrap());
        assert!(!store.apply(set(Some(0))).await.unwrap());

        let stored = store.ca_config().await.unwrap().unwrap();
        assert_eq!(stored.modify_index, 1);
        assert!(store.apply(set(Some(1))).await.unwrap());
        assert!(store.apply(set(None)).await.unwrap());
    }

    #[tokio::test]
    async fn roots_and_config_cas() {
        let store = MemoryCaStore::new();
        let config = CaConfiguration::new("builtin", "abc");
        store
            .apply(CaRequest::SetConfig { config: config.clone(), cas: Some(0) })
            .await
            .unwrap();
        let set = |roots_cas, config_cas| CaRequest::SetRootsAndConfig {
            roots: vec![root("a")],
            config: config.clone(),
            roots_cas,
            config_cas,
        };

        // Config written since it was read.
        assert!(!store.apply(set(0, Some(0))).await.unwrap());
        assert!(store.ca_roots().await.unwrap().roots.is_empty());

        assert!(store.apply(set(0, Some(1))).await.unwrap());
        assert_eq!(store.ca_config().await.unwrap().unwrap().modify_index, 2);

        // Roots written since they were read.
        assert!(!store.apply(set(0, Some(2))).await.unwrap());
        assert!(store.apply(set(2, None)).await.unwrap());
        assert_eq!(store.ca_roots().await.unwrap().index, 3);
    }

    #[tokio::test]
    async fn watch_roots_wakes_on_change() {
        let store = Arc::new(MemoryCaStore::new());
        store.apply(CaRequest::SetRoots { roots: vec![root("a")], cas: 0 }).await.unwrap();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move {
                store.watch_roots(1, Duration::from_secs(10)).await.unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.apply(CaRequest::SetRoots { roots: vec![root("b")], cas: 1 }).await.unwrap();

        let roots = watcher.await.unwrap();
        assert_eq!(roots.index, 2);
        assert_eq!(roots.roots[0].id, "b");
    }

    #[tokio::test]
    async fn watch_roots_times_out() {
        let store = MemoryCaStore::new();
        store.apply(CaRequest::SetRoots { roots: vec![root("a")], cas: 0 }).await.unwrap();

        let roots = store.watch_roots(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(roots.index, 1);
    }
}
