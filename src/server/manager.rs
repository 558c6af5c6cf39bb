//! The CA manager: owns the active provider and root of a datacenter for
//! the duration of a leadership term.

use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};

use crate::api::ca::{CaConfiguration, CaRoot};
use crate::cluster::{CaRpc, Membership};
use crate::commons::{crypto, CaEmptyResult, CaResult, Error};
use crate::config::Config;
use crate::provider::{build_provider, Provider, ProviderContext};
use crate::store::{CaRequest, CaStore};


//------------ CaState -------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaState {
    Uninitialized,
    Initializing,
    Active,
    Reconfiguring,
    Renewing,
    Error,
}

impl fmt::Display for CaState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CaState::Uninitialized => "uninitialized",
            CaState::Initializing => "initializing",
            CaState::Active => "active",
            CaState::Reconfiguring => "reconfiguring",
            CaState::Renewing => "renewing",
            CaState::Error => "error",
        };
        f.write_str(s)
    }
}


//------------ SecondaryState ------------------------------------------------

/// Progress of a secondary datacenter towards an intermediate signed by
/// the primary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecondaryState {
    WaitForPrimaryVersionCompatible,
    FetchPrimaryRoots,
    GenerateIntermediateCsr,
    SubmitForPrimarySigning,
    StoreIntermediate,
    Active,
}


//------------ ActiveCa ------------------------------------------------------

/// The provider together with the root it produced. Always swapped as a
/// whole so that readers never see a root next to the wrong provider.
pub struct ActiveCa {
    pub provider: Arc<dyn Provider>,
    pub root: CaRoot,
}


//------------ CaManager -----------------------------------------------------

struct ManagerState {
    state: CaState,
    secondary: Option<SecondaryState>,
    last_error: Option<String>,
}

pub struct CaManager {
    pub(super) config: Arc<Config>,
    pub(super) store: Arc<dyn CaStore>,
    pub(super) rpc: Arc<dyn CaRpc>,
    pub(super) membership: Arc<dyn Membership>,
    active: ArcSwapOption<ActiveCa>,
    state: Mutex<ManagerState>,
}

/// # Construct and inspect
impl CaManager {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn CaStore>,
        rpc: Arc<dyn CaRpc>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        CaManager {
            config,
            store,
            rpc,
            membership,
            active: ArcSwapOption::new(None),
            state: Mutex::new(ManagerState {
                state: CaState::Uninitialized,
                secondary: None,
                last_error: None,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> CaState {
        self.state.lock().expect("poisoned lock").state
    }

    pub fn secondary_state(&self) -> Option<SecondaryState> {
        self.state.lock().expect("poisoned lock").secondary
    }

    /// The error of the last failed initialization, if any.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().expect("poisoned lock").last_error.clone()
    }

    /// Returns the active provider and root.
    ///
    /// This is what every signing path goes through. It never blocks on a
    /// reconfiguration in progress.
    pub fn ca_provider(&self) -> CaResult<Arc<ActiveCa>> {
        self.active.load_full().ok_or(Error::CaNotInitialized)
    }
}

/// # State transitions
impl CaManager {
    /// Moves to `to` if the current state is one of `from`.
    pub(super) fn set_state(
        &self,
        from: &[CaState],
        to: CaState,
    ) -> CaResult<CaState> {
        let mut state = self.state.lock().expect("poisoned lock");
        let current = state.state;
        if from.contains(&current) {
            state.state = to;
            Ok(current)
        } else {
            Err(Error::CaBusy(current))
        }
    }

    /// Moves to `to` only if nothing else changed the state since we set
    /// it to `from`.
    pub(super) fn finish_transition(&self, from: CaState, to: CaState) {
        let mut state = self.state.lock().expect("poisoned lock");
        if state.state == from {
            state.state = to;
        }
    }

    pub(super) fn set_secondary_state(&self, secondary: SecondaryState) {
        debug!("Secondary CA state: {secondary:?}");
        self.state.lock().expect("poisoned lock").secondary = Some(secondary);
    }

    /// Makes `provider` and `root` the active pair.
    pub(super) fn swap(&self, provider: Arc<dyn Provider>, root: CaRoot) {
        self.active.store(Some(Arc::new(ActiveCa { provider, root })));
    }

    /// Releases the active pair at the end of a leadership term.
    pub fn stop(&self) {
        self.active.store(None);
        let mut state = self.state.lock().expect("poisoned lock");
        state.state = CaState::Uninitialized;
        state.secondary = None;
        state.last_error = None;
    }
}

/// # Initialization
impl CaManager {
    /// Sets up the active pair from the persisted state, creating that
    /// state first if needed. Does nothing if already active.
    ///
    /// Failures leave the manager in the `Error` state for a later retry,
    /// except that a primary running too old a build leaves it
    /// `Uninitialized`.
    pub async fn initialize(&self) -> CaEmptyResult {
        if self.state() == CaState::Active {
            return Ok(());
        }
        self.set_state(
            &[CaState::Uninitialized, CaState::Error],
            CaState::Initializing,
        )?;

        let res = if self.config.is_primary() {
            self.initialize_primary().await
        } else {
            self.initialize_secondary().await
        };

        let mut state = self.state.lock().expect("poisoned lock");
        match &res {
            Ok(()) => {
                state.state = CaState::Active;
                state.last_error = None;
                if !self.config.is_primary() {
                    state.secondary = Some(SecondaryState::Active);
                }
                info!("CA initialized in datacenter {}", self.config.datacenter);
            }
            Err(e @ Error::VersionIncompatible { .. }) => {
                state.state = CaState::Uninitialized;
                state.secondary =
                    Some(SecondaryState::WaitForPrimaryVersionCompatible);
                state.last_error = Some(e.to_string());
                info!("Deferring CA initialization: {e}");
            }
            Err(e) => {
                state.state = CaState::Error;
                state.last_error = Some(e.to_string());
                error!("Failed to initialize CA: {e}");
            }
        }
        res
    }

    pub(super) fn provider_context(&self) -> ProviderContext {
        ProviderContext::new(
            &self.config.datacenter,
            self.config.is_primary(),
            self.store.clone(),
        )
    }

    /// Returns the persisted configuration, persisting the configured
    /// default first if there is none. A primary gets a fresh cluster ID
    /// if none was configured.
    pub(super) async fn load_or_seed_config(&self) -> CaResult<CaConfiguration> {
        if let Some(config) = self.store.ca_config().await? {
            return Ok(config);
        }

        let mut seed = self.config.ca.clone();
        if seed.cluster_id.is_empty() && self.config.is_primary() {
            seed.cluster_id = uuid::Uuid::new_v4().to_string();
        }
        info!(
            "No CA configuration found, using the default with provider {}",
            seed.provider
        );
        let request = CaRequest::SetConfig {
            config: seed,
            cas: Some(0),
        };
        if !self.store.apply(request).await? {
            debug!("CA configuration was written concurrently");
        }

        self.store
            .ca_config()
            .await?
            .ok_or_else(|| Error::store("CA configuration vanished after write"))
    }

    async fn initialize_primary(&self) -> CaEmptyResult {
        let config = self.load_or_seed_config().await?;
        let provider = build_provider(&config, &self.provider_context()).await?;

        let mut root = provider.generate_root().await?;
        let signing_cert = if provider.primary_uses_intermediate() {
            match provider.active_intermediate().await {
                Ok(pem) => pem,
                Err(_) => provider.generate_intermediate().await?,
            }
        } else {
            provider.active_intermediate().await?
        };
        root.signing_key_id = crypto::signing_key_id_of(&signing_cert)?;
        if provider.primary_uses_intermediate() {
            root.intermediate_certs.push(signing_cert.clone());
        }

        let stored = self.store.ca_roots().await?;
        let request = match stored.roots.iter().find(|r| r.id == root.id) {
            Some(existing) => {
                let mut existing = existing.clone();
                let mut changed = !existing.active;

                if existing.signing_key_id != root.signing_key_id {
                    info!(
                        "Correcting signing key ID of root {} from {} to {}",
                        existing.id, existing.signing_key_id, root.signing_key_id
                    );
                    existing.signing_key_id = root.signing_key_id.clone();
                    changed = true;
                }
                if provider.primary_uses_intermediate()
                    && !existing.intermediate_certs.contains(&signing_cert)
                {
                    existing.intermediate_certs.push(signing_cert);
                    changed = true;
                }

                if changed {
                    let roots = replace_active(&stored.roots, existing);
                    Some(CaRequest::SetRoots {
                        roots,
                        cas: stored.index,
                    })
                } else {
                    None
                }
            }
            None => {
                info!("Adding new root {} to the root list", root.id);
                let roots = replace_active(&stored.roots, root.clone());
                let mut config = config.clone();
                config.state = provider.state();
                Some(CaRequest::SetRootsAndConfig {
                    roots,
                    roots_cas: stored.index,
                    config_cas: Some(config.modify_index),
                    config,
                })
            }
        };

        if let Some(request) = request {
            if !self.store.apply(request).await? {
                return Err(Error::stale("root list changed during init"));
            }
        }

        let active = self.persisted_active_root(&root.id).await?;
        self.swap(provider, active);
        Ok(())
    }

    /// Reads the active root back from the store, making sure it is the
    /// one we expect.
    pub(super) async fn persisted_active_root(
        &self,
        expected_id: &str,
    ) -> CaResult<CaRoot> {
        let root = self
            .store
            .active_root()
            .await?
            .ok_or_else(|| Error::stale("no active root persisted"))?;
        if root.id != expected_id {
            return Err(Error::stale(format!(
                "persisted active root is {}, expected {}",
                root.id, expected_id
            )));
        }
        Ok(root)
    }

    /// Brings the active pair back in line with the store after a
    /// conflicting write. If the store moved to a root the active provider
    /// did not produce, the manager drops back to uninitialized so that it
    /// is initialized again.
    pub async fn resync(&self) {
        let Some(active) = self.active.load_full() else {
            return;
        };
        match self.store.active_root().await {
            Ok(Some(root)) if root.id == active.root.id => {
                debug!("Resynced active root {}", root.id);
                self.swap(active.provider.clone(), root);
            }
            Ok(_) => {
                warn!("Active root changed in the store, reinitializing CA");
                self.active.store(None);
                let mut state = self.state.lock().expect("poisoned lock");
                state.state = CaState::Uninitialized;
            }
            Err(e) => warn!("Could not resync CA state: {e}"),
        }
    }
}

/// # Signing
impl CaManager {
    /// Signs a leaf CSR with the active pair.
    pub async fn sign_leaf(&self, csr_pem: &str) -> CaResult<String> {
        let active = self.ca_provider()?;
        active.provider.sign(csr_pem).await
    }

    /// Signs the intermediate CSR of a secondary datacenter.
    pub async fn sign_intermediate_for_secondary(
        &self,
        csr_pem: &str,
    ) -> CaResult<String> {
        if !self.config.is_primary() {
            return Err(Error::NotPrimary);
        }
        let active = self.ca_provider()?;
        active.provider.sign_intermediate(csr_pem).await
    }
}

/// # Maintenance
impl CaManager {
    /// Removes inactive roots once every leaf they could have signed has
    /// expired. Returns the number of roots removed.
    pub async fn prune_expired_roots(&self) -> CaResult<usize> {
        if self.state() != CaState::Active {
            return Ok(0);
        }

        let config = self
            .store
            .ca_config()
            .await?
            .ok_or(Error::CaNotInitialized)?;
        let leaf_ttl = config.common()?.leaf_cert_ttl;
        let grace = TimeDelta::from_std(leaf_ttl * 2).map_err(Error::custom)?;

        let stored = self.store.ca_roots().await?;
        let now = Utc::now();
        let keep: Vec<CaRoot> = stored
            .roots
            .iter()
            .filter(|root| {
                root.active
                    || (root.not_after > now
                        && root
                            .rotated_out_at
                            .is_none_or(|retired| now - retired <= grace))
            })
            .cloned()
            .collect();

        let removed = stored.roots.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let request = CaRequest::SetRoots {
            roots: keep,
            cas: stored.index,
        };
        if !self.store.apply(request).await? {
            return Err(Error::stale("root list changed while pruning"));
        }
        info!("Pruned {removed} expired CA root(s)");
        Ok(removed)
    }

    /// Replaces the intermediate if it is past half its lifetime or would
    /// not outlive a minimal leaf. Returns whether it was replaced.
    pub async fn renew_intermediate_if_needed(&self) -> CaResult<bool> {
        if self.state() != CaState::Active {
            return Ok(false);
        }
        let active = self.ca_provider()?;
        let is_primary = self.config.is_primary();
        if is_primary && !active.provider.primary_uses_intermediate() {
            return Ok(false);
        }

        let pem = active.provider.active_intermediate().await?;
        let cert = crypto::parse_certificate(&pem)?;
        let not_before = crypto::not_before(&cert)?;
        let not_after = crypto::not_after(&cert)?;

        let policy = &self.config.policy;
        let drift = TimeDelta::from_std(policy.cert_time_drift_buffer)
            .map_err(Error::custom)?;
        let min_leaf = TimeDelta::from_std(policy.min_leaf_cert_ttl)
            .map_err(Error::custom)?;
        if !needs_renewal(Utc::now(), not_before, not_after, drift, min_leaf) {
            return Ok(false);
        }

        self.set_state(&[CaState::Active], CaState::Renewing)?;
        info!("Renewing intermediate which expires at {not_after}");
        let res = if is_primary {
            self.renew_primary_intermediate(&active).await
        } else {
            self.renew_secondary_intermediate(&active).await
        };
        self.finish_transition(CaState::Renewing, CaState::Active);

        if let Err(Error::StaleState(_)) = &res {
            self.resync().await;
        }
        res.map(|_| true)
    }

    async fn renew_primary_intermediate(
        &self,
        active: &ActiveCa,
    ) -> CaEmptyResult {
        let intermediate = active.provider.generate_intermediate().await?;

        let stored = self.store.ca_roots().await?;
        let mut root = stored
            .active()
            .filter(|root| root.id == active.root.id)
            .cloned()
            .ok_or_else(|| Error::stale("active root is not the stored one"))?;
        root.signing_key_id = crypto::signing_key_id_of(&intermediate)?;
        root.intermediate_certs.push(intermediate);

        let request = CaRequest::SetRoots {
            roots: replace_active(&stored.roots, root),
            cas: stored.index,
        };
        if !self.store.apply(request).await? {
            return Err(Error::stale("root list changed during renewal"));
        }

        let root = self.persisted_active_root(&active.root.id).await?;
        self.swap(active.provider.clone(), root);
        Ok(())
    }
}

/// Whether an intermediate valid from `not_before` to `not_after` is past
/// half its lifetime or would not outlive a leaf of `min_leaf`.
fn needs_renewal(
    now: DateTime<Utc>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    drift: TimeDelta,
    min_leaf: TimeDelta,
) -> bool {
    let half_life_ok =
        crypto::less_than_half_time_passed(now, not_before + drift, not_after);
    let lifetime_ok = not_after - now - drift >= min_leaf;
    !(half_life_ok && lifetime_ok)
}

/// Returns `roots` with `active` as the only active root, replacing any
/// entry with the same ID. Roots that lose their active flag are marked
/// as rotated out now.
pub(super) fn replace_active(roots: &[CaRoot], active: CaRoot) -> Vec<CaRoot> {
    let now = Utc::now();
    let mut res: Vec<CaRoot> = roots
        .iter()
        .filter(|root| root.id != active.id)
        .cloned()
        .map(|mut root| {
            root.rotate_out(now);
            root
        })
        .collect();

    let mut active = active;
    active.active = true;
    active.rotated_out_at = None;
    res.push(active);
    res
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ca::KeyType;

    fn root(id: &str, active: bool) -> CaRoot {
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
            active,
            rotated_out_at: None,
            private_key_type: KeyType::Ec,
            private_key_bits: 256,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[test]
    fn replace_active_keeps_exactly_one_active_root() {
        let roots = vec![root("a", false), root("b", true)];

        let replaced = replace_active(&roots, root("c", false));
        assert_eq!(replaced.len(), 3);
        assert_eq!(replaced.iter().filter(|r| r.active).count(), 1);
        assert_eq!(replaced[2].id, "c");
        assert!(replaced[1].rotated_out_at.is_some());
        assert!(replaced[0].rotated_out_at.is_none());

        let mut updated = root("c", true);
        updated.signing_key_id = "cc:dd".to_string();
        let replaced = replace_active(&replaced, updated);
        assert_eq!(replaced.len(), 3);
        assert_eq!(replaced.iter().filter(|r| r.active).count(), 1);
        assert_eq!(replaced[2].signing_key_id, "cc:dd");
    }

    #[test]
    fn renewal_window() {
        let now = Utc::now();
        let hours = TimeDelta::hours;
        let drift = TimeDelta::minutes(1);

        // Fresh, with room for a leaf
        assert!(!needs_renewal(now, now - hours(1), now + hours(99), drift, hours(1)));
        // Past half its lifetime
        assert!(needs_renewal(now, now - hours(60), now + hours(40), drift, hours(1)));
        // Fresh, but a minimal leaf would outlive it
        assert!(needs_renewal(now, now - hours(1), now + hours(99), drift, hours(100)));
        // Only the drift buffer tips it over
        assert!(needs_renewal(
            now,
            now - hours(1),
            now + hours(10),
            TimeDelta::minutes(30),
            TimeDelta::minutes(9 * 60 + 40),
        ));
    }
}
