//! Secondary datacenters: getting an intermediate signed by the primary
//! and following the primary's root.

use std::future::Future;
use std::sync::Arc;

use log::{debug, info};
use tokio::time::timeout;

use crate::api::ca::{CaConfiguration, CaRoot, IndexedCaRoots, TrustDomain};
use crate::api::rpc::{RootsRequest, SignIntermediateRequest};
use crate::commons::{crypto, CaEmptyResult, CaResult, Error};
use crate::provider::{build_provider, Provider};
use crate::store::CaRequest;
use super::manager::{
    replace_active, ActiveCa, CaManager, CaState, SecondaryState,
};


/// # Version gating
impl CaManager {
    /// Checks that every server of the primary datacenter can sign
    /// intermediates for us.
    pub(super) fn check_primary_version(&self) -> CaEmptyResult {
        let primary = self.config.primary_datacenter();
        let required = &self.config.policy.min_federation_build;
        let servers = self.membership.servers(primary);

        if servers.is_empty() || servers.iter().any(|s| s.build < *required) {
            return Err(Error::VersionIncompatible {
                datacenter: primary.to_string(),
                required: required.to_string(),
            });
        }
        Ok(())
    }
}

/// # Talking to the primary
impl CaManager {
    async fn with_rpc_timeout<T>(
        &self,
        what: &str,
        call: impl Future<Output = CaResult<T>>,
    ) -> CaResult<T> {
        timeout(self.config.policy.rpc_timeout, call)
            .await
            .map_err(|_| Error::rpc(format!("{what} timed out")))?
    }

    async fn fetch_primary_roots(&self) -> CaResult<IndexedCaRoots> {
        let request = RootsRequest::new(self.config.primary_datacenter());
        self.with_rpc_timeout("fetching primary roots", self.rpc.roots(request))
            .await
    }
}

/// # Initialization and renewal
impl CaManager {
    pub(super) async fn initialize_secondary(&self) -> CaEmptyResult {
        self.set_secondary_state(SecondaryState::WaitForPrimaryVersionCompatible);
        self.check_primary_version()?;

        self.set_secondary_state(SecondaryState::FetchPrimaryRoots);
        let primary_roots = self.fetch_primary_roots().await?;
        let primary_root = primary_roots
            .active_root()
            .ok_or_else(|| Error::rpc("primary datacenter has no active root"))?;
        let primary_cluster_id = TrustDomain::from(primary_roots.trust_domain.clone())
            .cluster_id()
            .to_string();

        let stored_config = self.load_or_seed_config().await?;
        let previous_cluster_id = stored_config.cluster_id.clone();
        let config_cas = stored_config.modify_index;
        let mut config = stored_config;
        config.cluster_id = primary_cluster_id.clone();

        let provider = build_provider(&config, &self.provider_context()).await?;

        if previous_cluster_id == primary_cluster_id {
            if let Some(root) = self.reuse_intermediate(&provider, &primary_root.id).await? {
                self.swap(provider, root);
                return Ok(());
            }
        }

        let migrate_from = (!previous_cluster_id.is_empty()
            && previous_cluster_id != primary_cluster_id)
            .then_some(previous_cluster_id);
        self.secondary_request_new_signing_cert(
            provider,
            &primary_roots,
            config,
            config_cas,
            migrate_from,
        )
        .await
    }

    /// Returns the stored active root if the provider's intermediate
    /// already chains to the primary's active root, correcting its signing
    /// key ID if needed.
    async fn reuse_intermediate(
        &self,
        provider: &Arc<dyn Provider>,
        primary_root_id: &str,
    ) -> CaResult<Option<CaRoot>> {
        let stored = self.store.ca_roots().await?;
        let Some(active) = stored.active().filter(|r| r.id == primary_root_id) else {
            return Ok(None);
        };
        let Ok(intermediate) = provider.active_intermediate().await else {
            return Ok(None);
        };
        if !active.intermediate_certs.contains(&intermediate) {
            return Ok(None);
        }

        let signing_key_id = crypto::signing_key_id_of(&intermediate)?;
        if active.signing_key_id != signing_key_id {
            info!(
                "Correcting signing key ID of root {} from {} to {}",
                active.id, active.signing_key_id, signing_key_id
            );
            let mut root = active.clone();
            root.signing_key_id = signing_key_id;
            let request = CaRequest::SetRoots {
                roots: replace_active(&stored.roots, root),
                cas: stored.index,
            };
            if !self.store.apply(request).await? {
                return Err(Error::stale("root list changed during init"));
            }
        }

        debug!("Reusing intermediate for primary root {primary_root_id}");
        self.persisted_active_root(primary_root_id).await.map(Some)
    }

    /// Has the primary sign a new intermediate for `provider` and makes it
    /// the signing certificate, persisting the primary's active root with
    /// our intermediate appended. If that root already is our active root,
    /// its earlier intermediates stay so that leaves they signed keep
    /// verifying.
    ///
    /// The write only applies if the configuration is still at
    /// `config_cas`. With `migrate_from` set, this datacenter leaves the trust domain of
    /// that cluster ID. Its existing roots stay in the list, tagged with
    /// it, so that leaves issued under them keep verifying.
    pub(super) async fn secondary_request_new_signing_cert(
        &self,
        provider: Arc<dyn Provider>,
        primary_roots: &IndexedCaRoots,
        mut config: CaConfiguration,
        config_cas: u64,
        migrate_from: Option<String>,
    ) -> CaEmptyResult {
        let primary_root = primary_roots
            .active_root()
            .ok_or_else(|| Error::rpc("primary datacenter has no active root"))?;

        self.set_secondary_state(SecondaryState::GenerateIntermediateCsr);
        let csr = provider.generate_intermediate_csr().await?;

        self.set_secondary_state(SecondaryState::SubmitForPrimarySigning);
        let request = SignIntermediateRequest {
            datacenter: self.config.primary_datacenter().to_string(),
            csr,
        };
        let intermediate = self
            .with_rpc_timeout("signing intermediate", self.rpc.sign_intermediate(request))
            .await?;

        self.set_secondary_state(SecondaryState::StoreIntermediate);
        provider
            .set_intermediate(&intermediate, &primary_root.root_cert)
            .await?;

        let stored = self.store.ca_roots().await?;
        let mut new_root = match stored.active() {
            Some(current) if current.id == primary_root.id => {
                let mut root = current.clone();
                for cert in &primary_root.intermediate_certs {
                    if !root.intermediate_certs.contains(cert) {
                        root.intermediate_certs.push(cert.clone());
                    }
                }
                root
            }
            _ => {
                let mut root = primary_root.clone();
                root.create_index = 0;
                root.modify_index = 0;
                root
            }
        };
        new_root.signing_key_id = crypto::signing_key_id_of(&intermediate)?;
        new_root.intermediate_certs.push(intermediate);

        let mut roots = stored.roots.clone();
        if let Some(old_cluster_id) = &migrate_from {
            info!(
                "Migrating from trust domain {} to {}",
                TrustDomain::from_cluster_id(old_cluster_id),
                primary_roots.trust_domain
            );
            for root in roots.iter_mut() {
                if root.external_trust_domain.is_none() {
                    root.external_trust_domain = Some(old_cluster_id.clone());
                }
            }
        }

        config.state = provider.state();
        let new_id = new_root.id.clone();
        let request = CaRequest::SetRootsAndConfig {
            roots: replace_active(&roots, new_root),
            config,
            roots_cas: stored.index,
            config_cas: Some(config_cas),
        };
        if !self.store.apply(request).await? {
            return Err(Error::stale(
                "root list or configuration changed while storing intermediate",
            ));
        }

        let root = self.persisted_active_root(&new_id).await?;
        self.swap(provider, root);
        self.set_secondary_state(SecondaryState::Active);
        info!("Installed intermediate signed by primary root {new_id}");
        Ok(())
    }

    /// Obtains a fresh intermediate for the active provider.
    pub(super) async fn renew_secondary_intermediate(
        &self,
        active: &ActiveCa,
    ) -> CaEmptyResult {
        let primary_roots = self.fetch_primary_roots().await?;
        let config = self
            .store
            .ca_config()
            .await?
            .ok_or(Error::CaNotInitialized)?;
        let config_cas = config.modify_index;
        self.secondary_request_new_signing_cert(
            active.provider.clone(),
            &primary_roots,
            config,
            config_cas,
            None,
        )
        .await
    }

    /// Switches a secondary to a new provider. A secondary has no root of
    /// its own, so this always means a new intermediate from the primary.
    pub(super) async fn reconfigure_secondary(
        &self,
        provider: Arc<dyn Provider>,
        config: &CaConfiguration,
        current: &CaConfiguration,
    ) -> CaResult<bool> {
        let primary_roots = self.fetch_primary_roots().await?;
        self.secondary_request_new_signing_cert(
            provider,
            &primary_roots,
            config.clone(),
            current.modify_index,
            None,
        )
        .await?;
        Ok(true)
    }
}

/// # Following the primary
impl CaManager {
    /// Runs one blocking roots query against the primary. If the
    /// primary's active root changed, requests a new intermediate chained
    /// to it. Returns the index to wait on next.
    pub async fn watch_primary_roots_once(&self, min_index: u64) -> CaResult<u64> {
        let policy = &self.config.policy;
        let request = RootsRequest::blocking(
            self.config.primary_datacenter(),
            min_index,
            policy.roots_max_query_time,
        );
        let roots = timeout(
            policy.roots_max_query_time + policy.rpc_timeout,
            self.rpc.roots(request),
        )
        .await
        .map_err(|_| Error::rpc("watching primary roots timed out"))??;

        if roots.index == 0 {
            return Err(Error::rpc("primary datacenter has no roots yet"));
        }
        if self.state() != CaState::Active {
            return Ok(roots.index);
        }
        let active = self.ca_provider()?;
        if roots.active_root_id.is_empty() || roots.active_root_id == active.root.id {
            return Ok(roots.index);
        }

        info!(
            "Primary root changed from {} to {}, renewing intermediate",
            active.root.id, roots.active_root_id
        );
        self.set_state(&[CaState::Active], CaState::Renewing)?;
        let config = self.store.ca_config().await?.ok_or(Error::CaNotInitialized);
        let res = match config {
            Ok(config) => {
                let config_cas = config.modify_index;
                self.secondary_request_new_signing_cert(
                    active.provider.clone(),
                    &roots,
                    config,
                    config_cas,
                    None,
                )
                .await
            }
            Err(e) => Err(e),
        };
        self.finish_transition(CaState::Renewing, CaState::Active);
        if let Err(Error::StaleState(_)) = &res {
            self.resync().await;
        }
        res.map(|_| roots.index)
    }
}
