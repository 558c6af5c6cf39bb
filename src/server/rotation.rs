//! Reconfiguration of the CA, rotating to a new root where the signing
//! material changes.
//!
//! All expensive work (key generation, cross-signing, the replicated
//! write) happens before the active pair is swapped, so a failure leaves
//! both the persisted and the in-memory state as they were.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::api::ca::CaConfiguration;
use crate::commons::{crypto, CaEmptyResult, CaResult, Error};
use crate::provider::{build_provider, validate_config, Provider};
use crate::store::CaRequest;
use super::manager::{replace_active, ActiveCa, CaManager, CaState};


impl CaManager {
    /// Applies a new CA configuration.
    ///
    /// An uninitialized or failed CA just persists the configuration and
    /// initializes with it. An active CA rotates to a new root if the new
    /// configuration yields different signing material. An invalid
    /// configuration is rejected before anything is written.
    pub async fn update_configuration(
        &self,
        config: CaConfiguration,
    ) -> CaEmptyResult {
        validate_config(&config)?;

        match self.state() {
            CaState::Uninitialized | CaState::Error => {
                self.update_uninitialized(config).await
            }
            CaState::Active => {
                self.set_state(&[CaState::Active], CaState::Reconfiguring)?;
                let res = self.reconfigure(config).await;
                self.finish_transition(CaState::Reconfiguring, CaState::Active);
                if let Err(Error::StaleState(_)) = &res {
                    self.resync().await;
                }
                res
            }
            busy => Err(Error::CaBusy(busy)),
        }
    }

    async fn update_uninitialized(
        &self,
        mut config: CaConfiguration,
    ) -> CaEmptyResult {
        let stored = self.store.ca_config().await?;
        let cas = stored.as_ref().map(|c| c.modify_index).unwrap_or(0);

        match &stored {
            Some(stored) => inherit(&mut config, stored, self.config.is_primary())?,
            None if config.cluster_id.is_empty() && self.config.is_primary() => {
                config.cluster_id = uuid::Uuid::new_v4().to_string();
            }
            None => {}
        }

        let request = CaRequest::SetConfig {
            config,
            cas: Some(cas),
        };
        if !self.store.apply(request).await? {
            return Err(Error::stale("CA configuration changed concurrently"));
        }
        info!("Stored new CA configuration, initializing CA");

        match self.initialize().await {
            Ok(()) | Err(Error::CaBusy(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reconfigure(&self, mut config: CaConfiguration) -> CaEmptyResult {
        let active = self.ca_provider()?;
        let current = self
            .store
            .ca_config()
            .await?
            .ok_or(Error::CaNotInitialized)?;
        inherit(&mut config, &current, self.config.is_primary())?;

        let provider = build_provider(&config, &self.provider_context()).await?;
        let type_change = config.provider != current.provider;

        let res = if self.config.is_primary() {
            self.rotate_primary(&active, &current, provider.clone(), &config)
                .await
        } else {
            self.reconfigure_secondary(provider.clone(), &config, &current)
                .await
        };

        match res {
            Ok(rotated) => {
                if rotated {
                    if let Err(e) =
                        active.provider.cleanup(type_change, &config).await
                    {
                        warn!("Failed to clean up previous CA provider: {e}");
                    }
                }
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) =
                    provider.cleanup(type_change, &current).await
                {
                    warn!("Failed to clean up new CA provider: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Switches the primary to the new provider. Returns whether a new
    /// root was introduced.
    async fn rotate_primary(
        &self,
        active: &ActiveCa,
        current: &CaConfiguration,
        provider: Arc<dyn Provider>,
        config: &CaConfiguration,
    ) -> CaResult<bool> {
        let stored = self.store.ca_roots().await?;
        if stored.active().map(|r| r.id.as_str()) != Some(active.root.id.as_str()) {
            return Err(Error::stale("active root differs from the stored one"));
        }

        let mut config = config.clone();
        config.state = provider.state();

        let mut new_root = provider.generate_root().await?;
        if new_root.id == active.root.id {
            debug!("CA configuration keeps root {}, no rotation", new_root.id);
            let request = CaRequest::SetConfig {
                config,
                cas: Some(current.modify_index),
            };
            if !self.store.apply(request).await? {
                return Err(Error::stale("CA configuration changed concurrently"));
            }
            let root = self.persisted_active_root(&active.root.id).await?;
            self.swap(provider, root);
            return Ok(false);
        }

        let signing_cert = if provider.primary_uses_intermediate() {
            let intermediate = provider.generate_intermediate().await?;
            new_root.intermediate_certs.push(intermediate.clone());
            intermediate
        } else {
            new_root.root_cert.clone()
        };
        new_root.signing_key_id = crypto::signing_key_id_of(&signing_cert)?;

        if current.skips_cross_signing()? || config.skips_cross_signing()? {
            info!("Rotating to root {} without cross-signing", new_root.id);
        } else {
            if !active.provider.supports_cross_signing() {
                return Err(Error::validation(format!(
                    "provider '{}' cannot cross-sign, set \
                     ForceWithoutCrossSigning to rotate anyway",
                    active.provider.name()
                )));
            }
            let cross_signed =
                active.provider.cross_sign_ca(&new_root.root_cert).await?;
            new_root.intermediate_certs.push(cross_signed);
            info!(
                "Rotating from root {} to cross-signed root {}",
                active.root.id, new_root.id
            );
        }

        let new_id = new_root.id.clone();
        let request = CaRequest::SetRootsAndConfig {
            roots: replace_active(&stored.roots, new_root),
            config,
            roots_cas: stored.index,
            config_cas: Some(current.modify_index),
        };
        if !self.store.apply(request).await? {
            return Err(Error::stale(
                "root list or configuration changed during rotation",
            ));
        }

        let root = self.persisted_active_root(&new_id).await?;
        self.swap(provider, root);
        Ok(true)
    }
}

/// Fills in what a configuration update may leave out, and rejects
/// changing the cluster ID of a primary.
fn inherit(
    config: &mut CaConfiguration,
    current: &CaConfiguration,
    is_primary: bool,
) -> CaEmptyResult {
    if config.cluster_id.is_empty() || !is_primary {
        config.cluster_id = current.cluster_id.clone();
    } else if config.cluster_id != current.cluster_id {
        return Err(Error::validation("cluster ID cannot be changed"));
    }
    if config.state.is_empty() {
        config.state = current.state.clone();
    }
    Ok(())
}


//------------ Tests ---------------------------------------------------------
