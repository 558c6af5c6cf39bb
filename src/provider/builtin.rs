//! The self-contained provider: keys are generated locally with OpenSSL
//! and kept in the replicated state, so that every leader signs with the
//! same keys.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tokio::sync::RwLock;

use crate::api::ca::{
    CaConfiguration, CaRoot, CommonCaProviderConfig, ProviderState,
    TrustDomain,
};
use crate::commons::{crypto, CaResult, Error};
use crate::constants::PROVIDER_BUILTIN;
use crate::store::{CaRequest, CaStore, ProviderKeyState};
use super::{check_csr_trust_domain, Provider, ProviderContext};


//------------ BuiltinProvider -----------------------------------------------

pub struct BuiltinProvider {
    /// Identifies the key state in the store.
    id: String,
    common: CommonCaProviderConfig,
    trust_domain: TrustDomain,
    datacenter: String,
    is_primary: bool,
    state: ProviderState,

    /// Key material supplied through the configuration.
    seed_key: Option<String>,
    seed_root: Option<String>,

    store: Arc<dyn CaStore>,
    keys: RwLock<Option<ProviderKeyState>>,

    /// The key of the last intermediate CSR, until its certificate is set.
    pending_key: Mutex<Option<String>>,
}

impl BuiltinProvider {
    pub async fn configure(
        config: &CaConfiguration,
        context: &ProviderContext,
    ) -> CaResult<Self> {
        if config.cluster_id.is_empty() {
            return Err(Error::validation("cluster ID must be set"));
        }
        let common = config.common()?;
        Self::validate(config)?;

        let seed_key = config.string_option("PrivateKey").map(str::to_string);
        let seed_root = config.string_option("RootCert").map(str::to_string);

        let id = Self::provider_id(config, &common, context)?;
        let keys = context.store.provider_state(&id).await?;
        debug!(
            "Configured builtin provider {id} for datacenter {}, stored keys: {}",
            context.datacenter,
            keys.is_some()
        );

        Ok(BuiltinProvider {
            id,
            common,
            trust_domain: config.trust_domain(),
            datacenter: context.datacenter.clone(),
            is_primary: context.is_primary,
            state: config.state.clone(),
            seed_key,
            seed_root,
            store: context.store.clone(),
            keys: RwLock::new(keys),
            pending_key: Mutex::new(None),
        })
    }

    /// Checks the options, including any supplied key material, without
    /// touching the store.
    pub fn validate(config: &CaConfiguration) -> CaResult<()> {
        config.common()?;
        match (
            config.string_option("PrivateKey"),
            config.string_option("RootCert"),
        ) {
            (None, Some(_)) => Err(Error::validation(
                "RootCert was given without PrivateKey",
            )),
            (Some(key), root) => {
                crypto::parse_private_key(key)?;
                if let Some(root) = root {
                    crypto::parse_certificate(root)?;
                }
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// Derives the key state ID from everything that determines the
    /// signing material.
    fn provider_id(
        config: &CaConfiguration,
        common: &CommonCaProviderConfig,
        context: &ProviderContext,
    ) -> CaResult<String> {
        let role = if context.is_primary { "primary" } else { "secondary" };
        let bits = common.private_key_bits.to_string();
        let key_type = common.private_key_type.to_string();
        let parts = [
            config.cluster_id.as_str(),
            context.datacenter.as_str(),
            role,
            config.string_option("PrivateKey").unwrap_or_default(),
            config.string_option("RootCert").unwrap_or_default(),
            key_type.as_str(),
            bits.as_str(),
        ];

        let mut hasher = openssl::sha::Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update(&[0]);
        }
        Ok(hex::encode(hasher.finish()))
    }

    fn require_primary(&self) -> CaResult<()> {
        if self.is_primary {
            Ok(())
        } else {
            Err(Error::NotPrimary)
        }
    }

    async fn persist(&self, keys: ProviderKeyState) -> CaResult<()> {
        self.store
            .apply(CaRequest::SetProviderState(keys.clone()))
            .await?;
        *self.keys.write().await = Some(keys);
        Ok(())
    }

    /// Returns the certificate and key leaves are signed with.
    async fn signer(&self) -> CaResult<(X509, PKey<Private>)> {
        let keys = self.keys.read().await;
        let keys = keys.as_ref().ok_or(Error::CaNotInitialized)?;
        let cert = if self.is_primary {
            keys.root_cert.as_deref()
        } else {
            keys.intermediate_cert.as_deref()
        };
        let cert = cert.ok_or(Error::CaNotInitialized)?;
        Ok((
            crypto::parse_certificate(cert)?,
            crypto::parse_private_key(&keys.private_key)?,
        ))
    }

    /// Returns the root certificate and its key, primary only.
    async fn root_signer(&self) -> CaResult<(X509, PKey<Private>)> {
        self.require_primary()?;
        self.signer().await
    }
}

#[async_trait]
impl Provider for BuiltinProvider {
    fn name(&self) -> &str {
        PROVIDER_BUILTIN
    }

    async fn generate_root(&self) -> CaResult<CaRoot> {
        self.require_primary()?;

        let mut keys = self.keys.write().await;
        if let Some(root) = keys.as_ref().and_then(|k| k.root_cert.as_ref()) {
            return CaRoot::parse(root, PROVIDER_BUILTIN);
        }

        let key = match &self.seed_key {
            Some(pem) => crypto::parse_private_key(pem)?,
            None => crypto::generate_private_key(
                self.common.private_key_type,
                self.common.private_key_bits,
            )?,
        };
        let root_pem = match &self.seed_root {
            Some(pem) => pem.clone(),
            None => {
                let cn = format!("Mesh CA Root {:x}", crypto::random_serial()?);
                let cert = crypto::self_signed_root(
                    &key,
                    &cn,
                    self.trust_domain.as_str(),
                    self.common.root_cert_ttl,
                )?;
                crypto::certificate_to_pem(&cert)?
            }
        };

        let state = ProviderKeyState {
            id: self.id.clone(),
            private_key: crypto::private_key_to_pem(&key)?,
            root_cert: Some(root_pem.clone()),
            intermediate_cert: None,
        };
        self.store
            .apply(CaRequest::SetProviderState(state.clone()))
            .await?;
        *keys = Some(state);

        let root = CaRoot::parse(&root_pem, PROVIDER_BUILTIN)?;
        info!(
            "Generated builtin root {} for trust domain {}",
            root.id, self.trust_domain
        );
        Ok(root)
    }

    async fn active_root(&self) -> CaResult<String> {
        let keys = self.keys.read().await;
        keys.as_ref()
            .and_then(|k| k.root_cert.clone())
            .ok_or(Error::CaNotInitialized)
    }

    async fn generate_intermediate(&self) -> CaResult<String> {
        self.require_primary()?;
        self.active_root().await
    }

    async fn active_intermediate(&self) -> CaResult<String> {
        if self.is_primary {
            return self.active_root().await;
        }
        let keys = self.keys.read().await;
        keys.as_ref()
            .and_then(|k| k.intermediate_cert.clone())
            .ok_or(Error::CaNotInitialized)
    }

    async fn generate_intermediate_csr(&self) -> CaResult<String> {
        let key = crypto::generate_private_key(
            self.common.private_key_type,
            self.common.private_key_bits,
        )?;
        let cn = format!(
            "Mesh CA Intermediate {} {:x}",
            self.datacenter,
            crypto::random_serial()?
        );
        let csr = crypto::build_csr(
            &key,
            &cn,
            &[crypto::ca_uri(self.trust_domain.as_str())],
            true,
        )?;

        *self.pending_key.lock().expect("poisoned lock") =
            Some(crypto::private_key_to_pem(&key)?);
        crypto::csr_to_pem(&csr)
    }

    async fn set_intermediate(
        &self,
        intermediate_pem: &str,
        root_pem: &str,
    ) -> CaResult<()> {
        let key_pem = self
            .pending_key
            .lock()
            .expect("poisoned lock")
            .clone()
            .ok_or_else(|| {
                Error::validation("no intermediate CSR is awaiting signing")
            })?;

        let key = crypto::parse_private_key(&key_pem)?;
        let cert = crypto::parse_certificate(intermediate_pem)?;
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::validation(
                "intermediate certificate does not match the private key",
            ));
        }
        crypto::verify_chain(intermediate_pem, &[], root_pem)?;

        self.persist(ProviderKeyState {
            id: self.id.clone(),
            private_key: key_pem,
            root_cert: Some(root_pem.to_string()),
            intermediate_cert: Some(intermediate_pem.to_string()),
        })
        .await?;
        *self.pending_key.lock().expect("poisoned lock") = None;
        Ok(())
    }

    async fn sign(&self, csr_pem: &str) -> CaResult<String> {
        check_csr_trust_domain(csr_pem, self.trust_domain.as_str())?;
        let csr = crypto::parse_csr(csr_pem)?;
        let (cert, key) = self.signer().await?;
        let leaf = crypto::sign_leaf_csr(
            &csr,
            &cert,
            &key,
            self.common.leaf_cert_ttl,
        )?;
        crypto::certificate_to_pem(&leaf)
    }

    async fn sign_intermediate(&self, csr_pem: &str) -> CaResult<String> {
        let (root, key) = self.root_signer().await?;
        check_csr_trust_domain(csr_pem, self.trust_domain.as_str())?;
        let csr = crypto::parse_csr(csr_pem)?;
        let cert = crypto::sign_ca_csr(
            &csr,
            &root,
            &key,
            self.common.intermediate_cert_ttl,
        )?;
        crypto::certificate_to_pem(&cert)
    }

    async fn cross_sign_ca(&self, cert_pem: &str) -> CaResult<String> {
        let (root, key) = self.root_signer().await?;
        let cert = crypto::parse_certificate(cert_pem)?;
        let cross_signed = crypto::cross_sign(&cert, &root, &key)?;
        crypto::certificate_to_pem(&cross_signed)
    }

    fn supports_cross_signing(&self) -> bool {
        true
    }

    fn primary_uses_intermediate(&self) -> bool {
        false
    }

    fn state(&self) -> ProviderState {
        self.state.clone()
    }

    async fn cleanup(
        &self,
        provider_type_change: bool,
        other: &CaConfiguration,
    ) -> CaResult<()> {
        if !provider_type_change {
            let context = ProviderContext::new(
                &self.datacenter,
                self.is_primary,
                self.store.clone(),
            );
            let same_keys = other
                .common()
                .and_then(|common| Self::provider_id(other, &common, &context))
                .map(|id| id == self.id)
                .unwrap_or(false);
            if same_keys {
                return Ok(());
            }
        }

        debug!("Removing builtin provider key state {}", self.id);
        self.store
            .apply(CaRequest::DeleteProviderState { id: self.id.clone() })
            .await?;
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCaStore;

    const CLUSTER: &str = "11111111-2222-3333-4444-555555555555";

    fn context(store: &Arc<MemoryCaStore>, primary: bool) -> ProviderContext {
        ProviderContext::new("dc1", primary, store.clone())
    }

    fn leaf_csr(trust_domain: &str) -> String {
        let key = crypto::generate_private_key(crate::api::ca::KeyType::Ec, 256).unwrap();
        let uri = format!("spiffe://{trust_domain}/ns/default/dc/dc1/svc/web");
        let csr = crypto::build_csr(&key, "web", &[uri], false).unwrap();
        crypto::csr_to_pem(&csr).unwrap()
    }

    #[tokio::test]
    async fn generate_root_is_idempotent_and_survives_new_instances() {
        let store = Arc::new(MemoryCaStore::new());
        let config = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER);

        let provider = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        let root = provider.generate_root().await.unwrap();
        assert_eq!(provider.generate_root().await.unwrap().id, root.id);

        let again = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        assert_eq!(again.generate_root().await.unwrap().id, root.id);
        assert_eq!(again.active_intermediate().await.unwrap(), root.root_cert);

        // TTL changes do not touch the signing material
        let ttl = config.clone().with_option("LeafCertTTL", "48h");
        let same = BuiltinProvider::configure(&ttl, &context(&store, true)).await.unwrap();
        assert_eq!(same.generate_root().await.unwrap().id, root.id);

        let rsa = config.clone().with_option("PrivateKeyType", "rsa");
        let other = BuiltinProvider::configure(&rsa, &context(&store, true)).await.unwrap();
        assert_ne!(other.generate_root().await.unwrap().id, root.id);
    }

    #[tokio::test]
    async fn primary_signs_leaves_in_its_trust_domain() {
        let store = Arc::new(MemoryCaStore::new());
        let config = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER);
        let provider = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        let root = provider.generate_root().await.unwrap();

        let td = config.trust_domain();
        let leaf = provider.sign(&leaf_csr(td.as_str())).await.unwrap();
        crypto::verify_chain(&leaf, &[], &root.root_cert).unwrap();

        let foreign = provider.sign(&leaf_csr("other.mesh")).await;
        assert!(matches!(foreign, Err(Error::Signing(_))));
        assert!(matches!(provider.sign("garbage").await, Err(Error::Signing(_))));
    }

    #[tokio::test]
    async fn secondary_uses_intermediate_signed_by_primary() {
        let store = Arc::new(MemoryCaStore::new());
        let config = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER);
        let primary = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        let root = primary.generate_root().await.unwrap();

        let secondary_store = Arc::new(MemoryCaStore::new());
        let secondary_ctx = ProviderContext::new("dc2", false, secondary_store.clone());
        let secondary = BuiltinProvider::configure(&config, &secondary_ctx).await.unwrap();
        assert!(matches!(secondary.generate_root().await, Err(Error::NotPrimary)));
        assert!(secondary.active_intermediate().await.is_err());

        let csr = secondary.generate_intermediate_csr().await.unwrap();
        let intermediate = primary.sign_intermediate(&csr).await.unwrap();
        secondary.set_intermediate(&intermediate, &root.root_cert).await.unwrap();
        assert_eq!(secondary.active_intermediate().await.unwrap(), intermediate);

        let leaf = secondary.sign(&leaf_csr(config.trust_domain().as_str())).await.unwrap();
        crypto::verify_chain(&leaf, &[intermediate.clone()], &root.root_cert).unwrap();

        // Nothing pending anymore
        assert!(secondary.set_intermediate(&intermediate, &root.root_cert).await.is_err());
    }

    #[tokio::test]
    async fn intermediate_must_match_pending_key() {
        let store = Arc::new(MemoryCaStore::new());
        let config = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER);
        let primary = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        let root = primary.generate_root().await.unwrap();

        let secondary_ctx = ProviderContext::new("dc2", false, Arc::new(MemoryCaStore::new()));
        let secondary = BuiltinProvider::configure(&config, &secondary_ctx).await.unwrap();
        let first = secondary.generate_intermediate_csr().await.unwrap();
        secondary.generate_intermediate_csr().await.unwrap();

        let intermediate = primary.sign_intermediate(&first).await.unwrap();
        let res = secondary.set_intermediate(&intermediate, &root.root_cert).await;
        assert!(matches!(res, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn primary_refuses_intermediate_of_other_trust_domain() {
        let store = Arc::new(MemoryCaStore::new());
        let config = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER);
        let primary = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        primary.generate_root().await.unwrap();

        let other = CaConfiguration::new(PROVIDER_BUILTIN, "99999999-8888-7777-6666-555555555555");
        let secondary_ctx = ProviderContext::new("dc2", false, Arc::new(MemoryCaStore::new()));
        let secondary = BuiltinProvider::configure(&other, &secondary_ctx).await.unwrap();
        let csr = secondary.generate_intermediate_csr().await.unwrap();

        let res = primary.sign_intermediate(&csr).await;
        assert!(matches!(res, Err(Error::Signing(_))));
    }

    #[tokio::test]
    async fn configured_key_material() {
        let store = Arc::new(MemoryCaStore::new());
        let key = crypto::generate_private_key(crate::api::ca::KeyType::Ec, 256).unwrap();
        let key_pem = crypto::private_key_to_pem(&key).unwrap();
        let td = TrustDomain::from_cluster_id(CLUSTER);
        let cert = crypto::self_signed_root(&key, "Given Root", td.as_str(), std::time::Duration::from_secs(3600)).unwrap();
        let cert_pem = crypto::certificate_to_pem(&cert).unwrap();

        let config = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER)
            .with_option("PrivateKey", key_pem.as_str())
            .with_option("RootCert", cert_pem.as_str());
        let provider = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        let root = provider.generate_root().await.unwrap();
        assert_eq!(root.id, crypto::fingerprint(&cert).unwrap());

        let no_key = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER)
            .with_option("RootCert", cert_pem.as_str());
        let res = BuiltinProvider::configure(&no_key, &context(&store, true)).await;
        assert!(matches!(res, Err(Error::Validation(_))));

        let bad_key = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER)
            .with_option("PrivateKey", "not a key");
        let res = BuiltinProvider::configure(&bad_key, &context(&store, true)).await;
        assert!(matches!(res, Err(Error::Validation(_))));

        // Validation alone finds the same problems
        BuiltinProvider::validate(&config).unwrap();
        assert!(matches!(BuiltinProvider::validate(&no_key), Err(Error::Validation(_))));
        let bad_root = config.clone().with_option("RootCert", "not a pem");
        assert!(matches!(BuiltinProvider::validate(&bad_root), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn cleanup_keeps_state_shared_with_next_config() {
        let store = Arc::new(MemoryCaStore::new());
        let config = CaConfiguration::new(PROVIDER_BUILTIN, CLUSTER);
        let provider = BuiltinProvider::configure(&config, &context(&store, true)).await.unwrap();
        provider.generate_root().await.unwrap();
        let id = provider.id.clone();

        let ttl = config.clone().with_option("LeafCertTTL", "48h");
        provider.cleanup(false, &ttl).await.unwrap();
        assert!(store.provider_state(&id).await.unwrap().is_some());

        let rsa = config.clone().with_option("PrivateKeyType", "rsa");
        provider.cleanup(false, &rsa).await.unwrap();
        assert!(store.provider_state(&id).await.unwrap().is_none());
    }
}
