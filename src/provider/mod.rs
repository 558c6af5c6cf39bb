//! Pluggable signing backends.
//!
//! A [`Provider`] owns the keys of one datacenter: the root for a primary
//! datacenter, an intermediate signed by the primary for a secondary one.
//! The CA manager never touches key material itself.

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::ca::{CaConfiguration, CaRoot, ProviderState};
use crate::commons::{crypto, CaResult, Error};
use crate::constants::{PROVIDER_BUILTIN, PROVIDER_VAULT};
use crate::store::CaStore;

pub mod builtin;
pub mod vault;

pub use self::builtin::BuiltinProvider;
pub use self::vault::VaultProvider;


//------------ Provider ------------------------------------------------------

#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider name as used in [`CaConfiguration::provider`].
    fn name(&self) -> &str;

    /// Creates the root if it does not exist yet and returns it. Calling
    /// this again returns the same root. Only valid in the primary
    /// datacenter.
    async fn generate_root(&self) -> CaResult<CaRoot>;

    /// Returns the PEM of the root this provider chains to.
    async fn active_root(&self) -> CaResult<String>;

    /// Creates a new signing certificate under the local root and returns
    /// it. A provider that signs leaves with its root returns the root.
    /// Only valid in the primary datacenter.
    async fn generate_intermediate(&self) -> CaResult<String>;

    /// Returns the certificate that currently signs leaves.
    async fn active_intermediate(&self) -> CaResult<String>;

    /// Creates a new intermediate key and returns a CSR for it, to be
    /// signed by the primary datacenter.
    async fn generate_intermediate_csr(&self) -> CaResult<String>;

    /// Installs an intermediate signed by the primary for the key of the
    /// last generated CSR. The intermediate must chain to `root_pem`.
    async fn set_intermediate(
        &self,
        intermediate_pem: &str,
        root_pem: &str,
    ) -> CaResult<()>;

    /// Signs a leaf CSR. Failures are never retried here.
    async fn sign(&self, csr_pem: &str) -> CaResult<String>;

    /// Signs the intermediate CSR of another datacenter with the root.
    async fn sign_intermediate(&self, csr_pem: &str) -> CaResult<String>;

    /// Has this provider's root counter-sign a CA certificate produced by
    /// another provider.
    async fn cross_sign_ca(&self, cert_pem: &str) -> CaResult<String>;

    fn supports_cross_signing(&self) -> bool;

    /// Whether leaves in the primary datacenter are signed by an
    /// intermediate rather than by the root itself.
    fn primary_uses_intermediate(&self) -> bool;

    /// Recovery data to persist in the configuration.
    fn state(&self) -> ProviderState;

    /// Releases backend resources once this provider is replaced by the
    /// one configured with `other`.
    async fn cleanup(
        &self,
        provider_type_change: bool,
        other: &CaConfiguration,
    ) -> CaResult<()>;
}


//------------ ProviderContext -----------------------------------------------

/// What a provider needs to know about where it runs.
#[derive(Clone)]
pub struct ProviderContext {
    pub datacenter: String,
    pub is_primary: bool,
    pub store: Arc<dyn CaStore>,
}

impl ProviderContext {
    pub fn new(
        datacenter: &str,
        is_primary: bool,
        store: Arc<dyn CaStore>,
    ) -> Self {
        ProviderContext {
            datacenter: datacenter.to_string(),
            is_primary,
            store,
        }
    }
}


//------------ build_provider ------------------------------------------------

/// Instantiates and configures the provider named in the configuration.
pub async fn build_provider(
    config: &CaConfiguration,
    context: &ProviderContext,
) -> CaResult<Arc<dyn Provider>> {
    match config.provider.as_str() {
        PROVIDER_BUILTIN => {
            let provider = BuiltinProvider::configure(config, context).await?;
            Ok(Arc::new(provider))
        }
        PROVIDER_VAULT => {
            let provider = VaultProvider::configure(config, context)?;
            Ok(Arc::new(provider))
        }
        other => Err(Error::UnknownProvider(other.to_string())),
    }
}

/// Checks a configuration the way [`build_provider`] would, but without
/// touching the store or the backend. Used to reject a configuration
/// before it is persisted.
pub fn validate_config(config: &CaConfiguration) -> CaResult<()> {
    match config.provider.as_str() {
        PROVIDER_BUILTIN => BuiltinProvider::validate(config),
        PROVIDER_VAULT => VaultProvider::validate(config),
        other => Err(Error::UnknownProvider(other.to_string())),
    }
}

/// Checks that a leaf or intermediate CSR asks for an identity within
/// `trust_domain`.
pub(crate) fn check_csr_trust_domain(
    csr_pem: &str,
    trust_domain: &str,
) -> CaResult<()> {
    let csr = crypto::parse_csr(csr_pem)?;
    let uris = crypto::csr_uri_sans(&csr)?;
    match crypto::spiffe_trust_domain(&uris) {
        None => Err(Error::signing("CSR does not carry a SPIFFE URI")),
        Some(domain) if domain != trust_domain => Err(Error::signing(format!(
            "CSR trust domain '{domain}' does not match '{trust_domain}'"
        ))),
        Some(_) => Ok(()),
    }
}
