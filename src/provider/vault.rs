//! A provider backed by the PKI secrets engine of an external Vault.
//!
//! The root lives in one PKI mount, the intermediate that signs leaves in
//! another. Secondary datacenters only use the intermediate mount and have
//! the primary sign their intermediate CSR.

use std::fs;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use url::Url;

use crate::api::ca::{
    CaConfiguration, CaRoot, CommonCaProviderConfig, ProviderState,
    TrustDomain,
};
use crate::commons::{crypto, CaResult, Error};
use crate::constants::*;
use super::{check_csr_trust_domain, Provider, ProviderContext};

const JSON_CONTENT: &str = "application/json";
const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";
const VAULT_NAMESPACE_HEADER: &str = "X-Vault-Namespace";


//------------ VaultProvider -------------------------------------------------

pub struct VaultProvider {
    client: reqwest::Client,
    address: Url,
    token: String,
    namespace: Option<String>,
    root_pki_path: String,
    intermediate_pki_path: String,
    common: CommonCaProviderConfig,
    trust_domain: TrustDomain,
    is_primary: bool,
    state: ProviderState,
}

impl VaultProvider {
    pub fn configure(
        config: &CaConfiguration,
        context: &ProviderContext,
    ) -> CaResult<Self> {
        if config.cluster_id.is_empty() {
            return Err(Error::validation("cluster ID must be set"));
        }
        let common = config.common()?;
        let VaultEndpoints {
            address,
            token,
            root_pki_path,
            intermediate_pki_path,
        } = VaultEndpoints::from_config(config)?;

        let client = Self::client(config)?;

        Ok(VaultProvider {
            client,
            address,
            token,
            namespace: config.string_option("Namespace").map(str::to_string),
            root_pki_path,
            intermediate_pki_path,
            common,
            trust_domain: config.trust_domain(),
            is_primary: context.is_primary,
            state: config.state.clone(),
        })
    }

    /// Checks the options without contacting Vault.
    pub fn validate(config: &CaConfiguration) -> CaResult<()> {
        config.common()?;
        VaultEndpoints::from_config(config)?;
        Self::client(config)?;
        Ok(())
    }

    fn client(config: &CaConfiguration) -> CaResult<reqwest::Client> {
        let mut builder =
            reqwest::ClientBuilder::new().timeout(HTTP_CLIENT_TIMEOUT);

        if let Some(path) = config.string_option("CAFile") {
            let pem = fs::read(path).map_err(|e| {
                Error::validation(format!("cannot read CAFile '{path}': {e}"))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::validation(format!("invalid CAFile '{path}': {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if bool_option(config, "TLSSkipVerify") {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(Error::provider_init)
    }

    fn require_primary(&self) -> CaResult<()> {
        if self.is_primary {
            Ok(())
        } else {
            Err(Error::NotPrimary)
        }
    }

    fn key_params(&self) -> (String, u32) {
        (
            self.common.private_key_type.to_string(),
            self.common.private_key_bits,
        )
    }

    /// Makes sure a PKI engine is mounted at `path`.
    async fn setup_mount(&self, path: &str, max_ttl: Duration) -> CaResult<()> {
        let mounts = self.get_json("sys/mounts").await?;
        let exists = mounts.get(path).is_some()
            || mounts.get("data").and_then(|d| d.get(path)).is_some();
        if exists {
            return Ok(());
        }

        info!("Mounting Vault PKI engine at {path}");
        self.post_json(
            &format!("sys/mounts/{}", path.trim_end_matches('/')),
            json!({
                "type": "pki",
                "description": format!("Mesh CA for {}", self.trust_domain),
                "config": { "max_lease_ttl": vault_ttl(max_ttl) },
            }),
        )
        .await?;
        Ok(())
    }

    async fn ensure_leaf_role(&self) -> CaResult<()> {
        self.post_json(
            &format!("{}roles/{VAULT_LEAF_ROLE}", self.intermediate_pki_path),
            json!({
                "allow_any_name": true,
                "allowed_uri_sans": format!("{SPIFFE_SCHEME}://*"),
                "key_type": "any",
                "max_ttl": vault_ttl(self.common.leaf_cert_ttl),
                "no_store": true,
                "require_cn": false,
            }),
        )
        .await?;
        Ok(())
    }

    async fn root_pem(&self) -> CaResult<Option<String>> {
        self.get_opt_text(&format!("{}ca/pem", self.root_pki_path)).await
    }
}

/// # HTTP access
impl VaultProvider {
    fn uri(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address.as_str().trim_end_matches('/'), path)
    }

    fn headers(&self, content_type: Option<&str>) -> CaResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(HTTP_USER_AGENT));
        if let Some(content_type) = content_type {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_str(content_type).map_err(Error::custom)?,
            );
        }
        headers.insert(
            VAULT_TOKEN_HEADER,
            HeaderValue::from_str(&self.token).map_err(|_| {
                Error::validation("Vault token contains invalid characters")
            })?,
        );
        if let Some(namespace) = &self.namespace {
            headers.insert(
                VAULT_NAMESPACE_HEADER,
                HeaderValue::from_str(namespace).map_err(|_| {
                    Error::validation("Vault namespace contains invalid characters")
                })?,
            );
        }
        Ok(headers)
    }

    async fn get_opt_text(&self, path: &str) -> CaResult<Option<String>> {
        let uri = self.uri(path);
        let res = self
            .client
            .get(&uri)
            .headers(self.headers(None)?)
            .send()
            .await
            .map_err(|e| execute_error(&uri, e))?;
        opt_text_response(&uri, res).await
    }

    async fn get_json(&self, path: &str) -> CaResult<Value> {
        let uri = self.uri(path);
        match self.get_opt_text(path).await? {
            Some(body) => parse_json(&uri, &body),
            None => Ok(Value::Null),
        }
    }

    async fn post_json(&self, path: &str, body: Value) -> CaResult<Value> {
        let uri = self.uri(path);
        let res = self
            .client
            .post(&uri)
            .headers(self.headers(Some(JSON_CONTENT))?)
            .body(serde_json::to_string(&body)?)
            .send()
            .await
            .map_err(|e| execute_error(&uri, e))?;

        match opt_text_response(&uri, res).await? {
            Some(body) => parse_json(&uri, &body),
            None => Ok(Value::Null),
        }
    }

    async fn delete(&self, path: &str) -> CaResult<()> {
        let uri = self.uri(path);
        let res = self
            .client
            .delete(&uri)
            .headers(self.headers(None)?)
            .send()
            .await
            .map_err(|e| execute_error(&uri, e))?;
        opt_text_response(&uri, res).await?;
        Ok(())
    }

    /// Posts and returns a string field of the response's `data`.
    async fn post_for_data(
        &self,
        path: &str,
        body: Value,
        field: &str,
    ) -> CaResult<String> {
        let res = self.post_json(path, body).await?;
        res.get("data")
            .and_then(|data| data.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::provider_init(format!(
                    "Vault response for {path} lacks data.{field}"
                ))
            })
    }
}

#[async_trait]
impl Provider for VaultProvider {
    fn name(&self) -> &str {
        PROVIDER_VAULT
    }

    async fn generate_root(&self) -> CaResult<CaRoot> {
        self.require_primary()?;
        self.setup_mount(&self.root_pki_path, self.common.root_cert_ttl)
            .await?;

        let pem = match self.root_pem().await? {
            Some(pem) => pem,
            None => {
                let (key_type, key_bits) = self.key_params();
                self.post_json(
                    &format!("{}root/generate/internal", self.root_pki_path),
                    json!({
                        "common_name": format!(
                            "Vault CA Root Cert {:x}",
                            crypto::random_serial()?
                        ),
                        "uri_sans": crypto::ca_uri(self.trust_domain.as_str()),
                        "key_type": key_type,
                        "key_bits": key_bits,
                        "ttl": vault_ttl(self.common.root_cert_ttl),
                    }),
                )
                .await?;
                self.root_pem().await?.ok_or_else(|| {
                    Error::provider_init("Vault did not return the new root")
                })?
            }
        };

        CaRoot::parse(&pem, PROVIDER_VAULT)
    }

    async fn active_root(&self) -> CaResult<String> {
        if self.is_primary {
            return self
                .root_pem()
                .await?
                .ok_or(Error::CaNotInitialized);
        }

        // The chain installed with the intermediate ends in the root.
        let chain = self
            .get_opt_text(&format!("{}cert/ca_chain", self.intermediate_pki_path))
            .await?
            .ok_or(Error::CaNotInitialized)?;
        let root = crypto::parse_certificates(&chain)?
            .pop()
            .ok_or(Error::CaNotInitialized)?;
        crypto::certificate_to_pem(&root)
    }

    async fn generate_intermediate(&self) -> CaResult<String> {
        self.require_primary()?;
        let csr = self.generate_intermediate_csr().await?;
        let intermediate = self.sign_intermediate(&csr).await?;
        let root = self.active_root().await?;
        self.set_intermediate(&intermediate, &root).await?;
        Ok(intermediate)
    }

    async fn active_intermediate(&self) -> CaResult<String> {
        self.get_opt_text(&format!("{}ca/pem", self.intermediate_pki_path))
            .await?
            .ok_or(Error::CaNotInitialized)
    }

    async fn generate_intermediate_csr(&self) -> CaResult<String> {
        self.setup_mount(
            &self.intermediate_pki_path,
            self.common.intermediate_cert_ttl,
        )
        .await?;

        let (key_type, key_bits) = self.key_params();
        self.post_for_data(
            &format!("{}intermediate/generate/internal", self.intermediate_pki_path),
            json!({
                "common_name": "Vault CA Intermediate Authority",
                "uri_sans": crypto::ca_uri(self.trust_domain.as_str()),
                "key_type": key_type,
                "key_bits": key_bits,
            }),
            "csr",
        )
        .await
    }

    async fn set_intermediate(
        &self,
        intermediate_pem: &str,
        root_pem: &str,
    ) -> CaResult<()> {
        crypto::verify_chain(intermediate_pem, &[], root_pem)?;

        self.post_json(
            &format!("{}intermediate/set-signed", self.intermediate_pki_path),
            json!({
                "certificate": format!("{}\n{}", intermediate_pem.trim(), root_pem.trim()),
            }),
        )
        .await?;
        self.ensure_leaf_role().await?;
        debug!("Installed intermediate in {}", self.intermediate_pki_path);
        Ok(())
    }

    async fn sign(&self, csr_pem: &str) -> CaResult<String> {
        check_csr_trust_domain(csr_pem, self.trust_domain.as_str())?;
        self.post_for_data(
            &format!("{}sign/{VAULT_LEAF_ROLE}", self.intermediate_pki_path),
            json!({
                "csr": csr_pem,
                "ttl": vault_ttl(self.common.leaf_cert_ttl),
            }),
            "certificate",
        )
        .await
        .map_err(into_signing_error)
    }

    async fn sign_intermediate(&self, csr_pem: &str) -> CaResult<String> {
        self.require_primary()?;
        check_csr_trust_domain(csr_pem, self.trust_domain.as_str())?;
        self.post_for_data(
            &format!("{}root/sign-intermediate", self.root_pki_path),
            json!({
                "csr": csr_pem,
                "use_csr_values": true,
                "format": "pem_bundle",
                "ttl": vault_ttl(self.common.intermediate_cert_ttl),
            }),
            "certificate",
        )
        .await
        .map_err(into_signing_error)
    }

    async fn cross_sign_ca(&self, cert_pem: &str) -> CaResult<String> {
        self.require_primary()?;
        crypto::parse_certificate(cert_pem)?;
        self.post_for_data(
            &format!("{}root/sign-self-issued", self.root_pki_path),
            json!({ "certificate": cert_pem }),
            "certificate",
        )
        .await
        .map_err(into_signing_error)
    }

    fn supports_cross_signing(&self) -> bool {
        true
    }

    fn primary_uses_intermediate(&self) -> bool {
        true
    }

    fn state(&self) -> ProviderState {
        self.state.clone()
    }

    async fn cleanup(
        &self,
        provider_type_change: bool,
        other: &CaConfiguration,
    ) -> CaResult<()> {
        let same_mount = other
            .string_option("IntermediatePKIPath")
            .map(pki_path)
            .is_some_and(|path| path == self.intermediate_pki_path);
        if !provider_type_change && same_mount {
            return Ok(());
        }

        info!("Unmounting Vault PKI engine at {}", self.intermediate_pki_path);
        self.delete(&format!(
            "sys/mounts/{}",
            self.intermediate_pki_path.trim_end_matches('/')
        ))
        .await
    }
}


//------------ VaultEndpoints ------------------------------------------------

/// Where to find Vault and the two PKI mounts.
struct VaultEndpoints {
    address: Url,
    token: String,
    root_pki_path: String,
    intermediate_pki_path: String,
}

impl VaultEndpoints {
    fn from_config(config: &CaConfiguration) -> CaResult<Self> {
        let address = required_option(config, "Address")?;
        let address = Url::parse(address).map_err(|e| {
            Error::validation(format!("invalid Vault address '{address}': {e}"))
        })?;
        let token = required_option(config, "Token")?.to_string();
        let root_pki_path = pki_path(required_option(config, "RootPKIPath")?);
        let intermediate_pki_path =
            pki_path(required_option(config, "IntermediatePKIPath")?);
        if root_pki_path == intermediate_pki_path {
            return Err(Error::validation(
                "RootPKIPath and IntermediatePKIPath must differ",
            ));
        }
        Ok(VaultEndpoints {
            address,
            token,
            root_pki_path,
            intermediate_pki_path,
        })
    }
}


//------------ Helpers -------------------------------------------------------

fn required_option<'a>(
    config: &'a CaConfiguration,
    key: &str,
) -> CaResult<&'a str> {
    config.string_option(key).ok_or_else(|| {
        Error::validation(format!("Vault provider requires '{key}'"))
    })
}

fn bool_option(config: &CaConfiguration, key: &str) -> bool {
    match config.config.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Mount paths always end in a slash.
fn pki_path(path: &str) -> String {
    let path = path.trim_matches('/');
    format!("{path}/")
}

fn vault_ttl(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs().max(1))
}

fn execute_error(uri: &str, e: reqwest::Error) -> Error {
    Error::provider_init(format!("Issue accessing Vault at {uri}: {e}"))
}

fn parse_json(uri: &str, body: &str) -> CaResult<Value> {
    serde_json::from_str(body).map_err(|e| {
        Error::provider_init(format!(
            "could not parse JSON response from {uri}: {e}"
        ))
    })
}

fn into_signing_error(e: Error) -> Error {
    match e {
        Error::ProviderInit(msg) => Error::Signing(msg),
        e => e,
    }
}

/// Returns the body of a successful response, `None` if there is no
/// content.
async fn opt_text_response(uri: &str, res: Response) -> CaResult<Option<String>> {
    match res.status() {
        StatusCode::OK => match res.text().await.ok() {
            Some(s) if !s.trim().is_empty() => Ok(Some(s)),
            _ => Ok(None),
        },
        StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
        status => {
            let body = res.text().await.unwrap_or_default();
            Err(Error::provider_init(format!(
                "Vault returned {status} for {uri}: {body}"
            )))
        }
    }
}


//------------ Tests ---------------------------------------------------------
