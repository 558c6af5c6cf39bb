//! An in-process stand-in for the parts of the Vault PKI secrets engine
//! the Vault provider uses. Keys and certificates are real, so whatever
//! it issues verifies like the output of an actual Vault.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde_json::{json, Value};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use meshca::api::ca::{CaConfiguration, KeyType};
use meshca::commons::crypto;
use meshca::constants::{PROVIDER_VAULT, VAULT_LEAF_ROLE};

const ROOT_PATH: &str = "pki-root";
const INTERMEDIATE_PATH: &str = "pki-intermediate";


//------------ FakeVault -----------------------------------------------------

pub struct FakeVault {
    server: MockServer,
    state: Arc<Mutex<VaultState>>,
}

#[derive(Default)]
struct VaultState {
    mounts: BTreeSet<String>,
    root: Option<(X509, PKey<Private>)>,
    intermediate: Option<(X509, PKey<Private>)>,
    pending_key: Option<PKey<Private>>,
    intermediates_issued: usize,
}

impl FakeVault {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(VaultState::default()));
        let handler_state = state.clone();
        Mock::given(any())
            .respond_with(move |request: &Request| {
                let mut state = handler_state.lock().unwrap();
                state.handle(request)
            })
            .mount(&server)
            .await;
        FakeVault { server, state }
    }

    /// A Vault provider configuration pointing at this server.
    pub fn ca_config(&self) -> CaConfiguration {
        CaConfiguration::new(PROVIDER_VAULT, "")
            .with_option("Address", self.server.uri())
            .with_option("Token", "root")
            .with_option("RootPKIPath", ROOT_PATH)
            .with_option("IntermediatePKIPath", INTERMEDIATE_PATH)
    }

    /// How many intermediates the root mount has signed.
    pub fn intermediates_issued(&self) -> usize {
        self.state.lock().unwrap().intermediates_issued
    }
}

impl VaultState {
    fn handle(&mut self, request: &Request) -> ResponseTemplate {
        if request.headers.get("X-Vault-Token").is_none() {
            return error(403, "missing client token");
        }
        let path = request.url.path().trim_start_matches("/v1/").to_string();
        let body: Value = request.body_json().unwrap_or(Value::Null);
        let root_mount = format!("{ROOT_PATH}/");
        let int_mount = format!("{INTERMEDIATE_PATH}/");

        match (request.method.as_str(), path.as_str()) {
            ("GET", "sys/mounts") => {
                let mounts: serde_json::Map<String, Value> = self
                    .mounts
                    .iter()
                    .map(|mount| (mount.clone(), json!({ "type": "pki" })))
                    .collect();
                ResponseTemplate::new(200).set_body_json(Value::Object(mounts))
            }
            ("POST", mount) if mount.starts_with("sys/mounts/") => {
                let name = mount.trim_start_matches("sys/mounts/");
                self.mounts.insert(format!("{name}/"));
                ResponseTemplate::new(204)
            }
            ("DELETE", mount) if mount.starts_with("sys/mounts/") => {
                let name = mount.trim_start_matches("sys/mounts/");
                self.mounts.remove(&format!("{name}/"));
                if name == INTERMEDIATE_PATH {
                    self.intermediate = None;
                }
                ResponseTemplate::new(204)
            }
            ("GET", p) if p == format!("{root_mount}ca/pem") => {
                pem_response(self.root.as_ref())
            }
            ("GET", p) if p == format!("{int_mount}ca/pem") => {
                pem_response(self.intermediate.as_ref())
            }
            ("POST", p) if p == format!("{root_mount}root/generate/internal") => {
                self.generate_root(&body)
            }
            ("POST", p)
                if p == format!("{int_mount}intermediate/generate/internal") =>
            {
                self.generate_intermediate_csr(&body)
            }
            ("POST", p) if p == format!("{root_mount}root/sign-intermediate") => {
                self.sign_intermediate(&body)
            }
            ("POST", p) if p == format!("{int_mount}intermediate/set-signed") => {
                self.set_signed(&body)
            }
            ("POST", p) if p == format!("{int_mount}roles/{VAULT_LEAF_ROLE}") => {
                ResponseTemplate::new(204)
            }
            ("POST", p) if p == format!("{int_mount}sign/{VAULT_LEAF_ROLE}") => {
                self.sign_leaf(&body)
            }
            (method, path) => error(405, &format!("unsupported {method} {path}")),
        }
    }

    fn generate_root(&mut self, body: &Value) -> ResponseTemplate {
        let key = match new_key(body) {
            Ok(key) => key,
            Err(res) => return res,
        };
        let trust_domain = str_field(body, "uri_sans")
            .trim_start_matches("spiffe://")
            .to_string();
        let cert = crypto::self_signed_root(
            &key,
            str_field(body, "common_name"),
            &trust_domain,
            ttl_field(body),
        )
        .unwrap();
        let pem = crypto::certificate_to_pem(&cert).unwrap();
        self.root = Some((cert, key));
        data_response("certificate", pem)
    }

    fn generate_intermediate_csr(&mut self, body: &Value) -> ResponseTemplate {
        let key = match new_key(body) {
            Ok(key) => key,
            Err(res) => return res,
        };
        let uris = vec![str_field(body, "uri_sans").to_string()];
        let csr =
            crypto::build_csr(&key, str_field(body, "common_name"), &uris, true)
                .unwrap();
        self.pending_key = Some(key);
        data_response("csr", crypto::csr_to_pem(&csr).unwrap())
    }

    fn sign_intermediate(&mut self, body: &Value) -> ResponseTemplate {
        let Some((root, root_key)) = &self.root else {
            return error(400, "no root in mount");
        };
        let csr = match crypto::parse_csr(str_field(body, "csr")) {
            Ok(csr) => csr,
            Err(e) => return error(400, &e.to_string()),
        };
        match crypto::sign_ca_csr(&csr, root, root_key, ttl_field(body)) {
            Ok(cert) => {
                self.intermediates_issued += 1;
                data_response("certificate", crypto::certificate_to_pem(&cert).unwrap())
            }
            Err(e) => error(400, &e.to_string()),
        }
    }

    fn set_signed(&mut self, body: &Value) -> ResponseTemplate {
        let Some(key) = self.pending_key.take() else {
            return error(400, "no pending intermediate key");
        };
        let chain = crypto::parse_certificates(str_field(body, "certificate"))
            .unwrap_or_default();
        let Some(cert) = chain.into_iter().next() else {
            return error(400, "no certificate given");
        };
        self.intermediate = Some((cert, key));
        ResponseTemplate::new(204)
    }

    fn sign_leaf(&mut self, body: &Value) -> ResponseTemplate {
        let Some((intermediate, key)) = &self.intermediate else {
            return error(400, "no intermediate in mount");
        };
        let csr = match crypto::parse_csr(str_field(body, "csr")) {
            Ok(csr) => csr,
            Err(e) => return error(400, &e.to_string()),
        };
        match crypto::sign_leaf_csr(&csr, intermediate, key, ttl_field(body)) {
            Ok(cert) => {
                data_response("certificate", crypto::certificate_to_pem(&cert).unwrap())
            }
            Err(e) => error(400, &e.to_string()),
        }
    }
}


//------------ Helpers -------------------------------------------------------

fn str_field<'a>(body: &'a Value, field: &str) -> &'a str {
    body.get(field).and_then(Value::as_str).unwrap_or_default()
}

/// Vault TTLs as sent by the provider, such as "3600s".
fn ttl_field(body: &Value) -> Duration {
    let secs = str_field(body, "ttl")
        .trim_end_matches('s')
        .parse()
        .unwrap_or(3600);
    Duration::from_secs(secs)
}

fn new_key(body: &Value) -> Result<PKey<Private>, ResponseTemplate> {
    let key_type = KeyType::from_str(str_field(body, "key_type"))
        .map_err(|e| error(400, &e.to_string()))?;
    let bits = body.get("key_bits").and_then(Value::as_u64).unwrap_or(256);
    crypto::generate_private_key(key_type, bits as u32)
        .map_err(|e| error(400, &e.to_string()))
}

fn pem_response(entry: Option<&(X509, PKey<Private>)>) -> ResponseTemplate {
    match entry {
        Some((cert, _)) => ResponseTemplate::new(200)
            .set_body_string(crypto::certificate_to_pem(cert).unwrap()),
        None => ResponseTemplate::new(404),
    }
}

fn data_response(field: &str, value: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": { field: value } }))
}

fn error(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({ "errors": [message] }))
}
