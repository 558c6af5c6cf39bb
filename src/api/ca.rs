//! CA roots, CA configuration and the provider configuration every
//! backend understands.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commons::crypto;
use crate::commons::ext_serde::{
    de_duration, de_flexible_bool, ser_duration,
};
use crate::commons::{CaResult, Error};
use crate::constants::*;


//------------ KeyType -------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ec,
    Rsa,
}

impl KeyType {
    pub fn default_bits(self) -> u32 {
        match self {
            KeyType::Ec => DEFAULT_EC_KEY_BITS,
            KeyType::Rsa => DEFAULT_RSA_KEY_BITS,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyType::Ec => f.write_str("ec"),
            KeyType::Rsa => f.write_str("rsa"),
        }
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ec" => Ok(KeyType::Ec),
            "rsa" => Ok(KeyType::Rsa),
            _ => Err(Error::validation(format!("unknown key type '{s}'"))),
        }
    }
}


//------------ TrustDomain ---------------------------------------------------

/// The identity namespace of a cluster: its cluster ID plus a fixed
/// suffix.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TrustDomain(String);

impl TrustDomain {
    pub fn from_cluster_id(cluster_id: &str) -> Self {
        TrustDomain(format!("{cluster_id}.{TRUST_DOMAIN_SUFFIX}"))
    }

    /// Returns the cluster ID this trust domain was derived from.
    pub fn cluster_id(&self) -> &str {
        self.0
            .strip_suffix(TRUST_DOMAIN_SUFFIX)
            .and_then(|s| s.strip_suffix('.'))
            .unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TrustDomain {
    fn from(s: String) -> Self {
        TrustDomain(s)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}


//------------ CaRoot --------------------------------------------------------

/// A root certificate known to a datacenter, together with the
/// intermediates that chain to it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CaRoot {
    /// The SHA-1 fingerprint of the root certificate.
    pub id: String,

    pub name: String,

    pub serial_number: u64,

    /// The key ID of the certificate that actually signs leaves: the
    /// active intermediate if there is one, otherwise the root.
    pub signing_key_id: String,

    /// Set for roots inherited from a cluster this datacenter no longer
    /// belongs to. Holds that cluster's ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_trust_domain: Option<String>,

    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,

    pub root_cert: String,

    #[serde(default)]
    pub intermediate_certs: Vec<String>,

    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_out_at: Option<DateTime<Utc>>,

    pub private_key_type: KeyType,
    pub private_key_bits: u32,

    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl CaRoot {
    /// Parses a root certificate produced by the named provider.
    ///
    /// The signing key ID starts out as the root's own key ID. Providers
    /// that sign with an intermediate must update it.
    pub fn parse(pem: &str, provider: &str) -> CaResult<Self> {
        let cert = crypto::parse_certificate(pem)?;
        let public_key = cert.public_key()?;
        let (private_key_type, private_key_bits) =
            crypto::key_type_and_bits(&public_key)?;

        Ok(CaRoot {
            id: crypto::fingerprint(&cert)?,
            name: format!("{} CA Primary Cert", pretty_provider_name(provider)),
            serial_number: crypto::serial_number(&cert)?,
            signing_key_id: crypto::signing_key_id(&cert)?,
            external_trust_domain: None,
            not_before: crypto::not_before(&cert)?,
            not_after: crypto::not_after(&cert)?,
            root_cert: pem.to_string(),
            intermediate_certs: Vec::new(),
            active: true,
            rotated_out_at: None,
            private_key_type,
            private_key_bits,
            create_index: 0,
            modify_index: 0,
        })
    }

    /// Marks the root as no longer active, remembering when that happened.
    pub fn rotate_out(&mut self, now: DateTime<Utc>) {
        if self.active {
            self.active = false;
            self.rotated_out_at = Some(now);
        }
    }
}

fn pretty_provider_name(provider: &str) -> &str {
    match provider {
        PROVIDER_BUILTIN => "Builtin",
        PROVIDER_VAULT => "Vault",
        other => other,
    }
}


//------------ IndexedCaRoots ------------------------------------------------

/// The response to a roots query.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IndexedCaRoots {
    pub active_root_id: String,
    pub trust_domain: String,
    pub roots: Vec<CaRoot>,

    /// The state store index of the root list, for blocking queries.
    pub index: u64,
}

impl IndexedCaRoots {
    pub fn active_root(&self) -> Option<&CaRoot> {
        self.roots.iter().find(|r| r.id == self.active_root_id)
    }
}


//------------ ProviderState -------------------------------------------------

/// Opaque recovery data a provider round-trips through the configuration.
pub type ProviderState = BTreeMap<String, String>;


//------------ CaConfiguration -----------------------------------------------

/// The CA configuration of a datacenter.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CaConfiguration {
    #[serde(default)]
    pub cluster_id: String,

    pub provider: String,

    /// Provider specific options, see [`CommonCaProviderConfig`] for the
    /// ones all providers understand.
    #[serde(default)]
    pub config: BTreeMap<String, Value>,

    #[serde(default)]
    pub state: ProviderState,

    #[serde(default)]
    pub force_without_cross_signing: bool,

    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl CaConfiguration {
    pub fn new(provider: &str, cluster_id: &str) -> Self {
        CaConfiguration {
            cluster_id: cluster_id.to_string(),
            provider: provider.to_string(),
            config: BTreeMap::new(),
            state: ProviderState::new(),
            force_without_cross_signing: false,
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn trust_domain(&self) -> TrustDomain {
        TrustDomain::from_cluster_id(&self.cluster_id)
    }

    pub fn common(&self) -> CaResult<CommonCaProviderConfig> {
        CommonCaProviderConfig::parse(&self.config)
    }

    /// Whether a rotation away from this configuration may skip
    /// cross-signing.
    pub fn skips_cross_signing(&self) -> CaResult<bool> {
        Ok(self.force_without_cross_signing
            || self.common()?.force_without_cross_signing)
    }

    /// Returns a string option, treating empty strings as absent.
    pub fn string_option(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}


//------------ CommonCaProviderConfig ----------------------------------------

struct CommonDefaults;

impl CommonDefaults {
    fn leaf_cert_ttl() -> Duration {
        DEFAULT_LEAF_CERT_TTL
    }

    fn intermediate_cert_ttl() -> Duration {
        DEFAULT_INTERMEDIATE_CERT_TTL
    }

    fn root_cert_ttl() -> Duration {
        DEFAULT_ROOT_CERT_TTL
    }

    fn private_key_type() -> KeyType {
        KeyType::Ec
    }
}

/// Provider options understood by every backend.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CommonCaProviderConfig {
    #[serde(
        rename = "LeafCertTTL",
        default = "CommonDefaults::leaf_cert_ttl",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub leaf_cert_ttl: Duration,

    #[serde(
        rename = "IntermediateCertTTL",
        default = "CommonDefaults::intermediate_cert_ttl",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub intermediate_cert_ttl: Duration,

    #[serde(
        rename = "RootCertTTL",
        default = "CommonDefaults::root_cert_ttl",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub root_cert_ttl: Duration,

    #[serde(rename = "PrivateKeyType", default = "CommonDefaults::private_key_type")]
    pub private_key_type: KeyType,

    /// Zero means the default for the key type.
    #[serde(rename = "PrivateKeyBits", default)]
    pub private_key_bits: u32,

    #[serde(rename = "SkipValidate", default, deserialize_with = "de_flexible_bool")]
    pub skip_validate: bool,

    #[serde(
        rename = "ForceWithoutCrossSigning",
        default,
        deserialize_with = "de_flexible_bool"
    )]
    pub force_without_cross_signing: bool,
}

impl CommonCaProviderConfig {
    /// Parses and validates the common options of a provider
    /// configuration map. Unknown keys are ignored.
    pub fn parse(config: &BTreeMap<String, Value>) -> CaResult<Self> {
        let map = config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<serde_json::Map<_, _>>();

        let mut common: CommonCaProviderConfig =
            serde_json::from_value(Value::Object(map)).map_err(|e| {
                Error::validation(format!("invalid provider config: {e}"))
            })?;

        if common.private_key_bits == 0 {
            common.private_key_bits = common.private_key_type.default_bits();
        }
        common.validate()?;
        Ok(common)
    }

    pub fn validate(&self) -> CaResult<()> {
        crypto::validate_key_type_and_bits(
            self.private_key_type,
            self.private_key_bits,
        )?;

        if self.skip_validate {
            return Ok(());
        }

        if self.leaf_cert_ttl < MIN_LEAF_CERT_TTL_LIMIT {
            return Err(Error::validation(format!(
                "LeafCertTTL must be at least {}",
                humantime::format_duration(MIN_LEAF_CERT_TTL_LIMIT)
            )));
        }
        if self.leaf_cert_ttl > MAX_LEAF_CERT_TTL_LIMIT {
            return Err(Error::validation(format!(
                "LeafCertTTL must be at most {}",
                humantime::format_duration(MAX_LEAF_CERT_TTL_LIMIT)
            )));
        }
        if self.intermediate_cert_ttl < self.leaf_cert_ttl * 3 {
            return Err(Error::validation(
                "IntermediateCertTTL must be at least three times LeafCertTTL",
            ));
        }
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
