//! Various crate-wide constants.

use std::time::Duration;

use crate::commons::version::BuildVersion;


//------------ Provider Names -----------------------------------------------

/// The name of the self-contained provider backed by OpenSSL.
pub const PROVIDER_BUILTIN: &str = "builtin";

/// The name of the provider backed by an external Vault PKI engine.
pub const PROVIDER_VAULT: &str = "vault";


//------------ Trust Domain -------------------------------------------------

/// The suffix appended to a cluster ID to form its trust domain.
pub const TRUST_DOMAIN_SUFFIX: &str = "mesh";

/// The URI scheme of workload and CA identities.
pub const SPIFFE_SCHEME: &str = "spiffe";


//------------ Federation ---------------------------------------------------

/// The oldest server build able to sign intermediates for other
/// datacenters.
pub const MIN_FEDERATION_BUILD: BuildVersion = BuildVersion::release(1, 6, 0);


//------------ Provider Defaults --------------------------------------------

pub const DEFAULT_LEAF_CERT_TTL: Duration = Duration::from_secs(72 * 3600);
pub const DEFAULT_INTERMEDIATE_CERT_TTL: Duration =
    Duration::from_secs(8760 * 3600);
pub const DEFAULT_ROOT_CERT_TTL: Duration =
    Duration::from_secs(10 * 8760 * 3600);

pub const MIN_LEAF_CERT_TTL_LIMIT: Duration = Duration::from_secs(3600);
pub const MAX_LEAF_CERT_TTL_LIMIT: Duration =
    Duration::from_secs(8760 * 3600);

pub const DEFAULT_EC_KEY_BITS: u32 = 256;
pub const DEFAULT_RSA_KEY_BITS: u32 = 2048;

/// Certificates are backdated by this much to tolerate clock skew.
pub const CERT_BACKDATE: Duration = Duration::from_secs(60);

/// The Vault role used to sign leaf certificates.
pub const VAULT_LEAF_ROLE: &str = "mesh-leaf";

/// The user agent used towards external PKI backends.
pub const HTTP_USER_AGENT: &str = "meshca";

pub const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);


//------------ Policy Defaults ----------------------------------------------

pub const DEFAULT_INTERMEDIATE_RENEW_INTERVAL: Duration =
    Duration::from_secs(3600);
pub const DEFAULT_ROOT_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CERT_TIME_DRIFT_BUFFER: Duration = Duration::from_secs(60);
pub const DEFAULT_MIN_LEAF_CERT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_RETRY_MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_ROOTS_MAX_QUERY_TIME: Duration = Duration::from_secs(300);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const MESHCA_ENV_LOG_LEVEL: &str = "MESHCA_LOG_LEVEL";
