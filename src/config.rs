//! Configuration of a CA manager: datacenter topology, the CA
//! configuration to bootstrap with, tuning of the background tasks and
//! logging.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, fs, io};

use log::LevelFilter;
use serde::de;
use serde::{Deserialize, Deserializer};

use crate::api::ca::CaConfiguration;
use crate::cluster::ServerInfo;
use crate::commons::ext_serde;
use crate::commons::version::BuildVersion;
use crate::constants::*;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn node_name() -> String {
        "server-1".to_string()
    }

    fn build() -> BuildVersion {
        MIN_FEDERATION_BUILD
    }

    fn log_level() -> LevelFilter {
        match env::var(MESHCA_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        MESHCA_ENV_LOG_LEVEL
                    );
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./meshca.log")
    }

    fn ca() -> CaConfiguration {
        CaConfiguration::new(PROVIDER_BUILTIN, "")
    }

    fn intermediate_renew_interval() -> Duration {
        DEFAULT_INTERMEDIATE_RENEW_INTERVAL
    }

    fn root_prune_interval() -> Duration {
        DEFAULT_ROOT_PRUNE_INTERVAL
    }

    fn cert_time_drift_buffer() -> Duration {
        DEFAULT_CERT_TIME_DRIFT_BUFFER
    }

    fn min_leaf_cert_ttl() -> Duration {
        DEFAULT_MIN_LEAF_CERT_TTL
    }

    fn retry_min_backoff() -> Duration {
        DEFAULT_RETRY_MIN_BACKOFF
    }

    fn retry_max_backoff() -> Duration {
        DEFAULT_RETRY_MAX_BACKOFF
    }

    fn roots_max_query_time() -> Duration {
        DEFAULT_ROOTS_MAX_QUERY_TIME
    }

    fn rpc_timeout() -> Duration {
        DEFAULT_RPC_TIMEOUT
    }
}


//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub datacenter: String,

    /// The datacenter owning the root. Empty means this datacenter.
    #[serde(default)]
    pub primary_datacenter: String,

    #[serde(default = "ConfigDefaults::node_name")]
    pub node_name: String,

    /// The build this server advertises to the cluster.
    #[serde(default = "ConfigDefaults::build")]
    pub build: BuildVersion,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    /// The CA configuration used when none has been persisted yet.
    #[serde(default = "ConfigDefaults::ca")]
    pub ca: CaConfiguration,

    #[serde(default)]
    pub policy: CaPolicy,
}

/// # Accessors
impl Config {
    pub fn primary_datacenter(&self) -> &str {
        if self.primary_datacenter.is_empty() {
            &self.datacenter
        } else {
            &self.primary_datacenter
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary_datacenter() == self.datacenter
    }

    /// How this server presents itself to the membership layer.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(&self.node_name, &self.datacenter, self.build.clone())
    }
}

/// # Create
impl Config {
    /// Creates a configuration suitable for tests: everything in memory,
    /// background tasks running at sub-second intervals.
    pub fn test(datacenter: &str, primary_datacenter: &str) -> Self {
        Config {
            datacenter: datacenter.to_string(),
            primary_datacenter: primary_datacenter.to_string(),
            node_name: format!("{datacenter}-server-1"),
            build: MIN_FEDERATION_BUILD,
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            ca: ConfigDefaults::ca(),
            policy: CaPolicy::test(),
        }
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file)?;
        let config: Config = toml::from_str(&content)?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {file}, error: {e}"
            ))
        })?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.datacenter.is_empty() {
            return Err(ConfigError::other("datacenter must be set"));
        }

        if self.ca.provider != PROVIDER_BUILTIN
            && self.ca.provider != PROVIDER_VAULT
        {
            return Err(ConfigError::Other(format!(
                "unknown CA provider '{}'",
                self.ca.provider
            )));
        }

        self.policy.verify()
    }
}

/// # Logging
impl Config {
    /// Installs the global logger. Fails if one is installed already.
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        self.log_dispatch()?.apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init logging: {e}"))
        })
    }

    /// The dispatcher writing to the configured target.
    fn log_dispatch(&self) -> Result<fern::Dispatch, ConfigError> {
        let dispatch = self.formatted_dispatch();
        match self.log_type {
            LogType::Stderr => Ok(dispatch.chain(io::stderr())),
            LogType::File => {
                let file = fern::log_file(&self.log_file).map_err(|e| {
                    ConfigError::Other(format!(
                        "Failed to open log file '{}': {e}",
                        self.log_file.display()
                    ))
                })?;
                Ok(dispatch.chain(file))
            }
        }
    }

    fn formatted_dispatch(&self) -> fern::Dispatch {
        let http_level = self.log_level.min(LevelFilter::Warn);
        let with_target = self.log_level >= LevelFilter::Debug;

        let mut dispatch = fern::Dispatch::new()
            .format(move |out, message, record| {
                let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                if with_target {
                    out.finish(format_args!(
                        "{time} [{}] [{}] {message}",
                        record.level(),
                        record.target()
                    ))
                } else {
                    out.finish(format_args!("{time} [{}] {message}", record.level()))
                }
            })
            .level(self.log_level);
        for target in HTTP_LOG_TARGETS {
            dispatch = dispatch.level_for(*target, http_level);
        }
        dispatch
    }
}

/// Targets of the HTTP stack used towards Vault, which is chatty below
/// warn.
const HTTP_LOG_TARGETS: &[&str] =
    &["reqwest", "hyper", "hyper_util", "h2", "rustls"];


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\" or \"file\", found : \"{string}\""
            ))),
        }
    }
}


//------------ Tests ---------------------------------------------------------
