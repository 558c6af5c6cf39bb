//! Defines all CA management errors.

use std::fmt::Display;
use std::{error, fmt, io};

use crate::server::manager::CaState;


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Provider and signing issues
    //-----------------------------------------------------------------

    /// The backend is unreachable or misconfigured.
    ProviderInit(String),

    /// A CSR was malformed or the backend refused to sign it.
    Signing(String),

    /// A configuration update or certificate failed validation.
    Validation(String),

    UnknownProvider(String),

    //-----------------------------------------------------------------
    // Manager state issues
    //-----------------------------------------------------------------

    /// The primary datacenter cannot sign intermediates for us yet.
    VersionIncompatible {
        datacenter: String,
        required: String,
    },

    /// In-memory state diverged from the persisted root set.
    StaleState(String),

    /// Another CA operation is in progress.
    CaBusy(CaState),

    CaNotInitialized,

    NotPrimary,

    //-----------------------------------------------------------------
    // Collaborator issues
    //-----------------------------------------------------------------

    UnknownDatacenter(String),

    Rpc(String),

    Store(String),

    //-----------------------------------------------------------------
    // Wrapped foreign errors
    //-----------------------------------------------------------------

    OpenSsl(openssl::error::ErrorStack),

    Json(serde_json::Error),

    Http(reqwest::Error),

    Io(io::Error),

    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ProviderInit(e) => {
                write!(f, "Could not initialize CA provider: {e}")
            }
            Error::Signing(e) => write!(f, "Signing issue: {e}"),
            Error::Validation(e) => write!(f, "Invalid CA configuration: {e}"),
            Error::UnknownProvider(name) => {
                write!(f, "Unknown CA provider '{name}'")
            }
            Error::VersionIncompatible { datacenter, required } => write!(
                f,
                "Servers in primary datacenter '{datacenter}' do not all \
                 run build {required} or later"
            ),
            Error::StaleState(e) => {
                write!(f, "CA state changed underneath us: {e}")
            }
            Error::CaBusy(state) => {
                write!(f, "CA is busy, current state: {state}")
            }
            Error::CaNotInitialized => write!(f, "CA is not initialized"),
            Error::NotPrimary => {
                write!(f, "Operation is only allowed in the primary datacenter")
            }
            Error::UnknownDatacenter(dc) => {
                write!(f, "Unknown datacenter '{dc}'")
            }
            Error::Rpc(e) => write!(f, "RPC failed: {e}"),
            Error::Store(e) => write!(f, "State store issue: {e}"),
            Error::OpenSsl(e) => write!(f, "OpenSSL error: {e}"),
            Error::Json(e) => write!(f, "Invalid JSON: {e}"),
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Io(e) => e.fmt(f),
            Error::Custom(s) => s.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl Error {
    pub fn provider_init(e: impl Display) -> Self {
        Error::ProviderInit(e.to_string())
    }

    pub fn signing(e: impl Display) -> Self {
        Error::Signing(e.to_string())
    }

    pub fn validation(e: impl Display) -> Self {
        Error::Validation(e.to_string())
    }

    pub fn stale(e: impl Display) -> Self {
        Error::StaleState(e.to_string())
    }

    pub fn rpc(e: impl Display) -> Self {
        Error::Rpc(e.to_string())
    }

    pub fn store(e: impl Display) -> Self {
        Error::Store(e.to_string())
    }

    pub fn custom(e: impl Display) -> Self {
        Error::Custom(e.to_string())
    }

    /// Returns whether a background task should keep retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderInit(_)
                | Error::VersionIncompatible { .. }
                | Error::StaleState(_)
                | Error::CaBusy(_)
                | Error::CaNotInitialized
                | Error::Rpc(_)
                | Error::Http(_)
        )
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::OpenSsl(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}


//------------ Tests ---------------------------------------------------------
