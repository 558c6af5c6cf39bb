//! X.509 support for the CA providers.
//!
//! Everything here works on OpenSSL types so that the builtin provider
//! can sign with in-memory keys, while certificates coming back from an
//! external backend are handled as PEM strings and parsed on demand.

mod cert;
mod keys;

pub use self::cert::*;
pub use self::keys::*;
