//! Common types used by the various components.

pub mod crypto;
pub mod error;
pub mod ext_serde;
pub mod version;

pub use self::error::Error;


//------------ Response Aliases ----------------------------------------------

pub type CaEmptyResult = std::result::Result<(), self::error::Error>;
pub type CaResult<T> = std::result::Result<T, self::error::Error>;
