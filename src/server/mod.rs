//! The leader-side CA machinery: the manager and its lifecycle, the
//! background tasks and the RPC endpoint.

pub mod endpoint;
mod federation;
pub mod leader;
pub mod manager;
mod rotation;
pub mod tasks;

pub use self::endpoint::{ConnectCa, RpcRouter};
pub use self::leader::CaLeader;
pub use self::manager::{ActiveCa, CaManager, CaState, SecondaryState};
