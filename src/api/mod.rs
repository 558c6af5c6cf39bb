//! Data structures shared by the CA manager, the state store and the RPC
//! surface.

pub mod ca;
pub mod rpc;
