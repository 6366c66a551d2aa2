//! Shared protocol definitions for peercall
//!
//! Signaling messages exchanged through the relay and the identity type used to
//! key every per-peer map.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
