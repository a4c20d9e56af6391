//! HTTP surface of the gate.

mod layer;
mod server;

pub use layer::{ClientIdentity, RateLimitLayer, RateLimitService, REJECTION_MESSAGE};
pub use server::GateServer;
