//! Time Proxy
//!
//! Shields clients from coordinator changes: clients always talk to the
//! proxy, the proxy forwards to whichever peer is currently coordinator.

mod router;
mod server;

pub use router::{PendingRequest, ProxyEffect, ProxyRouter, RequestId};
pub use server::ProxyServer;
