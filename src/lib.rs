//! TimeFleet - Coordinated UDP Time Service
//!
//! A fleet of peer time servers that elect a single coordinator with a
//! bully-style election, plus a proxy that routes client time requests to
//! whichever peer currently holds that role.
//!
//! # Architecture
//!
//! Every peer knows the full, fixed peer set. The highest-ranked reachable
//! peer becomes coordinator, announces itself to the other peers and the
//! proxy, and serves `TIME_REQUEST`s. Non-coordinators health-check the
//! coordinator and start a new election once it stops answering.
//!
//! # Features
//!
//! - Plain-text `TYPE[:ARG]` wire protocol over UDP
//! - Sans-IO election engine and proxy router, driven by tokio event loops
//! - Coordinator marker file shared between peers and proxy
//! - Per-request reply routes in the proxy, so concurrent clients never collide

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod state;
pub mod timer;

pub use config::TimeFleetConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ClusterConfig, ProxyConfig, TimeFleetConfig};
    pub use crate::error::{Error, Result};
    pub use crate::network::NodeServer;
    pub use crate::protocol::Message;
    pub use crate::proxy::ProxyServer;
    pub use crate::state::{CoordinatorDirectory, ElectionEngine, MarkerFile, PeerAddress};
}
