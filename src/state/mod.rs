//! State Management Module
//!
//! Peer addressing and rank, the shared coordinator directory, and the
//! per-node election state machine.

mod address;
mod directory;
pub mod election;

pub use address::{PeerAddress, Rank, DEFAULT_PORT};
pub use directory::{CoordinatorDirectory, InMemoryDirectory, MarkerFile};
pub use election::{Effect, ElectionEngine, ElectionState, NodeState, NodeTimer};
