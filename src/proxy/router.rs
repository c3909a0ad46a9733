//! Proxy Request Router
//!
//! Tracks client requests that have been forwarded to the coordinator and
//! matches the coordinator's replies back to them. Each forwarded request
//! gets its own [`RequestId`] and reply route, so concurrent requests to the
//! same coordinator never overwrite each other.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::Message;
use crate::state::{CoordinatorDirectory, PeerAddress};
use crate::timer::{TimerSlots, TimerToken};

/// Correlation identifier of one forwarded request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A client request waiting for the coordinator's reply
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Where the reply must go
    pub client: SocketAddr,
    /// Coordinator the request was forwarded to
    pub coordinator: PeerAddress,
    /// When the request was forwarded
    pub forwarded_at: Instant,
}

/// Work the proxy driver must perform on behalf of the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEffect {
    /// Open a reply route for `request` and send `payload` to `to` through it
    Forward {
        request: RequestId,
        to: SocketAddr,
        payload: Vec<u8>,
    },
    /// Send `payload` to a client from the public socket
    Relay { to: SocketAddr, payload: Vec<u8> },
    /// Close the reply route of `request`
    Release { request: RequestId },
    /// Fire the forwarding timeout of `request` after `after`
    Schedule {
        request: RequestId,
        token: TimerToken,
        after: Duration,
    },
}

/// Proxy-side forwarding state machine
pub struct ProxyRouter {
    directory: Arc<dyn CoordinatorDirectory>,
    forward_timeout: Duration,
    pending: HashMap<RequestId, PendingRequest>,
    timers: TimerSlots<RequestId>,
    next_id: u64,
}

impl ProxyRouter {
    pub fn new(directory: Arc<dyn CoordinatorDirectory>, forward_timeout: Duration) -> Self {
        Self {
            directory,
            forward_timeout,
            pending: HashMap::new(),
            timers: TimerSlots::new(),
            next_id: 0,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, request: RequestId) -> Option<&PendingRequest> {
        self.pending.get(&request)
    }

    /// Current coordinator as seen by the proxy
    pub fn coordinator(&self) -> Option<PeerAddress> {
        self.directory.get()
    }

    /// Handle a datagram that arrived on the public socket
    pub fn handle_datagram(&mut self, from: SocketAddr, payload: &[u8]) -> Vec<ProxyEffect> {
        match Message::decode(payload) {
            Some(Message::TimeRequest) => self.forward(from, payload),
            Some(Message::CoordinatorAnnounce { address }) => {
                tracing::info!("[PROXY] Coordinator is now {} (announced by {})", address, from);
                if let Err(e) = self.directory.set(address) {
                    tracing::warn!("[PROXY] Failed to record announced coordinator: {}", e);
                }
                Vec::new()
            }
            Some(Message::Time { .. }) => {
                tracing::debug!("[PROXY] Dropping TIME reply from {} with no reply route", from);
                Vec::new()
            }
            Some(other) => {
                tracing::debug!("[PROXY] Ignoring {} from {}", other.type_name(), from);
                Vec::new()
            }
            None => {
                tracing::trace!("[PROXY] Ignoring unrecognized datagram from {}", from);
                Vec::new()
            }
        }
    }

    /// Handle a datagram that arrived on the reply route of `request`
    pub fn handle_reply(
        &mut self,
        request: RequestId,
        from: SocketAddr,
        payload: &[u8],
    ) -> Vec<ProxyEffect> {
        let Some(pending) = self.pending.get(&request) else {
            tracing::debug!("[PROXY] Dropping late reply for {} from {}", request, from);
            return Vec::new();
        };

        if pending.coordinator.socket_addr() != from {
            tracing::debug!(
                "[PROXY] Ignoring datagram for {} from {} (expected {})",
                request,
                from,
                pending.coordinator
            );
            return Vec::new();
        }

        if !matches!(Message::decode(payload), Some(Message::Time { .. })) {
            tracing::debug!("[PROXY] Ignoring non-TIME reply for {} from {}", request, from);
            return Vec::new();
        }

        let pending = match self.pending.remove(&request) {
            Some(p) => p,
            None => return Vec::new(),
        };
        self.timers.cancel(request);

        tracing::info!(
            "[PROXY] Response sent to client {} ({} via {} in {:?})",
            pending.client,
            request,
            pending.coordinator,
            pending.forwarded_at.elapsed()
        );

        vec![
            ProxyEffect::Relay {
                to: pending.client,
                payload: payload.to_vec(),
            },
            ProxyEffect::Release { request },
        ]
    }

    /// Handle an expired forwarding timeout
    pub fn handle_timeout(&mut self, request: RequestId, token: TimerToken) -> Vec<ProxyEffect> {
        if !self.timers.fire(request, token) {
            return Vec::new();
        }

        match self.pending.remove(&request) {
            Some(pending) => {
                tracing::warn!(
                    "[PROXY] Coordinator {} did not respond within {:?}, dropping request {} from {}",
                    pending.coordinator,
                    self.forward_timeout,
                    request,
                    pending.client
                );
                vec![ProxyEffect::Release { request }]
            }
            None => Vec::new(),
        }
    }

    fn forward(&mut self, client: SocketAddr, payload: &[u8]) -> Vec<ProxyEffect> {
        let Some(coordinator) = self.directory.get() else {
            tracing::error!(
                "[PROXY] No coordinator known, dropping request from {}",
                client
            );
            return Vec::new();
        };

        self.next_id += 1;
        let request = RequestId(self.next_id);
        self.pending.insert(
            request,
            PendingRequest {
                client,
                coordinator,
                forwarded_at: Instant::now(),
            },
        );
        let token = self.timers.arm(request);

        tracing::info!(
            "[PROXY] Request {} by {} redirected to coordinator {}",
            request,
            client,
            coordinator
        );

        vec![
            ProxyEffect::Forward {
                request,
                to: coordinator.socket_addr(),
                payload: payload.to_vec(),
            },
            ProxyEffect::Schedule {
                request,
                token,
                after: self.forward_timeout,
            },
        ]
    }
}
