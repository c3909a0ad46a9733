//! Coordinator Election
//!
//! Implements Bully-style coordinator election plus health checking of the
//! elected coordinator. The engine does no I/O: every handler mutates the
//! node's state and returns the [`Effect`]s the socket driver must carry
//! out. A node's engine is owned by a single event loop, so handlers never
//! overlap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::{CoordinatorDirectory, PeerAddress};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::timer::{TimerSlots, TimerToken};

/// Election state, derived from [`NodeState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// A coordinator other than us is known
    Idle,
    /// We sent ELECTION and are waiting for OK
    Electing,
    /// We won the last election we took part in
    Coordinator,
    /// No coordinator known and no election running
    Unknown,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "IDLE"),
            ElectionState::Electing => write!(f, "ELECTING"),
            ElectionState::Coordinator => write!(f, "COORDINATOR"),
            ElectionState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Mutable election record of a single node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    /// This node's address
    pub address: PeerAddress,
    /// Currently known coordinator
    pub coordinator: Option<PeerAddress>,
    /// Whether this node is the coordinator
    pub is_coordinator: bool,
    /// Whether this node is waiting for OK replies
    pub election_in_progress: bool,
    /// Consecutive unanswered health checks
    pub failed_health_checks: u32,
}

impl NodeState {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            coordinator: None,
            is_coordinator: false,
            election_in_progress: false,
            failed_health_checks: 0,
        }
    }

    pub fn election_state(&self) -> ElectionState {
        if self.is_coordinator {
            ElectionState::Coordinator
        } else if self.election_in_progress {
            ElectionState::Electing
        } else if self.coordinator.is_some() {
            ElectionState::Idle
        } else {
            ElectionState::Unknown
        }
    }
}

/// Timers owned by the election engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeTimer {
    /// Waiting for OK after sending ELECTION
    ElectionWait,
    /// Delay before starting our own election after an ELECTION arrived
    ElectionBackoff,
    /// Waiting for COORDINATOR after losing an election
    CoordinatorWait,
    /// Waiting for HEALTH_RESPONSE from the coordinator
    HealthCheck,
}

/// Work the driver must perform on behalf of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send a datagram
    Send { to: SocketAddr, message: Message },
    /// Fire `timer` with `token` after `after`
    Schedule {
        timer: NodeTimer,
        token: TimerToken,
        after: Duration,
    },
    /// Drop any pending firing of `timer`
    Cancel { timer: NodeTimer },
}

/// Per-node election and health-check state machine
pub struct ElectionEngine {
    state: NodeState,
    /// Every configured peer except ourselves
    peers: Vec<PeerAddress>,
    proxy: Option<PeerAddress>,
    config: ClusterConfig,
    directory: Arc<dyn CoordinatorDirectory>,
    timers: TimerSlots<NodeTimer>,
    effects: Vec<Effect>,
}

impl ElectionEngine {
    /// Create the engine for `address`, which must be one of the configured peers
    pub fn new(
        address: PeerAddress,
        config: ClusterConfig,
        proxy: Option<PeerAddress>,
        directory: Arc<dyn CoordinatorDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        if !config.contains(&address) {
            return Err(Error::UnknownPeer(address.to_string()));
        }

        let peers = config
            .peers
            .iter()
            .copied()
            .filter(|p| *p != address)
            .collect();

        Ok(Self {
            state: NodeState::new(address),
            peers,
            proxy,
            config,
            directory,
            timers: TimerSlots::new(),
            effects: Vec::new(),
        })
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn election_state(&self) -> ElectionState {
        self.state.election_state()
    }

    pub fn address(&self) -> PeerAddress {
        self.state.address
    }

    /// Peers ranked strictly above this node
    pub fn higher_peers(&self) -> Vec<PeerAddress> {
        let own = self.state.address.rank();
        self.peers
            .iter()
            .copied()
            .filter(|p| p.rank() > own)
            .collect()
    }

    /// Startup: always begin with an election
    pub fn start(&mut self) -> Vec<Effect> {
        tracing::info!("[{}] Time server starting, holding election", self.state.address);
        self.start_election();
        self.take_effects()
    }

    /// Handle a decoded datagram from `from`
    pub fn handle_message(&mut self, from: SocketAddr, message: Message) -> Vec<Effect> {
        tracing::trace!("[{}] Received {} from {}", self.state.address, message.type_name(), from);

        match message {
            Message::TimeRequest => {
                let reply = Message::time_now();
                tracing::debug!("[{}] Sending {} to {}", self.state.address, reply, from);
                self.send(from, reply);
            }
            Message::HealthCheck => self.send(from, Message::HealthResponse),
            Message::HealthResponse => self.on_health_response(from),
            Message::Election { candidate } => self.on_election(from, candidate),
            Message::Ok => self.on_ok(from),
            Message::Coordinator { address } => self.on_coordinator(address),
            Message::Time { .. } | Message::CoordinatorAnnounce { .. } => {
                tracing::trace!(
                    "[{}] Ignoring {} from {}",
                    self.state.address,
                    message.type_name(),
                    from
                );
            }
        }

        self.take_effects()
    }

    /// Handle an expired timer
    pub fn handle_timer(&mut self, timer: NodeTimer, token: TimerToken) -> Vec<Effect> {
        if !self.timers.fire(timer, token) {
            tracing::trace!("[{}] Ignoring stale {:?} timer", self.state.address, timer);
            return Vec::new();
        }

        match timer {
            NodeTimer::ElectionWait => {
                if self.state.election_in_progress {
                    tracing::info!(
                        "[{}] No OK from higher peers within {:?}",
                        self.state.address,
                        self.config.election_timeout()
                    );
                    self.become_coordinator();
                }
            }
            NodeTimer::ElectionBackoff => {
                if !self.state.election_in_progress && !self.state.is_coordinator {
                    self.start_election();
                }
            }
            NodeTimer::CoordinatorWait => {
                if self.state.coordinator.is_none()
                    && !self.state.election_in_progress
                    && !self.state.is_coordinator
                {
                    tracing::warn!(
                        "[{}] No coordinator announced after losing election, retrying",
                        self.state.address
                    );
                    self.start_election();
                }
            }
            NodeTimer::HealthCheck => self.on_health_timeout(),
        }

        self.take_effects()
    }

    /// Periodic health check of the believed coordinator.
    ///
    /// A coordinator re-broadcasts `COORDINATOR:<self>` instead, so a
    /// lower-ranked peer that also claimed the role after lost messages
    /// steps down.
    pub fn health_tick(&mut self) -> Vec<Effect> {
        if self.state.is_coordinator {
            let announcement = Message::Coordinator {
                address: self.state.address,
            };
            for peer in self.peers.clone() {
                self.send(peer.socket_addr(), announcement.clone());
            }
            return self.take_effects();
        }
        if self.state.election_in_progress {
            return Vec::new();
        }
        let Some(coordinator) = self.state.coordinator else {
            return Vec::new();
        };
        if self.timers.is_armed(NodeTimer::HealthCheck) {
            // Previous probe still outstanding
            return Vec::new();
        }

        self.send(coordinator.socket_addr(), Message::HealthCheck);
        self.arm(NodeTimer::HealthCheck, self.config.health_check_timeout());
        self.take_effects()
    }

    fn start_election(&mut self) {
        if self.state.election_in_progress {
            tracing::debug!("[{}] Election already in progress", self.state.address);
            return;
        }

        tracing::info!("[{}] Starting election", self.state.address);
        self.cancel(NodeTimer::ElectionBackoff);
        self.cancel(NodeTimer::CoordinatorWait);
        self.cancel(NodeTimer::HealthCheck);

        let higher = self.higher_peers();
        if higher.is_empty() {
            self.become_coordinator();
            return;
        }

        self.state.is_coordinator = false;
        self.state.election_in_progress = true;

        let message = Message::Election {
            candidate: self.state.address,
        };
        for peer in higher {
            self.send(peer.socket_addr(), message.clone());
        }
        self.arm(NodeTimer::ElectionWait, self.config.election_timeout());
    }

    fn become_coordinator(&mut self) {
        let address = self.state.address;
        if !self.state.is_coordinator {
            tracing::info!("[{}] Becoming coordinator", address);
        }

        self.cancel(NodeTimer::ElectionWait);
        self.cancel(NodeTimer::ElectionBackoff);
        self.cancel(NodeTimer::CoordinatorWait);
        self.cancel(NodeTimer::HealthCheck);

        self.state.is_coordinator = true;
        self.state.coordinator = Some(address);
        self.state.election_in_progress = false;
        self.state.failed_health_checks = 0;

        let announcement = Message::Coordinator { address };
        for peer in self.peers.clone() {
            self.send(peer.socket_addr(), announcement.clone());
        }

        if let Err(e) = self.directory.set(address) {
            tracing::warn!("[{}] Failed to record coordinator marker: {}", address, e);
        }

        if let Some(proxy) = self.proxy {
            tracing::info!("[{}] Notifying proxy {} that we are coordinator", address, proxy);
            self.send(proxy.socket_addr(), Message::CoordinatorAnnounce { address });
        }
    }

    fn on_election(&mut self, from: SocketAddr, candidate: PeerAddress) {
        tracing::info!("[{}] Received ELECTION from {}", self.state.address, candidate);

        // Always answer, whatever our state
        self.send(from, Message::Ok);

        if self.state.is_coordinator {
            // Tell the candidate who is in charge right away
            self.send(
                candidate.socket_addr(),
                Message::Coordinator {
                    address: self.state.address,
                },
            );
        } else if !self.state.election_in_progress && !self.timers.is_armed(NodeTimer::ElectionBackoff) {
            let backoff = self.random_backoff();
            self.arm(NodeTimer::ElectionBackoff, backoff);
        }
    }

    fn on_ok(&mut self, from: SocketAddr) {
        if !self.state.election_in_progress {
            tracing::trace!("[{}] Ignoring OK from {} outside an election", self.state.address, from);
            return;
        }
        if !self.higher_peers().iter().any(|p| p.socket_addr() == from) {
            tracing::debug!("[{}] Ignoring OK from non-higher peer {}", self.state.address, from);
            return;
        }

        tracing::info!("[{}] Received OK from {}, stopping election", self.state.address, from);
        self.cancel(NodeTimer::ElectionWait);
        self.state.election_in_progress = false;
        self.state.is_coordinator = false;
        self.arm(NodeTimer::CoordinatorWait, self.config.coordinator_wait());
    }

    fn on_coordinator(&mut self, address: PeerAddress) {
        if address == self.state.address {
            tracing::debug!("[{}] Ignoring COORDINATOR naming ourselves", self.state.address);
            return;
        }

        let changed = self.state.coordinator != Some(address);
        if changed {
            tracing::info!("[{}] New coordinator: {}", self.state.address, address);
            self.cancel(NodeTimer::HealthCheck);
        }

        self.state.coordinator = Some(address);
        self.state.is_coordinator = false;
        self.state.election_in_progress = false;
        self.state.failed_health_checks = 0;
        self.cancel(NodeTimer::ElectionWait);
        self.cancel(NodeTimer::CoordinatorWait);

        if address.outranks(&self.state.address) {
            self.cancel(NodeTimer::ElectionBackoff);
        } else if !self.timers.is_armed(NodeTimer::ElectionBackoff) {
            tracing::info!(
                "[{}] Coordinator {} ranks below us, challenging",
                self.state.address,
                address
            );
            let backoff = self.random_backoff();
            self.arm(NodeTimer::ElectionBackoff, backoff);
        }
    }

    fn on_health_response(&mut self, from: SocketAddr) {
        let expected = self.state.coordinator.map(|c| c.socket_addr());
        if expected != Some(from) || !self.timers.is_armed(NodeTimer::HealthCheck) {
            tracing::trace!("[{}] Unexpected HEALTH_RESPONSE from {}", self.state.address, from);
            return;
        }

        self.cancel(NodeTimer::HealthCheck);
        self.state.failed_health_checks = 0;
    }

    fn on_health_timeout(&mut self) {
        if self.state.is_coordinator || self.state.election_in_progress {
            return;
        }
        let Some(coordinator) = self.state.coordinator else {
            return;
        };

        self.state.failed_health_checks += 1;
        tracing::warn!(
            "[{}] Coordinator {} not responding ({}/{})",
            self.state.address,
            coordinator,
            self.state.failed_health_checks,
            self.config.max_failed_checks
        );

        if self.state.failed_health_checks >= self.config.max_failed_checks {
            tracing::warn!(
                "[{}] Coordinator {} unavailable, starting election",
                self.state.address,
                coordinator
            );
            self.state.coordinator = None;
            self.state.failed_health_checks = 0;
            self.start_election();
        }
    }

    fn random_backoff(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let ms = rng.gen_range(self.config.election_backoff_min_ms..=self.config.election_backoff_max_ms);
        Duration::from_millis(ms)
    }

    fn send(&mut self, to: SocketAddr, message: Message) {
        self.effects.push(Effect::Send { to, message });
    }

    fn arm(&mut self, timer: NodeTimer, after: Duration) {
        let token = self.timers.arm(timer);
        self.effects.push(Effect::Schedule { timer, token, after });
    }

    fn cancel(&mut self, timer: NodeTimer) {
        if self.timers.cancel(timer) {
            self.effects.push(Effect::Cancel { timer });
        }
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyEffect, ProxyRouter};
    use crate::state::InMemoryDirectory;
    use std::collections::{HashMap, VecDeque};

    fn addr(s: &str) -> PeerAddress {
        s.parse().unwrap()
    }

    fn cluster(peers: &[&str]) -> ClusterConfig {
        ClusterConfig::with_peers(peers.iter().map(|p| addr(p)).collect())
    }

    fn engine(me: &str, peers: &[&str]) -> ElectionEngine {
        ElectionEngine::new(
            addr(me),
            cluster(peers),
            None,
            Arc::new(InMemoryDirectory::new()),
        )
        .unwrap()
    }

    fn sends(effects: &[Effect]) -> Vec<(SocketAddr, Message)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { to, message } => Some((*to, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn scheduled(effects: &[Effect], timer: NodeTimer) -> Option<TimerToken> {
        effects.iter().rev().find_map(|e| match e {
            Effect::Schedule { timer: t, token, .. } if *t == timer => Some(*token),
            _ => None,
        })
    }

    const PEERS: [&str; 3] = ["10.0.0.1:5555", "10.0.0.2:5555", "10.0.0.3:5555"];

    /// Drive `me` to Idle with `coordinator` known, returning the engine
    fn idle_engine(me: &str, coordinator: &str) -> ElectionEngine {
        let mut node = engine(me, &PEERS);
        node.start();
        node.handle_message(
            addr(coordinator).socket_addr(),
            Message::Coordinator { address: addr(coordinator) },
        );
        assert_eq!(node.election_state(), ElectionState::Idle);
        node
    }

    #[test]
    fn test_unknown_address_rejected() {
        let result = ElectionEngine::new(
            addr("10.0.0.9:5555"),
            cluster(&PEERS),
            None,
            Arc::new(InMemoryDirectory::new()),
        );
        assert!(matches!(result, Err(Error::UnknownPeer(_))));
    }

    #[test]
    fn test_highest_peer_wins_immediately() {
        let directory = Arc::new(InMemoryDirectory::new());
        let proxy = addr("10.0.0.10:5555");
        let mut node = ElectionEngine::new(
            addr("10.0.0.3:5555"),
            cluster(&PEERS),
            Some(proxy),
            directory.clone(),
        )
        .unwrap();

        let effects = node.start();
        assert_eq!(node.election_state(), ElectionState::Coordinator);
        assert_eq!(directory.get(), Some(addr("10.0.0.3:5555")));

        let sent = sends(&effects);
        let coordinator_msgs = sent
            .iter()
            .filter(|(_, m)| *m == Message::Coordinator { address: addr("10.0.0.3:5555") })
            .count();
        assert_eq!(coordinator_msgs, 2);
        assert!(sent.contains(&(
            proxy.socket_addr(),
            Message::CoordinatorAnnounce { address: addr("10.0.0.3:5555") }
        )));
    }

    #[test]
    fn test_lower_peer_sends_election_to_higher_only() {
        let mut node = engine("10.0.0.2:5555", &PEERS);
        let effects = node.start();

        assert_eq!(node.election_state(), ElectionState::Electing);
        assert_eq!(
            sends(&effects),
            vec![(
                addr("10.0.0.3:5555").socket_addr(),
                Message::Election { candidate: addr("10.0.0.2:5555") }
            )]
        );
        assert!(scheduled(&effects, NodeTimer::ElectionWait).is_some());
    }

    #[test]
    fn test_election_wait_expiry_promotes() {
        let mut node = engine("10.0.0.1:5555", &PEERS);
        let effects = node.start();
        let token = scheduled(&effects, NodeTimer::ElectionWait).unwrap();

        node.handle_timer(NodeTimer::ElectionWait, token);
        assert_eq!(node.election_state(), ElectionState::Coordinator);
        assert!(!node.state().election_in_progress);
    }

    #[test]
    fn test_ok_cancels_election_wait() {
        let mut node = engine("10.0.0.1:5555", &PEERS);
        let effects = node.start();
        let token = scheduled(&effects, NodeTimer::ElectionWait).unwrap();

        let effects = node.handle_message(addr("10.0.0.3:5555").socket_addr(), Message::Ok);
        assert!(effects.contains(&Effect::Cancel { timer: NodeTimer::ElectionWait }));
        assert!(scheduled(&effects, NodeTimer::CoordinatorWait).is_some());
        assert_eq!(node.election_state(), ElectionState::Unknown);

        // Duplicate OK is a no-op
        assert!(node
            .handle_message(addr("10.0.0.2:5555").socket_addr(), Message::Ok)
            .is_empty());

        // The racing wait timer is ignored
        node.handle_timer(NodeTimer::ElectionWait, token);
        assert_eq!(node.election_state(), ElectionState::Unknown);
    }

    #[test]
    fn test_ok_from_non_higher_peer_ignored() {
        let mut node = engine("10.0.0.2:5555", &PEERS);
        node.start();
        node.handle_message(addr("10.0.0.1:5555").socket_addr(), Message::Ok);
        assert_eq!(node.election_state(), ElectionState::Electing);
    }

    #[test]
    fn test_coordinator_wait_restarts_election() {
        let mut node = engine("10.0.0.1:5555", &PEERS);
        node.start();
        let effects = node.handle_message(addr("10.0.0.2:5555").socket_addr(), Message::Ok);
        let token = scheduled(&effects, NodeTimer::CoordinatorWait).unwrap();

        let effects = node.handle_timer(NodeTimer::CoordinatorWait, token);
        assert_eq!(node.election_state(), ElectionState::Electing);
        assert_eq!(sends(&effects).len(), 2);
    }

    #[test]
    fn test_election_always_answered_with_ok() {
        let candidate = addr("10.0.0.1:5555");
        let from = candidate.socket_addr();
        let ok = (from, Message::Ok);

        // Unknown
        let mut unknown = engine("10.0.0.2:5555", &PEERS);
        unknown.start();
        unknown.handle_message(addr("10.0.0.3:5555").socket_addr(), Message::Ok);
        assert_eq!(unknown.election_state(), ElectionState::Unknown);

        // Electing
        let mut electing = engine("10.0.0.2:5555", &PEERS);
        electing.start();
        assert_eq!(electing.election_state(), ElectionState::Electing);

        // Idle
        let idle = idle_engine("10.0.0.2:5555", "10.0.0.3:5555");

        // Coordinator
        let mut coordinator = engine("10.0.0.3:5555", &PEERS);
        coordinator.start();
        assert_eq!(coordinator.election_state(), ElectionState::Coordinator);

        for mut node in [unknown, electing, idle, coordinator] {
            let before = node.election_state();
            let effects = node.handle_message(from, Message::Election { candidate });
            assert!(sends(&effects).contains(&ok), "no OK in state {}", before);
        }
    }

    #[test]
    fn test_election_schedules_backoff_when_idle() {
        let mut node = idle_engine("10.0.0.2:5555", "10.0.0.3:5555");
        let candidate = addr("10.0.0.1:5555");
        let effects = node.handle_message(candidate.socket_addr(), Message::Election { candidate });
        let token = scheduled(&effects, NodeTimer::ElectionBackoff).unwrap();

        // A second ELECTION does not push the backoff out
        let effects = node.handle_message(candidate.socket_addr(), Message::Election { candidate });
        assert!(scheduled(&effects, NodeTimer::ElectionBackoff).is_none());

        let effects = node.handle_timer(NodeTimer::ElectionBackoff, token);
        assert_eq!(node.election_state(), ElectionState::Electing);
        assert_eq!(
            sends(&effects),
            vec![(
                addr("10.0.0.3:5555").socket_addr(),
                Message::Election { candidate: addr("10.0.0.2:5555") }
            )]
        );
    }

    #[test]
    fn test_coordinator_reasserts_to_candidate() {
        let mut node = engine("10.0.0.3:5555", &PEERS);
        node.start();
        let candidate = addr("10.0.0.1:5555");
        let effects = node.handle_message(candidate.socket_addr(), Message::Election { candidate });

        assert!(sends(&effects).contains(&(
            candidate.socket_addr(),
            Message::Coordinator { address: addr("10.0.0.3:5555") }
        )));
        assert!(scheduled(&effects, NodeTimer::ElectionBackoff).is_none());
        assert_eq!(node.election_state(), ElectionState::Coordinator);
    }

    #[test]
    fn test_coordinator_announcement_is_idempotent() {
        let mut once = engine("10.0.0.1:5555", &PEERS);
        once.start();
        let mut many = engine("10.0.0.1:5555", &PEERS);
        many.start();

        let from = addr("10.0.0.3:5555").socket_addr();
        let announcement = Message::Coordinator { address: addr("10.0.0.3:5555") };

        once.handle_message(from, announcement.clone());
        for _ in 0..5 {
            many.handle_message(from, announcement.clone());
        }

        assert_eq!(once.state(), many.state());
        assert_eq!(many.election_state(), ElectionState::Idle);
    }

    #[test]
    fn test_coordinator_claim_yields_to_announcement() {
        let mut node = engine("10.0.0.3:5555", &PEERS);
        node.start();
        assert!(node.state().is_coordinator);

        let effects = node.handle_message(
            addr("10.0.0.2:5555").socket_addr(),
            Message::Coordinator { address: addr("10.0.0.2:5555") },
        );
        assert_eq!(node.election_state(), ElectionState::Idle);
        assert_eq!(node.state().coordinator, Some(addr("10.0.0.2:5555")));
        assert!(!node.state().is_coordinator);
        assert!(!node.state().election_in_progress);

        // Outranked the announced coordinator, so we challenge
        let token = scheduled(&effects, NodeTimer::ElectionBackoff).unwrap();
        node.handle_timer(NodeTimer::ElectionBackoff, token);
        assert_eq!(node.election_state(), ElectionState::Coordinator);
    }

    #[test]
    fn test_coordinator_naming_self_ignored() {
        let mut node = engine("10.0.0.1:5555", &PEERS);
        node.start();
        let before = node.state().clone();
        node.handle_message(
            addr("10.0.0.2:5555").socket_addr(),
            Message::Coordinator { address: addr("10.0.0.1:5555") },
        );
        assert_eq!(node.state(), &before);
    }

    #[test]
    fn test_health_response_resets_failures() {
        let coordinator = addr("10.0.0.3:5555");
        let mut node = idle_engine("10.0.0.1:5555", "10.0.0.3:5555");

        // One failed probe
        let effects = node.health_tick();
        assert_eq!(sends(&effects), vec![(coordinator.socket_addr(), Message::HealthCheck)]);
        let token = scheduled(&effects, NodeTimer::HealthCheck).unwrap();
        node.handle_timer(NodeTimer::HealthCheck, token);
        assert_eq!(node.state().failed_health_checks, 1);

        // Next probe answered by someone else: ignored
        node.health_tick();
        node.handle_message(addr("10.0.0.2:5555").socket_addr(), Message::HealthResponse);
        assert_eq!(node.state().failed_health_checks, 1);

        // Answered by the coordinator: reset
        let effects = node.handle_message(coordinator.socket_addr(), Message::HealthResponse);
        assert!(effects.contains(&Effect::Cancel { timer: NodeTimer::HealthCheck }));
        assert_eq!(node.state().failed_health_checks, 0);
    }

    #[test]
    fn test_health_probe_not_duplicated_while_outstanding() {
        let mut node = idle_engine("10.0.0.1:5555", "10.0.0.3:5555");
        assert!(!node.health_tick().is_empty());
        assert!(node.health_tick().is_empty());
    }

    #[test]
    fn test_reelection_exactly_at_max_failed_checks() {
        let mut node = idle_engine("10.0.0.1:5555", "10.0.0.3:5555");
        let max = node.config.max_failed_checks;

        for n in 1..max {
            let effects = node.health_tick();
            let token = scheduled(&effects, NodeTimer::HealthCheck).unwrap();
            node.handle_timer(NodeTimer::HealthCheck, token);
            assert_eq!(node.state().failed_health_checks, n);
            assert_eq!(node.election_state(), ElectionState::Idle);
            assert!(node.state().coordinator.is_some());
        }

        let effects = node.health_tick();
        let token = scheduled(&effects, NodeTimer::HealthCheck).unwrap();
        let effects = node.handle_timer(NodeTimer::HealthCheck, token);

        assert!(node.state().coordinator.is_none() || node.state().is_coordinator);
        assert_eq!(node.state().failed_health_checks, 0);
        assert_eq!(node.election_state(), ElectionState::Electing);
        assert!(sends(&effects)
            .iter()
            .all(|(_, m)| *m == Message::Election { candidate: addr("10.0.0.1:5555") }));
    }

    #[test]
    fn test_no_health_probe_when_coordinator_or_electing() {
        let mut coordinator = engine("10.0.0.3:5555", &PEERS);
        coordinator.start();
        let effects = coordinator.health_tick();
        assert!(sends(&effects).iter().all(|(_, m)| *m
            == Message::Coordinator { address: addr("10.0.0.3:5555") }));
        assert!(scheduled(&effects, NodeTimer::HealthCheck).is_none());

        let mut electing = engine("10.0.0.1:5555", &PEERS);
        electing.start();
        assert!(electing.health_tick().is_empty());
    }

    #[test]
    fn test_coordinator_tick_reasserts_to_every_peer() {
        let mut coordinator = engine("10.0.0.3:5555", &PEERS);
        coordinator.start();

        let effects = coordinator.health_tick();
        let mut targets: Vec<SocketAddr> = sends(&effects).into_iter().map(|(to, _)| to).collect();
        targets.sort();
        assert_eq!(
            targets,
            vec![addr("10.0.0.1:5555").socket_addr(), addr("10.0.0.2:5555").socket_addr()]
        );
    }

    #[test]
    fn test_dual_coordinators_reconcile_on_tick() {
        let high = addr("10.0.0.3:5555");
        let low = addr("10.0.0.2:5555");

        let mut winner = engine("10.0.0.3:5555", &PEERS);
        winner.start();

        // Every OK from 10.0.0.3 was lost, so 10.0.0.2 claimed the role too
        let mut claimant = engine("10.0.0.2:5555", &PEERS);
        let effects = claimant.start();
        let token = scheduled(&effects, NodeTimer::ElectionWait).unwrap();
        claimant.handle_timer(NodeTimer::ElectionWait, token);
        assert_eq!(winner.election_state(), ElectionState::Coordinator);
        assert_eq!(claimant.election_state(), ElectionState::Coordinator);

        // The lower claimant's tick reaches the winner first
        for (to, message) in sends(&claimant.health_tick()) {
            if to == high.socket_addr() {
                let effects = winner.handle_message(low.socket_addr(), message);
                let token = scheduled(&effects, NodeTimer::ElectionBackoff).unwrap();
                winner.handle_timer(NodeTimer::ElectionBackoff, token);
            }
        }
        assert_eq!(winner.election_state(), ElectionState::Coordinator);

        for (to, message) in sends(&winner.health_tick()) {
            if to == low.socket_addr() {
                claimant.handle_message(high.socket_addr(), message);
            }
        }
        assert_eq!(claimant.election_state(), ElectionState::Idle);
        assert_eq!(claimant.state().coordinator, Some(high));
        assert!(claimant.health_tick().iter().all(|e| !matches!(
            e,
            Effect::Send { message: Message::Coordinator { .. }, .. }
        )));
    }

    #[test]
    fn test_invalid_backoff_range_rejected() {
        let mut config = cluster(&PEERS);
        config.election_backoff_min_ms = 2000;
        config.election_backoff_max_ms = 1000;
        let result = ElectionEngine::new(
            addr("10.0.0.1:5555"),
            config,
            None,
            Arc::new(InMemoryDirectory::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_answers_time_and_health_in_any_state() {
        let client: SocketAddr = "192.168.1.50:40000".parse().unwrap();
        let mut node = engine("10.0.0.1:5555", &PEERS);
        node.start();

        let effects = node.handle_message(client, Message::TimeRequest);
        match sends(&effects).as_slice() {
            [(to, Message::Time { .. })] => assert_eq!(*to, client),
            other => panic!("unexpected effects {:?}", other),
        }

        let effects = node.handle_message(client, Message::HealthCheck);
        assert_eq!(sends(&effects), vec![(client, Message::HealthResponse)]);
    }

    #[test]
    fn test_flags_never_both_set() {
        let mut node = engine("10.0.0.1:5555", &PEERS);
        let effects = node.start();
        let token = scheduled(&effects, NodeTimer::ElectionWait).unwrap();
        assert!(!(node.state().is_coordinator && node.state().election_in_progress));
        node.handle_timer(NodeTimer::ElectionWait, token);
        assert!(!(node.state().is_coordinator && node.state().election_in_progress));
    }

    /// Loss-free in-memory network driving several engines with a virtual clock
    struct Simulation {
        nodes: Vec<ElectionEngine>,
        index: HashMap<SocketAddr, usize>,
        inflight: VecDeque<(SocketAddr, SocketAddr, Message)>,
        timers: Vec<(Duration, usize, NodeTimer, TimerToken)>,
        now: Duration,
        outside: Vec<(SocketAddr, Message)>,
    }

    impl Simulation {
        fn new(peers: &[&str], proxy: Option<PeerAddress>, directory: Arc<InMemoryDirectory>) -> Self {
            let nodes: Vec<_> = peers
                .iter()
                .map(|p| {
                    ElectionEngine::new(addr(p), cluster(peers), proxy, directory.clone()).unwrap()
                })
                .collect();
            let index = nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (n.address().socket_addr(), i))
                .collect();
            Self {
                nodes,
                index,
                inflight: VecDeque::new(),
                timers: Vec::new(),
                now: Duration::ZERO,
                outside: Vec::new(),
            }
        }

        fn apply(&mut self, node: usize, effects: Vec<Effect>) {
            let from = self.nodes[node].address().socket_addr();
            for effect in effects {
                match effect {
                    Effect::Send { to, message } => self.inflight.push_back((from, to, message)),
                    Effect::Schedule { timer, token, after } => {
                        self.timers.push((self.now + after, node, timer, token))
                    }
                    Effect::Cancel { .. } => {}
                }
            }
        }

        fn start_all(&mut self) {
            for i in 0..self.nodes.len() {
                let effects = self.nodes[i].start();
                self.apply(i, effects);
            }
        }

        fn run_until(&mut self, limit: Duration) {
            loop {
                if let Some((from, to, message)) = self.inflight.pop_front() {
                    match self.index.get(&to).copied() {
                        Some(i) => {
                            let effects = self.nodes[i].handle_message(from, message);
                            self.apply(i, effects);
                        }
                        None => self.outside.push((to, message)),
                    }
                    continue;
                }

                self.timers.sort_by_key(|(due, ..)| *due);
                if self.timers.is_empty() || self.timers[0].0 > limit {
                    break;
                }
                let (due, node, timer, token) = self.timers.remove(0);
                self.now = due;
                let effects = self.nodes[node].handle_timer(timer, token);
                self.apply(node, effects);
            }
        }

        fn coordinators(&self) -> Vec<PeerAddress> {
            self.nodes
                .iter()
                .filter(|n| n.election_state() == ElectionState::Coordinator)
                .map(|n| n.address())
                .collect()
        }
    }

    #[test]
    fn test_simultaneous_startup_elects_highest() {
        let directory = Arc::new(InMemoryDirectory::new());
        let proxy = addr("10.0.0.10:5555");
        let mut sim = Simulation::new(&PEERS, Some(proxy), directory.clone());

        sim.start_all();
        sim.run_until(Duration::from_secs(30));

        assert_eq!(sim.coordinators(), vec![addr("10.0.0.3:5555")]);
        for node in &sim.nodes[..2] {
            assert_eq!(node.election_state(), ElectionState::Idle);
            assert_eq!(node.state().coordinator, Some(addr("10.0.0.3:5555")));
        }
        assert_eq!(directory.get(), Some(addr("10.0.0.3:5555")));
        assert!(sim.outside.iter().all(|(to, m)| *to == proxy.socket_addr()
            && *m == Message::CoordinatorAnnounce { address: addr("10.0.0.3:5555") }));
        assert!(!sim.outside.is_empty());

        // The proxy learns the coordinator only from the announcement
        let winner = addr("10.0.0.3:5555").socket_addr();
        let proxy_directory = Arc::new(InMemoryDirectory::new());
        let mut router = ProxyRouter::new(proxy_directory.clone(), Duration::from_secs(3));
        for (_, message) in &sim.outside {
            router.handle_datagram(winner, message.encode().as_bytes());
        }
        assert_eq!(proxy_directory.get(), Some(addr("10.0.0.3:5555")));

        let client: SocketAddr = "192.168.1.50:40000".parse().unwrap();
        let route: SocketAddr = "10.0.0.10:41000".parse().unwrap();
        let effects = router.handle_datagram(client, b"TIME_REQUEST");
        let (request, to, payload) = effects
            .iter()
            .find_map(|e| match e {
                ProxyEffect::Forward { request, to, payload } => Some((*request, *to, payload.clone())),
                _ => None,
            })
            .expect("request was not forwarded");
        assert_eq!(to, winner);

        let message = Message::decode(&payload).unwrap();
        let effects = sim.nodes[2].handle_message(route, message);
        let reply = match sends(&effects).as_slice() {
            [(to, reply @ Message::Time { .. })] if *to == route => reply.encode(),
            other => panic!("unexpected effects {:?}", other),
        };

        let effects = router.handle_reply(request, winner, reply.as_bytes());
        assert_eq!(
            effects,
            vec![
                ProxyEffect::Relay {
                    to: client,
                    payload: reply.into_bytes(),
                },
                ProxyEffect::Release { request },
            ]
        );
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn test_rank_not_list_order_decides() {
        // Ranks: A = 3, B = 7, C = 5
        let peers = ["0.0.0.3:5555", "0.0.0.7:5555", "0.0.0.5:5555"];
        let mut sim = Simulation::new(&peers, None, Arc::new(InMemoryDirectory::new()));

        sim.start_all();
        sim.run_until(Duration::from_secs(30));

        assert_eq!(sim.coordinators(), vec![addr("0.0.0.7:5555")]);
    }

    #[test]
    fn test_single_round_for_larger_fleets() {
        let peers = [
            "10.0.0.4:5555",
            "10.0.0.9:5555",
            "10.0.0.1:5555",
            "10.0.0.7:5555",
            "10.0.0.2:5555",
        ];
        let mut sim = Simulation::new(&peers, None, Arc::new(InMemoryDirectory::new()));

        sim.start_all();
        sim.run_until(Duration::from_secs(60));

        assert_eq!(sim.coordinators(), vec![addr("10.0.0.9:5555")]);
        assert!(sim
            .nodes
            .iter()
            .all(|n| n.state().coordinator == Some(addr("10.0.0.9:5555"))));
    }
}
