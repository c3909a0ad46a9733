//! Node Server
//!
//! Single-task event loop for one peer node: receives datagrams, fires
//! election/health timers and ticks the health check, feeding everything
//! through the node's [`ElectionEngine`].

use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;

use super::{bind_udp, send_message};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::protocol::{Message, MAX_DATAGRAM};
use crate::state::{CoordinatorDirectory, Effect, ElectionEngine, NodeTimer, PeerAddress};
use crate::timer::TimerQueue;

/// UDP time server taking part in coordinator election
pub struct NodeServer {
    socket: UdpSocket,
    engine: ElectionEngine,
    health_interval: Duration,
}

impl NodeServer {
    /// Bind `address` and prepare the node. The address must be a configured peer.
    pub async fn bind(
        address: PeerAddress,
        cluster: ClusterConfig,
        proxy: Option<PeerAddress>,
        directory: Arc<dyn CoordinatorDirectory>,
    ) -> Result<Self> {
        let health_interval = cluster.health_check_interval();
        let engine = ElectionEngine::new(address, cluster, proxy, directory)?;
        let socket = bind_udp(address.socket_addr()).await?;
        Ok(Self::with_socket(socket, engine, health_interval))
    }

    /// Wrap an already bound socket
    pub fn with_socket(socket: UdpSocket, engine: ElectionEngine, health_interval: Duration) -> Self {
        Self {
            socket,
            engine,
            health_interval,
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.engine.address()
    }

    /// Run the node until the task is dropped
    pub async fn run(mut self) -> Result<()> {
        let address = self.engine.address();
        tracing::info!("[{}] The time server is running on {}", address, self.socket.local_addr()?);

        let mut timers: TimerQueue<NodeTimer> = TimerQueue::new();
        let effects = self.engine.start();
        self.apply(&mut timers, effects).await;

        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + self.health_interval,
            self.health_interval,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let effects = tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => match Message::decode(&buf[..len]) {
                            Some(message) => self.engine.handle_message(from, message),
                            None => {
                                tracing::trace!("[{}] Ignoring unrecognized datagram from {}", address, from);
                                continue;
                            }
                        },
                        Err(e) => {
                            tracing::warn!("[{}] Receive error: {}", address, e);
                            continue;
                        }
                    }
                }
                Some((timer, token)) = timers.next_expired() => {
                    self.engine.handle_timer(timer, token)
                }
                _ = health.tick() => {
                    self.engine.health_tick()
                }
            };

            self.apply(&mut timers, effects).await;
        }
    }

    async fn apply(&self, timers: &mut TimerQueue<NodeTimer>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    if let Err(e) = send_message(&self.socket, to, &message).await {
                        tracing::warn!("[{}] {}", self.engine.address(), e);
                    }
                }
                Effect::Schedule { timer, token, after } => timers.schedule(timer, token, after),
                Effect::Cancel { timer } => timers.cancel(timer),
            }
        }
    }
}
