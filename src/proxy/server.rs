//! Time Proxy Server
//!
//! UDP front door for clients. Client TIME_REQUESTs are forwarded to the
//! current coordinator through a per-request reply socket, and the
//! coordinator's TIME reply is relayed back from the public socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::router::{ProxyEffect, ProxyRouter, RequestId};
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::network::bind_udp;
use crate::protocol::MAX_DATAGRAM;
use crate::state::CoordinatorDirectory;
use crate::timer::TimerQueue;

/// Datagram received on a request's reply route
type RouteDatagram = (RequestId, SocketAddr, Vec<u8>);

/// UDP proxy that routes client time requests to the coordinator
pub struct ProxyServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    router: ProxyRouter,
}

impl ProxyServer {
    /// Bind the public socket
    pub async fn bind(config: &ProxyConfig, directory: Arc<dyn CoordinatorDirectory>) -> Result<Self> {
        let socket = bind_udp(config.bind_address.socket_addr()).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            router: ProxyRouter::new(directory, config.forward_timeout()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the proxy until the task is dropped
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("[PROXY] Started on {}", self.local_addr);

        let (route_tx, mut route_rx) = mpsc::channel::<RouteDatagram>(1024);
        let mut routes: HashMap<RequestId, JoinHandle<()>> = HashMap::new();
        let mut timers: TimerQueue<RequestId> = TimerQueue::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let effects = tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.router.handle_datagram(from, &buf[..len]),
                        Err(e) => {
                            tracing::warn!("[PROXY] Receive error: {}", e);
                            continue;
                        }
                    }
                }
                Some((request, from, payload)) = route_rx.recv() => {
                    self.router.handle_reply(request, from, &payload)
                }
                Some((request, token)) = timers.next_expired() => {
                    self.router.handle_timeout(request, token)
                }
            };

            for effect in effects {
                match effect {
                    ProxyEffect::Forward { request, to, payload } => {
                        match self.open_route(request, to, &payload, route_tx.clone()).await {
                            Ok(handle) => {
                                routes.insert(request, handle);
                            }
                            Err(e) => {
                                tracing::warn!("[PROXY] Failed to forward {} to {}: {}", request, to, e);
                            }
                        }
                    }
                    ProxyEffect::Relay { to, payload } => {
                        if let Err(e) = self.socket.send_to(&payload, to).await {
                            tracing::warn!("[PROXY] Failed to relay reply to {}: {}", to, e);
                        }
                    }
                    ProxyEffect::Release { request } => {
                        if let Some(handle) = routes.remove(&request) {
                            handle.abort();
                        }
                    }
                    ProxyEffect::Schedule { request, token, after } => {
                        timers.schedule(request, token, after);
                    }
                }
            }
        }
    }

    /// Send `payload` to the coordinator from a fresh socket and feed
    /// everything that comes back on it into the event loop
    async fn open_route(
        &self,
        request: RequestId,
        to: SocketAddr,
        payload: &[u8],
        route_tx: mpsc::Sender<RouteDatagram>,
    ) -> Result<JoinHandle<()>> {
        let socket = bind_udp(SocketAddr::new(self.local_addr.ip(), 0)).await?;
        socket.send_to(payload, to).await?;

        Ok(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if route_tx.send((request, from, buf[..len].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("[PROXY] Reply route {} receive error: {}", request, e);
                        break;
                    }
                }
            }
        }))
    }
}
