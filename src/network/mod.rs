//! Network Module
//!
//! UDP plumbing shared by the peer node and the proxy.

mod server;

pub use server::NodeServer;

use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Bind a UDP socket. Failure here is fatal for the process.
pub async fn bind_udp(address: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(address).await.map_err(|source| Error::Bind {
        address: address.to_string(),
        source,
    })
}

/// Send a single protocol message as one datagram
pub async fn send_message(socket: &UdpSocket, to: SocketAddr, message: &Message) -> Result<()> {
    let encoded = message.encode();
    socket
        .send_to(encoded.as_bytes(), to)
        .await
        .map_err(|e| Error::Network(format!("send {} to {}: {}", message.type_name(), to, e)))?;
    Ok(())
}
