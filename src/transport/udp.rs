//! UDP transport for IPMSG datagrams.
//!
//! The engine only needs a way to hand off finished datagrams; receiving is
//! driven by the application loop, which feeds datagrams back into the
//! engine's dispatcher.

use crate::utils::{NetworkError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Outbound half of the transport
pub trait PacketSink: Send + Sync {
    /// Send one datagram to `dest`
    fn send_datagram(&self, dest: SocketAddr, bytes: &[u8]) -> Result<()>;
}

/// Sends datagrams through a shared tokio UDP socket
#[derive(Debug, Clone)]
pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl UdpSink {
    /// Wrap an already bound socket
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    /// Bind a broadcast-capable socket on `addr`
    pub async fn bind(addr: SocketAddr) -> Result<Arc<UdpSocket>> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| NetworkError::Transport {
            reason: format!("bind {addr}: {e}"),
        })?;
        socket.set_broadcast(true)?;
        log::info!("Listening for IPMSG datagrams on {}", socket.local_addr()?);
        Ok(Arc::new(socket))
    }
}

impl PacketSink for UdpSink {
    fn send_datagram(&self, dest: SocketAddr, bytes: &[u8]) -> Result<()> {
        match self.socket.try_send_to(bytes, dest) {
            Ok(sent) if sent == bytes.len() => Ok(()),
            Ok(sent) => Err(NetworkError::Transport {
                reason: format!("short send to {dest}: {sent} of {} bytes", bytes.len()),
            }
            .into()),
            Err(e) => Err(NetworkError::Transport {
                reason: format!("send to {dest}: {e}"),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_sink_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let socket = UdpSink::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sink = UdpSink::new(socket);
        sink.send_datagram(target, b"1:1:a:b:1:\0").unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"1:1:a:b:1:\0");
    }
}
