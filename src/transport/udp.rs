//! UDP transport for real instruments.
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use super::{Endpoint, Transport, TransportFactory};
use crate::error::{EquipmentError, EquipmentResult};
use crate::packet::PACKET_LEN;
use crate::protocol::ConfigureParams;

/// Datagram socket bound on the streaming port.
///
/// The receive buffer is one byte larger than a packet so oversized datagrams are
/// visible to the decoder instead of being silently truncated to a valid length.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    remote: Option<SocketAddr>,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Binds `0.0.0.0:<port>` and resolves the instrument address for outgoing frames.
    ///
    /// An instrument address that resolves to this very socket (loopback or
    /// unspecified host on the streaming port) is dropped, so control frames never
    /// land in the worker's own data stream.
    pub async fn bind(endpoint: &Endpoint) -> EquipmentResult<Self> {
        let local = SocketAddr::from(([0, 0, 0, 0], endpoint.port));
        let remote = lookup_host((endpoint.address.as_str(), endpoint.port))
            .await?
            .find(|addr| !is_self_addressed(*addr, endpoint.port));
        Self::bind_addr(local, remote).await
    }

    /// Binds an explicit local address; without `remote` the transport is receive-only
    /// and `send` discards frames.
    pub async fn bind_addr(local: SocketAddr, remote: Option<SocketAddr>) -> EquipmentResult<Self> {
        let socket = UdpSocket::bind(local).await?;
        debug!(local = %socket.local_addr()?, ?remote, "UDP transport bound");
        Ok(Self {
            socket: Some(socket),
            remote,
            recv_buf: vec![0u8; PACKET_LEN + 1],
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> EquipmentResult<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    fn socket(&self) -> EquipmentResult<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| EquipmentError::Transport("UDP socket is closed".into()))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, frame: &[u8]) -> EquipmentResult<()> {
        let socket = self.socket()?;
        match self.remote {
            Some(remote) => {
                socket.send_to(frame, remote).await?;
            }
            None => debug!(bytes = frame.len(), "No instrument address, frame not sent"),
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> EquipmentResult<Option<Bytes>> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| EquipmentError::Transport("UDP socket is closed".into()))?;

        // recv_from is cancel-safe: a dropped future loses no datagram.
        match tokio::time::timeout(timeout, socket.recv_from(&mut self.recv_buf)).await {
            Ok(Ok((len, _from))) => Ok(Some(Bytes::copy_from_slice(&self.recv_buf[..len]))),
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn close(&mut self) -> EquipmentResult<()> {
        match self.socket.take() {
            Some(_) => Ok(()),
            None => Err(EquipmentError::Transport("UDP socket already closed".into())),
        }
    }
}

fn is_self_addressed(addr: SocketAddr, local_port: u16) -> bool {
    addr.port() == local_port && (addr.ip().is_loopback() || addr.ip().is_unspecified())
}

/// Opens a [`UdpTransport`] on the equipment's port.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransportFactory;

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn open(
        &self,
        endpoint: &Endpoint,
        _params: &ConfigureParams,
    ) -> EquipmentResult<Box<dyn Transport>> {
        Ok(Box::new(UdpTransport::bind(endpoint).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    async fn loopback() -> (UdpTransport, UdpSocket) {
        let transport = UdpTransport::bind_addr("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(transport.local_addr().unwrap()).await.unwrap();
        (transport, peer)
    }

    #[tokio::test]
    async fn receives_full_packet() {
        let (mut transport, peer) = loopback().await;
        let wire = Packet::filled(9, 1.5).encode();
        peer.send(&wire).await.unwrap();

        let received = transport
            .receive(Duration::from_millis(500))
            .await
            .unwrap()
            .expect("datagram should arrive");
        assert_eq!(received, wire);
    }

    #[tokio::test]
    async fn oversized_datagram_is_not_truncated_to_packet_len() {
        let (mut transport, peer) = loopback().await;
        peer.send(&vec![0u8; PACKET_LEN + 64]).await.unwrap();

        let received = transport
            .receive(Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert!(Packet::decode(&received).is_err());
    }

    #[test]
    fn loopback_on_own_port_is_self_addressed() {
        assert!(is_self_addressed("127.0.0.1:1865".parse().unwrap(), 1865));
        assert!(is_self_addressed("[::1]:1865".parse().unwrap(), 1865));
        assert!(!is_self_addressed("127.0.0.1:1866".parse().unwrap(), 1865));
        assert!(!is_self_addressed("10.0.0.3:1865".parse().unwrap(), 1865));
    }

    #[tokio::test]
    async fn configuring_a_local_instrument_does_not_feed_own_stream() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut transport = UdpTransport::bind(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap();

        transport.send(b"{\"channels\":\"X\"}").await.unwrap();
        assert!(transport
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn timeout_is_not_an_error() {
        let (mut transport, _peer) = loopback().await;
        let received = transport.receive(Duration::from_millis(10)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn receive_only_send_is_discarded_and_close_is_single_shot() {
        let (mut transport, _peer) = loopback().await;
        transport.send(b"cfg").await.unwrap();
        assert!(transport
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        transport.close().await.unwrap();
        assert!(transport.close().await.is_err());
        assert!(transport.receive(Duration::from_millis(1)).await.is_err());
    }
}
