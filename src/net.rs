use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

/// The one collaborator interface the connector and every connection's
/// executor send/receive through. Kept as a trait (rather than depending on
/// `tokio::net::UdpSocket` directly in handshake-driving code) for the same
/// reason `CredentialStore` and `MonotonicClock` are traits: a test can
/// stand up two in-memory peers exchanging datagrams through a channel pair
/// instead of binding real ports.
#[async_trait]
pub trait UdpSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl UdpSocket for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

#[cfg(test)]
mod net_test {
    use super::*;

    #[tokio::test]
    async fn tokio_socket_round_trips_through_the_trait() {
        let a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = UdpSocket::local_addr(&b).unwrap();

        let a: Box<dyn UdpSocket> = Box::new(a);
        let b: Box<dyn UdpSocket> = Box::new(b);

        a.send_to(b"hello", b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
