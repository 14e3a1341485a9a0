use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::{Config, Role};
use crate::connection::{encode_stateless_handshake, ConnTask, Connection};
use crate::crypto::signature;
use crate::error::{Error, Result};
use crate::handshaker::Handshaker;
use crate::net::UdpSocket;
use crate::store::ConnectionStore;
use crate::wire::handshake::{ClientHello, HandshakeHeader, HandshakeMessage, HandshakeType, HelloVerifyRequest, HANDSHAKE_HEADER_LENGTH};
use crate::wire::record;

type SentCallback = Arc<dyn Fn(SocketAddr, Result<()>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(SocketAddr, &Error) + Send + Sync>;
type ConnectCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;
type RawDataReceiver = Arc<dyn Fn(SocketAddr, Vec<u8>) + Send + Sync>;

/// Owns the one UDP socket shared by every peer, the connection store, and
/// the receiver task that demultiplexes inbound datagrams by source
/// address into each connection's serial executor. This is spec.md §4.G's
/// Connector, and the teacher's closest analogue to "one `Conn` owns one
/// bound socket" generalized to "one `Connector` owns one bound socket
/// shared by every peer".
pub struct Connector {
    socket: Arc<dyn UdpSocket>,
    config: Arc<Config>,
    store: Arc<Mutex<ConnectionStore>>,
    receiver_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    on_sent: Mutex<Option<SentCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_connect: Mutex<Option<ConnectCallback>>,
    raw_data_receiver: Mutex<Option<RawDataReceiver>>,
}

impl Connector {
    pub async fn bind(local_addr: SocketAddr, config: Config) -> Result<Arc<Self>> {
        let socket: Arc<dyn UdpSocket> = Arc::new(tokio::net::UdpSocket::bind(local_addr).await?);
        let config = Arc::new(config);
        let store = Arc::new(Mutex::new(ConnectionStore::new(
            config.connection_store_capacity,
            config.connection_idle_threshold,
        )));

        Ok(Arc::new(Connector {
            socket,
            config,
            store,
            receiver_task: Mutex::new(None),
            shutdown: Mutex::new(None),
            on_sent: Mutex::new(None),
            on_error: Mutex::new(None),
            on_connect: Mutex::new(None),
            raw_data_receiver: Mutex::new(None),
        }))
    }

    pub fn get_maximum_transmission_unit(&self) -> usize {
        self.config.maximum_transmission_unit
    }

    pub fn get_maximum_fragment_length(&self) -> usize {
        self.config.maximum_fragment_length()
    }

    pub async fn set_raw_data_receiver(&self, f: RawDataReceiver) {
        *self.raw_data_receiver.lock().await = Some(f);
    }

    pub async fn set_alert_handler(&self, f: ErrorCallback) {
        *self.on_error.lock().await = Some(f);
    }

    pub async fn set_on_sent(&self, f: SentCallback) {
        *self.on_sent.lock().await = Some(f);
    }

    pub async fn set_on_connect(&self, f: ConnectCallback) {
        *self.on_connect.lock().await = Some(f);
    }

    /// Starts the single receiver task. Spawned tasks handed off per
    /// connection are Tokio's own worker pool, satisfying spec.md §5's
    /// "shared worker pool" requirement without a hand-rolled scheduler.
    pub async fn start(self: &Arc<Self>) {
        let (tx, mut rx) = oneshot::channel();
        *self.shutdown.lock().await = Some(tx);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = &mut rx => {
                        trace!("connector receiver loop stopping");
                        break;
                    }
                    result = this.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, peer_addr)) => this.dispatch_inbound(peer_addr, buf[..n].to_vec()).await,
                            Err(e) => {
                                warn!("transient receive error: {}", e);
                            }
                        }
                    }
                }
            }
        });
        *self.receiver_task.lock().await = Some(handle);
        info!("connector started on {:?}", self.socket.local_addr());
    }

    /// Dispatches a datagram from an address already known to the store
    /// straight to its connection; for an unseen address, first runs it
    /// through the stateless cookie exchange (RFC 6347 §4.2.1) so no
    /// per-peer state is created for a client that never proves it can
    /// receive at its claimed source address.
    async fn dispatch_inbound(self: &Arc<Self>, peer_addr: SocketAddr, datagram: Vec<u8>) {
        let existing = self.store.lock().await.get(&peer_addr);
        let connection = match existing {
            Some(connection) => connection,
            None => {
                if !self.admit_unseen_peer(peer_addr, &datagram).await {
                    return;
                }
                match self.get_or_create_connection(peer_addr, Role::Server).await {
                    Some(connection) => connection,
                    None => {
                        warn!("dropping datagram from {}: connection store is full", peer_addr);
                        return;
                    }
                }
            }
        };
        if let Err(e) = connection.submit(ConnTask::Inbound(datagram)).await {
            error!("failed to dispatch inbound datagram from {}: {}", peer_addr, e);
            if let Some(cb) = self.on_error.lock().await.as_ref() {
                cb(peer_addr, &e);
            }
        }
    }

    /// Parses a single unfragmented ClientHello out of a raw datagram
    /// without creating any per-peer state, so the cookie it carries can be
    /// checked before a `Connection` is ever spawned. Anything else —
    /// fragmented, a different handshake type, a non-zero epoch — isn't a
    /// first-contact ClientHello and is rejected.
    fn peek_unverified_client_hello(datagram: &[u8]) -> Option<(ClientHello, Vec<u8>)> {
        let (header, body) = record::unmarshal_header_and_body(&mut &datagram[..]).ok()?;
        if header.content_type != crate::wire::content::ContentType::Handshake || header.epoch != 0 {
            return None;
        }
        let handshake_header = HandshakeHeader::unmarshal(&mut &body[..]).ok()?;
        if handshake_header.handshake_type != HandshakeType::ClientHello
            || handshake_header.fragment_offset != 0
            || handshake_header.fragment_length != handshake_header.length
        {
            return None;
        }
        let raw_body = body[HANDSHAKE_HEADER_LENGTH..].to_vec();
        let client_hello = ClientHello::unmarshal(&mut &raw_body[..]).ok()?;
        Some((client_hello, raw_body))
    }

    /// Returns `true` once `peer_addr` has proven it can receive at its
    /// claimed source address by echoing back a valid cookie; otherwise
    /// sends a fresh HelloVerifyRequest and returns `false` without
    /// creating any connection state.
    async fn admit_unseen_peer(self: &Arc<Self>, peer_addr: SocketAddr, datagram: &[u8]) -> bool {
        let Some((hello, raw_body)) = Self::peek_unverified_client_hello(datagram) else {
            return false;
        };
        let peer_addr_bytes = peer_addr.to_string().into_bytes();
        let expected = signature::compute_cookie(&self.config.cookie_secret, &peer_addr_bytes, &raw_body);
        if !hello.cookie.is_empty() && hello.cookie == expected {
            return true;
        }

        let hvr = HelloVerifyRequest { version: hello.version, cookie: expected };
        let max_fragment = self.get_maximum_fragment_length();
        match encode_stateless_handshake(HandshakeMessage::HelloVerifyRequest(hvr), max_fragment) {
            Ok(records) => {
                for record in records {
                    if let Err(e) = self.socket.send_to(&record, peer_addr).await {
                        warn!("failed to send HelloVerifyRequest to {}: {}", peer_addr, e);
                    }
                }
            }
            Err(e) => warn!("failed to encode HelloVerifyRequest for {}: {}", peer_addr, e),
        }
        false
    }

    async fn get_or_create_connection(self: &Arc<Self>, peer_addr: SocketAddr, role: Role) -> Option<Arc<Connection>> {
        {
            let store = self.store.lock().await;
            if let Some(existing) = store.get(&peer_addr) {
                return Some(existing);
            }
        }

        let handshaker = Handshaker::new(
            crate::config::HandshakeConfig { role, ..self.config.handshake.clone() },
            self.config.credentials.clone(),
        );
        let (connection, task) =
            Connection::spawn(peer_addr, handshaker, self.socket.clone(), self.config.clone(), Some(self.store.clone()));

        let mut store = self.store.lock().await;
        match store.get(&peer_addr) {
            Some(existing) => {
                task.abort();
                Some(existing)
            }
            None => {
                if let Err(e) = store.insert(peer_addr, connection.clone()) {
                    warn!("dropping connection attempt from {}: {}", peer_addr, e);
                    task.abort();
                    return None;
                }
                if let Some(cb) = self.on_connect.lock().await.as_ref() {
                    cb(peer_addr);
                }
                Some(connection)
            }
        }
    }

    /// Sends application data to `peer_addr`, establishing a connection (and
    /// driving the client handshake) first if none exists yet.
    pub async fn send(self: &Arc<Self>, peer_addr: SocketAddr, plaintext: Vec<u8>) -> Result<()> {
        let connection = self
            .get_or_create_connection(peer_addr, Role::Client)
            .await
            .ok_or(Error::ConnectionStoreFull)?;
        let (respond_tx, mut respond_rx) = mpsc::channel(1);
        connection
            .submit(ConnTask::SendApplicationData { plaintext, respond: respond_tx })
            .await?;
        respond_rx
            .recv()
            .await
            .unwrap_or_else(|| Err(Error::InternalError("connection executor dropped the response channel".to_owned())))
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.receiver_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn restart(self: &Arc<Self>) {
        self.stop().await;
        self.start().await;
    }

    pub async fn destroy(self: &Arc<Self>) {
        self.stop().await;
        let connections = self.store.lock().await.drain();
        for connection in connections {
            connection.close().await;
        }
    }

    pub async fn remaining_capacity(&self) -> usize {
        self.store.lock().await.remaining_capacity()
    }
}

#[cfg(test)]
mod connector_test {
    use super::*;
    use crate::credential::{CredentialStore, StaticCredentialStore};
    use crate::crypto::cert::Certificate;
    use crate::wire::cipher_suite::CipherSuiteId;
    use std::time::Duration;

    async fn bound(addr: &str) -> Arc<Connector> {
        Connector::bind(addr.parse().unwrap(), Config::new(Arc::new(StaticCredentialStore::new())))
            .await
            .unwrap()
    }

    /// A PSK-only config so the handshake never needs a certificate.
    fn bound_psk_config(identity: &[u8], key: &[u8]) -> Config {
        let mut config = Config::new(Arc::new(StaticCredentialStore::new().with_psk(identity.to_vec(), key.to_vec())));
        config.handshake.cipher_suites = vec![CipherSuiteId::TlsPskWithAes128CcmEight];
        config
    }

    #[tokio::test]
    async fn reuses_the_existing_connection_for_a_known_peer() {
        let connector = bound("127.0.0.1:0").await;
        let peer: SocketAddr = "127.0.0.1:6000".parse().unwrap();

        let first = connector.get_or_create_connection(peer, Role::Server).await.unwrap();
        let second = connector.get_or_create_connection(peer, Role::Server).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.remaining_capacity().await, connector.config.connection_store_capacity - 1);
    }

    #[tokio::test]
    async fn send_establishes_a_client_connection_and_emits_a_client_hello() {
        let connector = bound("127.0.0.1:0").await;
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let (respond_tx, mut respond_rx) = mpsc::channel(1);
        let connection = connector.get_or_create_connection(peer_addr, Role::Client).await.unwrap();
        connection
            .submit(ConnTask::SendApplicationData { plaintext: b"hi".to_vec(), respond: respond_tx })
            .await
            .unwrap();
        // The handshake has not completed yet, so this resolves once the
        // ClientHello has gone out and the plaintext is queued pending
        // session establishment, not once it is actually encrypted and sent.
        let _ = respond_rx.try_recv();

        let mut buf = [0u8; 1500];
        let (n, from) = tokio::time::timeout(std::time::Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .expect("connector should have sent a ClientHello")
            .unwrap();
        assert_eq!(from, connector.socket.local_addr().unwrap());
        assert_eq!(buf[0], crate::wire::content::ContentType::Handshake as u8);
        assert!(n >= crate::wire::record::RECORD_LAYER_HEADER_SIZE);
    }

    #[tokio::test]
    async fn destroy_clears_the_connection_store() {
        let connector = bound("127.0.0.1:0").await;
        let peer: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        connector.get_or_create_connection(peer, Role::Server).await;
        assert!(connector.remaining_capacity().await < connector.config.connection_store_capacity);

        connector.destroy().await;
        assert_eq!(connector.remaining_capacity().await, connector.config.connection_store_capacity);
    }

    /// spec.md §8 E6: once the store is full, an unseen peer's datagram is
    /// dropped rather than leaving an orphaned connection task behind.
    #[tokio::test]
    async fn store_exhaustion_drops_new_peers_without_growing_the_store() {
        let mut config = Config::new(Arc::new(StaticCredentialStore::new()));
        config.connection_store_capacity = 1;
        let connector = Connector::bind("127.0.0.1:0".parse().unwrap(), config).await.unwrap();

        let first: SocketAddr = "127.0.0.1:6100".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:6101".parse().unwrap();
        assert!(connector.get_or_create_connection(first, Role::Server).await.is_some());
        assert_eq!(connector.remaining_capacity().await, 0);

        assert!(connector.get_or_create_connection(second, Role::Server).await.is_none());
        assert_eq!(connector.remaining_capacity().await, 0);
        assert!(connector.store.lock().await.get(&second).is_none());
    }

    /// spec.md §8 E1: a real two-sided PSK handshake over loopback sockets,
    /// driven entirely through the public API.
    #[tokio::test]
    async fn completes_a_full_two_sided_handshake() {
        let client = Connector::bind("127.0.0.1:0".parse().unwrap(), bound_psk_config(b"peer", b"secret"))
            .await
            .unwrap();
        let server = Connector::bind("127.0.0.1:0".parse().unwrap(), bound_psk_config(b"peer", b"secret"))
            .await
            .unwrap();
        client.start().await;
        server.start().await;

        let server_addr = server.socket.local_addr().unwrap();
        let client_addr = client.socket.local_addr().unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.send(server_addr, b"hello".to_vec()))
            .await
            .expect("handshake should complete")
            .unwrap();

        let client_conn = client.store.lock().await.get(&server_addr).unwrap();
        assert!(client_conn.is_established());
        let server_conn = server.store.lock().await.get(&client_addr).unwrap();
        assert!(server_conn.is_established());
    }

    struct SlowPskStore {
        inner: StaticCredentialStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl CredentialStore for SlowPskStore {
        async fn psk(&self, identity_hint: &[u8]) -> Result<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            self.inner.psk(identity_hint).await
        }

        fn local_certificate(&self) -> Option<&Certificate> {
            self.inner.local_certificate()
        }

        fn local_psk_identity(&self) -> Option<&[u8]> {
            self.inner.local_psk_identity()
        }
    }

    /// spec.md §8 E4: a slow PSK lookup on the server must not make the
    /// client's retransmitted flight corrupt or restart the handshake.
    #[tokio::test]
    async fn handshake_survives_a_slow_psk_lookup_without_spurious_retransmits() {
        let mut client_config = bound_psk_config(b"peer", b"secret");
        client_config.handshake.retransmit_timeout = Duration::from_millis(50);

        let mut server_config = Config::new(Arc::new(SlowPskStore {
            inner: StaticCredentialStore::new().with_psk(b"peer".to_vec(), b"secret".to_vec()),
            delay: Duration::from_millis(200),
        }));
        server_config.handshake.cipher_suites = vec![CipherSuiteId::TlsPskWithAes128CcmEight];
        server_config.handshake.retransmit_timeout = Duration::from_millis(50);

        let client = Connector::bind("127.0.0.1:0".parse().unwrap(), client_config).await.unwrap();
        let server = Connector::bind("127.0.0.1:0".parse().unwrap(), server_config).await.unwrap();
        client.start().await;
        server.start().await;

        let server_addr = server.socket.local_addr().unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.send(server_addr, b"hi".to_vec()))
            .await
            .expect("handshake should complete despite a slow PSK lookup")
            .unwrap();
    }
}
