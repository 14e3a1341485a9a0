use std::sync::Arc;
use std::time::Instant;

use crate::config::{HandshakeConfig, Role};
use crate::credential::{CredentialStore, PeerIdentity};
use crate::crypto::cipher::KeyMaterial;
use crate::crypto::curve::{ecdhe_derive, Keypair, NamedCurve};
use crate::crypto::{prf, signature};
use crate::error::{Error, Result};
use crate::fragment::FragmentBuffer;
use crate::handshake_cache::HandshakeCache;
use crate::session::ResumptionCache;
use crate::wire::alert::AlertDescription;
use crate::wire::cipher_suite::{find_matching_cipher_suite, CipherSuiteId};
use crate::wire::extension::Extension;
use crate::wire::handshake::{
    Certificate as WireCertificate, CertificateVerify, ClientHello, ClientKeyExchange, Finished,
    Handshake, HandshakeHeader, HandshakeMessage, HandshakeRandom, HandshakeType,
    HelloVerifyRequest, ServerHello, ServerHelloDone, ServerKeyExchange,
};
use crate::wire::record::{ProtocolVersion, PROTOCOL_VERSION_1_2};

/// RFC 6347 §4.2.2: the handshake's own little state machine, independent of
/// the record layer's epoch/sequence bookkeeping. Named per spec.md §4.E.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HandshakeState {
    Initial,
    CookieSent,
    HelloReceived,
    KeysExchanged,
    CcsReceived,
    FinishedReceived,
    Established,
    Failed,
}

/// Outcome of the server processing a ClientKeyExchange: everything
/// `connection.rs` needs to derive a `Session` and verify the client's
/// Finished, without reaching back into `Handshaker`'s private state.
pub struct ServerKeyExchangeResult {
    pub master_secret: Vec<u8>,
    pub cipher_suite: CipherSuiteId,
    pub client_random: HandshakeRandom,
    pub server_random: HandshakeRandom,
    pub peer_identity: Option<PeerIdentity>,
}

struct PendingKeyExchange {
    keypair: Option<Keypair>,
    client_random: HandshakeRandom,
    server_random: HandshakeRandom,
    cipher_suite: CipherSuiteId,
    identity_hint: Vec<u8>,
}

/// RFC 5246 §7.3: what the abbreviated handshake needs once a client's
/// offered `session_id` matches an entry still held in the resumption
/// cache — fresh randoms, the reused master secret, and whichever suite
/// and peer identity that session originally authenticated.
struct ResumedExchange {
    client_random: HandshakeRandom,
    server_random: HandshakeRandom,
    cipher_suite: CipherSuiteId,
    master_secret: Vec<u8>,
    peer_identity: Option<PeerIdentity>,
}

/// Drives one peer's handshake to completion. Owns the message-seq
/// counters, fragment reassembly, and transcript cache that spec.md §4.E
/// assigns to the Handshaker; record-layer epoch/sequence state lives in
/// `Session` once the handshake establishes it.
pub struct Handshaker {
    pub role: Role,
    pub state: HandshakeState,
    local_random: HandshakeRandom,
    next_send_seq: u16,
    next_receive_seq: u16,
    fragments: FragmentBuffer,
    cache: HandshakeCache,
    cookie: Vec<u8>,
    pending: Option<PendingKeyExchange>,
    retransmit_count: u32,
    last_flight_sent_at: Option<Instant>,
    config: HandshakeConfig,
    credentials: Arc<dyn CredentialStore>,
    session_id: Vec<u8>,
    resumed: Option<ResumedExchange>,
    offered_resumption: Option<(Vec<u8>, Vec<u8>, Option<PeerIdentity>)>,
    early_finished_sent: bool,
}

impl Handshaker {
    pub fn new(config: HandshakeConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let mut local_random = HandshakeRandom::default();
        local_random.populate();
        Handshaker {
            role: config.role,
            state: HandshakeState::Initial,
            local_random,
            next_send_seq: 0,
            next_receive_seq: 0,
            fragments: FragmentBuffer::new(),
            cache: HandshakeCache::new(),
            cookie: vec![],
            pending: None,
            retransmit_count: 0,
            last_flight_sent_at: None,
            config,
            credentials,
            session_id: vec![],
            resumed: None,
            offered_resumption: None,
            early_finished_sent: false,
        }
    }

    /// Builds a client-role `Handshaker` that offers `session_id` for
    /// resumption (RFC 5246 §7.3) instead of starting a fresh negotiation.
    /// `master_secret`/`peer_identity` are whatever a prior handshake
    /// against the same peer established; a server that no longer holds
    /// `session_id` in its own cache falls back to a full handshake rather
    /// than erroring, so offering a stale id here is always safe.
    pub fn new_resuming(
        config: HandshakeConfig,
        credentials: Arc<dyn CredentialStore>,
        session_id: Vec<u8>,
        master_secret: Vec<u8>,
        peer_identity: Option<PeerIdentity>,
    ) -> Self {
        let mut handshaker = Self::new(config, credentials);
        handshaker.offered_resumption = Some((session_id, master_secret, peer_identity));
        handshaker
    }

    /// The `session_id` this handshake ended up using: generated fresh by
    /// the server on a full handshake, echoed back on a resumed one, or
    /// empty until that point is reached.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// The lowest message sequence number this handshake hasn't yet
    /// accepted; anything below it is a retransmission of a message already
    /// processed.
    pub fn next_receive_seq(&self) -> u16 {
        self.next_receive_seq
    }

    fn take_send_seq(&mut self) -> u16 {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        seq
    }

    fn push_outgoing(&mut self, message: HandshakeMessage) -> Result<Vec<u8>> {
        let mut handshake = Handshake::new(message);
        handshake.header.message_seq = self.take_send_seq();
        let mut raw = vec![];
        handshake.marshal(&mut raw)?;
        self.cache.push(handshake, raw.clone(), 0, self.role == Role::Client);
        Ok(raw)
    }

    /// Caches a received handshake message's canonical bytes in the
    /// transcript. Takes an already-decoded `HandshakeMessage` rather than
    /// raw bytes: `ServerKeyExchange`/`ClientKeyExchange` can only be decoded
    /// with cipher-suite context the caller already has, so re-decoding here
    /// would be either wrong or redundant.
    pub(crate) fn accept_incoming(&mut self, header: &HandshakeHeader, message: HandshakeMessage, is_client: bool) -> Result<()> {
        // Reassembly may have been driven by the last fragment's header, whose
        // fragment_offset is nonzero; the cached transcript bytes must always
        // be the canonical (unfragmented) encoding so both sides hash the
        // same bytes regardless of how the message was split on the wire.
        let canonical_header = HandshakeHeader { fragment_offset: 0, fragment_length: header.length, ..*header };
        let mut raw = vec![];
        let handshake = Handshake { header: canonical_header, message };
        handshake.marshal(&mut raw)?;
        self.cache.push(handshake, raw, 0, is_client);
        self.next_receive_seq = self.next_receive_seq.max(header.message_seq + 1);
        Ok(())
    }

    /// Feeds one reassembled (never partial) handshake record in. Returns
    /// `Some(fragments to send)` once enough of the current flight has
    /// arrived to react, or `None` if more fragments are still pending.
    pub fn receive_fragment(&mut self, header: HandshakeHeader, fragment: &[u8]) -> Option<(HandshakeHeader, Vec<u8>)> {
        self.fragments.push(&header, fragment).map(|body| (header, body))
    }

    /// Builds the first (or cookie-less) ClientHello a client sends to open
    /// a handshake.
    pub fn client_build_client_hello(&mut self) -> Result<Vec<u8>> {
        let session_id = self.offered_resumption.as_ref().map(|(id, _, _)| id.clone()).unwrap_or_default();
        let hello = ClientHello {
            version: PROTOCOL_VERSION_1_2,
            random: self.local_random,
            session_id,
            cookie: self.cookie.clone(),
            cipher_suites: self.config.cipher_suites.clone(),
            extensions: vec![],
        };
        self.push_outgoing(HandshakeMessage::ClientHello(hello))
    }

    /// `true` once a server's echoed `ServerHello.session_id` confirms the
    /// resumption this client offered was accepted.
    pub fn client_accept_resumed_server_hello(&self, server_hello: &ServerHello) -> bool {
        match &self.offered_resumption {
            Some((id, _, _)) => !server_hello.session_id.is_empty() && *id == server_hello.session_id,
            None => false,
        }
    }

    /// Consumes a confirmed-resumed `ServerHello`: records it in the
    /// transcript (still Finished-covered, same as a full handshake) and
    /// hands back the reused master secret plus the fresh randoms needed to
    /// derive this connection's traffic keys.
    pub fn client_handle_resumed_server_hello(
        &mut self,
        header: &HandshakeHeader,
        server_hello: ServerHello,
    ) -> Result<(Vec<u8>, CipherSuiteId, HandshakeRandom, HandshakeRandom, Option<PeerIdentity>)> {
        let (session_id, master_secret, peer_identity) = self
            .offered_resumption
            .take()
            .ok_or_else(|| Error::InternalError("client_handle_resumed_server_hello called without an offered session".to_owned()))?;
        self.session_id = session_id;
        let server_random = server_hello.random;
        let client_random = self.local_random;
        let cipher_suite = server_hello.cipher_suite;
        self.accept_incoming(header, HandshakeMessage::ServerHello(server_hello), false)?;
        self.state = HandshakeState::KeysExchanged;
        Ok((master_secret, cipher_suite, client_random, server_random, peer_identity))
    }

    /// RFC 6347 §4.2.1: the cookie-less ClientHello and the HelloVerifyRequest
    /// responding to it are excluded from the Finished transcript, so the
    /// cache is cleared and sequencing restarts before resending with the
    /// cookie attached.
    pub fn client_handle_hello_verify_request(&mut self, hvr: HelloVerifyRequest) -> Result<Vec<u8>> {
        self.cookie = hvr.cookie;
        self.cache.clear();
        self.next_send_seq = 0;
        self.state = HandshakeState::CookieSent;
        self.client_build_client_hello()
    }

    /// RFC 6347 §4.2.1: a ClientHello without a cookie never creates
    /// connection state; the server replies with HelloVerifyRequest and
    /// waits for the echoed cookie before doing any expensive work.
    pub fn server_handle_client_hello(
        &mut self,
        header: HandshakeHeader,
        raw_body: &[u8],
        client_hello: ClientHello,
        cookie_secret: &[u8],
        peer_addr: &[u8],
        resumption: &ResumptionCache,
    ) -> Result<Vec<u8>> {
        if client_hello.version != PROTOCOL_VERSION_1_2 {
            return Err(Error::HandshakeFailure(AlertDescription::ProtocolVersion));
        }

        if client_hello.cookie.is_empty() {
            let cookie = signature::compute_cookie(cookie_secret, peer_addr, raw_body);
            self.cookie = cookie.clone();
            self.state = HandshakeState::CookieSent;
            let hvr = HelloVerifyRequest { version: PROTOCOL_VERSION_1_2, cookie };
            return self.push_outgoing(server_hello_verify_to_message(hvr));
        }

        let expected = signature::compute_cookie(cookie_secret, peer_addr, raw_body);
        // Comparing the cookie is already a pre-state-creation check; RFC
        // 6347 does not require constant time here since the cookie is not
        // itself a credential, only a return-routability proof.
        if client_hello.cookie != expected {
            self.cookie = expected.clone();
            let hvr = HelloVerifyRequest { version: PROTOCOL_VERSION_1_2, cookie: expected };
            return self.push_outgoing(server_hello_verify_to_message(hvr));
        }

        let client_random = client_hello.random;
        let requested_session_id = client_hello.session_id.clone();
        let resumed_entry = if requested_session_id.is_empty() {
            None
        } else {
            resumption.lock().unwrap().get(&requested_session_id).cloned()
        };
        let cipher_suite = match &resumed_entry {
            Some(entry) => entry.cipher_suite,
            None => find_matching_cipher_suite(&client_hello.cipher_suites, &self.config.cipher_suites)
                .ok_or(Error::NoCipherSuiteOverlap)?,
        };

        self.accept_incoming(&header, HandshakeMessage::ClientHello(client_hello), true)?;
        self.state = HandshakeState::HelloReceived;

        let mut server_random = HandshakeRandom::default();
        server_random.populate();

        match resumed_entry {
            Some(entry) => {
                self.session_id = requested_session_id;
                self.resumed = Some(ResumedExchange {
                    client_random,
                    server_random,
                    cipher_suite: entry.cipher_suite,
                    master_secret: entry.master_secret,
                    peer_identity: entry.peer_identity,
                });
            }
            None => {
                use rand::RngCore;
                let mut session_id = vec![0u8; 16];
                rand::thread_rng().fill_bytes(&mut session_id);
                self.session_id = session_id;
            }
        }

        self.pending = Some(PendingKeyExchange {
            keypair: None,
            client_random,
            server_random,
            cipher_suite,
            identity_hint: vec![],
        });

        Ok(vec![])
    }

    /// `true` once `server_handle_client_hello` matched the client's offered
    /// `session_id` against the resumption cache.
    pub fn is_resuming(&self) -> bool {
        self.resumed.is_some()
    }

    /// Builds the abbreviated handshake's only flight-4 message: a
    /// ServerHello echoing the resumed `session_id`. No Certificate,
    /// ServerKeyExchange or ServerHelloDone follow it.
    pub fn server_build_resumed_flight(&mut self) -> Result<Vec<u8>> {
        let resumed = self
            .resumed
            .as_ref()
            .ok_or_else(|| Error::InternalError("server_build_resumed_flight called without a resumed session".to_owned()))?;
        let server_random = resumed.server_random;
        let cipher_suite = resumed.cipher_suite;
        let session_id = self.session_id.clone();

        let out = self.push_outgoing(HandshakeMessage::ServerHello(ServerHello {
            version: PROTOCOL_VERSION_1_2,
            random: server_random,
            session_id,
            cipher_suite,
            extensions: vec![],
        }))?;
        self.state = HandshakeState::KeysExchanged;
        Ok(out)
    }

    /// Takes the resumed session's key-derivation inputs once the matching
    /// ServerHello has gone out, mirroring what `server_handle_client_key_exchange`
    /// returns for a full handshake so both paths feed the same caller logic.
    pub fn take_resumed_establishment(&mut self) -> Option<ServerKeyExchangeResult> {
        self.resumed.take().map(|r| ServerKeyExchangeResult {
            master_secret: r.master_secret,
            cipher_suite: r.cipher_suite,
            client_random: r.client_random,
            server_random: r.server_random,
            peer_identity: r.peer_identity,
        })
    }

    /// `true` once the server has already sent its ChangeCipherSpec+Finished
    /// eagerly as part of a resumed flight, so `handle_finished` does not
    /// send them a second time when the client's Finished arrives.
    pub fn early_finished_sent(&self) -> bool {
        self.early_finished_sent
    }

    pub fn mark_early_finished_sent(&mut self) {
        self.early_finished_sent = true;
    }

    /// Builds flight 4 (ServerHello .. ServerHelloDone) once cipher suite and
    /// randoms are known. Returns one buffer per handshake message so the
    /// caller can apply MTU-aware fragmentation independently per message.
    pub fn server_build_flight4(&mut self, curve: Option<NamedCurve>) -> Result<Vec<Vec<u8>>> {
        let pending = self.pending.as_ref().ok_or_else(|| {
            Error::InternalError("server_build_flight4 called before client hello processed".to_owned())
        })?;
        let cipher_suite = pending.cipher_suite;
        let server_random = pending.server_random;
        let client_random = pending.client_random;
        let identity = self.credentials.local_psk_identity().map(|i| i.to_vec()).unwrap_or_default();

        let mut out = vec![];
        out.push(self.push_outgoing(HandshakeMessage::ServerHello(ServerHello {
            version: PROTOCOL_VERSION_1_2,
            random: server_random,
            session_id: vec![],
            cipher_suite,
            extensions: vec![],
        }))?);

        if cipher_suite.is_ecdsa() {
            if let Some(cert) = self.credentials.local_certificate() {
                out.push(self.push_outgoing(HandshakeMessage::Certificate(WireCertificate {
                    certificate: vec![cert.certificate_der.clone()],
                }))?);
            }
        }

        if cipher_suite.is_ecdhe() {
            let curve = curve.unwrap_or(NamedCurve::X25519);
            let keypair = curve.generate_keypair()?;
            let public_key = keypair.public_key.clone();

            let signature = if cipher_suite.is_ecdsa() {
                let cert = self
                    .credentials
                    .local_certificate()
                    .ok_or_else(|| Error::InternalError("ECDSA suite selected without a certificate".to_owned()))?;
                signature::sign_server_key_exchange(
                    &cert.private_key_pkcs8,
                    &client_random.to_bytes(),
                    &server_random.to_bytes(),
                    &public_key,
                )?
            } else {
                vec![]
            };

            out.push(self.push_outgoing(HandshakeMessage::ServerKeyExchange(ServerKeyExchange {
                identity_hint: identity,
                curve: Some(curve),
                public_key,
                signature,
            }))?);

            if let Some(pending) = self.pending.as_mut() {
                pending.keypair = Some(keypair);
            }
        } else if cipher_suite.is_psk() {
            out.push(self.push_outgoing(HandshakeMessage::ServerKeyExchange(ServerKeyExchange {
                identity_hint: identity,
                curve: None,
                public_key: vec![],
                signature: vec![],
            }))?);
        }

        out.push(self.push_outgoing(HandshakeMessage::ServerHelloDone(ServerHelloDone))?);
        self.state = HandshakeState::KeysExchanged;
        Ok(out)
    }

    /// Client-side: builds flight 3 in response to ServerHello..ServerHelloDone
    /// and derives the pre-master secret for the negotiated suite, returning
    /// the outgoing Flight 5 messages plus the negotiated `Session` inputs.
    pub async fn client_handle_server_flight(
        &mut self,
        server_hello: ServerHello,
        server_key_exchange: Option<ServerKeyExchange>,
        certificate: Option<WireCertificate>,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>, Option<PeerIdentity>)> {
        self.session_id = server_hello.session_id.clone();
        let cipher_suite = server_hello.cipher_suite;
        let server_random = server_hello.random;
        let client_random = self.local_random;

        let mut peer_identity = None;
        let pre_master_secret;
        let mut client_public_key: Option<Vec<u8>> = None;

        if cipher_suite.is_psk() && !cipher_suite.is_ecdhe() {
            let ske = server_key_exchange
                .ok_or_else(|| Error::HandshakeFailure(AlertDescription::HandshakeFailure))?;
            let psk = self.credentials.psk(&ske.identity_hint).await?;
            pre_master_secret = prf::psk_pre_master_secret(&psk);
            peer_identity = Some(PeerIdentity::Psk(String::from_utf8_lossy(&ske.identity_hint).into_owned()));
        } else {
            let ske = server_key_exchange
                .ok_or_else(|| Error::HandshakeFailure(AlertDescription::HandshakeFailure))?;
            let curve = ske
                .curve
                .ok_or_else(|| Error::HandshakeFailure(AlertDescription::HandshakeFailure))?;

            if cipher_suite.is_ecdsa() {
                let cert_der = certificate
                    .as_ref()
                    .and_then(|c| c.certificate.first())
                    .ok_or_else(|| Error::HandshakeFailure(AlertDescription::BadCertificate))?;
                let leaf_public_key = crate::crypto::cert::leaf_public_key(cert_der)?;
                signature::verify_server_key_exchange(
                    &leaf_public_key,
                    &client_random.to_bytes(),
                    &server_random.to_bytes(),
                    &ske.public_key,
                    &ske.signature,
                )?;
                peer_identity = Some(PeerIdentity::X509Chain(
                    certificate.map(|c| c.certificate).unwrap_or_default(),
                ));
            }

            let keypair = curve.generate_keypair()?;
            let public_key_for_wire = keypair.public_key.clone();
            let shared_secret = ecdhe_derive(keypair.private_key, &ske.public_key)?;

            pre_master_secret = if cipher_suite.is_psk() {
                let psk = self.credentials.psk(&ske.identity_hint).await?;
                prf::ecdhe_psk_pre_master_secret(&shared_secret, &psk)
            } else {
                prf::ecdhe_pre_master_secret(&shared_secret)?
            };
            client_public_key = Some(public_key_for_wire);
        }

        let master_secret = prf::master_secret(&pre_master_secret, &client_random.to_bytes(), &server_random.to_bytes());

        let mut out = vec![];
        if cipher_suite.is_ecdhe() {
            let public_key = client_public_key.expect("ecdhe branch always sets client_public_key");
            out.push(self.push_outgoing(HandshakeMessage::ClientKeyExchange(ClientKeyExchange {
                identity: vec![],
                public_key,
            }))?);
        } else {
            let identity = self.credentials.local_psk_identity().map(|i| i.to_vec()).unwrap_or_default();
            out.push(self.push_outgoing(HandshakeMessage::ClientKeyExchange(ClientKeyExchange {
                identity,
                public_key: vec![],
            }))?);
        }

        self.state = HandshakeState::KeysExchanged;
        Ok((out, master_secret, peer_identity))
    }

    /// Cipher suite negotiated for the in-progress server handshake, needed
    /// by the caller to pick `ClientKeyExchange::unmarshal_psk` vs.
    /// `unmarshal_ecdhe` before the suite is confirmed any other way.
    pub fn pending_cipher_suite(&self) -> Option<CipherSuiteId> {
        self.pending.as_ref().map(|p| p.cipher_suite)
    }

    /// Server-side counterpart of `client_handle_server_flight`: derives the
    /// master secret from the client's ClientKeyExchange once flight 4 has
    /// already been sent and `self.pending` holds the negotiated suite and
    /// (for ECDHE) the server's ephemeral keypair.
    pub async fn server_handle_client_key_exchange(
        &mut self,
        client_key_exchange: ClientKeyExchange,
    ) -> Result<ServerKeyExchangeResult> {
        let pending = self.pending.take().ok_or_else(|| {
            Error::InternalError("server_handle_client_key_exchange called before flight4 sent".to_owned())
        })?;
        let cipher_suite = pending.cipher_suite;
        let mut peer_identity = None;

        let pre_master_secret = if cipher_suite.is_ecdhe() {
            let keypair = pending
                .keypair
                .ok_or_else(|| Error::InternalError("missing server ephemeral keypair".to_owned()))?;
            let shared_secret = ecdhe_derive(keypair.private_key, &client_key_exchange.public_key)?;
            if cipher_suite.is_psk() {
                let psk = self.credentials.psk(&client_key_exchange.identity).await?;
                peer_identity = Some(PeerIdentity::Psk(
                    String::from_utf8_lossy(&client_key_exchange.identity).into_owned(),
                ));
                prf::ecdhe_psk_pre_master_secret(&shared_secret, &psk)
            } else {
                prf::ecdhe_pre_master_secret(&shared_secret)?
            }
        } else {
            let psk = self.credentials.psk(&client_key_exchange.identity).await?;
            peer_identity = Some(PeerIdentity::Psk(
                String::from_utf8_lossy(&client_key_exchange.identity).into_owned(),
            ));
            prf::psk_pre_master_secret(&psk)
        };

        let master_secret = prf::master_secret(
            &pre_master_secret,
            &pending.client_random.to_bytes(),
            &pending.server_random.to_bytes(),
        );
        self.state = HandshakeState::KeysExchanged;
        Ok(ServerKeyExchangeResult {
            master_secret,
            cipher_suite,
            client_random: pending.client_random,
            server_random: pending.server_random,
            peer_identity,
        })
    }

    /// RFC 5246 §7.4.9: builds this side's Finished message, the last step
    /// before the handshake is considered `Established` by the caller (who
    /// still has to verify the peer's Finished first).
    pub fn build_finished(&mut self, master_secret: &[u8]) -> Result<Vec<u8>> {
        let transcript = self.cache.transcript();
        let hash = crate::crypto::prf::handshake_transcript_hash(&transcript);
        let verify_data = match self.role {
            Role::Client => prf::verify_data_client(master_secret, &hash),
            Role::Server => prf::verify_data_server(master_secret, &hash),
        };
        self.push_outgoing(HandshakeMessage::Finished(Finished { verify_data }))
    }

    /// Verifies the peer's Finished against the transcript hash taken
    /// *before* that Finished message was appended (it cannot cover itself).
    pub fn verify_peer_finished(&self, master_secret: &[u8], peer_role_is_client: bool, verify_data: &[u8]) -> Result<()> {
        use subtle::ConstantTimeEq;
        let transcript = self.cache.transcript();
        let hash = crate::crypto::prf::handshake_transcript_hash(&transcript);
        let expected = if peer_role_is_client {
            prf::verify_data_client(master_secret, &hash)
        } else {
            prf::verify_data_server(master_secret, &hash)
        };
        if expected.ct_eq(verify_data).unwrap_u8() != 1 {
            return Err(Error::HandshakeFailure(AlertDescription::DecryptError));
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        self.state = HandshakeState::Established;
    }

    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, HandshakeState::Established | HandshakeState::Failed)
    }

    pub fn local_random(&self) -> HandshakeRandom {
        self.local_random
    }

    /// Exponential backoff per spec.md §4.D, capped at `max_retransmissions`.
    pub fn should_retransmit(&self, now: Instant) -> bool {
        match self.last_flight_sent_at {
            None => false,
            Some(sent_at) => {
                let backoff = self.config.retransmit_timeout * 2u32.pow(self.retransmit_count.min(16));
                now.saturating_duration_since(sent_at) >= backoff
            }
        }
    }

    pub fn record_flight_sent(&mut self, now: Instant) {
        self.last_flight_sent_at = Some(now);
    }

    pub fn record_retransmit(&mut self) -> bool {
        self.retransmit_count += 1;
        self.retransmit_count <= self.config.max_retransmissions
    }

    pub fn retransmit_exhausted(&self) -> bool {
        self.retransmit_count > self.config.max_retransmissions
    }
}

fn server_hello_verify_to_message(hvr: HelloVerifyRequest) -> HandshakeMessage {
    // HelloVerifyRequest has its own RFC 6347 wire shape (version+cookie,
    // no ServerHello fields) but is carried as a Handshake message like any
    // other; there is no dedicated HandshakeMessage variant confusion here,
    // the enum variant name matches the RFC's handshake type name exactly.
    HandshakeMessage::HelloVerifyRequest(hvr)
}

#[cfg(test)]
mod resumption_test {
    use super::*;
    use crate::credential::StaticCredentialStore;
    use crate::wire::cipher_suite::DEFAULT_CIPHER_SUITES;

    fn test_header() -> HandshakeHeader {
        HandshakeHeader { handshake_type: HandshakeType::ClientHello, length: 0, message_seq: 0, fragment_offset: 0, fragment_length: 0 }
    }

    fn client_hello(cookie: Vec<u8>, session_id: Vec<u8>) -> ClientHello {
        let mut random = HandshakeRandom::default();
        random.populate();
        ClientHello { version: PROTOCOL_VERSION_1_2, random, session_id, cookie, cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(), extensions: vec![] }
    }

    fn server_handshaker() -> Handshaker {
        Handshaker::new(HandshakeConfig { role: Role::Server, ..Default::default() }, Arc::new(StaticCredentialStore::new()))
    }

    #[test]
    fn resumption_cache_hit_skips_key_exchange() {
        let secret = b"cookie-secret".to_vec();
        let peer_addr = b"127.0.0.1:5000".to_vec();
        let raw_body = b"client-hello-bytes".to_vec();
        let cookie = signature::compute_cookie(&secret, &peer_addr, &raw_body);

        let cache = crate::session::new_resumption_cache();
        let session_id = vec![9u8; 16];
        cache.lock().unwrap().insert(
            session_id.clone(),
            crate::session::ResumableSession {
                cipher_suite: CipherSuiteId::TlsEcdhePskWithAes128CbcSha256,
                master_secret: vec![1u8; 48],
                peer_identity: None,
            },
        );

        let mut handshaker = server_handshaker();
        let hello = client_hello(cookie, session_id.clone());
        let out = handshaker.server_handle_client_hello(test_header(), &raw_body, hello, &secret, &peer_addr, &cache).unwrap();

        assert!(out.is_empty());
        assert!(handshaker.is_resuming());
        assert_eq!(handshaker.session_id(), session_id.as_slice());
    }

    #[test]
    fn unknown_session_id_falls_back_to_full_handshake() {
        let secret = b"cookie-secret".to_vec();
        let peer_addr = b"127.0.0.1:5001".to_vec();
        let raw_body = b"client-hello-bytes-2".to_vec();
        let cookie = signature::compute_cookie(&secret, &peer_addr, &raw_body);

        let cache = crate::session::new_resumption_cache();
        let mut handshaker = server_handshaker();
        let hello = client_hello(cookie, vec![7u8; 16]);
        let out = handshaker.server_handle_client_hello(test_header(), &raw_body, hello, &secret, &peer_addr, &cache).unwrap();

        assert!(out.is_empty());
        assert!(!handshaker.is_resuming());
        assert!(!handshaker.session_id().is_empty());
        assert_ne!(handshaker.session_id(), &[7u8; 16][..]);
    }

    #[test]
    fn client_confirms_resumed_server_hello_by_session_id() {
        let session_id = vec![3u8; 16];
        let master_secret = vec![2u8; 48];
        let mut client = Handshaker::new_resuming(
            HandshakeConfig { role: Role::Client, ..Default::default() },
            Arc::new(StaticCredentialStore::new()),
            session_id.clone(),
            master_secret.clone(),
            None,
        );
        client.client_build_client_hello().unwrap();

        let mut server_random = HandshakeRandom::default();
        server_random.populate();
        let matching = ServerHello {
            version: PROTOCOL_VERSION_1_2,
            random: server_random,
            session_id: session_id.clone(),
            cipher_suite: CipherSuiteId::TlsEcdhePskWithAes128CbcSha256,
            extensions: vec![],
        };
        assert!(client.client_accept_resumed_server_hello(&matching));

        let mismatched = ServerHello { session_id: vec![9u8; 16], ..matching.clone() };
        assert!(!client.client_accept_resumed_server_hello(&mismatched));

        let (returned_secret, suite, _client_random, _server_random, _identity) =
            client.client_handle_resumed_server_hello(&test_header(), matching).unwrap();
        assert_eq!(returned_secret, master_secret);
        assert_eq!(suite, CipherSuiteId::TlsEcdhePskWithAes128CbcSha256);
    }
}
