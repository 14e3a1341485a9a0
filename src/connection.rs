use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use tokio::sync::{mpsc, Mutex};

use crate::config::{Config, Role};
use crate::credential::PeerIdentity;
use crate::error::{Error, Result};
use crate::handshaker::{HandshakeState, Handshaker};
use crate::net::UdpSocket;
use crate::session::{derive_keys, ResumableSession, Session};
use crate::store::ConnectionStore;
use crate::wire::alert::{Alert, AlertDescription, AlertLevel};
use crate::wire::cipher_suite::CipherSuiteId;
use crate::wire::change_cipher_spec::ChangeCipherSpec;
use crate::wire::content::{Content, ContentType};
use crate::wire::handshake::{
    Certificate as WireCertificate, ClientHello, ClientKeyExchange, Finished, HandshakeHeader,
    HandshakeMessage, HandshakeRandom, HandshakeType, HelloVerifyRequest, ServerHello,
    ServerHelloDone, ServerKeyExchange, HANDSHAKE_HEADER_LENGTH,
};
use crate::wire::record::{self, ProtocolVersion, Record, RecordLayerHeader, PROTOCOL_VERSION_1_2};

const RETRANSMIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One unit of work the connection's serial executor runs. Grounded on the
/// teacher's single `Conn` per socket handling its own inbound/outbound
/// packets serially off one task; here the same "exactly one task alive at
/// a time for this peer" guarantee is expressed as a channel feeding a
/// dedicated consumer loop instead of owning the whole connection's future.
pub enum ConnTask {
    Inbound(Vec<u8>),
    SendApplicationData { plaintext: Vec<u8>, respond: mpsc::Sender<Result<()>> },
    Close,
}

/// One logical input to a flight, kept around (rather than the already
/// framed wire bytes) so a retransmit can re-run `send_flight` and pick up
/// fresh epoch-0 record sequence numbers while leaving the handshake message
/// sequence number the fragment headers carry untouched (RFC 6347 §4.2.4).
#[derive(Clone)]
pub enum FlightItem {
    Handshake(Vec<u8>),
    ChangeCipherSpec,
}

/// Carries the negotiated secret and the inputs to `derive_keys` across the
/// gap between key exchange and the peer's Finished arriving; once both
/// sides' Finished messages have been verified this becomes a `Session`.
struct PendingEstablishment {
    master_secret: Vec<u8>,
    cipher_suite: CipherSuiteId,
    client_random: HandshakeRandom,
    server_random: HandshakeRandom,
    peer_identity: Option<PeerIdentity>,
    /// `true` when these inputs came from the abbreviated handshake rather
    /// than a fresh key exchange, so `establish_session` does not re-insert
    /// an entry the resumption cache already holds.
    resumed: bool,
}

/// Mutable per-peer state, owned exclusively by this connection's serial
/// executor task. `Connection` itself only ever reaches it through the
/// task's inbox, so nothing outside the executor can observe a half
/// mutated handshake/session pair.
struct ConnectionState {
    peer_addr: SocketAddr,
    session: Option<Session>,
    handshaker: Option<Handshaker>,
    socket: Arc<dyn UdpSocket>,
    config: Arc<Config>,
    last_flight: Vec<FlightItem>,
    /// Monotonic write sequence number for epoch 0 (handshake + CCS)
    /// records, since no `Session` exists yet to hand one out.
    epoch0_sequence: u64,
    pending_sends: Vec<(Vec<u8>, mpsc::Sender<Result<()>>)>,
    server_hello: Option<ServerHello>,
    server_key_exchange: Option<ServerKeyExchange>,
    certificate: Option<WireCertificate>,
    pending_establishment: Option<PendingEstablishment>,
    /// Records whose epoch is ahead of what can currently be decrypted —
    /// typically application data that outran the peer's own
    /// ChangeCipherSpec/Finished on the wire. Replayed once the local epoch
    /// catches up, never dropped (spec.md §3).
    deferred_records: VecDeque<Vec<u8>>,
    /// Lets a connection remove itself from the store it was admitted into
    /// once the peer sends CLOSE_NOTIFY or a fatal alert.
    store: Option<Arc<Mutex<ConnectionStore>>>,
}

/// A single peer's connection: the channel into its serial executor plus
/// the bookkeeping the connection store needs (idleness, staleness)
/// without taking the executor's lock on every sweep.
pub struct Connection {
    pub peer_addr: SocketAddr,
    sender: mpsc::Sender<ConnTask>,
    last_activity_unix_millis: AtomicI64,
    established: AtomicBool,
}

impl Connection {
    pub fn spawn(
        peer_addr: SocketAddr,
        handshaker: Handshaker,
        socket: Arc<dyn UdpSocket>,
        config: Arc<Config>,
        store: Option<Arc<Mutex<ConnectionStore>>>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(128);
        let connection = Arc::new(Connection {
            peer_addr,
            sender: tx,
            last_activity_unix_millis: AtomicI64::new(monotonic_millis()),
            established: AtomicBool::new(false),
        });
        let state = ConnectionState {
            peer_addr,
            session: None,
            handshaker: Some(handshaker),
            socket,
            config,
            last_flight: vec![],
            epoch0_sequence: 0,
            pending_sends: vec![],
            server_hello: None,
            server_key_exchange: None,
            certificate: None,
            pending_establishment: None,
            deferred_records: VecDeque::new(),
            store,
        };
        let handle = tokio::spawn(run_serial_executor(state, rx, connection.clone()));
        (connection, handle)
    }

    pub async fn close(&self) {
        let _ = self.submit(ConnTask::Close).await;
    }

    pub async fn submit(&self, task: ConnTask) -> Result<()> {
        self.touch();
        self.sender
            .send(task)
            .await
            .map_err(|_| Error::InternalError("connection executor has shut down".to_owned()))
    }

    fn touch(&self) {
        self.last_activity_unix_millis.store(monotonic_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since this connection last did anything; used by the
    /// store's LRU eviction sweep (spec.md §4.F staleness threshold).
    pub fn idle_millis(&self) -> i64 {
        (monotonic_millis() - self.last_activity_unix_millis.load(Ordering::Relaxed)).max(0)
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Relaxed)
    }

    fn mark_established(&self) {
        self.established.store(true, Ordering::Relaxed);
    }
}

// A process-local monotonic clock in milliseconds, standing in for
// `Instant` arithmetic across an `AtomicI64`, which has no native
// `Instant` storage. Anchored once at first use so ordering between
// connections is all that ever matters, not the absolute value.
fn monotonic_millis() -> i64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as i64
}

async fn run_serial_executor(mut state: ConnectionState, mut rx: mpsc::Receiver<ConnTask>, connection: Arc<Connection>) {
    loop {
        let retransmit_sleep = state.config.timer.sleep(RETRANSMIT_POLL_INTERVAL);
        tokio::select! {
            task = rx.recv() => {
                match task {
                    Some(ConnTask::Inbound(datagram)) => {
                        match handle_inbound(&mut state, &connection, &datagram).await {
                            Ok(()) => {}
                            Err(err @ Error::PeerClosed(_)) => {
                                debug!("{} closed the connection: {}", state.peer_addr, err);
                                terminate(&mut state, err).await;
                                break;
                            }
                            Err(Error::HandshakeFailure(description)) => {
                                let _ = send_alert(&mut state, AlertLevel::Fatal, description).await;
                                terminate(&mut state, Error::HandshakeFailure(description)).await;
                                break;
                            }
                            Err(e) => {
                                debug!("discarding inbound datagram from {}: {}", state.peer_addr, e);
                            }
                        }
                    }
                    Some(ConnTask::SendApplicationData { plaintext, respond }) => {
                        handle_send_application_data(&mut state, plaintext, respond).await;
                    }
                    Some(ConnTask::Close) => {
                        trace!("closing connection executor for {}", state.peer_addr);
                        let _ = send_alert(&mut state, AlertLevel::Warning, AlertDescription::CloseNotify).await;
                        break;
                    }
                    None => {
                        trace!("closing connection executor for {}", state.peer_addr);
                        break;
                    }
                }
            }
            _ = retransmit_sleep => {
                poll_retransmit(&mut state).await;
            }
        }
    }
}

async fn poll_retransmit(state: &mut ConnectionState) {
    let Some(handshaker) = state.handshaker.as_mut() else { return };
    if handshaker.is_terminal() || !handshaker.should_retransmit(state.config.clock.now()) {
        return;
    }
    if !handshaker.record_retransmit() {
        warn!("handshake with {} exhausted retransmissions", state.peer_addr);
        handshaker.fail();
        fail_pending_sends(state, Error::HandshakeTimeout).await;
        return;
    }
    let handshaker = state.handshaker.as_mut().expect("checked above");
    handshaker.record_flight_sent(state.config.clock.now());
    if let Err(e) = resend_last_flight(state).await {
        warn!("retransmit to {} failed: {}", state.peer_addr, e);
    }
}

/// Resends the current flight with the same handshake message sequence
/// numbers but fresh epoch-0 record sequence numbers (RFC 6347 §4.2.4), for
/// both a timer-driven retransmit and a duplicate ClientHello/flight message
/// from the peer.
async fn resend_last_flight(state: &mut ConnectionState) -> Result<()> {
    let items = state.last_flight.clone();
    send_flight(state, &items).await
}

async fn fail_pending_sends(state: &mut ConnectionState, err: Error) {
    for (_, respond) in state.pending_sends.drain(..) {
        let _ = respond.send(Err(err.clone())).await;
    }
}

/// Tears down a connection the peer itself ended, or that failed fatally:
/// fails anything still waiting on a send and, if this connection was
/// admitted into a store, removes it so a fresh ClientHello from the same
/// address starts clean.
async fn terminate(state: &mut ConnectionState, err: Error) {
    fail_pending_sends(state, err).await;
    if let Some(store) = state.store.clone() {
        store.lock().await.remove(&state.peer_addr);
    }
}

fn next_epoch0_sequence(state: &mut ConnectionState) -> Result<u64> {
    let seq = state.epoch0_sequence;
    if seq > record::MAX_SEQUENCE_NUMBER {
        return Err(Error::SeqExhausted);
    }
    state.epoch0_sequence += 1;
    Ok(seq)
}

/// Sends an `Alert` record. Alerts are never encrypted in this
/// implementation even once a session exists — `handle_inbound` already
/// reads them straight off the wire without going through
/// `Session::decrypt_inbound`, so sending them in plaintext is the
/// symmetric choice rather than a protocol violation.
async fn send_alert(state: &mut ConnectionState, level: AlertLevel, description: AlertDescription) -> Result<()> {
    let has_session = state.session.is_some();
    let (epoch, sequence_number) = if has_session {
        let session = state.session.as_ref().expect("checked above");
        (session.epoch(), session.reserve_sequence_number()?)
    } else {
        (0, next_epoch0_sequence(state)?)
    };
    let record = Record {
        header: RecordLayerHeader {
            content_type: ContentType::Alert,
            protocol_version: PROTOCOL_VERSION_1_2,
            epoch,
            sequence_number,
            content_len: 0,
        },
        content: Content::Alert(Alert { level, description }),
    };
    let mut buf = vec![];
    record.marshal(&mut buf)?;
    state.socket.send_to(&buf, state.peer_addr).await?;
    Ok(())
}

async fn flush_pending_sends(state: &mut ConnectionState) {
    let pending = std::mem::take(&mut state.pending_sends);
    for (plaintext, respond) in pending {
        let result = send_now(state, &plaintext).await;
        let _ = respond.send(result).await;
    }
}

async fn send_now(state: &ConnectionState, plaintext: &[u8]) -> Result<()> {
    let session = state
        .session
        .as_ref()
        .ok_or_else(|| Error::InternalError("send attempted before handshake completed".to_owned()))?;
    let datagram = encode_outbound_application_data(session, PROTOCOL_VERSION_1_2, plaintext)?;
    state.socket.send_to(&datagram, state.peer_addr).await?;
    Ok(())
}

async fn handle_send_application_data(state: &mut ConnectionState, plaintext: Vec<u8>, respond: mpsc::Sender<Result<()>>) {
    if state.session.is_some() {
        let result = send_now(state, &plaintext).await;
        let _ = respond.send(result).await;
        return;
    }

    let role = match state.handshaker.as_ref() {
        Some(h) => h.role,
        None => {
            let _ = respond
                .send(Err(Error::InternalError("connection has no active handshake or session".to_owned())))
                .await;
            return;
        }
    };
    if role != Role::Client {
        let _ = respond
            .send(Err(Error::InternalError(
                "server connections cannot initiate sends before a session exists".to_owned(),
            )))
            .await;
        return;
    }

    let already_started = state.handshaker.as_ref().map(|h| h.state != HandshakeState::Initial).unwrap_or(false);
    state.pending_sends.push((plaintext, respond));
    if already_started {
        return;
    }

    let handshaker = state.handshaker.as_mut().expect("checked above");
    match handshaker.client_build_client_hello() {
        Ok(hello) => {
            handshaker.record_flight_sent(state.config.clock.now());
            let items = vec![FlightItem::Handshake(hello)];
            if let Err(e) = send_flight(state, &items).await {
                warn!("failed to send ClientHello to {}: {}", state.peer_addr, e);
            }
            state.last_flight = items;
        }
        Err(e) => fail_pending_sends(state, e).await,
    }
}

fn handle_inbound<'a>(
    state: &'a mut ConnectionState,
    connection: &'a Arc<Connection>,
    datagram: &'a [u8],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut cursor = datagram;
        while !cursor.is_empty() {
            let (header, body) = record::unmarshal_header_and_body(&mut cursor)?;
            match header.content_type {
                ContentType::Handshake => handle_handshake_record(state, connection, &body).await?,
                ContentType::ChangeCipherSpec => {
                    ChangeCipherSpec::unmarshal(&mut &body[..])?;
                    trace!("recv [change_cipher_spec] from {}", state.peer_addr);
                    if let Some(session) = state.session.as_mut() {
                        session.advance_remote_epoch();
                    }
                    replay_deferred_records(state, connection).await?;
                }
                ContentType::Alert => {
                    let alert = Alert::unmarshal(&mut &body[..])?;
                    debug!("recv [alert:{:?}] from {}", alert.description, state.peer_addr);
                    if alert.level == AlertLevel::Fatal {
                        return Err(Error::PeerClosed(format!("{:?}", alert.description)));
                    }
                    if alert.level == AlertLevel::Warning && alert.description == AlertDescription::CloseNotify {
                        return Err(Error::PeerClosed("close_notify".to_owned()));
                    }
                }
                ContentType::ApplicationData => {
                    let data = crate::wire::application_data::ApplicationData::unmarshal(&mut &body[..])?;
                    let deferrable = match state.session.as_ref() {
                        None => true,
                        Some(session) => header.epoch > session.epoch(),
                    };
                    if deferrable {
                        let mut raw = vec![];
                        header.marshal(&mut raw)?;
                        raw.extend_from_slice(&body);
                        state.deferred_records.push_back(raw);
                        trace!("deferred application data at epoch {} from {}", header.epoch, state.peer_addr);
                        continue;
                    }
                    let session = state
                        .session
                        .as_mut()
                        .expect("deferrable already ruled out the None case");
                    if !session.check_replay(header.sequence_number) {
                        debug!("replay dropped seq {} from {}", header.sequence_number, state.peer_addr);
                        return Err(Error::ReplayDropped);
                    }
                    let plaintext = session.decrypt_inbound(
                        header.epoch,
                        header.sequence_number,
                        ContentType::ApplicationData,
                        header.protocol_version,
                        &data.data,
                    )?;
                    session.accept_replay(header.sequence_number);
                    trace!("recv [application_data:{}b] from {}", plaintext.len(), state.peer_addr);
                }
                ContentType::Invalid => {
                    return Err(Error::DecodeError { offset: 0, reason: "invalid content type".to_owned() })
                }
            }
        }
        Ok(())
    })
}

/// Replays records whose epoch outran what could be decrypted when they
/// first arrived, now that the local epoch has caught up (a ChangeCipherSpec
/// was received, or the session just finished establishing).
async fn replay_deferred_records(state: &mut ConnectionState, connection: &Arc<Connection>) -> Result<()> {
    let pending: Vec<Vec<u8>> = state.deferred_records.drain(..).collect();
    for record_bytes in pending {
        handle_inbound(state, connection, &record_bytes).await?;
    }
    Ok(())
}

async fn handle_handshake_record(state: &mut ConnectionState, connection: &Arc<Connection>, body: &[u8]) -> Result<()> {
    let header = HandshakeHeader::unmarshal(&mut &body[..])?;
    let fragment = &body[HANDSHAKE_HEADER_LENGTH..];

    // RFC 6347 §4.2.4: a retransmitted flight carries message sequence
    // numbers we've already accepted. Answer with our own current flight
    // rather than reprocessing — most importantly, never re-run
    // `server_handle_client_hello` on a duplicate ClientHello, which would
    // mint a fresh server_random/session_id mid-handshake.
    if let Some(handshaker) = state.handshaker.as_ref() {
        if !handshaker.is_terminal() && header.message_seq < handshaker.next_receive_seq() {
            debug!("retransmitted handshake message {} from {}, resending last flight", header.message_seq, state.peer_addr);
            return resend_last_flight(state).await;
        }
    }

    if state.handshaker.is_none() {
        // RFC 6347 §4.2.8: a fresh ClientHello starts a new handshake
        // alongside the still-live session rather than being dropped;
        // anything else post-establishment is a renegotiation attempt we
        // refuse with a warning alert.
        if header.handshake_type == HandshakeType::ClientHello {
            state.handshaker = Some(Handshaker::new(
                crate::config::HandshakeConfig { role: Role::Server, ..state.config.handshake.clone() },
                state.config.credentials.clone(),
            ));
        } else {
            debug!("refusing renegotiation attempt from {}", state.peer_addr);
            return send_alert(state, AlertLevel::Warning, AlertDescription::NoRenegotiation).await;
        }
    }

    let reassembled = match state.handshaker.as_mut() {
        Some(handshaker) if !handshaker.is_terminal() => handshaker.receive_fragment(header, fragment),
        Some(_) => {
            debug!("handshake message after handshake completed from {}", state.peer_addr);
            None
        }
        None => unreachable!("handshaker is always Some at this point"),
    };
    let Some((header, full_body)) = reassembled else { return Ok(()) };

    match header.handshake_type {
        HandshakeType::ClientHello => handle_client_hello(state, header, full_body).await,
        HandshakeType::HelloVerifyRequest => handle_hello_verify_request(state, full_body).await,
        HandshakeType::ServerHello | HandshakeType::Certificate | HandshakeType::ServerKeyExchange | HandshakeType::ServerHelloDone => {
            handle_server_flight_message(state, header, full_body).await
        }
        HandshakeType::ClientKeyExchange => handle_client_key_exchange(state, header, full_body).await,
        HandshakeType::Finished => handle_finished(state, connection, header, full_body).await,
        other => {
            debug!("unexpected handshake message type {:?} from {}", other, state.peer_addr);
            Ok(())
        }
    }
}

async fn handle_client_hello(state: &mut ConnectionState, header: HandshakeHeader, body: Vec<u8>) -> Result<()> {
    let client_hello = ClientHello::unmarshal(&mut &body[..])?;
    let cookie_secret = state.config.cookie_secret.clone();
    let peer_addr_bytes = state.peer_addr.to_string().into_bytes();
    let resumption = state.config.resumption.clone();
    let handshaker = state.handshaker.as_mut().expect("checked by caller");

    let out = handshaker.server_handle_client_hello(header, &body, client_hello, &cookie_secret, &peer_addr_bytes, &resumption)?;
    if !out.is_empty() {
        handshaker.record_flight_sent(state.config.clock.now());
        let items = vec![FlightItem::Handshake(out)];
        send_flight(state, &items).await?;
        state.last_flight = items;
        return Ok(());
    }

    if handshaker.is_resuming() {
        return complete_resumed_server_flight(state).await;
    }

    let messages = handshaker.server_build_flight4(None)?;
    handshaker.record_flight_sent(state.config.clock.now());
    let items: Vec<FlightItem> = messages.into_iter().map(FlightItem::Handshake).collect();
    send_flight(state, &items).await?;
    state.last_flight = items;
    Ok(())
}

/// Server-side abbreviated handshake (RFC 5246 §7.3): ServerHello,
/// ChangeCipherSpec and Finished go out together, without waiting for a
/// ClientKeyExchange that never comes. `handle_finished` still runs when the
/// client's own Finished arrives, but skips resending CCS+Finished since
/// this function already did.
async fn complete_resumed_server_flight(state: &mut ConnectionState) -> Result<()> {
    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    let hello = handshaker.server_build_resumed_flight()?;
    let result = handshaker
        .take_resumed_establishment()
        .ok_or_else(|| Error::InternalError("resumed flight built without resumed establishment".to_owned()))?;
    let finished = handshaker.build_finished(&result.master_secret)?;

    handshaker.record_flight_sent(state.config.clock.now());
    handshaker.mark_early_finished_sent();

    let items = vec![FlightItem::Handshake(hello), FlightItem::ChangeCipherSpec, FlightItem::Handshake(finished)];
    send_flight(state, &items).await?;
    state.last_flight = items;

    state.pending_establishment = Some(PendingEstablishment {
        master_secret: result.master_secret,
        cipher_suite: result.cipher_suite,
        client_random: result.client_random,
        server_random: result.server_random,
        peer_identity: result.peer_identity,
        resumed: true,
    });
    Ok(())
}

async fn handle_hello_verify_request(state: &mut ConnectionState, body: Vec<u8>) -> Result<()> {
    let hvr = HelloVerifyRequest::unmarshal(&mut &body[..])?;
    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    let hello = handshaker.client_handle_hello_verify_request(hvr)?;
    handshaker.record_flight_sent(state.config.clock.now());
    let items = vec![FlightItem::Handshake(hello)];
    send_flight(state, &items).await?;
    state.last_flight = items;
    Ok(())
}

async fn handle_server_flight_message(state: &mut ConnectionState, header: HandshakeHeader, body: Vec<u8>) -> Result<()> {
    match header.handshake_type {
        HandshakeType::ServerHello => {
            let server_hello = ServerHello::unmarshal(&mut &body[..])?;
            let handshaker = state.handshaker.as_mut().expect("checked by caller");
            if handshaker.client_accept_resumed_server_hello(&server_hello) {
                let (master_secret, cipher_suite, client_random, server_random, peer_identity) =
                    handshaker.client_handle_resumed_server_hello(&header, server_hello)?;
                return complete_resumed_client_flight(
                    state,
                    master_secret,
                    cipher_suite,
                    client_random,
                    server_random,
                    peer_identity,
                )
                .await;
            }
            handshaker.accept_incoming(&header, HandshakeMessage::ServerHello(server_hello.clone()), false)?;
            state.server_hello = Some(server_hello);
            Ok(())
        }
        HandshakeType::Certificate => {
            let certificate = WireCertificate::unmarshal(&mut &body[..])?;
            let handshaker = state.handshaker.as_mut().expect("checked by caller");
            handshaker.accept_incoming(&header, HandshakeMessage::Certificate(certificate.clone()), false)?;
            state.certificate = Some(certificate);
            Ok(())
        }
        HandshakeType::ServerKeyExchange => {
            let cipher_suite = state
                .server_hello
                .as_ref()
                .ok_or_else(|| Error::HandshakeFailure(crate::wire::alert::AlertDescription::UnexpectedMessage))?
                .cipher_suite;
            let ske = if cipher_suite.is_ecdhe() {
                ServerKeyExchange::unmarshal_ecdhe(&mut &body[..], cipher_suite.is_ecdsa())?
            } else {
                ServerKeyExchange::unmarshal_psk(&mut &body[..])?
            };
            let handshaker = state.handshaker.as_mut().expect("checked by caller");
            handshaker.accept_incoming(&header, HandshakeMessage::ServerKeyExchange(ske.clone()), false)?;
            state.server_key_exchange = Some(ske);
            Ok(())
        }
        HandshakeType::ServerHelloDone => {
            let done = ServerHelloDone::unmarshal(&mut &body[..])?;
            let handshaker = state.handshaker.as_mut().expect("checked by caller");
            handshaker.accept_incoming(&header, HandshakeMessage::ServerHelloDone(done), false)?;
            complete_client_flight(state).await
        }
        _ => unreachable!("handle_server_flight_message only routes server flight 4 messages"),
    }
}

/// Client-side: once ServerHelloDone arrives, build and send flight 5
/// (ClientKeyExchange, ChangeCipherSpec, Finished) and wait for the server's
/// own Finished before the session is usable.
async fn complete_client_flight(state: &mut ConnectionState) -> Result<()> {
    let server_hello = state
        .server_hello
        .take()
        .ok_or_else(|| Error::HandshakeFailure(crate::wire::alert::AlertDescription::UnexpectedMessage))?;
    let server_key_exchange = state.server_key_exchange.take();
    let certificate = state.certificate.take();
    let cipher_suite = server_hello.cipher_suite;
    let server_random = server_hello.random;

    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    let client_random = handshaker.local_random();
    let (flight_messages, master_secret, peer_identity) = handshaker
        .client_handle_server_flight(server_hello, server_key_exchange, certificate)
        .await?;

    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    let finished = handshaker.build_finished(&master_secret)?;
    let mut items: Vec<FlightItem> = flight_messages.into_iter().map(FlightItem::Handshake).collect();
    items.push(FlightItem::ChangeCipherSpec);
    items.push(FlightItem::Handshake(finished));

    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    handshaker.record_flight_sent(state.config.clock.now());
    send_flight(state, &items).await?;
    state.last_flight = items;
    state.pending_establishment = Some(PendingEstablishment {
        master_secret,
        cipher_suite,
        client_random,
        server_random,
        peer_identity,
        resumed: false,
    });
    Ok(())
}

/// Client-side abbreviated handshake: the server already sent its
/// ChangeCipherSpec+Finished along with the resumed ServerHello, so this
/// side answers with its own CCS+Finished immediately rather than waiting
/// for a Certificate/KeyExchange flight that was never sent.
async fn complete_resumed_client_flight(
    state: &mut ConnectionState,
    master_secret: Vec<u8>,
    cipher_suite: CipherSuiteId,
    client_random: HandshakeRandom,
    server_random: HandshakeRandom,
    peer_identity: Option<PeerIdentity>,
) -> Result<()> {
    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    let finished = handshaker.build_finished(&master_secret)?;
    let items = vec![FlightItem::ChangeCipherSpec, FlightItem::Handshake(finished)];

    handshaker.record_flight_sent(state.config.clock.now());
    send_flight(state, &items).await?;
    state.last_flight = items;

    state.pending_establishment = Some(PendingEstablishment {
        master_secret,
        cipher_suite,
        client_random,
        server_random,
        peer_identity,
        resumed: true,
    });
    Ok(())
}

async fn handle_client_key_exchange(state: &mut ConnectionState, header: HandshakeHeader, body: Vec<u8>) -> Result<()> {
    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    let cipher_suite = handshaker
        .pending_cipher_suite()
        .ok_or_else(|| Error::HandshakeFailure(crate::wire::alert::AlertDescription::UnexpectedMessage))?;
    let cke = if cipher_suite.is_ecdhe() {
        ClientKeyExchange::unmarshal_ecdhe(&mut &body[..])?
    } else {
        ClientKeyExchange::unmarshal_psk(&mut &body[..])?
    };
    handshaker.accept_incoming(&header, HandshakeMessage::ClientKeyExchange(cke.clone()), true)?;

    let result = handshaker.server_handle_client_key_exchange(cke).await?;
    state.pending_establishment = Some(PendingEstablishment {
        master_secret: result.master_secret,
        cipher_suite: result.cipher_suite,
        client_random: result.client_random,
        server_random: result.server_random,
        peer_identity: result.peer_identity,
        resumed: false,
    });
    Ok(())
}

async fn handle_finished(state: &mut ConnectionState, connection: &Arc<Connection>, header: HandshakeHeader, body: Vec<u8>) -> Result<()> {
    let finished = Finished::unmarshal(&mut &body[..])?;
    let pending = state
        .pending_establishment
        .as_ref()
        .ok_or_else(|| Error::InternalError("Finished received before keys were derived".to_owned()))?;
    let master_secret = pending.master_secret.clone();

    let handshaker = state.handshaker.as_mut().expect("checked by caller");
    let peer_is_client = handshaker.role == Role::Server;
    handshaker.verify_peer_finished(&master_secret, peer_is_client, &finished.verify_data)?;
    handshaker.accept_incoming(&header, HandshakeMessage::Finished(finished), peer_is_client)?;

    if handshaker.role == Role::Server && !handshaker.early_finished_sent() {
        let our_finished = handshaker.build_finished(&master_secret)?;
        let items = vec![FlightItem::ChangeCipherSpec, FlightItem::Handshake(our_finished)];
        send_flight(state, &items).await?;
        state.last_flight = items;
    }

    establish_session(state, connection).await
}

async fn establish_session(state: &mut ConnectionState, connection: &Arc<Connection>) -> Result<()> {
    let pending = state
        .pending_establishment
        .take()
        .ok_or_else(|| Error::InternalError("establish_session called with no pending key material".to_owned()))?;
    let handshaker = state.handshaker.as_ref().expect("checked by caller");
    let role = handshaker.role;
    let session_id = handshaker.session_id().to_vec();

    let (client_keys, server_keys) = derive_keys(
        pending.cipher_suite,
        &pending.master_secret,
        &pending.server_random.to_bytes(),
        &pending.client_random.to_bytes(),
    );
    let (local_keys, remote_keys) = match role {
        Role::Client => (client_keys, server_keys),
        Role::Server => (server_keys, client_keys),
    };

    if !pending.resumed && !session_id.is_empty() {
        let resumable = ResumableSession {
            cipher_suite: pending.cipher_suite,
            master_secret: pending.master_secret.clone(),
            peer_identity: pending.peer_identity.clone(),
        };
        if let Ok(mut cache) = state.config.resumption.lock() {
            cache.insert(session_id, resumable);
        }
    }

    let session = Session::new(
        pending.cipher_suite,
        1,
        local_keys,
        remote_keys,
        pending.master_secret,
        state.config.replay_protection_window,
        pending.peer_identity,
    );

    if let Some(handshaker) = state.handshaker.as_mut() {
        handshaker.finish();
    }
    state.handshaker = None;
    state.session = Some(session);
    connection.mark_established();
    flush_pending_sends(state).await;
    replay_deferred_records(state, connection).await?;
    Ok(())
}

/// Splits one already-marshaled handshake message (header + full body, as
/// `Handshaker::push_outgoing`/`build_finished` produce it) into RFC 6347
/// §4.2.3 fragment boundaries, without assigning record sequence numbers —
/// a pure function shared by the stateful per-connection path (which needs
/// real, monotonic epoch-0 sequence numbers) and the pre-`Connection`
/// HelloVerifyRequest path (which has no connection state to draw one
/// from).
fn split_handshake_message(raw: &[u8], max_fragment: usize) -> Result<Vec<(HandshakeHeader, u32, Vec<u8>)>> {
    let header = HandshakeHeader::unmarshal(&mut &raw[..])?;
    let body = &raw[HANDSHAKE_HEADER_LENGTH..];
    let capacity = max_fragment
        .saturating_sub(record::RECORD_LAYER_HEADER_SIZE + HANDSHAKE_HEADER_LENGTH)
        .max(1);

    let mut fragments = vec![];
    let mut offset = 0usize;
    loop {
        let end = (offset + capacity).min(body.len());
        fragments.push((header, offset as u32, body[offset..end].to_vec()));
        offset = end;
        if offset >= body.len() {
            break;
        }
    }
    Ok(fragments)
}

/// Fragments `raw` and wraps each fragment in a record with a fresh,
/// monotonic epoch-0 sequence number (RFC 6347 §4.2.4's "record sequence
/// numbers ... may differ across retransmissions").
fn fragment_handshake_message(state: &mut ConnectionState, raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    let max_fragment = state.config.maximum_fragment_length();
    let fragments = split_handshake_message(raw, max_fragment)?;
    let mut records = vec![];
    for (header, offset, fragment) in fragments {
        let seq = next_epoch0_sequence(state)?;
        records.push(wrap_handshake_fragment(&header, offset, &fragment, seq)?);
    }
    Ok(records)
}

/// Fragments and wraps `message` entirely statelessly, always at sequence
/// number 0 — used only for the HelloVerifyRequest sent before any
/// `Connection` (and thus any sequence counter) exists for the peer, which
/// is inherently fine since RFC 6347 §4.2.1's cookie exchange carries no
/// handshake state of its own.
pub(crate) fn encode_stateless_handshake(message: HandshakeMessage, max_fragment: usize) -> Result<Vec<Vec<u8>>> {
    let handshake = crate::wire::handshake::Handshake::new(message);
    let mut raw = vec![];
    handshake.marshal(&mut raw)?;
    split_handshake_message(&raw, max_fragment)?
        .into_iter()
        .map(|(header, offset, fragment)| wrap_handshake_fragment(&header, offset, &fragment, 0))
        .collect()
}

fn wrap_handshake_fragment(header: &HandshakeHeader, fragment_offset: u32, fragment: &[u8], sequence_number: u64) -> Result<Vec<u8>> {
    let frag_header = HandshakeHeader { fragment_offset, fragment_length: fragment.len() as u32, ..*header };
    let mut handshake_bytes = vec![];
    frag_header.marshal(&mut handshake_bytes)?;
    handshake_bytes.extend_from_slice(fragment);

    let record_header = RecordLayerHeader {
        content_type: ContentType::Handshake,
        protocol_version: PROTOCOL_VERSION_1_2,
        epoch: 0,
        sequence_number,
        content_len: handshake_bytes.len() as u16,
    };
    let mut buf = vec![];
    record_header.marshal(&mut buf)?;
    buf.extend_from_slice(&handshake_bytes);
    Ok(buf)
}

/// Sends every item of a flight in order, assigning fresh epoch-0 record
/// sequence numbers on every call — including retransmits, since `items`
/// carries the flight's logical contents rather than already-framed bytes.
async fn send_flight(state: &mut ConnectionState, items: &[FlightItem]) -> Result<()> {
    let mut records = vec![];
    for item in items {
        match item {
            FlightItem::Handshake(raw) => records.extend(fragment_handshake_message(state, raw)?),
            FlightItem::ChangeCipherSpec => {
                let seq = next_epoch0_sequence(state)?;
                records.push(encode_change_cipher_spec(seq)?);
            }
        }
    }
    for record in &records {
        state.socket.send_to(record, state.peer_addr).await?;
    }
    Ok(())
}

fn encode_change_cipher_spec(sequence_number: u64) -> Result<Vec<u8>> {
    let mut record = Record::new(PROTOCOL_VERSION_1_2, 0, Content::ChangeCipherSpec(ChangeCipherSpec));
    record.header.sequence_number = sequence_number;
    let mut buf = vec![];
    record.marshal(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod fragmentation_test {
    use super::*;
    use crate::fragment::FragmentBuffer;
    use crate::wire::handshake::{Handshake, HandshakeType};

    fn raw_client_hello(body_len: usize) -> Vec<u8> {
        let hello = ClientHello {
            version: PROTOCOL_VERSION_1_2,
            random: HandshakeRandom::default(),
            session_id: vec![],
            cookie: vec![0u8; body_len],
            cipher_suites: vec![],
            extensions: vec![],
        };
        let mut handshake = Handshake::new(HandshakeMessage::ClientHello(hello));
        handshake.header.message_seq = 4;
        let mut raw = vec![];
        handshake.marshal(&mut raw).unwrap();
        raw
    }

    async fn test_state(socket: Arc<dyn UdpSocket>) -> ConnectionState {
        let config = Arc::new(Config::new(Arc::new(crate::credential::StaticCredentialStore::new())));
        ConnectionState {
            peer_addr: "127.0.0.1:9".parse().unwrap(),
            session: None,
            handshaker: None,
            socket,
            config,
            last_flight: vec![],
            epoch0_sequence: 0,
            pending_sends: vec![],
            server_hello: None,
            server_key_exchange: None,
            certificate: None,
            pending_establishment: None,
            deferred_records: VecDeque::new(),
            store: None,
        }
    }

    #[test]
    fn small_message_fits_in_one_record() {
        let raw = raw_client_hello(8);
        let fragments = split_handshake_message(&raw, 1200).unwrap();
        assert_eq!(fragments.len(), 1);
        let records: Vec<Vec<u8>> = fragments
            .into_iter()
            .map(|(header, offset, fragment)| wrap_handshake_fragment(&header, offset, &fragment, 0).unwrap())
            .collect();

        let (header, body) = record::unmarshal_header_and_body(&mut records[0].as_slice()).unwrap();
        assert_eq!(header.content_type, ContentType::Handshake);
        assert_eq!(header.epoch, 0);
        let hh = HandshakeHeader::unmarshal(&mut &body[..]).unwrap();
        assert_eq!(hh.fragment_offset, 0);
        assert_eq!(hh.fragment_length, hh.length);
    }

    #[test]
    fn oversized_message_splits_into_reassemblable_fragments() {
        let raw = raw_client_hello(300);
        let fragments = split_handshake_message(&raw, 64).unwrap();
        assert!(fragments.len() > 1);

        let mut buf = FragmentBuffer::new();
        let mut reassembled = None;
        for (header, offset, fragment) in &fragments {
            let record_bytes = wrap_handshake_fragment(header, *offset, fragment, 0).unwrap();
            let (_, body) = record::unmarshal_header_and_body(&mut record_bytes.as_slice()).unwrap();
            let hh = HandshakeHeader::unmarshal(&mut &body[..]).unwrap();
            assert_eq!(hh.handshake_type, HandshakeType::ClientHello);
            assert_eq!(hh.message_seq, 4);
            let wire_fragment = &body[HANDSHAKE_HEADER_LENGTH..];
            reassembled = buf.push(&hh, wire_fragment).or(reassembled);
        }

        let original_body = &raw[HANDSHAKE_HEADER_LENGTH..];
        assert_eq!(reassembled.unwrap(), original_body);
    }

    #[tokio::test]
    async fn fragments_of_one_message_get_monotonically_increasing_sequence_numbers() {
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut state = test_state(socket).await;
        let raw = raw_client_hello(300);
        let records = fragment_handshake_message(&mut state, &raw).unwrap();
        assert!(records.len() > 1);

        let seqs: Vec<u64> = records
            .iter()
            .map(|r| record::unmarshal_header_and_body(&mut r.as_slice()).unwrap().0.sequence_number)
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        assert_eq!(seqs.iter().collect::<std::collections::HashSet<_>>().len(), seqs.len());
    }

    #[tokio::test]
    async fn retransmitting_a_flight_reuses_message_seq_but_assigns_fresh_record_seq() {
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut state = test_state(socket).await;
        let raw = raw_client_hello(8);
        let items = vec![FlightItem::Handshake(raw)];

        send_flight(&mut state, &items).await.unwrap();
        let first_seq = state.epoch0_sequence;
        send_flight(&mut state, &items).await.unwrap();
        let second_seq = state.epoch0_sequence;
        assert!(second_seq > first_seq);
    }
}

#[cfg(test)]
mod protocol_test {
    use super::*;
    use crate::crypto::cipher::KeyMaterial;
    use crate::wire::cipher_suite::CipherSuiteId;

    fn established_state(socket: Arc<dyn UdpSocket>, peer_addr: SocketAddr) -> ConnectionState {
        let config = Arc::new(Config::new(Arc::new(crate::credential::StaticCredentialStore::new())));
        let keys = KeyMaterial { mac_key: vec![], write_key: vec![0u8; 16], write_iv: vec![0u8; 4] };
        let session = Session::new(CipherSuiteId::TlsPskWithAes128CcmEight, 1, keys.clone(), keys, vec![0u8; 48], 64, None);
        ConnectionState {
            peer_addr,
            session: Some(session),
            handshaker: None,
            socket,
            config,
            last_flight: vec![],
            epoch0_sequence: 0,
            pending_sends: vec![],
            server_hello: None,
            server_key_exchange: None,
            certificate: None,
            pending_establishment: None,
            deferred_records: VecDeque::new(),
            store: None,
        }
    }

    fn raw_hello_request() -> Vec<u8> {
        let header = HandshakeHeader {
            handshake_type: HandshakeType::HelloRequest,
            length: 0,
            message_seq: 0,
            fragment_offset: 0,
            fragment_length: 0,
        };
        let mut raw = vec![];
        header.marshal(&mut raw).unwrap();
        raw
    }

    /// A HelloRequest arriving after a session is already established is a
    /// renegotiation bid; this implementation doesn't renegotiate and must
    /// refuse it with a warning alert rather than silently ignoring it.
    #[tokio::test]
    async fn refuses_renegotiation_with_a_warning_alert() {
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();
        let mut state = established_state(socket, peer_addr);

        let (tx, _rx) = mpsc::channel(1);
        let connection = Arc::new(Connection {
            peer_addr,
            sender: tx,
            last_activity_unix_millis: AtomicI64::new(monotonic_millis()),
            established: AtomicBool::new(false),
        });

        handle_handshake_record(&mut state, &connection, &raw_hello_request()).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), peer_socket.recv_from(&mut buf))
            .await
            .expect("a NoRenegotiation alert should have been sent")
            .unwrap();
        let (header, body) = record::unmarshal_header_and_body(&mut &buf[..n]).unwrap();
        assert_eq!(header.content_type, ContentType::Alert);
        let alert = Alert::unmarshal(&mut &body[..]).unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.description, AlertDescription::NoRenegotiation);
    }
}

pub fn encode_outbound_application_data(session: &Session, version: ProtocolVersion, plaintext: &[u8]) -> Result<Vec<u8>> {
    let (seq, ciphertext) = session.encrypt_outbound(ContentType::ApplicationData, version, plaintext)?;
    let record = Record {
        header: RecordLayerHeader {
            content_type: ContentType::ApplicationData,
            protocol_version: version,
            epoch: session.epoch(),
            sequence_number: seq,
            content_len: ciphertext.len() as u16,
        },
        content: crate::wire::content::Content::ApplicationData(crate::wire::application_data::ApplicationData { data: ciphertext }),
    };
    let mut buf = vec![];
    record.marshal(&mut buf)?;
    Ok(buf)
}
