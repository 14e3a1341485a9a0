use std::sync::Arc;
use std::time::Duration;

use crate::clock::{MonotonicClock, SystemClock, TimerService, TokioTimerService};
use crate::credential::CredentialStore;
use crate::session::{new_resumption_cache, ResumptionCache};
use crate::wire::cipher_suite::{CipherSuiteId, DEFAULT_CIPHER_SUITES};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Role {
    Client,
    Server,
}

/// Handshake-scoped tuning, mirrored on the teacher's `config.rs`
/// (`config.mtu`, `config.flight_interval`) and extended with the
/// retransmission/timeout knobs spec.md §4.D and §4.E name explicitly.
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    pub role: Role,
    pub cipher_suites: Vec<CipherSuiteId>,
    pub retransmit_timeout: Duration,
    pub max_retransmissions: u32,
    pub cookie_secret_lifetime: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            role: Role::Client,
            cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
            retransmit_timeout: Duration::from_millis(500),
            max_retransmissions: 2,
            cookie_secret_lifetime: Duration::from_secs(300),
        }
    }
}

/// Connector-scoped tuning: the MTU that gates fragmentation, and the
/// connection-store policy spec.md §4.F requires (bounded capacity, LRU
/// staleness eviction).
#[derive(Clone)]
pub struct Config {
    pub handshake: HandshakeConfig,
    pub credentials: Arc<dyn CredentialStore>,
    pub maximum_transmission_unit: usize,
    pub connection_store_capacity: usize,
    pub connection_idle_threshold: Duration,
    pub replay_protection_window: u64,
    /// Keys the stateless HelloVerifyRequest cookie (RFC 6347 §4.2.1). Lives
    /// for the connector's whole lifetime rather than rotating on
    /// `cookie_secret_lifetime`; rotation is left as a follow-up since no
    /// peer observes the secret itself, only the cookies it produces.
    pub cookie_secret: Vec<u8>,
    pub clock: Arc<dyn MonotonicClock>,
    pub timer: Arc<dyn TimerService>,
    /// RFC 5246 §7.3 abbreviated-handshake cache, keyed by `session_id`.
    /// Shared by every connection off one connector so a session
    /// established against one peer address can be resumed later.
    pub resumption: ResumptionCache,
}

impl Config {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        use rand::RngCore;
        let mut cookie_secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut cookie_secret);

        Config {
            handshake: HandshakeConfig::default(),
            credentials,
            maximum_transmission_unit: 1280,
            connection_store_capacity: 4096,
            connection_idle_threshold: Duration::from_secs(60),
            replay_protection_window: 64,
            cookie_secret,
            clock: Arc::new(SystemClock),
            timer: Arc::new(TokioTimerService),
            resumption: new_resumption_cache(),
        }
    }

    pub fn maximum_fragment_length(&self) -> usize {
        // MTU minus the worst-case IPv6+UDP+record-header overhead, matching
        // the teacher's own conservative `get_maximum_fragment_length`
        // budget rather than assuming IPv4.
        self.maximum_transmission_unit.saturating_sub(48 + crate::wire::record::RECORD_LAYER_HEADER_SIZE)
    }
}
