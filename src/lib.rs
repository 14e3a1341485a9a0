//! A DTLS 1.2 (RFC 6347) connector over UDP for constrained peers.
//!
//! [`Connector`] owns the listening socket and dispatches inbound datagrams
//! to per-peer [`connection::Connection`] tasks, each running its own
//! handshake state machine and record layer. Credentials, clocks and timers
//! are injected through [`config::Config`] so tests can drive the handshake
//! without real wall-clock time or real key material.

pub mod clock;
pub mod config;
pub mod connection;
pub mod connector;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod fragment;
pub mod handshake_cache;
pub mod handshaker;
pub mod net;
pub mod session;
pub mod store;
pub mod wire;

pub use clock::{has_elapsed, MonotonicClock, SystemClock, TimerService, TokioTimerService};
pub use config::{Config, HandshakeConfig, Role};
pub use connector::Connector;
pub use credential::{CredentialStore, PeerIdentity, StaticCredentialStore};
pub use error::{Error, Result};
pub use net::UdpSocket;
pub use store::ConnectionStore;
