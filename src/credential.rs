use async_trait::async_trait;

use crate::crypto::cert::Certificate;
use crate::error::Result;

/// A peer's authenticated identity, established at the end of a handshake.
/// https://tools.ietf.org/html/rfc4279 (PSK), rfc7250 (RPK), rfc5246 §7.4.2 (X.509)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerIdentity {
    Psk(String),
    RawPublicKey(Vec<u8>),
    X509Chain(Vec<Vec<u8>>),
}

/// Looking up a PSK by identity hint is, in practice, a database or HSM
/// round trip. `CredentialStore` is async so that lookup never blocks the
/// connector's retransmission timer (spec §5's explicit PSK-latency
/// requirement) — grounded on the teacher's `async_trait` use throughout
/// `flight/*.rs` for exactly this kind of collaborator interface.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn psk(&self, identity_hint: &[u8]) -> Result<Vec<u8>>;
    fn local_certificate(&self) -> Option<&Certificate>;
    fn local_psk_identity(&self) -> Option<&[u8]>;
}

pub struct StaticCredentialStore {
    psk: Option<(Vec<u8>, Vec<u8>)>,
    certificate: Option<Certificate>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        StaticCredentialStore { psk: None, certificate: None }
    }

    pub fn with_psk(mut self, identity: Vec<u8>, key: Vec<u8>) -> Self {
        self.psk = Some((identity, key));
        self
    }

    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }
}

impl Default for StaticCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn psk(&self, identity_hint: &[u8]) -> Result<Vec<u8>> {
        match &self.psk {
            Some((identity, key)) if identity == identity_hint => Ok(key.clone()),
            _ => Err(crate::error::Error::UnknownPskIdentity),
        }
    }

    fn local_certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    fn local_psk_identity(&self) -> Option<&[u8]> {
        self.psk.as_ref().map(|(identity, _)| identity.as_slice())
    }
}

#[cfg(test)]
mod credential_test {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn resolves_a_matching_psk_identity() {
        let store = StaticCredentialStore::new().with_psk(b"client".to_vec(), b"secret".to_vec());
        let key = store.psk(b"client").await.unwrap();
        assert_eq!(key, b"secret");
        assert_eq!(store.local_psk_identity(), Some(&b"client"[..]));
    }

    #[tokio::test]
    async fn rejects_an_unknown_psk_identity() {
        let store = StaticCredentialStore::new().with_psk(b"client".to_vec(), b"secret".to_vec());
        let err = store.psk(b"someone-else").await.unwrap_err();
        assert!(matches!(err, Error::UnknownPskIdentity));
    }

    #[tokio::test]
    async fn empty_store_has_no_psk_identity_and_rejects_everything() {
        let store = StaticCredentialStore::new();
        assert!(store.local_psk_identity().is_none());
        assert!(store.psk(b"anything").await.is_err());
    }
}
