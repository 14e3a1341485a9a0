use ring::signature::{self, EcdsaKeyPair, KeyPair as RingKeyPair};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// https://tools.ietf.org/html/rfc5246#section-7.4.1.4.1
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HashAlgorithm {
    Sha256 = 4,
    Unsupported,
}

impl From<u8> for HashAlgorithm {
    fn from(val: u8) -> Self {
        match val {
            4 => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Unsupported,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SignatureAlgorithm {
    Ecdsa = 3,
    Unsupported,
}

impl From<u8> for SignatureAlgorithm {
    fn from(val: u8) -> Self {
        match val {
            3 => SignatureAlgorithm::Ecdsa,
            _ => SignatureAlgorithm::Unsupported,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SignatureHashAlgorithm {
    pub hash: HashAlgorithm,
    pub signature: SignatureAlgorithm,
}

/// Hashes the data a ServerKeyExchange's signature covers
/// (client_random || server_random || server_params) and signs it with the
/// server's ECDSA private key, PKCS#8-encoded.
/// https://tools.ietf.org/html/rfc5246#section-7.4.3
pub fn sign_server_key_exchange(
    pkcs8_der: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    public_key_params: &[u8],
) -> Result<Vec<u8>> {
    let rng = ring::rand::SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(
        &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
        pkcs8_der,
    )
    .map_err(|_| Error::InternalError("invalid ECDSA signing key".to_owned()))?;

    let mut hasher = Sha256::new();
    hasher.update(client_random);
    hasher.update(server_random);
    hasher.update(public_key_params);
    let digest = hasher.finalize();

    let sig = key_pair
        .sign(&rng, digest.as_slice())
        .map_err(|_| Error::InternalError("ECDSA signing failed".to_owned()))?;
    Ok(sig.as_ref().to_vec())
}

pub fn verify_server_key_exchange(
    public_key: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    public_key_params: &[u8],
    sig: &[u8],
) -> Result<()> {
    let mut hasher = Sha256::new();
    hasher.update(client_random);
    hasher.update(server_random);
    hasher.update(public_key_params);
    let digest = hasher.finalize();

    let key = signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, public_key);
    key.verify(digest.as_slice(), sig)
        .map_err(|_| Error::HandshakeFailure(crate::wire::alert::AlertDescription::DecryptError))?;
    Ok(())
}

/// https://tools.ietf.org/html/rfc5246#section-7.4.8 (CertificateVerify)
pub fn sign_certificate_verify(pkcs8_der: &[u8], handshake_transcript_hash: &[u8]) -> Result<Vec<u8>> {
    let rng = ring::rand::SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(
        &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
        pkcs8_der,
    )
    .map_err(|_| Error::InternalError("invalid ECDSA signing key".to_owned()))?;
    let sig = key_pair
        .sign(&rng, handshake_transcript_hash)
        .map_err(|_| Error::InternalError("ECDSA signing failed".to_owned()))?;
    Ok(sig.as_ref().to_vec())
}

pub fn verify_certificate_verify(
    public_key: &[u8],
    handshake_transcript_hash: &[u8],
    sig: &[u8],
) -> Result<()> {
    let key = signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, public_key);
    key.verify(handshake_transcript_hash, sig)
        .map_err(|_| Error::HandshakeFailure(crate::wire::alert::AlertDescription::DecryptError))?;
    Ok(())
}

pub fn public_key_from_pkcs8(pkcs8_der: &[u8]) -> Result<Vec<u8>> {
    let key_pair = EcdsaKeyPair::from_pkcs8(
        &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
        pkcs8_der,
    )
    .map_err(|_| Error::InternalError("invalid ECDSA signing key".to_owned()))?;
    Ok(key_pair.public_key().as_ref().to_vec())
}

/// RFC 6347 §4.2.1 stateless cookie: HMAC-SHA256 over the peer address and
/// the client's proposed random/session parameters, keyed by a server secret
/// that rotates independently of any single connection's lifetime.
pub fn compute_cookie(secret: &[u8], peer_addr: &[u8], client_hello_bytes: &[u8]) -> Vec<u8> {
    use hmac::{Hmac, Mac};
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts variable-length keys");
    mac.update(peer_addr);
    mac.update(client_hello_bytes);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod signature_test {
    use super::*;

    #[test]
    fn cookie_is_deterministic_for_same_input() {
        let secret = b"server-secret";
        let addr = b"198.51.100.1:5684";
        let hello = b"client-hello-bytes";
        let a = compute_cookie(secret, addr, hello);
        let b = compute_cookie(secret, addr, hello);
        assert_eq!(a, b);
    }

    #[test]
    fn cookie_differs_for_different_peers() {
        let secret = b"server-secret";
        let hello = b"client-hello-bytes";
        let a = compute_cookie(secret, b"198.51.100.1:5684", hello);
        let b = compute_cookie(secret, b"198.51.100.2:5684", hello);
        assert_ne!(a, b);
    }
}
