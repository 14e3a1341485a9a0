use elliptic_curve::sec1::ToEncodedPoint;
use p256::ecdh::EphemeralSecret as P256Secret;
use p384::ecdh::EphemeralSecret as P384Secret;
use rand_core::OsRng;
use x25519_dalek::{EphemeralSecret as X25519Secret, PublicKey as X25519Public};

use crate::error::{Error, Result};

// https://tools.ietf.org/html/rfc8422#section-5.1.1 (named curve registry, subset in scope)
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum NamedCurve {
    P256 = 23,
    P384 = 24,
    X25519 = 29,
    Unsupported,
}

impl From<u16> for NamedCurve {
    fn from(val: u16) -> Self {
        match val {
            23 => NamedCurve::P256,
            24 => NamedCurve::P384,
            29 => NamedCurve::X25519,
            _ => NamedCurve::Unsupported,
        }
    }
}

/// An ephemeral keypair plus its uncompressed point/key encoding for the wire.
/// The private halves are kept as opaque enum variants so a dropped `Keypair`
/// zeroizes via each underlying crate's own `Drop` impl (`x25519-dalek`,
/// `p256`, `p384` all zeroize ephemeral secrets on drop).
pub enum EphemeralPrivate {
    P256(P256Secret),
    P384(P384Secret),
    X25519(X25519Secret),
}

pub struct Keypair {
    pub curve: NamedCurve,
    pub private_key: EphemeralPrivate,
    pub public_key: Vec<u8>,
}

impl NamedCurve {
    pub fn generate_keypair(&self) -> Result<Keypair> {
        match self {
            NamedCurve::P256 => {
                let secret = P256Secret::random(&mut OsRng);
                let public_key = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                Ok(Keypair {
                    curve: *self,
                    private_key: EphemeralPrivate::P256(secret),
                    public_key,
                })
            }
            NamedCurve::P384 => {
                let secret = P384Secret::random(&mut OsRng);
                let public_key = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                Ok(Keypair {
                    curve: *self,
                    private_key: EphemeralPrivate::P384(secret),
                    public_key,
                })
            }
            NamedCurve::X25519 => {
                let secret = X25519Secret::random_from_rng(OsRng);
                let public_key = X25519Public::from(&secret).as_bytes().to_vec();
                Ok(Keypair {
                    curve: *self,
                    private_key: EphemeralPrivate::X25519(secret),
                    public_key,
                })
            }
            NamedCurve::Unsupported => Err(Error::UnsupportedCurve),
        }
    }
}

/// RFC 4492 §5.10 / RFC 5246 §8.1.2: the ECDH shared secret *is* the
/// pre-master secret, no further hashing.
pub fn ecdhe_derive(private: EphemeralPrivate, peer_point: &[u8]) -> Result<Vec<u8>> {
    match private {
        EphemeralPrivate::P256(secret) => {
            let peer_public = p256::PublicKey::from_sec1_bytes(peer_point)
                .map_err(|_| Error::InternalError("invalid peer P-256 point".to_owned()))?;
            let shared = secret.diffie_hellman(&peer_public);
            Ok(shared.raw_secret_bytes().to_vec())
        }
        EphemeralPrivate::P384(secret) => {
            let peer_public = p384::PublicKey::from_sec1_bytes(peer_point)
                .map_err(|_| Error::InternalError("invalid peer P-384 point".to_owned()))?;
            let shared = secret.diffie_hellman(&peer_public);
            Ok(shared.raw_secret_bytes().to_vec())
        }
        EphemeralPrivate::X25519(secret) => {
            if peer_point.len() != 32 {
                return Err(Error::InternalError("invalid peer X25519 point".to_owned()));
            }
            let mut buf = [0u8; 32];
            buf.copy_from_slice(peer_point);
            let peer_public = X25519Public::from(buf);
            Ok(secret.diffie_hellman(&peer_public).as_bytes().to_vec())
        }
    }
}

#[cfg(test)]
mod curve_test {
    use super::*;

    #[test]
    fn p256_ecdhe_agrees() {
        let a = NamedCurve::P256.generate_keypair().unwrap();
        let b = NamedCurve::P256.generate_keypair().unwrap();
        let a_pub = a.public_key.clone();
        let b_pub = b.public_key.clone();
        let shared_a = ecdhe_derive(a.private_key, &b_pub).unwrap();
        let shared_b = ecdhe_derive(b.private_key, &a_pub).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn x25519_ecdhe_agrees() {
        let a = NamedCurve::X25519.generate_keypair().unwrap();
        let b = NamedCurve::X25519.generate_keypair().unwrap();
        let a_pub = a.public_key.clone();
        let b_pub = b.public_key.clone();
        let shared_a = ecdhe_derive(a.private_key, &b_pub).unwrap();
        let shared_b = ecdhe_derive(b.private_key, &a_pub).unwrap();
        assert_eq!(shared_a, shared_b);
    }
}
