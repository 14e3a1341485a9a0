use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce as GcmNonce};
use ccm::aead::generic_array::GenericArray;
use ccm::{Ccm, consts::{U8, U12}};
use aes::Aes128;

use crate::error::Error;

const GCM_NONCE_LENGTH: usize = 12;
const GCM_EXPLICIT_NONCE_LENGTH: usize = 8;
const CCM_NONCE_LENGTH: usize = 12;
const CCM_EXPLICIT_NONCE_LENGTH: usize = 8;
pub const CCM_TAG_LENGTH: usize = 8;
pub const GCM_TAG_LENGTH: usize = 16;

type Aes128Ccm8 = Ccm<Aes128, U8, U12>;

/// Builds the 12-byte nonce as implicit_iv (4 bytes, fixed per direction) ||
/// explicit_nonce (8 bytes, sent on the wire per RFC 5288/7251).
fn build_nonce(implicit_iv: &[u8], explicit_nonce: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(implicit_iv);
    nonce[4..].copy_from_slice(explicit_nonce);
    nonce
}

pub fn gcm_seal(
    key: &[u8],
    implicit_iv: &[u8],
    explicit_nonce: &[u8; GCM_EXPLICIT_NONCE_LENGTH],
    aad: &[u8],
    plaintext: &[u8],
) -> crate::error::Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(GenericArray::from_slice(key));
    let nonce = build_nonce(implicit_iv, explicit_nonce);
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GcmNonce::from_slice(&nonce[..GCM_NONCE_LENGTH]), aad, &mut buffer)
        .map_err(|_| Error::InternalError("AES-GCM seal failed".to_owned()))?;

    let mut out = Vec::with_capacity(GCM_EXPLICIT_NONCE_LENGTH + buffer.len() + GCM_TAG_LENGTH);
    out.extend_from_slice(explicit_nonce);
    out.extend_from_slice(&buffer);
    out.extend_from_slice(&tag);
    Ok(out)
}

pub fn gcm_open(key: &[u8], implicit_iv: &[u8], aad: &[u8], ciphertext: &[u8]) -> crate::error::Result<Vec<u8>> {
    if ciphertext.len() < GCM_EXPLICIT_NONCE_LENGTH + GCM_TAG_LENGTH {
        return Err(Error::BadRecordMac);
    }
    let (explicit_nonce, rest) = ciphertext.split_at(GCM_EXPLICIT_NONCE_LENGTH);
    let (body, tag) = rest.split_at(rest.len() - GCM_TAG_LENGTH);

    let cipher = Aes128Gcm::new(GenericArray::from_slice(key));
    let nonce = build_nonce(implicit_iv, explicit_nonce);
    let mut buffer = body.to_vec();
    cipher
        .decrypt_in_place_detached(
            GcmNonce::from_slice(&nonce[..GCM_NONCE_LENGTH]),
            aad,
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| Error::BadRecordMac)?;
    Ok(buffer)
}

pub fn ccm_seal(
    key: &[u8],
    implicit_iv: &[u8],
    explicit_nonce: &[u8; CCM_EXPLICIT_NONCE_LENGTH],
    aad: &[u8],
    plaintext: &[u8],
) -> crate::error::Result<Vec<u8>> {
    use ccm::aead::{Aead, NewAead};
    let cipher = Aes128Ccm8::new(GenericArray::from_slice(key));
    let nonce = build_nonce(implicit_iv, explicit_nonce);
    let payload = ccm::aead::Payload { msg: plaintext, aad };
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&nonce[..CCM_NONCE_LENGTH]), payload)
        .map_err(|_| Error::InternalError("AES-CCM seal failed".to_owned()))?;

    let mut out = Vec::with_capacity(CCM_EXPLICIT_NONCE_LENGTH + sealed.len());
    out.extend_from_slice(explicit_nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn ccm_open(key: &[u8], implicit_iv: &[u8], aad: &[u8], ciphertext: &[u8]) -> crate::error::Result<Vec<u8>> {
    use ccm::aead::{Aead, NewAead};
    if ciphertext.len() < CCM_EXPLICIT_NONCE_LENGTH + CCM_TAG_LENGTH {
        return Err(Error::BadRecordMac);
    }
    let (explicit_nonce, sealed) = ciphertext.split_at(CCM_EXPLICIT_NONCE_LENGTH);
    let cipher = Aes128Ccm8::new(GenericArray::from_slice(key));
    let nonce = build_nonce(implicit_iv, explicit_nonce);
    let payload = ccm::aead::Payload { msg: sealed, aad };
    cipher
        .decrypt(GenericArray::from_slice(&nonce[..CCM_NONCE_LENGTH]), payload)
        .map_err(|_| Error::BadRecordMac)
}

#[cfg(test)]
mod aead_test {
    use super::*;

    #[test]
    fn gcm_round_trips() {
        let key = [1u8; 16];
        let iv = [2u8; 4];
        let nonce = [3u8; GCM_EXPLICIT_NONCE_LENGTH];
        let aad = [4u8; 13];
        let sealed = gcm_seal(&key, &iv, &nonce, &aad, b"hello world").unwrap();
        let opened = gcm_open(&key, &iv, &aad, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn gcm_rejects_tampered_aad() {
        let key = [1u8; 16];
        let iv = [2u8; 4];
        let nonce = [3u8; GCM_EXPLICIT_NONCE_LENGTH];
        let sealed = gcm_seal(&key, &iv, &nonce, &[4u8; 13], b"hello world").unwrap();
        assert!(gcm_open(&key, &iv, &[9u8; 13], &sealed).is_err());
    }

    #[test]
    fn ccm_round_trips() {
        let key = [1u8; 16];
        let iv = [2u8; 4];
        let nonce = [3u8; CCM_EXPLICIT_NONCE_LENGTH];
        let aad = [4u8; 13];
        let sealed = ccm_seal(&key, &iv, &nonce, &aad, b"hello world").unwrap();
        let opened = ccm_open(&key, &iv, &aad, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }
}
