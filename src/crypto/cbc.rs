use aes::Aes128;
use block_modes::block_padding::Pkcs7;
use block_modes::{BlockMode, Cbc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type Aes128Cbc = Cbc<Aes128, Pkcs7>;
type HmacSha256 = Hmac<Sha256>;

pub const MAC_KEY_LENGTH: usize = 32;
pub const ENC_KEY_LENGTH: usize = 16;
pub const IV_LENGTH: usize = 16;
const MAC_LENGTH: usize = 32;

/// TLS 1.2 CBC MAC-then-encrypt, RFC 5246 §6.2.3.2: MAC covers seq_num(8) ||
/// type(1) || version(2) || length(2) || fragment, computed over the
/// plaintext before padding and IV prepending.
fn compute_mac(mac_key: &[u8], additional_data: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(additional_data);
    mac.update(&(plaintext.len() as u16).to_be_bytes());
    mac.update(plaintext);
    mac.finalize().into_bytes().to_vec()
}

pub fn cbc_seal(enc_key: &[u8], mac_key: &[u8], additional_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mac = compute_mac(mac_key, additional_data, plaintext);

    let mut to_encrypt = Vec::with_capacity(plaintext.len() + mac.len());
    to_encrypt.extend_from_slice(plaintext);
    to_encrypt.extend_from_slice(&mac);

    let mut iv = [0u8; IV_LENGTH];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes128Cbc::new_var(enc_key, &iv)
        .map_err(|_| Error::InternalError("invalid CBC key/iv length".to_owned()))?;
    let ciphertext = cipher.encrypt_vec(&to_encrypt);

    let mut out = Vec::with_capacity(IV_LENGTH + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn cbc_open(enc_key: &[u8], mac_key: &[u8], additional_data_with_len: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < IV_LENGTH + MAC_LENGTH {
        return Err(Error::BadRecordMac);
    }
    let (iv, body) = ciphertext.split_at(IV_LENGTH);

    let cipher = Aes128Cbc::new_var(enc_key, iv)
        .map_err(|_| Error::InternalError("invalid CBC key/iv length".to_owned()))?;
    let decrypted = cipher
        .decrypt_vec(&mut body.to_vec())
        .map_err(|_| Error::BadRecordMac)?;

    if decrypted.len() < MAC_LENGTH {
        return Err(Error::BadRecordMac);
    }
    let (plaintext, received_mac) = decrypted.split_at(decrypted.len() - MAC_LENGTH);
    let expected_mac = compute_mac(mac_key, additional_data_with_len, plaintext);

    // Constant-time comparison: a side channel here would let an attacker
    // distinguish "bad padding" from "bad MAC" across many probes.
    if expected_mac.ct_eq(received_mac).unwrap_u8() != 1 {
        return Err(Error::BadRecordMac);
    }
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod cbc_test {
    use super::*;

    #[test]
    fn round_trips() {
        let enc_key = [1u8; ENC_KEY_LENGTH];
        let mac_key = [2u8; MAC_KEY_LENGTH];
        let aad = [3u8; 11];
        let sealed = cbc_seal(&enc_key, &mac_key, &aad, b"hello world").unwrap();
        let opened = cbc_open(&enc_key, &mac_key, &aad, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let enc_key = [1u8; ENC_KEY_LENGTH];
        let mac_key = [2u8; MAC_KEY_LENGTH];
        let aad = [3u8; 11];
        let mut sealed = cbc_seal(&enc_key, &mac_key, &aad, b"hello world").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cbc_open(&enc_key, &mac_key, &aad, &sealed).is_err());
    }
}
