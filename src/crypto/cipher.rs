use crate::crypto::{aead, cbc};
use crate::error::Result;
use crate::wire::cipher_suite::CipherSuiteId;

/// Key material exported from the key block, split per direction per
/// RFC 5246 §6.3 ordering: client_write_MAC_key, server_write_MAC_key,
/// client_write_key, server_write_key, client_write_IV, server_write_IV.
#[derive(Clone)]
pub struct KeyMaterial {
    pub mac_key: Vec<u8>,
    pub write_key: Vec<u8>,
    pub write_iv: Vec<u8>,
}

pub struct CipherSuiteProfile {
    pub id: CipherSuiteId,
    pub mac_key_len: usize,
    pub enc_key_len: usize,
    pub fixed_iv_len: usize,
}

pub fn profile_for(id: CipherSuiteId) -> CipherSuiteProfile {
    match id {
        CipherSuiteId::TlsEcdhePskWithAes128CbcSha256 => CipherSuiteProfile {
            id,
            mac_key_len: cbc::MAC_KEY_LENGTH,
            enc_key_len: cbc::ENC_KEY_LENGTH,
            fixed_iv_len: 0,
        },
        CipherSuiteId::TlsPskWithAes128CcmEight | CipherSuiteId::TlsEcdheEcdsaWithAes128CcmEight => {
            CipherSuiteProfile {
                id,
                mac_key_len: 0,
                enc_key_len: 16,
                fixed_iv_len: 4,
            }
        }
        CipherSuiteId::TlsEcdheEcdsaWithAes128GcmSha256 => CipherSuiteProfile {
            id,
            mac_key_len: 0,
            enc_key_len: 16,
            fixed_iv_len: 4,
        },
        CipherSuiteId::Unsupported => CipherSuiteProfile {
            id,
            mac_key_len: 0,
            enc_key_len: 0,
            fixed_iv_len: 0,
        },
    }
}

impl CipherSuiteProfile {
    pub fn key_block_len(&self) -> usize {
        2 * self.mac_key_len + 2 * self.enc_key_len + 2 * self.fixed_iv_len
    }

    /// Splits a key_block into (client, server) `KeyMaterial` per the fixed
    /// RFC 5246 §6.3 ordering.
    pub fn split_key_block(&self, key_block: &[u8]) -> (KeyMaterial, KeyMaterial) {
        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = &key_block[offset..offset + len];
            offset += len;
            slice.to_vec()
        };

        let client_mac = take(self.mac_key_len);
        let server_mac = take(self.mac_key_len);
        let client_key = take(self.enc_key_len);
        let server_key = take(self.enc_key_len);
        let client_iv = take(self.fixed_iv_len);
        let server_iv = take(self.fixed_iv_len);

        (
            KeyMaterial { mac_key: client_mac, write_key: client_key, write_iv: client_iv },
            KeyMaterial { mac_key: server_mac, write_key: server_key, write_iv: server_iv },
        )
    }

    pub fn seal(&self, key: &KeyMaterial, explicit_nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.id {
            CipherSuiteId::TlsEcdhePskWithAes128CbcSha256 => {
                cbc::cbc_seal(&key.write_key, &key.mac_key, aad, plaintext)
            }
            CipherSuiteId::TlsEcdheEcdsaWithAes128GcmSha256 => {
                let mut nonce = [0u8; 8];
                nonce.copy_from_slice(&explicit_nonce[..8]);
                aead::gcm_seal(&key.write_key, &key.write_iv, &nonce, aad, plaintext)
            }
            CipherSuiteId::TlsPskWithAes128CcmEight | CipherSuiteId::TlsEcdheEcdsaWithAes128CcmEight => {
                let mut nonce = [0u8; 8];
                nonce.copy_from_slice(&explicit_nonce[..8]);
                aead::ccm_seal(&key.write_key, &key.write_iv, &nonce, aad, plaintext)
            }
            CipherSuiteId::Unsupported => Err(crate::error::Error::NoCipherSuiteOverlap),
        }
    }

    pub fn open(&self, key: &KeyMaterial, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.id {
            CipherSuiteId::TlsEcdhePskWithAes128CbcSha256 => {
                cbc::cbc_open(&key.write_key, &key.mac_key, aad, ciphertext)
            }
            CipherSuiteId::TlsEcdheEcdsaWithAes128GcmSha256 => {
                aead::gcm_open(&key.write_key, &key.write_iv, aad, ciphertext)
            }
            CipherSuiteId::TlsPskWithAes128CcmEight | CipherSuiteId::TlsEcdheEcdsaWithAes128CcmEight => {
                aead::ccm_open(&key.write_key, &key.write_iv, aad, ciphertext)
            }
            CipherSuiteId::Unsupported => Err(crate::error::Error::NoCipherSuiteOverlap),
        }
    }
}
