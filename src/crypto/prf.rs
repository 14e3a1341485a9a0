use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

pub const MASTER_SECRET_LENGTH: usize = 48;
pub const VERIFY_DATA_LENGTH: usize = 12;

/// TLS 1.2 P_hash, RFC 5246 §5. All cipher suites in scope use SHA-256.
fn p_hash(secret: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(out_len);
    let mut a = {
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(seed);
        mac.finalize().into_bytes().to_vec()
    };

    while result.len() < out_len {
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&a);
        mac.update(seed);
        result.extend_from_slice(&mac.finalize().into_bytes());

        let mut next_a = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        next_a.update(&a);
        a = next_a.finalize().into_bytes().to_vec();
    }

    result.truncate(out_len);
    result
}

/// RFC 5246 §8.1: master_secret = PRF(pre_master_secret, "master secret",
/// ClientHello.random + ServerHello.random)[0..48]
pub fn master_secret(pre_master_secret: &[u8], client_random: &[u8], server_random: &[u8]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(client_random.len() + server_random.len());
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    p_hash(pre_master_secret, &prefixed_seed(b"master secret", &seed), MASTER_SECRET_LENGTH)
}

/// RFC 5246 §6.3: key_block = PRF(master_secret, "key expansion",
/// server_random + client_random), truncated to whatever key material the
/// negotiated cipher suite needs.
pub fn key_expansion(master_secret: &[u8], server_random: &[u8], client_random: &[u8], len: usize) -> Vec<u8> {
    let mut seed = Vec::with_capacity(server_random.len() + client_random.len());
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    p_hash(master_secret, &prefixed_seed(b"key expansion", &seed), len)
}

fn prefixed_seed(label: &[u8], seed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + seed.len());
    out.extend_from_slice(label);
    out.extend_from_slice(seed);
    out
}

/// RFC 5246 §7.4.9: verify_data = PRF(master_secret, label,
/// Hash(handshake_messages))[0..12], label differs by endpoint role.
fn verify_data(master_secret: &[u8], label: &[u8], handshake_messages_hash: &[u8]) -> Vec<u8> {
    p_hash(master_secret, &prefixed_seed(label, handshake_messages_hash), VERIFY_DATA_LENGTH)
}

pub fn verify_data_client(master_secret: &[u8], handshake_messages_hash: &[u8]) -> Vec<u8> {
    verify_data(master_secret, b"client finished", handshake_messages_hash)
}

pub fn verify_data_server(master_secret: &[u8], handshake_messages_hash: &[u8]) -> Vec<u8> {
    verify_data(master_secret, b"server finished", handshake_messages_hash)
}

pub fn handshake_transcript_hash(messages: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(messages);
    hasher.finalize().into()
}

/// RFC 4279 §2: PSK pre-master-secret, no ECDHE contribution.
pub fn psk_pre_master_secret(psk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 * psk.len());
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend(std::iter::repeat(0u8).take(psk.len()));
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
    out
}

/// RFC 5489 §2: ECDHE-PSK pre-master-secret, the ECDHE secret replaces the
/// "other_secret" zero-filled block used by plain PSK.
pub fn ecdhe_psk_pre_master_secret(ecdhe_secret: &[u8], psk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ecdhe_secret.len() + psk.len());
    out.extend_from_slice(&(ecdhe_secret.len() as u16).to_be_bytes());
    out.extend_from_slice(ecdhe_secret);
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
    out
}

pub fn ecdhe_pre_master_secret(ecdhe_secret: &[u8]) -> Result<Vec<u8>> {
    Ok(ecdhe_secret.to_vec())
}

#[cfg(test)]
mod prf_test {
    use super::*;

    #[test]
    fn master_secret_is_48_bytes() {
        let pms = vec![1u8; 32];
        let ms = master_secret(&pms, &[0u8; 32], &[1u8; 32]);
        assert_eq!(ms.len(), MASTER_SECRET_LENGTH);
    }

    #[test]
    fn key_expansion_is_deterministic() {
        let ms = vec![7u8; 48];
        let a = key_expansion(&ms, &[2u8; 32], &[3u8; 32], 40);
        let b = key_expansion(&ms, &[2u8; 32], &[3u8; 32], 40);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn client_and_server_verify_data_differ() {
        let ms = vec![9u8; 48];
        let hash = [5u8; 32];
        let client = verify_data_client(&ms, &hash);
        let server = verify_data_server(&ms, &hash);
        assert_ne!(client, server);
        assert_eq!(client.len(), VERIFY_DATA_LENGTH);
    }

    #[test]
    fn psk_pre_master_secret_embeds_length_prefixes() {
        let pms = psk_pre_master_secret(b"secret");
        assert_eq!(&pms[0..2], &[0, 6]);
        assert_eq!(&pms[2..8], &[0u8; 6]);
        assert_eq!(&pms[8..10], &[0, 6]);
        assert_eq!(&pms[10..], b"secret");
    }
}
