use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::crypto::curve::NamedCurve;
use crate::error::Result;

const NAMED_CURVE_TYPE: u8 = 3; // https://tools.ietf.org/html/rfc4492#section-5.4

// https://tools.ietf.org/html/rfc4492#section-5.4: ECDHE server key exchange.
// Plain-PSK suites carry only an identity hint and skip the curve params
// entirely; ECDHE-PSK and ECDHE-ECDSA both carry curve params, the latter
// also a signature over them.
#[derive(Clone, PartialEq, Debug)]
pub struct ServerKeyExchange {
    pub identity_hint: Vec<u8>,
    pub curve: Option<NamedCurve>,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl ServerKeyExchange {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        if !self.identity_hint.is_empty() || self.curve.is_none() {
            writer.write_u16::<byteorder::BigEndian>(self.identity_hint.len() as u16)?;
            writer.write_all(&self.identity_hint)?;
        }

        if let Some(curve) = self.curve {
            writer.write_u8(NAMED_CURVE_TYPE)?;
            writer.write_u16::<byteorder::BigEndian>(curve as u16)?;
            writer.write_u8(self.public_key.len() as u8)?;
            writer.write_all(&self.public_key)?;

            if !self.signature.is_empty() {
                // hash(4) || signature(3) algorithm identifiers are fixed to
                // SHA-256/ECDSA in this connector, see crypto::signature.
                writer.write_u8(4)?;
                writer.write_u8(3)?;
                writer.write_u16::<byteorder::BigEndian>(self.signature.len() as u16)?;
                writer.write_all(&self.signature)?;
            }
        }
        Ok(())
    }

    pub fn unmarshal_psk<R: Read>(reader: &mut R) -> Result<Self> {
        let len = reader.read_u16::<byteorder::BigEndian>()? as usize;
        let mut identity_hint = vec![0u8; len];
        reader.read_exact(&mut identity_hint)?;
        Ok(ServerKeyExchange { identity_hint, curve: None, public_key: vec![], signature: vec![] })
    }

    pub fn unmarshal_ecdhe<R: Read>(reader: &mut R, expect_signature: bool) -> Result<Self> {
        let _curve_type = reader.read_u8()?;
        let curve = NamedCurve::from(reader.read_u16::<byteorder::BigEndian>()?);
        let public_key_len = reader.read_u8()? as usize;
        let mut public_key = vec![0u8; public_key_len];
        reader.read_exact(&mut public_key)?;

        let signature = if expect_signature {
            let _hash_algo = reader.read_u8()?;
            let _sig_algo = reader.read_u8()?;
            let sig_len = reader.read_u16::<byteorder::BigEndian>()? as usize;
            let mut sig = vec![0u8; sig_len];
            reader.read_exact(&mut sig)?;
            sig
        } else {
            vec![]
        };

        Ok(ServerKeyExchange { identity_hint: vec![], curve: Some(curve), public_key, signature })
    }
}

#[cfg(test)]
mod server_key_exchange_test {
    use super::*;

    #[test]
    fn round_trips_ecdhe_ecdsa() {
        let ske = ServerKeyExchange {
            identity_hint: vec![],
            curve: Some(NamedCurve::X25519),
            public_key: vec![1u8; 32],
            signature: vec![9u8; 64],
        };
        let mut buf = vec![];
        ske.marshal(&mut buf).unwrap();
        let decoded = ServerKeyExchange::unmarshal_ecdhe(&mut buf.as_slice(), true).unwrap();
        assert_eq!(decoded, ske);
    }

    #[test]
    fn round_trips_psk_identity_hint_only() {
        let ske = ServerKeyExchange {
            identity_hint: b"device-42".to_vec(),
            curve: None,
            public_key: vec![],
            signature: vec![],
        };
        let mut buf = vec![];
        ske.marshal(&mut buf).unwrap();
        let decoded = ServerKeyExchange::unmarshal_psk(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, ske);
    }
}
