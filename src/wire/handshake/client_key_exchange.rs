use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

// https://tools.ietf.org/html/rfc5246#section-7.4.7, identity carried for
// PSK/ECDHE-PSK suites (RFC 4279 §2), public key carried for ECDHE suites.
// A suite never sends both.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientKeyExchange {
    pub identity: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl ClientKeyExchange {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        if !self.identity.is_empty() == !self.public_key.is_empty() {
            return Err(Error::InternalError(
                "client key exchange must carry exactly one of identity or public key".to_owned(),
            ));
        }

        if !self.public_key.is_empty() {
            writer.write_u8(self.public_key.len() as u8)?;
            writer.write_all(&self.public_key)?;
        } else {
            writer.write_u16::<BigEndian>(self.identity.len() as u16)?;
            writer.write_all(&self.identity)?;
        }
        Ok(())
    }

    pub fn unmarshal_psk<R: Read>(reader: &mut R) -> Result<Self> {
        let len = reader.read_u16::<BigEndian>()? as usize;
        let mut identity = vec![0u8; len];
        reader.read_exact(&mut identity)?;
        Ok(ClientKeyExchange { identity, public_key: vec![] })
    }

    pub fn unmarshal_ecdhe<R: Read>(reader: &mut R) -> Result<Self> {
        let len = reader.read_u8()? as usize;
        let mut public_key = vec![0u8; len];
        reader.read_exact(&mut public_key)?;
        Ok(ClientKeyExchange { identity: vec![], public_key })
    }
}

#[cfg(test)]
mod client_key_exchange_test {
    use super::*;

    #[test]
    fn round_trips_ecdhe_public_key() {
        let cke = ClientKeyExchange { identity: vec![], public_key: vec![4u8; 32] };
        let mut buf = vec![];
        cke.marshal(&mut buf).unwrap();
        let decoded = ClientKeyExchange::unmarshal_ecdhe(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, cke);
    }

    #[test]
    fn round_trips_psk_identity() {
        let cke = ClientKeyExchange { identity: b"device-42".to_vec(), public_key: vec![] };
        let mut buf = vec![];
        cke.marshal(&mut buf).unwrap();
        let decoded = ClientKeyExchange::unmarshal_psk(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, cke);
    }

    #[test]
    fn rejects_both_fields_populated() {
        let cke = ClientKeyExchange { identity: b"x".to_vec(), public_key: vec![1] };
        let mut buf = vec![];
        assert!(cke.marshal(&mut buf).is_err());
    }
}
