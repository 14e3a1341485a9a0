use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

// https://tools.ietf.org/html/rfc5246#section-7.4.2: a chain of DER-encoded
// X.509 certificates, leaf first.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Certificate {
    pub certificate: Vec<Vec<u8>>,
}

impl Certificate {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut chain_buf = vec![];
        for cert in &self.certificate {
            chain_buf.write_u24::<BigEndian>(cert.len() as u32)?;
            chain_buf.write_all(cert)?;
        }
        writer.write_u24::<BigEndian>(chain_buf.len() as u32)?;
        writer.write_all(&chain_buf)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let chain_len = reader.read_u24::<BigEndian>()? as usize;
        let mut chain_buf = vec![0u8; chain_len];
        reader.read_exact(&mut chain_buf)?;

        let mut cursor = chain_buf.as_slice();
        let mut certificate = vec![];
        while !cursor.is_empty() {
            let cert_len = cursor.read_u24::<BigEndian>()? as usize;
            let mut cert = vec![0u8; cert_len];
            cursor.read_exact(&mut cert)?;
            certificate.push(cert);
        }
        Ok(Certificate { certificate })
    }
}

#[cfg(test)]
mod certificate_test {
    use super::*;

    #[test]
    fn round_trips_multi_cert_chain() {
        let cert = Certificate { certificate: vec![vec![1u8; 10], vec![2u8; 20]] };
        let mut buf = vec![];
        cert.marshal(&mut buf).unwrap();
        let decoded = Certificate::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, cert);
    }

    #[test]
    fn round_trips_empty_chain() {
        let cert = Certificate::default();
        let mut buf = vec![];
        cert.marshal(&mut buf).unwrap();
        let decoded = Certificate::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, cert);
    }
}
