use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::crypto::signature::{HashAlgorithm, SignatureAlgorithm};
use crate::error::Result;

// https://tools.ietf.org/html/rfc5246#section-7.4.8
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CertificateVerify {
    pub hash_algorithm: HashAlgorithm,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature: Vec<u8>,
}

impl CertificateVerify {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.hash_algorithm as u8)?;
        writer.write_u8(self.signature_algorithm as u8)?;
        writer.write_u16::<BigEndian>(self.signature.len() as u16)?;
        writer.write_all(&self.signature)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let hash_algorithm = HashAlgorithm::from(reader.read_u8()?);
        let signature_algorithm = SignatureAlgorithm::from(reader.read_u8()?);
        let sig_len = reader.read_u16::<BigEndian>()? as usize;
        let mut signature = vec![0u8; sig_len];
        reader.read_exact(&mut signature)?;
        Ok(CertificateVerify { hash_algorithm, signature_algorithm, signature })
    }
}

#[cfg(test)]
mod certificate_verify_test {
    use super::*;

    #[test]
    fn round_trips() {
        let msg = CertificateVerify {
            hash_algorithm: HashAlgorithm::Sha256,
            signature_algorithm: SignatureAlgorithm::Ecdsa,
            signature: vec![7u8; 70],
        };
        let mut buf = vec![];
        msg.marshal(&mut buf).unwrap();
        let decoded = CertificateVerify::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }
}
