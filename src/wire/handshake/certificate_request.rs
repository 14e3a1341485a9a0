use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::crypto::signature::{HashAlgorithm, SignatureAlgorithm, SignatureHashAlgorithm};
use crate::error::Result;

// https://tools.ietf.org/html/rfc5246#section-7.4.4
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ClientCertificateType {
    EcdsaSign = 64,
    Unsupported,
}

impl From<u8> for ClientCertificateType {
    fn from(val: u8) -> Self {
        match val {
            64 => ClientCertificateType::EcdsaSign,
            _ => ClientCertificateType::Unsupported,
        }
    }
}

// A non-anonymous server can optionally request a certificate from the
// client when the cipher suite calls for it. If sent, it immediately
// follows ServerKeyExchange (or Certificate, if there is no key exchange
// message). Distinguished Names is always left empty: this connector
// authenticates peers by public key/PSK identity, not by CA.
#[derive(Clone, Debug, PartialEq)]
pub struct CertificateRequest {
    pub certificate_types: Vec<ClientCertificateType>,
    pub signature_hash_algorithms: Vec<SignatureHashAlgorithm>,
}

impl CertificateRequest {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.certificate_types.len() as u8)?;
        for v in &self.certificate_types {
            writer.write_u8(*v as u8)?;
        }

        writer.write_u16::<BigEndian>(2 * self.signature_hash_algorithms.len() as u16)?;
        for v in &self.signature_hash_algorithms {
            writer.write_u8(v.hash as u8)?;
            writer.write_u8(v.signature as u8)?;
        }

        writer.write_all(&[0x00, 0x00])?; // distinguished names length
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let certificate_types_len = reader.read_u8()?;
        let mut certificate_types = vec![];
        for _ in 0..certificate_types_len {
            certificate_types.push(ClientCertificateType::from(reader.read_u8()?));
        }

        let signature_hash_algorithms_len = reader.read_u16::<BigEndian>()?;
        let mut signature_hash_algorithms = vec![];
        for _ in (0..signature_hash_algorithms_len).step_by(2) {
            let hash = HashAlgorithm::from(reader.read_u8()?);
            let signature = SignatureAlgorithm::from(reader.read_u8()?);
            signature_hash_algorithms.push(SignatureHashAlgorithm { hash, signature });
        }

        let distinguished_names_len = reader.read_u16::<BigEndian>()? as usize;
        let mut skip = vec![0u8; distinguished_names_len];
        reader.read_exact(&mut skip)?;

        Ok(CertificateRequest { certificate_types, signature_hash_algorithms })
    }
}

#[cfg(test)]
mod certificate_request_test {
    use super::*;

    #[test]
    fn round_trips() {
        let req = CertificateRequest {
            certificate_types: vec![ClientCertificateType::EcdsaSign],
            signature_hash_algorithms: vec![SignatureHashAlgorithm {
                hash: HashAlgorithm::Sha256,
                signature: SignatureAlgorithm::Ecdsa,
            }],
        };
        let mut buf = vec![];
        req.marshal(&mut buf).unwrap();
        let decoded = CertificateRequest::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, req);
    }
}
