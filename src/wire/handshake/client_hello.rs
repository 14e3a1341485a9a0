use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::random::HandshakeRandom;
use crate::error::Result;
use crate::wire::cipher_suite::CipherSuiteId;
use crate::wire::extension::{marshal_extensions, unmarshal_extensions, Extension};
use crate::wire::record::ProtocolVersion;

// https://tools.ietf.org/html/rfc5246#section-7.4.1.2, cookie field added by
// https://tools.ietf.org/html/rfc6347#section-4.2.1
#[derive(Clone, PartialEq, Debug)]
pub struct ClientHello {
    pub version: ProtocolVersion,
    pub random: HandshakeRandom,
    pub session_id: Vec<u8>,
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<CipherSuiteId>,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.version.major)?;
        writer.write_u8(self.version.minor)?;
        self.random.marshal(writer)?;

        writer.write_u8(self.session_id.len() as u8)?;
        writer.write_all(&self.session_id)?;

        writer.write_u8(self.cookie.len() as u8)?;
        writer.write_all(&self.cookie)?;

        writer.write_u16::<BigEndian>(2 * self.cipher_suites.len() as u16)?;
        for suite in &self.cipher_suites {
            writer.write_u16::<BigEndian>(*suite as u16)?;
        }

        // compression methods: null only
        writer.write_u8(1)?;
        writer.write_u8(0)?;

        marshal_extensions(&self.extensions, writer)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        let random = HandshakeRandom::unmarshal(reader)?;

        let session_id_len = reader.read_u8()? as usize;
        let mut session_id = vec![0u8; session_id_len];
        reader.read_exact(&mut session_id)?;

        let cookie_len = reader.read_u8()? as usize;
        let mut cookie = vec![0u8; cookie_len];
        reader.read_exact(&mut cookie)?;

        let cipher_suites_len = reader.read_u16::<BigEndian>()? / 2;
        let mut cipher_suites = Vec::with_capacity(cipher_suites_len as usize);
        for _ in 0..cipher_suites_len {
            cipher_suites.push(CipherSuiteId::from(reader.read_u16::<BigEndian>()?));
        }

        let compression_methods_len = reader.read_u8()? as usize;
        let mut compression_methods = vec![0u8; compression_methods_len];
        reader.read_exact(&mut compression_methods)?;

        let extensions = unmarshal_extensions(reader)?;

        Ok(ClientHello {
            version: ProtocolVersion { major, minor },
            random,
            session_id,
            cookie,
            cipher_suites,
            extensions,
        })
    }
}

#[cfg(test)]
mod client_hello_test {
    use super::*;
    use crate::crypto::curve::NamedCurve;

    #[test]
    fn round_trips_with_cookie_and_extensions() {
        let hello = ClientHello {
            version: ProtocolVersion { major: 254, minor: 253 },
            random: HandshakeRandom::default(),
            session_id: vec![],
            cookie: vec![1, 2, 3, 4],
            cipher_suites: vec![CipherSuiteId::TlsEcdheEcdsaWithAes128GcmSha256],
            extensions: vec![Extension::SupportedEllipticCurves {
                curves: vec![NamedCurve::X25519, NamedCurve::P256],
            }],
        };
        let mut buf = vec![];
        hello.marshal(&mut buf).unwrap();
        let decoded = ClientHello::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn round_trips_without_cookie() {
        let hello = ClientHello {
            version: ProtocolVersion { major: 254, minor: 253 },
            random: HandshakeRandom::default(),
            session_id: vec![],
            cookie: vec![],
            cipher_suites: vec![CipherSuiteId::TlsPskWithAes128CcmEight],
            extensions: vec![],
        };
        let mut buf = vec![];
        hello.marshal(&mut buf).unwrap();
        let decoded = ClientHello::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, hello);
        assert!(decoded.cookie.is_empty());
    }
}
