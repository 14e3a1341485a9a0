use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::random::HandshakeRandom;
use crate::error::Result;
use crate::wire::cipher_suite::CipherSuiteId;
use crate::wire::extension::{marshal_extensions, unmarshal_extensions, Extension};
use crate::wire::record::ProtocolVersion;

// The server sends this in response to a ClientHello when it found an
// acceptable set of algorithms; otherwise it sends a handshake_failure
// alert instead. https://tools.ietf.org/html/rfc5246#section-7.4.1.3
#[derive(Clone, PartialEq, Debug)]
pub struct ServerHello {
    pub version: ProtocolVersion,
    pub random: HandshakeRandom,
    pub session_id: Vec<u8>,
    pub cipher_suite: CipherSuiteId,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.version.major)?;
        writer.write_u8(self.version.minor)?;
        self.random.marshal(writer)?;

        writer.write_u8(self.session_id.len() as u8)?;
        writer.write_all(&self.session_id)?;

        writer.write_u16::<BigEndian>(self.cipher_suite as u16)?;

        // compression method: null
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

        let cipher_suite = CipherSuiteId::from(reader.read_u16::<BigEndian>()?);

        reader.read_u8()?; // compression method

        let extensions = unmarshal_extensions(reader)?;

        Ok(ServerHello {
            version: ProtocolVersion { major, minor },
            random,
            session_id,
            cipher_suite,
            extensions,
        })
    }
}

#[cfg(test)]
mod server_hello_test {
    use super::*;

    #[test]
    fn round_trips() {
        let hello = ServerHello {
            version: ProtocolVersion { major: 254, minor: 253 },
            random: HandshakeRandom::default(),
            session_id: vec![1, 2, 3],
            cipher_suite: CipherSuiteId::TlsEcdheEcdsaWithAes128GcmSha256,
            extensions: vec![Extension::SupportedPointFormats],
        };
        let mut buf = vec![];
        hello.marshal(&mut buf).unwrap();
        let decoded = ServerHello::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, hello);
    }
}
