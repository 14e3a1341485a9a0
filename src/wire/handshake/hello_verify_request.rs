use std::io::{Read, Write};

use byteorder::WriteBytesExt;

use crate::error::Result;
use crate::wire::record::ProtocolVersion;

// https://tools.ietf.org/html/rfc6347#section-4.2.1
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HelloVerifyRequest {
    pub version: ProtocolVersion,
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequest {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.version.major)?;
        writer.write_u8(self.version.minor)?;
        writer.write_u8(self.cookie.len() as u8)?;
        writer.write_all(&self.cookie)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        use byteorder::ReadBytesExt;
        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        let cookie_len = reader.read_u8()? as usize;
        let mut cookie = vec![0u8; cookie_len];
        reader.read_exact(&mut cookie)?;
        Ok(HelloVerifyRequest {
            version: ProtocolVersion { major, minor },
            cookie,
        })
    }
}

#[cfg(test)]
mod hello_verify_request_test {
    use super::*;

    #[test]
    fn round_trips() {
        let msg = HelloVerifyRequest {
            version: ProtocolVersion { major: 254, minor: 253 },
            cookie: vec![9, 8, 7, 6, 5],
        };
        let mut buf = vec![];
        msg.marshal(&mut buf).unwrap();
        let decoded = HelloVerifyRequest::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }
}
