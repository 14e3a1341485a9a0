use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::HandshakeType;
use crate::error::Result;

// type(1) || total_length(3) || message_seq(2) || fragment_offset(3) || fragment_length(3)
pub const HANDSHAKE_HEADER_LENGTH: usize = 12;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct HandshakeHeader {
    pub handshake_type: HandshakeType,
    pub length: u32, // u24 on the wire
    pub message_seq: u16,
    pub fragment_offset: u32, // u24 on the wire
    pub fragment_length: u32, // u24 on the wire
}

impl HandshakeHeader {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.handshake_type as u8)?;
        writer.write_u24::<BigEndian>(self.length)?;
        writer.write_u16::<BigEndian>(self.message_seq)?;
        writer.write_u24::<BigEndian>(self.fragment_offset)?;
        writer.write_u24::<BigEndian>(self.fragment_length)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let handshake_type = reader.read_u8()?.into();
        let length = reader.read_u24::<BigEndian>()?;
        let message_seq = reader.read_u16::<BigEndian>()?;
        let fragment_offset = reader.read_u24::<BigEndian>()?;
        let fragment_length = reader.read_u24::<BigEndian>()?;

        Ok(HandshakeHeader {
            handshake_type,
            length,
            message_seq,
            fragment_offset,
            fragment_length,
        })
    }
}

#[cfg(test)]
mod handshake_header_test {
    use super::*;

    #[test]
    fn round_trips() {
        let h = HandshakeHeader {
            handshake_type: HandshakeType::ClientHello,
            length: 300,
            message_seq: 7,
            fragment_offset: 100,
            fragment_length: 50,
        };
        let mut buf = vec![];
        h.marshal(&mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_HEADER_LENGTH);
        let decoded = HandshakeHeader::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, h);
    }
}
