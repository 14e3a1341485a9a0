use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::wire::content::{Content, ContentType};

// type(1) || version(2) || epoch(2) || seq(6) || length(2)
pub const RECORD_LAYER_HEADER_SIZE: usize = 13;
pub const MAX_SEQUENCE_NUMBER: u64 = (1u64 << 48) - 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

pub const PROTOCOL_VERSION_1_0: ProtocolVersion = ProtocolVersion { major: 254, minor: 255 };
pub const PROTOCOL_VERSION_1_2: ProtocolVersion = ProtocolVersion { major: 254, minor: 253 };

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION_1_2
    }
}

/// 13-byte record header: type(1) || version(2) || epoch(2) || seq(6) || length(2).
/// `sequence_number` is carried in a `u64`; only the low 48 bits are ever valid
/// (see [`MAX_SEQUENCE_NUMBER`]) since Rust has no native u48.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct RecordLayerHeader {
    pub content_type: ContentType,
    pub protocol_version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
    pub content_len: u16,
}

impl RecordLayerHeader {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.content_type as u8)?;
        writer.write_u8(self.protocol_version.major)?;
        writer.write_u8(self.protocol_version.minor)?;
        writer.write_u16::<BigEndian>(self.epoch)?;
        write_u48(writer, self.sequence_number)?;
        writer.write_u16::<BigEndian>(self.content_len)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let content_type = reader.read_u8()?.into();
        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        let epoch = reader.read_u16::<BigEndian>()?;
        let sequence_number = read_u48(reader)?;
        let content_len = reader.read_u16::<BigEndian>()?;

        if content_type == ContentType::Invalid {
            return Err(Error::DecodeError {
                offset: 0,
                reason: "reserved content type".to_owned(),
            });
        }

        Ok(RecordLayerHeader {
            content_type,
            protocol_version: ProtocolVersion { major, minor },
            epoch,
            sequence_number,
            content_len,
        })
    }
}

pub(crate) fn write_u48<W: Write>(writer: &mut W, v: u64) -> Result<()> {
    if v > MAX_SEQUENCE_NUMBER {
        return Err(Error::SeqExhausted);
    }
    let bytes = v.to_be_bytes();
    writer.write_all(&bytes[2..8])?;
    Ok(())
}

pub(crate) fn read_u48<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf[2..8])?;
    Ok(u64::from_be_bytes(buf))
}

/// A single DTLS record: header plus decoded content. A single UDP datagram
/// may carry several records back to back; the connector splits them before
/// this type ever sees one (see `connection::split_datagram`).
#[derive(Clone, PartialEq, Debug)]
pub struct Record {
    pub header: RecordLayerHeader,
    pub content: Content,
}

impl Record {
    pub fn new(protocol_version: ProtocolVersion, epoch: u16, content: Content) -> Self {
        Record {
            header: RecordLayerHeader {
                content_type: content.content_type(),
                protocol_version,
                epoch,
                sequence_number: 0,
                content_len: 0,
            },
            content,
        }
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut body = vec![];
        self.content.marshal(&mut body)?;

        let mut header = self.header;
        header.content_len = body.len() as u16;
        header.marshal(writer)?;
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let (header, body) = unmarshal_header_and_body(reader)?;
        let content = Content::unmarshal(header.content_type, &mut body.as_slice())?;
        Ok(Record { header, content })
    }
}

/// Reads just the record header and its raw body without decoding the
/// content. Handshake content needs this: a fragmented handshake message is
/// not valid input to `Content::unmarshal` (`Handshake::unmarshal` rejects
/// fragments), so the caller must reassemble first and only then decode.
pub fn unmarshal_header_and_body<R: Read>(reader: &mut R) -> Result<(RecordLayerHeader, Vec<u8>)> {
    let header = RecordLayerHeader::unmarshal(reader)?;
    let mut body = vec![0u8; header.content_len as usize];
    reader.read_exact(&mut body)?;
    Ok((header, body))
}

#[cfg(test)]
mod record_test {
    use super::*;
    use crate::wire::application_data::ApplicationData;

    #[test]
    fn round_trips_application_data() {
        let r = Record::new(
            PROTOCOL_VERSION_1_2,
            1,
            Content::ApplicationData(ApplicationData { data: vec![1, 2, 3] }),
        );
        let mut buf = vec![];
        r.marshal(&mut buf).unwrap();

        let decoded = Record::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.header.epoch, 1);
        assert_eq!(decoded.content, r.content);
    }

    #[test]
    fn rejects_reserved_content_type() {
        let bytes = [0u8, 254, 253, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = RecordLayerHeader::unmarshal(&mut &bytes[..]).unwrap_err();
        assert!(matches!(err, Error::DecodeError { .. }));
    }

    #[test]
    fn sequence_number_overflow_is_rejected() {
        let mut buf = vec![];
        let res = write_u48(&mut buf, MAX_SEQUENCE_NUMBER + 1);
        assert!(matches!(res, Err(Error::SeqExhausted)));
    }
}
