pub mod certificate;
pub mod certificate_request;
pub mod certificate_verify;
pub mod client_hello;
pub mod client_key_exchange;
pub mod finished;
pub mod header;
pub mod hello_verify_request;
pub mod random;
pub mod server_hello;
pub mod server_hello_done;
pub mod server_key_exchange;

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub use certificate::Certificate;
pub use certificate_request::CertificateRequest;
pub use certificate_verify::CertificateVerify;
pub use client_hello::ClientHello;
pub use client_key_exchange::ClientKeyExchange;
pub use finished::Finished;
pub use header::{HandshakeHeader, HANDSHAKE_HEADER_LENGTH};
pub use hello_verify_request::HelloVerifyRequest;
pub use random::{HandshakeRandom, HANDSHAKE_RANDOM_LENGTH};
pub use server_hello::ServerHello;
pub use server_hello_done::ServerHelloDone;
pub use server_key_exchange::ServerKeyExchange;

use crate::error::{Error, Result};

// https://tools.ietf.org/html/rfc5246#section-7.4
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    HelloVerifyRequest = 3,
    Certificate = 11,
    ServerKeyExchange = 12,
    CertificateRequest = 13,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
    Invalid,
}

impl Default for HandshakeType {
    fn default() -> Self {
        HandshakeType::Invalid
    }
}

impl From<u8> for HandshakeType {
    fn from(val: u8) -> Self {
        match val {
            0 => HandshakeType::HelloRequest,
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            3 => HandshakeType::HelloVerifyRequest,
            11 => HandshakeType::Certificate,
            12 => HandshakeType::ServerKeyExchange,
            13 => HandshakeType::CertificateRequest,
            14 => HandshakeType::ServerHelloDone,
            15 => HandshakeType::CertificateVerify,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            _ => HandshakeType::Invalid,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    HelloVerifyRequest(HelloVerifyRequest),
    Certificate(Certificate),
    ServerKeyExchange(ServerKeyExchange),
    CertificateRequest(CertificateRequest),
    ServerHelloDone(ServerHelloDone),
    CertificateVerify(CertificateVerify),
    ClientKeyExchange(ClientKeyExchange),
    Finished(Finished),
}

impl HandshakeMessage {
    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            HandshakeMessage::ClientHello(_) => HandshakeType::ClientHello,
            HandshakeMessage::ServerHello(_) => HandshakeType::ServerHello,
            HandshakeMessage::HelloVerifyRequest(_) => HandshakeType::HelloVerifyRequest,
            HandshakeMessage::Certificate(_) => HandshakeType::Certificate,
            HandshakeMessage::ServerKeyExchange(_) => HandshakeType::ServerKeyExchange,
            HandshakeMessage::CertificateRequest(_) => HandshakeType::CertificateRequest,
            HandshakeMessage::ServerHelloDone(_) => HandshakeType::ServerHelloDone,
            HandshakeMessage::CertificateVerify(_) => HandshakeType::CertificateVerify,
            HandshakeMessage::ClientKeyExchange(_) => HandshakeType::ClientKeyExchange,
            HandshakeMessage::Finished(_) => HandshakeType::Finished,
        }
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            HandshakeMessage::ClientHello(m) => m.marshal(writer),
            HandshakeMessage::ServerHello(m) => m.marshal(writer),
            HandshakeMessage::HelloVerifyRequest(m) => m.marshal(writer),
            HandshakeMessage::Certificate(m) => m.marshal(writer),
            HandshakeMessage::ServerKeyExchange(m) => m.marshal(writer),
            HandshakeMessage::CertificateRequest(m) => m.marshal(writer),
            HandshakeMessage::ServerHelloDone(m) => m.marshal(writer),
            HandshakeMessage::CertificateVerify(m) => m.marshal(writer),
            HandshakeMessage::ClientKeyExchange(m) => m.marshal(writer),
            HandshakeMessage::Finished(m) => m.marshal(writer),
        }
    }

    pub fn unmarshal<R: Read>(handshake_type: HandshakeType, reader: &mut R) -> Result<Self> {
        Ok(match handshake_type {
            HandshakeType::ClientHello => HandshakeMessage::ClientHello(ClientHello::unmarshal(reader)?),
            HandshakeType::ServerHello => HandshakeMessage::ServerHello(ServerHello::unmarshal(reader)?),
            HandshakeType::HelloVerifyRequest => {
                HandshakeMessage::HelloVerifyRequest(HelloVerifyRequest::unmarshal(reader)?)
            }
            HandshakeType::Certificate => HandshakeMessage::Certificate(Certificate::unmarshal(reader)?),
            HandshakeType::CertificateRequest => {
                HandshakeMessage::CertificateRequest(CertificateRequest::unmarshal(reader)?)
            }
            HandshakeType::ServerHelloDone => {
                HandshakeMessage::ServerHelloDone(ServerHelloDone::unmarshal(reader)?)
            }
            HandshakeType::CertificateVerify => {
                HandshakeMessage::CertificateVerify(CertificateVerify::unmarshal(reader)?)
            }
            HandshakeType::Finished => HandshakeMessage::Finished(Finished::unmarshal(reader)?),
            HandshakeType::ServerKeyExchange | HandshakeType::ClientKeyExchange => {
                // Both wire shapes are cipher-suite dependent (PSK carries only
                // an identity, ECDHE carries curve params) and cannot be told
                // apart from the bytes alone; callers that know the suite use
                // `ServerKeyExchange::unmarshal_psk/unmarshal_ecdhe` or
                // `ClientKeyExchange::unmarshal_psk/unmarshal_ecdhe` directly.
                return Err(Error::DecodeError {
                    offset: 0,
                    reason: format!("{:?} requires cipher suite context to decode", handshake_type),
                })
            }
            HandshakeType::HelloRequest | HandshakeType::Invalid => {
                return Err(Error::DecodeError {
                    offset: 0,
                    reason: format!("unsupported handshake type {:?}", handshake_type),
                })
            }
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Handshake {
    pub header: HandshakeHeader,
    pub message: HandshakeMessage,
}

impl Handshake {
    pub fn new(message: HandshakeMessage) -> Self {
        Handshake {
            header: HandshakeHeader {
                handshake_type: message.handshake_type(),
                ..Default::default()
            },
            message,
        }
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut body = vec![];
        self.message.marshal(&mut body)?;

        let header = HandshakeHeader {
            handshake_type: self.message.handshake_type(),
            length: body.len() as u32,
            message_seq: self.header.message_seq,
            fragment_offset: self.header.fragment_offset,
            fragment_length: body.len() as u32,
        };
        header.marshal(writer)?;
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let header = HandshakeHeader::unmarshal(reader)?;
        if header.fragment_offset != 0 || header.fragment_length != header.length {
            return Err(Error::DecodeError {
                offset: HANDSHAKE_HEADER_LENGTH,
                reason: "fragmented handshake message passed to unmarshal".to_owned(),
            });
        }
        let mut body = vec![0u8; header.length as usize];
        reader.read_exact(&mut body)?;
        let message = HandshakeMessage::unmarshal(header.handshake_type, &mut body.as_slice())?;
        Ok(Handshake { header, message })
    }
}

pub(crate) fn read_u48<R: Read>(reader: &mut R) -> Result<u64> {
    let hi = reader.read_u16::<BigEndian>()? as u64;
    let lo = reader.read_u32::<BigEndian>()? as u64;
    Ok((hi << 32) | lo)
}

pub(crate) fn write_u48<W: Write>(writer: &mut W, v: u64) -> Result<()> {
    writer.write_u16::<BigEndian>((v >> 32) as u16)?;
    writer.write_u32::<BigEndian>((v & 0xffff_ffff) as u32)?;
    Ok(())
}
