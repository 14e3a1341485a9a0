use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::wire::alert::Alert;
use crate::wire::application_data::ApplicationData;
use crate::wire::change_cipher_spec::ChangeCipherSpec;
use crate::wire::handshake::Handshake;

// https://tools.ietf.org/html/rfc4346#section-6.2.1
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
    Invalid,
}

impl From<u8> for ContentType {
    fn from(val: u8) -> Self {
        match val {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => ContentType::Invalid,
        }
    }
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Invalid
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum Content {
    ChangeCipherSpec(ChangeCipherSpec),
    Alert(Alert),
    Handshake(Handshake),
    ApplicationData(ApplicationData),
}

impl Content {
    pub fn content_type(&self) -> ContentType {
        match self {
            Content::ChangeCipherSpec(_) => ContentType::ChangeCipherSpec,
            Content::Alert(_) => ContentType::Alert,
            Content::Handshake(_) => ContentType::Handshake,
            Content::ApplicationData(_) => ContentType::ApplicationData,
        }
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Content::ChangeCipherSpec(c) => c.marshal(writer),
            Content::Alert(c) => c.marshal(writer),
            Content::Handshake(c) => c.marshal(writer),
            Content::ApplicationData(c) => c.marshal(writer),
        }
    }

    pub fn unmarshal<R: Read>(content_type: ContentType, reader: &mut R) -> Result<Self> {
        match content_type {
            ContentType::ChangeCipherSpec => {
                Ok(Content::ChangeCipherSpec(ChangeCipherSpec::unmarshal(reader)?))
            }
            ContentType::Alert => Ok(Content::Alert(Alert::unmarshal(reader)?)),
            ContentType::Handshake => Ok(Content::Handshake(Handshake::unmarshal(reader)?)),
            ContentType::ApplicationData => {
                Ok(Content::ApplicationData(ApplicationData::unmarshal(reader)?))
            }
            ContentType::Invalid => Err(Error::DecodeError {
                offset: 0,
                reason: "invalid content type".to_owned(),
            }),
        }
    }
}
