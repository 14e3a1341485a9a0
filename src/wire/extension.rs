use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::crypto::curve::NamedCurve;
use crate::crypto::signature::{HashAlgorithm, SignatureAlgorithm, SignatureHashAlgorithm};
use crate::error::{Error, Result};

// https://tools.ietf.org/html/rfc6066#section-1
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u16)]
enum ExtensionType {
    SupportedEllipticCurves = 10,
    SupportedPointFormats = 11,
    SupportedSignatureAlgorithms = 13,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Extension {
    SupportedEllipticCurves { curves: Vec<NamedCurve> },
    SupportedPointFormats,
    SupportedSignatureAlgorithms { algorithms: Vec<SignatureHashAlgorithm> },
}

impl Extension {
    fn extension_type(&self) -> ExtensionType {
        match self {
            Extension::SupportedEllipticCurves { .. } => ExtensionType::SupportedEllipticCurves,
            Extension::SupportedPointFormats => ExtensionType::SupportedPointFormats,
            Extension::SupportedSignatureAlgorithms { .. } => {
                ExtensionType::SupportedSignatureAlgorithms
            }
        }
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.extension_type() as u16)?;

        let mut body = vec![];
        match self {
            Extension::SupportedEllipticCurves { curves } => {
                body.write_u16::<BigEndian>(2 * curves.len() as u16)?;
                for curve in curves {
                    body.write_u16::<BigEndian>(*curve as u16)?;
                }
            }
            Extension::SupportedPointFormats => {
                // uncompressed only
                body.write_u8(1)?;
                body.write_u8(0)?;
            }
            Extension::SupportedSignatureAlgorithms { algorithms } => {
                body.write_u16::<BigEndian>(2 * algorithms.len() as u16)?;
                for algo in algorithms {
                    body.write_u8(algo.hash as u8)?;
                    body.write_u8(algo.signature as u8)?;
                }
            }
        }

        writer.write_u16::<BigEndian>(body.len() as u16)?;
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let typ = reader.read_u16::<BigEndian>()?;
        let len = reader.read_u16::<BigEndian>()? as usize;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        let mut cursor = body.as_slice();

        Ok(match typ {
            10 => {
                let count = cursor.read_u16::<BigEndian>()? / 2;
                let mut curves = vec![];
                for _ in 0..count {
                    curves.push(NamedCurve::from(cursor.read_u16::<BigEndian>()?));
                }
                Extension::SupportedEllipticCurves { curves }
            }
            11 => Extension::SupportedPointFormats,
            13 => {
                let count = cursor.read_u16::<BigEndian>()? / 2;
                let mut algorithms = vec![];
                for _ in 0..count {
                    let hash = HashAlgorithm::from(cursor.read_u8()?);
                    let signature = SignatureAlgorithm::from(cursor.read_u8()?);
                    algorithms.push(SignatureHashAlgorithm { hash, signature });
                }
                Extension::SupportedSignatureAlgorithms { algorithms }
            }
            other => {
                return Err(Error::DecodeError {
                    offset: 0,
                    reason: format!("unknown extension type {}", other),
                })
            }
        })
    }
}

pub fn marshal_extensions<W: Write>(extensions: &[Extension], writer: &mut W) -> Result<()> {
    let mut buf = vec![];
    for ext in extensions {
        ext.marshal(&mut buf)?;
    }
    writer.write_u16::<BigEndian>(buf.len() as u16)?;
    writer.write_all(&buf)?;
    Ok(())
}

pub fn unmarshal_extensions<R: Read>(reader: &mut R) -> Result<Vec<Extension>> {
    let len = reader.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let mut cursor = buf.as_slice();
    let mut extensions = vec![];
    while !cursor.is_empty() {
        extensions.push(Extension::unmarshal(&mut cursor)?);
    }
    Ok(extensions)
}
