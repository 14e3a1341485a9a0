use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

// https://tools.ietf.org/html/rfc5246#section-7.1
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ChangeCipherSpec;

const CHANGE_CIPHER_SPEC_TYPE: u8 = 1;

impl ChangeCipherSpec {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(CHANGE_CIPHER_SPEC_TYPE)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let val = reader.read_u8()?;
        if val != CHANGE_CIPHER_SPEC_TYPE {
            return Err(Error::DecodeError {
                offset: 0,
                reason: "invalid change_cipher_spec value".to_owned(),
            });
        }
        Ok(ChangeCipherSpec)
    }
}

#[cfg(test)]
mod change_cipher_spec_test {
    use super::*;

    #[test]
    fn rejects_anything_but_the_single_defined_value() {
        let err = ChangeCipherSpec::unmarshal(&mut &[0u8][..]).unwrap_err();
        assert!(matches!(err, Error::DecodeError { .. }));
        assert!(ChangeCipherSpec::unmarshal(&mut &[1u8][..]).is_ok());
    }
}
