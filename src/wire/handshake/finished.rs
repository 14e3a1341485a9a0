use std::io::{Read, Write};

use crate::error::Result;

// https://tools.ietf.org/html/rfc5246#section-7.4.9
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    pub verify_data: Vec<u8>,
}

impl Finished {
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.verify_data)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let mut verify_data = vec![];
        reader.read_to_end(&mut verify_data)?;
        Ok(Finished { verify_data })
    }
}
