use std::io::{Read, Write};

use crate::error::Result;

// https://tools.ietf.org/html/rfc5246#section-7.4.5: empty body, its
// presence alone signals the end of the ServerHello flight.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ServerHelloDone;

impl ServerHelloDone {
    pub fn marshal<W: Write>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }

    pub fn unmarshal<R: Read>(_reader: &mut R) -> Result<Self> {
        Ok(ServerHelloDone)
    }
}
