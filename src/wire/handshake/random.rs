use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;

use crate::error::Result;

pub const HANDSHAKE_RANDOM_LENGTH: usize = 32;
pub const HANDSHAKE_RANDOM_BYTES_LENGTH: usize = 28;

// https://tools.ietf.org/html/rfc5246#section-7.4.1.2
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HandshakeRandom {
    pub gmt_unix_time_secs: u32,
    pub random_bytes: [u8; HANDSHAKE_RANDOM_BYTES_LENGTH],
}

impl Default for HandshakeRandom {
    fn default() -> Self {
        HandshakeRandom {
            gmt_unix_time_secs: 0,
            random_bytes: [0u8; HANDSHAKE_RANDOM_BYTES_LENGTH],
        }
    }
}

impl HandshakeRandom {
    pub fn populate(&mut self) {
        self.gmt_unix_time_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        rand::thread_rng().fill_bytes(&mut self.random_bytes);
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.gmt_unix_time_secs)?;
        writer.write_all(&self.random_bytes)?;
        Ok(())
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let gmt_unix_time_secs = reader.read_u32::<BigEndian>()?;
        let mut random_bytes = [0u8; HANDSHAKE_RANDOM_BYTES_LENGTH];
        reader.read_exact(&mut random_bytes)?;
        Ok(HandshakeRandom {
            gmt_unix_time_secs,
            random_bytes,
        })
    }

    pub fn to_bytes(self) -> [u8; HANDSHAKE_RANDOM_LENGTH] {
        let mut out = [0u8; HANDSHAKE_RANDOM_LENGTH];
        out[..4].copy_from_slice(&self.gmt_unix_time_secs.to_be_bytes());
        out[4..].copy_from_slice(&self.random_bytes);
        out
    }
}
