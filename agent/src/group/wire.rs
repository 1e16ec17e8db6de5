//! Frame codec shared by the group channels, the barrier and the worker bootstrap
//!
//! Object frames: u32 big-endian length + CBOR body.
//! Payload frames: u64 big-endian length + raw bytes.

use serde::{de::DeserializeOwned, Serialize};
use std::io::{self, Read, Write};

/// Maximum size of one CBOR object frame (64MB)
pub const OBJECT_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Encode a CBOR object body, enforcing the frame size limit
pub fn encode_object<M: Serialize>(message: &M) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    if buf.len() > OBJECT_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message size {} exceeds limit {}", buf.len(), OBJECT_SIZE_LIMIT),
        ));
    }
    Ok(buf)
}

/// Write a body produced by [`encode_object`] as one object frame
pub fn write_encoded<W: Write>(io: &mut W, body: &[u8]) -> io::Result<()> {
    io.write_all(&(body.len() as u32).to_be_bytes())?;
    io.write_all(body)?;
    io.flush()
}

/// Write a length-prefixed CBOR message
pub fn write_object<W: Write, M: Serialize>(io: &mut W, message: &M) -> io::Result<()> {
    write_encoded(io, &encode_object(message)?)
}

/// Read a length-prefixed CBOR message
pub fn read_object<R: Read, M: DeserializeOwned>(io: &mut R) -> io::Result<M> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > OBJECT_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message size {} exceeds limit {}", len, OBJECT_SIZE_LIMIT),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf)?;
    ciborium::from_reader(&buf[..])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Write a raw payload frame
pub fn write_payload<W: Write>(io: &mut W, data: &[u8]) -> io::Result<()> {
    io.write_all(&(data.len() as u64).to_be_bytes())?;
    io.write_all(data)?;
    io.flush()
}

/// Read a raw payload frame into a buffer already sized for it
pub fn read_payload_into<R: Read>(io: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut len_buf = [0u8; 8];
    io.read_exact(&mut len_buf)?;
    let len = u64::from_be_bytes(len_buf);
    if len != buf.len() as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Payload of {} bytes does not fit {} byte buffer", len, buf.len()),
        ));
    }
    io.read_exact(buf)
}
