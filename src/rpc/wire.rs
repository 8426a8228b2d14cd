//! Frame codec for [`super::Channel`]: a 4-byte little-endian length prefix
//! followed by a bincode-encoded [`Envelope`], mirroring the length-prefixed
//! framing a raw stream socket needs when the transport itself (unlike the
//! teacher's ALPC/MS-RPC binding) gives no message boundaries for free.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Serialize, Deserialize)]
pub enum Envelope {
    Request { id: u64, method: String, body: Vec<u8> },
    Response { id: u64, body: Vec<u8> },
}

const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub fn write_frame<W: Write>(w: &mut W, envelope: &Envelope) -> Result<(), BridgeError> {
    let bytes = bincode::serialize(envelope)?;
    let len: u32 = bytes
        .len()
        .try_into()
        .map_err(|_| BridgeError::Encoding(Box::new(bincode::ErrorKind::SizeLimit)))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Envelope, BridgeError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).map_err(|_| BridgeError::TransportClosed)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(BridgeError::Encoding(Box::new(bincode::ErrorKind::SizeLimit)));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(|_| BridgeError::TransportClosed)?;
    Ok(bincode::deserialize(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trips_through_a_buffer() {
        let mut buf = Vec::new();
        let envelope = Envelope::Request {
            id: 42,
            method: "call".to_string(),
            body: vec![1, 2, 3],
        };
        write_frame(&mut buf, &envelope).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).unwrap();
        match decoded {
            Envelope::Request { id, method, body } => {
                assert_eq!(id, 42);
                assert_eq!(method, "call");
                assert_eq!(body, vec![1, 2, 3]);
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn truncated_stream_is_transport_closed() {
        let mut cursor = Cursor::new(vec![5, 0, 0, 0, 1, 2]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, BridgeError::TransportClosed));
    }
}
