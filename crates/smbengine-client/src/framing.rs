//! Transport framing: a 4-byte big-endian length prefix before every message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ClientError, Result};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Prefixes `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ClientError::request(format!("{} byte message does not fit a frame", payload.len())))?;
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.put_u32(len);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Accumulates received bytes and yields complete frame payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// A decoder rejecting frames larger than `max_frame_size`.
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
        }
    }

    /// Appends bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Splits off the next complete payload, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len > self.max_frame_size {
            return Err(ClientError::bad_packet(format!(
                "frame of {len} bytes exceeds limit {}",
                self.max_frame_size
            )));
        }
        let total = LENGTH_PREFIX_SIZE + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len as usize).freeze()))
    }

    /// Reads from `reader` until a full frame is available. `Ok(None)` on a
    /// clean end of stream between frames.
    pub async fn read_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            let n = reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ClientError::bad_packet(format!(
                    "stream ended inside a frame with {} bytes buffered",
                    self.buf.len()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefix_is_big_endian() {
        let frame = encode_frame(&[0xAA; 0x0102]).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 1, 2]);
        assert_eq!(frame.len(), 4 + 0x0102);
    }

    #[test]
    fn test_partial_frames_accumulate() {
        let mut decoder = FrameDecoder::new(1024);
        let frame = encode_frame(b"hello").unwrap();
        decoder.extend(&frame[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[3..7]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[7..]);
        decoder.extend(&encode_frame(b"xy").unwrap());
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"hello");
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"xy");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.extend(&[0, 0, 0, 17]);
        assert!(matches!(decoder.next_frame(), Err(ClientError::BadPacket { .. })));
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let frame = encode_frame(&[7u8; 100]).unwrap();
            for chunk in frame.chunks(9) {
                server.write_all(chunk).await.unwrap();
            }
        });
        let mut decoder = FrameDecoder::new(1024);
        let payload = decoder.read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(payload.len(), 100);
        assert!(decoder.read_frame(&mut client).await.unwrap().is_none());
    }
}
