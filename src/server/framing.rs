//! Length-prefixed message framing.
//!
//! Each message on the wire is a 1-byte compressed flag, a 4-byte big-endian
//! length and the encoded message. Compressed messages are rejected.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame prefix.
pub const HEADER_LEN: usize = 5;

/// Frame one encoded message.
pub fn encode_frame(message: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + message.len());
    frame.put_u8(0);
    frame.put_u32(message.len() as u32);
    frame.put_slice(message);
    frame.freeze()
}

/// Reassembles messages from arbitrarily split body chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// The next complete message, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        if self.buffer[0] != 0 {
            return Err(ProtocolError::CompressedMessage);
        }

        let size = u32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]]) as usize;
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        if self.buffer.len() < HEADER_LEN + size {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        Ok(Some(self.buffer.split_to(size).freeze()))
    }

    /// No partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_reassemble() {
        let mut wire = encode_frame(b"hello").to_vec();
        wire.extend_from_slice(&encode_frame(b""));
        wire.extend_from_slice(&encode_frame(b"world"));

        let mut decoder = FrameDecoder::new(1024);
        let mut messages = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.push(chunk);
            while let Some(message) = decoder.next_message().unwrap() {
                messages.push(message);
            }
        }

        assert_eq!(messages, vec![Bytes::from_static(b"hello"), Bytes::new(), Bytes::from_static(b"world")]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_partial_frame_is_buffered() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&encode_frame(b"hello")[..7]);
        assert!(decoder.next_message().unwrap().is_none());
        assert!(!decoder.is_empty());
    }

    #[test]
    fn test_rejects_compressed_and_oversized() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&[1, 0, 0, 0, 1, 0]);
        assert!(matches!(decoder.next_message(), Err(ProtocolError::CompressedMessage)));

        let mut decoder = FrameDecoder::new(4);
        decoder.push(&encode_frame(b"too long"));
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::MessageTooLarge { size: 8, limit: 4 })
        ));
    }
}
