//! Reply framing
//!
//! The serial link delivers bytes in arbitrary chunks. [`MessageFramer`]
//! glues them back into complete length-prefixed messages:
//! - `AwaitingLength`: fewer than 2 bytes buffered
//! - `AwaitingBody`: length known, waiting for the rest of the message
//!
//! ```
//! use ev3dc_core::protocol::MessageFramer;
//!
//! let mut framer = MessageFramer::new();
//! assert!(framer.push(&[0x03, 0x00, 0xbb]).is_empty());
//! let messages = framer.push(&[0xbb, 0xbb, 0x04, 0x00]);
//! assert_eq!(messages.len(), 1);
//! assert_eq!(framer.buffered(), 2);
//! ```

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::debug;

use super::Ev3Error;

/// Size of the length prefix
const LENGTH_PREFIX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingLength,
    AwaitingBody { message_len: usize },
}

/// Reassembles reply messages from a byte stream
#[derive(Debug)]
pub struct MessageFramer {
    buffer: BytesMut,
    state: State,
}

impl MessageFramer {
    /// Create a framer waiting for a length prefix
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            state: State::AwaitingLength,
        }
    }

    /// Append a chunk and return every message it completes
    ///
    /// Bytes past the last complete message are kept as the start of the
    /// next one.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one() {
            messages.push(message);
        }
        messages
    }

    /// Flush whatever is left at end of stream
    ///
    /// A trailing partial message is emitted as-is; the header decoder
    /// rejects it on the length check.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.state = State::AwaitingLength;
        if self.buffer.is_empty() {
            None
        } else {
            debug!("flushing {} leftover bytes at end of stream", self.buffer.len());
            Some(self.buffer.split().freeze())
        }
    }

    /// Number of bytes held for an incomplete message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and start over
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingLength;
    }

    fn try_extract_one(&mut self) -> Option<Bytes> {
        if let State::AwaitingLength = self.state {
            if self.buffer.len() < LENGTH_PREFIX {
                return None;
            }
            let declared = LittleEndian::read_u16(&self.buffer[..LENGTH_PREFIX]) as usize;
            self.state = State::AwaitingBody {
                message_len: declared + LENGTH_PREFIX,
            };
        }

        match self.state {
            State::AwaitingBody { message_len } if self.buffer.len() >= message_len => {
                self.state = State::AwaitingLength;
                Some(self.buffer.split_to(message_len).freeze())
            }
            _ => None,
        }
    }
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageFramer {
    type Item = Bytes;
    type Error = Ev3Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Ev3Error> {
        if !src.is_empty() {
            self.buffer.extend_from_slice(src);
            src.clear();
        }
        Ok(self.try_extract_one())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Ev3Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => Ok(self.finish()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(body_len: usize, fill: u8) -> Vec<u8> {
        let mut msg = vec![fill; body_len + 2];
        LittleEndian::write_u16(&mut msg[..2], body_len as u16);
        msg
    }

    #[test]
    fn test_single_message() {
        let mut framer = MessageFramer::new();
        let input = [0x03, 0x00, 0xbb, 0xbb, 0xbb];
        let messages = framer.push(&input);
        assert_eq!(messages, vec![Bytes::copy_from_slice(&input)]);
        assert_eq!(framer.buffered(), 0);
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_big_message() {
        let mut framer = MessageFramer::new();
        let input = message(1022, 0xbb);
        let messages = framer.push(&input);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_ref(), input.as_slice());
    }

    #[test]
    fn test_one_chunk_two_messages() {
        let mut framer = MessageFramer::new();
        let messages = framer.push(&[
            0x03, 0x00, 0xbb, 0xbb, 0xbb, 0x04, 0x00, 0xbb, 0xbb, 0xbb, 0xbb,
        ]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].len(), 5);
        assert_eq!(messages[1].len(), 6);
    }

    #[test]
    fn test_two_chunks_with_overlap() {
        let mut framer = MessageFramer::new();
        assert!(framer.push(&[0x03, 0x00, 0xbb, 0xbb]).is_empty());

        let first = framer.push(&[0xbb, 0x04, 0x00, 0xbb, 0xbb, 0xbb, 0xbb]);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].len(), 5);
        assert_eq!(first[1].len(), 6);
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_chunk_completes_one_and_starts_another() {
        let mut framer = MessageFramer::new();
        assert!(framer.push(&[0x03, 0x00, 0xbb, 0xbb]).is_empty());

        let messages = framer.push(&[0xbb, 0x04, 0x00, 0xbb]);
        assert_eq!(messages.len(), 1);
        assert_eq!(framer.buffered(), 3);

        let messages = framer.push(&[0xbb, 0xbb, 0xbb]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len(), 6);
    }

    #[test]
    fn test_every_split_pattern() {
        let mut input = Vec::new();
        input.extend(message(3, 0x11));
        input.extend(message(0, 0x22));
        input.extend(message(8, 0x33));
        input.extend(message(1, 0x44));

        for chunk_size in 1..=input.len() {
            let mut framer = MessageFramer::new();
            let mut out = Vec::new();
            for chunk in input.chunks(chunk_size) {
                out.extend(framer.push(chunk));
            }
            assert_eq!(out.len(), 4, "chunk size {}", chunk_size);
            assert_eq!(out.concat(), input, "chunk size {}", chunk_size);
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn test_leftover_emitted_on_finish() {
        let mut framer = MessageFramer::new();
        assert!(framer.push(&[0x05, 0x00, 0x01]).is_empty());
        assert_eq!(
            framer.finish(),
            Some(Bytes::from_static(&[0x05, 0x00, 0x01]))
        );
        assert_eq!(framer.buffered(), 0);

        // framing restarts cleanly after the flush
        let messages = framer.push(&[0x01, 0x00, 0xAA]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_single_length_byte_is_held() {
        let mut framer = MessageFramer::new();
        assert!(framer.push(&[0x03]).is_empty());
        assert!(framer.push(&[0x00, 1, 2]).is_empty());
        assert_eq!(framer.push(&[3]).len(), 1);
    }

    #[test]
    fn test_decoder_impl() {
        let mut framer = MessageFramer::new();
        let mut src = BytesMut::from(&[0x03, 0x00, 1, 2, 3, 0x02, 0x00, 9][..]);

        let first = framer.decode(&mut src).unwrap();
        assert_eq!(first.as_deref(), Some(&[0x03, 0x00, 1, 2, 3][..]));
        assert!(src.is_empty());
        assert_eq!(framer.decode(&mut src).unwrap(), None);

        let leftover = framer.decode_eof(&mut src).unwrap();
        assert_eq!(leftover.as_deref(), Some(&[0x02, 0x00, 9][..]));
        assert_eq!(framer.decode_eof(&mut src).unwrap(), None);
    }
}
