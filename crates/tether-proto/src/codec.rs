//! Newline-delimited line codec for tokio transports.
//!
//! Frames are capped at 512 bytes per RFC 1459. Decoding is lossy on
//! invalid UTF-8: upstream networks occasionally relay latin-1 traffic and
//! a bouncer must not drop the connection over it.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Line codec with the standard IRC length limit.
pub struct LineCodec {
    next_index: usize,
    max_len: usize,
}

impl LineCodec {
    /// Codec with the standard 512-byte limit.
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_len: 512,
        }
    }

    /// Codec with a custom limit, for tests.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if line.len() > self.max_len {
                return Err(ProtocolError::LineTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }

            let text = String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            Ok(Some(text))
        } else {
            self.next_index = src.len();
            if src.len() > self.max_len {
                return Err(ProtocolError::LineTooLong {
                    actual: src.len(),
                    limit: self.max_len,
                });
            }
            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :tok\r\nPART");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("PING :tok".into()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"PART");
    }

    #[test]
    fn rejects_oversized() {
        let mut codec = LineCodec::with_max_len(8);
        let mut buf = BytesMut::from("0123456789\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::LineTooLong { .. })
        ));
    }

    #[test]
    fn lossy_on_invalid_utf8() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"PRIVMSG #a :caf\xe9\r\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert!(line.starts_with("PRIVMSG #a :caf"));
    }

    #[test]
    fn encodes_with_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("PONG :tok".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG :tok\r\n");
    }
}
