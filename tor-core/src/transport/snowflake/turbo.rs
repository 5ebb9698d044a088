//! Turbo framing: the bottom layer of the Snowflake transport, carried
//! directly over a WebSocket to the broker/proxy. Wire format: a 1-byte
//! header (bit 0 = padding flag) followed by a 2-byte big-endian length
//! and that many payload bytes.

use crate::cursor::{Reader, Writer};
use crate::error::{Result, TorError};

const PADDING_FLAG: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurboFrame {
    pub is_padding: bool,
    pub payload: Vec<u8>,
}

impl TurboFrame {
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            is_padding: false,
            payload,
        }
    }

    pub fn padding(len: usize) -> Self {
        Self {
            is_padding: true,
            payload: vec![0u8; len],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(3 + self.payload.len());
        w.write_u8(if self.is_padding { PADDING_FLAG } else { 0 });
        w.write_vec(2, &self.payload)?;
        Ok(w.into_bytes())
    }

    /// Decodes one frame, returning it and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(TorError::parse("empty turbo frame"));
        }
        let mut r = Reader::new(data);
        let header = r.read_u8()?;
        let payload = r.read_vec(2)?.to_vec();
        Ok((
            Self {
                is_padding: header & PADDING_FLAG != 0,
                payload,
            },
            r.pos(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_frame() {
        let frame = TurboFrame::data(b"hello kcp".to_vec());
        let bytes = frame.encode().unwrap();
        let (decoded, consumed) = TurboFrame::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_padding_frame() {
        let frame = TurboFrame::padding(16);
        let bytes = frame.encode().unwrap();
        let (decoded, _) = TurboFrame::decode(&bytes).unwrap();
        assert!(decoded.is_padding);
        assert_eq!(decoded.payload.len(), 16);
    }

    #[test]
    fn decode_consumes_exactly_one_frame_from_a_longer_buffer() {
        let mut bytes = TurboFrame::data(b"first".to_vec()).encode().unwrap();
        bytes.extend_from_slice(&TurboFrame::data(b"second".to_vec()).encode().unwrap());
        let (first, consumed) = TurboFrame::decode(&bytes).unwrap();
        assert_eq!(first.payload, b"first");
        let (second, _) = TurboFrame::decode(&bytes[consumed..]).unwrap();
        assert_eq!(second.payload, b"second");
    }
}
