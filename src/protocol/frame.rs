//! Frame encoding and decoding for the controller serial link.
//!
//! Every data frame exchanged with the controller has this layout:
//! ```text
//! ┌──────┬──────┬──────┬──────────┬────────────┬──────────┐
//! │ 0x01 │ len  │ type │ function │  payload   │ checksum │
//! │  1   │  1   │  1   │    1     │  len - 3   │    1     │
//! └──────┴──────┴──────┴──────────┴────────────┴──────────┘
//! ```
//!
//! `len` counts everything after itself. The checksum is `0xff` XOR every
//! byte from `len` through the end of the payload. Byte-level ACK/NAK
//! handshaking is left to the transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Start-of-frame marker.
pub const SOF: u8 = 0x01;

/// Maximum size of a frame body (type + function + payload).
pub const MAX_FRAME_SIZE: usize = 254;

/// Smallest legal value of the length byte (type, function, checksum).
const MIN_LENGTH: usize = 3;

/// Computes the checksum over the length byte and frame body.
#[must_use]
pub fn checksum(length: u8, body: &[u8]) -> u8 {
    body.iter().fold(0xff ^ length, |acc, b| acc ^ b)
}

/// Encodes a frame body (type, function, payload) into a data frame.
///
/// # Errors
///
/// Returns `FrameError::TooLarge` if the body exceeds `MAX_FRAME_SIZE`.
pub fn encode(body: &[u8]) -> Result<Bytes, FrameError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if body.len() < 2 {
        return Err(FrameError::TooShort {
            need: 2,
            got: body.len(),
        });
    }

    // body.len() + 1 <= 255, checked above
    let length = (body.len() + 1) as u8;
    let mut buf = BytesMut::with_capacity(body.len() + 3);
    buf.put_u8(SOF);
    buf.put_u8(length);
    buf.put_slice(body);
    buf.put_u8(checksum(length, body));
    Ok(buf.freeze())
}

/// Frame decoder that handles partial data and line noise.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(Some(body))` with the type, function and payload bytes
    /// if a complete frame was decoded, `Ok(None)` if more data is needed.
    /// Bytes preceding a start-of-frame marker are discarded.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` if the length byte is impossible or the
    /// checksum does not match. The offending frame is dropped so the next
    /// call continues with the data after it.
    pub fn decode(&mut self) -> Result<Option<Bytes>, FrameError> {
        let garbage = self
            .buffer
            .iter()
            .position(|&b| b == SOF)
            .unwrap_or(self.buffer.len());
        self.buffer.advance(garbage);

        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let length = self.buffer[1] as usize;
        if length < MIN_LENGTH {
            self.buffer.advance(2);
            return Err(FrameError::TooShort {
                need: MIN_LENGTH,
                got: length,
            });
        }

        let total = 2 + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        let body = frame.slice(2..total - 1);
        let expected = checksum(frame[1], &body);
        let got = frame[total - 1];
        if expected != got {
            return Err(FrameError::Checksum { expected, got });
        }

        Ok(Some(body))
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_soft_reset() {
        // Request, SoftReset
        let frame = encode(&[0x00, 0x08]).unwrap();
        assert_eq!(&frame[..], &[0x01, 0x03, 0x00, 0x08, 0xf4]);
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let body = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode(&body),
            Err(FrameError::TooLarge { size: 255, .. })
        ));
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x01, 0x04, 0x01]);
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.feed(&[0x13, 0x01, 0xe8]);
        let body = decoder.decode().unwrap().unwrap();
        assert_eq!(&body[..], &[0x01, 0x13, 0x01]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_skips_garbage() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x06, 0x15, 0xaa]);
        decoder.feed(&encode(&[0x00, 0x0a, 0x00]).unwrap());

        let body = decoder.decode().unwrap().unwrap();
        assert_eq!(&body[..], &[0x00, 0x0a, 0x00]);
    }

    #[test]
    fn test_decode_bad_checksum_then_recovers() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x01, 0x03, 0x00, 0x08, 0x00]);
        decoder.feed(&encode(&[0x01, 0x16]).unwrap());

        assert!(matches!(
            decoder.decode(),
            Err(FrameError::Checksum { expected: 0xf4, got: 0x00 })
        ));
        let body = decoder.decode().unwrap().unwrap();
        assert_eq!(&body[..], &[0x01, 0x16]);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode(&[0x01, 0x13, 0x01]).unwrap());
        decoder.feed(&encode(&[0x00, 0x13, 0x05, 0x00]).unwrap());

        let first = decoder.decode().unwrap().unwrap();
        assert_eq!(&first[..], &[0x01, 0x13, 0x01]);
        let second = decoder.decode().unwrap().unwrap();
        assert_eq!(&second[..], &[0x00, 0x13, 0x05, 0x00]);
        assert_eq!(decoder.decode().unwrap(), None);
    }
}
