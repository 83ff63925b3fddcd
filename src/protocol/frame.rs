//! Wire framing for the streaming response
//!
//! Every stream starts with a preamble (`<id>;<1024 spaces>;`) followed by
//! any number of frames (`<length>;<payload>;`). The length is the payload's
//! byte count, so payloads are never escaped and may contain `;`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ProtocolError, ProtocolResult};

/// Field terminator
pub const DELIMITER: u8 = b';';

/// Number of padding spaces sent once after the connection id.
///
/// Legacy streaming transports (WebKit XHR, XDomainRequest, hidden iframe)
/// hold back the first kilobyte of a response before exposing it.
pub const PADDING_LENGTH: usize = 1024;

/// Largest payload the decoder accepts (16 MiB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Longest connection id the decoder accepts
pub const MAX_ID_LENGTH: usize = 256;

/// Enough digits for any `usize`
const MAX_LENGTH_DIGITS: usize = 20;

/// Encode a payload as a single frame: `<length>;<payload>;`
pub fn encode(payload: &[u8]) -> Bytes {
    let length = payload.len().to_string();
    let mut frame = BytesMut::with_capacity(length.len() + payload.len() + 2);
    frame.put_slice(length.as_bytes());
    frame.put_u8(DELIMITER);
    frame.put_slice(payload);
    frame.put_u8(DELIMITER);
    frame.freeze()
}

/// Build the connection preamble: `<id>;<1024 spaces>;`
pub fn preamble(id: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(id.len() + PADDING_LENGTH + 2);
    out.put_slice(id.as_bytes());
    out.put_u8(DELIMITER);
    out.put_bytes(b' ', PADDING_LENGTH);
    out.put_u8(DELIMITER);
    out.freeze()
}

/// Incremental parser for the streaming wire format
///
/// Feed it chunks as they arrive with [`FrameDecoder::extend`], read the
/// preamble once with [`FrameDecoder::read_preamble`], then pull frames with
/// [`FrameDecoder::next_frame`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes received but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the preamble and return the connection id
    ///
    /// Returns `Ok(None)` until the whole preamble has been received.
    pub fn read_preamble(&mut self) -> ProtocolResult<Option<String>> {
        let Some(sep) = self.find_delimiter(MAX_ID_LENGTH) else {
            if self.buffer.len() > MAX_ID_LENGTH {
                return Err(ProtocolError::InvalidPreamble(format!(
                    "connection id exceeds {} bytes",
                    MAX_ID_LENGTH
                )));
            }
            return Ok(None);
        };

        let total = sep + 1 + PADDING_LENGTH + 1;
        let available = self.buffer.len().min(total);
        if let Some(pos) = self.buffer[sep + 1..available]
            .iter()
            .take(PADDING_LENGTH)
            .position(|b| *b != b' ')
        {
            return Err(ProtocolError::InvalidPreamble(format!(
                "unexpected byte in padding at offset {}",
                pos
            )));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }
        if self.buffer[total - 1] != DELIMITER {
            return Err(ProtocolError::InvalidPreamble(
                "padding is not terminated".to_string(),
            ));
        }

        let id = String::from_utf8(self.buffer[..sep].to_vec())
            .map_err(|e| ProtocolError::InvalidPreamble(e.to_string()))?;
        self.buffer.advance(total);
        Ok(Some(id))
    }

    /// Pop the next complete frame's payload
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Bytes>> {
        let Some(sep) = self.find_delimiter(MAX_LENGTH_DIGITS) else {
            if self.buffer.len() > MAX_LENGTH_DIGITS {
                return Err(ProtocolError::InvalidLength(
                    "length prefix is too long".to_string(),
                ));
            }
            return Ok(None);
        };

        let length = parse_length(&self.buffer[..sep])?;
        if length > MAX_FRAME_LENGTH {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        let total = sep + 1 + length + 1;
        if self.buffer.len() < total {
            return Ok(None);
        }
        if self.buffer[total - 1] != DELIMITER {
            return Err(ProtocolError::MissingDelimiter);
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(sep + 1);
        frame.truncate(length);
        Ok(Some(frame.freeze()))
    }

    fn find_delimiter(&self, limit: usize) -> Option<usize> {
        self.buffer
            .iter()
            .take(limit + 1)
            .position(|b| *b == DELIMITER)
    }
}

fn parse_length(digits: &[u8]) -> ProtocolResult<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidLength(
            String::from_utf8_lossy(digits).into_owned(),
        ));
    }
    // All ASCII digits, so this is valid UTF-8
    let text = std::str::from_utf8(digits)
        .map_err(|e| ProtocolError::InvalidLength(e.to_string()))?;
    text.parse::<usize>()
        .map_err(|e| ProtocolError::InvalidLength(e.to_string()))
}
