//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len == 126/127) |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! - [`parse_header`]: Validate and measure a frame header against a buffer
//! - [`decode`] / [`decode_frame`]: Parse one frame out of a byte buffer
//! - [`encode_text`]: Build an unmasked server text frame
//! - [`encode_masked`]: Build a masked client frame
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3
//! - [`read_frame_bytes`]: Pull exactly one raw frame off a byte stream

use std::io::Read;

use crate::error::{FrameError, WsError};

/// Default cap on a single payload (64 MiB) so a malicious 64-bit length
/// cannot force a huge allocation.
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Largest possible header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
///
/// Reserved values are kept rather than rejected: the server ignores any
/// opcode other than text and close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    /// The 4-bit wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(value) => value & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

impl From<u8> for Opcode {
    /// Only the low nibble is considered.
    fn from(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }
}

/// Everything the first bytes of a frame say about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    /// RSV1-3 as a 3-bit value. Parsed, never acted upon.
    pub rsv: u8,
    pub opcode: Opcode,
    pub masked: bool,
    pub mask_key: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Bytes occupied by the header, including extended length and mask key.
    pub header_len: usize,
}

impl FrameHeader {
    /// Total encoded size of the frame this header describes.
    pub fn frame_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// A decoded WebSocket frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit. Fragmented messages are not reassembled, so every frame is
    /// treated as a complete message regardless of this flag.
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Interpret the payload as UTF-8 text.
    pub fn into_text(self) -> Result<String, FrameError> {
        String::from_utf8(self.payload).map_err(|_| FrameError::InvalidUtf8)
    }
}

/// Apply or remove the 4-byte XOR mask on a payload.
///
/// Works a 32-bit word at a time and finishes the tail byte by byte. The
/// output is identical to `payload[i] ^= key[i % 4]`, and applying the same
/// key twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    let word_mask = u32::from_ne_bytes(key);
    let mut words = payload.chunks_exact_mut(4);
    for word in &mut words {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ word_mask;
        word.copy_from_slice(&value.to_ne_bytes());
    }
    // The tail starts on a multiple of 4, so it lines up with key[0].
    for (byte, k) in words.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}

/// Extra length bytes implied by the 7-bit length selector.
fn extended_len_bytes(selector: u8) -> usize {
    match selector {
        126 => 2,
        127 => 8,
        _ => 0,
    }
}

/// Parse the frame header at the start of `buf`.
///
/// Only the header has to be present; the payload is not checked here.
/// Lengths above `max_payload` are rejected before anything is allocated.
pub fn parse_header(buf: &[u8], max_payload: u64) -> Result<FrameHeader, FrameError> {
    if buf.len() < 2 {
        return Err(FrameError::Truncated {
            needed: 2,
            available: buf.len(),
        });
    }

    // Byte 0: FIN(1) RSV(3) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    let fin = buf[0] & 0x80 != 0;
    let rsv = (buf[0] >> 4) & 0x07;
    let opcode = Opcode::from(buf[0]);
    let masked = buf[1] & 0x80 != 0;
    let selector = buf[1] & 0x7F;

    let header_len = 2 + extended_len_bytes(selector) + if masked { 4 } else { 0 };
    if buf.len() < header_len {
        return Err(FrameError::Truncated {
            needed: header_len,
            available: buf.len(),
        });
    }

    let payload_len = match selector {
        126 => u16::from_be_bytes([buf[2], buf[3]]) as u64,
        127 => {
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(len);
            if len >> 63 != 0 {
                return Err(FrameError::LengthMsbSet);
            }
            len
        }
        literal => literal as u64,
    };

    if payload_len > max_payload {
        return Err(FrameError::TooLarge {
            len: payload_len,
            max: max_payload,
        });
    }

    let mask_key = if masked {
        let at = header_len - 4;
        Some([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        rsv,
        opcode,
        masked,
        mask_key,
        payload_len,
        header_len,
    })
}

/// Decode the frame at the start of `buf`, returning it together with the
/// number of bytes it occupied.
///
/// Anything after the first frame is left untouched; the caller decides
/// what to do with it.
pub fn decode_frame(buf: &[u8], max_payload: u64) -> Result<(Frame, usize), FrameError> {
    let header = parse_header(buf, max_payload)?;
    let available = buf.len() - header.header_len;
    if header.payload_len > available as u64 {
        return Err(FrameError::PayloadOutOfBounds {
            declared: header.payload_len,
            available,
        });
    }

    let end = header.header_len + header.payload_len as usize;
    let mut payload = buf[header.header_len..end].to_vec();
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin: header.fin,
        opcode: header.opcode,
        masked: header.masked,
        mask_key: header.mask_key,
        payload,
    };
    Ok((frame, end))
}

/// Decode a buffer believed to hold exactly one frame, with the default
/// payload cap.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    decode_frame(buf, DEFAULT_MAX_PAYLOAD).map(|(frame, _)| frame)
}

/// Write the FIN/opcode byte and the tiered length into `out`.
fn push_header(out: &mut Vec<u8>, opcode: Opcode, len: usize, mask_bit: u8) {
    out.push(0x80 | opcode.as_u8());
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 65535 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Header size for an unmasked frame carrying `len` payload bytes.
pub fn header_len_for(len: usize) -> usize {
    2 + match len {
        0..=125 => 0,
        126..=65535 => 2,
        _ => 8,
    }
}

/// Encode a final, unmasked frame (server to client, RFC 6455 Section 5.1).
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len_for(payload.len()) + payload.len());
    push_header(&mut out, opcode, payload.len(), 0x00);
    out.extend_from_slice(payload);
    out
}

/// Encode a text message as a single final unmasked text frame.
///
/// Byte 0 is always `0x81`. The buffer is allocated once at its final size.
pub fn encode_text(message: &str) -> Vec<u8> {
    encode(Opcode::Text, message.as_bytes())
}

/// Encode a final frame masked with `key`, the way a client sends it.
pub fn encode_masked(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let header_len = header_len_for(payload.len()) + 4;
    let mut out = Vec::with_capacity(header_len + payload.len());
    push_header(&mut out, opcode, payload.len(), 0x80);
    out.extend_from_slice(&key);
    out.extend_from_slice(payload);
    apply_mask(&mut out[header_len..], key);
    out
}

/// Read exactly one frame off `reader` and return its raw (still masked)
/// bytes.
///
/// Reads the two fixed header bytes, then the rest of the header, then the
/// payload, all with `read_exact`. The length limit is checked before the
/// payload buffer is allocated.
pub fn read_frame_bytes<R: Read>(reader: &mut R, max_payload: u64) -> Result<Vec<u8>, WsError> {
    let mut head = [0u8; MAX_HEADER_LEN];
    reader.read_exact(&mut head[..2])?;

    let masked = head[1] & 0x80 != 0;
    let header_len = 2 + extended_len_bytes(head[1] & 0x7F) + if masked { 4 } else { 0 };
    reader.read_exact(&mut head[2..header_len])?;

    let header = parse_header(&head[..header_len], max_payload)?;

    let mut raw = Vec::with_capacity(header.frame_len() as usize);
    raw.extend_from_slice(&head[..header_len]);
    raw.resize(header.frame_len() as usize, 0);
    reader.read_exact(&mut raw[header_len..])?;
    Ok(raw)
}
