//! Wire codec: message serialization, compression and framing.
//!
//! Two framings share the same serialized payloads.
//!
//! Datagram frames (one per reassembled ARQ message):
//!
//! ```text
//! +--------+-------------------+-----------------+
//! | opcode | length (4 bytes)  | payload         |
//! | u8     | u32 little-endian | (length bytes)  |
//! +--------+-------------------+-----------------+
//! ```
//!
//! [`Opcode::Heartbeat`] is the single byte `0x00` with no length or payload.
//!
//! Socket frame bodies (carried inside the `u32` length prefix of
//! [`crate::framing`], or as an HTTP body by the poll channel):
//!
//! ```text
//! payload                               plain single message
//! 0xAA 0xBB | lz4 payload               compressed single message
//! 0xAA 0xBC | (u24 LE length, payload)* batch of plain messages
//! ```
//!
//! The default envelope is a MessagePack map, whose first byte is always
//! `0x80..=0x8F`, `0xDE` or `0xDF`, so a leading `0xAA` is never a payload.

use std::sync::Arc;

use crate::compression::{self, CompressionConfig, CompressionError};
use crate::message::{Message, MsgPackCodec, PayloadCodec, PayloadError};

/// First marker byte of a socket frame body.
pub const STREAM_MARKER: u8 = 0xAA;
/// Second marker byte: single compressed message.
pub const STREAM_COMPRESSED: u8 = 0xBB;
/// Second marker byte: batch of length-prefixed messages.
pub const STREAM_BATCH: u8 = 0xBC;

/// Largest element a batch can carry (24-bit length).
pub const MAX_BATCH_ELEMENT: usize = 0x00FF_FFFF;

const DATAGRAM_HEADER: usize = 5;

/// One-byte datagram frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Keepalive, no length or payload.
    Heartbeat = 0x00,
    /// Client to server message.
    Request = 0x01,
    /// Server to client message.
    Response = 0x02,
    /// Compressed [`Opcode::Request`].
    RequestCompressed = 0x03,
    /// Compressed [`Opcode::Response`].
    ResponseCompressed = 0x04,
    /// Handshake exchange that precedes any data.
    Handshake = 0x05,
}

impl Opcode {
    /// Parse an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Opcode::Heartbeat,
            0x01 => Opcode::Request,
            0x02 => Opcode::Response,
            0x03 => Opcode::RequestCompressed,
            0x04 => Opcode::ResponseCompressed,
            0x05 => Opcode::Handshake,
            _ => return None,
        })
    }

    /// Whether the payload of this opcode is LZ4-compressed.
    pub fn is_compressed(self) -> bool {
        matches!(self, Opcode::RequestCompressed | Opcode::ResponseCompressed)
    }

    fn compressed(self) -> Self {
        match self {
            Opcode::Request => Opcode::RequestCompressed,
            Opcode::Response => Opcode::ResponseCompressed,
            other => other,
        }
    }
}

/// A parsed datagram frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramFrame {
    /// Keepalive.
    Heartbeat,
    /// Handshake payload (never compressed).
    Handshake(Vec<u8>),
    /// Data frame; the payload is already decompressed.
    Data {
        /// Uncompressed opcode ([`Opcode::Request`] or [`Opcode::Response`]).
        opcode: Opcode,
        /// Serialized message payload.
        payload: Vec<u8>,
    },
}

/// Codec tuning.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// When to compress serialized payloads.
    pub compression: CompressionConfig,
    /// Upper bound for any single payload, compressed or not. Default: 16 MiB.
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

/// Errors produced while decoding inbound bytes.
///
/// A decode error only ever drops the offending frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Zero-length input.
    #[error("empty frame")]
    Empty,
    /// Input ended inside a header.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },
    /// A declared length disagrees with the bytes present.
    #[error("declared length {declared} but {available} bytes available")]
    LengthMismatch {
        /// Declared payload length.
        declared: usize,
        /// Bytes actually present.
        available: usize,
    },
    /// A declared length exceeds the configured frame limit.
    #[error("frame size {size} exceeds maximum {max}")]
    Oversized {
        /// Declared size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Unrecognized datagram opcode.
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    /// A valid opcode arrived where a data frame was required.
    #[error("unexpected opcode {0:?}")]
    UnexpectedOpcode(Opcode),
    /// Unrecognized second byte after `0xAA`.
    #[error("unknown stream marker 0xAA 0x{0:02X}")]
    UnknownMarker(u8),
    /// Decompression failed.
    #[error(transparent)]
    Decompress(#[from] CompressionError),
    /// The payload bytes are not valid MessagePack.
    #[error("payload: {0}")]
    Payload(PayloadError),
    /// The payload decoded but is not a message envelope.
    #[error("schema: {0}")]
    Schema(String),
}

impl From<PayloadError> for DecodeError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::Schema(s) => DecodeError::Schema(s),
            other => DecodeError::Payload(other),
        }
    }
}

/// Errors produced while encoding outbound messages.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The payload codec failed.
    #[error("payload: {0}")]
    Payload(#[from] PayloadError),
    /// The frame would exceed a length field or the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Actual size.
        size: usize,
        /// Applicable maximum.
        max: usize,
    },
}

/// Encodes and decodes [`Message`]s for every channel kind.
pub struct WireCodec {
    config: CodecConfig,
    payload: Arc<dyn PayloadCodec>,
}

impl std::fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireCodec")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default(), Arc::new(MsgPackCodec))
    }
}

impl WireCodec {
    /// Create a codec over the given payload serializer.
    pub fn new(config: CodecConfig, payload: Arc<dyn PayloadCodec>) -> Self {
        Self { config, payload }
    }

    /// Codec configuration.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Payload
    // -----------------------------------------------------------------------

    /// Serialize a message into payload bytes.
    pub fn serialize(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        let bytes = self.payload.serialize(message)?;
        self.check_size(bytes.len())?;
        Ok(bytes)
    }

    /// Deserialize payload bytes into a message.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Message, DecodeError> {
        Ok(self.payload.deserialize(bytes)?)
    }

    // -----------------------------------------------------------------------
    // Datagram framing
    // -----------------------------------------------------------------------

    /// Encode a client message as one datagram frame.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        let payload = self.serialize(message)?;
        self.frame_datagram(Opcode::Request, &payload)
    }

    /// Decode one datagram frame carrying a message.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, DecodeError> {
        match self.parse_datagram(frame)? {
            DatagramFrame::Data { payload, .. } => self.deserialize(&payload),
            DatagramFrame::Heartbeat => Err(DecodeError::UnexpectedOpcode(Opcode::Heartbeat)),
            DatagramFrame::Handshake(_) => Err(DecodeError::UnexpectedOpcode(Opcode::Handshake)),
        }
    }

    /// Frame a serialized payload under `opcode`, compressing data frames
    /// that reach the threshold.
    pub fn frame_datagram(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
        if opcode == Opcode::Heartbeat {
            return Ok(vec![Opcode::Heartbeat as u8]);
        }

        let is_data = matches!(opcode, Opcode::Request | Opcode::Response);
        let (opcode, body) = if is_data && self.config.compression.should_compress(payload.len()) {
            (opcode.compressed(), compression::compress(payload))
        } else {
            (opcode, payload.to_vec())
        };
        let len = u32::try_from(body.len()).map_err(|_| EncodeError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;

        let mut out = Vec::with_capacity(DATAGRAM_HEADER + body.len());
        out.push(opcode as u8);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse one datagram frame, decompressing if needed.
    pub fn parse_datagram(&self, frame: &[u8]) -> Result<DatagramFrame, DecodeError> {
        let &first = frame.first().ok_or(DecodeError::Empty)?;
        let opcode = Opcode::from_byte(first).ok_or(DecodeError::UnknownOpcode(first))?;
        if opcode == Opcode::Heartbeat {
            return Ok(DatagramFrame::Heartbeat);
        }

        let header: [u8; 4] = frame
            .get(1..DATAGRAM_HEADER)
            .and_then(|h| h.try_into().ok())
            .ok_or(DecodeError::Truncated {
                needed: DATAGRAM_HEADER,
                available: frame.len(),
            })?;
        let declared = u32::from_le_bytes(header) as usize;
        if declared > self.config.max_frame_size {
            return Err(DecodeError::Oversized {
                size: declared,
                max: self.config.max_frame_size,
            });
        }
        let body = &frame[DATAGRAM_HEADER..];
        if declared != body.len() {
            return Err(DecodeError::LengthMismatch {
                declared,
                available: body.len(),
            });
        }

        Ok(match opcode {
            Opcode::Handshake => DatagramFrame::Handshake(body.to_vec()),
            Opcode::RequestCompressed => DatagramFrame::Data {
                opcode: Opcode::Request,
                payload: compression::decompress(body, self.config.max_frame_size)?,
            },
            Opcode::ResponseCompressed => DatagramFrame::Data {
                opcode: Opcode::Response,
                payload: compression::decompress(body, self.config.max_frame_size)?,
            },
            data => DatagramFrame::Data {
                opcode: data,
                payload: body.to_vec(),
            },
        })
    }

    // -----------------------------------------------------------------------
    // Stream framing
    // -----------------------------------------------------------------------

    /// Build a socket frame body for one serialized payload.
    pub fn frame_stream(&self, payload: &[u8]) -> Vec<u8> {
        if self.config.compression.should_compress(payload.len()) {
            let packed = compression::compress(payload);
            let mut out = Vec::with_capacity(2 + packed.len());
            out.extend_from_slice(&[STREAM_MARKER, STREAM_COMPRESSED]);
            out.extend_from_slice(&packed);
            out
        } else {
            payload.to_vec()
        }
    }

    /// Build a socket frame body carrying several serialized payloads.
    ///
    /// A single payload is framed with [`WireCodec::frame_stream`]; more than
    /// one become a batch of plain elements.
    pub fn frame_batch<P: AsRef<[u8]>>(&self, payloads: &[P]) -> Result<Vec<u8>, EncodeError> {
        if let [single] = payloads {
            return Ok(self.frame_stream(single.as_ref()));
        }

        let total: usize = payloads.iter().map(|p| 3 + p.as_ref().len()).sum();
        let mut out = Vec::with_capacity(2 + total);
        out.extend_from_slice(&[STREAM_MARKER, STREAM_BATCH]);
        for payload in payloads {
            let payload = payload.as_ref();
            if payload.len() > MAX_BATCH_ELEMENT {
                return Err(EncodeError::FrameTooLarge {
                    size: payload.len(),
                    max: MAX_BATCH_ELEMENT,
                });
            }
            let len = (payload.len() as u32).to_le_bytes();
            out.extend_from_slice(&len[..3]);
            out.extend_from_slice(payload);
        }
        Ok(out)
    }

    /// Split a socket frame body into serialized payloads.
    pub fn parse_stream(&self, body: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
        if body.is_empty() {
            return Err(DecodeError::Empty);
        }
        if body[0] != STREAM_MARKER {
            return Ok(vec![body.to_vec()]);
        }

        let &marker = body.get(1).ok_or(DecodeError::Truncated {
            needed: 2,
            available: body.len(),
        })?;
        match marker {
            STREAM_COMPRESSED => Ok(vec![compression::decompress(
                &body[2..],
                self.config.max_frame_size,
            )?]),
            STREAM_BATCH => {
                let mut rest = &body[2..];
                let mut out = Vec::new();
                while !rest.is_empty() {
                    if rest.len() < 3 {
                        return Err(DecodeError::Truncated {
                            needed: 3,
                            available: rest.len(),
                        });
                    }
                    let declared = u32::from_le_bytes([rest[0], rest[1], rest[2], 0]) as usize;
                    rest = &rest[3..];
                    if declared > rest.len() {
                        return Err(DecodeError::LengthMismatch {
                            declared,
                            available: rest.len(),
                        });
                    }
                    let (element, tail) = rest.split_at(declared);
                    out.push(element.to_vec());
                    rest = tail;
                }
                Ok(out)
            }
            other => Err(DecodeError::UnknownMarker(other)),
        }
    }

    /// Encode messages into one socket frame body.
    pub fn encode_batch(&self, messages: &[Message]) -> Result<Vec<u8>, EncodeError> {
        let payloads = messages
            .iter()
            .map(|m| self.serialize(m))
            .collect::<Result<Vec<_>, _>>()?;
        self.frame_batch(&payloads)
    }

    /// Decode every message in one socket frame body.
    pub fn decode_stream(&self, body: &[u8]) -> Result<Vec<Message>, DecodeError> {
        self.parse_stream(body)?
            .iter()
            .map(|p| self.deserialize(p))
            .collect()
    }

    fn check_size(&self, size: usize) -> Result<(), EncodeError> {
        if size > self.config.max_frame_size {
            return Err(EncodeError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        Ok(())
    }
}
