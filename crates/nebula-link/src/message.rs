//! Application message envelope and the payload codec collaborator.
//!
//! A [`Message`] is what the application sends and receives. Its type string
//! and payload schema are owned by the application; the engine only looks at
//! the request id and error code for correlation.
//!
//! On the wire the envelope is a MessagePack map:
//!
//! ```text
//! { "t": type, "i": request id (optional), "e": error code (optional), "p": payload map }
//! ```

use std::io::Cursor;

use rmpv::Value as MsgPackValue;

use crate::value::{Payload, Value, ValueError};

/// One application-level message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Opaque message type identifier.
    pub msg_type: String,
    /// Correlation id for request/response pairs.
    pub request_id: Option<u32>,
    /// Server-assigned error code on failed responses.
    pub error_code: Option<String>,
    /// Message body.
    pub payload: Payload,
}

impl Message {
    /// Create a message with an empty payload.
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            ..Self::default()
        }
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the request id.
    pub fn with_request_id(mut self, id: u32) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Set the error code.
    pub fn with_error(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Whether this message carries an error code.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Serializes messages to and from payload bytes.
///
/// Implementations must produce bytes that never begin with `0xAA`, since that
/// byte introduces a stream marker in socket frame bodies.
pub trait PayloadCodec: Send + Sync {
    /// Serialize a message into payload bytes.
    fn serialize(&self, message: &Message) -> Result<Vec<u8>, PayloadError>;

    /// Deserialize payload bytes into a message.
    fn deserialize(&self, bytes: &[u8]) -> Result<Message, PayloadError>;
}

/// Errors from a [`PayloadCodec`].
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// MessagePack encoding failed.
    #[error("MessagePack encode failed: {0}")]
    Encode(String),
    /// MessagePack decoding failed.
    #[error("MessagePack decode failed: {0}")]
    Decode(String),
    /// Bytes remained after the envelope.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    /// The envelope decoded but its fields have the wrong shape.
    #[error("malformed envelope: {0}")]
    Schema(String),
    /// A value could not be represented.
    #[error("invalid value: {0}")]
    Value(#[from] ValueError),
}

const KEY_TYPE: &str = "t";
const KEY_ID: &str = "i";
const KEY_ERROR: &str = "e";
const KEY_PAYLOAD: &str = "p";

/// Default [`PayloadCodec`]: self-describing MessagePack via `rmpv`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl PayloadCodec for MsgPackCodec {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>, PayloadError> {
        let mut entries = Vec::with_capacity(4);
        entries.push((
            MsgPackValue::from(KEY_TYPE),
            MsgPackValue::from(message.msg_type.as_str()),
        ));
        if let Some(id) = message.request_id {
            entries.push((MsgPackValue::from(KEY_ID), MsgPackValue::from(id)));
        }
        if let Some(code) = &message.error_code {
            entries.push((MsgPackValue::from(KEY_ERROR), MsgPackValue::from(code.as_str())));
        }
        entries.push((MsgPackValue::from(KEY_PAYLOAD), message.payload.to_msgpack()));

        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &MsgPackValue::Map(entries))
            .map_err(|e| PayloadError::Encode(e.to_string()))?;
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message, PayloadError> {
        let mut cursor = Cursor::new(bytes);
        let root = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| PayloadError::Decode(e.to_string()))?;
        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(PayloadError::TrailingBytes(bytes.len() - consumed));
        }

        let MsgPackValue::Map(entries) = root else {
            return Err(PayloadError::Schema("envelope is not a map".into()));
        };

        let mut message = Message::default();
        let mut has_type = false;
        for (key, value) in entries {
            let Some(key) = key.as_str() else {
                return Err(PayloadError::Schema("envelope key is not a string".into()));
            };
            match key {
                KEY_TYPE => {
                    let Value::String(t) = Value::from_msgpack(value)? else {
                        return Err(PayloadError::Schema("type is not a string".into()));
                    };
                    message.msg_type = t;
                    has_type = true;
                }
                KEY_ID => {
                    let id = value
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| PayloadError::Schema("request id is not a u32".into()))?;
                    message.request_id = Some(id);
                }
                KEY_ERROR => match Value::from_msgpack(value)? {
                    Value::String(code) => message.error_code = Some(code),
                    Value::Nil => {}
                    _ => return Err(PayloadError::Schema("error code is not a string".into())),
                },
                KEY_PAYLOAD => match Value::from_msgpack(value)? {
                    Value::Map(payload) => message.payload = payload,
                    Value::Nil => {}
                    _ => return Err(PayloadError::Schema("payload is not a map".into())),
                },
                // Unknown envelope keys are tolerated for forward compatibility.
                _ => {}
            }
        }

        if !has_type {
            return Err(PayloadError::Schema("missing message type".into()));
        }
        Ok(message)
    }
}
