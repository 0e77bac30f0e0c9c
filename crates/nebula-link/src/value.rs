//! Dynamically-typed payload values.
//!
//! Message payloads are opaque to the engine: an insertion-ordered map from
//! field name to [`Value`]. The MessagePack representation is produced through
//! [`rmpv`], so any server speaking plain MessagePack maps can read them.

use rmpv::Value as MsgPackValue;

/// A dynamically-typed payload value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent / null.
    #[default]
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer. Unsigned values above `i64::MAX` are rejected on decode.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw byte sequence.
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// Nested string-keyed map.
    Map(Payload),
}

impl Value {
    /// Borrow the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the integer value, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the byte contents, if this is a byte sequence.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Whether this value is [`Value::Nil`].
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub(crate) fn to_msgpack(&self) -> MsgPackValue {
        match self {
            Value::Nil => MsgPackValue::Nil,
            Value::Bool(b) => MsgPackValue::Boolean(*b),
            Value::Int(i) => MsgPackValue::from(*i),
            Value::Float(f) => MsgPackValue::F64(*f),
            Value::String(s) => MsgPackValue::from(s.as_str()),
            Value::Bytes(b) => MsgPackValue::Binary(b.clone()),
            Value::List(items) => {
                MsgPackValue::Array(items.iter().map(Value::to_msgpack).collect())
            }
            Value::Map(map) => map.to_msgpack(),
        }
    }

    pub(crate) fn from_msgpack(value: MsgPackValue) -> Result<Self, ValueError> {
        Ok(match value {
            MsgPackValue::Nil => Value::Nil,
            MsgPackValue::Boolean(b) => Value::Bool(b),
            MsgPackValue::Integer(i) => match i.as_i64() {
                Some(v) => Value::Int(v),
                None => return Err(ValueError::IntegerOutOfRange),
            },
            MsgPackValue::F32(f) => Value::Float(f64::from(f)),
            MsgPackValue::F64(f) => Value::Float(f),
            MsgPackValue::String(s) => match s.into_str() {
                Some(s) => Value::String(s),
                None => return Err(ValueError::InvalidUtf8),
            },
            MsgPackValue::Binary(b) => Value::Bytes(b),
            MsgPackValue::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_msgpack)
                    .collect::<Result<_, _>>()?,
            ),
            MsgPackValue::Map(entries) => Value::Map(Payload::from_msgpack_entries(entries)?),
            MsgPackValue::Ext(tag, _) => return Err(ValueError::UnsupportedExtension(tag)),
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Payload> for Value {
    fn from(v: Payload) -> Self {
        Value::Map(v)
    }
}

/// Insertion-ordered map of field name to [`Value`].
///
/// Field order is preserved through encode/decode. Inserting an existing key
/// replaces its value in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    entries: Vec<(String, Value)>,
}

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a field. Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    /// Look up a field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn to_msgpack(&self) -> MsgPackValue {
        MsgPackValue::Map(
            self.entries
                .iter()
                .map(|(k, v)| (MsgPackValue::from(k.as_str()), v.to_msgpack()))
                .collect(),
        )
    }

    pub(crate) fn from_msgpack_entries(
        entries: Vec<(MsgPackValue, MsgPackValue)>,
    ) -> Result<Self, ValueError> {
        let mut payload = Payload::new();
        for (key, value) in entries {
            let key = match key {
                MsgPackValue::String(s) => s.into_str().ok_or(ValueError::InvalidUtf8)?,
                _ => return Err(ValueError::NonStringKey),
            };
            payload.entries.push((key, Value::from_msgpack(value)?));
        }
        Ok(payload)
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut payload = Payload::new();
        for (k, v) in iter {
            payload.insert(k, v);
        }
        payload
    }
}

impl IntoIterator for Payload {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Errors converting MessagePack data into [`Value`]s.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    /// An unsigned integer did not fit in `i64`.
    #[error("integer out of range for i64")]
    IntegerOutOfRange,
    /// A string was not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// A map key was not a string.
    #[error("map keys must be strings")]
    NonStringKey,
    /// MessagePack extension types are not part of the value model.
    #[error("unsupported extension type {0}")]
    UnsupportedExtension(i8),
}
