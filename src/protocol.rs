//! Fixed-frame binary codec.
//!
//! Every frame on the wire is a flat sequence of 4-byte big-endian words, one
//! per field, in layout order. There is no length prefix and no type tag: both
//! ends must agree on the layout exactly.

use crate::error::{ConfigError, ProtocolError};
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const WORD_BYTES: usize = 4;
pub const MAX_FIELDS: usize = 64;
pub const MAX_FRAME_BYTES: usize = 256;

static_assertions::const_assert_eq!(MAX_FRAME_BYTES, MAX_FIELDS * WORD_BYTES);

pub type FrameBuffer = ArrayVec<u8, MAX_FRAME_BYTES>;
pub type FrameValues = heapless::Vec<Value, MAX_FIELDS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    Float,
}

impl FieldKind {
    pub fn zero(self) -> Value {
        match self {
            FieldKind::Int => Value::Int(0),
            FieldKind::Float => Value::Float(0.0),
        }
    }

    /// Converts a caller-supplied number into this kind.
    ///
    /// Integers truncate toward zero and saturate at the i32 range. Returns
    /// `None` for a non-finite value headed into an integer slot.
    pub fn coerce(self, value: f64) -> Option<Value> {
        match self {
            FieldKind::Int if !value.is_finite() => None,
            FieldKind::Int => Some(Value::Int(value.trunc() as i32)),
            FieldKind::Float => Some(Value::Float(value as f32)),
        }
    }

    fn code(self) -> char {
        match self {
            FieldKind::Int => 'i',
            FieldKind::Float => 'f',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Float(f32),
}

impl Value {
    pub fn kind(self) -> FieldKind {
        match self {
            Value::Int(_) => FieldKind::Int,
            Value::Float(_) => FieldKind::Float,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => f64::from(v),
            Value::Float(v) => f64::from(v),
        }
    }

    fn to_be_bytes(self) -> [u8; WORD_BYTES] {
        match self {
            Value::Int(v) => v.to_be_bytes(),
            Value::Float(v) => v.to_be_bytes(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:.4}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn int(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Int,
        }
    }

    pub fn float(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Float,
        }
    }
}

/// Ordered field list plus a name-to-slot table built once at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldSpec>", into = "Vec<FieldSpec>")]
pub struct FrameLayout {
    fields: Vec<FieldSpec>,
    slots: HashMap<String, usize>,
}

impl FrameLayout {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::Layout("layout has no fields".into()));
        }
        if fields.len() > MAX_FIELDS {
            return Err(ConfigError::Layout(format!(
                "layout has {} fields, maximum is {MAX_FIELDS}",
                fields.len()
            )));
        }

        let mut slots = HashMap::with_capacity(fields.len());
        for (slot, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(ConfigError::Layout(format!("field at slot {slot} has no name")));
            }
            if slots.insert(field.name.clone(), slot).is_some() {
                return Err(ConfigError::Layout(format!(
                    "duplicate field name `{}`",
                    field.name
                )));
            }
        }

        Ok(Self { fields, slots })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Exact number of bytes one frame occupies on the wire.
    pub fn frame_len(&self) -> usize {
        self.fields.len() * WORD_BYTES
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.slot(name).map(|slot| self.fields[slot].kind)
    }

    /// Compact kind signature, one letter per word (`"iiff"`).
    pub fn signature(&self) -> String {
        self.fields.iter().map(|f| f.kind.code()).collect()
    }

    pub fn zero_values(&self) -> Vec<Value> {
        self.fields.iter().map(|f| f.kind.zero()).collect()
    }

    pub fn encode(&self, values: &[Value]) -> Result<FrameBuffer, ProtocolError> {
        if values.len() != self.fields.len() {
            return Err(ProtocolError::ValueCount {
                expected: self.fields.len(),
                actual: values.len(),
            });
        }

        let mut buf = FrameBuffer::new();
        for (slot, (field, value)) in self.fields.iter().zip(values).enumerate() {
            if field.kind != value.kind() {
                return Err(ProtocolError::KindMismatch { slot });
            }
            buf.try_extend_from_slice(&value.to_be_bytes())
                .map_err(|_| ProtocolError::Capacity)?;
        }
        Ok(buf)
    }

    pub fn decode(self: &Arc<Self>, bytes: &[u8]) -> Result<TelemetryFrame, ProtocolError> {
        if bytes.len() != self.frame_len() {
            return Err(ProtocolError::FrameLength {
                expected: self.frame_len(),
                actual: bytes.len(),
            });
        }

        let mut values = FrameValues::new();
        for (field, chunk) in self.fields.iter().zip(bytes.chunks_exact(WORD_BYTES)) {
            let word = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let value = match field.kind {
                FieldKind::Int => Value::Int(i32::from_be_bytes(word)),
                FieldKind::Float => Value::Float(f32::from_be_bytes(word)),
            };
            values.push(value).map_err(|_| ProtocolError::Capacity)?;
        }

        Ok(TelemetryFrame {
            layout: Arc::clone(self),
            values,
        })
    }
}

impl TryFrom<Vec<FieldSpec>> for FrameLayout {
    type Error = ConfigError;

    fn try_from(fields: Vec<FieldSpec>) -> Result<Self, Self::Error> {
        Self::new(fields)
    }
}

impl From<FrameLayout> for Vec<FieldSpec> {
    fn from(layout: FrameLayout) -> Self {
        layout.fields
    }
}

/// One decoded frame: a fixed-schema record addressed by slot or by name.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    layout: Arc<FrameLayout>,
    values: FrameValues,
}

impl TelemetryFrame {
    pub fn new(layout: Arc<FrameLayout>, values: &[Value]) -> Result<Self, ProtocolError> {
        if values.len() != layout.len() {
            return Err(ProtocolError::ValueCount {
                expected: layout.len(),
                actual: values.len(),
            });
        }
        for (slot, (field, value)) in layout.fields().iter().zip(values).enumerate() {
            if field.kind != value.kind() {
                return Err(ProtocolError::KindMismatch { slot });
            }
        }
        let values = FrameValues::from_slice(values).map_err(|()| ProtocolError::Capacity)?;
        Ok(Self { layout, values })
    }

    pub fn layout(&self) -> &Arc<FrameLayout> {
        &self.layout
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.layout.slot(name).map(|slot| self.values[slot])
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).map(Value::as_f64)
    }

    /// Overwrites one slot in place. The value must keep the slot's kind.
    pub fn set_slot(&mut self, slot: usize, value: Value) -> bool {
        match self.layout.fields().get(slot) {
            Some(field) if field.kind == value.kind() => {
                self.values[slot] = value;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
        self.layout
            .fields()
            .iter()
            .zip(self.values.iter())
            .map(|(f, v)| (f.name.as_str(), *v))
    }

    pub fn encode(&self) -> Result<FrameBuffer, ProtocolError> {
        self.layout.encode(&self.values)
    }

    /// Renders only the named fields, in the order given. Missing names show as `-`.
    pub fn format_fields(&self, names: &[String]) -> String {
        let parts: Vec<String> = names
            .iter()
            .map(|name| match self.get(name) {
                Some(v) => format!("{name}={v}"),
                None => format!("{name}=-"),
            })
            .collect();
        format!("{{{}}}", parts.join(", "))
    }
}

impl fmt::Display for TelemetryFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(n, v)| format!("{n}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
