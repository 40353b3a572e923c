//! Value codecs and the process-wide codec registry.
//!
//! A codec is the runtime realisation of a type descriptor: it decodes the
//! server's compact binary form into an owned [`Value`] and encodes
//! arguments back. Codecs are built once per descriptor id from the blocks
//! received at prepare time and retained for the life of the process.
//!
//! Wire framing rule shared by every codec: a value is `length: i32`
//! followed by `length` payload bytes; `-1` signals NULL and is only legal
//! for optional fields, which the containing codec handles before
//! delegating.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::{Reader, Writer};
use crate::descriptor::{self, Descriptor, DescriptorId, ShapeField};
use crate::error::{Error, Result};
use crate::value::{BigInt, ObjectField, RangeValue, Value};

// Range flag bits.
const RANGE_EMPTY: u8 = 0x01;
const RANGE_INC_LOWER: u8 = 0x02;
const RANGE_INC_UPPER: u8 = 0x04;
const RANGE_INF_LOWER: u8 = 0x08;
const RANGE_INF_UPPER: u8 = 0x10;

/// Primitive scalars identified by well-known descriptor uuids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Uuid,
    Str,
    Bytes,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    DateTime,
    Duration,
    Json,
    BigInt,
}

impl ScalarKind {
    /// Resolve a well-known base scalar uuid. The known ids are all-zero
    /// except for `01` at byte 14 and the kind selector at byte 15.
    pub fn from_uuid(id: DescriptorId) -> Option<ScalarKind> {
        let b = id.0;
        if b[..14] != [0u8; 14] || b[14] != 0x01 {
            return None;
        }
        match b[15] {
            0x00 => Some(ScalarKind::Uuid),
            0x01 => Some(ScalarKind::Str),
            0x02 => Some(ScalarKind::Bytes),
            0x03 => Some(ScalarKind::Int16),
            0x04 => Some(ScalarKind::Int32),
            0x05 => Some(ScalarKind::Int64),
            0x06 => Some(ScalarKind::Float32),
            0x07 => Some(ScalarKind::Float64),
            0x09 => Some(ScalarKind::Bool),
            0x0a => Some(ScalarKind::DateTime),
            0x0e => Some(ScalarKind::Duration),
            0x0f => Some(ScalarKind::Json),
            0x10 => Some(ScalarKind::BigInt),
            _ => None,
        }
    }

    /// Well-known descriptor id for this kind.
    pub fn uuid(self) -> DescriptorId {
        let tail = match self {
            ScalarKind::Uuid => 0x00,
            ScalarKind::Str => 0x01,
            ScalarKind::Bytes => 0x02,
            ScalarKind::Int16 => 0x03,
            ScalarKind::Int32 => 0x04,
            ScalarKind::Int64 => 0x05,
            ScalarKind::Float32 => 0x06,
            ScalarKind::Float64 => 0x07,
            ScalarKind::Bool => 0x09,
            ScalarKind::DateTime => 0x0a,
            ScalarKind::Duration => 0x0e,
            ScalarKind::Json => 0x0f,
            ScalarKind::BigInt => 0x10,
        };
        let mut id = [0u8; 16];
        id[14] = 0x01;
        id[15] = tail;
        DescriptorId(id)
    }

    /// Wire size for fixed-width kinds.
    fn fixed_wire_size(self) -> Option<usize> {
        match self {
            ScalarKind::Uuid => Some(16),
            ScalarKind::Bool => Some(1),
            ScalarKind::Int16 => Some(2),
            ScalarKind::Int32 | ScalarKind::Float32 => Some(4),
            ScalarKind::Int64 | ScalarKind::Float64 | ScalarKind::DateTime => Some(8),
            ScalarKind::Duration => Some(16),
            _ => None,
        }
    }
}

/// A named field of an object or named-tuple codec.
#[derive(Debug)]
pub struct CodecField {
    pub name: String,
    pub flags: u8,
    pub codec: Arc<Codec>,
}

impl CodecField {
    fn is_optional(&self) -> bool {
        self.flags & descriptor::FLAG_IMPLICIT != 0
    }
}

/// The runtime realisation of a descriptor.
#[derive(Debug)]
pub enum Codec {
    /// The distinguished all-zero id: the empty/void shape.
    Empty,
    Scalar {
        id: DescriptorId,
        kind: ScalarKind,
    },
    Enum {
        id: DescriptorId,
        members: Vec<String>,
    },
    Set {
        id: DescriptorId,
        element: Arc<Codec>,
    },
    Array {
        id: DescriptorId,
        element: Arc<Codec>,
        dimensions: Vec<i32>,
    },
    Tuple {
        id: DescriptorId,
        elements: Vec<Arc<Codec>>,
    },
    NamedTuple {
        id: DescriptorId,
        fields: Vec<CodecField>,
    },
    Object {
        id: DescriptorId,
        fields: Vec<CodecField>,
    },
    InputShape {
        id: DescriptorId,
        fields: Vec<CodecField>,
    },
    Range {
        id: DescriptorId,
        element: Arc<Codec>,
    },
}

/// A destination shape: ordered field names the caller wants filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    fields: Vec<String>,
}

impl Shape {
    pub fn new<I, S>(fields: I) -> Shape
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Shape {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn slot_of(&self, name: &str) -> Option<usize> {
        // exact match: no case folding, no underscore/camel normalisation
        self.fields.iter().position(|f| f == name)
    }
}

/// Field-offset metadata computed when a codec is bound to a destination
/// shape. `slots[i]` is the destination slot of wire field `i`; `step` is
/// sanity metadata for positional tuples (decode writes by index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapePlan {
    pub slots: Vec<Option<usize>>,
    pub width: usize,
    pub step: usize,
}

impl Codec {
    pub fn id(&self) -> DescriptorId {
        match self {
            Codec::Empty => DescriptorId::ZERO,
            Codec::Scalar { id, .. }
            | Codec::Enum { id, .. }
            | Codec::Set { id, .. }
            | Codec::Array { id, .. }
            | Codec::Tuple { id, .. }
            | Codec::NamedTuple { id, .. }
            | Codec::Object { id, .. }
            | Codec::InputShape { id, .. }
            | Codec::Range { id, .. } => *id,
        }
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Decode one length-prefixed value. A `-1` length yields
    /// [`Value::Nothing`].
    pub fn decode(&self, r: &mut Reader) -> Result<Value> {
        let len = r.pop_i32()?;
        if len < 0 {
            return Ok(Value::Nothing);
        }
        let len = len as usize;
        if r.remaining() < len {
            return Err(Error::Protocol(
                "value length exceeds the enclosing message".to_string(),
            ));
        }
        let before = r.remaining();
        let value = self.decode_payload(r, len)?;
        let consumed = before - r.remaining();
        if consumed != len {
            return Err(Error::Protocol(format!(
                "codec for {} consumed {} of {} declared bytes",
                self.id(),
                consumed,
                len
            )));
        }
        Ok(value)
    }

    /// Decode a root element from a `Data` message (still carrying its
    /// length prefix).
    pub fn decode_root(&self, element: &[u8]) -> Result<Value> {
        let mut r = Reader::message(element.to_vec());
        self.decode(&mut r)
    }

    fn decode_payload(&self, r: &mut Reader, len: usize) -> Result<Value> {
        match self {
            Codec::Empty => Ok(Value::Nothing),

            Codec::Scalar { kind, .. } => decode_scalar(*kind, r, len),

            Codec::Enum { .. } => {
                let bytes = r.pop_bytes(len)?;
                let name = std::str::from_utf8(bytes)
                    .map_err(|e| Error::Protocol(format!("invalid UTF-8 in enum value: {}", e)))?
                    .to_owned();
                Ok(Value::Enum(name))
            }

            Codec::Set { element, .. } => Ok(Value::Set(decode_elements(element, r)?)),

            Codec::Array { element, .. } => Ok(Value::Array(decode_elements(element, r)?)),

            Codec::Tuple { elements, .. } => {
                // the header count is advisory; the descriptor decides
                r.pop_u32()?;
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    r.pop_u32()?; // reserved
                    items.push(element.decode(r)?);
                }
                Ok(Value::Tuple(items))
            }

            Codec::NamedTuple { fields, .. } => {
                r.pop_u32()?;
                let mut items = Vec::with_capacity(fields.len());
                for field in fields {
                    r.pop_u32()?; // reserved
                    items.push((field.name.clone(), field.codec.decode(r)?));
                }
                Ok(Value::NamedTuple(items))
            }

            Codec::Object { fields, .. } | Codec::InputShape { fields, .. } => {
                r.pop_u32()?;
                let mut items = Vec::with_capacity(fields.len());
                for field in fields {
                    r.pop_u32()?; // reserved
                    items.push(ObjectField {
                        name: field.name.clone(),
                        value: field.codec.decode(r)?,
                    });
                }
                Ok(Value::Object(items))
            }

            Codec::Range { element, .. } => {
                let flags = r.pop_u8()?;
                let empty = flags & RANGE_EMPTY != 0;
                let mut lower = None;
                let mut upper = None;
                if !empty {
                    if flags & RANGE_INF_LOWER == 0 {
                        lower = Some(element.decode(r)?);
                    }
                    if flags & RANGE_INF_UPPER == 0 {
                        upper = Some(element.decode(r)?);
                    }
                }
                Ok(Value::Range(Box::new(RangeValue {
                    lower,
                    upper,
                    inc_lower: flags & RANGE_INC_LOWER != 0,
                    inc_upper: flags & RANGE_INC_UPPER != 0,
                    empty,
                })))
            }
        }
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode one value as `length: u32` + payload.
    pub fn encode(&self, w: &mut Writer, value: &Value) -> Result<()> {
        match self {
            Codec::Empty => Err(Error::InvalidArgument(
                "cannot encode a value for the empty shape".to_string(),
            )),

            Codec::Scalar { kind, .. } => encode_scalar(*kind, w, value),

            Codec::Enum { members, .. } => {
                let name = match value {
                    Value::Enum(name) | Value::Str(name) => name,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "cannot encode {} as an enum",
                            other.kind()
                        )))
                    }
                };
                if !members.iter().any(|m| m == name) {
                    return Err(Error::InvalidArgument(format!(
                        "{:?} is not a member of the enum",
                        name
                    )));
                }
                w.push_len_prefixed(name.as_bytes());
                Ok(())
            }

            Codec::Set { element, .. } | Codec::Array { element, .. } => {
                let items = match value {
                    Value::Array(items) | Value::Set(items) => items,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "cannot encode {} as an array",
                            other.kind()
                        )))
                    }
                };
                let marker = w.begin_bytes();
                if items.is_empty() {
                    w.push_u32(0); // ndims
                    w.push_u32(0);
                    w.push_u32(0);
                } else {
                    w.push_u32(1); // ndims
                    w.push_u32(0);
                    w.push_u32(0);
                    w.push_u32(items.len() as u32); // dim length
                    w.push_u32(1); // dim lower bound
                    for item in items {
                        element.encode(w, item)?;
                    }
                }
                w.end_bytes(marker);
                Ok(())
            }

            Codec::Tuple { elements, .. } => {
                let items = match value {
                    Value::Tuple(items) => items,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "cannot encode {} as a tuple",
                            other.kind()
                        )))
                    }
                };
                if items.len() != elements.len() {
                    return Err(Error::InvalidArgument(format!(
                        "tuple has {} elements, the codec expects {}",
                        items.len(),
                        elements.len()
                    )));
                }
                let marker = w.begin_bytes();
                w.push_u32(items.len() as u32);
                for (codec, item) in elements.iter().zip(items) {
                    w.push_u32(0); // reserved
                    codec.encode(w, item)?;
                }
                w.end_bytes(marker);
                Ok(())
            }

            Codec::NamedTuple { fields, .. }
            | Codec::Object { fields, .. }
            | Codec::InputShape { fields, .. } => {
                let marker = w.begin_bytes();
                w.push_u32(fields.len() as u32);
                for field in fields {
                    w.push_u32(0); // reserved
                    let item = lookup_field(value, &field.name)?;
                    match item {
                        Some(v) if !v.is_nothing() => field.codec.encode(w, v)?,
                        _ if field.is_optional() => w.push_i32(-1),
                        _ => {
                            return Err(Error::InvalidArgument(format!(
                                "missing value for required field {:?}",
                                field.name
                            )))
                        }
                    }
                }
                w.end_bytes(marker);
                Ok(())
            }

            Codec::Range { element, .. } => {
                let range = match value {
                    Value::Range(range) => range,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "cannot encode {} as a range",
                            other.kind()
                        )))
                    }
                };
                let marker = w.begin_bytes();
                let mut flags = 0u8;
                if range.empty {
                    flags |= RANGE_EMPTY;
                }
                if range.inc_lower {
                    flags |= RANGE_INC_LOWER;
                }
                if range.inc_upper {
                    flags |= RANGE_INC_UPPER;
                }
                if !range.empty && range.lower.is_none() {
                    flags |= RANGE_INF_LOWER;
                }
                if !range.empty && range.upper.is_none() {
                    flags |= RANGE_INF_UPPER;
                }
                w.push_u8(flags);
                if !range.empty {
                    if let Some(lower) = &range.lower {
                        element.encode(w, lower)?;
                    }
                    if let Some(upper) = &range.upper {
                        element.encode(w, upper)?;
                    }
                }
                w.end_bytes(marker);
                Ok(())
            }
        }
    }

    /// Encode the root argument tuple for an Execute. Returns the blob with
    /// its own length prefix, ready to splice into the message.
    ///
    /// A top-level shape with N fields is always `count: u32 = N`, then per
    /// field a reserved u32, a length (or -1 for a missing optional), and
    /// the payload.
    pub fn encode_args(&self, args: &[Value]) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        let marker = w.begin_bytes();
        match self {
            Codec::Empty => {
                if !args.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "query takes no arguments, {} given",
                        args.len()
                    )));
                }
                w.push_u32(0);
            }
            Codec::InputShape { fields, .. }
            | Codec::Object { fields, .. }
            | Codec::NamedTuple { fields, .. } => {
                if args.len() > fields.len() {
                    return Err(Error::InvalidArgument(format!(
                        "query takes {} arguments, {} given",
                        fields.len(),
                        args.len()
                    )));
                }
                w.push_u32(fields.len() as u32);
                for (i, field) in fields.iter().enumerate() {
                    w.push_u32(0); // reserved
                    match args.get(i) {
                        Some(v) if !v.is_nothing() => field.codec.encode(&mut w, v)?,
                        _ if field.is_optional() => w.push_i32(-1),
                        _ => {
                            return Err(Error::InvalidArgument(format!(
                                "missing required argument {:?}",
                                field.name
                            )))
                        }
                    }
                }
            }
            Codec::Tuple { elements, .. } => {
                if args.len() != elements.len() {
                    return Err(Error::InvalidArgument(format!(
                        "query takes {} arguments, {} given",
                        elements.len(),
                        args.len()
                    )));
                }
                w.push_u32(elements.len() as u32);
                for (codec, arg) in elements.iter().zip(args) {
                    w.push_u32(0); // reserved
                    codec.encode(&mut w, arg)?;
                }
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "descriptor {} cannot describe query arguments",
                    other.id()
                )))
            }
        }
        w.end_bytes(marker);
        Ok(w.into_bytes().to_vec())
    }

    // ========================================================================
    // Destination shape binding
    // ========================================================================

    /// Bind this codec to a destination shape, computing the slot of each
    /// wire field. Names match exactly; unmatched destination fields are
    /// tolerated, unmatched source fields are an error.
    pub fn bind(&self, shape: &Shape) -> Result<ShapePlan> {
        match self {
            Codec::Object { fields, .. } | Codec::NamedTuple { fields, .. } => {
                let mut slots = Vec::with_capacity(fields.len());
                for field in fields {
                    match shape.slot_of(&field.name) {
                        Some(slot) => slots.push(Some(slot)),
                        // implicit fields the caller did not ask for are
                        // simply dropped
                        None if field.is_optional() => slots.push(None),
                        None => {
                            return Err(Error::InvalidArgument(format!(
                                "result field {:?} has no destination in the shape",
                                field.name
                            )))
                        }
                    }
                }
                Ok(ShapePlan {
                    slots,
                    width: shape.len(),
                    step: 0,
                })
            }
            Codec::Tuple { elements, .. } => {
                let step = aligned_step(elements);
                Ok(ShapePlan {
                    slots: (0..elements.len()).map(Some).collect(),
                    width: elements.len(),
                    step,
                })
            }
            other => Err(Error::InvalidArgument(format!(
                "descriptor {} cannot be bound to a field shape",
                other.id()
            ))),
        }
    }

    /// Decode into a slot table laid out by a previous [`Codec::bind`].
    /// Slots with no matching wire field are left as [`Value::Nothing`].
    pub fn decode_shaped(&self, r: &mut Reader, plan: &ShapePlan) -> Result<Vec<Value>> {
        let decoded = self.decode(r)?;
        let mut slots = vec![Value::Nothing; plan.width];
        match decoded {
            Value::Object(fields) => {
                for (i, field) in fields.into_iter().enumerate() {
                    if let Some(Some(slot)) = plan.slots.get(i) {
                        slots[*slot] = field.value;
                    }
                }
            }
            Value::NamedTuple(fields) => {
                for (i, (_, value)) in fields.into_iter().enumerate() {
                    if let Some(Some(slot)) = plan.slots.get(i) {
                        slots[*slot] = value;
                    }
                }
            }
            Value::Tuple(items) => {
                for (i, value) in items.into_iter().enumerate() {
                    if let Some(Some(slot)) = plan.slots.get(i) {
                        slots[*slot] = value;
                    }
                }
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "cannot project {} through a field shape",
                    other.kind()
                )))
            }
        }
        Ok(slots)
    }
}

/// Aligned size of the sum of fixed element sizes. Dynamic elements count
/// as one word. Sanity metadata only.
fn aligned_step(elements: &[Arc<Codec>]) -> usize {
    let sum: usize = elements
        .iter()
        .map(|e| match e.as_ref() {
            Codec::Scalar { kind, .. } => kind.fixed_wire_size().unwrap_or(8),
            _ => 8,
        })
        .sum();
    (sum + 7) & !7
}

fn lookup_field<'v>(value: &'v Value, name: &str) -> Result<Option<&'v Value>> {
    match value {
        Value::Object(fields) => Ok(fields.iter().find(|f| f.name == name).map(|f| &f.value)),
        Value::NamedTuple(fields) => {
            Ok(fields.iter().find(|(n, _)| n == name).map(|(_, v)| v))
        }
        other => Err(Error::InvalidArgument(format!(
            "cannot encode {} as a shaped value",
            other.kind()
        ))),
    }
}

fn decode_elements(element: &Arc<Codec>, r: &mut Reader) -> Result<Vec<Value>> {
    let ndims = r.pop_u32()?;
    r.pop_u32()?; // reserved
    r.pop_u32()?; // reserved
    if ndims == 0 {
        return Ok(Vec::new());
    }
    if ndims != 1 {
        return Err(Error::Protocol(format!(
            "{}-dimensional arrays are not supported",
            ndims
        )));
    }
    let count = r.pop_u32()? as usize;
    r.pop_u32()?; // lower bound
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(element.decode(r)?);
    }
    Ok(items)
}

fn wrong_len(kind: &str, want: usize, got: usize) -> Error {
    Error::Protocol(format!(
        "invalid {} length: expected {} bytes, got {}",
        kind, want, got
    ))
}

fn decode_scalar(kind: ScalarKind, r: &mut Reader, len: usize) -> Result<Value> {
    if let Some(want) = kind.fixed_wire_size() {
        if len != want {
            return Err(wrong_len(kind_name(kind), want, len));
        }
    }
    match kind {
        ScalarKind::Uuid => Ok(Value::Uuid(r.pop_uuid()?)),
        ScalarKind::Bool => match r.pop_u8()? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(Error::Protocol(format!("invalid bool byte 0x{:02x}", other))),
        },
        ScalarKind::Int16 => Ok(Value::Int16(r.pop_i16()?)),
        ScalarKind::Int32 => Ok(Value::Int32(r.pop_i32()?)),
        ScalarKind::Int64 => Ok(Value::Int64(r.pop_i64()?)),
        ScalarKind::Float32 => Ok(Value::Float32(r.pop_f32()?)),
        ScalarKind::Float64 => Ok(Value::Float64(r.pop_f64()?)),
        ScalarKind::DateTime => Ok(Value::DateTime(r.pop_i64()?)),
        ScalarKind::Duration => {
            let micros = r.pop_i64()?;
            r.pop_u32()?; // reserved
            r.pop_u32()?; // reserved
            Ok(Value::Duration(micros))
        }
        ScalarKind::Str => {
            let bytes = r.pop_bytes(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| Error::Protocol(format!("invalid UTF-8 in str: {}", e)))?;
            Ok(Value::Str(s.to_owned()))
        }
        ScalarKind::Bytes => Ok(Value::Bytes(r.pop_bytes(len)?.to_vec())),
        ScalarKind::Json => {
            if len < 1 {
                return Err(Error::Protocol("empty json payload".to_string()));
            }
            let version = r.pop_u8()?;
            if version != 1 {
                return Err(Error::Protocol(format!(
                    "unsupported json format version {}",
                    version
                )));
            }
            let bytes = r.pop_bytes(len - 1)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| Error::Protocol(format!("invalid UTF-8 in json: {}", e)))?;
            Ok(Value::Json(s.to_owned()))
        }
        ScalarKind::BigInt => {
            if len < 8 {
                return Err(wrong_len("bigint", 8, len));
            }
            let ndigits = r.pop_u16()? as usize;
            let weight = r.pop_i16()?;
            let negative = match r.pop_u16()? {
                0x0000 => false,
                0x4000 => true,
                other => {
                    return Err(Error::Protocol(format!(
                        "invalid bigint sign 0x{:04x}",
                        other
                    )))
                }
            };
            r.pop_u16()?; // reserved
            if len != 8 + 2 * ndigits {
                return Err(wrong_len("bigint", 8 + 2 * ndigits, len));
            }
            let mut digits = Vec::with_capacity(ndigits);
            for _ in 0..ndigits {
                digits.push(r.pop_u16()?);
            }
            Ok(Value::BigInt(BigInt {
                negative,
                weight,
                digits,
            }))
        }
    }
}

fn kind_name(kind: ScalarKind) -> &'static str {
    match kind {
        ScalarKind::Uuid => "uuid",
        ScalarKind::Str => "str",
        ScalarKind::Bytes => "bytes",
        ScalarKind::Int16 => "int16",
        ScalarKind::Int32 => "int32",
        ScalarKind::Int64 => "int64",
        ScalarKind::Float32 => "float32",
        ScalarKind::Float64 => "float64",
        ScalarKind::Bool => "bool",
        ScalarKind::DateTime => "datetime",
        ScalarKind::Duration => "duration",
        ScalarKind::Json => "json",
        ScalarKind::BigInt => "bigint",
    }
}

fn encode_scalar(kind: ScalarKind, w: &mut Writer, value: &Value) -> Result<()> {
    let type_err = |value: &Value| {
        Error::InvalidArgument(format!(
            "cannot encode {} as {}",
            value.kind(),
            kind_name(kind)
        ))
    };
    match (kind, value) {
        (ScalarKind::Uuid, Value::Uuid(v)) => {
            w.push_u32(16);
            w.push_uuid(*v);
        }
        (ScalarKind::Bool, Value::Bool(v)) => {
            w.push_u32(1);
            w.push_u8(*v as u8);
        }
        (ScalarKind::Int16, Value::Int16(v)) => {
            w.push_u32(2);
            w.push_i16(*v);
        }
        (ScalarKind::Int32, Value::Int32(v)) => {
            w.push_u32(4);
            w.push_i32(*v);
        }
        (ScalarKind::Int64, Value::Int64(v)) => {
            w.push_u32(8);
            w.push_i64(*v);
        }
        (ScalarKind::Float32, Value::Float32(v)) => {
            w.push_u32(4);
            w.push_f32(*v);
        }
        (ScalarKind::Float64, Value::Float64(v)) => {
            w.push_u32(8);
            w.push_f64(*v);
        }
        (ScalarKind::DateTime, Value::DateTime(v)) => {
            w.push_u32(8);
            w.push_i64(*v);
        }
        (ScalarKind::Duration, Value::Duration(v)) => {
            w.push_u32(16);
            w.push_i64(*v);
            w.push_u32(0);
            w.push_u32(0);
        }
        (ScalarKind::Str, Value::Str(v)) => w.push_len_prefixed(v.as_bytes()),
        (ScalarKind::Bytes, Value::Bytes(v)) => w.push_len_prefixed(v),
        (ScalarKind::Json, Value::Json(v)) | (ScalarKind::Json, Value::Str(v)) => {
            w.push_u32(1 + v.len() as u32);
            w.push_u8(1); // format version
            w.push_bytes(v.as_bytes());
        }
        (ScalarKind::BigInt, Value::BigInt(v)) => {
            let marker = w.begin_bytes();
            w.push_u16(v.digits.len() as u16);
            w.push_i16(v.weight);
            w.push_u16(if v.negative { 0x4000 } else { 0x0000 });
            w.push_u16(0); // reserved
            for digit in &v.digits {
                w.push_u16(*digit);
            }
            w.end_bytes(marker);
        }
        (_, other) => return Err(type_err(other)),
    }
    Ok(())
}

// ============================================================================
// Codec construction
// ============================================================================

/// Build the codec tree for a parsed descriptor block. Positions are
/// resolved against `built`, which the caller seeds with already-registered
/// codecs where available.
fn build_one(desc: &Descriptor, built: &[Arc<Codec>]) -> Result<Arc<Codec>> {
    let at = |pos: u16| -> Arc<Codec> { Arc::clone(&built[pos as usize]) };

    let codec = match desc {
        Descriptor::BaseScalar { id } => {
            let kind = ScalarKind::from_uuid(*id).ok_or_else(|| {
                Error::InvalidArgument(format!("unknown base scalar uuid {}", id))
            })?;
            Codec::Scalar { id: *id, kind }
        }
        Descriptor::Scalar { id, base_pos } => {
            // a user-defined scalar decodes as its base
            match built[*base_pos as usize].as_ref() {
                Codec::Scalar { kind, .. } => Codec::Scalar { id: *id, kind: *kind },
                Codec::Enum { members, .. } => Codec::Enum {
                    id: *id,
                    members: members.clone(),
                },
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "scalar descriptor {} extends non-scalar {}",
                        id,
                        other.id()
                    )))
                }
            }
        }
        Descriptor::Enum { id, members } => Codec::Enum {
            id: *id,
            members: members.clone(),
        },
        Descriptor::Set { id, element_pos } => Codec::Set {
            id: *id,
            element: at(*element_pos),
        },
        Descriptor::Array {
            id,
            element_pos,
            dimensions,
        } => Codec::Array {
            id: *id,
            element: at(*element_pos),
            dimensions: dimensions.clone(),
        },
        Descriptor::Tuple {
            id,
            element_positions,
        } => Codec::Tuple {
            id: *id,
            elements: element_positions.iter().map(|p| at(*p)).collect(),
        },
        Descriptor::NamedTuple { id, fields } => Codec::NamedTuple {
            id: *id,
            fields: fields
                .iter()
                .map(|(name, pos)| CodecField {
                    name: name.clone(),
                    flags: 0,
                    codec: at(*pos),
                })
                .collect(),
        },
        Descriptor::Object { id, fields } => Codec::Object {
            id: *id,
            fields: build_fields(fields, built),
        },
        Descriptor::InputShape { id, fields } => Codec::InputShape {
            id: *id,
            fields: build_fields(fields, built),
        },
        Descriptor::Range { id, element_pos } => Codec::Range {
            id: *id,
            element: at(*element_pos),
        },
    };
    Ok(Arc::new(codec))
}

fn build_fields(fields: &[ShapeField], built: &[Arc<Codec>]) -> Vec<CodecField> {
    fields
        .iter()
        .map(|f| CodecField {
            name: f.name.clone(),
            flags: f.flags,
            codec: Arc::clone(&built[f.pos as usize]),
        })
        .collect()
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide mapping from descriptor id to codec.
///
/// Entries are immutable once published: looking the same id up twice
/// returns the same `Arc`. Racing builders may duplicate work; the first
/// publication wins and later builds are discarded.
pub struct CodecRegistry {
    codecs: RwLock<HashMap<DescriptorId, Arc<Codec>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let mut codecs = HashMap::new();
        codecs.insert(DescriptorId::ZERO, Arc::new(Codec::Empty));
        CodecRegistry {
            codecs: RwLock::new(codecs),
        }
    }

    pub fn lookup(&self, id: DescriptorId) -> Option<Arc<Codec>> {
        self.codecs.read().get(&id).map(Arc::clone)
    }

    pub fn contains(&self, id: DescriptorId) -> bool {
        self.codecs.read().contains_key(&id)
    }

    /// Publish a codec. On a race the earlier publication wins and is
    /// returned; the caller's build is discarded.
    pub fn publish(&self, codec: Arc<Codec>) -> Arc<Codec> {
        let mut codecs = self.codecs.write();
        Arc::clone(codecs.entry(codec.id()).or_insert(codec))
    }

    /// Parse a descriptor blob, build codecs for every record, publish
    /// them, and return the root codec (the published instance).
    pub fn build_and_register(&self, blob: &[u8]) -> Result<Arc<Codec>> {
        let descriptors = descriptor::parse(blob)?;
        let mut built: Vec<Arc<Codec>> = Vec::with_capacity(descriptors.len());
        for desc in &descriptors {
            // reuse an already-published codec so shared subtrees stay
            // reference-equal across queries
            let codec = match self.lookup(desc.id()) {
                Some(existing) => existing,
                None => self.publish(build_one(desc, &built)?),
            };
            built.push(codec);
        }
        built
            .pop()
            .ok_or_else(|| Error::InvalidArgument("empty descriptor block".to_string()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Writer as WireWriter;

    fn scalar(kind: ScalarKind) -> Arc<Codec> {
        Arc::new(Codec::Scalar {
            id: kind.uuid(),
            kind,
        })
    }

    #[test]
    fn registry_returns_the_same_codec_for_the_same_id() {
        let registry = CodecRegistry::new();
        let published = registry.publish(scalar(ScalarKind::Int64));
        let a = registry.lookup(ScalarKind::Int64.uuid()).unwrap();
        let b = registry.lookup(ScalarKind::Int64.uuid()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &published));
    }

    #[test]
    fn first_publication_wins_on_a_race() {
        let registry = CodecRegistry::new();
        let first = registry.publish(scalar(ScalarKind::Str));
        let second = registry.publish(scalar(ScalarKind::Str));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn zero_id_resolves_to_the_empty_codec() {
        let registry = CodecRegistry::new();
        let codec = registry.lookup(DescriptorId::ZERO).unwrap();
        assert!(matches!(codec.as_ref(), Codec::Empty));
    }

    #[test]
    fn enum_encode_rejects_non_members() {
        let codec = Codec::Enum {
            id: DescriptorId([3; 16]),
            members: vec!["red".into(), "green".into()],
        };
        let mut w = WireWriter::new();
        codec.encode(&mut w, &Value::Enum("red".into())).unwrap();
        match codec.encode(&mut w, &Value::Enum("blue".into())) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("blue")),
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }

    #[test]
    fn binding_matches_names_exactly() {
        let codec = Codec::Object {
            id: DescriptorId([1; 16]),
            fields: vec![
                CodecField {
                    name: "title".into(),
                    flags: 0,
                    codec: scalar(ScalarKind::Str),
                },
                CodecField {
                    name: "pageCount".into(),
                    flags: 0,
                    codec: scalar(ScalarKind::Int32),
                },
            ],
        };

        let plan = codec
            .bind(&Shape::new(["pageCount", "title", "unused"]))
            .unwrap();
        assert_eq!(plan.slots, vec![Some(1), Some(0)]);
        assert_eq!(plan.width, 3);

        // underscore spelling does not match the camel-case source field
        match codec.bind(&Shape::new(["title", "page_count"])) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("pageCount")),
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }

    #[test]
    fn unmatched_implicit_fields_are_dropped() {
        let codec = Codec::Object {
            id: DescriptorId([1; 16]),
            fields: vec![
                CodecField {
                    name: "id".into(),
                    flags: descriptor::FLAG_IMPLICIT,
                    codec: scalar(ScalarKind::Uuid),
                },
                CodecField {
                    name: "name".into(),
                    flags: 0,
                    codec: scalar(ScalarKind::Str),
                },
            ],
        };
        let plan = codec.bind(&Shape::new(["name"])).unwrap();
        assert_eq!(plan.slots, vec![None, Some(0)]);
    }

    #[test]
    fn tuple_step_is_the_aligned_size_of_its_elements() {
        let codec = Codec::Tuple {
            id: DescriptorId([2; 16]),
            elements: vec![scalar(ScalarKind::Int64), scalar(ScalarKind::Int32)],
        };
        let plan = codec.bind(&Shape::new(["0", "1"])).unwrap();
        assert_eq!(plan.step, 16);
    }

    #[test]
    fn empty_codec_encodes_the_null_argument_tuple() {
        let blob = Codec::Empty.encode_args(&[]).unwrap();
        assert_eq!(blob, vec![0, 0, 0, 4, 0, 0, 0, 0]);

        match Codec::Empty.encode_args(&[Value::Int64(1)]) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }

    #[test]
    fn missing_required_arguments_are_rejected() {
        let codec = Codec::InputShape {
            id: DescriptorId([4; 16]),
            fields: vec![
                CodecField {
                    name: "0".into(),
                    flags: 0,
                    codec: scalar(ScalarKind::Int64),
                },
                CodecField {
                    name: "1".into(),
                    flags: descriptor::FLAG_IMPLICIT,
                    codec: scalar(ScalarKind::Str),
                },
            ],
        };

        // optional second argument may be omitted and is encoded as -1
        let blob = codec.encode_args(&[Value::Int64(5)]).unwrap();
        let tail = &blob[blob.len() - 4..];
        assert_eq!(tail, &(-1i32).to_be_bytes());

        match codec.encode_args(&[Value::Nothing]) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("required")),
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }
}
