//! Parsing of server type-descriptor blocks.
//!
//! A descriptor blob is a sequence of records, each `tag: u8, id: 16 bytes,
//! payload`. Records implicitly occupy ordinal positions 0, 1, 2, … and
//! refer to each other by those positions; references only ever point
//! backwards, so a single left-to-right pass over the blob suffices and the
//! result is a flat position-indexed list whose last entry is the root.

use std::fmt;

use crate::buffer::Reader;
use crate::error::{Error, Result};

/// 16-byte descriptor identity. The all-zero id denotes the empty shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(pub [u8; 16]);

impl DescriptorId {
    pub const ZERO: DescriptorId = DescriptorId([0; 16]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// Descriptor record tags.
pub const TAG_SET: u8 = 0;
pub const TAG_OBJECT: u8 = 1;
pub const TAG_BASE_SCALAR: u8 = 2;
pub const TAG_SCALAR: u8 = 3;
pub const TAG_TUPLE: u8 = 4;
pub const TAG_NAMED_TUPLE: u8 = 5;
pub const TAG_ARRAY: u8 = 6;
pub const TAG_ENUM: u8 = 7;
pub const TAG_INPUT_SHAPE: u8 = 8;
pub const TAG_RANGE: u8 = 9;

// Shape field flag bits.
pub const FLAG_IMPLICIT: u8 = 0x01;
pub const FLAG_LINK_PROPERTY: u8 = 0x02;
pub const FLAG_LINK: u8 = 0x04;

/// A field of an object or input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeField {
    pub flags: u8,
    pub name: String,
    pub pos: u16,
}

impl ShapeField {
    pub fn is_implicit(&self) -> bool {
        self.flags & FLAG_IMPLICIT != 0
    }

    pub fn is_link_property(&self) -> bool {
        self.flags & FLAG_LINK_PROPERTY != 0
    }

    pub fn is_link(&self) -> bool {
        self.flags & FLAG_LINK != 0
    }

    /// On input shapes the implicit bit marks the field optional.
    pub fn is_optional(&self) -> bool {
        self.flags & FLAG_IMPLICIT != 0
    }
}

/// One parsed descriptor record.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Set {
        id: DescriptorId,
        element_pos: u16,
    },
    Object {
        id: DescriptorId,
        fields: Vec<ShapeField>,
    },
    BaseScalar {
        id: DescriptorId,
    },
    Scalar {
        id: DescriptorId,
        base_pos: u16,
    },
    Tuple {
        id: DescriptorId,
        element_positions: Vec<u16>,
    },
    NamedTuple {
        id: DescriptorId,
        fields: Vec<(String, u16)>,
    },
    Array {
        id: DescriptorId,
        element_pos: u16,
        dimensions: Vec<i32>,
    },
    Enum {
        id: DescriptorId,
        members: Vec<String>,
    },
    InputShape {
        id: DescriptorId,
        fields: Vec<ShapeField>,
    },
    Range {
        id: DescriptorId,
        element_pos: u16,
    },
}

impl Descriptor {
    pub fn id(&self) -> DescriptorId {
        match self {
            Descriptor::Set { id, .. }
            | Descriptor::Object { id, .. }
            | Descriptor::BaseScalar { id }
            | Descriptor::Scalar { id, .. }
            | Descriptor::Tuple { id, .. }
            | Descriptor::NamedTuple { id, .. }
            | Descriptor::Array { id, .. }
            | Descriptor::Enum { id, .. }
            | Descriptor::InputShape { id, .. }
            | Descriptor::Range { id, .. } => *id,
        }
    }
}

fn invalid(msg: String) -> Error {
    Error::InvalidArgument(msg)
}

/// Parse a descriptor blob into its position-indexed records. The last
/// record is the root.
pub fn parse(blob: &[u8]) -> Result<Vec<Descriptor>> {
    let mut r = Reader::message(blob.to_vec());
    let mut descriptors: Vec<Descriptor> = Vec::new();

    while r.remaining() > 0 {
        let pos = descriptors.len();
        let record = parse_record(&mut r, pos).map_err(|e| match e {
            // a short read anywhere in a record means the blob itself is bad
            Error::Protocol(_) => invalid(format!("truncated descriptor at position {}", pos)),
            other => other,
        })?;
        descriptors.push(record);
    }

    if descriptors.is_empty() {
        return Err(invalid("empty descriptor block".to_string()));
    }
    Ok(descriptors)
}

fn parse_record(r: &mut Reader, pos: usize) -> Result<Descriptor> {
    let tag = r.pop_u8()?;
    let id = DescriptorId(r.pop_uuid()?);

    let check_ref = |target: u16| -> Result<u16> {
        if (target as usize) >= pos {
            return Err(invalid(format!(
                "descriptor at position {} references position {} which is not yet parsed",
                pos, target
            )));
        }
        Ok(target)
    };

    match tag {
        TAG_SET => Ok(Descriptor::Set {
            id,
            element_pos: check_ref(r.pop_u16()?)?,
        }),
        TAG_OBJECT | TAG_INPUT_SHAPE => {
            let n = r.pop_u16()?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let flags = r.pop_u8()?;
                let name = r.pop_str()?;
                let field_pos = check_ref(r.pop_u16()?)?;
                fields.push(ShapeField {
                    flags,
                    name,
                    pos: field_pos,
                });
            }
            if tag == TAG_OBJECT {
                Ok(Descriptor::Object { id, fields })
            } else {
                Ok(Descriptor::InputShape { id, fields })
            }
        }
        TAG_BASE_SCALAR => Ok(Descriptor::BaseScalar { id }),
        TAG_SCALAR => Ok(Descriptor::Scalar {
            id,
            base_pos: check_ref(r.pop_u16()?)?,
        }),
        TAG_TUPLE => {
            let n = r.pop_u16()?;
            let mut element_positions = Vec::with_capacity(n as usize);
            for _ in 0..n {
                element_positions.push(check_ref(r.pop_u16()?)?);
            }
            Ok(Descriptor::Tuple {
                id,
                element_positions,
            })
        }
        TAG_NAMED_TUPLE => {
            let n = r.pop_u16()?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let name = r.pop_str()?;
                let field_pos = check_ref(r.pop_u16()?)?;
                fields.push((name, field_pos));
            }
            Ok(Descriptor::NamedTuple { id, fields })
        }
        TAG_ARRAY => {
            let element_pos = check_ref(r.pop_u16()?)?;
            let ndims = r.pop_u16()?;
            let mut dimensions = Vec::with_capacity(ndims as usize);
            for _ in 0..ndims {
                dimensions.push(r.pop_i32()?);
            }
            Ok(Descriptor::Array {
                id,
                element_pos,
                dimensions,
            })
        }
        TAG_ENUM => {
            let n = r.pop_u16()?;
            let mut members = Vec::with_capacity(n as usize);
            for _ in 0..n {
                members.push(r.pop_str()?);
            }
            Ok(Descriptor::Enum { id, members })
        }
        TAG_RANGE => Ok(Descriptor::Range {
            id,
            element_pos: check_ref(r.pop_u16()?)?,
        }),
        other => Err(invalid(format!(
            "unknown descriptor tag 0x{:02x} at position {}",
            other, pos
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Writer;

    fn scalar_record(w: &mut Writer, id_tail: u8) {
        w.push_u8(TAG_BASE_SCALAR);
        let mut id = [0u8; 16];
        id[14] = 0x01;
        id[15] = id_tail;
        w.push_uuid(id);
    }

    #[test]
    fn parses_positions_left_to_right() {
        let mut w = Writer::new();
        scalar_record(&mut w, 0x05); // pos 0: int64
        w.push_u8(TAG_SET);
        w.push_uuid([7; 16]);
        w.push_u16(0); // element at pos 0
        let descs = parse(w.as_slice()).unwrap();

        assert_eq!(descs.len(), 2);
        assert_eq!(
            descs[1],
            Descriptor::Set {
                id: DescriptorId([7; 16]),
                element_pos: 0
            }
        );
    }

    #[test]
    fn object_fields_carry_flags_names_and_positions() {
        let mut w = Writer::new();
        scalar_record(&mut w, 0x01); // pos 0: str
        w.push_u8(TAG_OBJECT);
        w.push_uuid([9; 16]);
        w.push_u16(2);
        w.push_u8(FLAG_IMPLICIT);
        w.push_str("id");
        w.push_u16(0);
        w.push_u8(0);
        w.push_str("name");
        w.push_u16(0);

        let descs = parse(w.as_slice()).unwrap();
        match &descs[1] {
            Descriptor::Object { fields, .. } => {
                assert_eq!(fields.len(), 2);
                assert!(fields[0].is_implicit());
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[1].name, "name");
                assert_eq!(fields[1].pos, 0);
            }
            other => panic!("expected an object descriptor, got {:?}", other),
        }
    }

    #[test]
    fn forward_references_are_rejected() {
        let mut w = Writer::new();
        w.push_u8(TAG_SET);
        w.push_uuid([1; 16]);
        w.push_u16(3); // references a record that does not exist yet
        match parse(w.as_slice()) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("not yet parsed")),
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut w = Writer::new();
        w.push_u8(0x77);
        w.push_uuid([1; 16]);
        match parse(w.as_slice()) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("unknown descriptor tag")),
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let mut w = Writer::new();
        w.push_u8(TAG_BASE_SCALAR);
        w.push_bytes(&[0u8; 7]); // id cut short
        match parse(w.as_slice()) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("truncated")),
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }
}
