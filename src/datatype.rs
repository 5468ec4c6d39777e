/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Datatype message encoding.
//!
//! A datatype message describes the element type of a dataset or attribute.
//! Multi-byte fields are little-endian and the element size is deterministic
//! from the description.

use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::pad_to;
use crate::io::put_u16;
use crate::io::put_u32;

/// Datatype class: fixed-point number.
const CLASS_FIXED: u8 = 0;
/// Datatype class: floating-point number.
const CLASS_FLOAT: u8 = 1;
/// Datatype class: fixed-length string.
const CLASS_STRING: u8 = 3;
/// Datatype class: opaque blob.
const CLASS_OPAQUE: u8 = 5;
/// Datatype class: reference to another object.
const CLASS_REFERENCE: u8 = 7;
/// Datatype class: enumeration.
const CLASS_ENUM: u8 = 8;
/// Datatype class: array.
const CLASS_ARRAY: u8 = 10;

/// Padding of string values shorter than their element size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StringPad {
    /// The value ends with a null byte.
    #[default]
    NullTerminate = 0,
    /// The value is padded with null bytes, not necessarily terminated.
    NullPad = 1,
}

/// Character set of a string datatype.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Charset {
    /// US-ASCII.
    #[default]
    Ascii = 0,
    /// UTF-8.
    Utf8 = 1,
}

/// Kind of a reference datatype.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefKind {
    /// Reference to an object header, 8 bytes.
    Object,
    /// Reference to a region of a dataset, 12 bytes.
    Region,
}

/// An element datatype.
#[derive(Clone, Debug, PartialEq)]
pub enum Datatype {
    /// Fixed-point integer, little-endian.
    Fixed {
        /// Size in bytes: 1, 2, 4 or 8.
        size: u32,
        /// Two's complement signedness.
        signed: bool,
    },
    /// IEEE 754 binary32, little-endian.
    Float32,
    /// IEEE 754 binary64, little-endian.
    Float64,
    /// Fixed-length string.
    String {
        /// Element size in bytes.
        size: u32,
        /// Short-value padding.
        pad: StringPad,
        /// Character set.
        charset: Charset,
    },
    /// Array over a base datatype.
    Array {
        /// Dimension sizes.
        dims: Vec<u32>,
        /// Element type of the array.
        base: Box<Datatype>,
    },
    /// Enumeration over a fixed-point base datatype.
    Enum {
        /// The base datatype the raw values are encoded in.
        base: Box<Datatype>,
        /// Member names.
        names: Vec<String>,
        /// Member values, encoded in the base type's width.
        values: Vec<i64>,
    },
    /// Reference to another object or region.
    Reference(RefKind),
    /// Opaque bytes with an ASCII tag.
    Opaque {
        /// The tag describing the content.
        tag: String,
        /// Element size in bytes.
        size: u32,
    },
}

impl Datatype {
    /// Signed 8-bit integer.
    pub fn int8() -> Self {
        Self::Fixed {
            size: 1,
            signed: true,
        }
    }

    /// Signed 16-bit integer.
    pub fn int16() -> Self {
        Self::Fixed {
            size: 2,
            signed: true,
        }
    }

    /// Signed 32-bit integer.
    pub fn int32() -> Self {
        Self::Fixed {
            size: 4,
            signed: true,
        }
    }

    /// Signed 64-bit integer.
    pub fn int64() -> Self {
        Self::Fixed {
            size: 8,
            signed: true,
        }
    }

    /// Unsigned 8-bit integer.
    pub fn uint8() -> Self {
        Self::Fixed {
            size: 1,
            signed: false,
        }
    }

    /// Unsigned 16-bit integer.
    pub fn uint16() -> Self {
        Self::Fixed {
            size: 2,
            signed: false,
        }
    }

    /// Unsigned 32-bit integer.
    pub fn uint32() -> Self {
        Self::Fixed {
            size: 4,
            signed: false,
        }
    }

    /// Unsigned 64-bit integer.
    pub fn uint64() -> Self {
        Self::Fixed {
            size: 8,
            signed: false,
        }
    }

    /// Fixed-length string with default padding and character set.
    pub fn string(size: u32) -> Self {
        Self::String {
            size,
            pad: StringPad::default(),
            charset: Charset::default(),
        }
    }

    /// Returns the size in bytes of one element of this datatype.
    pub fn size(&self) -> u64 {
        match self {
            Self::Fixed {
                size, ..
            } => *size as u64,
            Self::Float32 => 4,
            Self::Float64 => 8,
            Self::String {
                size, ..
            } => *size as u64,
            Self::Array {
                dims,
                base,
            } => dims.iter().map(|d| *d as u64).product::<u64>() * base.size(),
            Self::Enum {
                base, ..
            } => base.size(),
            Self::Reference(RefKind::Object) => 8,
            Self::Reference(RefKind::Region) => 12,
            Self::Opaque {
                size, ..
            } => *size as u64,
        }
    }

    /// Checks the description against the constraints of its class.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Fixed {
                size, ..
            } => {
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(Error::InvalidArgument(format!(
                        "fixed-point size must be 1, 2, 4 or 8, got {size}"
                    )));
                }
            }
            Self::String {
                size, ..
            } => {
                if *size == 0 {
                    return Err(Error::InvalidArgument("string size must be non-zero".into()));
                }
            }
            Self::Array {
                dims,
                base,
            } => {
                if dims.is_empty() || dims.contains(&0) {
                    return Err(Error::InvalidArgument(
                        "array dimensions must be non-empty and non-zero".into(),
                    ));
                }
                base.validate()?;
            }
            Self::Enum {
                base,
                names,
                values,
            } => {
                if names.is_empty() || names.len() != values.len() {
                    return Err(Error::InvalidArgument(format!(
                        "enum requires parallel name/value lists, got {}/{}",
                        names.len(),
                        values.len()
                    )));
                }
                if !matches!(**base, Self::Fixed { .. }) {
                    return Err(Error::InvalidArgument(
                        "enum base type must be fixed-point".into(),
                    ));
                }
                base.validate()?;
            }
            Self::Opaque {
                tag,
                size,
            } => {
                if tag.is_empty() || !tag.is_ascii() {
                    return Err(Error::InvalidArgument("opaque tag must be non-empty ASCII".into()));
                }
                if *size == 0 {
                    return Err(Error::InvalidArgument("opaque size must be non-zero".into()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Encodes the datatype message into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Fixed {
                size,
                signed,
            } => {
                buf.push(1 << 4 | CLASS_FIXED);
                buf.push((*signed as u8) << 3);
                buf.extend_from_slice(&[0; 2]);
                put_u32(buf, *size);
                // Bit offset and precision
                put_u16(buf, 0);
                put_u16(buf, (*size * 8) as u16);
            }
            Self::Float32 => {
                buf.push(1 << 4 | CLASS_FLOAT);
                // Implied mantissa norm, sign bit at position 31
                buf.extend_from_slice(&[0x20, 31, 0]);
                put_u32(buf, 4);
                put_u16(buf, 0);
                put_u16(buf, 32);
                buf.extend_from_slice(&[23, 8, 0, 23]);
                put_u32(buf, 127);
            }
            Self::Float64 => {
                buf.push(1 << 4 | CLASS_FLOAT);
                buf.extend_from_slice(&[0x20, 63, 0]);
                put_u32(buf, 8);
                put_u16(buf, 0);
                put_u16(buf, 64);
                buf.extend_from_slice(&[52, 11, 0, 52]);
                put_u32(buf, 1023);
            }
            Self::String {
                size,
                pad,
                charset,
            } => {
                buf.push(1 << 4 | CLASS_STRING);
                buf.push(*pad as u8 | (*charset as u8) << 4);
                buf.extend_from_slice(&[0; 2]);
                put_u32(buf, *size);
            }
            Self::Array {
                dims,
                base,
            } => {
                buf.push(2 << 4 | CLASS_ARRAY);
                buf.extend_from_slice(&[0; 3]);
                put_u32(buf, self.size() as u32);
                buf.push(dims.len() as u8);
                buf.extend_from_slice(&[0; 3]);
                for d in dims {
                    put_u32(buf, *d);
                }
                // Permutation indices, unused
                for _ in dims {
                    put_u32(buf, 0);
                }
                base.encode(buf);
            }
            Self::Enum {
                base,
                names,
                values,
            } => {
                buf.push(1 << 4 | CLASS_ENUM);
                buf.push(names.len() as u8);
                buf.push((names.len() >> 8) as u8);
                buf.push(0);
                put_u32(buf, base.size() as u32);
                base.encode(buf);
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                    pad_to(buf, 8);
                }
                for v in values {
                    buf.extend_from_slice(&v.to_le_bytes()[..base.size() as usize]);
                }
            }
            Self::Reference(kind) => {
                buf.push(1 << 4 | CLASS_REFERENCE);
                buf.push(match kind {
                    RefKind::Object => 0,
                    RefKind::Region => 1,
                });
                buf.extend_from_slice(&[0; 2]);
                put_u32(buf, self.size() as u32);
            }
            Self::Opaque {
                tag,
                size,
            } => {
                let tag_len = tag.len().div_ceil(8) * 8;
                buf.push(1 << 4 | CLASS_OPAQUE);
                buf.push(tag_len as u8);
                buf.extend_from_slice(&[0; 2]);
                put_u32(buf, *size);
                buf.extend_from_slice(tag.as_bytes());
                buf.resize(buf.len() + tag_len - tag.len(), 0);
            }
        }
    }

    /// Returns the encoded message, freshly serialized.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decodes a datatype message from `r`.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let class_version = r.u8()?;
        let class = class_version & 0x0f;
        let bits = [r.u8()?, r.u8()?, r.u8()?];
        let size = r.u32()?;

        match class {
            CLASS_FIXED => {
                let signed = bits[0] & 1 << 3 != 0;
                r.u16()?;
                r.u16()?;
                Ok(Self::Fixed {
                    size,
                    signed,
                })
            }
            CLASS_FLOAT => {
                // Skip the bit-layout properties: only the two IEEE shapes
                // written above are supported
                r.bytes(12)?;
                match size {
                    4 => Ok(Self::Float32),
                    8 => Ok(Self::Float64),
                    _ => Err(Error::Unsupported(format!("{size}-byte float datatype"))),
                }
            }
            CLASS_STRING => {
                let pad = match bits[0] & 0x0f {
                    0 => StringPad::NullTerminate,
                    1 => StringPad::NullPad,
                    p => return Err(Error::Unsupported(format!("string padding {p}"))),
                };
                let charset = match bits[0] >> 4 {
                    0 => Charset::Ascii,
                    1 => Charset::Utf8,
                    c => return Err(Error::Unsupported(format!("string charset {c}"))),
                };
                Ok(Self::String {
                    size,
                    pad,
                    charset,
                })
            }
            CLASS_OPAQUE => {
                let tag_len = bits[0] as usize;
                let raw = r.bytes(tag_len)?;
                let end = raw.iter().position(|b| *b == 0).unwrap_or(tag_len);
                let tag = String::from_utf8_lossy(&raw[..end]).into_owned();
                Ok(Self::Opaque {
                    tag,
                    size,
                })
            }
            CLASS_REFERENCE => {
                let kind = match bits[0] & 0x0f {
                    0 => RefKind::Object,
                    _ => RefKind::Region,
                };
                Ok(Self::Reference(kind))
            }
            CLASS_ENUM => {
                let count = bits[0] as usize | (bits[1] as usize) << 8;
                let base = Box::new(Self::decode(r)?);
                let base_size = base.size() as usize;
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    let start = r.pos();
                    let mut name = Vec::new();
                    loop {
                        let b = r.u8()?;
                        if b == 0 {
                            break;
                        }
                        name.push(b);
                    }
                    // Names are null-padded to 8 bytes
                    let used = r.pos() - start;
                    r.bytes(used.div_ceil(8) * 8 - used)?;
                    names.push(String::from_utf8_lossy(&name).into_owned());
                }
                let signed = matches!(*base, Self::Fixed { signed: true, .. });
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let raw = r.bytes(base_size)?;
                    let fill = if signed && raw[base_size - 1] & 0x80 != 0 {
                        0xff
                    } else {
                        0
                    };
                    let mut v = [fill; 8];
                    v[..base_size].copy_from_slice(raw);
                    values.push(i64::from_le_bytes(v));
                }
                Ok(Self::Enum {
                    base,
                    names,
                    values,
                })
            }
            CLASS_ARRAY => {
                let rank = r.u8()? as usize;
                r.bytes(3)?;
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    dims.push(r.u32()?);
                }
                r.bytes(rank * 4)?;
                let base = Box::new(Self::decode(r)?);
                Ok(Self::Array {
                    dims,
                    base,
                })
            }
            _ => Err(Error::Unsupported(format!("datatype class {class}"))),
        }
    }
}

/// A predefined datatype registry entry.
pub struct Predefined {
    /// The tag the type is looked up by.
    pub name: &'static str,
    /// The constructor for the type.
    pub make: fn() -> Datatype,
}

/// The registry of predefined datatypes.
///
/// Built once, never mutated.
pub const PREDEFINED: &[Predefined] = &[
    Predefined {
        name: "int8",
        make: Datatype::int8,
    },
    Predefined {
        name: "int16",
        make: Datatype::int16,
    },
    Predefined {
        name: "int32",
        make: Datatype::int32,
    },
    Predefined {
        name: "int64",
        make: Datatype::int64,
    },
    Predefined {
        name: "uint8",
        make: Datatype::uint8,
    },
    Predefined {
        name: "uint16",
        make: Datatype::uint16,
    },
    Predefined {
        name: "uint32",
        make: Datatype::uint32,
    },
    Predefined {
        name: "uint64",
        make: Datatype::uint64,
    },
    Predefined {
        name: "float32",
        make: || Datatype::Float32,
    },
    Predefined {
        name: "float64",
        make: || Datatype::Float64,
    },
];

/// Returns the predefined datatype registered under `name`.
pub fn predefined(name: &str) -> Option<Datatype> {
    PREDEFINED.iter().find(|p| p.name == name).map(|p| (p.make)())
}
