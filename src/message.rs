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

//! Object header messages.
//!
//! An object header is a sequence of typed, length-prefixed messages. This
//! module defines the message kinds used by the library and their body
//! encodings; the header layout itself lives in `object_header`.

use crate::datatype::Datatype;
use crate::error::Error;
use crate::error::Result;
use crate::filter::Filter;
use crate::filter::Pipeline;
use crate::io::Reader;
use crate::io::UNDEFINED_ADDR;
use crate::io::put_u16;
use crate::io::put_u32;
use crate::io::put_u64;

/// Message type: NIL (padding).
pub const MSG_NIL: u8 = 0x00;
/// Message type: dataspace.
pub const MSG_DATASPACE: u8 = 0x01;
/// Message type: link info.
pub const MSG_LINK_INFO: u8 = 0x02;
/// Message type: datatype.
pub const MSG_DATATYPE: u8 = 0x03;
/// Message type: fill value.
pub const MSG_FILL_VALUE: u8 = 0x05;
/// Message type: link.
pub const MSG_LINK: u8 = 0x06;
/// Message type: data layout.
pub const MSG_LAYOUT: u8 = 0x08;
/// Message type: group info.
pub const MSG_GROUP_INFO: u8 = 0x0a;
/// Message type: filter pipeline.
pub const MSG_FILTER_PIPELINE: u8 = 0x0b;
/// Message type: attribute.
pub const MSG_ATTRIBUTE: u8 = 0x0c;
/// Message type: object header continuation.
pub const MSG_CONTINUATION: u8 = 0x10;
/// Message type: symbol table.
pub const MSG_SYMBOL_TABLE: u8 = 0x11;
/// Message type: attribute info.
pub const MSG_ATTRIBUTE_INFO: u8 = 0x15;
/// Message type: object reference count.
pub const MSG_REF_COUNT: u8 = 0x16;

/// Maximum dimension sentinel: the dimension is unlimited.
pub const UNLIMITED: u64 = u64::MAX;

/// A dataspace: the extent of a dataset or attribute.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dataspace {
    /// Current dimension sizes.
    pub dims: Vec<u64>,
    /// Maximum dimension sizes, each at least the current size or
    /// [`UNLIMITED`].
    pub max_dims: Option<Vec<u64>>,
}

impl Dataspace {
    /// Creates a dataspace of extent `dims`.
    pub fn new(dims: Vec<u64>) -> Self {
        Self {
            dims,
            max_dims: None,
        }
    }

    /// Creates a scalar dataspace.
    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    /// Returns the number of elements in the extent.
    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Tells whether any maximum dimension is unlimited.
    pub fn is_unlimited(&self) -> bool {
        self.max_dims
            .as_ref()
            .is_some_and(|m| m.contains(&UNLIMITED))
    }

    /// Checks dimensions against maximum dimensions.
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = &self.max_dims {
            if max.len() != self.dims.len() {
                return Err(Error::InvalidArgument(format!(
                    "max dims rank {} does not match rank {}",
                    max.len(),
                    self.dims.len()
                )));
            }
            for (d, m) in self.dims.iter().zip(max) {
                if *m != UNLIMITED && m < d {
                    return Err(Error::InvalidArgument(format!(
                        "max dim {m} smaller than current dim {d}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encodes the dataspace message body.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(1);
        buf.push(self.dims.len() as u8);
        buf.push(self.max_dims.is_some() as u8);
        buf.extend_from_slice(&[0; 5]);
        for d in &self.dims {
            put_u64(buf, *d);
        }
        if let Some(max) = &self.max_dims {
            for m in max {
                put_u64(buf, *m);
            }
        }
    }

    /// Decodes a dataspace message body.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u8()?;
        if version != 1 {
            return Err(Error::Unsupported(format!("dataspace version {version}")));
        }
        let rank = r.u8()? as usize;
        let flags = r.u8()?;
        r.bytes(5)?;
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(r.u64()?);
        }
        let max_dims = if flags & 1 != 0 {
            let mut max = Vec::with_capacity(rank);
            for _ in 0..rank {
                max.push(r.u64()?);
            }
            Some(max)
        } else {
            None
        };
        Ok(Self {
            dims,
            max_dims,
        })
    }
}

/// Data layout of a dataset.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// Raw data stored inside the object header.
    Compact {
        /// The raw data.
        data: Vec<u8>,
    },
    /// Raw data stored as a single run.
    Contiguous {
        /// Address of the run, or [`UNDEFINED_ADDR`] before allocation.
        addr: u64,
        /// Size of the run in bytes.
        size: u64,
    },
    /// Raw data stored in chunks indexed by a v1 B-tree.
    Chunked {
        /// Address of the chunk B-tree.
        btree_addr: u64,
        /// Chunk dimension sizes, in elements.
        dims: Vec<u32>,
        /// Element size in bytes, stored as the final chunk dimension.
        elem_size: u32,
    },
}

impl Layout {
    /// Encodes the data layout message body (version 3).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(3);
        match self {
            Self::Compact {
                data,
            } => {
                buf.push(0);
                put_u16(buf, data.len() as u16);
                buf.extend_from_slice(data);
            }
            Self::Contiguous {
                addr,
                size,
            } => {
                buf.push(1);
                put_u64(buf, *addr);
                put_u64(buf, *size);
            }
            Self::Chunked {
                btree_addr,
                dims,
                elem_size,
            } => {
                buf.push(2);
                buf.push(dims.len() as u8 + 1);
                put_u64(buf, *btree_addr);
                for d in dims {
                    put_u32(buf, *d);
                }
                put_u32(buf, *elem_size);
            }
        }
    }

    /// Decodes a data layout message body.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u8()?;
        if version != 3 {
            return Err(Error::Unsupported(format!("data layout version {version}")));
        }
        match r.u8()? {
            0 => {
                let size = r.u16()? as usize;
                Ok(Self::Compact {
                    data: r.bytes(size)?.to_vec(),
                })
            }
            1 => Ok(Self::Contiguous {
                addr: r.u64()?,
                size: r.u64()?,
            }),
            2 => {
                let rank = r.u8()? as usize;
                let btree_addr = r.u64()?;
                let mut dims = Vec::with_capacity(rank - 1);
                for _ in 0..rank - 1 {
                    dims.push(r.u32()?);
                }
                let elem_size = r.u32()?;
                Ok(Self::Chunked {
                    btree_addr,
                    dims,
                    elem_size,
                })
            }
            c => Err(Error::Unsupported(format!("data layout class {c}"))),
        }
    }
}

/// Fill value used for unwritten parts of a dataset.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FillValue {
    /// The fill value bytes, one element wide. `None` means all-zero fill.
    pub data: Option<Vec<u8>>,
}

impl FillValue {
    /// Encodes the fill value message body (version 2).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(2);
        // Space allocation: late, fill written at allocation
        buf.push(2);
        buf.push(0);
        buf.push(self.data.is_some() as u8);
        if let Some(data) = &self.data {
            put_u32(buf, data.len() as u32);
            buf.extend_from_slice(data);
        }
    }

    /// Decodes a fill value message body.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u8()?;
        if version != 2 {
            return Err(Error::Unsupported(format!("fill value version {version}")));
        }
        r.u8()?;
        r.u8()?;
        let data = if r.u8()? != 0 {
            let size = r.u32()? as usize;
            Some(r.bytes(size)?.to_vec())
        } else {
            None
        };
        Ok(Self {
            data,
        })
    }
}

/// Pointer to the dense link storage of a group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkInfo {
    /// Highest creation order assigned to a link so far.
    pub max_corder: u64,
    /// Address of the fractal heap holding the link records.
    pub fheap_addr: u64,
    /// Address of the name-index v2 B-tree.
    pub name_btree_addr: u64,
}

impl LinkInfo {
    /// Encodes the link info message body.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(0);
        // Creation order tracked, not indexed
        buf.push(0x01);
        put_u64(buf, self.max_corder);
        put_u64(buf, self.fheap_addr);
        put_u64(buf, self.name_btree_addr);
    }

    /// Decodes a link info message body.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u8()?;
        if version != 0 {
            return Err(Error::Unsupported(format!("link info version {version}")));
        }
        let flags = r.u8()?;
        let max_corder = if flags & 0x01 != 0 { r.u64()? } else { 0 };
        let fheap_addr = r.u64()?;
        let name_btree_addr = r.u64()?;
        if flags & 0x02 != 0 {
            // Creation order index, unused here
            r.u64()?;
        }
        Ok(Self {
            max_corder,
            fheap_addr,
            name_btree_addr,
        })
    }
}

/// Pointer to the dense attribute storage of an object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeInfo {
    /// Highest creation order assigned to an attribute so far.
    pub max_corder: u16,
    /// Address of the fractal heap holding the attribute messages.
    pub fheap_addr: u64,
    /// Address of the name-index v2 B-tree.
    pub name_btree_addr: u64,
}

impl AttributeInfo {
    /// Encodes the attribute info message body.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(0);
        buf.push(0x01);
        put_u16(buf, self.max_corder);
        put_u64(buf, self.fheap_addr);
        put_u64(buf, self.name_btree_addr);
    }

    /// Decodes an attribute info message body.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u8()?;
        if version != 0 {
            return Err(Error::Unsupported(format!("attribute info version {version}")));
        }
        let flags = r.u8()?;
        let max_corder = if flags & 0x01 != 0 { r.u16()? } else { 0 };
        let fheap_addr = r.u64()?;
        let name_btree_addr = r.u64()?;
        if flags & 0x02 != 0 {
            r.u64()?;
        }
        Ok(Self {
            max_corder,
            fheap_addr,
            name_btree_addr,
        })
    }
}

/// Target of a link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkTarget {
    /// Hard link: the address of the target's object header.
    Hard(u64),
    /// Soft link: an absolute path inside this file.
    Soft(String),
    /// External link: a path inside another file.
    External {
        /// Name of the external file.
        file: String,
        /// Absolute object path within the external file.
        path: String,
    },
}

/// A link from a group to an object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    /// The link's name within its group.
    pub name: String,
    /// Creation order of the link.
    pub corder: u64,
    /// The link's target.
    pub target: LinkTarget,
}

impl Link {
    /// Encodes the link message body (version 1).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let name_len = self.name.len() as u64;
        let (len_size_bits, len_size) = match name_len {
            0..0x100 => (0, 1),
            0x100..0x10000 => (1, 2),
            0x10000..0x100000000 => (2, 4),
            _ => (3, 8),
        };
        let explicit_type = !matches!(self.target, LinkTarget::Hard(_));
        buf.push(1);
        buf.push(len_size_bits | 1 << 2 | (explicit_type as u8) << 3);
        if explicit_type {
            buf.push(match self.target {
                LinkTarget::Soft(_) => 1,
                LinkTarget::External { .. } => 64,
                LinkTarget::Hard(_) => unreachable!(),
            });
        }
        put_u64(buf, self.corder);
        buf.extend_from_slice(&name_len.to_le_bytes()[..len_size]);
        buf.extend_from_slice(self.name.as_bytes());
        match &self.target {
            LinkTarget::Hard(addr) => put_u64(buf, *addr),
            LinkTarget::Soft(path) => {
                put_u16(buf, path.len() as u16);
                buf.extend_from_slice(path.as_bytes());
            }
            LinkTarget::External {
                file,
                path,
            } => {
                put_u16(buf, (1 + file.len() + 1 + path.len() + 1) as u16);
                buf.push(0);
                buf.extend_from_slice(file.as_bytes());
                buf.push(0);
                buf.extend_from_slice(path.as_bytes());
                buf.push(0);
            }
        }
    }

    /// Returns the encoded message body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decodes a link message body.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u8()?;
        if version != 1 {
            return Err(Error::Unsupported(format!("link message version {version}")));
        }
        let flags = r.u8()?;
        let link_type = if flags & 1 << 3 != 0 { r.u8()? } else { 0 };
        let corder = if flags & 1 << 2 != 0 { r.u64()? } else { 0 };
        if flags & 1 << 4 != 0 {
            // Name character set
            r.u8()?;
        }
        let len_size = 1 << (flags & 0x03);
        let mut len = [0u8; 8];
        len[..len_size].copy_from_slice(r.bytes(len_size)?);
        let name_len = u64::from_le_bytes(len) as usize;
        let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();

        let target = match link_type {
            0 => LinkTarget::Hard(r.u64()?),
            1 => {
                let len = r.u16()? as usize;
                LinkTarget::Soft(String::from_utf8_lossy(r.bytes(len)?).into_owned())
            }
            64 => {
                let len = r.u16()? as usize;
                let value = r.bytes(len)?;
                if value.is_empty() {
                    return Err(Error::format("link message", 0, "external link value", "empty"));
                }
                let mut parts = value[1..].split(|b| *b == 0);
                let file = parts.next().unwrap_or_default();
                let path = parts.next().unwrap_or_default();
                LinkTarget::External {
                    file: String::from_utf8_lossy(file).into_owned(),
                    path: String::from_utf8_lossy(path).into_owned(),
                }
            }
            t => return Err(Error::Unsupported(format!("link type {t}"))),
        };
        Ok(Self {
            name,
            corder,
            target,
        })
    }
}

/// An attribute: a named, typed value attached to an object.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    /// The attribute's name.
    pub name: String,
    /// The element datatype of the value.
    pub datatype: Datatype,
    /// The extent of the value.
    pub dataspace: Dataspace,
    /// The value, as raw little-endian element bytes.
    pub data: Vec<u8>,
}

impl Attribute {
    /// Encodes the attribute message body (version 1).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let dt = self.datatype.to_bytes();
        let mut ds = Vec::new();
        self.dataspace.encode(&mut ds);

        buf.push(1);
        buf.push(0);
        put_u16(buf, self.name.len() as u16 + 1);
        put_u16(buf, dt.len() as u16);
        put_u16(buf, ds.len() as u16);
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        crate::io::pad_to(buf, 8);
        buf.extend_from_slice(&dt);
        crate::io::pad_to(buf, 8);
        buf.extend_from_slice(&ds);
        crate::io::pad_to(buf, 8);
        buf.extend_from_slice(&self.data);
    }

    /// Returns the encoded message body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decodes an attribute message body.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u8()?;
        if version != 1 {
            return Err(Error::Unsupported(format!("attribute version {version}")));
        }
        r.u8()?;
        let name_size = r.u16()? as usize;
        let dt_size = r.u16()? as usize;
        let ds_size = r.u16()? as usize;

        let name_raw = r.bytes(name_size.div_ceil(8) * 8)?;
        let end = name_raw.iter().position(|b| *b == 0).unwrap_or(name_size);
        let name = String::from_utf8_lossy(&name_raw[..end]).into_owned();

        let dt_start = r.pos();
        let datatype = Datatype::decode(r)?;
        r.seek(dt_start + dt_size.div_ceil(8) * 8);

        let ds_start = r.pos();
        let dataspace = Dataspace::decode(r)?;
        r.seek(ds_start + ds_size.div_ceil(8) * 8);

        let data_len = datatype.size() * dataspace.element_count();
        let data = r.bytes(data_len as usize)?.to_vec();
        Ok(Self {
            name,
            datatype,
            dataspace,
            data,
        })
    }
}

/// Encodes the filter pipeline message body (version 1).
fn encode_pipeline(p: &Pipeline, buf: &mut Vec<u8>) {
    buf.push(1);
    buf.push(p.filters.len() as u8);
    buf.extend_from_slice(&[0; 6]);
    for f in &p.filters {
        put_u16(buf, f.id);
        put_u16(buf, 0);
        put_u16(buf, f.flags);
        put_u16(buf, f.client_data.len() as u16);
        for v in &f.client_data {
            put_u32(buf, *v);
        }
        if f.client_data.len() % 2 != 0 {
            put_u32(buf, 0);
        }
    }
}

/// Decodes a filter pipeline message body.
fn decode_pipeline(r: &mut Reader<'_>) -> Result<Pipeline> {
    let version = r.u8()?;
    if version != 1 {
        return Err(Error::Unsupported(format!("filter pipeline version {version}")));
    }
    let count = r.u8()? as usize;
    r.bytes(6)?;
    let mut filters = Vec::with_capacity(count);
    for _ in 0..count {
        let id = r.u16()?;
        let name_len = r.u16()? as usize;
        let flags = r.u16()?;
        let n_values = r.u16()? as usize;
        r.bytes(name_len)?;
        let mut client_data = Vec::with_capacity(n_values);
        for _ in 0..n_values {
            client_data.push(r.u32()?);
        }
        if n_values % 2 != 0 {
            r.u32()?;
        }
        filters.push(Filter {
            id,
            flags,
            client_data,
        });
    }
    Ok(Pipeline {
        filters,
    })
}

/// One object header message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Padding; the payload is `0` bytes of the given length.
    Nil(usize),
    /// Dataspace of a dataset.
    Dataspace(Dataspace),
    /// Dense link storage pointer.
    LinkInfo(LinkInfo),
    /// Datatype of a dataset.
    Datatype(Datatype),
    /// Fill value.
    FillValue(FillValue),
    /// A link stored compactly in the header.
    Link(Link),
    /// Data layout of a dataset.
    Layout(Layout),
    /// Group storage parameters; carried by indexed groups.
    GroupInfo,
    /// Filter pipeline of a chunked dataset.
    FilterPipeline(Pipeline),
    /// A compact attribute.
    Attribute(Attribute),
    /// Continuation: the header continues in another chunk.
    Continuation {
        /// Address of the continuation chunk.
        addr: u64,
        /// Length of the continuation chunk in bytes.
        length: u64,
    },
    /// Symbol table: pointers to a legacy group's B-tree and local heap.
    SymbolTable {
        /// Address of the v1 B-tree.
        btree_addr: u64,
        /// Address of the local heap.
        heap_addr: u64,
    },
    /// Dense attribute storage pointer.
    AttributeInfo(AttributeInfo),
    /// Object reference count, when different from 1.
    RefCount(u32),
}

impl Message {
    /// Returns the message's type id.
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Nil(_) => MSG_NIL,
            Self::Dataspace(_) => MSG_DATASPACE,
            Self::LinkInfo(_) => MSG_LINK_INFO,
            Self::Datatype(_) => MSG_DATATYPE,
            Self::FillValue(_) => MSG_FILL_VALUE,
            Self::Link(_) => MSG_LINK,
            Self::Layout(_) => MSG_LAYOUT,
            Self::GroupInfo => MSG_GROUP_INFO,
            Self::FilterPipeline(_) => MSG_FILTER_PIPELINE,
            Self::Attribute(_) => MSG_ATTRIBUTE,
            Self::Continuation { .. } => MSG_CONTINUATION,
            Self::SymbolTable { .. } => MSG_SYMBOL_TABLE,
            Self::AttributeInfo(_) => MSG_ATTRIBUTE_INFO,
            Self::RefCount(_) => MSG_REF_COUNT,
        }
    }

    /// Encodes the message body.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Nil(len) => buf.resize(*len, 0),
            Self::Dataspace(ds) => ds.encode(&mut buf),
            Self::LinkInfo(li) => li.encode(&mut buf),
            Self::Datatype(dt) => dt.encode(&mut buf),
            Self::FillValue(fv) => fv.encode(&mut buf),
            Self::Link(l) => l.encode(&mut buf),
            Self::Layout(l) => l.encode(&mut buf),
            Self::GroupInfo => buf.extend_from_slice(&[0, 0]),
            Self::FilterPipeline(p) => encode_pipeline(p, &mut buf),
            Self::Attribute(a) => a.encode(&mut buf),
            Self::Continuation {
                addr,
                length,
            } => {
                put_u64(&mut buf, *addr);
                put_u64(&mut buf, *length);
            }
            Self::SymbolTable {
                btree_addr,
                heap_addr,
            } => {
                put_u64(&mut buf, *btree_addr);
                put_u64(&mut buf, *heap_addr);
            }
            Self::AttributeInfo(ai) => ai.encode(&mut buf),
            Self::RefCount(count) => {
                buf.push(0);
                put_u32(&mut buf, *count);
            }
        }
        buf
    }

    /// Decodes a message body.
    ///
    /// Arguments:
    /// - `type_id` is the message's type.
    /// - `body` is the message's payload.
    /// - `base` is the payload's file offset, for error reporting.
    pub fn decode_body(type_id: u8, body: &[u8], base: u64) -> Result<Self> {
        let mut r = Reader::new(body, "object header message", base);
        match type_id {
            MSG_NIL => Ok(Self::Nil(body.len())),
            MSG_DATASPACE => Ok(Self::Dataspace(Dataspace::decode(&mut r)?)),
            MSG_LINK_INFO => Ok(Self::LinkInfo(LinkInfo::decode(&mut r)?)),
            MSG_DATATYPE => Ok(Self::Datatype(Datatype::decode(&mut r)?)),
            MSG_FILL_VALUE => Ok(Self::FillValue(FillValue::decode(&mut r)?)),
            MSG_LINK => Ok(Self::Link(Link::decode(&mut r)?)),
            MSG_LAYOUT => Ok(Self::Layout(Layout::decode(&mut r)?)),
            MSG_GROUP_INFO => Ok(Self::GroupInfo),
            MSG_FILTER_PIPELINE => Ok(Self::FilterPipeline(decode_pipeline(&mut r)?)),
            MSG_ATTRIBUTE => Ok(Self::Attribute(Attribute::decode(&mut r)?)),
            MSG_CONTINUATION => Ok(Self::Continuation {
                addr: r.u64()?,
                length: r.u64()?,
            }),
            MSG_SYMBOL_TABLE => Ok(Self::SymbolTable {
                btree_addr: r.u64()?,
                heap_addr: r.u64()?,
            }),
            MSG_ATTRIBUTE_INFO => Ok(Self::AttributeInfo(AttributeInfo::decode(&mut r)?)),
            MSG_REF_COUNT => {
                r.u8()?;
                Ok(Self::RefCount(r.u32()?))
            }
            t => Err(Error::Unsupported(format!("message type {t:#04x}"))),
        }
    }
}

/// Returns an undefined link info, for groups not yet dense.
impl Default for LinkInfo {
    fn default() -> Self {
        Self {
            max_corder: 0,
            fheap_addr: UNDEFINED_ADDR,
            name_btree_addr: UNDEFINED_ADDR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let body = msg.encode_body();
        Message::decode_body(msg.type_id(), &body, 0).unwrap()
    }

    #[test]
    fn dataspace_roundtrip() {
        let plain = Dataspace::new(vec![10, 20]);
        assert_eq!(roundtrip(&Message::Dataspace(plain.clone())), Message::Dataspace(plain));

        let unlimited = Dataspace {
            dims: vec![100],
            max_dims: Some(vec![UNLIMITED]),
        };
        assert!(unlimited.is_unlimited());
        assert_eq!(
            roundtrip(&Message::Dataspace(unlimited.clone())),
            Message::Dataspace(unlimited)
        );
    }

    #[test]
    fn dataspace_validation() {
        let bad = Dataspace {
            dims: vec![10],
            max_dims: Some(vec![5]),
        };
        assert!(bad.validate().is_err());

        let mismatch = Dataspace {
            dims: vec![10],
            max_dims: Some(vec![10, 10]),
        };
        assert!(mismatch.validate().is_err());
    }

    #[test]
    fn layout_roundtrip() {
        let contiguous = Message::Layout(Layout::Contiguous {
            addr: 0x1000,
            size: 4096,
        });
        assert_eq!(roundtrip(&contiguous), contiguous);

        let chunked = Message::Layout(Layout::Chunked {
            btree_addr: 0x2000,
            dims: vec![100],
            elem_size: 8,
        });
        assert_eq!(roundtrip(&chunked), chunked);
    }

    #[test]
    fn link_roundtrip() {
        let hard = Message::Link(Link {
            name: "data".into(),
            corder: 3,
            target: LinkTarget::Hard(0x30),
        });
        assert_eq!(roundtrip(&hard), hard);

        let soft = Message::Link(Link {
            name: "alias".into(),
            corder: 0,
            target: LinkTarget::Soft("/a/b".into()),
        });
        assert_eq!(roundtrip(&soft), soft);

        let ext = Message::Link(Link {
            name: "remote".into(),
            corder: 1,
            target: LinkTarget::External {
                file: "other.h5".into(),
                path: "/x".into(),
            },
        });
        assert_eq!(roundtrip(&ext), ext);
    }

    #[test]
    fn attribute_roundtrip() {
        let attr = Message::Attribute(Attribute {
            name: "temperature".into(),
            datatype: Datatype::int32(),
            dataspace: Dataspace::new(vec![4]),
            data: vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0],
        });
        assert_eq!(roundtrip(&attr), attr);
    }

    #[test]
    fn pipeline_roundtrip() {
        let p = crate::filter::Pipeline::from_options(true, Some(6), true, 8).unwrap();
        let msg = Message::FilterPipeline(p);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn info_messages_roundtrip() {
        let li = Message::LinkInfo(LinkInfo {
            max_corder: 12,
            fheap_addr: 0x100,
            name_btree_addr: 0x200,
        });
        assert_eq!(roundtrip(&li), li);

        let ai = Message::AttributeInfo(AttributeInfo {
            max_corder: 9,
            fheap_addr: 0x300,
            name_btree_addr: 0x400,
        });
        assert_eq!(roundtrip(&ai), ai);

        let rc = Message::RefCount(4);
        assert_eq!(roundtrip(&rc), rc);
    }
}
