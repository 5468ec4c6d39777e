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

//! Object header assembly.
//!
//! An object header identifies one group or dataset and carries its messages
//! in one or more chunks. Chunks already written keep their addresses on
//! rewrite; when new messages do not fit, the trailing chunk grows in place if
//! the allocator has not moved past it, otherwise a continuation chunk is
//! allocated and linked.

use crate::checksum::lookup3;
use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::UNDEFINED_ADDR;
use crate::io::align_up;
use crate::io::put_u16;
use crate::io::put_u32;
use crate::message::AttributeInfo;
use crate::message::LinkInfo;
use crate::message::Message;
use crate::message::MSG_ATTRIBUTE_INFO;
use crate::message::MSG_CONTINUATION;
use crate::message::MSG_DATASPACE;
use crate::message::MSG_DATATYPE;
use crate::message::MSG_LAYOUT;
use crate::message::MSG_LINK_INFO;
use crate::message::MSG_NIL;
use crate::message::MSG_REF_COUNT;
use crate::message::MSG_SYMBOL_TABLE;
use log::debug;
use std::collections::VecDeque;

/// Signature of a version 2 object header.
const OHDR_SIGNATURE: &[u8; 4] = b"OHDR";
/// Signature of a version 2 continuation chunk.
const OCHK_SIGNATURE: &[u8; 4] = b"OCHK";

/// Size of the version 1 header prefix, including the padding aligning the
/// first message to 8 bytes.
const V1_PREFIX: usize = 16;
/// Size of a version 1 message header.
const V1_MSG_HEADER: usize = 8;
/// Size of the version 2 header prefix, with a 4-byte chunk-0 size field.
const V2_PREFIX: usize = 10;
/// Size of a version 2 message header.
const V2_MSG_HEADER: usize = 4;
/// Per-chunk overhead of a version 2 continuation chunk.
const V2_CONT_OVERHEAD: usize = 8;

/// Object header layout version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderVersion {
    /// Legacy layout, required under a v0 superblock.
    V1,
    /// Modern checksummed layout.
    V2,
}

/// One on-disk chunk of an object header.
#[derive(Clone, Debug)]
struct Chunk {
    /// Address of the chunk block.
    addr: u64,
    /// Total size of the chunk block.
    size: u64,
}

/// An object header and its messages.
#[derive(Debug)]
pub struct ObjectHeader {
    /// The layout version.
    pub version: HeaderVersion,
    /// Address of the header, [`UNDEFINED_ADDR`] until first written.
    pub addr: u64,
    /// The object's reference count.
    pub refcount: u32,
    /// The messages, in creation order.
    pub messages: Vec<Message>,
    /// Chunks already on disk.
    chunks: Vec<Chunk>,
}

impl ObjectHeader {
    /// Creates an empty header with a reference count of 1.
    pub fn new(version: HeaderVersion) -> Self {
        Self {
            version,
            addr: UNDEFINED_ADDR,
            refcount: 1,
            messages: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Appends the message `msg`.
    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// Returns the first message with the given type id.
    pub fn first_message(&self, type_id: u8) -> Option<&Message> {
        self.messages.iter().find(|m| m.type_id() == type_id)
    }

    /// Returns the dense attribute storage pointer, if any.
    pub fn attribute_info(&self) -> Option<&AttributeInfo> {
        match self.first_message(MSG_ATTRIBUTE_INFO) {
            Some(Message::AttributeInfo(ai)) => Some(ai),
            _ => None,
        }
    }

    /// Returns the dense link storage pointer, if any.
    pub fn link_info(&self) -> Option<&LinkInfo> {
        match self.first_message(MSG_LINK_INFO) {
            Some(Message::LinkInfo(li)) => Some(li),
            _ => None,
        }
    }

    /// Returns the symbol table pointers `(btree_addr, heap_addr)`, if any.
    pub fn symbol_table(&self) -> Option<(u64, u64)> {
        match self.first_message(MSG_SYMBOL_TABLE) {
            Some(Message::SymbolTable {
                btree_addr,
                heap_addr,
            }) => Some((*btree_addr, *heap_addr)),
            _ => None,
        }
    }

    /// Checks the message-set invariants.
    ///
    /// A header carries at most one datatype, dataspace and layout, and a
    /// symbol table excludes dense link storage.
    fn check_invariants(&self) -> Result<()> {
        for t in [MSG_DATATYPE, MSG_DATASPACE, MSG_LAYOUT] {
            if self.messages.iter().filter(|m| m.type_id() == t).count() > 1 {
                return Err(Error::InvalidArgument(format!(
                    "object header holds more than one message of type {t:#04x}"
                )));
            }
        }
        let symbol_table = self.first_message(MSG_SYMBOL_TABLE).is_some();
        let link_info = self.first_message(MSG_LINK_INFO).is_some();
        if symbol_table && link_info {
            return Err(Error::InvalidArgument(
                "object header holds both a symbol table and link info".into(),
            ));
        }
        Ok(())
    }

    /// Size of a message header for this layout version.
    fn msg_header_size(&self) -> usize {
        match self.version {
            HeaderVersion::V1 => V1_MSG_HEADER,
            HeaderVersion::V2 => V2_MSG_HEADER,
        }
    }

    /// On-disk size of a message with a body of `body_len` bytes.
    fn slot_size(&self, body_len: usize) -> usize {
        match self.version {
            HeaderVersion::V1 => V1_MSG_HEADER + align_up(body_len, 8),
            HeaderVersion::V2 => V2_MSG_HEADER + body_len,
        }
    }

    /// Size of a continuation message slot.
    fn cont_slot_size(&self) -> usize {
        self.slot_size(16)
    }

    /// Per-chunk overhead outside the message region.
    ///
    /// `first` selects the prefix chunk.
    fn chunk_overhead(&self, first: bool) -> usize {
        match (self.version, first) {
            (HeaderVersion::V1, true) => V1_PREFIX,
            (HeaderVersion::V1, false) => 0,
            (HeaderVersion::V2, true) => V2_PREFIX + 4,
            (HeaderVersion::V2, false) => V2_CONT_OVERHEAD,
        }
    }

    /// Encodes the logical messages, synchronizing the reference count
    /// representation with the layout version.
    fn encoded_messages(&self) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        for msg in &self.messages {
            // The count lives in the v1 prefix; as a message it only exists
            // in v2 headers, and only when not 1
            if msg.type_id() == MSG_REF_COUNT {
                continue;
            }
            out.push((msg.type_id(), msg.encode_body()));
        }
        if self.version == HeaderVersion::V2 && self.refcount != 1 {
            out.push((MSG_REF_COUNT, Message::RefCount(self.refcount).encode_body()));
        }
        out
    }

    /// Writes a fresh header, allocating a single chunk fitting every
    /// message. Returns the header's address.
    pub fn write_new(&mut self, storage: &mut dyn Storage) -> Result<u64> {
        self.check_invariants()?;
        let bodies = self.encoded_messages();
        self.check_body_sizes(&bodies)?;
        let region: usize = bodies.iter().map(|(_, b)| self.slot_size(b.len())).sum();
        let total = self.chunk_overhead(true) + region;
        let addr = storage.allocate(total as u64)?;
        self.addr = addr;
        self.chunks = vec![Chunk {
            addr,
            size: total as u64,
        }];
        debug!("object header at {addr:#x}: {} messages, {total} bytes", bodies.len());
        self.write_chunks(storage, &bodies)
    }

    /// Simulates packing `bodies` into the existing chunks, front to back.
    ///
    /// Returns the free bytes left in the last chunk and the total slot size
    /// of the messages that did not fit. `reserve_cont_in_last` also sets
    /// aside room for a continuation message in the last chunk, for when a
    /// new chunk is about to be appended.
    fn simulate(&self, bodies: &[(u8, Vec<u8>)], reserve_cont_in_last: bool) -> (usize, usize) {
        let mut idx = 0;
        let mut free_last = 0;
        for i in 0..self.chunks.len() {
            let mut cap = self.chunks[i].size as usize - self.chunk_overhead(i == 0);
            if i + 1 < self.chunks.len() || reserve_cont_in_last {
                cap = cap.saturating_sub(self.cont_slot_size());
            }
            let mut used = 0;
            while idx < bodies.len() {
                let slot = self.slot_size(bodies[idx].1.len());
                if used + slot > cap {
                    break;
                }
                used += slot;
                idx += 1;
            }
            if i == self.chunks.len() - 1 {
                free_last = cap - used;
            }
        }
        let spill = bodies[idx..]
            .iter()
            .map(|(_, b)| self.slot_size(b.len()))
            .sum();
        (free_last, spill)
    }

    /// Checks that every message body fits its size field.
    fn check_body_sizes(&self, bodies: &[(u8, Vec<u8>)]) -> Result<()> {
        for (type_id, body) in bodies {
            if align_up(body.len(), 8) > u16::MAX as usize {
                return Err(Error::Overflow(format!(
                    "message of type {type_id:#04x} is {} bytes, exceeding the size field",
                    body.len()
                )));
            }
        }
        Ok(())
    }

    /// Rewrites the header after its messages changed.
    ///
    /// Chunks keep their addresses. If the messages no longer fit, the
    /// trailing chunk grows in place when it still ends at the allocation
    /// point, otherwise a continuation chunk is allocated.
    pub fn rewrite(&mut self, storage: &mut dyn Storage) -> Result<()> {
        self.check_invariants()?;
        let bodies = self.encoded_messages();
        self.check_body_sizes(&bodies)?;

        let (free_last, spill) = self.simulate(&bodies, false);
        if spill > 0 {
            let last = self.chunks.last().unwrap();
            if last.addr + last.size == storage.eof() {
                // The allocator has not handed out the following address
                let grow = align_up(spill - free_last, 8) as u64;
                storage.allocate(grow)?;
                self.chunks.last_mut().unwrap().size += grow;
                debug!("object header at {:#x}: trailing chunk grown by {grow}", self.addr);
            } else {
                // The chunk before the new one loses room to the continuation
                // message, so the spill is resimulated with it reserved
                let (_, spill) = self.simulate(&bodies, true);
                let size = (self.chunk_overhead(false) + spill) as u64;
                let addr = storage.allocate(size)?;
                self.chunks.push(Chunk {
                    addr,
                    size,
                });
                debug!("object header at {:#x}: continuation chunk at {addr:#x}", self.addr);
            }
        }
        self.write_chunks(storage, &bodies)?;
        Ok(())
    }

    /// Distributes `bodies` over the chunks and writes every chunk.
    fn write_chunks(&mut self, storage: &mut dyn Storage, bodies: &[(u8, Vec<u8>)]) -> Result<u64> {
        // Assign messages to chunks, front to back; every chunk but the last
        // also carries a continuation message to its successor
        let mut pending: VecDeque<&(u8, Vec<u8>)> = bodies.iter().collect();
        let mut assignment: Vec<Vec<&(u8, Vec<u8>)>> = Vec::with_capacity(self.chunks.len());
        for i in 0..self.chunks.len() {
            let mut cap = self.chunks[i].size as usize - self.chunk_overhead(i == 0);
            if i + 1 < self.chunks.len() {
                cap = cap
                    .checked_sub(self.cont_slot_size())
                    .ok_or_else(|| Error::Overflow("object header chunk too small".into()))?;
            }
            let mut used = 0;
            let mut msgs = Vec::new();
            while let Some(next) = pending.front() {
                let slot = self.slot_size(next.1.len());
                if used + slot > cap {
                    break;
                }
                used += slot;
                msgs.push(pending.pop_front().unwrap());
            }
            assignment.push(msgs);
        }
        if !pending.is_empty() {
            return Err(Error::Overflow(format!(
                "{} object header messages left without a chunk",
                pending.len()
            )));
        }

        // The v1 prefix stores the total message count, padding included
        let mut total_count = 0;
        let mut serialized = Vec::with_capacity(self.chunks.len());
        for i in 0..self.chunks.len() {
            let next = self.chunks.get(i + 1).map(|c| (c.addr, c.size));
            let (chunk, count) = self.serialize_chunk(i, &assignment[i], next);
            total_count += count;
            serialized.push(chunk);
        }
        if self.version == HeaderVersion::V1 {
            let region = self.chunks[0].size as usize - V1_PREFIX;
            let mut prefix = Vec::with_capacity(V1_PREFIX);
            prefix.push(1);
            prefix.push(0);
            put_u16(&mut prefix, total_count as u16);
            put_u32(&mut prefix, self.refcount);
            put_u32(&mut prefix, region as u32);
            prefix.extend_from_slice(&[0; 4]);
            serialized[0].splice(0..0, prefix);
        }
        for (chunk, data) in self.chunks.iter().zip(&serialized) {
            debug_assert_eq!(data.len() as u64, chunk.size);
            storage.write_at(chunk.addr, data)?;
        }
        Ok(self.addr)
    }

    /// Serializes the chunk at index `i` holding the messages `msgs`,
    /// without the v1 prefix. Returns the bytes and the number of messages
    /// written, padding included.
    fn serialize_chunk(
        &self,
        i: usize,
        msgs: &[&(u8, Vec<u8>)],
        next: Option<(u64, u64)>,
    ) -> (Vec<u8>, usize) {
        let chunk = &self.chunks[i];
        let first = i == 0;
        let mut count = 0;
        let mut buf = Vec::with_capacity(chunk.size as usize);

        match (self.version, first) {
            (HeaderVersion::V1, _) => {}
            (HeaderVersion::V2, true) => {
                buf.extend_from_slice(OHDR_SIGNATURE);
                buf.push(2);
                // Flags: 4-byte chunk-0 size field
                buf.push(0x02);
                put_u32(&mut buf, (chunk.size - (V2_PREFIX as u64 + 4)) as u32);
            }
            (HeaderVersion::V2, false) => buf.extend_from_slice(OCHK_SIGNATURE),
        }

        let mut write_msg = |buf: &mut Vec<u8>, type_id: u8, body: &[u8]| {
            match self.version {
                HeaderVersion::V1 => {
                    put_u16(buf, type_id as u16);
                    put_u16(buf, align_up(body.len(), 8) as u16);
                    buf.extend_from_slice(&[0; 4]);
                    buf.extend_from_slice(body);
                    crate::io::pad_to(buf, 8);
                }
                HeaderVersion::V2 => {
                    buf.push(type_id);
                    put_u16(buf, body.len() as u16);
                    buf.push(0);
                    buf.extend_from_slice(body);
                }
            }
        };

        for (type_id, body) in msgs {
            write_msg(&mut buf, *type_id, body);
            count += 1;
        }
        if let Some((addr, length)) = next {
            let cont = Message::Continuation {
                addr,
                length,
            };
            write_msg(&mut buf, MSG_CONTINUATION, &cont.encode_body());
            count += 1;
        }

        // Fill the leftover with NIL messages, or leave a gap smaller than
        // a message header. A NIL body is capped by its u16 size field.
        let end = chunk.size as usize
            - match (self.version, first) {
                (HeaderVersion::V1, true) => V1_PREFIX,
                (HeaderVersion::V2, _) => 4,
                _ => 0,
            };
        while end - buf.len() >= self.msg_header_size() {
            let body = (end - buf.len() - self.msg_header_size()).min(0xfff8);
            write_msg(&mut buf, MSG_NIL, &vec![0; body]);
            count += 1;
        }
        buf.resize(end, 0);

        if self.version == HeaderVersion::V2 {
            let sum = lookup3(&buf);
            put_u32(&mut buf, sum);
        }
        (buf, count)
    }

    /// Loads the object header at `addr`.
    pub fn load(storage: &mut dyn Storage, addr: u64) -> Result<Self> {
        let mut sig = [0u8; 4];
        storage.read_at(addr, &mut sig)?;
        if sig == *OHDR_SIGNATURE {
            Self::load_v2(storage, addr)
        } else if sig[0] == 1 {
            Self::load_v1(storage, addr)
        } else {
            Err(Error::format(
                "object header",
                addr,
                "OHDR signature or version 1",
                format!("{sig:02x?}"),
            ))
        }
    }

    /// Loads a version 1 header.
    fn load_v1(storage: &mut dyn Storage, addr: u64) -> Result<Self> {
        let mut prefix = [0u8; V1_PREFIX];
        storage.read_at(addr, &mut prefix)?;
        let mut r = Reader::new(&prefix, "object header", addr);
        r.u8()?;
        r.u8()?;
        let nmsgs = r.u16()?;
        let refcount = r.u32()?;
        let region = r.u32()? as u64;

        let mut header = Self {
            version: HeaderVersion::V1,
            addr,
            refcount,
            messages: Vec::new(),
            chunks: vec![Chunk {
                addr,
                size: V1_PREFIX as u64 + region,
            }],
        };

        let mut parsed = 0;
        let mut queue = VecDeque::from([(addr + V1_PREFIX as u64, region)]);
        while let Some((chunk_addr, len)) = queue.pop_front() {
            let mut data = vec![0; len as usize];
            storage.read_at(chunk_addr, &mut data)?;
            let mut r = Reader::new(&data, "object header", chunk_addr);
            while parsed < nmsgs && r.remaining() >= V1_MSG_HEADER {
                let type_id = r.u16()? as u8;
                let size = r.u16()? as usize;
                r.bytes(4)?;
                let base = chunk_addr + r.pos() as u64;
                let body = r.bytes(size)?;
                parsed += 1;
                let msg = Message::decode_body(type_id, body, base)?;
                if let Message::Continuation {
                    addr,
                    length,
                } = msg
                {
                    header.chunks.push(Chunk {
                        addr,
                        size: length,
                    });
                    queue.push_back((addr, length));
                } else if !matches!(msg, Message::Nil(_)) {
                    header.messages.push(msg);
                }
            }
        }
        Ok(header)
    }

    /// Loads a version 2 header, verifying every chunk checksum.
    fn load_v2(storage: &mut dyn Storage, addr: u64) -> Result<Self> {
        let mut prefix = [0u8; V2_PREFIX];
        storage.read_at(addr, &mut prefix)?;
        let mut r = Reader::new(&prefix, "object header", addr);
        r.signature(OHDR_SIGNATURE)?;
        let version = r.u8()?;
        if version != 2 {
            return Err(Error::format("object header", addr, "version 2", version));
        }
        let flags = r.u8()?;
        if flags & 0x20 != 0 {
            return Err(Error::Unsupported("object header with stored times".into()));
        }
        let size_width = 1usize << (flags & 0x03);
        let mut size_buf = [0u8; 8];
        storage.read_at(addr + 6, &mut size_buf[..size_width])?;
        let region = u64::from_le_bytes(size_buf);
        let prefix_len = 6 + size_width as u64;

        let mut header = Self {
            version: HeaderVersion::V2,
            addr,
            refcount: 1,
            messages: Vec::new(),
            chunks: vec![Chunk {
                addr,
                size: prefix_len + region + 4,
            }],
        };

        // (block address, block length, message region offset within block)
        let mut queue = VecDeque::from([(addr, prefix_len + region + 4, prefix_len)]);
        while let Some((chunk_addr, len, skip)) = queue.pop_front() {
            let mut data = vec![0; len as usize];
            storage.read_at(chunk_addr, &mut data)?;
            let stored = u32::from_le_bytes(data[len as usize - 4..].try_into().unwrap());
            let sum = lookup3(&data[..len as usize - 4]);
            if sum != stored {
                return Err(Error::format(
                    "object header",
                    chunk_addr,
                    format!("checksum {stored:#010x}"),
                    format!("{sum:#010x}"),
                ));
            }
            if chunk_addr != addr {
                let mut r = Reader::new(&data, "object header continuation", chunk_addr);
                r.signature(OCHK_SIGNATURE)?;
            }

            let mut r = Reader::new(&data[..len as usize - 4], "object header", chunk_addr);
            r.seek(skip as usize);
            while r.remaining() >= V2_MSG_HEADER {
                let type_id = r.u8()?;
                let size = r.u16()? as usize;
                r.u8()?;
                let base = chunk_addr + r.pos() as u64;
                let body = r.bytes(size)?;
                let msg = Message::decode_body(type_id, body, base)?;
                match msg {
                    Message::Continuation {
                        addr,
                        length,
                    } => {
                        header.chunks.push(Chunk {
                            addr,
                            size: length,
                        });
                        queue.push_back((addr, length, 4));
                    }
                    Message::Nil(_) => {}
                    Message::RefCount(count) => header.refcount = count,
                    msg => header.messages.push(msg),
                }
            }
        }
        Ok(header)
    }
}
