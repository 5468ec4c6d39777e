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

//! Global heap: pooled storage for variable-length values.
//!
//! Values are grouped into collections of at least 4 KiB. Each stored value
//! gets a stable `(collection address, object index)` id; index 0 is reserved
//! for the trailing free space of a collection.

use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::align_up;
use crate::io::put_u16;
use crate::io::put_u32;
use crate::io::put_u64;
use log::debug;

/// Signature of a global heap collection.
const GCOL_SIGNATURE: &[u8; 4] = b"GCOL";
/// Size of a collection header.
const COLLECTION_HEADER: u64 = 16;
/// Size of an object header.
const OBJECT_HEADER: u64 = 16;
/// Minimum collection size.
const MIN_COLLECTION_SIZE: u64 = 4096;

/// Stable id of one global heap object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GlobalHeapId {
    /// Address of the collection.
    pub addr: u64,
    /// Index of the object within the collection.
    pub index: u32,
}

impl GlobalHeapId {
    /// Encodes the id as stored inside dataset elements, padded to 16 bytes.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.addr);
        put_u32(buf, self.index);
        put_u32(buf, 0);
    }

    /// Decodes an in-dataset id.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let addr = r.u64()?;
        let index = r.u32()?;
        r.u32()?;
        Ok(Self {
            addr,
            index,
        })
    }
}

/// Writer pooling values into global heap collections.
#[derive(Default)]
pub struct GlobalHeap {
    /// Address of the collection being filled, if any.
    addr: u64,
    /// Size of the collection being filled.
    size: u64,
    /// Objects of the collection being filled.
    objects: Vec<(u16, Vec<u8>)>,
    /// Bytes used, headers included.
    used: u64,
    /// Next object index.
    next_index: u16,
}

impl GlobalHeap {
    /// Creates a writer with no open collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` and returns its id.
    pub fn write(&mut self, storage: &mut dyn Storage, data: &[u8]) -> Result<GlobalHeapId> {
        let obj_size = OBJECT_HEADER + align_up(data.len(), 8) as u64;
        if self.addr == 0 || self.used + obj_size > self.size {
            let size = (COLLECTION_HEADER + obj_size)
                .max(MIN_COLLECTION_SIZE)
                .div_ceil(MIN_COLLECTION_SIZE)
                * MIN_COLLECTION_SIZE;
            self.addr = storage.allocate(size)?;
            self.size = size;
            self.objects = Vec::new();
            self.used = COLLECTION_HEADER;
            self.next_index = 1;
            debug!("global heap collection at {:#x}, {size} bytes", self.addr);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.objects.push((index, data.to_vec()));
        self.used += obj_size;
        self.persist(storage)?;
        Ok(GlobalHeapId {
            addr: self.addr,
            index: index as u32,
        })
    }

    /// Writes the open collection back to storage.
    fn persist(&self, storage: &mut dyn Storage) -> Result<()> {
        let mut buf = Vec::with_capacity(self.size as usize);
        buf.extend_from_slice(GCOL_SIGNATURE);
        buf.push(1);
        buf.extend_from_slice(&[0; 3]);
        put_u64(&mut buf, self.size);
        for (index, data) in &self.objects {
            put_u16(&mut buf, *index);
            put_u16(&mut buf, 1);
            put_u32(&mut buf, 0);
            put_u64(&mut buf, data.len() as u64);
            buf.extend_from_slice(data);
            crate::io::pad_to(&mut buf, 8);
        }
        // Object 0 marks the trailing free space
        let free = self.size - self.used;
        if free >= OBJECT_HEADER {
            put_u16(&mut buf, 0);
            put_u16(&mut buf, 0);
            put_u32(&mut buf, 0);
            put_u64(&mut buf, free - OBJECT_HEADER);
        }
        buf.resize(self.size as usize, 0);
        storage.write_at(self.addr, &buf)?;
        Ok(())
    }

    /// Reads back the object identified by `id`.
    pub fn read(storage: &mut dyn Storage, id: GlobalHeapId) -> Result<Vec<u8>> {
        let mut header = [0u8; COLLECTION_HEADER as usize];
        storage.read_at(id.addr, &mut header)?;
        let mut r = Reader::new(&header, "global heap collection", id.addr);
        r.signature(GCOL_SIGNATURE)?;
        let version = r.u8()?;
        if version != 1 {
            return Err(Error::format("global heap collection", id.addr, "version 1", version));
        }
        r.bytes(3)?;
        let size = r.u64()?;

        let mut data = vec![0; (size - COLLECTION_HEADER) as usize];
        storage.read_at(id.addr + COLLECTION_HEADER, &mut data)?;
        let mut r = Reader::new(&data, "global heap collection", id.addr + COLLECTION_HEADER);
        while r.remaining() >= OBJECT_HEADER as usize {
            let index = r.u16()?;
            r.u16()?;
            r.u32()?;
            let obj_size = r.u64()? as usize;
            if index == 0 {
                break;
            }
            let payload = r.bytes(align_up(obj_size, 8))?;
            if index as u32 == id.index {
                return Ok(payload[..obj_size].to_vec());
            }
        }
        Err(Error::NotFound(format!(
            "global heap object {} in collection {:#x}",
            id.index, id.addr
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    #[test]
    fn write_read_roundtrip() {
        let mut storage = MemStorage::new();
        let mut heap = GlobalHeap::new();

        let a = heap.write(&mut storage, b"first value").unwrap();
        let b = heap.write(&mut storage, b"second, longer value").unwrap();
        assert_eq!(a.addr, b.addr);
        assert_eq!(a.index, 1);
        assert_eq!(b.index, 2);

        assert_eq!(GlobalHeap::read(&mut storage, a).unwrap(), b"first value");
        assert_eq!(GlobalHeap::read(&mut storage, b).unwrap(), b"second, longer value");
    }

    #[test]
    fn full_collection_starts_new_one() {
        let mut storage = MemStorage::new();
        let mut heap = GlobalHeap::new();

        let mut ids = Vec::new();
        for i in 0..8 {
            let data = vec![i as u8; 900];
            ids.push((heap.write(&mut storage, &data).unwrap(), data));
        }
        assert!(ids.iter().any(|(id, _)| id.addr != ids[0].0.addr));
        for (id, data) in ids {
            assert_eq!(GlobalHeap::read(&mut storage, id).unwrap(), data);
        }
    }

    #[test]
    fn oversized_object_gets_large_collection() {
        let mut storage = MemStorage::new();
        let mut heap = GlobalHeap::new();

        let big = vec![0xabu8; 10000];
        let id = heap.write(&mut storage, &big).unwrap();
        assert_eq!(GlobalHeap::read(&mut storage, id).unwrap(), big);
    }

    #[test]
    fn id_encoding_roundtrip() {
        let id = GlobalHeapId {
            addr: 0x12345,
            index: 7,
        };
        let mut buf = Vec::new();
        id.encode(&mut buf);
        assert_eq!(buf.len(), 16);
        let mut r = Reader::new(&buf, "heap id", 0);
        assert_eq!(GlobalHeapId::decode(&mut r).unwrap(), id);
    }

    #[test]
    fn missing_object() {
        let mut storage = MemStorage::new();
        let mut heap = GlobalHeap::new();
        let id = heap.write(&mut storage, b"x").unwrap();

        let missing = GlobalHeapId {
            addr: id.addr,
            index: 99,
        };
        assert!(matches!(
            GlobalHeap::read(&mut storage, missing),
            Err(Error::NotFound(_))
        ));
    }
}
