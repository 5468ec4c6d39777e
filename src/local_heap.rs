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

//! Local heap: name storage for symbol-table groups.
//!
//! A local heap is a header plus a data segment of null-terminated byte
//! sequences, addressed by offset. The segment only grows; when capacity is
//! exceeded it is relocated to a larger allocation and the header is updated
//! in place, abandoning the old segment.

use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::align_up;
use crate::io::put_u64;
use log::debug;

/// Signature of a local heap header.
const HEAP_SIGNATURE: &[u8; 4] = b"HEAP";
/// Size of a local heap header.
const HEADER_SIZE: u64 = 32;
/// Initial size of the data segment.
const INITIAL_SEGMENT_SIZE: u64 = 256;
/// Free list null marker.
const FREE_LIST_NULL: u64 = 1;
/// Minimum encodable free block: next pointer plus size.
const MIN_FREE_BLOCK: u64 = 16;

/// A local heap.
pub struct LocalHeap {
    /// Address of the header.
    pub addr: u64,
    /// Address of the data segment.
    seg_addr: u64,
    /// Size of the data segment.
    seg_size: u64,
    /// Offset of the first free byte in the segment.
    used: u64,
    /// Cached segment content.
    data: Vec<u8>,
}

impl LocalHeap {
    /// Creates a heap, allocating the header then the data segment.
    ///
    /// The first 8 bytes of the segment are reserved so that offset 0 always
    /// holds an empty string.
    pub fn create(storage: &mut dyn Storage) -> Result<Self> {
        let addr = storage.allocate(HEADER_SIZE)?;
        let seg_addr = storage.allocate(INITIAL_SEGMENT_SIZE)?;
        let heap = Self {
            addr,
            seg_addr,
            seg_size: INITIAL_SEGMENT_SIZE,
            used: 8,
            data: vec![0; INITIAL_SEGMENT_SIZE as usize],
        };
        heap.write(storage)?;
        Ok(heap)
    }

    /// Loads the heap whose header is at `addr`.
    pub fn load(storage: &mut dyn Storage, addr: u64) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        storage.read_at(addr, &mut buf)?;
        let mut r = Reader::new(&buf, "local heap", addr);
        r.signature(HEAP_SIGNATURE)?;
        let version = r.u8()?;
        if version != 0 {
            return Err(Error::format("local heap", addr, "version 0", version));
        }
        r.bytes(3)?;
        let seg_size = r.u64()?;
        let free_head = r.u64()?;
        let seg_addr = r.u64()?;

        let mut data = vec![0; seg_size as usize];
        storage.read_at(seg_addr, &mut data)?;
        // A single trailing free block is maintained, so its offset is also
        // the used size
        let used = if free_head == FREE_LIST_NULL {
            seg_size
        } else {
            free_head
        };
        Ok(Self {
            addr,
            seg_addr,
            seg_size,
            used,
            data,
        })
    }

    /// Appends the string `name` and returns its offset in the segment.
    pub fn add_string(&mut self, storage: &mut dyn Storage, name: &str) -> Result<u64> {
        let needed = align_up(name.len() + 1, 8) as u64;
        if self.used + needed > self.seg_size {
            let mut new_size = self.seg_size * 2;
            while self.used + needed > new_size {
                new_size *= 2;
            }
            let new_addr = storage.allocate(new_size)?;
            debug!(
                "local heap {:#x}: segment relocated {:#x} -> {new_addr:#x} ({new_size} bytes)",
                self.addr, self.seg_addr
            );
            self.seg_addr = new_addr;
            self.seg_size = new_size;
            self.data.resize(new_size as usize, 0);
        }

        let off = self.used;
        let end = off as usize + name.len();
        self.data[off as usize..end].copy_from_slice(name.as_bytes());
        self.data[end] = 0;
        self.used += needed;
        self.write(storage)?;
        Ok(off)
    }

    /// Returns the null-terminated string at `off`.
    pub fn string_at(&self, off: u64) -> Result<&[u8]> {
        let start = off as usize;
        if start >= self.data.len() {
            return Err(Error::format(
                "local heap",
                self.seg_addr + off,
                format!("offset below {}", self.data.len()),
                off,
            ));
        }
        let end = self.data[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|p| start + p)
            .ok_or_else(|| {
                Error::format("local heap", self.seg_addr + off, "null terminator", "none")
            })?;
        Ok(&self.data[start..end])
    }

    /// Writes the header and the data segment.
    fn write(&self, storage: &mut dyn Storage) -> Result<()> {
        // Trailing free block, when large enough to be described
        let free_head = if self.seg_size - self.used >= MIN_FREE_BLOCK {
            self.used
        } else {
            FREE_LIST_NULL
        };

        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(HEAP_SIGNATURE);
        header.extend_from_slice(&[0; 4]);
        put_u64(&mut header, self.seg_size);
        put_u64(&mut header, free_head);
        put_u64(&mut header, self.seg_addr);
        storage.write_at(self.addr, &header)?;

        let mut data = self.data.clone();
        if free_head != FREE_LIST_NULL {
            let off = self.used as usize;
            data[off..off + 8].copy_from_slice(&FREE_LIST_NULL.to_le_bytes());
            data[off + 8..off + 16].copy_from_slice(&(self.seg_size - self.used).to_le_bytes());
        }
        storage.write_at(self.seg_addr, &data)?;
        Ok(())
    }

    /// Returns the address of the data segment.
    pub fn segment_addr(&self) -> u64 {
        self.seg_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    #[test]
    fn add_and_read_back() {
        let mut storage = MemStorage::new();
        let mut heap = LocalHeap::create(&mut storage).unwrap();

        let a = heap.add_string(&mut storage, "alpha").unwrap();
        let b = heap.add_string(&mut storage, "beta").unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 16);
        assert_eq!(heap.string_at(a).unwrap(), b"alpha");
        assert_eq!(heap.string_at(b).unwrap(), b"beta");
        // Offset 0 is the reserved empty string
        assert_eq!(heap.string_at(0).unwrap(), b"");
    }

    #[test]
    fn persists_across_load() {
        let mut storage = MemStorage::new();
        let mut heap = LocalHeap::create(&mut storage).unwrap();
        let a = heap.add_string(&mut storage, "name").unwrap();

        let loaded = LocalHeap::load(&mut storage, heap.addr).unwrap();
        assert_eq!(loaded.string_at(a).unwrap(), b"name");
        assert_eq!(loaded.used, heap.used);
    }

    #[test]
    fn grows_by_relocating_segment() {
        let mut storage = MemStorage::new();
        let mut heap = LocalHeap::create(&mut storage).unwrap();
        let first_seg = heap.segment_addr();

        let mut offs = Vec::new();
        for i in 0..40 {
            offs.push((i, heap.add_string(&mut storage, &format!("name_{i:03}")).unwrap()));
        }
        assert_ne!(heap.segment_addr(), first_seg);
        assert!(heap.seg_size > INITIAL_SEGMENT_SIZE);
        for (i, off) in offs {
            assert_eq!(heap.string_at(off).unwrap(), format!("name_{i:03}").as_bytes());
        }

        // The header address did not move; reload sees the new segment
        let loaded = LocalHeap::load(&mut storage, heap.addr).unwrap();
        assert_eq!(loaded.segment_addr(), heap.segment_addr());
    }

    #[test]
    fn oversized_name_grows_cleanly() {
        let mut storage = MemStorage::new();
        let mut heap = LocalHeap::create(&mut storage).unwrap();

        let long = "x".repeat(1000);
        let off = heap.add_string(&mut storage, &long).unwrap();
        assert_eq!(heap.string_at(off).unwrap(), long.as_bytes());
    }
}
