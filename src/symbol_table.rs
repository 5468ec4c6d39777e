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

//! Symbol table nodes: the entry lists of legacy groups.
//!
//! A node is a fixed-capacity list of `(name offset, object header address)`
//! entries kept sorted by the name bytes in the group's local heap.

use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::put_u32;
use crate::io::put_u64;
use crate::local_heap::LocalHeap;
use std::cmp::Ordering;

/// Signature of a symbol table node.
const SNOD_SIGNATURE: &[u8; 4] = b"SNOD";
/// Maximum entries per node: twice the group leaf K.
pub const SNOD_CAPACITY: usize = 8;
/// On-disk size of one entry.
pub const ENTRY_SIZE: u64 = 40;
/// On-disk size of a node block.
pub const NODE_SIZE: u64 = 8 + SNOD_CAPACITY as u64 * ENTRY_SIZE;

/// Cached information of a symbol table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolCache {
    /// Nothing cached.
    None,
    /// The target is a group; its B-tree and heap addresses are cached.
    Group {
        /// Address of the group's v1 B-tree.
        btree_addr: u64,
        /// Address of the group's local heap.
        heap_addr: u64,
    },
    /// The entry is a soft link; the target path lives in the local heap.
    Symlink {
        /// Offset of the target path in the group's local heap.
        path_off: u32,
    },
}

/// One entry of a symbol table node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SymbolEntry {
    /// Offset of the entry's name in the group's local heap.
    pub name_off: u64,
    /// Address of the target's object header.
    pub oh_addr: u64,
    /// Cached target information.
    pub cache: SymbolCache,
}

impl SymbolEntry {
    /// Encodes the 40-byte entry into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.name_off);
        put_u64(buf, self.oh_addr);
        match self.cache {
            SymbolCache::None => {
                put_u32(buf, 0);
                put_u32(buf, 0);
                buf.extend_from_slice(&[0; 16]);
            }
            SymbolCache::Group {
                btree_addr,
                heap_addr,
            } => {
                put_u32(buf, 1);
                put_u32(buf, 0);
                put_u64(buf, btree_addr);
                put_u64(buf, heap_addr);
            }
            SymbolCache::Symlink {
                path_off,
            } => {
                put_u32(buf, 2);
                put_u32(buf, 0);
                put_u32(buf, path_off);
                buf.extend_from_slice(&[0; 12]);
            }
        }
    }

    /// Decodes a 40-byte entry.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let name_off = r.u64()?;
        let oh_addr = r.u64()?;
        let cache_type = r.u32()?;
        r.u32()?;
        let scratch = r.bytes(16)?;
        let cache = match cache_type {
            1 => SymbolCache::Group {
                btree_addr: u64::from_le_bytes(scratch[0..8].try_into().unwrap()),
                heap_addr: u64::from_le_bytes(scratch[8..16].try_into().unwrap()),
            },
            2 => SymbolCache::Symlink {
                path_off: u32::from_le_bytes(scratch[0..4].try_into().unwrap()),
            },
            _ => SymbolCache::None,
        };
        Ok(Self {
            name_off,
            oh_addr,
            cache,
        })
    }
}

/// A symbol table node.
pub struct SymbolNode {
    /// Address of the node block.
    pub addr: u64,
    /// The entries, sorted by name.
    pub entries: Vec<SymbolEntry>,
}

impl SymbolNode {
    /// Creates an empty node.
    pub fn create(storage: &mut dyn Storage) -> Result<Self> {
        let addr = storage.allocate(NODE_SIZE)?;
        let node = Self {
            addr,
            entries: Vec::new(),
        };
        node.write(storage)?;
        Ok(node)
    }

    /// Loads the node at `addr`.
    pub fn load(storage: &mut dyn Storage, addr: u64) -> Result<Self> {
        let mut buf = vec![0; NODE_SIZE as usize];
        storage.read_at(addr, &mut buf)?;
        let mut r = Reader::new(&buf, "symbol table node", addr);
        r.signature(SNOD_SIGNATURE)?;
        let version = r.u8()?;
        if version != 1 {
            return Err(Error::format("symbol table node", addr, "version 1", version));
        }
        r.u8()?;
        let count = r.u16()? as usize;
        if count > SNOD_CAPACITY {
            return Err(Error::format(
                "symbol table node",
                addr,
                format!("at most {SNOD_CAPACITY} entries"),
                count,
            ));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(SymbolEntry::decode(&mut r)?);
        }
        Ok(Self {
            addr,
            entries,
        })
    }

    /// Writes the node back at its address.
    pub fn write(&self, storage: &mut dyn Storage) -> Result<()> {
        let mut buf = Vec::with_capacity(NODE_SIZE as usize);
        buf.extend_from_slice(SNOD_SIGNATURE);
        buf.push(1);
        buf.push(0);
        buf.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for e in &self.entries {
            e.encode(&mut buf);
        }
        buf.resize(NODE_SIZE as usize, 0);
        storage.write_at(self.addr, &buf)?;
        Ok(())
    }

    /// Returns the position of `name`, or the insertion position keeping the
    /// entries sorted.
    fn search(&self, heap: &LocalHeap, name: &str) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_name = heap.string_at(self.entries[mid].name_off)?;
            match mid_name.cmp(name.as_bytes()) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Inserts an entry, keeping the order by name.
    ///
    /// The caller checks capacity beforehand; a full node means the group
    /// must leave symbol-table storage.
    pub fn insert(&mut self, heap: &LocalHeap, name: &str, entry: SymbolEntry) -> Result<()> {
        match self.search(heap, name)? {
            Ok(_) => Err(Error::AlreadyExists(name.into())),
            Err(pos) => {
                if self.entries.len() >= SNOD_CAPACITY {
                    return Err(Error::Overflow(format!(
                        "symbol table node at {:#x} is full",
                        self.addr
                    )));
                }
                self.entries.insert(pos, entry);
                Ok(())
            }
        }
    }

    /// Returns the entry named `name`, if present.
    pub fn find(&self, heap: &LocalHeap, name: &str) -> Result<Option<&SymbolEntry>> {
        Ok(self.search(heap, name)?.ok().map(|i| &self.entries[i]))
    }

    /// Removes the entry named `name` and returns it.
    pub fn remove(&mut self, heap: &LocalHeap, name: &str) -> Result<Option<SymbolEntry>> {
        Ok(self.search(heap, name)?.ok().map(|i| self.entries.remove(i)))
    }
}
