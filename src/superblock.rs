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

//! Superblock: the file-identifying structure at offset 0.
//!
//! The superblock is rewritten last on every flush, so its end-of-file
//! address only ever points at fully written data.

use crate::checksum::lookup3;
use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::UNDEFINED_ADDR;
use crate::io::put_u16;
use crate::io::put_u32;
use crate::io::put_u64;

/// The file format signature.
const FILE_SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";
/// Group B-tree leaf K written in v0 superblocks.
const GROUP_LEAF_K: u16 = 4;
/// Group B-tree internal K written in v0 superblocks.
const GROUP_INTERNAL_K: u16 = 16;

/// Superblock layout version.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SuperblockVersion {
    /// Legacy 96-byte layout with cached root-group addresses.
    V0,
    /// Modern 48-byte checksummed layout.
    #[default]
    V2,
}

impl SuperblockVersion {
    /// On-disk size of the superblock.
    pub fn size(self) -> u64 {
        match self {
            Self::V0 => 96,
            Self::V2 => 48,
        }
    }
}

/// The superblock.
#[derive(Clone, Copy, Debug)]
pub struct Superblock {
    /// Layout version.
    pub version: SuperblockVersion,
    /// End-of-file address.
    pub eof: u64,
    /// Address of the root group's object header.
    pub root_oh_addr: u64,
    /// Cached address of the root group's v1 B-tree (v0 only).
    pub root_btree_addr: u64,
    /// Cached address of the root group's local heap (v0 only).
    pub root_heap_addr: u64,
}

impl Superblock {
    /// Writes the superblock at offset 0.
    pub fn write(&self, storage: &mut dyn Storage) -> Result<()> {
        let mut buf = Vec::with_capacity(self.version.size() as usize);
        buf.extend_from_slice(FILE_SIGNATURE);
        match self.version {
            SuperblockVersion::V0 => {
                // Versions of the superblock, free space storage, root group
                // symbol table and shared header messages
                buf.extend_from_slice(&[0, 0, 0, 0, 0]);
                buf.push(8);
                buf.push(8);
                buf.push(0);
                put_u16(&mut buf, GROUP_LEAF_K);
                put_u16(&mut buf, GROUP_INTERNAL_K);
                put_u32(&mut buf, 0);
                put_u64(&mut buf, 0);
                put_u64(&mut buf, UNDEFINED_ADDR);
                put_u64(&mut buf, self.eof);
                put_u64(&mut buf, UNDEFINED_ADDR);
                // Root group symbol table entry with cached addresses
                put_u64(&mut buf, 0);
                put_u64(&mut buf, self.root_oh_addr);
                put_u32(&mut buf, 1);
                put_u32(&mut buf, 0);
                put_u64(&mut buf, self.root_btree_addr);
                put_u64(&mut buf, self.root_heap_addr);
            }
            SuperblockVersion::V2 => {
                buf.push(2);
                buf.push(8);
                buf.push(8);
                buf.push(0);
                put_u64(&mut buf, 0);
                put_u64(&mut buf, UNDEFINED_ADDR);
                put_u64(&mut buf, self.eof);
                put_u64(&mut buf, self.root_oh_addr);
                let sum = lookup3(&buf);
                put_u32(&mut buf, sum);
            }
        }
        debug_assert_eq!(buf.len() as u64, self.version.size());
        storage.write_at(0, &buf)?;
        Ok(())
    }

    /// Loads the superblock from offset 0.
    pub fn load(storage: &mut dyn Storage) -> Result<Self> {
        let mut head = [0u8; 9];
        storage.read_at(0, &mut head)?;
        if head[..8] != *FILE_SIGNATURE {
            return Err(Error::format(
                "superblock",
                0,
                "HDF signature",
                format!("{:02x?}", &head[..8]),
            ));
        }
        match head[8] {
            0 => Self::load_v0(storage),
            2 => Self::load_v2(storage),
            v => Err(Error::Unsupported(format!("superblock version {v}"))),
        }
    }

    /// Loads the 96-byte v0 layout.
    fn load_v0(storage: &mut dyn Storage) -> Result<Self> {
        let mut buf = [0u8; 96];
        storage.read_at(0, &mut buf)?;
        let mut r = Reader::new(&buf, "superblock", 0);
        r.bytes(13)?;
        let offset_size = r.u8()?;
        let length_size = r.u8()?;
        if offset_size != 8 || length_size != 8 {
            return Err(Error::Unsupported(format!(
                "superblock with {offset_size}/{length_size}-byte offsets/lengths"
            )));
        }
        r.u8()?;
        r.u16()?;
        r.u16()?;
        r.u32()?;
        let base = r.u64()?;
        if base != 0 {
            return Err(Error::Unsupported(format!("base address {base:#x}")));
        }
        r.u64()?;
        let eof = r.u64()?;
        r.u64()?;
        r.u64()?;
        let root_oh_addr = r.u64()?;
        r.u32()?;
        r.u32()?;
        let root_btree_addr = r.u64()?;
        let root_heap_addr = r.u64()?;
        Ok(Self {
            version: SuperblockVersion::V0,
            eof,
            root_oh_addr,
            root_btree_addr,
            root_heap_addr,
        })
    }

    /// Loads the 48-byte checksummed v2 layout.
    fn load_v2(storage: &mut dyn Storage) -> Result<Self> {
        let mut buf = [0u8; 48];
        storage.read_at(0, &mut buf)?;
        let stored = u32::from_le_bytes(buf[44..48].try_into().unwrap());
        let sum = lookup3(&buf[..44]);
        if sum != stored {
            return Err(Error::format(
                "superblock",
                0,
                format!("checksum {stored:#010x}"),
                format!("{sum:#010x}"),
            ));
        }
        let mut r = Reader::new(&buf, "superblock", 0);
        r.bytes(9)?;
        let offset_size = r.u8()?;
        let length_size = r.u8()?;
        if offset_size != 8 || length_size != 8 {
            return Err(Error::Unsupported(format!(
                "superblock with {offset_size}/{length_size}-byte offsets/lengths"
            )));
        }
        r.u8()?;
        let base = r.u64()?;
        if base != 0 {
            return Err(Error::Unsupported(format!("base address {base:#x}")));
        }
        r.u64()?;
        let eof = r.u64()?;
        let root_oh_addr = r.u64()?;
        Ok(Self {
            version: SuperblockVersion::V2,
            eof,
            root_oh_addr,
            root_btree_addr: UNDEFINED_ADDR,
            root_heap_addr: UNDEFINED_ADDR,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;
    use crate::io::Storage;

    #[test]
    fn v2_roundtrip() {
        let mut storage = MemStorage::new();
        storage.set_eof(48);
        let sb = Superblock {
            version: SuperblockVersion::V2,
            eof: 4096,
            root_oh_addr: 48,
            root_btree_addr: UNDEFINED_ADDR,
            root_heap_addr: UNDEFINED_ADDR,
        };
        sb.write(&mut storage).unwrap();

        let loaded = Superblock::load(&mut storage).unwrap();
        assert_eq!(loaded.version, SuperblockVersion::V2);
        assert_eq!(loaded.eof, 4096);
        assert_eq!(loaded.root_oh_addr, 48);
    }

    #[test]
    fn v0_roundtrip_keeps_cached_addresses() {
        let mut storage = MemStorage::new();
        storage.set_eof(96);
        let sb = Superblock {
            version: SuperblockVersion::V0,
            eof: 8192,
            root_oh_addr: 96,
            root_btree_addr: 0x200,
            root_heap_addr: 0x400,
        };
        sb.write(&mut storage).unwrap();

        let loaded = Superblock::load(&mut storage).unwrap();
        assert_eq!(loaded.version, SuperblockVersion::V0);
        assert_eq!(loaded.eof, 8192);
        assert_eq!(loaded.root_oh_addr, 96);
        assert_eq!(loaded.root_btree_addr, 0x200);
        assert_eq!(loaded.root_heap_addr, 0x400);
    }

    #[test]
    fn v2_checksum_mismatch() {
        let mut storage = MemStorage::new();
        storage.set_eof(48);
        let sb = Superblock {
            version: SuperblockVersion::V2,
            eof: 48,
            root_oh_addr: UNDEFINED_ADDR,
            root_btree_addr: UNDEFINED_ADDR,
            root_heap_addr: UNDEFINED_ADDR,
        };
        sb.write(&mut storage).unwrap();
        storage.as_bytes_mut()[20] ^= 0xff;
        assert!(matches!(
            Superblock::load(&mut storage),
            Err(Error::FormatViolation { .. })
        ));
    }

    #[test]
    fn bad_signature() {
        let mut storage = MemStorage::new();
        storage.write_at(0, &[0u8; 96]).unwrap();
        assert!(matches!(
            Superblock::load(&mut storage),
            Err(Error::FormatViolation { .. })
        ));
    }
}
