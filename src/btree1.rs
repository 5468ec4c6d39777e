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

//! Version 1 B-trees.
//!
//! The legacy balanced tree indexes group symbol-table nodes (type 0) and
//! dataset chunks (type 1). A node interleaves `n` children with `n + 1`
//! bracketing keys; the root address never changes, so the structures
//! pointing at a tree stay valid across splits.

use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::UNDEFINED_ADDR;
use crate::io::put_u16;
use crate::io::put_u64;
use log::debug;
use std::cmp::Ordering;

/// Signature of a v1 B-tree node.
const TREE_SIGNATURE: &[u8; 4] = b"TREE";

/// Node type: group symbol-table index.
pub const NODE_TYPE_GROUP: u8 = 0;
/// Node type: dataset chunk index.
pub const NODE_TYPE_CHUNK: u8 = 1;

/// Children per group node: twice the group internal K.
pub const GROUP_NODE_CAPACITY: usize = 32;
/// Children per chunk node: twice the chunk K.
pub const CHUNK_NODE_CAPACITY: usize = 64;

/// A key comparator. Keys are opaque to the tree.
pub type KeyCmp<'c> = &'c dyn Fn(&[u8], &[u8]) -> Ordering;

/// One tree node.
struct Node {
    /// Address of the node block.
    addr: u64,
    /// Level above the leaves; 0 holds the records.
    level: u8,
    /// Address of the left sibling.
    left: u64,
    /// Address of the right sibling.
    right: u64,
    /// Bracketing keys, one more than the children when non-empty.
    keys: Vec<Vec<u8>>,
    /// Child addresses.
    children: Vec<u64>,
}

/// A version 1 B-tree.
pub struct BtreeV1 {
    /// Address of the root node; stable for the life of the tree.
    pub addr: u64,
    /// Node type: group or chunk.
    node_type: u8,
    /// Size of one key in bytes.
    key_size: usize,
    /// Maximum children per node.
    capacity: usize,
}

impl BtreeV1 {
    /// Creates an empty tree and returns it.
    pub fn create(
        storage: &mut dyn Storage,
        node_type: u8,
        key_size: usize,
        capacity: usize,
    ) -> Result<Self> {
        let mut tree = Self {
            addr: UNDEFINED_ADDR,
            node_type,
            key_size,
            capacity,
        };
        let addr = storage.allocate(tree.node_size())?;
        tree.addr = addr;
        tree.write_node(
            storage,
            &Node {
                addr,
                level: 0,
                left: UNDEFINED_ADDR,
                right: UNDEFINED_ADDR,
                keys: Vec::new(),
                children: Vec::new(),
            },
        )?;
        Ok(tree)
    }

    /// Opens a tree rooted at `addr`.
    pub fn open(addr: u64, node_type: u8, key_size: usize, capacity: usize) -> Self {
        Self {
            addr,
            node_type,
            key_size,
            capacity,
        }
    }

    /// On-disk size of a node block.
    fn node_size(&self) -> u64 {
        (24 + (self.capacity + 1) * self.key_size + self.capacity * 8) as u64
    }

    /// Reads the node at `addr`.
    fn read_node(&self, storage: &mut dyn Storage, addr: u64) -> Result<Node> {
        let mut buf = vec![0; self.node_size() as usize];
        storage.read_at(addr, &mut buf)?;
        let mut r = Reader::new(&buf, "v1 B-tree node", addr);
        r.signature(TREE_SIGNATURE)?;
        let node_type = r.u8()?;
        if node_type != self.node_type {
            return Err(Error::format("v1 B-tree node", addr, self.node_type, node_type));
        }
        let level = r.u8()?;
        let n = r.u16()? as usize;
        if n > self.capacity {
            return Err(Error::format(
                "v1 B-tree node",
                addr,
                format!("at most {} entries", self.capacity),
                n,
            ));
        }
        let left = r.u64()?;
        let right = r.u64()?;
        let mut keys = Vec::with_capacity(n + 1);
        let mut children = Vec::with_capacity(n);
        if n > 0 {
            for _ in 0..n {
                keys.push(r.bytes(self.key_size)?.to_vec());
                children.push(r.u64()?);
            }
            keys.push(r.bytes(self.key_size)?.to_vec());
        }
        Ok(Node {
            addr,
            level,
            left,
            right,
            keys,
            children,
        })
    }

    /// Writes `node` at its address.
    fn write_node(&self, storage: &mut dyn Storage, node: &Node) -> Result<()> {
        let mut buf = Vec::with_capacity(self.node_size() as usize);
        buf.extend_from_slice(TREE_SIGNATURE);
        buf.push(self.node_type);
        buf.push(node.level);
        put_u16(&mut buf, node.children.len() as u16);
        put_u64(&mut buf, node.left);
        put_u64(&mut buf, node.right);
        for (key, child) in node.keys.iter().zip(&node.children) {
            buf.extend_from_slice(key);
            put_u64(&mut buf, *child);
        }
        if let Some(last) = node.keys.last()
            && !node.children.is_empty()
        {
            buf.extend_from_slice(last);
        }
        buf.resize(self.node_size() as usize, 0);
        storage.write_at(node.addr, &buf)?;
        Ok(())
    }

    /// Inserts a record, or updates the child of an existing equal key.
    ///
    /// Returns `true` when a new record was inserted.
    pub fn insert(
        &self,
        storage: &mut dyn Storage,
        key: &[u8],
        child: u64,
        cmp: KeyCmp<'_>,
    ) -> Result<bool> {
        let (inserted, split) = self.insert_rec(storage, self.addr, key, child, cmp)?;
        if let Some((boundary, right_addr)) = split {
            // The root address must not change: the left half moves out and
            // the root becomes their parent
            let mut left = self.read_node(storage, self.addr)?;
            let left_addr = storage.allocate(self.node_size())?;
            left.addr = left_addr;
            self.write_node(storage, &left)?;
            let mut right = self.read_node(storage, right_addr)?;
            right.left = left_addr;
            self.write_node(storage, &right)?;
            let root = Node {
                addr: self.addr,
                level: left.level + 1,
                left: UNDEFINED_ADDR,
                right: UNDEFINED_ADDR,
                keys: vec![
                    left.keys[0].clone(),
                    boundary,
                    right.keys.last().unwrap().clone(),
                ],
                children: vec![left_addr, right_addr],
            };
            self.write_node(storage, &root)?;
            debug!("v1 B-tree {:#x}: root split, level {}", self.addr, root.level);
        }
        Ok(inserted)
    }

    /// Recursive insertion; returns whether a new record was added, and the
    /// `(boundary key, right node)` pair when the node split.
    fn insert_rec(
        &self,
        storage: &mut dyn Storage,
        addr: u64,
        key: &[u8],
        child: u64,
        cmp: KeyCmp<'_>,
    ) -> Result<(bool, Option<(Vec<u8>, u64)>)> {
        let mut node = self.read_node(storage, addr)?;
        if node.level == 0 {
            if node.children.is_empty() {
                node.keys = vec![key.to_vec(), vec![0xff; self.key_size]];
                node.children.push(child);
            } else {
                let mut pos = node.children.len();
                for i in 0..node.children.len() {
                    match cmp(&node.keys[i], key) {
                        Ordering::Equal => {
                            // Same coordinates: replace the record
                            node.keys[i] = key.to_vec();
                            node.children[i] = child;
                            self.write_node(storage, &node)?;
                            return Ok((false, None));
                        }
                        Ordering::Greater => {
                            pos = i;
                            break;
                        }
                        Ordering::Less => {}
                    }
                }
                node.keys.insert(pos, key.to_vec());
                node.children.insert(pos, child);
            }
        } else {
            // Largest child whose bracket key is not above the new key
            let mut i = 0;
            for j in (0..node.children.len()).rev() {
                if cmp(&node.keys[j], key) != Ordering::Greater {
                    i = j;
                    break;
                }
            }
            if cmp(key, &node.keys[i]) == Ordering::Less {
                node.keys[i] = key.to_vec();
            }
            let (inserted, split) = self.insert_rec(storage, node.children[i], key, child, cmp)?;
            if let Some((boundary, right_addr)) = split {
                node.keys.insert(i + 1, boundary);
                node.children.insert(i + 1, right_addr);
            } else if inserted {
                self.write_node(storage, &node)?;
                return Ok((true, None));
            } else {
                self.write_node(storage, &node)?;
                return Ok((false, None));
            }
        }

        let split = if node.children.len() > self.capacity {
            Some(self.split_node(storage, &mut node)?)
        } else {
            None
        };
        self.write_node(storage, &node)?;
        Ok((true, split))
    }

    /// Splits `node` in half, allocating the right node.
    fn split_node(&self, storage: &mut dyn Storage, node: &mut Node) -> Result<(Vec<u8>, u64)> {
        let h = node.children.len() / 2;
        let right_addr = storage.allocate(self.node_size())?;
        let right_children = node.children.split_off(h);
        let right_keys = node.keys.split_off(h);
        let boundary = right_keys[0].clone();
        node.keys.push(boundary.clone());

        let right = Node {
            addr: right_addr,
            level: node.level,
            left: node.addr,
            right: node.right,
            keys: right_keys,
            children: right_children,
        };
        if node.right != UNDEFINED_ADDR {
            let mut old = self.read_node(storage, node.right)?;
            old.left = right_addr;
            self.write_node(storage, &old)?;
        }
        node.right = right_addr;
        self.write_node(storage, &right)?;
        debug!(
            "v1 B-tree {:#x}: node {:#x} split, right at {right_addr:#x}",
            self.addr, node.addr
        );
        Ok((boundary, right_addr))
    }

    /// Returns the record with a key equal to `key`.
    pub fn lookup(
        &self,
        storage: &mut dyn Storage,
        key: &[u8],
        cmp: KeyCmp<'_>,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let mut addr = self.addr;
        loop {
            let node = self.read_node(storage, addr)?;
            if node.children.is_empty() {
                return Ok(None);
            }
            if node.level == 0 {
                for i in 0..node.children.len() {
                    if cmp(&node.keys[i], key) == Ordering::Equal {
                        return Ok(Some((node.keys[i].clone(), node.children[i])));
                    }
                }
                return Ok(None);
            }
            let mut i = 0;
            for j in (0..node.children.len()).rev() {
                if cmp(&node.keys[j], key) != Ordering::Greater {
                    i = j;
                    break;
                }
            }
            addr = node.children[i];
        }
    }

    /// Returns every level-0 record in key order.
    pub fn records(&self, storage: &mut dyn Storage) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut node = self.read_node(storage, self.addr)?;
        while node.level > 0 {
            if node.children.is_empty() {
                return Ok(Vec::new());
            }
            node = self.read_node(storage, node.children[0])?;
        }
        let mut out = Vec::new();
        loop {
            for i in 0..node.children.len() {
                out.push((node.keys[i].clone(), node.children[i]));
            }
            if node.right == UNDEFINED_ADDR {
                break;
            }
            node = self.read_node(storage, node.right)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    fn u64_key(v: u64) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn u64_cmp(a: &[u8], b: &[u8]) -> Ordering {
        let a = u64::from_le_bytes(a.try_into().unwrap());
        let b = u64::from_le_bytes(b.try_into().unwrap());
        a.cmp(&b)
    }

    #[test]
    fn single_node_insert_lookup() {
        let mut storage = MemStorage::new();
        let tree = BtreeV1::create(&mut storage, NODE_TYPE_CHUNK, 8, 8).unwrap();

        for v in [5u64, 1, 3] {
            assert!(tree.insert(&mut storage, &u64_key(v), v * 100, &u64_cmp).unwrap());
        }
        let (_, child) = tree.lookup(&mut storage, &u64_key(3), &u64_cmp).unwrap().unwrap();
        assert_eq!(child, 300);
        assert!(tree.lookup(&mut storage, &u64_key(4), &u64_cmp).unwrap().is_none());
    }

    #[test]
    fn update_existing_key() {
        let mut storage = MemStorage::new();
        let tree = BtreeV1::create(&mut storage, NODE_TYPE_CHUNK, 8, 8).unwrap();

        assert!(tree.insert(&mut storage, &u64_key(7), 70, &u64_cmp).unwrap());
        assert!(!tree.insert(&mut storage, &u64_key(7), 77, &u64_cmp).unwrap());
        let (_, child) = tree.lookup(&mut storage, &u64_key(7), &u64_cmp).unwrap().unwrap();
        assert_eq!(child, 77);
        assert_eq!(tree.records(&mut storage).unwrap().len(), 1);
    }

    #[test]
    fn multi_level_split_keeps_order_and_root() {
        let mut storage = MemStorage::new();
        let tree = BtreeV1::create(&mut storage, NODE_TYPE_CHUNK, 8, 8).unwrap();
        let root = tree.addr;

        // Insert shuffled keys, far beyond one node
        let mut keys: Vec<u64> = (0..200).collect();
        for i in 0..keys.len() {
            let j = (i * 7919) % keys.len();
            keys.swap(i, j);
        }
        for k in &keys {
            tree.insert(&mut storage, &u64_key(*k), k + 1000, &u64_cmp).unwrap();
        }

        assert_eq!(tree.addr, root);
        let records = tree.records(&mut storage).unwrap();
        assert_eq!(records.len(), 200);
        for (i, (key, child)) in records.iter().enumerate() {
            assert_eq!(key, &u64_key(i as u64));
            assert_eq!(*child, i as u64 + 1000);
        }
        for k in [0u64, 99, 199] {
            let (_, child) = tree.lookup(&mut storage, &u64_key(k), &u64_cmp).unwrap().unwrap();
            assert_eq!(child, k + 1000);
        }
    }

    #[test]
    fn empty_tree() {
        let mut storage = MemStorage::new();
        let tree = BtreeV1::create(&mut storage, NODE_TYPE_GROUP, 8, 32).unwrap();
        assert!(tree.records(&mut storage).unwrap().is_empty());
        assert!(tree.lookup(&mut storage, &u64_key(1), &u64_cmp).unwrap().is_none());
    }
}
