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

//! Version 2 B-trees.
//!
//! A checksummed balanced tree over fixed-size records. The record bytes are
//! opaque to the tree; ordering is delegated to a comparator provided per
//! call, so the same structure indexes attribute names, link names and
//! creation orders. Deletion rebalances incrementally unless deferred, in
//! which case an explicit [`BtreeV2::rebalance`] pass repacks the tree.

use crate::checksum::lookup3;
use crate::error::Error;
use crate::error::Result;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::UNDEFINED_ADDR;
use crate::io::put_u16;
use crate::io::put_u32;
use crate::io::put_u64;
use log::debug;
use std::cmp::Ordering;

/// Signature of a v2 B-tree header.
const BTHD_SIGNATURE: &[u8; 4] = b"BTHD";
/// Signature of an internal node.
const BTIN_SIGNATURE: &[u8; 4] = b"BTIN";
/// Signature of a leaf node.
const BTLF_SIGNATURE: &[u8; 4] = b"BTLF";

/// Record type: link name index of an indexed group.
pub const BT2_TYPE_LINK_NAME: u8 = 5;
/// Record type: attribute name index.
pub const BT2_TYPE_ATTR_NAME: u8 = 8;

/// On-disk size of every node block.
const NODE_SIZE: usize = 512;
/// Per-node overhead: signature, version, type and checksum.
const NODE_OVERHEAD: usize = 10;
/// On-disk size of the header.
const HEADER_SIZE: u64 = 38;
/// Node split threshold, in percent of capacity.
const SPLIT_PERCENT: u8 = 100;
/// Node merge threshold, in percent of capacity.
const MERGE_PERCENT: u8 = 40;

/// A record comparator. May read external storage to break ties, hence the
/// fallible signature.
pub type RecordCmp<'c> = &'c dyn Fn(&[u8], &[u8]) -> Result<Ordering>;

/// Returns the bytes needed to store values up to `limit`.
fn enc_size(limit: u64) -> usize {
    (64 - limit.leading_zeros() as usize).div_ceil(8)
}

/// Pointer from a node (or the header) to a child node.
#[derive(Clone, Copy, Debug)]
struct ChildPtr {
    /// Address of the child node.
    addr: u64,
    /// Records held by the child node itself.
    nrec: u64,
    /// Records held by the child's whole subtree.
    total: u64,
}

/// One node held in memory.
struct Node2 {
    /// Address of the node block.
    addr: u64,
    /// The records, in comparator order.
    records: Vec<Vec<u8>>,
    /// Child pointers; empty for a leaf.
    children: Vec<ChildPtr>,
}

impl Node2 {
    /// Records in the node's whole subtree.
    fn total(&self) -> u64 {
        self.records.len() as u64 + self.children.iter().map(|c| c.total).sum::<u64>()
    }

    /// The node's own pointer.
    fn ptr(&self) -> ChildPtr {
        ChildPtr {
            addr: self.addr,
            nrec: self.records.len() as u64,
            total: self.total(),
        }
    }
}

/// Sizes of the node pointer fields, per depth.
struct Geometry {
    /// Record capacity of a node, per depth.
    caps: Vec<usize>,
    /// Bytes of the "number of records" field of a pointer to each depth.
    nrec_sz: Vec<usize>,
    /// Bytes of the "total records" field of a pointer to each depth.
    cum_sz: Vec<usize>,
}

impl Geometry {
    /// Computes the capacities and pointer field sizes for trees up to
    /// `depth`.
    fn new(record_size: usize, depth: u16) -> Self {
        let leaf_cap = (NODE_SIZE - NODE_OVERHEAD) / record_size;
        let mut caps = vec![leaf_cap];
        let mut cum_max = vec![leaf_cap as u64];
        let mut nrec_sz = vec![enc_size(leaf_cap as u64)];
        let mut cum_sz = vec![enc_size(leaf_cap as u64)];
        for d in 1..=depth as usize {
            let ptr = Self::ptr_size_at(d - 1, &nrec_sz, &cum_sz);
            let cap = (NODE_SIZE - NODE_OVERHEAD - ptr) / (record_size + ptr);
            let cum = cap as u64 + (cap as u64 + 1) * cum_max[d - 1];
            caps.push(cap);
            cum_max.push(cum);
            nrec_sz.push(enc_size(cap as u64));
            cum_sz.push(enc_size(cum));
        }
        Self {
            caps,
            nrec_sz,
            cum_sz,
        }
    }

    /// Size of a pointer to a node at `depth`.
    fn ptr_size_at(depth: usize, nrec_sz: &[usize], cum_sz: &[usize]) -> usize {
        8 + nrec_sz[depth] + if depth > 0 { cum_sz[depth] } else { 0 }
    }

    /// Record capacity of a node at `depth`.
    fn cap(&self, depth: usize) -> usize {
        self.caps[depth]
    }

    /// Merge threshold of a node at `depth`.
    fn min(&self, depth: usize) -> usize {
        self.caps[depth] * MERGE_PERCENT as usize / 100
    }
}

/// A version 2 B-tree.
pub struct BtreeV2 {
    /// Address of the header; stable for the life of the tree.
    pub addr: u64,
    /// Record type stored in the nodes.
    btree_type: u8,
    /// Size of one record.
    record_size: usize,
    /// Depth of the root node; 0 means the root is a leaf.
    depth: u16,
    /// Pointer to the root node.
    root: ChildPtr,
}

impl BtreeV2 {
    /// Creates an empty tree.
    pub fn create(storage: &mut dyn Storage, btree_type: u8, record_size: usize) -> Result<Self> {
        let addr = storage.allocate(HEADER_SIZE)?;
        let tree = Self {
            addr,
            btree_type,
            record_size,
            depth: 0,
            root: ChildPtr {
                addr: UNDEFINED_ADDR,
                nrec: 0,
                total: 0,
            },
        };
        tree.write_header(storage)?;
        Ok(tree)
    }

    /// Loads the tree whose header is at `addr`.
    pub fn load(storage: &mut dyn Storage, addr: u64) -> Result<Self> {
        let mut buf = vec![0; HEADER_SIZE as usize];
        storage.read_at(addr, &mut buf)?;
        let stored = u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap());
        let sum = lookup3(&buf[..buf.len() - 4]);
        if sum != stored {
            return Err(Error::format(
                "v2 B-tree header",
                addr,
                format!("checksum {stored:#010x}"),
                format!("{sum:#010x}"),
            ));
        }
        let mut r = Reader::new(&buf, "v2 B-tree header", addr);
        r.signature(BTHD_SIGNATURE)?;
        let version = r.u8()?;
        if version != 0 {
            return Err(Error::format("v2 B-tree header", addr, "version 0", version));
        }
        let btree_type = r.u8()?;
        let node_size = r.u32()? as usize;
        if node_size != NODE_SIZE {
            return Err(Error::Unsupported(format!("v2 B-tree node size {node_size}")));
        }
        let record_size = r.u16()? as usize;
        let depth = r.u16()?;
        r.u8()?;
        r.u8()?;
        let root_addr = r.u64()?;
        let root_nrec = r.u16()? as u64;
        let total = r.u64()?;
        Ok(Self {
            addr,
            btree_type,
            record_size,
            depth,
            root: ChildPtr {
                addr: root_addr,
                nrec: root_nrec,
                total,
            },
        })
    }

    /// Writes the header at its address.
    fn write_header(&self, storage: &mut dyn Storage) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(BTHD_SIGNATURE);
        buf.push(0);
        buf.push(self.btree_type);
        put_u32(&mut buf, NODE_SIZE as u32);
        put_u16(&mut buf, self.record_size as u16);
        put_u16(&mut buf, self.depth);
        buf.push(SPLIT_PERCENT);
        buf.push(MERGE_PERCENT);
        put_u64(&mut buf, self.root.addr);
        put_u16(&mut buf, self.root.nrec as u16);
        put_u64(&mut buf, self.root.total);
        let sum = lookup3(&buf);
        put_u32(&mut buf, sum);
        debug_assert_eq!(buf.len() as u64, HEADER_SIZE);
        storage.write_at(self.addr, &buf)?;
        Ok(())
    }

    /// Number of records in the tree.
    pub fn record_count(&self) -> u64 {
        self.root.total
    }

    /// Reads the node referenced by `ptr` at `depth`.
    fn read_node(
        &self,
        storage: &mut dyn Storage,
        ptr: ChildPtr,
        depth: u16,
        geo: &Geometry,
    ) -> Result<Node2> {
        let mut buf = vec![0; NODE_SIZE];
        storage.read_at(ptr.addr, &mut buf)?;
        let leaf = depth == 0;
        let mut r = Reader::new(&buf, "v2 B-tree node", ptr.addr);
        r.signature(if leaf { BTLF_SIGNATURE } else { BTIN_SIGNATURE })?;
        let version = r.u8()?;
        if version != 0 {
            return Err(Error::format("v2 B-tree node", ptr.addr, "version 0", version));
        }
        let node_type = r.u8()?;
        if node_type != self.btree_type {
            return Err(Error::format("v2 B-tree node", ptr.addr, self.btree_type, node_type));
        }

        let mut records = Vec::with_capacity(ptr.nrec as usize);
        for _ in 0..ptr.nrec {
            records.push(r.bytes(self.record_size)?.to_vec());
        }
        let mut children = Vec::new();
        if !leaf {
            let child_depth = depth as usize - 1;
            for _ in 0..ptr.nrec + 1 {
                let addr = r.u64()?;
                let mut nrec = [0u8; 8];
                nrec[..geo.nrec_sz[child_depth]]
                    .copy_from_slice(r.bytes(geo.nrec_sz[child_depth])?);
                let nrec = u64::from_le_bytes(nrec);
                let total = if child_depth > 0 {
                    let mut total = [0u8; 8];
                    total[..geo.cum_sz[child_depth]]
                        .copy_from_slice(r.bytes(geo.cum_sz[child_depth])?);
                    u64::from_le_bytes(total)
                } else {
                    nrec
                };
                children.push(ChildPtr {
                    addr,
                    nrec,
                    total,
                });
            }
        }

        let used = r.pos();
        let stored = u32::from_le_bytes(buf[used..used + 4].try_into().unwrap());
        let sum = lookup3(&buf[..used]);
        if sum != stored {
            return Err(Error::format(
                "v2 B-tree node",
                ptr.addr,
                format!("checksum {stored:#010x}"),
                format!("{sum:#010x}"),
            ));
        }
        Ok(Node2 {
            addr: ptr.addr,
            records,
            children,
        })
    }

    /// Writes `node` at its address.
    fn write_node(
        &self,
        storage: &mut dyn Storage,
        node: &Node2,
        depth: u16,
        geo: &Geometry,
    ) -> Result<()> {
        let leaf = node.children.is_empty();
        let mut buf = Vec::with_capacity(NODE_SIZE);
        buf.extend_from_slice(if leaf { BTLF_SIGNATURE } else { BTIN_SIGNATURE });
        buf.push(0);
        buf.push(self.btree_type);
        for rec in &node.records {
            buf.extend_from_slice(rec);
        }
        if !leaf {
            let child_depth = depth as usize - 1;
            for c in &node.children {
                put_u64(&mut buf, c.addr);
                buf.extend_from_slice(&c.nrec.to_le_bytes()[..geo.nrec_sz[child_depth]]);
                if child_depth > 0 {
                    buf.extend_from_slice(&c.total.to_le_bytes()[..geo.cum_sz[child_depth]]);
                }
            }
        }
        let sum = lookup3(&buf);
        put_u32(&mut buf, sum);
        buf.resize(NODE_SIZE, 0);
        storage.write_at(node.addr, &buf)?;
        Ok(())
    }

    /// Binary-searches `records` for `probe`.
    fn search(
        records: &[Vec<u8>],
        probe: &[u8],
        cmp: RecordCmp<'_>,
    ) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0;
        let mut hi = records.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(probe, &records[mid])? {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Inserts `record`. Fails with `AlreadyExists` on an equal record.
    pub fn insert(
        &mut self,
        storage: &mut dyn Storage,
        record: &[u8],
        cmp: RecordCmp<'_>,
    ) -> Result<()> {
        debug_assert_eq!(record.len(), self.record_size);
        if self.root.addr == UNDEFINED_ADDR {
            let geo = Geometry::new(self.record_size, 0);
            let node = Node2 {
                addr: storage.allocate(NODE_SIZE as u64)?,
                records: vec![record.to_vec()],
                children: Vec::new(),
            };
            self.write_node(storage, &node, 0, &geo)?;
            self.root = node.ptr();
            return self.write_header(storage);
        }

        let geo = Geometry::new(self.record_size, self.depth + 1);
        match self.insert_rec(storage, self.root, self.depth, record, cmp, &geo)? {
            InsertOutcome::Done(ptr) => self.root = ptr,
            InsertOutcome::Split {
                left,
                median,
                right,
            } => {
                let root = Node2 {
                    addr: storage.allocate(NODE_SIZE as u64)?,
                    records: vec![median],
                    children: vec![left, right],
                };
                self.depth += 1;
                self.write_node(storage, &root, self.depth, &geo)?;
                self.root = root.ptr();
                debug!("v2 B-tree {:#x}: root split, depth {}", self.addr, self.depth);
            }
        }
        self.write_header(storage)
    }

    /// Recursive insertion into the node referenced by `ptr`.
    fn insert_rec(
        &self,
        storage: &mut dyn Storage,
        ptr: ChildPtr,
        depth: u16,
        record: &[u8],
        cmp: RecordCmp<'_>,
        geo: &Geometry,
    ) -> Result<InsertOutcome> {
        let mut node = self.read_node(storage, ptr, depth, geo)?;
        let pos = match Self::search(&node.records, record, cmp)? {
            Ok(_) => return Err(Error::AlreadyExists("B-tree record".into())),
            Err(pos) => pos,
        };
        if depth == 0 {
            node.records.insert(pos, record.to_vec());
        } else {
            let outcome =
                self.insert_rec(storage, node.children[pos], depth - 1, record, cmp, geo)?;
            match outcome {
                InsertOutcome::Done(child) => node.children[pos] = child,
                InsertOutcome::Split {
                    left,
                    median,
                    right,
                } => {
                    node.records.insert(pos, median);
                    node.children[pos] = left;
                    node.children.insert(pos + 1, right);
                }
            }
        }

        if node.records.len() > geo.cap(depth as usize) * SPLIT_PERCENT as usize / 100 {
            let (left, median, right) = self.split_node(storage, node, depth, geo)?;
            Ok(InsertOutcome::Split {
                left,
                median,
                right,
            })
        } else {
            self.write_node(storage, &node, depth, geo)?;
            Ok(InsertOutcome::Done(node.ptr()))
        }
    }

    /// Splits `node` around its median record, allocating the right node.
    fn split_node(
        &self,
        storage: &mut dyn Storage,
        mut node: Node2,
        depth: u16,
        geo: &Geometry,
    ) -> Result<(ChildPtr, Vec<u8>, ChildPtr)> {
        let mid = node.records.len() / 2;
        let right_records = node.records.split_off(mid + 1);
        let median = node.records.pop().unwrap();
        let right_children = if node.children.is_empty() {
            Vec::new()
        } else {
            node.children.split_off(mid + 1)
        };
        let right = Node2 {
            addr: storage.allocate(NODE_SIZE as u64)?,
            records: right_records,
            children: right_children,
        };
        self.write_node(storage, &node, depth, geo)?;
        self.write_node(storage, &right, depth, geo)?;
        Ok((node.ptr(), median, right.ptr()))
    }

    /// Returns the record equal to `probe`, if present.
    pub fn lookup(
        &self,
        storage: &mut dyn Storage,
        probe: &[u8],
        cmp: RecordCmp<'_>,
    ) -> Result<Option<Vec<u8>>> {
        if self.root.addr == UNDEFINED_ADDR {
            return Ok(None);
        }
        let geo = Geometry::new(self.record_size, self.depth);
        let mut ptr = self.root;
        let mut depth = self.depth;
        loop {
            let node = self.read_node(storage, ptr, depth, &geo)?;
            match Self::search(&node.records, probe, cmp)? {
                Ok(pos) => return Ok(Some(node.records[pos].clone())),
                Err(pos) => {
                    if depth == 0 {
                        return Ok(None);
                    }
                    ptr = node.children[pos];
                    depth -= 1;
                }
            }
        }
    }

    /// Replaces the record equal to `probe` with `record`.
    ///
    /// The replacement must keep the same comparator position.
    pub fn update(
        &mut self,
        storage: &mut dyn Storage,
        probe: &[u8],
        record: &[u8],
        cmp: RecordCmp<'_>,
    ) -> Result<()> {
        if self.root.addr == UNDEFINED_ADDR {
            return Err(Error::NotFound("B-tree record".into()));
        }
        let geo = Geometry::new(self.record_size, self.depth);
        let mut ptr = self.root;
        let mut depth = self.depth;
        loop {
            let mut node = self.read_node(storage, ptr, depth, &geo)?;
            match Self::search(&node.records, probe, cmp)? {
                Ok(pos) => {
                    node.records[pos] = record.to_vec();
                    return self.write_node(storage, &node, depth, &geo);
                }
                Err(pos) => {
                    if depth == 0 {
                        return Err(Error::NotFound("B-tree record".into()));
                    }
                    ptr = node.children[pos];
                    depth -= 1;
                }
            }
        }
    }

    /// Removes the record equal to `probe` and returns it.
    ///
    /// With `rebalance`, under-occupied nodes borrow from or merge with
    /// their siblings on the way back up; otherwise the tree is left sparse.
    pub fn delete(
        &mut self,
        storage: &mut dyn Storage,
        probe: &[u8],
        cmp: RecordCmp<'_>,
        rebalance: bool,
    ) -> Result<Vec<u8>> {
        if self.root.addr == UNDEFINED_ADDR {
            return Err(Error::NotFound("B-tree record".into()));
        }
        let geo = Geometry::new(self.record_size, self.depth);
        let (removed, ptr) =
            self.delete_rec(storage, self.root, self.depth, probe, cmp, rebalance, &geo)?;
        self.root = ptr;

        // A root left with a single child collapses into it
        if self.depth > 0 && self.root.nrec == 0 {
            let node = self.read_node(storage, self.root, self.depth, &geo)?;
            self.root = node.children[0];
            self.depth -= 1;
            debug!("v2 B-tree {:#x}: root collapsed, depth {}", self.addr, self.depth);
        }
        self.write_header(storage)?;
        Ok(removed)
    }

    /// Recursive deletion from the node referenced by `ptr`.
    #[allow(clippy::too_many_arguments)]
    fn delete_rec(
        &self,
        storage: &mut dyn Storage,
        ptr: ChildPtr,
        depth: u16,
        probe: &[u8],
        cmp: RecordCmp<'_>,
        rebalance: bool,
        geo: &Geometry,
    ) -> Result<(Vec<u8>, ChildPtr)> {
        let mut node = self.read_node(storage, ptr, depth, geo)?;
        let removed = match Self::search(&node.records, probe, cmp)? {
            Ok(pos) => {
                if depth == 0 {
                    node.records.remove(pos)
                } else {
                    // Replace the record with its in-order predecessor
                    match self.take_max(storage, node.children[pos], depth - 1, rebalance, geo)? {
                        Some((pred, child)) => {
                            let removed = std::mem::replace(&mut node.records[pos], pred);
                            node.children[pos] = child;
                            if rebalance {
                                self.fix_underflow(storage, &mut node, pos, depth, geo)?;
                            }
                            removed
                        }
                        None => {
                            // Deferred deletions emptied the left subtree:
                            // the record leaves together with it
                            node.children.remove(pos);
                            node.records.remove(pos)
                        }
                    }
                }
            }
            Err(pos) => {
                if depth == 0 {
                    return Err(Error::NotFound("B-tree record".into()));
                }
                let (removed, child) = self.delete_rec(
                    storage,
                    node.children[pos],
                    depth - 1,
                    probe,
                    cmp,
                    rebalance,
                    geo,
                )?;
                node.children[pos] = child;
                if rebalance {
                    self.fix_underflow(storage, &mut node, pos, depth, geo)?;
                }
                removed
            }
        };
        self.write_node(storage, &node, depth, geo)?;
        Ok((removed, node.ptr()))
    }

    /// Removes and returns the largest record of the subtree at `ptr`.
    ///
    /// Returns `None` when deferred deletions left the subtree empty.
    fn take_max(
        &self,
        storage: &mut dyn Storage,
        ptr: ChildPtr,
        depth: u16,
        rebalance: bool,
        geo: &Geometry,
    ) -> Result<Option<(Vec<u8>, ChildPtr)>> {
        let mut node = self.read_node(storage, ptr, depth, geo)?;
        let max = if depth == 0 {
            match node.records.pop() {
                Some(max) => max,
                None => return Ok(None),
            }
        } else {
            loop {
                let Some(last) = node.children.len().checked_sub(1) else {
                    return Ok(None);
                };
                match self.take_max(storage, node.children[last], depth - 1, rebalance, geo)? {
                    Some((max, child)) => {
                        node.children[last] = child;
                        if rebalance {
                            self.fix_underflow(storage, &mut node, last, depth, geo)?;
                        }
                        break max;
                    }
                    None => {
                        // The last subtree is spent: the node's own trailing
                        // record takes its place as the maximum
                        node.children.pop();
                        if let Some(max) = node.records.pop() {
                            break max;
                        }
                    }
                }
            }
        };
        self.write_node(storage, &node, depth, geo)?;
        Ok(Some((max, node.ptr())))
    }

    /// Repairs an under-occupied child of `parent` by borrowing from a
    /// sibling, or merging with one.
    fn fix_underflow(
        &self,
        storage: &mut dyn Storage,
        parent: &mut Node2,
        i: usize,
        parent_depth: u16,
        geo: &Geometry,
    ) -> Result<()> {
        let child_depth = parent_depth - 1;
        let min = geo.min(child_depth as usize);
        let i = i.min(parent.children.len() - 1);
        if parent.children[i].nrec as usize >= min {
            return Ok(());
        }

        let mut child = self.read_node(storage, parent.children[i], child_depth, geo)?;
        // Borrow through the separating parent record when a sibling can
        // spare a record
        if i > 0 && parent.children[i - 1].nrec as usize > min {
            let mut left = self.read_node(storage, parent.children[i - 1], child_depth, geo)?;
            let sep = std::mem::replace(&mut parent.records[i - 1], left.records.pop().unwrap());
            child.records.insert(0, sep);
            if !left.children.is_empty() {
                child.children.insert(0, left.children.pop().unwrap());
            }
            self.write_node(storage, &left, child_depth, geo)?;
            self.write_node(storage, &child, child_depth, geo)?;
            parent.children[i - 1] = left.ptr();
            parent.children[i] = child.ptr();
            return Ok(());
        }
        if i + 1 < parent.children.len() && parent.children[i + 1].nrec as usize > min {
            let mut right = self.read_node(storage, parent.children[i + 1], child_depth, geo)?;
            let sep = std::mem::replace(&mut parent.records[i], right.records.remove(0));
            child.records.push(sep);
            if !right.children.is_empty() {
                child.children.push(right.children.remove(0));
            }
            self.write_node(storage, &right, child_depth, geo)?;
            self.write_node(storage, &child, child_depth, geo)?;
            parent.children[i + 1] = right.ptr();
            parent.children[i] = child.ptr();
            return Ok(());
        }

        // Merge with a sibling; the right node's block is abandoned
        let (li, ri) = if i > 0 { (i - 1, i) } else { (i, i + 1) };
        let mut left = self.read_node(storage, parent.children[li], child_depth, geo)?;
        let right = self.read_node(storage, parent.children[ri], child_depth, geo)?;
        left.records.push(parent.records.remove(li));
        left.records.extend(right.records);
        left.children.extend(right.children);
        parent.children.remove(ri);
        self.write_node(storage, &left, child_depth, geo)?;
        parent.children[li] = left.ptr();
        debug!(
            "v2 B-tree {:#x}: merged nodes {:#x} and {:#x}",
            self.addr, left.addr, right.addr
        );
        Ok(())
    }

    /// Returns every record in comparator order.
    pub fn records(&self, storage: &mut dyn Storage) -> Result<Vec<Vec<u8>>> {
        if self.root.addr == UNDEFINED_ADDR {
            return Ok(Vec::new());
        }
        let geo = Geometry::new(self.record_size, self.depth);
        let mut out = Vec::with_capacity(self.root.total as usize);
        self.visit(storage, self.root, self.depth, &geo, &mut out)?;
        Ok(out)
    }

    /// In-order traversal of the subtree at `ptr`.
    fn visit(
        &self,
        storage: &mut dyn Storage,
        ptr: ChildPtr,
        depth: u16,
        geo: &Geometry,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        let node = self.read_node(storage, ptr, depth, geo)?;
        if depth == 0 {
            out.extend(node.records);
            return Ok(());
        }
        for (i, rec) in node.records.iter().enumerate() {
            self.visit(storage, node.children[i], depth - 1, geo, out)?;
            out.push(rec.clone());
        }
        self.visit(storage, *node.children.last().unwrap(), depth - 1, geo, out)?;
        Ok(())
    }

    /// Repacks the tree when deferred deletions left it sparse.
    ///
    /// A tree whose leaves all satisfy the merge threshold is left untouched,
    /// making the operation idempotent.
    pub fn rebalance(&mut self, storage: &mut dyn Storage) -> Result<()> {
        if self.root.addr == UNDEFINED_ADDR {
            return Ok(());
        }
        let geo = Geometry::new(self.record_size, self.depth);
        if self.depth == 0 || self.balanced(storage, self.root, self.depth, &geo)? {
            return Ok(());
        }
        let records = self.records(storage)?;
        debug!("v2 B-tree {:#x}: rebuilding over {} records", self.addr, records.len());
        self.build(storage, records)
    }

    /// Tells whether every node below the root satisfies the merge
    /// threshold.
    fn balanced(
        &self,
        storage: &mut dyn Storage,
        ptr: ChildPtr,
        depth: u16,
        geo: &Geometry,
    ) -> Result<bool> {
        if depth == 0 {
            return Ok(true);
        }
        let node = self.read_node(storage, ptr, depth, geo)?;
        for c in &node.children {
            if (c.nrec as usize) < geo.min(depth as usize - 1)
                || !self.balanced(storage, *c, depth - 1, geo)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Bulk-rebuilds the tree from sorted `records`.
    fn build(&mut self, storage: &mut dyn Storage, records: Vec<Vec<u8>>) -> Result<()> {
        // Smallest depth whose capacity fits the record count
        let n = records.len() as u64;
        let mut depth = 0u16;
        let mut geo = Geometry::new(self.record_size, depth);
        let mut capacity = geo.cap(0) as u64;
        while capacity < n {
            depth += 1;
            geo = Geometry::new(self.record_size, depth);
            capacity = capacity * (geo.cap(depth as usize) as u64 + 1) + geo.cap(depth as usize) as u64;
        }

        self.root = self.build_subtree(storage, &records, depth, &geo)?;
        self.depth = depth;
        self.write_header(storage)
    }

    /// Builds a subtree of the given depth over `records` and returns its
    /// pointer.
    fn build_subtree(
        &self,
        storage: &mut dyn Storage,
        records: &[Vec<u8>],
        depth: u16,
        geo: &Geometry,
    ) -> Result<ChildPtr> {
        let node = if depth == 0 {
            Node2 {
                addr: storage.allocate(NODE_SIZE as u64)?,
                records: records.to_vec(),
                children: Vec::new(),
            }
        } else {
            // Spread the records over m+1 child subtrees and m separators
            let child_capacity = {
                let mut cap = geo.cap(0) as u64;
                for d in 1..depth as usize {
                    cap = cap * (geo.cap(d) as u64 + 1) + geo.cap(d) as u64;
                }
                cap
            };
            let n = records.len() as u64;
            let m = n.saturating_sub(child_capacity).div_ceil(child_capacity + 1) as usize;
            let groups = m + 1;
            let per_group = (n as usize - m) / groups;
            let extra = (n as usize - m) % groups;

            let mut own = Vec::with_capacity(m);
            let mut children = Vec::with_capacity(groups);
            let mut at = 0;
            for g in 0..groups {
                let take = per_group + (g < extra) as usize;
                children.push(self.build_subtree(storage, &records[at..at + take], depth - 1, geo)?);
                at += take;
                if g < m {
                    own.push(records[at].clone());
                    at += 1;
                }
            }
            Node2 {
                addr: storage.allocate(NODE_SIZE as u64)?,
                records: own,
                children,
            }
        };
        self.write_node(storage, &node, depth, geo)?;
        Ok(node.ptr())
    }
}

/// Outcome of a recursive insertion.
enum InsertOutcome {
    /// The child absorbed the record; its pointer counts changed.
    Done(ChildPtr),
    /// The child split around a median record.
    Split {
        /// Pointer to the left half.
        left: ChildPtr,
        /// The promoted median record.
        median: Vec<u8>,
        /// Pointer to the right half.
        right: ChildPtr,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    fn rec(v: u32) -> Vec<u8> {
        let mut r = v.to_le_bytes().to_vec();
        r.resize(11, 0);
        r
    }

    fn cmp(a: &[u8], b: &[u8]) -> Result<Ordering> {
        let a = u32::from_le_bytes(a[..4].try_into().unwrap());
        let b = u32::from_le_bytes(b[..4].try_into().unwrap());
        Ok(a.cmp(&b))
    }

    fn filled(storage: &mut MemStorage, count: u32) -> BtreeV2 {
        let mut tree = BtreeV2::create(storage, BT2_TYPE_LINK_NAME, 11).unwrap();
        let mut keys: Vec<u32> = (0..count).collect();
        for i in 0..keys.len() {
            let j = (i * 2654435761 % keys.len() as usize * 40503) % keys.len();
            keys.swap(i, j);
        }
        for k in keys {
            tree.insert(storage, &rec(k), &cmp).unwrap();
        }
        tree
    }

    #[test]
    fn insert_lookup_iterate() {
        let mut storage = MemStorage::new();
        let tree = filled(&mut storage, 500);
        assert_eq!(tree.record_count(), 500);
        assert!(tree.depth >= 1);

        for k in [0u32, 250, 499] {
            assert_eq!(tree.lookup(&mut storage, &rec(k), &cmp).unwrap(), Some(rec(k)));
        }
        assert!(tree.lookup(&mut storage, &rec(1000), &cmp).unwrap().is_none());

        let all = tree.records(&mut storage).unwrap();
        assert_eq!(all.len(), 500);
        for (i, r) in all.iter().enumerate() {
            assert_eq!(r, &rec(i as u32));
        }
    }

    #[test]
    fn duplicate_record_rejected() {
        let mut storage = MemStorage::new();
        let mut tree = filled(&mut storage, 10);
        assert!(matches!(
            tree.insert(&mut storage, &rec(5), &cmp),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn load_after_inserts() {
        let mut storage = MemStorage::new();
        let tree = filled(&mut storage, 200);

        let loaded = BtreeV2::load(&mut storage, tree.addr).unwrap();
        assert_eq!(loaded.record_count(), 200);
        assert_eq!(loaded.records(&mut storage).unwrap().len(), 200);
    }

    #[test]
    fn delete_with_rebalancing() {
        let mut storage = MemStorage::new();
        let mut tree = filled(&mut storage, 300);

        for k in 0..250u32 {
            let removed = tree.delete(&mut storage, &rec(k), &cmp, true).unwrap();
            assert_eq!(removed, rec(k));
        }
        assert_eq!(tree.record_count(), 50);
        let left = tree.records(&mut storage).unwrap();
        assert_eq!(left.len(), 50);
        for (i, r) in left.iter().enumerate() {
            assert_eq!(r, &rec(250 + i as u32));
        }
        assert!(matches!(
            tree.delete(&mut storage, &rec(0), &cmp, true),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn delete_to_empty_and_reinsert() {
        let mut storage = MemStorage::new();
        let mut tree = filled(&mut storage, 60);
        for k in 0..60u32 {
            tree.delete(&mut storage, &rec(k), &cmp, true).unwrap();
        }
        assert_eq!(tree.record_count(), 0);
        assert!(tree.records(&mut storage).unwrap().is_empty());

        tree.insert(&mut storage, &rec(7), &cmp).unwrap();
        assert_eq!(tree.record_count(), 1);
    }

    #[test]
    fn lazy_delete_then_rebalance() {
        let mut storage = MemStorage::new();
        let mut tree = filled(&mut storage, 300);

        // Deferred: the tree goes sparse but stays correct
        for k in (0..300u32).step_by(2) {
            tree.delete(&mut storage, &rec(k), &cmp, false).unwrap();
        }
        assert_eq!(tree.record_count(), 150);
        let sparse_depth = tree.depth;

        tree.rebalance(&mut storage).unwrap();
        assert_eq!(tree.record_count(), 150);
        assert!(tree.depth <= sparse_depth);
        let all = tree.records(&mut storage).unwrap();
        for (i, r) in all.iter().enumerate() {
            assert_eq!(r, &rec(1 + 2 * i as u32));
        }

        // Idempotent: a second pass leaves the tree untouched
        let root = tree.root.addr;
        let depth = tree.depth;
        tree.rebalance(&mut storage).unwrap();
        assert_eq!(tree.root.addr, root);
        assert_eq!(tree.depth, depth);
    }

    #[test]
    fn update_record_in_place() {
        let mut storage = MemStorage::new();
        let mut tree = filled(&mut storage, 40);

        let mut new = rec(20);
        new[6] = 0xaa;
        tree.update(&mut storage, &rec(20), &new, &cmp).unwrap();
        assert_eq!(tree.lookup(&mut storage, &rec(20), &cmp).unwrap(), Some(new));
        assert_eq!(tree.record_count(), 40);
    }

    #[test]
    fn node_checksum_verified() {
        let mut storage = MemStorage::new();
        let tree = filled(&mut storage, 5);

        // Corrupt the root leaf
        let root = tree.root.addr as usize;
        storage.as_bytes_mut()[root + 8] ^= 0x40;
        assert!(matches!(
            tree.lookup(&mut storage, &rec(1), &cmp),
            Err(Error::FormatViolation { .. })
        ));
    }
}
