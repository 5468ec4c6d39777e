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

//! Group link storage engine.
//!
//! A group starts as a symbol-table group: a v1 B-tree of symbol-table nodes
//! over a local heap of names. Past [`DENSE_GROUP_THRESHOLD`] links, or when
//! a link kind the legacy layout cannot hold appears, the group converts to
//! dense storage: `Link` messages in a fractal heap indexed by a name v2
//! B-tree. Once dense, a group stays dense.

use crate::btree1::BtreeV1;
use crate::btree1::GROUP_NODE_CAPACITY;
use crate::btree1::NODE_TYPE_GROUP;
use crate::btree2::BT2_TYPE_LINK_NAME;
use crate::btree2::BtreeV2;
use crate::checksum::lookup3;
use crate::error::Error;
use crate::error::Result;
use crate::fractal_heap::FractalHeap;
use crate::fractal_heap::LINK_HEAP_MAX_MANAGED;
use crate::io::Reader;
use crate::io::Storage;
use crate::io::UNDEFINED_ADDR;
use crate::local_heap::LocalHeap;
use crate::message::Link;
use crate::message::LinkInfo;
use crate::message::LinkTarget;
use crate::message::Message;
use crate::object_header::HeaderVersion;
use crate::object_header::ObjectHeader;
use crate::symbol_table::SNOD_CAPACITY;
use crate::symbol_table::SymbolCache;
use crate::symbol_table::SymbolEntry;
use crate::symbol_table::SymbolNode;
use log::debug;
use std::cmp::Ordering;

/// Maximum number of links a symbol-table group holds before converting to
/// dense storage.
pub const DENSE_GROUP_THRESHOLD: usize = 8;
/// Maximum number of link hops a path resolution may follow.
pub const MAX_LINK_DEPTH: usize = 32;
/// Size of a link name-index record: name hash and 7-byte heap id.
const RECORD_SIZE: usize = 11;
/// Heap id placeholder marking the probe side of a comparison.
const PROBE_ID: [u8; 7] = [0; 7];

/// Checks that `path` is absolute with non-empty components.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidArgument(format!("path `{path}` is not absolute")));
    }
    if path.len() > 1 && path[1..].split('/').any(|c| c.is_empty()) {
        return Err(Error::InvalidArgument(format!(
            "path `{path}` has empty components"
        )));
    }
    Ok(())
}

/// Splits `path` into its parent path and final component.
pub fn split_path(path: &str) -> Result<(&str, &str)> {
    validate_path(path)?;
    let (parent, name) = path.rsplit_once('/').unwrap();
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!("path `{path}` names no object")));
    }
    Ok((if parent.is_empty() { "/" } else { parent }, name))
}

/// Encodes a name-index record.
fn encode_record(heap_id: &[u8], hash: u32) -> Vec<u8> {
    let mut rec = Vec::with_capacity(RECORD_SIZE);
    rec.extend_from_slice(&hash.to_le_bytes());
    rec.extend_from_slice(heap_id);
    rec
}

/// Splits a name-index record into `(hash, heap id)`.
fn record_parts(rec: &[u8]) -> (u32, &[u8]) {
    (u32::from_le_bytes(rec[..4].try_into().unwrap()), &rec[4..])
}

/// Decodes the link message stored in `heap` under `id`.
fn heap_link(heap: &FractalHeap, id: &[u8]) -> Result<Link> {
    let body = heap.read(id)?;
    let mut r = Reader::new(body, "dense link", 0);
    Link::decode(&mut r)
}

/// Builds the record comparator: hash first, then names from the heap.
fn record_cmp<'c>(
    heap: &'c FractalHeap,
    probe_name: &'c str,
) -> impl Fn(&[u8], &[u8]) -> Result<Ordering> + 'c {
    move |a: &[u8], b: &[u8]| {
        let (a_hash, a_id) = record_parts(a);
        let (b_hash, b_id) = record_parts(b);
        match a_hash.cmp(&b_hash) {
            Ordering::Equal => {}
            ord => return Ok(ord),
        }
        let a_name = if a_id == PROBE_ID {
            probe_name.to_owned()
        } else {
            heap_link(heap, a_id)?.name
        };
        let b_name = if b_id == PROBE_ID {
            probe_name.to_owned()
        } else {
            heap_link(heap, b_id)?.name
        };
        Ok(a_name.as_bytes().cmp(b_name.as_bytes()))
    }
}

/// Creates a symbol-table group object and returns its header.
///
/// Structures land in ascending address order: object header, then B-tree,
/// then local heap.
pub fn create_group_object(
    storage: &mut dyn Storage,
    version: HeaderVersion,
) -> Result<ObjectHeader> {
    let mut oh = ObjectHeader::new(version);
    oh.push(Message::SymbolTable {
        btree_addr: UNDEFINED_ADDR,
        heap_addr: UNDEFINED_ADDR,
    });
    oh.write_new(storage)?;
    let btree = BtreeV1::create(storage, NODE_TYPE_GROUP, 8, GROUP_NODE_CAPACITY)?;
    let heap = LocalHeap::create(storage)?;
    oh.messages[0] = Message::SymbolTable {
        btree_addr: btree.addr,
        heap_addr: heap.addr,
    };
    oh.rewrite(storage)?;
    debug!("group object at {:#x}", oh.addr);
    Ok(oh)
}

/// Loaded symbol-table storage of a group.
struct SymbolStorage {
    heap: LocalHeap,
    btree: BtreeV1,
    nodes: Vec<SymbolNode>,
}

/// Loads the symbol-table side of `oh`.
fn load_symbol_storage(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<SymbolStorage> {
    let (btree_addr, heap_addr) = oh.symbol_table().ok_or_else(|| {
        Error::format("object header", oh.addr, "a symbol table message", "none")
    })?;
    let heap = LocalHeap::load(storage, heap_addr)?;
    let btree = BtreeV1::open(btree_addr, NODE_TYPE_GROUP, 8, GROUP_NODE_CAPACITY);
    let mut nodes = Vec::new();
    for (_, child) in btree.records(storage)? {
        nodes.push(SymbolNode::load(storage, child)?);
    }
    Ok(SymbolStorage {
        heap,
        btree,
        nodes,
    })
}

/// Reconstructs a link from a symbol-table entry.
fn entry_link(heap: &LocalHeap, entry: &SymbolEntry) -> Result<Link> {
    let name = String::from_utf8_lossy(heap.string_at(entry.name_off)?).into_owned();
    let target = match entry.cache {
        SymbolCache::Symlink {
            path_off,
        } => LinkTarget::Soft(
            String::from_utf8_lossy(heap.string_at(path_off as u64)?).into_owned(),
        ),
        _ => LinkTarget::Hard(entry.oh_addr),
    };
    Ok(Link {
        name,
        corder: 0,
        target,
    })
}

/// Number of links in the group.
pub fn link_count(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<usize> {
    if let Some(info) = oh.link_info() {
        let tree = BtreeV2::load(storage, info.name_btree_addr)?;
        return Ok(tree.record_count() as usize);
    }
    let sym = load_symbol_storage(storage, oh)?;
    Ok(sym.nodes.iter().map(|n| n.entries.len()).sum())
}

/// Returns the link named `name` in the group, if present.
pub fn find_link(storage: &mut dyn Storage, oh: &ObjectHeader, name: &str) -> Result<Option<Link>> {
    if let Some(info) = oh.link_info() {
        let heap = FractalHeap::load(storage, info.fheap_addr)?;
        let tree = BtreeV2::load(storage, info.name_btree_addr)?;
        let probe = encode_record(&PROBE_ID, lookup3(name.as_bytes()));
        let rec = tree.lookup(storage, &probe, &record_cmp(&heap, name))?;
        return match rec {
            Some(rec) => Ok(Some(heap_link(&heap, record_parts(&rec).1)?)),
            None => Ok(None),
        };
    }
    let sym = load_symbol_storage(storage, oh)?;
    for node in &sym.nodes {
        if let Some(entry) = node.find(&sym.heap, name)? {
            return Ok(Some(entry_link(&sym.heap, entry)?));
        }
    }
    Ok(None)
}

/// Lists the group's links, sorted by name.
pub fn list_links(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<Vec<Link>> {
    let mut links = if let Some(info) = oh.link_info() {
        let heap = FractalHeap::load(storage, info.fheap_addr)?;
        let tree = BtreeV2::load(storage, info.name_btree_addr)?;
        let mut links = Vec::new();
        for rec in tree.records(storage)? {
            links.push(heap_link(&heap, record_parts(&rec).1)?);
        }
        links
    } else {
        let sym = load_symbol_storage(storage, oh)?;
        let mut links = Vec::new();
        for node in &sym.nodes {
            for entry in &node.entries {
                links.push(entry_link(&sym.heap, entry)?);
            }
        }
        links
    };
    links.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(links)
}

/// Inserts `link` into the group, converting to dense storage when the
/// threshold is crossed or the legacy layout cannot hold the link kind.
pub fn insert_link(storage: &mut dyn Storage, oh: &mut ObjectHeader, link: Link) -> Result<()> {
    if link.name.is_empty() {
        return Err(Error::InvalidArgument("empty link name".into()));
    }
    if oh.link_info().is_some() {
        return dense_insert(storage, oh, link);
    }

    let sym = load_symbol_storage(storage, oh)?;
    for node in &sym.nodes {
        if node.find(&sym.heap, &link.name)?.is_some() {
            return Err(Error::AlreadyExists(link.name));
        }
    }
    let count: usize = sym.nodes.iter().map(|n| n.entries.len()).sum();
    let legacy_kind = matches!(link.target, LinkTarget::Hard(_) | LinkTarget::Soft(_));
    if count + 1 > DENSE_GROUP_THRESHOLD || !legacy_kind || sym.nodes.len() > 1 {
        drop(sym);
        convert_to_dense(storage, oh)?;
        return dense_insert(storage, oh, link);
    }

    let mut sym = sym;
    let name_off = sym.heap.add_string(storage, &link.name)?;
    let entry = match &link.target {
        LinkTarget::Hard(addr) => SymbolEntry {
            name_off,
            oh_addr: *addr,
            cache: SymbolCache::None,
        },
        LinkTarget::Soft(path) => {
            let path_off = sym.heap.add_string(storage, path)?;
            SymbolEntry {
                name_off,
                oh_addr: UNDEFINED_ADDR,
                cache: SymbolCache::Symlink {
                    path_off: path_off as u32,
                },
            }
        }
        LinkTarget::External { .. } => unreachable!(),
    };

    if sym.nodes.is_empty() {
        let node = SymbolNode::create(storage)?;
        sym.btree.insert(storage, &name_off.to_le_bytes(), node.addr, &|a, b| {
            let a = u64::from_le_bytes(a.try_into().unwrap());
            let b = u64::from_le_bytes(b.try_into().unwrap());
            let a = sym.heap.string_at(a).unwrap_or_default();
            let b = sym.heap.string_at(b).unwrap_or_default();
            a.cmp(b)
        })?;
        sym.nodes.push(node);
    }
    debug_assert!(sym.nodes[0].entries.len() < SNOD_CAPACITY);
    sym.nodes[0].insert(&sym.heap, &link.name, entry)?;
    sym.nodes[0].write(storage)?;
    Ok(())
}

/// Converts a symbol-table group to dense storage.
fn convert_to_dense(storage: &mut dyn Storage, oh: &mut ObjectHeader) -> Result<()> {
    let links = list_links(storage, oh)?;
    debug!(
        "group {:#x}: {} links transition to dense storage",
        oh.addr,
        links.len()
    );
    let mut heap = FractalHeap::create(storage, LINK_HEAP_MAX_MANAGED)?;
    let mut tree = BtreeV2::create(storage, BT2_TYPE_LINK_NAME, RECORD_SIZE)?;
    for (i, mut link) in links.into_iter().enumerate() {
        link.corder = i as u64;
        let name = link.name.clone();
        let id = heap.insert(storage, &link.to_bytes())?;
        let rec = encode_record(&id, lookup3(name.as_bytes()));
        tree.insert(storage, &rec, &record_cmp(&heap, &name))?;
    }
    let max_corder = tree.record_count();
    oh.messages.retain(|m| !matches!(m, Message::SymbolTable { .. }));
    oh.push(Message::LinkInfo(LinkInfo {
        max_corder,
        fheap_addr: heap.addr,
        name_btree_addr: tree.addr,
    }));
    oh.push(Message::GroupInfo);
    oh.rewrite(storage)
}

/// Inserts a link into the dense storage of the group.
fn dense_insert(storage: &mut dyn Storage, oh: &mut ObjectHeader, mut link: Link) -> Result<()> {
    let info = oh.link_info().unwrap().clone();
    let mut heap = FractalHeap::load(storage, info.fheap_addr)?;
    let mut tree = BtreeV2::load(storage, info.name_btree_addr)?;

    let probe = encode_record(&PROBE_ID, lookup3(link.name.as_bytes()));
    if tree
        .lookup(storage, &probe, &record_cmp(&heap, &link.name))?
        .is_some()
    {
        return Err(Error::AlreadyExists(link.name));
    }

    link.corder = info.max_corder;
    let name = link.name.clone();
    let id = heap.insert(storage, &link.to_bytes())?;
    let rec = encode_record(&id, lookup3(name.as_bytes()));
    tree.insert(storage, &rec, &record_cmp(&heap, &name))?;

    for m in &mut oh.messages {
        if let Message::LinkInfo(li) = m {
            li.max_corder += 1;
        }
    }
    oh.rewrite(storage)
}

/// Removes the link named `name` from the group and returns it.
pub fn remove_link(
    storage: &mut dyn Storage,
    oh: &mut ObjectHeader,
    name: &str,
    rebalance: bool,
) -> Result<Link> {
    if let Some(info) = oh.link_info() {
        let heap_addr = info.fheap_addr;
        let mut heap = FractalHeap::load(storage, heap_addr)?;
        let mut tree = BtreeV2::load(storage, info.name_btree_addr)?;
        let probe = encode_record(&PROBE_ID, lookup3(name.as_bytes()));
        let rec = tree
            .lookup(storage, &probe, &record_cmp(&heap, name))?
            .ok_or_else(|| Error::NotFound(format!("link `{name}`")))?;
        let link = heap_link(&heap, record_parts(&rec).1)?;
        tree.delete(storage, &probe, &record_cmp(&heap, name), rebalance)?;
        heap.remove(storage, record_parts(&rec).1)?;
        return Ok(link);
    }

    let mut sym = load_symbol_storage(storage, oh)?;
    for node in &mut sym.nodes {
        if let Some(entry) = node.remove(&sym.heap, name)? {
            node.write(storage)?;
            return entry_link(&sym.heap, &entry);
        }
    }
    Err(Error::NotFound(format!("link `{name}`")))
}

/// Rebalances the dense name index after deferred deletions.
pub fn rebalance(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<()> {
    if let Some(info) = oh.link_info() {
        let mut tree = BtreeV2::load(storage, info.name_btree_addr)?;
        tree.rebalance(storage)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    fn hard(name: &str, addr: u64) -> Link {
        Link {
            name: name.into(),
            corder: 0,
            target: LinkTarget::Hard(addr),
        }
    }

    fn group(storage: &mut MemStorage) -> ObjectHeader {
        storage.set_eof(48);
        create_group_object(storage, HeaderVersion::V2).unwrap()
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("relative").is_err());
        assert!(validate_path("/a//b").is_err());
        assert_eq!(split_path("/a/b/c").unwrap(), ("/a/b", "c"));
        assert_eq!(split_path("/top").unwrap(), ("/", "top"));
        assert!(split_path("/").is_err());
    }

    #[test]
    fn symbol_table_group_basics() {
        let mut storage = MemStorage::new();
        let mut oh = group(&mut storage);

        insert_link(&mut storage, &mut oh, hard("beta", 0x100)).unwrap();
        insert_link(&mut storage, &mut oh, hard("alpha", 0x200)).unwrap();
        assert!(oh.symbol_table().is_some());
        assert_eq!(link_count(&mut storage, &oh).unwrap(), 2);

        let found = find_link(&mut storage, &oh, "alpha").unwrap().unwrap();
        assert_eq!(found.target, LinkTarget::Hard(0x200));
        assert!(find_link(&mut storage, &oh, "gamma").unwrap().is_none());

        let names: Vec<String> = list_links(&mut storage, &oh)
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, ["alpha", "beta"]);
    }

    #[test]
    fn soft_link_in_symbol_table_group() {
        let mut storage = MemStorage::new();
        let mut oh = group(&mut storage);

        insert_link(
            &mut storage,
            &mut oh,
            Link {
                name: "alias".into(),
                corder: 0,
                target: LinkTarget::Soft("/real/object".into()),
            },
        )
        .unwrap();

        let oh = ObjectHeader::load(&mut storage, oh.addr).unwrap();
        let found = find_link(&mut storage, &oh, "alias").unwrap().unwrap();
        assert_eq!(found.target, LinkTarget::Soft("/real/object".into()));
    }

    #[test]
    fn threshold_crossing_converts_to_dense() {
        let mut storage = MemStorage::new();
        let mut oh = group(&mut storage);

        for i in 0..DENSE_GROUP_THRESHOLD {
            insert_link(&mut storage, &mut oh, hard(&format!("link_{i:03}"), i as u64)).unwrap();
        }
        assert!(oh.symbol_table().is_some());

        insert_link(&mut storage, &mut oh, hard("link_008", 8)).unwrap();
        assert!(oh.symbol_table().is_none());
        assert!(oh.link_info().is_some());
        assert_eq!(link_count(&mut storage, &oh).unwrap(), 9);

        // All links survive the conversion, and order by name is kept
        let links = list_links(&mut storage, &oh).unwrap();
        for (i, l) in links.iter().enumerate() {
            assert_eq!(l.name, format!("link_{i:03}"));
            assert_eq!(l.target, LinkTarget::Hard(i as u64));
        }
    }

    #[test]
    fn external_link_forces_dense() {
        let mut storage = MemStorage::new();
        let mut oh = group(&mut storage);

        insert_link(
            &mut storage,
            &mut oh,
            Link {
                name: "remote".into(),
                corder: 0,
                target: LinkTarget::External {
                    file: "other.h5".into(),
                    path: "/x".into(),
                },
            },
        )
        .unwrap();
        assert!(oh.link_info().is_some());

        let found = find_link(&mut storage, &oh, "remote").unwrap().unwrap();
        assert!(matches!(found.target, LinkTarget::External { .. }));
    }

    #[test]
    fn dense_group_lookup_by_name() {
        let mut storage = MemStorage::new();
        let mut oh = group(&mut storage);
        for i in 0..20 {
            insert_link(&mut storage, &mut oh, hard(&format!("link_{i:03}"), 0x1000 + i)).unwrap();
        }

        let oh = ObjectHeader::load(&mut storage, oh.addr).unwrap();
        for i in 0..20 {
            let l = find_link(&mut storage, &oh, &format!("link_{i:03}")).unwrap().unwrap();
            assert_eq!(l.target, LinkTarget::Hard(0x1000 + i));
        }
    }

    #[test]
    fn remove_links_both_regimes() {
        let mut storage = MemStorage::new();
        let mut oh = group(&mut storage);
        for i in 0..3 {
            insert_link(&mut storage, &mut oh, hard(&format!("s{i}"), i)).unwrap();
        }
        let removed = remove_link(&mut storage, &mut oh, "s1", true).unwrap();
        assert_eq!(removed.target, LinkTarget::Hard(1));
        assert_eq!(link_count(&mut storage, &oh).unwrap(), 2);

        for i in 0..12 {
            insert_link(&mut storage, &mut oh, hard(&format!("d{i:02}"), i)).unwrap();
        }
        assert!(oh.link_info().is_some());
        remove_link(&mut storage, &mut oh, "d05", true).unwrap();
        assert!(find_link(&mut storage, &oh, "d05").unwrap().is_none());
        assert!(matches!(
            remove_link(&mut storage, &mut oh, "d05", true),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_link_rejected() {
        let mut storage = MemStorage::new();
        let mut oh = group(&mut storage);
        insert_link(&mut storage, &mut oh, hard("twin", 1)).unwrap();
        assert!(matches!(
            insert_link(&mut storage, &mut oh, hard("twin", 2)),
            Err(Error::AlreadyExists(_))
        ));
    }
}
