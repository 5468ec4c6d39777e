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

//! Attribute storage engine.
//!
//! Attributes start compact, as messages inside the owning object header.
//! Once the count crosses [`MAX_COMPACT_ATTRS`] or a message outgrows what a
//! header chunk can hold, every attribute moves into a fractal heap indexed
//! by a name v2 B-tree, and the header keeps a single `AttributeInfo` pointer.
//! A reopened object with an `AttributeInfo` stays dense regardless of count.

use crate::btree2::BT2_TYPE_ATTR_NAME;
use crate::btree2::BtreeV2;
use crate::checksum::lookup3;
use crate::error::Error;
use crate::error::Result;
use crate::fractal_heap::ATTR_HEAP_MAX_MANAGED;
use crate::fractal_heap::FractalHeap;
use crate::io::Reader;
use crate::io::Storage;
use crate::message::Attribute;
use crate::message::AttributeInfo;
use crate::message::Message;
use crate::message::MSG_ATTRIBUTE;
use crate::object_header::ObjectHeader;
use log::debug;
use std::cmp::Ordering;

/// Maximum number of attributes stored compactly.
pub const MAX_COMPACT_ATTRS: usize = 8;
/// Size of an attribute name-index record: heap id, flags, creation order
/// and name hash.
const RECORD_SIZE: usize = 17;
/// Largest attribute message body that still fits a header chunk slot.
const MAX_COMPACT_BODY: usize = 0xfff8;
/// Heap id placeholder marking the probe side of a comparison.
const PROBE_ID: [u8; 8] = [0; 8];

/// Computes the name hash used by the dense index.
fn name_hash(name: &str) -> u32 {
    lookup3(name.as_bytes())
}

/// Encodes a name-index record.
fn encode_record(heap_id: &[u8], corder: u32, hash: u32) -> Vec<u8> {
    let mut rec = Vec::with_capacity(RECORD_SIZE);
    rec.extend_from_slice(heap_id);
    rec.push(0);
    rec.extend_from_slice(&corder.to_le_bytes());
    rec.extend_from_slice(&hash.to_le_bytes());
    rec
}

/// Splits a name-index record into `(heap id, creation order, hash)`.
fn record_parts(rec: &[u8]) -> (&[u8], u32, u32) {
    (
        &rec[..8],
        u32::from_le_bytes(rec[9..13].try_into().unwrap()),
        u32::from_le_bytes(rec[13..17].try_into().unwrap()),
    )
}

/// Decodes the attribute message stored in `heap` under `id`.
fn heap_attribute(heap: &FractalHeap, id: &[u8]) -> Result<Attribute> {
    let body = heap.read(id)?;
    let mut r = Reader::new(body, "dense attribute", 0);
    Attribute::decode(&mut r)
}

/// Builds the record comparator: hash first, then the actual names from the
/// heap to resolve collisions.
fn record_cmp<'c>(
    heap: &'c FractalHeap,
    probe_name: &'c str,
) -> impl Fn(&[u8], &[u8]) -> Result<Ordering> + 'c {
    move |a: &[u8], b: &[u8]| {
        let (a_id, _, a_hash) = record_parts(a);
        let (b_id, _, b_hash) = record_parts(b);
        match a_hash.cmp(&b_hash) {
            Ordering::Equal => {}
            ord => return Ok(ord),
        }
        let a_name = if a_id == PROBE_ID {
            probe_name.to_owned()
        } else {
            heap_attribute(heap, a_id)?.name
        };
        let b_name = if b_id == PROBE_ID {
            probe_name.to_owned()
        } else {
            heap_attribute(heap, b_id)?.name
        };
        Ok(a_name.as_bytes().cmp(b_name.as_bytes()))
    }
}

/// Returns the compact attribute messages of `oh`, in creation order.
fn compact_attrs(oh: &ObjectHeader) -> impl Iterator<Item = &Attribute> {
    oh.messages.iter().filter_map(|m| match m {
        Message::Attribute(a) => Some(a),
        _ => None,
    })
}

/// Looks up the dense record for `name`.
fn dense_find(
    storage: &mut dyn Storage,
    heap: &FractalHeap,
    tree: &BtreeV2,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let probe = encode_record(&PROBE_ID, 0, name_hash(name));
    tree.lookup(storage, &probe, &record_cmp(heap, name))
}

/// Checks the attribute description before any write.
fn validate(attr: &Attribute) -> Result<()> {
    if attr.name.is_empty() {
        return Err(Error::InvalidArgument("empty attribute name".into()));
    }
    attr.datatype.validate()?;
    attr.dataspace.validate()?;
    let expected = attr.datatype.size() * attr.dataspace.element_count();
    if attr.data.len() as u64 != expected {
        return Err(Error::InvalidArgument(format!(
            "attribute `{}` carries {} bytes, expected {expected}",
            attr.name,
            attr.data.len()
        )));
    }
    Ok(())
}

/// Writes a new attribute on the object.
pub fn write(storage: &mut dyn Storage, oh: &mut ObjectHeader, attr: Attribute) -> Result<()> {
    validate(&attr)?;
    if oh.attribute_info().is_some() {
        return dense_insert(storage, oh, attr);
    }
    if compact_attrs(oh).any(|a| a.name == attr.name) {
        return Err(Error::AlreadyExists(attr.name));
    }

    let count = compact_attrs(oh).count();
    if count >= MAX_COMPACT_ATTRS || attr.to_bytes().len() > MAX_COMPACT_BODY {
        // Header chunk overflow is the signal to go dense
        transition(storage, oh)?;
        return dense_insert(storage, oh, attr);
    }
    oh.push(Message::Attribute(attr));
    oh.rewrite(storage)
}

/// Moves every compact attribute into freshly created dense storage.
fn transition(storage: &mut dyn Storage, oh: &mut ObjectHeader) -> Result<()> {
    let attrs: Vec<Attribute> = compact_attrs(oh).cloned().collect();
    debug!(
        "object header {:#x}: {} attributes transition to dense storage",
        oh.addr,
        attrs.len()
    );
    let mut heap = FractalHeap::create(storage, ATTR_HEAP_MAX_MANAGED)?;
    let mut tree = BtreeV2::create(storage, BT2_TYPE_ATTR_NAME, RECORD_SIZE)?;
    for (i, attr) in attrs.iter().enumerate() {
        let id = heap.insert(storage, &attr.to_bytes())?;
        let rec = encode_record(&id, i as u32, name_hash(&attr.name));
        tree.insert(storage, &rec, &record_cmp(&heap, &attr.name))?;
    }
    oh.messages.retain(|m| m.type_id() != MSG_ATTRIBUTE);
    oh.push(Message::AttributeInfo(AttributeInfo {
        max_corder: attrs.len() as u16,
        fheap_addr: heap.addr,
        name_btree_addr: tree.addr,
    }));
    oh.rewrite(storage)
}

/// Inserts an attribute into the dense storage of `oh`.
fn dense_insert(storage: &mut dyn Storage, oh: &mut ObjectHeader, attr: Attribute) -> Result<()> {
    let info = oh.attribute_info().unwrap().clone();
    let mut heap = FractalHeap::load(storage, info.fheap_addr)?;
    let mut tree = BtreeV2::load(storage, info.name_btree_addr)?;
    if dense_find(storage, &heap, &tree, &attr.name)?.is_some() {
        return Err(Error::AlreadyExists(attr.name));
    }

    let id = heap.insert(storage, &attr.to_bytes())?;
    let rec = encode_record(&id, info.max_corder as u32, name_hash(&attr.name));
    tree.insert(storage, &rec, &record_cmp(&heap, &attr.name))?;

    for m in &mut oh.messages {
        if let Message::AttributeInfo(ai) = m {
            ai.max_corder += 1;
        }
    }
    oh.rewrite(storage)
}

/// Reads the attribute `name`.
pub fn read(storage: &mut dyn Storage, oh: &ObjectHeader, name: &str) -> Result<Attribute> {
    if let Some(info) = oh.attribute_info() {
        let heap = FractalHeap::load(storage, info.fheap_addr)?;
        let tree = BtreeV2::load(storage, info.name_btree_addr)?;
        let rec = dense_find(storage, &heap, &tree, name)?
            .ok_or_else(|| Error::NotFound(format!("attribute `{name}`")))?;
        return heap_attribute(&heap, record_parts(&rec).0);
    }
    compact_attrs(oh)
        .find(|a| a.name == name)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("attribute `{name}`")))
}

/// Replaces the value of the existing attribute `attr.name`.
///
/// A same-size payload is overwritten in place; a different-size payload
/// gets a new heap record and the index entry is repointed.
pub fn modify(storage: &mut dyn Storage, oh: &mut ObjectHeader, attr: Attribute) -> Result<()> {
    validate(&attr)?;
    if let Some(info) = oh.attribute_info() {
        let info = info.clone();
        let mut heap = FractalHeap::load(storage, info.fheap_addr)?;
        let mut tree = BtreeV2::load(storage, info.name_btree_addr)?;
        let rec = dense_find(storage, &heap, &tree, &attr.name)?
            .ok_or_else(|| Error::NotFound(format!("attribute `{}`", attr.name)))?;
        let (old_id, corder, hash) = record_parts(&rec);
        let old_id = old_id.to_vec();
        let old_len = heap.read(&old_id)?.len();

        let body = attr.to_bytes();
        if body.len() == old_len {
            return heap.replace(storage, &old_id, &body);
        }
        let new_id = heap.insert(storage, &body)?;
        let new_rec = encode_record(&new_id, corder, hash);
        let probe = encode_record(&PROBE_ID, 0, hash);
        tree.update(storage, &probe, &new_rec, &record_cmp(&heap, &attr.name))?;
        heap.remove(storage, &old_id)?;
        return Ok(());
    }

    let mut found = false;
    for m in &mut oh.messages {
        if let Message::Attribute(a) = m
            && a.name == attr.name
        {
            *a = attr.clone();
            found = true;
            break;
        }
    }
    if !found {
        return Err(Error::NotFound(format!("attribute `{}`", attr.name)));
    }
    oh.rewrite(storage)
}

/// Deletes the attribute `name`.
///
/// With `rebalance`, the dense index is rebalanced incrementally; otherwise
/// deletions leave it sparse until [`rebalance`] runs.
pub fn delete(
    storage: &mut dyn Storage,
    oh: &mut ObjectHeader,
    name: &str,
    rebalance: bool,
) -> Result<()> {
    if let Some(info) = oh.attribute_info() {
        let info = info.clone();
        let mut heap = FractalHeap::load(storage, info.fheap_addr)?;
        let mut tree = BtreeV2::load(storage, info.name_btree_addr)?;
        let rec = dense_find(storage, &heap, &tree, name)?
            .ok_or_else(|| Error::NotFound(format!("attribute `{name}`")))?;

        let probe = encode_record(&PROBE_ID, 0, name_hash(name));
        tree.delete(storage, &probe, &record_cmp(&heap, name), rebalance)?;
        heap.remove(storage, record_parts(&rec).0)?;
        return Ok(());
    }

    let before = oh.messages.len();
    oh.messages
        .retain(|m| !matches!(m, Message::Attribute(a) if a.name == name));
    if oh.messages.len() == before {
        return Err(Error::NotFound(format!("attribute `{name}`")));
    }
    oh.rewrite(storage)
}

/// Lists the attribute names, sorted.
pub fn list(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<Vec<String>> {
    let mut names = if let Some(info) = oh.attribute_info() {
        let heap = FractalHeap::load(storage, info.fheap_addr)?;
        let tree = BtreeV2::load(storage, info.name_btree_addr)?;
        let mut names = Vec::new();
        for rec in tree.records(storage)? {
            names.push(heap_attribute(&heap, record_parts(&rec).0)?.name);
        }
        names
    } else {
        compact_attrs(oh).map(|a| a.name.clone()).collect()
    };
    names.sort();
    Ok(names)
}

/// Number of attributes on the object.
pub fn count(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<u64> {
    if let Some(info) = oh.attribute_info() {
        let tree = BtreeV2::load(storage, info.name_btree_addr)?;
        return Ok(tree.record_count());
    }
    Ok(compact_attrs(oh).count() as u64)
}

/// Rebalances the dense name index after deferred deletions.
pub fn rebalance(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<()> {
    if let Some(info) = oh.attribute_info() {
        let mut tree = BtreeV2::load(storage, info.name_btree_addr)?;
        tree.rebalance(storage)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;
    use crate::io::MemStorage;
    use crate::message::Dataspace;
    use crate::object_header::HeaderVersion;

    fn int_attr(name: &str, value: i32) -> Attribute {
        Attribute {
            name: name.into(),
            datatype: Datatype::int32(),
            dataspace: Dataspace::scalar(),
            data: value.to_le_bytes().to_vec(),
        }
    }

    fn object(storage: &mut MemStorage) -> ObjectHeader {
        storage.set_eof(48);
        let mut oh = ObjectHeader::new(HeaderVersion::V2);
        oh.push(Message::Datatype(Datatype::int32()));
        oh.push(Message::Dataspace(Dataspace::new(vec![4])));
        oh.write_new(storage).unwrap();
        oh
    }

    #[test]
    fn compact_write_read() {
        let mut storage = MemStorage::new();
        let mut oh = object(&mut storage);

        write(&mut storage, &mut oh, int_attr("a", 1)).unwrap();
        write(&mut storage, &mut oh, int_attr("b", 2)).unwrap();
        assert!(oh.attribute_info().is_none());

        let oh = ObjectHeader::load(&mut storage, oh.addr).unwrap();
        assert_eq!(read(&mut storage, &oh, "a").unwrap().data, 1i32.to_le_bytes());
        assert_eq!(list(&mut storage, &oh).unwrap(), ["a", "b"]);
        assert!(matches!(
            read(&mut storage, &oh, "c"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_rejected_in_both_regimes() {
        let mut storage = MemStorage::new();
        let mut oh = object(&mut storage);
        write(&mut storage, &mut oh, int_attr("x", 1)).unwrap();
        assert!(matches!(
            write(&mut storage, &mut oh, int_attr("x", 2)),
            Err(Error::AlreadyExists(_))
        ));

        for i in 0..10 {
            let _ = write(&mut storage, &mut oh, int_attr(&format!("n{i}"), i));
        }
        assert!(oh.attribute_info().is_some());
        assert!(matches!(
            write(&mut storage, &mut oh, int_attr("n3", 9)),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn transition_preserves_attributes() {
        let mut storage = MemStorage::new();
        let mut oh = object(&mut storage);

        for i in 0i32..12 {
            write(&mut storage, &mut oh, int_attr(&format!("attr{i:02}"), i * 10)).unwrap();
        }
        assert!(oh.attribute_info().is_some());

        let oh = ObjectHeader::load(&mut storage, oh.addr).unwrap();
        assert_eq!(count(&mut storage, &oh).unwrap(), 12);
        for i in 0i32..12 {
            let a = read(&mut storage, &oh, &format!("attr{i:02}")).unwrap();
            assert_eq!(a.data, (i * 10).to_le_bytes());
        }
    }

    #[test]
    fn compact_delete_reserializes() {
        let mut storage = MemStorage::new();
        let mut oh = object(&mut storage);
        for name in ["attr0", "attr1", "attr2"] {
            write(&mut storage, &mut oh, int_attr(name, 7)).unwrap();
        }
        delete(&mut storage, &mut oh, "attr1", true).unwrap();

        let oh = ObjectHeader::load(&mut storage, oh.addr).unwrap();
        assert_eq!(list(&mut storage, &oh).unwrap(), ["attr0", "attr2"]);
        assert!(matches!(
            read(&mut storage, &oh, "attr1"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn dense_delete_and_modify() {
        let mut storage = MemStorage::new();
        let mut oh = object(&mut storage);
        for i in 0..20 {
            write(&mut storage, &mut oh, int_attr(&format!("k{i:02}"), i)).unwrap();
        }

        delete(&mut storage, &mut oh, "k07", true).unwrap();
        assert!(matches!(
            read(&mut storage, &oh, "k07"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(count(&mut storage, &oh).unwrap(), 19);

        // Same-size modify
        modify(&mut storage, &mut oh, int_attr("k03", -5)).unwrap();
        assert_eq!(read(&mut storage, &oh, "k03").unwrap().data, (-5i32).to_le_bytes());

        // Different-size modify repoints the heap record
        let wide = Attribute {
            name: "k04".into(),
            datatype: Datatype::int32(),
            dataspace: Dataspace::new(vec![3]),
            data: [1i32, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect(),
        };
        modify(&mut storage, &mut oh, wide.clone()).unwrap();
        let got = read(&mut storage, &oh, "k04").unwrap();
        assert_eq!(got.data, wide.data);
        assert_eq!(got.dataspace, wide.dataspace);
    }

    #[test]
    fn lazy_delete_then_rebalance() {
        let mut storage = MemStorage::new();
        let mut oh = object(&mut storage);
        for i in 0..40 {
            write(&mut storage, &mut oh, int_attr(&format!("v{i:02}"), i)).unwrap();
        }
        for i in 0..30 {
            delete(&mut storage, &mut oh, &format!("v{i:02}"), false).unwrap();
        }
        assert_eq!(count(&mut storage, &oh).unwrap(), 10);

        rebalance(&mut storage, &oh).unwrap();
        rebalance(&mut storage, &oh).unwrap();
        assert_eq!(count(&mut storage, &oh).unwrap(), 10);
        let names = list(&mut storage, &oh).unwrap();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], "v30");
    }

    #[test]
    fn value_length_validated() {
        let mut storage = MemStorage::new();
        let mut oh = object(&mut storage);
        let bad = Attribute {
            name: "bad".into(),
            datatype: Datatype::int32(),
            dataspace: Dataspace::new(vec![2]),
            data: vec![0; 3],
        };
        assert!(matches!(
            write(&mut storage, &mut oh, bad),
            Err(Error::InvalidArgument(_))
        ));
    }
}
