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

//! Dataset layout engine.
//!
//! Datasets are contiguous (one run) or chunked (tiles indexed by a v1
//! B-tree keyed on the chunk's element coordinates). Chunks go through the
//! filter pipeline on both sides; edge chunks are padded with the fill value
//! to the full chunk extent before filtering and truncated back on read.

use crate::btree1::BtreeV1;
use crate::btree1::CHUNK_NODE_CAPACITY;
use crate::btree1::NODE_TYPE_CHUNK;
use crate::datatype::Datatype;
use crate::error::Error;
use crate::error::Result;
use crate::filter::Pipeline;
use crate::io::Storage;
use crate::io::UNDEFINED_ADDR;
use crate::io::put_u32;
use crate::io::put_u64;
use crate::message::Dataspace;
use crate::message::FillValue;
use crate::message::Layout;
use crate::message::Message;
use crate::object_header::HeaderVersion;
use crate::object_header::ObjectHeader;
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;

/// Dataset creation options.
#[derive(Clone, Debug, Default)]
pub struct DatasetOptions {
    /// Chunk dimension sizes; switches the dataset to chunked layout.
    pub chunk_dims: Option<Vec<u64>>,
    /// Maximum dimension sizes; requires chunked layout.
    pub max_dims: Option<Vec<u64>>,
    /// Deflate compression level, 1 to 9.
    pub gzip_level: Option<u32>,
    /// Insert the shuffle filter before any compressor.
    pub shuffle: bool,
    /// Append the Fletcher-32 filter at the end of the pipeline.
    pub fletcher32: bool,
}

/// A parsed dataset: the typed view over an object header's messages.
pub struct Dataset {
    /// The element datatype.
    pub datatype: Datatype,
    /// The extent.
    pub dataspace: Dataspace,
    /// The storage layout.
    pub layout: Layout,
    /// The filter pipeline; empty for unfiltered data.
    pub pipeline: Pipeline,
    /// The fill value.
    pub fill: FillValue,
}

impl Dataset {
    /// Extracts the dataset view from `oh`.
    pub fn from_header(oh: &ObjectHeader) -> Result<Self> {
        let mut datatype = None;
        let mut dataspace = None;
        let mut layout = None;
        let mut pipeline = Pipeline::default();
        let mut fill = FillValue::default();
        for m in &oh.messages {
            match m {
                Message::Datatype(dt) => datatype = Some(dt.clone()),
                Message::Dataspace(ds) => dataspace = Some(ds.clone()),
                Message::Layout(l) => layout = Some(l.clone()),
                Message::FilterPipeline(p) => pipeline = p.clone(),
                Message::FillValue(f) => fill = f.clone(),
                _ => {}
            }
        }
        match (datatype, dataspace, layout) {
            (Some(datatype), Some(dataspace), Some(layout)) => Ok(Self {
                datatype,
                dataspace,
                layout,
                pipeline,
                fill,
            }),
            _ => Err(Error::format(
                "object header",
                oh.addr,
                "datatype, dataspace and layout messages",
                "a non-dataset object",
            )),
        }
    }

    /// Size of one element in bytes.
    fn elem_size(&self) -> u64 {
        self.datatype.size()
    }

    /// Total size of the dataset in bytes.
    fn byte_size(&self) -> u64 {
        self.elem_size() * self.dataspace.element_count()
    }

    /// One element of fill value bytes.
    fn fill_elem(&self) -> Vec<u8> {
        match &self.fill.data {
            Some(data) if data.len() as u64 == self.elem_size() => data.clone(),
            _ => vec![0; self.elem_size() as usize],
        }
    }
}

/// Builds and writes a dataset object header.
///
/// The chunk B-tree, when needed, is allocated right after the header so
/// that structures land in ascending address order.
pub fn create_dataset_object(
    storage: &mut dyn Storage,
    version: HeaderVersion,
    datatype: Datatype,
    dataspace: Dataspace,
    opts: &DatasetOptions,
) -> Result<ObjectHeader> {
    datatype.validate()?;
    dataspace.validate()?;
    let rank = dataspace.dims.len();

    if let Some(max) = &opts.max_dims {
        if opts.chunk_dims.is_none() {
            return Err(Error::InvalidArgument(
                "max dims require a chunked layout".into(),
            ));
        }
        let ds = Dataspace {
            dims: dataspace.dims.clone(),
            max_dims: Some(max.clone()),
        };
        ds.validate()?;
    }
    let has_filters = opts.shuffle || opts.gzip_level.is_some() || opts.fletcher32;
    if has_filters && opts.chunk_dims.is_none() {
        return Err(Error::InvalidArgument(
            "filters require a chunked layout".into(),
        ));
    }

    let mut oh = ObjectHeader::new(version);
    oh.push(Message::Datatype(datatype.clone()));
    let dataspace = Dataspace {
        dims: dataspace.dims,
        max_dims: opts.max_dims.clone().or(dataspace.max_dims),
    };
    oh.push(Message::Dataspace(dataspace.clone()));
    oh.push(Message::FillValue(FillValue::default()));

    match &opts.chunk_dims {
        None => {
            if dataspace.is_unlimited() {
                return Err(Error::InvalidArgument(
                    "unlimited dimensions require a chunked layout".into(),
                ));
            }
            oh.push(Message::Layout(Layout::Contiguous {
                addr: UNDEFINED_ADDR,
                size: datatype.size() * dataspace.element_count(),
            }));
            oh.write_new(storage)?;
        }
        Some(chunk_dims) => {
            if rank == 0 || chunk_dims.len() != rank || chunk_dims.contains(&0) {
                return Err(Error::InvalidArgument(format!(
                    "chunk dims {chunk_dims:?} do not fit a rank-{rank} dataset"
                )));
            }
            if chunk_dims.iter().any(|d| *d > u32::MAX as u64) {
                return Err(Error::Overflow("chunk dimension exceeds 32 bits".into()));
            }
            let pipeline = Pipeline::from_options(
                opts.shuffle,
                opts.gzip_level,
                opts.fletcher32,
                datatype.size(),
            )?;
            if !pipeline.is_empty() {
                oh.push(Message::FilterPipeline(pipeline));
            }
            oh.push(Message::Layout(Layout::Chunked {
                btree_addr: UNDEFINED_ADDR,
                dims: chunk_dims.iter().map(|d| *d as u32).collect(),
                elem_size: datatype.size() as u32,
            }));
            oh.write_new(storage)?;

            let btree = BtreeV1::create(storage, NODE_TYPE_CHUNK, key_size(rank), CHUNK_NODE_CAPACITY)?;
            for m in &mut oh.messages {
                if let Message::Layout(Layout::Chunked {
                    btree_addr, ..
                }) = m
                {
                    *btree_addr = btree.addr;
                }
            }
            oh.rewrite(storage)?;
        }
    }
    debug!("dataset object at {:#x}", oh.addr);
    Ok(oh)
}

/// Size of a chunk B-tree key: chunk size, filter mask and the element
/// offsets with their trailing element-size dimension.
fn key_size(rank: usize) -> usize {
    8 + (rank + 1) * 8
}

/// Encodes a chunk B-tree key.
fn encode_key(size: u32, mask: u32, offsets: &[u64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_size(offsets.len()));
    put_u32(&mut key, size);
    put_u32(&mut key, mask);
    for off in offsets {
        put_u64(&mut key, *off);
    }
    put_u64(&mut key, 0);
    key
}

/// Splits a chunk B-tree key into `(size, mask, offsets)`.
fn decode_key(key: &[u8], rank: usize) -> (u32, u32, Vec<u64>) {
    let size = u32::from_le_bytes(key[0..4].try_into().unwrap());
    let mask = u32::from_le_bytes(key[4..8].try_into().unwrap());
    let mut offsets = Vec::with_capacity(rank);
    for i in 0..rank {
        offsets.push(u64::from_le_bytes(key[8 + i * 8..16 + i * 8].try_into().unwrap()));
    }
    (size, mask, offsets)
}

/// Compares two chunk keys by their offsets, row-major.
fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    for (ca, cb) in a[8..].chunks_exact(8).zip(b[8..].chunks_exact(8)) {
        let va = u64::from_le_bytes(ca.try_into().unwrap());
        let vb = u64::from_le_bytes(cb.try_into().unwrap());
        match va.cmp(&vb) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// Per-dimension chunk counts of the dataset's current extent.
fn grid_dims(dims: &[u64], chunk_dims: &[u64]) -> Vec<u64> {
    dims.iter()
        .zip(chunk_dims)
        .map(|(d, c)| d.div_ceil(*c).max(1))
        .collect()
}

/// Advances a row-major N-dimensional counter; returns `false` on wrap.
fn advance(index: &mut [u64], bounds: &[u64]) -> bool {
    for i in (0..index.len()).rev() {
        index[i] += 1;
        if index[i] < bounds[i] {
            return true;
        }
        index[i] = 0;
    }
    false
}

/// Copies the overlap of a chunk and the dataset extent between the chunk
/// tile and the flat dataset buffer.
///
/// Arguments:
/// - `tile` is the chunk-shaped buffer and `flat` the whole dataset buffer.
/// - `origin` is the chunk's element offset in the dataset.
/// - `to_tile` selects the copy direction.
fn copy_overlap(
    tile: &mut [u8],
    flat: &mut [u8],
    dims: &[u64],
    chunk_dims: &[u64],
    origin: &[u64],
    elem: u64,
    to_tile: bool,
) {
    let rank = dims.len();
    if rank == 0 {
        return;
    }
    // In-bounds box of the chunk
    let span: Vec<u64> = (0..rank)
        .map(|i| chunk_dims[i].min(dims[i].saturating_sub(origin[i])))
        .collect();
    if span.iter().any(|s| *s == 0) {
        return;
    }

    let run = (span[rank - 1] * elem) as usize;
    let mut index = vec![0u64; rank - 1];
    loop {
        // Row offsets inside the tile and the flat buffer
        let mut tile_off = 0;
        let mut flat_off = 0;
        for i in 0..rank - 1 {
            let idx = index[i];
            tile_off = (tile_off + idx) * chunk_dims[i + 1];
            flat_off = (flat_off + origin[i] + idx) * dims[i + 1];
        }
        flat_off += origin[rank - 1];
        let tile_off = (tile_off * elem) as usize;
        let flat_off = (flat_off * elem) as usize;
        if to_tile {
            tile[tile_off..tile_off + run].copy_from_slice(&flat[flat_off..flat_off + run]);
        } else {
            flat[flat_off..flat_off + run].copy_from_slice(&tile[tile_off..tile_off + run]);
        }
        if !advance(&mut index, &span[..rank - 1]) {
            break;
        }
    }
}

/// Writes the whole dataset content.
pub fn write(storage: &mut dyn Storage, oh: &mut ObjectHeader, data: &[u8]) -> Result<()> {
    let ds = Dataset::from_header(oh)?;
    let expected = ds.byte_size();
    if data.len() as u64 != expected {
        return Err(Error::InvalidArgument(format!(
            "dataset write of {} bytes, extent holds {expected}",
            data.len()
        )));
    }

    match &ds.layout {
        Layout::Compact { .. } => Err(Error::Unsupported("compact dataset writes".into())),
        Layout::Contiguous {
            addr,
            size,
        } => {
            let addr = if *addr == UNDEFINED_ADDR {
                let addr = storage.allocate(*size)?;
                for m in &mut oh.messages {
                    if let Message::Layout(Layout::Contiguous {
                        addr: a, ..
                    }) = m
                    {
                        *a = addr;
                    }
                }
                oh.rewrite(storage)?;
                addr
            } else {
                *addr
            };
            storage.write_at(addr, data)?;
            Ok(())
        }
        Layout::Chunked {
            dims: chunk_dims, ..
        } => {
            let chunk_dims: Vec<u64> = chunk_dims.iter().map(|d| *d as u64).collect();
            let elem = ds.elem_size();
            let chunk_bytes: u64 = chunk_dims.iter().product::<u64>() * elem;
            let grid = grid_dims(&ds.dataspace.dims, &chunk_dims);
            let fill = ds.fill_elem();

            let mut data = data.to_vec();
            let mut coords = vec![0u64; grid.len()];
            loop {
                let origin: Vec<u64> = coords
                    .iter()
                    .zip(&chunk_dims)
                    .map(|(c, d)| c * d)
                    .collect();
                let mut tile: Vec<u8> =
                    fill.iter().cycle().take(chunk_bytes as usize).copied().collect();
                copy_overlap(
                    &mut tile,
                    &mut data,
                    &ds.dataspace.dims,
                    &chunk_dims,
                    &origin,
                    elem,
                    true,
                );
                write_tile(storage, &ds, &origin, tile)?;
                if !advance(&mut coords, &grid) {
                    break;
                }
            }
            Ok(())
        }
    }
}

/// Writes one chunk, given its grid coordinates and full pre-filter tile.
pub fn write_chunk(
    storage: &mut dyn Storage,
    oh: &mut ObjectHeader,
    coords: &[u64],
    tile: Vec<u8>,
) -> Result<()> {
    let ds = Dataset::from_header(oh)?;
    let Layout::Chunked {
        dims: chunk_dims, ..
    } = &ds.layout
    else {
        return Err(Error::InvalidArgument("chunk write on a non-chunked dataset".into()));
    };
    let chunk_dims: Vec<u64> = chunk_dims.iter().map(|d| *d as u64).collect();
    if coords.len() != chunk_dims.len() {
        return Err(Error::InvalidArgument(format!(
            "chunk coordinates {coords:?} do not fit rank {}",
            chunk_dims.len()
        )));
    }
    let chunk_bytes = chunk_dims.iter().product::<u64>() * ds.elem_size();
    if tile.len() as u64 != chunk_bytes {
        return Err(Error::InvalidArgument(format!(
            "chunk of {} bytes, chunk extent holds {chunk_bytes}",
            tile.len()
        )));
    }
    let origin: Vec<u64> = coords.iter().zip(&chunk_dims).map(|(c, d)| c * d).collect();
    write_tile(storage, &ds, &origin, tile)
}

/// Filters and stores one tile, updating the chunk B-tree.
fn write_tile(storage: &mut dyn Storage, ds: &Dataset, origin: &[u64], tile: Vec<u8>) -> Result<()> {
    let Layout::Chunked {
        btree_addr, ..
    } = ds.layout
    else {
        unreachable!();
    };
    let (filtered, mask) = ds.pipeline.apply(tile)?;
    let addr = storage.allocate(filtered.len() as u64)?;
    storage.write_at(addr, &filtered)?;

    let rank = origin.len();
    let btree = BtreeV1::open(btree_addr, NODE_TYPE_CHUNK, key_size(rank), CHUNK_NODE_CAPACITY);
    let key = encode_key(filtered.len() as u32, mask, origin);
    btree.insert(storage, &key, addr, &compare_keys)?;
    Ok(())
}

/// Reads the whole dataset content.
pub fn read(storage: &mut dyn Storage, oh: &ObjectHeader) -> Result<Vec<u8>> {
    let ds = Dataset::from_header(oh)?;
    match &ds.layout {
        Layout::Compact {
            data,
        } => Ok(data.clone()),
        Layout::Contiguous {
            addr,
            size,
        } => {
            if *addr == UNDEFINED_ADDR {
                let fill = ds.fill_elem();
                return Ok(fill.iter().cycle().take(ds.byte_size() as usize).copied().collect());
            }
            let mut buf = vec![0; *size as usize];
            storage.read_at(*addr, &mut buf)?;
            Ok(buf)
        }
        Layout::Chunked {
            btree_addr,
            dims: chunk_dims,
            ..
        } => {
            let chunk_dims: Vec<u64> = chunk_dims.iter().map(|d| *d as u64).collect();
            let elem = ds.elem_size();
            let rank = chunk_dims.len();
            let fill = ds.fill_elem();
            let mut out: Vec<u8> =
                fill.iter().cycle().take(ds.byte_size() as usize).copied().collect();

            let btree =
                BtreeV1::open(*btree_addr, NODE_TYPE_CHUNK, key_size(rank), CHUNK_NODE_CAPACITY);
            for (key, addr) in btree.records(storage)? {
                let (size, mask, origin) = decode_key(&key, rank);
                let mut raw = vec![0; size as usize];
                storage.read_at(addr, &mut raw)?;
                let mut tile = ds.pipeline.invert(raw, mask)?;
                tile.resize((chunk_dims.iter().product::<u64>() * elem) as usize, 0);
                copy_overlap(
                    &mut tile,
                    &mut out,
                    &ds.dataspace.dims,
                    &chunk_dims,
                    &origin,
                    elem,
                    false,
                );
            }
            Ok(out)
        }
    }
}

/// Cooperative cancellation flag shared with a [`ChunkIterator`].
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    /// Tells whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

/// One decoded chunk produced by a [`ChunkIterator`].
#[derive(Debug, PartialEq)]
pub struct ChunkRead {
    /// Element offset of the chunk in the dataset.
    pub origin: Vec<u64>,
    /// Decoded element bytes, truncated at the dataset bounds.
    pub data: Vec<u8>,
}

/// Streaming reader over the chunks of a dataset, in B-tree key order.
///
/// The iterator is finite, restartable through [`ChunkIterator::reset`] and
/// cooperatively cancellable: cancellation ends the iteration, telling it
/// apart from exhaustion only through [`ChunkIterator::err`].
pub struct ChunkIterator<'s> {
    storage: &'s mut dyn Storage,
    /// Chunk records `(key, address)` in key order.
    records: Vec<(Vec<u8>, u64)>,
    /// Next record to produce.
    pos: usize,
    dims: Vec<u64>,
    chunk_dims: Vec<u64>,
    elem: u64,
    pipeline: Pipeline,
    cancel: CancelToken,
    /// Set when the iteration ended on cancellation.
    err: Option<Error>,
    /// Set once the iteration ended for any reason but exhaustion.
    done: bool,
}

impl<'s> ChunkIterator<'s> {
    /// Builds an iterator over the chunks of the dataset `oh`.
    pub fn new(
        storage: &'s mut dyn Storage,
        oh: &ObjectHeader,
        cancel: CancelToken,
    ) -> Result<Self> {
        let ds = Dataset::from_header(oh)?;
        let Layout::Chunked {
            btree_addr,
            dims: chunk_dims,
            ..
        } = &ds.layout
        else {
            return Err(Error::InvalidArgument(
                "chunk iteration on a non-chunked dataset".into(),
            ));
        };
        let chunk_dims: Vec<u64> = chunk_dims.iter().map(|d| *d as u64).collect();
        let rank = chunk_dims.len();
        let btree =
            BtreeV1::open(*btree_addr, NODE_TYPE_CHUNK, key_size(rank), CHUNK_NODE_CAPACITY);
        let records = btree.records(storage)?;
        Ok(Self {
            storage,
            records,
            pos: 0,
            dims: ds.dataspace.dims.clone(),
            chunk_dims,
            elem: ds.elem_size(),
            pipeline: ds.pipeline.clone(),
            cancel,
            err: None,
            done: false,
        })
    }

    /// Restarts the iteration from the first chunk.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.err = None;
        self.done = false;
    }

    /// Returns the error that ended the iteration, if any.
    ///
    /// [`Error::Cancelled`] here is the only way to tell a cancelled run
    /// from an exhausted one.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Reads and decodes the record at `pos`.
    fn read_chunk(&mut self, pos: usize) -> Result<ChunkRead> {
        let (key, addr) = &self.records[pos];
        let rank = self.chunk_dims.len();
        let (size, mask, origin) = decode_key(key, rank);
        let mut raw = vec![0; size as usize];
        self.storage.read_at(*addr, &mut raw)?;
        let mut tile = self.pipeline.invert(raw, mask)?;
        let chunk_bytes = (self.chunk_dims.iter().product::<u64>() * self.elem) as usize;
        tile.resize(chunk_bytes, 0);

        // Truncate to the dataset bounds
        let span: Vec<u64> = (0..rank)
            .map(|i| self.chunk_dims[i].min(self.dims[i].saturating_sub(origin[i])))
            .collect();
        let mut data = vec![0; (span.iter().product::<u64>() * self.elem) as usize];
        if span == self.chunk_dims {
            data.copy_from_slice(&tile);
        } else {
            // Repack the in-bounds box contiguously
            copy_overlap(
                &mut tile,
                &mut data,
                &span,
                &self.chunk_dims,
                &vec![0; rank],
                self.elem,
                false,
            );
        }
        Ok(ChunkRead {
            origin,
            data,
        })
    }
}

impl Iterator for ChunkIterator<'_> {
    type Item = Result<ChunkRead>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.records.len() {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.err = Some(Error::Cancelled);
            self.done = true;
            return None;
        }
        let pos = self.pos;
        self.pos += 1;
        match self.read_chunk(pos) {
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    fn f64_data(n: usize) -> Vec<u8> {
        (0..n).flat_map(|i| (i as f64 * 1.5).to_le_bytes()).collect()
    }

    fn chunked_f64(storage: &mut MemStorage, dims: Vec<u64>, chunks: Vec<u64>) -> ObjectHeader {
        storage.set_eof(48);
        create_dataset_object(
            storage,
            HeaderVersion::V2,
            Datatype::Float64,
            Dataspace::new(dims),
            &DatasetOptions {
                chunk_dims: Some(chunks),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn contiguous_roundtrip() {
        let mut storage = MemStorage::new();
        storage.set_eof(48);
        let mut oh = create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::int32(),
            Dataspace::new(vec![10]),
            &DatasetOptions::default(),
        )
        .unwrap();

        let data: Vec<u8> = (0..10i32).flat_map(|i| i.to_le_bytes()).collect();
        write(&mut storage, &mut oh, &data).unwrap();

        let oh = ObjectHeader::load(&mut storage, oh.addr).unwrap();
        assert_eq!(read(&mut storage, &oh).unwrap(), data);
    }

    #[test]
    fn unwritten_contiguous_reads_as_fill() {
        let mut storage = MemStorage::new();
        storage.set_eof(48);
        let oh = create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::int32(),
            Dataspace::new(vec![4]),
            &DatasetOptions::default(),
        )
        .unwrap();
        assert_eq!(read(&mut storage, &oh).unwrap(), vec![0; 16]);
    }

    #[test]
    fn chunked_roundtrip_exact_tiles() {
        let mut storage = MemStorage::new();
        let mut oh = chunked_f64(&mut storage, vec![1000], vec![100]);

        let data = f64_data(1000);
        write(&mut storage, &mut oh, &data).unwrap();

        let oh = ObjectHeader::load(&mut storage, oh.addr).unwrap();
        assert_eq!(read(&mut storage, &oh).unwrap(), data);
    }

    #[test]
    fn chunked_roundtrip_edge_chunks() {
        let mut storage = MemStorage::new();
        let mut oh = chunked_f64(&mut storage, vec![7, 5], vec![4, 3]);

        let data = f64_data(35);
        write(&mut storage, &mut oh, &data).unwrap();
        assert_eq!(read(&mut storage, &oh).unwrap(), data);
    }

    #[test]
    fn chunked_with_full_pipeline() {
        let mut storage = MemStorage::new();
        storage.set_eof(48);
        let mut oh = create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::Float64,
            Dataspace::new(vec![1000]),
            &DatasetOptions {
                chunk_dims: Some(vec![100]),
                gzip_level: Some(9),
                shuffle: true,
                fletcher32: true,
                ..Default::default()
            },
        )
        .unwrap();

        let data = f64_data(1000);
        write(&mut storage, &mut oh, &data).unwrap();
        assert_eq!(read(&mut storage, &oh).unwrap(), data);
    }

    #[test]
    fn single_chunk_rewrite() {
        let mut storage = MemStorage::new();
        let mut oh = chunked_f64(&mut storage, vec![10], vec![5]);
        write(&mut storage, &mut oh, &f64_data(10)).unwrap();

        let tile: Vec<u8> = (100..105).flat_map(|i| (i as f64).to_le_bytes()).collect();
        write_chunk(&mut storage, &mut oh, &[1], tile.clone()).unwrap();

        let out = read(&mut storage, &oh).unwrap();
        assert_eq!(&out[..40], &f64_data(10)[..40]);
        assert_eq!(&out[40..], &tile[..]);
    }

    #[test]
    fn chunk_iterator_streams_in_order() {
        let mut storage = MemStorage::new();
        let mut oh = chunked_f64(&mut storage, vec![10], vec![4]);
        write(&mut storage, &mut oh, &f64_data(10)).unwrap();

        let mut it = ChunkIterator::new(&mut storage, &oh, CancelToken::new()).unwrap();
        let chunks: Vec<ChunkRead> = it.by_ref().map(|c| c.unwrap()).collect();
        assert!(it.err().is_none());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].origin, [0]);
        assert_eq!(chunks[1].origin, [4]);
        assert_eq!(chunks[2].origin, [8]);
        // The trailing edge chunk is truncated to 2 elements
        assert_eq!(chunks[2].data.len(), 16);
        let whole: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(whole, f64_data(10));
    }

    #[test]
    fn chunk_iterator_reset_and_cancel() {
        let mut storage = MemStorage::new();
        let mut oh = chunked_f64(&mut storage, vec![12], vec![4]);
        write(&mut storage, &mut oh, &f64_data(12)).unwrap();

        let token = CancelToken::new();
        let mut it = ChunkIterator::new(&mut storage, &oh, token.clone()).unwrap();
        assert!(it.next().is_some());
        token.cancel();
        assert!(it.next().is_none());
        assert!(matches!(it.err(), Some(Error::Cancelled)));

        // Restartable after the token is replaced by a fresh run
        it.reset();
        it.cancel = CancelToken::new();
        assert_eq!(it.by_ref().count(), 3);
        assert!(it.err().is_none());
    }

    #[test]
    fn option_validation() {
        let mut storage = MemStorage::new();
        storage.set_eof(48);
        // Rank mismatch
        assert!(create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::int32(),
            Dataspace::new(vec![4, 4]),
            &DatasetOptions {
                chunk_dims: Some(vec![2]),
                ..Default::default()
            },
        )
        .is_err());
        // Filters without chunking
        assert!(create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::int32(),
            Dataspace::new(vec![4]),
            &DatasetOptions {
                gzip_level: Some(1),
                ..Default::default()
            },
        )
        .is_err());
        // Max dims below current dims
        assert!(create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::int32(),
            Dataspace::new(vec![4]),
            &DatasetOptions {
                chunk_dims: Some(vec![2]),
                max_dims: Some(vec![2]),
                ..Default::default()
            },
        )
        .is_err());
    }

    #[test]
    fn unlimited_dims_require_chunked() {
        let mut storage = MemStorage::new();
        storage.set_eof(48);
        let err = create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::int32(),
            Dataspace {
                dims: vec![4],
                max_dims: Some(vec![crate::message::UNLIMITED]),
            },
            &DatasetOptions::default(),
        );
        assert!(matches!(err, Err(Error::InvalidArgument(_))));

        let ok = create_dataset_object(
            &mut storage,
            HeaderVersion::V2,
            Datatype::int32(),
            Dataspace::new(vec![4]),
            &DatasetOptions {
                chunk_dims: Some(vec![2]),
                max_dims: Some(vec![crate::message::UNLIMITED]),
                ..Default::default()
            },
        );
        assert!(ok.is_ok());
    }
}
