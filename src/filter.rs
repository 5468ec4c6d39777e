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

//! Chunk filter pipeline.
//!
//! Each filter is an invertible byte transform identified by a 2-byte id.
//! Filters run in declared order on write and in reverse order on read. A
//! chunk's filter mask records the filters that were skipped for that chunk.

use crate::error::Error;
use crate::error::Result;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::trace;
use std::io::Read;
use std::io::Write;

/// Filter id: deflate compression.
pub const FILTER_DEFLATE: u16 = 1;
/// Filter id: byte shuffle.
pub const FILTER_SHUFFLE: u16 = 2;
/// Filter id: Fletcher-32 checksum.
pub const FILTER_FLETCHER32: u16 = 3;

/// Filter flag: the filter may be skipped on a chunk.
const FLAG_OPTIONAL: u16 = 1;

/// One declared filter of a pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filter {
    /// The filter's canonical id.
    pub id: u16,
    /// Filter flags.
    pub flags: u16,
    /// Client data values passed to the filter.
    pub client_data: Vec<u32>,
}

/// An ordered filter pipeline.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Pipeline {
    /// The filters, in application order.
    pub filters: Vec<Filter>,
}

impl Pipeline {
    /// Builds a pipeline from the dataset options.
    ///
    /// Arguments:
    /// - `shuffle` inserts the shuffle filter, placed before any compressor.
    /// - `gzip_level` adds deflate compression.
    /// - `fletcher32` appends the checksum filter, always last.
    /// - `elem_size` is the dataset's element size, consumed by shuffle.
    pub fn from_options(
        shuffle: bool,
        gzip_level: Option<u32>,
        fletcher32: bool,
        elem_size: u64,
    ) -> Result<Self> {
        let mut filters = Vec::new();
        if shuffle {
            filters.push(Filter {
                id: FILTER_SHUFFLE,
                flags: 0,
                client_data: vec![elem_size as u32],
            });
        }
        if let Some(level) = gzip_level {
            if !(1..=9).contains(&level) {
                return Err(Error::InvalidArgument(format!(
                    "gzip level must be in 1..=9, got {level}"
                )));
            }
            filters.push(Filter {
                id: FILTER_DEFLATE,
                flags: FLAG_OPTIONAL,
                client_data: vec![level],
            });
        }
        if fletcher32 {
            filters.push(Filter {
                id: FILTER_FLETCHER32,
                flags: 0,
                client_data: vec![],
            });
        }
        Ok(Self {
            filters,
        })
    }

    /// Tells whether the pipeline has no filter.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the pipeline on `data` in declared order.
    ///
    /// Returns the filtered bytes along with the filter mask: bit `i` set
    /// means filter `i` was skipped for this chunk.
    pub fn apply(&self, data: Vec<u8>) -> Result<(Vec<u8>, u32)> {
        let mut data = data;
        let mut mask = 0;
        for (i, f) in self.filters.iter().enumerate() {
            match f.id {
                FILTER_SHUFFLE => {
                    let elem_size = f.client_data.first().copied().unwrap_or(1) as usize;
                    data = shuffle(&data, elem_size);
                }
                FILTER_DEFLATE => {
                    let level = f.client_data.first().copied().unwrap_or(6);
                    let out = deflate(&data, level)?;
                    if out.len() < data.len() {
                        data = out;
                    } else {
                        // Incompressible chunk
                        trace!("deflate skipped on {}-byte chunk", data.len());
                        mask |= 1 << i;
                    }
                }
                FILTER_FLETCHER32 => {
                    let sum = crate::checksum::fletcher32(&data);
                    data.extend_from_slice(&sum.to_le_bytes());
                }
                id => return Err(Error::Unsupported(format!("filter id {id}"))),
            }
        }
        Ok((data, mask))
    }

    /// Runs the pipeline backwards on `data`, skipping the filters recorded in
    /// `mask`.
    pub fn invert(&self, data: Vec<u8>, mask: u32) -> Result<Vec<u8>> {
        let mut data = data;
        for (i, f) in self.filters.iter().enumerate().rev() {
            if mask & 1 << i != 0 {
                continue;
            }
            match f.id {
                FILTER_SHUFFLE => {
                    let elem_size = f.client_data.first().copied().unwrap_or(1) as usize;
                    data = unshuffle(&data, elem_size);
                }
                FILTER_DEFLATE => {
                    let mut out = Vec::new();
                    ZlibDecoder::new(&data[..]).read_to_end(&mut out)?;
                    data = out;
                }
                FILTER_FLETCHER32 => {
                    if data.len() < 4 {
                        return Err(Error::format("chunk", 0, "4-byte checksum", "truncated chunk"));
                    }
                    let (payload, stored) = data.split_at(data.len() - 4);
                    let stored = u32::from_le_bytes(stored.try_into().unwrap());
                    let sum = crate::checksum::fletcher32(payload);
                    if sum != stored {
                        return Err(Error::format(
                            "chunk",
                            0,
                            format!("fletcher32 {stored:#010x}"),
                            format!("{sum:#010x}"),
                        ));
                    }
                    data.truncate(data.len() - 4);
                }
                id => return Err(Error::Unsupported(format!("filter id {id}"))),
            }
        }
        Ok(data)
    }
}

/// Compresses `data` with deflate at the given level.
fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(level));
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Transposes `data` so that the `i`th bytes of every element are contiguous.
///
/// Trailing bytes not filling a whole element are appended untouched.
fn shuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 {
        return data.to_vec();
    }
    let count = data.len() / elem_size;
    let mut out = Vec::with_capacity(data.len());
    for j in 0..elem_size {
        for i in 0..count {
            out.push(data[i * elem_size + j]);
        }
    }
    out.extend_from_slice(&data[count * elem_size..]);
    out
}

/// Inverse of [`shuffle`].
fn unshuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 {
        return data.to_vec();
    }
    let count = data.len() / elem_size;
    let mut out = vec![0; data.len()];
    for j in 0..elem_size {
        for i in 0..count {
            out[i * elem_size + j] = data[j * count + i];
        }
    }
    out[count * elem_size..].copy_from_slice(&data[count * elem_size..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_roundtrip() {
        let data: Vec<u8> = (0..=255).collect();
        for elem_size in [1, 2, 4, 8, 3] {
            let s = shuffle(&data, elem_size);
            assert_eq!(unshuffle(&s, elem_size), data);
        }
    }

    #[test]
    fn shuffle_groups_bytes() {
        // Two 4-byte elements: low bytes first, then second bytes, ...
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(shuffle(&data, 4), [1, 5, 2, 6, 3, 7, 4, 8]);
    }

    #[test]
    fn full_pipeline_roundtrip() {
        let pipeline = Pipeline::from_options(true, Some(9), true, 8).unwrap();
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i as u64).to_le_bytes()).collect();

        let (filtered, mask) = pipeline.apply(data.clone()).unwrap();
        assert_eq!(mask, 0);
        assert!(filtered.len() < data.len());
        assert_eq!(pipeline.invert(filtered, mask).unwrap(), data);
    }

    #[test]
    fn incompressible_chunk_skips_deflate() {
        let pipeline = Pipeline::from_options(false, Some(1), false, 1).unwrap();
        // Pseudo-random bytes compress poorly
        let data: Vec<u8> = (0u32..2048)
            .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
            .collect();

        let (filtered, mask) = pipeline.apply(data.clone()).unwrap();
        if mask & 1 != 0 {
            assert_eq!(filtered, data);
        }
        assert_eq!(pipeline.invert(filtered, mask).unwrap(), data);
    }

    #[test]
    fn fletcher_detects_corruption() {
        let pipeline = Pipeline::from_options(false, None, true, 1).unwrap();
        let data = vec![7u8; 256];

        let (mut filtered, mask) = pipeline.apply(data).unwrap();
        filtered[100] ^= 0x01;
        assert!(pipeline.invert(filtered, mask).is_err());
    }

    #[test]
    fn bad_gzip_level() {
        assert!(Pipeline::from_options(false, Some(0), false, 1).is_err());
        assert!(Pipeline::from_options(false, Some(10), false, 1).is_err());
    }
}
