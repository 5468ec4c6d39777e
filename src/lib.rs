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

//! Writer and reader for the HDF5 hierarchical file format.
//!
//! The crate produces files bit-compatible with the format specification:
//! superblock, object headers with typed messages, symbol-table groups over
//! local heaps and v1 B-trees, dense attribute and link storage over fractal
//! heaps and v2 B-trees, contiguous and chunked dataset layouts with a filter
//! pipeline, and a global heap for variable-length values. Existing files can
//! be reopened and modified in place.
//!
//! [`Hfive`] is the entry point; the structural layers live in their own
//! modules.

pub mod attribute;
pub mod btree1;
pub mod btree2;
pub mod checksum;
pub mod dataset;
pub mod datatype;
pub mod error;
pub mod file;
pub mod filter;
pub mod fractal_heap;
pub mod global_heap;
pub mod io;
pub mod link;
pub mod local_heap;
pub mod message;
pub mod object_header;
pub mod superblock;
pub mod symbol_table;

pub use dataset::CancelToken;
pub use dataset::ChunkIterator;
pub use dataset::ChunkRead;
pub use dataset::DatasetOptions;
pub use datatype::Datatype;
pub use error::Error;
pub use error::Result;
pub use file::CreateMode;
pub use file::FileOptions;
pub use file::Hfive;
pub use file::OpenMode;
pub use message::Attribute;
pub use message::Dataspace;
pub use message::UNLIMITED;
pub use superblock::SuperblockVersion;
