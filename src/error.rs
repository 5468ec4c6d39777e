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

//! Error types for every operation of the library.

use std::io;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error returned by an operation on a file.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value does not satisfy an operation's precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The named attribute, dataset, group or link does not resolve.
    #[error("not found: {0}")]
    NotFound(String),
    /// A name already exists in its scope.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// An intermediate group on a path does not exist.
    #[error("missing parent group: {0}")]
    ParentMissing(String),
    /// The requested feature is gated off.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A structure's signature, version or checksum does not match expectation.
    #[error("format violation in {structure} at offset {offset:#x}: expected {expected}, got {actual}")]
    FormatViolation {
        /// The name of the offending structure.
        structure: &'static str,
        /// The file offset of the structure.
        offset: u64,
        /// The expected value.
        expected: String,
        /// The value actually read.
        actual: String,
    },
    /// A link resolution revisited a path it already walked.
    ///
    /// This is a refinement of a format violation: the on-disk links form a
    /// cycle instead of a tree.
    #[error("link cycle while resolving `{0}`")]
    LinkCycle(String),
    /// An error from the underlying storage.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A derived size exceeds the width of the field storing it.
    #[error("overflow: {0}")]
    Overflow(String),
    /// A chunk iteration was cancelled by its caller.
    #[error("iteration cancelled")]
    Cancelled,
}

impl Error {
    /// Builds a format violation error.
    ///
    /// Arguments:
    /// - `structure` is the name of the offending structure.
    /// - `offset` is the file offset of the structure.
    /// - `expected` and `actual` describe the mismatch.
    pub fn format(
        structure: &'static str,
        offset: u64,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::FormatViolation {
            structure,
            offset,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
