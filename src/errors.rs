// Copyright 2026 The disk-paver Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Failure kinds shared by the table, volume and streaming layers.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaveError>;

#[derive(Debug, Error)]
pub enum PaveError {
    /// Image container is malformed or has the wrong magic/version.
    #[error("invalid image format: {0}")]
    Format(String),
    /// Slice size or block size disagrees with what is already on disk.
    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),
    /// Image stream ended inside its metadata.
    #[error("truncated input: {0}")]
    TruncatedInput(String),
    /// Image stream ended inside an extent's payload.
    #[error("unexpected end of input: {0}")]
    UnexpectedEof(String),
    /// A partition of the same type lives somewhere a pave can't replace it.
    #[error("conflicting partition: {0}; wipe the disk and retry")]
    ConflictingPartition(String),
    #[error("corrupt partition table: {0}")]
    CorruptTable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("partition overlaps an existing partition: {0}")]
    Overlap(String),
    #[error("partition table is full")]
    TableFull,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Find the typed failure kind in an error chain, if there is one.
pub fn pave_error(err: &anyhow::Error) -> Option<&PaveError> {
    err.chain().find_map(|e| e.downcast_ref::<PaveError>())
}
