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

//! Sparse volume image format.
//!
//! An image is a metadata block followed by payload.  The metadata block
//! starts with a `SparseHeader` and holds, for each partition, a partition
//! descriptor immediately followed by its extent descriptors.  The payload
//! holds each extent's real bytes in order; the rest of each extent's
//! slices is implicitly zero.  All integers are little-endian.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::io::Read;
use uuid::Uuid;

use crate::errors::{PaveError, Result};
use crate::io::{bincoder, read_full};

/// "FVM SPRS"
pub const SPARSE_MAGIC: u64 = 0x5352_5053_204d_5646;
pub const SPARSE_VERSION: u32 = 1;
pub const PARTITION_MAGIC: u64 = 0x0bde_4df7_cf5c_4c5d;
pub const EXTENT_MAGIC: u64 = 0xa5b8_7429_06e8_382e;

pub const HEADER_SIZE: usize = 32;
pub const PARTITION_DESCRIPTOR_SIZE: usize = 56;
pub const EXTENT_DESCRIPTOR_SIZE: usize = 32;
pub const NAME_LEN: usize = 24;
/// Upper bound on the metadata block we're willing to buffer.
pub const MAX_METADATA_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseHeader {
    pub magic: u64,
    pub version: u32,
    /// Length of the whole metadata block, including this header.
    pub header_length: u32,
    pub slice_size: u64,
    pub partition_count: u32,
    pub flags: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionDescriptorRaw {
    magic: u64,
    type_guid: [u8; 16],
    name: [u8; NAME_LEN],
    flags: u32,
    extent_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExtentDescriptorRaw {
    magic: u64,
    slice_start: u64,
    slice_count: u64,
    extent_length: u64,
}

/// A run of slices in a volume, of which the first `length` bytes come
/// from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub slice_start: u64,
    pub slice_count: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub type_guid: Uuid,
    pub name: String,
    pub flags: u32,
    pub extents: Vec<Extent>,
}

impl PartitionDescriptor {
    /// Slices allocated across all extents.
    pub fn slice_count(&self) -> u64 {
        self.extents.iter().map(|e| e.slice_count).sum()
    }

    /// Payload bytes this partition occupies in the image.
    pub fn payload_length(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }
}

impl SparseHeader {
    /// Read and check the fixed header.  Nothing beyond the header is
    /// consumed.
    pub fn read_from(reader: &mut (impl Read + ?Sized)) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        let len = read_full(reader, &mut buf)?;
        if len < HEADER_SIZE {
            return Err(PaveError::TruncatedInput(format!(
                "image header is {} bytes, expected {}",
                len, HEADER_SIZE
            )));
        }
        Self::parse(&buf)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header: SparseHeader = decode(buf, "image header")?;
        if header.magic != SPARSE_MAGIC {
            return Err(PaveError::Format(format!(
                "bad image magic {:#018x}",
                header.magic
            )));
        }
        if header.version != SPARSE_VERSION {
            return Err(PaveError::Format(format!(
                "unsupported image version {}",
                header.version
            )));
        }
        if header.flags != 0 {
            return Err(PaveError::Format(format!(
                "unsupported image flags {:#x}",
                header.flags
            )));
        }
        if (header.header_length as usize) < HEADER_SIZE
            || header.header_length > MAX_METADATA_SIZE
        {
            return Err(PaveError::Format(format!(
                "implausible metadata length {}",
                header.header_length
            )));
        }
        if header.slice_size == 0 {
            return Err(PaveError::Format("slice size is zero".into()));
        }
        Ok(header)
    }

    /// Read the rest of the metadata block and parse every descriptor.
    pub fn read_partitions(
        &self,
        reader: &mut (impl Read + ?Sized),
    ) -> Result<Vec<PartitionDescriptor>> {
        let mut metadata = vec![0u8; self.header_length as usize - HEADER_SIZE];
        let len = read_full(reader, &mut metadata)?;
        if len < metadata.len() {
            return Err(PaveError::TruncatedInput(format!(
                "image ended after {} of {} metadata bytes",
                len + HEADER_SIZE,
                self.header_length
            )));
        }
        self.parse_partitions(&metadata)
    }

    /// Parse and validate the descriptors in `metadata`, the part of the
    /// metadata block after the header.
    pub fn parse_partitions(&self, metadata: &[u8]) -> Result<Vec<PartitionDescriptor>> {
        let mut partitions = Vec::with_capacity(self.partition_count.min(1024) as usize);
        let mut pos = 0;
        for p in 0..self.partition_count {
            let raw: PartitionDescriptorRaw = decode(
                take(metadata, &mut pos, PARTITION_DESCRIPTOR_SIZE, "partition descriptor")?,
                "partition descriptor",
            )?;
            if raw.magic != PARTITION_MAGIC {
                return Err(PaveError::Format(format!(
                    "bad magic in partition descriptor {}",
                    p
                )));
            }
            let name_len = raw.name.iter().position(|c| *c == 0).unwrap_or(NAME_LEN);
            let name = String::from_utf8_lossy(&raw.name[..name_len]).into_owned();
            if raw.extent_count == 0 {
                return Err(PaveError::Format(format!("partition {} has no extents", name)));
            }

            let mut extents = Vec::new();
            for e in 0..raw.extent_count {
                let raw: ExtentDescriptorRaw = decode(
                    take(metadata, &mut pos, EXTENT_DESCRIPTOR_SIZE, "extent descriptor")?,
                    "extent descriptor",
                )?;
                if raw.magic != EXTENT_MAGIC {
                    return Err(PaveError::Format(format!(
                        "bad magic in extent {} of partition {}",
                        e, name
                    )));
                }
                extents.push(Extent {
                    slice_start: raw.slice_start,
                    slice_count: raw.slice_count,
                    length: raw.extent_length,
                });
            }
            validate_extents(&name, &extents, self.slice_size)?;
            partitions.push(PartitionDescriptor {
                type_guid: Uuid::from_bytes_le(raw.type_guid),
                name,
                flags: raw.flags,
                extents,
            });
        }
        Ok(partitions)
    }
}

/// First extent starts at slice 0; every extent has slices and its payload
/// fits within them.
pub fn validate_extents(name: &str, extents: &[Extent], slice_size: u64) -> Result<()> {
    match extents.first() {
        Some(first) if first.slice_start == 0 => (),
        Some(_) => {
            return Err(PaveError::Format(format!(
                "first extent of partition {} doesn't start at slice zero",
                name
            )))
        }
        None => return Err(PaveError::Format(format!("partition {} has no extents", name))),
    }
    for (i, extent) in extents.iter().enumerate() {
        if extent.slice_count == 0 {
            return Err(PaveError::Format(format!(
                "extent {} of partition {} has no slices",
                i, name
            )));
        }
        let capacity = extent.slice_count.checked_mul(slice_size).ok_or_else(|| {
            PaveError::Format(format!("extent {} of partition {} is too large", i, name))
        })?;
        if extent.length > capacity {
            return Err(PaveError::Format(format!(
                "extent {} of partition {} holds {} bytes in {} bytes of slices",
                i, name, extent.length, capacity
            )));
        }
        // the byte offset of the extent's end must be addressable
        if extent
            .slice_start
            .checked_add(extent.slice_count)
            .and_then(|end| end.checked_mul(slice_size))
            .is_none()
        {
            return Err(PaveError::Format(format!(
                "extent {} of partition {} overflows the slice space",
                i, name
            )));
        }
    }
    Ok(())
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize, what: &str) -> Result<&'a [u8]> {
    let slice = buf.get(*pos..*pos + len).ok_or_else(|| {
        PaveError::Format(format!("{} at metadata offset {} is truncated", what, *pos))
    })?;
    *pos += len;
    Ok(slice)
}

fn decode<'de, T: Deserialize<'de>>(buf: &'de [u8], what: &str) -> Result<T> {
    bincoder()
        .deserialize(buf)
        .map_err(|e| PaveError::Format(format!("decoding {}: {}", what, e)))
}

/// Assembles sparse images.
#[derive(Debug)]
pub struct SparseImageBuilder {
    slice_size: u64,
    partitions: Vec<(PartitionDescriptor, Vec<u8>)>,
}

impl SparseImageBuilder {
    pub fn new(slice_size: u64) -> Self {
        Self {
            slice_size,
            partitions: Vec::new(),
        }
    }

    /// Add a partition.  Each extent is `(slice_start, slice_count,
    /// payload)`.
    pub fn partition(mut self, type_guid: Uuid, name: &str, extents: &[(u64, u64, &[u8])]) -> Self {
        let mut payload = Vec::new();
        let extents = extents
            .iter()
            .map(|(slice_start, slice_count, data)| {
                payload.extend_from_slice(data);
                Extent {
                    slice_start: *slice_start,
                    slice_count: *slice_count,
                    length: data.len() as u64,
                }
            })
            .collect();
        self.partitions.push((
            PartitionDescriptor {
                type_guid,
                name: name.into(),
                flags: 0,
                extents,
            },
            payload,
        ));
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let descriptors_len: usize = self
            .partitions
            .iter()
            .map(|(p, _)| PARTITION_DESCRIPTOR_SIZE + p.extents.len() * EXTENT_DESCRIPTOR_SIZE)
            .sum();
        let header = SparseHeader {
            magic: SPARSE_MAGIC,
            version: SPARSE_VERSION,
            header_length: (HEADER_SIZE + descriptors_len) as u32,
            slice_size: self.slice_size,
            partition_count: self.partitions.len() as u32,
            flags: 0,
        };
        let mut out = encode(&header)?;
        for (p, _) in &self.partitions {
            if p.name.len() > NAME_LEN {
                return Err(PaveError::InvalidArgs(format!(
                    "partition name {} is too long",
                    p.name
                )));
            }
            let mut name = [0u8; NAME_LEN];
            name[..p.name.len()].copy_from_slice(p.name.as_bytes());
            out.extend(encode(&PartitionDescriptorRaw {
                magic: PARTITION_MAGIC,
                type_guid: p.type_guid.to_bytes_le(),
                name,
                flags: p.flags,
                extent_count: p.extents.len() as u32,
            })?);
            for e in &p.extents {
                out.extend(encode(&ExtentDescriptorRaw {
                    magic: EXTENT_MAGIC,
                    slice_start: e.slice_start,
                    slice_count: e.slice_count,
                    extent_length: e.length,
                })?);
            }
        }
        for (_, payload) in &self.partitions {
            out.extend_from_slice(payload);
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincoder()
        .serialize(value)
        .map_err(|e| PaveError::InvalidArgs(format!("encoding image metadata: {}", e)))
}
