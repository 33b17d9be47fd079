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

//! Volume manager living inside a single GPT partition.
//!
//! The partition starts with two copies of the metadata, each made of an
//! 8 KiB header block, the volume table and the slice table, every section
//! padded to 8 KiB.  Physical slices follow the second copy.  Updates go to
//! the copy not currently in use, with the generation bumped, so a torn
//! write leaves the previous state readable.

use bincode::Options;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use uuid::Uuid;

use crate::blockdev::{BlockDevice, BlockInfo};
use crate::errors::{PaveError, Result};
use crate::io::bincoder;

mod unpack;
pub use self::unpack::*;

/// "FVM PART"
pub const FVM_MAGIC: u64 = 0x5452_4150_204d_5646;
pub const FVM_VERSION: u64 = 1;
/// Granularity of every metadata section.
pub const FVM_BLOCK_SIZE: u64 = 8192;
pub const MAX_VOLUMES: usize = 64;
pub const VOLUME_ENTRY_SIZE: usize = 64;
pub const VOLUME_NAME_LEN: usize = 24;

const HEADER_SIZE: usize = 72;
const CHECKSUM_OFFSET: usize = 64;
const SLICE_ENTRY_SIZE: u64 = 8;
/// Read size when searching for the second metadata copy.
const SCAN_CHUNK: u64 = 1024 * 1024;
const INDEX_MASK: u64 = 0xffff;
const VSLICE_SHIFT: u32 = 16;
/// Virtual slice numbers have 48 bits.
pub const MAX_VSLICE: u64 = 1 << 48;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VolumeFlags: u32 {
        /// Allocated but not yet activated; discarded on the next bind.
        const INACTIVE = 0x1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeManagerInfo {
    pub slice_size: u64,
    pub pslice_count: u64,
    pub allocated_slices: u64,
}

/// A new volume.  It initially covers virtual slices `0..slice_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub type_guid: Uuid,
    pub instance_guid: Uuid,
    pub name: String,
    pub slice_count: u64,
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub index: u16,
    pub type_guid: Uuid,
    pub instance_guid: Uuid,
    pub name: String,
    pub slices: u64,
    pub flags: VolumeFlags,
}

impl VolumeEntry {
    pub fn is_active(&self) -> bool {
        !self.flags.contains(VolumeFlags::INACTIVE)
    }
}

/// Operations on a bound volume manager.
pub trait VolumeManager {
    fn info(&self) -> VolumeManagerInfo;

    fn topological_path(&self) -> String;

    fn partitions(&self) -> Vec<VolumeEntry>;

    fn allocate_partition(&mut self, request: &AllocRequest) -> Result<VolumeEntry>;

    /// Map `slice_count` more virtual slices starting at `slice_start`.
    fn extend_partition(&mut self, instance: Uuid, slice_start: u64, slice_count: u64)
        -> Result<()>;

    fn open_partition(&self, instance: Uuid) -> Result<Box<dyn BlockDevice + '_>>;

    /// Activate `new` and deactivate `old` in one metadata update.
    fn upgrade(&mut self, old: Option<Uuid>, new: Uuid) -> Result<()>;

    fn destroy_partition(&mut self, instance: Uuid) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FvmHeader {
    magic: u64,
    version: u64,
    pslice_count: u64,
    slice_size: u64,
    fvm_partition_size: u64,
    volume_table_size: u64,
    slice_table_size: u64,
    generation: u64,
    checksum: u32,
    reserved: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VolumeEntryRaw {
    type_guid: [u8; 16],
    instance_guid: [u8; 16],
    slices: u32,
    flags: u32,
    name: [u8; VOLUME_NAME_LEN],
}

fn round_up(value: u64, to: u64) -> u64 {
    (value + to - 1) / to * to
}

fn slice_table_size(pslice_count: u64) -> u64 {
    round_up((pslice_count + 1) * SLICE_ENTRY_SIZE, FVM_BLOCK_SIZE)
}

fn volume_table_size() -> u64 {
    round_up((MAX_VOLUMES * VOLUME_ENTRY_SIZE) as u64, FVM_BLOCK_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    slice_size: u64,
    pslice_count: u64,
    partition_size: u64,
}

impl Geometry {
    /// Fit as many slices as possible into `partition_size` bytes.
    fn new(partition_size: u64, slice_size: u64, block_size: u32) -> Result<Self> {
        let bs = block_size as u64;
        if slice_size == 0 || slice_size % bs != 0 {
            return Err(PaveError::GeometryMismatch(format!(
                "slice size {} isn't a multiple of block size {}",
                slice_size, bs
            )));
        }
        if FVM_BLOCK_SIZE % bs != 0 {
            return Err(PaveError::GeometryMismatch(format!(
                "block size {} doesn't divide the metadata block size",
                bs
            )));
        }
        // each slice costs one entry in both slice tables
        let fixed = 2 * (FVM_BLOCK_SIZE + volume_table_size());
        let mut pslice_count = partition_size.saturating_sub(fixed) / (slice_size + 2 * SLICE_ENTRY_SIZE);
        let geometry = |pslice_count| Self {
            slice_size,
            pslice_count,
            partition_size,
        };
        while pslice_count > 0 && geometry(pslice_count).end() > partition_size {
            pslice_count -= 1;
        }
        if pslice_count == 0 {
            return Err(PaveError::InvalidArgs(format!(
                "{} bytes is too small for a volume manager with {}-byte slices",
                partition_size, slice_size
            )));
        }
        Ok(geometry(pslice_count))
    }

    fn from_header(header: &FvmHeader, device_size: u64) -> Result<Self> {
        let geometry = Self {
            slice_size: header.slice_size,
            pslice_count: header.pslice_count,
            partition_size: header.fvm_partition_size,
        };
        if header.slice_size == 0
            || header.pslice_count == 0
            || header.pslice_count > device_size / header.slice_size
            || header.volume_table_size != volume_table_size()
            || header.slice_table_size != slice_table_size(header.pslice_count)
        {
            return Err(PaveError::CorruptTable(
                "volume manager header has inconsistent table sizes".into(),
            ));
        }
        if geometry.end() > header.fvm_partition_size || header.fvm_partition_size > device_size {
            return Err(PaveError::CorruptTable(format!(
                "volume manager of {} bytes doesn't fit in {} bytes",
                header.fvm_partition_size, device_size
            )));
        }
        Ok(geometry)
    }

    fn metadata_size(&self) -> u64 {
        FVM_BLOCK_SIZE + volume_table_size() + slice_table_size(self.pslice_count)
    }

    fn copy_offset(&self, copy: usize) -> u64 {
        copy as u64 * self.metadata_size()
    }

    /// Byte offset of physical slice `pslice`, counted from 1.
    fn slice_offset(&self, pslice: u64) -> u64 {
        2 * self.metadata_size() + (pslice - 1) * self.slice_size
    }

    fn end(&self) -> u64 {
        2 * self.metadata_size() + self.pslice_count * self.slice_size
    }
}

#[derive(Debug, Clone)]
struct Metadata {
    geometry: Geometry,
    generation: u64,
    /// Indexed by volume number; entry 0 is never used.
    volumes: Vec<Option<VolumeEntry>>,
    /// Indexed by physical slice; entry 0 is never used.
    slices: Vec<u64>,
}

impl Metadata {
    fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            generation: 0,
            volumes: vec![None; MAX_VOLUMES],
            slices: vec![0; geometry.pslice_count as usize + 1],
        }
    }

    fn read<D: BlockDevice + ?Sized>(dev: &D, offset: u64, geometry: Geometry) -> Result<Self> {
        let mut buf = vec![0u8; geometry.metadata_size() as usize];
        dev.read_at(offset, &mut buf)?;
        let header: FvmHeader = decode(&buf[..HEADER_SIZE])?;
        if header.magic != FVM_MAGIC
            || header.slice_size != geometry.slice_size
            || header.pslice_count != geometry.pslice_count
        {
            return Err(PaveError::CorruptTable(format!(
                "volume manager metadata at {} doesn't match its twin",
                offset
            )));
        }
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        let checksum = crc32fast::hash(&buf);
        if checksum != header.checksum {
            return Err(PaveError::CorruptTable(format!(
                "volume manager metadata at {} has bad checksum {:#x}, expected {:#x}",
                offset, header.checksum, checksum
            )));
        }

        let mut metadata = Self::new(geometry);
        metadata.generation = header.generation;
        let table = FVM_BLOCK_SIZE as usize;
        for index in 1..MAX_VOLUMES {
            let off = table + index * VOLUME_ENTRY_SIZE;
            let raw: VolumeEntryRaw = decode(&buf[off..off + VOLUME_ENTRY_SIZE])?;
            if raw.type_guid == [0; 16] {
                continue;
            }
            let name_len = raw.name.iter().position(|c| *c == 0).unwrap_or(VOLUME_NAME_LEN);
            metadata.volumes[index] = Some(VolumeEntry {
                index: index as u16,
                type_guid: Uuid::from_bytes_le(raw.type_guid),
                instance_guid: Uuid::from_bytes_le(raw.instance_guid),
                name: String::from_utf8_lossy(&raw.name[..name_len]).into_owned(),
                slices: raw.slices as u64,
                flags: VolumeFlags::from_bits_truncate(raw.flags),
            });
        }
        let table = table + volume_table_size() as usize;
        for (pslice, entry) in buf[table..]
            .chunks_exact(SLICE_ENTRY_SIZE as usize)
            .take(metadata.slices.len())
            .enumerate()
            .skip(1)
        {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(entry);
            let value = u64::from_le_bytes(bytes);
            let index = (value & INDEX_MASK) as usize;
            if value != 0 && metadata.volumes.get(index).map_or(true, Option::is_none) {
                return Err(PaveError::CorruptTable(format!(
                    "slice {} belongs to missing volume {}",
                    pslice, index
                )));
            }
            metadata.slices[pslice] = value;
        }
        Ok(metadata)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let geometry = &self.geometry;
        let mut buf = vec![0u8; geometry.metadata_size() as usize];
        let table = FVM_BLOCK_SIZE as usize;
        for volume in self.volumes.iter().flatten() {
            let mut name = [0u8; VOLUME_NAME_LEN];
            name[..volume.name.len()].copy_from_slice(volume.name.as_bytes());
            let raw = VolumeEntryRaw {
                type_guid: volume.type_guid.to_bytes_le(),
                instance_guid: volume.instance_guid.to_bytes_le(),
                slices: u32::try_from(volume.slices).map_err(|_| {
                    PaveError::InvalidArgs(format!(
                        "volume {} has too many slices: {}",
                        volume.name, volume.slices
                    ))
                })?,
                flags: volume.flags.bits(),
                name,
            };
            let off = table + volume.index as usize * VOLUME_ENTRY_SIZE;
            buf[off..off + VOLUME_ENTRY_SIZE].copy_from_slice(&encode(&raw)?);
        }
        let table = table + volume_table_size() as usize;
        for (pslice, value) in self.slices.iter().enumerate().skip(1) {
            let off = table + pslice * SLICE_ENTRY_SIZE as usize;
            buf[off..off + SLICE_ENTRY_SIZE as usize].copy_from_slice(&value.to_le_bytes());
        }

        let mut header = FvmHeader {
            magic: FVM_MAGIC,
            version: FVM_VERSION,
            pslice_count: geometry.pslice_count,
            slice_size: geometry.slice_size,
            fvm_partition_size: geometry.partition_size,
            volume_table_size: volume_table_size(),
            slice_table_size: slice_table_size(geometry.pslice_count),
            generation: self.generation,
            checksum: 0,
            reserved: 0,
        };
        buf[..HEADER_SIZE].copy_from_slice(&encode(&header)?);
        header.checksum = crc32fast::hash(&buf);
        buf[..HEADER_SIZE].copy_from_slice(&encode(&header)?);
        Ok(buf)
    }

    fn find(&self, instance: Uuid) -> Result<&VolumeEntry> {
        self.volumes
            .iter()
            .flatten()
            .find(|v| v.instance_guid == instance)
            .ok_or_else(|| PaveError::NotFound(format!("volume {}", instance)))
    }

    fn find_mut(&mut self, instance: Uuid) -> Result<&mut VolumeEntry> {
        self.volumes
            .iter_mut()
            .flatten()
            .find(|v| v.instance_guid == instance)
            .ok_or_else(|| PaveError::NotFound(format!("volume {}", instance)))
    }

    fn allocated_slices(&self) -> u64 {
        self.slices.iter().skip(1).filter(|s| **s != 0).count() as u64
    }

    /// Virtual to physical slice map of one volume.
    fn mapping(&self, index: u16) -> BTreeMap<u64, u64> {
        self.slices
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, s)| **s != 0 && (**s & INDEX_MASK) as u16 == index)
            .map(|(pslice, s)| (*s >> VSLICE_SHIFT, pslice as u64))
            .collect()
    }

    fn map_slices(&mut self, index: u16, vslice: u64, count: u64) -> Result<()> {
        match vslice.checked_add(count) {
            Some(end) if end <= MAX_VSLICE => (),
            _ => {
                return Err(PaveError::InvalidArgs(format!(
                    "virtual slices {}+{} out of range",
                    vslice, count
                )))
            }
        }
        if let Some((v, _)) = self
            .mapping(index)
            .range(vslice..vslice + count)
            .next()
        {
            return Err(PaveError::Overlap(format!(
                "virtual slice {} of volume {} is already mapped",
                v, index
            )));
        }
        let free: Vec<usize> = self
            .slices
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, s)| **s == 0)
            .map(|(pslice, _)| pslice)
            .take(count as usize)
            .collect();
        if (free.len() as u64) < count {
            return Err(PaveError::NotFound(format!(
                "volume manager has {} free slices, need {}",
                self.geometry.pslice_count - self.allocated_slices(),
                count
            )));
        }
        for (i, pslice) in free.into_iter().enumerate() {
            self.slices[pslice] = index as u64 | ((vslice + i as u64) << VSLICE_SHIFT);
        }
        if let Some(volume) = self.volumes[index as usize].as_mut() {
            volume.slices += count;
        }
        Ok(())
    }

    fn remove(&mut self, index: u16) {
        for slice in self.slices.iter_mut().skip(1) {
            if *slice != 0 && (*slice & INDEX_MASK) as u16 == index {
                *slice = 0;
            }
        }
        self.volumes[index as usize] = None;
    }
}

fn decode<'de, T: Deserialize<'de>>(buf: &'de [u8]) -> Result<T> {
    bincoder()
        .deserialize(buf)
        .map_err(|e| PaveError::CorruptTable(format!("decoding volume manager metadata: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincoder()
        .serialize(value)
        .map_err(|e| PaveError::InvalidArgs(format!("encoding volume manager metadata: {}", e)))
}

/// Read the header at `offset` and the geometry it describes.
fn read_geometry<D: BlockDevice + ?Sized>(
    dev: &D,
    offset: u64,
    device_size: u64,
) -> Result<Geometry> {
    let mut buf = [0u8; HEADER_SIZE];
    dev.read_at(offset, &mut buf)?;
    let header: FvmHeader = decode(&buf)?;
    if header.magic != FVM_MAGIC {
        return Err(PaveError::NotFound(format!(
            "no volume manager header at {}",
            offset
        )));
    }
    if header.version != FVM_VERSION {
        return Err(PaveError::Format(format!(
            "unsupported volume manager version {}",
            header.version
        )));
    }
    Geometry::from_header(&header, device_size)
}

/// Look for the second metadata copy.  It starts at the metadata size, a
/// multiple of the metadata block size no larger than the metadata for
/// block-sized slices would need.
fn find_second_copy<D: BlockDevice + ?Sized>(
    dev: &D,
    info: &BlockInfo,
) -> Result<Option<Geometry>> {
    let size = info.size_bytes();
    let limit = (FVM_BLOCK_SIZE
        + volume_table_size()
        + slice_table_size(size / info.block_size as u64))
    .min(size / 2);
    let magic = FVM_MAGIC.to_le_bytes();
    let mut buf = vec![0u8; SCAN_CHUNK as usize];
    let mut start = FVM_BLOCK_SIZE + volume_table_size() + FVM_BLOCK_SIZE;
    while start <= limit {
        let len = SCAN_CHUNK.min(size - start);
        let chunk = &mut buf[..len as usize];
        dev.read_at(start, chunk)?;
        for pos in (0..len).step_by(FVM_BLOCK_SIZE as usize) {
            let offset = start + pos;
            let pos = pos as usize;
            if offset > limit || pos + magic.len() > chunk.len() {
                break;
            }
            if chunk[pos..pos + magic.len()] != magic {
                continue;
            }
            if let Ok(geometry) = read_geometry(dev, offset, size) {
                if geometry.copy_offset(1) == offset
                    && Metadata::read(dev, offset, geometry).is_ok()
                {
                    return Ok(Some(geometry));
                }
            }
        }
        start += SCAN_CHUNK;
    }
    Ok(None)
}

/// A volume manager on top of `D`, usually a GPT partition.
#[derive(Debug)]
pub struct Fvm<D> {
    dev: D,
    block_size: u32,
    metadata: Metadata,
    /// Copy holding `metadata`.
    active: usize,
}

impl<D: BlockDevice> Fvm<D> {
    /// Whether `dev` holds volume manager metadata in either copy.
    pub fn detect(dev: &D) -> Result<bool> {
        let mut buf = [0u8; 8];
        dev.read_at(0, &mut buf)?;
        if u64::from_le_bytes(buf) == FVM_MAGIC {
            return Ok(true);
        }
        Ok(find_second_copy(dev, &dev.info()?)?.is_some())
    }

    /// Write empty metadata covering all of `dev`.
    pub fn format(dev: D, slice_size: u64) -> Result<Self> {
        let info = dev.info()?;
        let geometry = Geometry::new(info.size_bytes(), slice_size, info.block_size)?;
        let metadata = Metadata::new(geometry);
        let buf = metadata.encode()?;
        dev.write_at(geometry.copy_offset(1), &buf)?;
        dev.write_at(geometry.copy_offset(0), &buf)?;
        dev.flush()?;
        Ok(Self {
            dev,
            block_size: info.block_size,
            metadata,
            active: 0,
        })
    }

    /// Load the newest valid metadata without writing anything.  If the
    /// first header is unreadable the geometry comes from the second copy.
    pub fn open(dev: D) -> Result<Self> {
        let info = dev.info()?;
        let geometry = match read_geometry(&dev, 0, info.size_bytes()) {
            Ok(geometry) => geometry,
            Err(e) => match find_second_copy(&dev, &info)? {
                Some(geometry) => geometry,
                None if matches!(e, PaveError::NotFound(_)) => {
                    return Err(PaveError::NotFound(format!(
                        "no volume manager on {}",
                        dev.topological_path()
                    )));
                }
                None => return Err(e),
            },
        };
        if geometry.slice_size % info.block_size as u64 != 0 {
            return Err(PaveError::GeometryMismatch(format!(
                "slice size {} isn't a multiple of block size {}",
                geometry.slice_size, info.block_size
            )));
        }

        let copies = [
            Metadata::read(&dev, geometry.copy_offset(0), geometry),
            Metadata::read(&dev, geometry.copy_offset(1), geometry),
        ];
        let (active, metadata) = match copies {
            [Ok(a), Ok(b)] if b.generation > a.generation => (1, b),
            [Ok(a), _] => (0, a),
            [Err(_), Ok(b)] => (1, b),
            [Err(e), Err(_)] => return Err(e),
        };
        Ok(Self {
            dev,
            block_size: info.block_size,
            metadata,
            active,
        })
    }

    /// Open for paving: inactive volumes left by an interrupted pave are
    /// destroyed.
    pub fn bind(dev: D) -> Result<Self> {
        let mut fvm = Self::open(dev)?;
        let stale: Vec<VolumeEntry> = fvm
            .partitions()
            .into_iter()
            .filter(|v| !v.is_active())
            .collect();
        if !stale.is_empty() {
            for volume in &stale {
                eprintln!("Discarding inactive volume {}", volume.name);
            }
            fvm.update(|m| {
                for volume in &stale {
                    m.remove(volume.index);
                }
                Ok(())
            })?;
        }
        Ok(fvm)
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn generation(&self) -> u64 {
        self.metadata.generation
    }

    /// Apply `f` to a copy of the metadata, write it to the inactive
    /// copy and adopt it.  On failure nothing changes in memory.
    fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Metadata) -> Result<()>,
    {
        let mut metadata = self.metadata.clone();
        f(&mut metadata)?;
        metadata.generation += 1;
        let target = 1 - self.active;
        let buf = metadata.encode()?;
        self.dev
            .write_at(metadata.geometry.copy_offset(target), &buf)?;
        self.dev.flush()?;
        self.metadata = metadata;
        self.active = target;
        Ok(())
    }
}

impl<D: BlockDevice> VolumeManager for Fvm<D> {
    fn info(&self) -> VolumeManagerInfo {
        VolumeManagerInfo {
            slice_size: self.metadata.geometry.slice_size,
            pslice_count: self.metadata.geometry.pslice_count,
            allocated_slices: self.metadata.allocated_slices(),
        }
    }

    fn topological_path(&self) -> String {
        format!("{}/fvm", self.dev.topological_path())
    }

    fn partitions(&self) -> Vec<VolumeEntry> {
        self.metadata.volumes.iter().flatten().cloned().collect()
    }

    fn allocate_partition(&mut self, request: &AllocRequest) -> Result<VolumeEntry> {
        if request.type_guid.is_nil() || request.instance_guid.is_nil() {
            return Err(PaveError::InvalidArgs("volume GUIDs must not be nil".into()));
        }
        if request.name.len() > VOLUME_NAME_LEN {
            return Err(PaveError::InvalidArgs(format!(
                "volume name {} is longer than {} bytes",
                request.name, VOLUME_NAME_LEN
            )));
        }
        if request.slice_count == 0 {
            return Err(PaveError::InvalidArgs(format!(
                "volume {} needs at least one slice",
                request.name
            )));
        }
        if self.metadata.find(request.instance_guid).is_ok() {
            return Err(PaveError::InvalidArgs(format!(
                "volume {} already exists",
                request.instance_guid
            )));
        }
        let index = self
            .metadata
            .volumes
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, v)| v.is_none())
            .map(|(i, _)| i as u16)
            .ok_or(PaveError::TableFull)?;
        let mut flags = VolumeFlags::empty();
        flags.set(VolumeFlags::INACTIVE, request.inactive);
        let entry = VolumeEntry {
            index,
            type_guid: request.type_guid,
            instance_guid: request.instance_guid,
            name: request.name.clone(),
            slices: 0,
            flags,
        };
        self.update(|m| {
            m.volumes[index as usize] = Some(entry);
            m.map_slices(index, 0, request.slice_count)
        })?;
        self.metadata.volumes[index as usize]
            .clone()
            .ok_or_else(|| PaveError::NotFound(format!("volume {}", request.instance_guid)))
    }

    fn extend_partition(
        &mut self,
        instance: Uuid,
        slice_start: u64,
        slice_count: u64,
    ) -> Result<()> {
        if slice_count == 0 {
            return Err(PaveError::InvalidArgs("extending by zero slices".into()));
        }
        let index = self.metadata.find(instance)?.index;
        self.update(|m| m.map_slices(index, slice_start, slice_count))
    }

    fn open_partition(&self, instance: Uuid) -> Result<Box<dyn BlockDevice + '_>> {
        let volume = self.metadata.find(instance)?;
        Ok(Box::new(Volume {
            dev: &self.dev,
            geometry: self.metadata.geometry,
            block_size: self.block_size,
            mapping: self.metadata.mapping(volume.index),
            path: format!(
                "{}/{}-p-{}",
                self.topological_path(),
                volume.name,
                volume.index
            ),
        }))
    }

    fn upgrade(&mut self, old: Option<Uuid>, new: Uuid) -> Result<()> {
        self.update(|m| {
            if let Some(old) = old.filter(|old| *old != new) {
                m.find_mut(old)?.flags.insert(VolumeFlags::INACTIVE);
            }
            m.find_mut(new)?.flags.remove(VolumeFlags::INACTIVE);
            Ok(())
        })
    }

    fn destroy_partition(&mut self, instance: Uuid) -> Result<()> {
        let index = self.metadata.find(instance)?.index;
        self.update(|m| {
            m.remove(index);
            Ok(())
        })
    }
}

/// One volume, addressed by virtual offset.  Unmapped slices read as
/// zeroes and reject writes.
#[derive(Debug)]
struct Volume<'a, D> {
    dev: &'a D,
    geometry: Geometry,
    block_size: u32,
    mapping: BTreeMap<u64, u64>,
    path: String,
}

impl<D: BlockDevice> Volume<'_, D> {
    /// Split `offset..offset+len` at slice boundaries into (device
    /// offset or None if unmapped, position in buffer, length).
    fn segments(&self, offset: u64, len: usize) -> io::Result<Vec<(Option<u64>, usize, usize)>> {
        let slice_size = self.geometry.slice_size;
        let mut segments = Vec::new();
        let mut done = 0;
        while done < len {
            let pos = offset
                .checked_add(done as u64)
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "offset overflow"))?;
            let vslice = pos / slice_size;
            if vslice >= MAX_VSLICE {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("access beyond end of {}", self.path),
                ));
            }
            let within = pos % slice_size;
            let n = (len - done).min((slice_size - within) as usize);
            let target = self
                .mapping
                .get(&vslice)
                .map(|pslice| self.geometry.slice_offset(*pslice) + within);
            segments.push((target, done, n));
            done += n;
        }
        Ok(segments)
    }
}

impl<D: BlockDevice> BlockDevice for Volume<'_, D> {
    fn info(&self) -> io::Result<BlockInfo> {
        let vslices = self.mapping.keys().next_back().map_or(0, |v| v + 1);
        let bytes = vslices
            .checked_mul(self.geometry.slice_size)
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidData,
                    format!("{} is larger than the address space", self.path),
                )
            })?;
        Ok(BlockInfo {
            block_size: self.block_size,
            block_count: bytes / self.block_size as u64,
            removable: self.dev.info()?.removable,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        for (target, pos, n) in self.segments(offset, buf.len())? {
            match target {
                Some(off) => self.dev.read_at(off, &mut buf[pos..pos + n])?,
                None => buf[pos..pos + n].fill(0),
            }
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let segments = self.segments(offset, buf.len())?;
        if let Some((_, pos, _)) = segments.iter().find(|(t, _, _)| t.is_none()) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "write to unallocated slice {} of {}",
                    (offset + *pos as u64) / self.geometry.slice_size,
                    self.path
                ),
            ));
        }
        for (target, pos, n) in segments {
            if let Some(off) = target {
                self.dev.write_at(off, &buf[pos..pos + n])?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.dev.flush()
    }

    fn topological_path(&self) -> String {
        self.path.clone()
    }
}
