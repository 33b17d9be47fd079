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

//! In-memory model of a GUID Partition Table, with a shadow copy of the
//! last table written so callers can ask what changed.

use bincode::Options;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use std::fmt;
use uuid::Uuid;

use crate::blockdev::BlockDevice;
use crate::errors::{PaveError, Result};
use crate::io::bincoder;

mod alloc;
pub mod cros;

pub use self::alloc::*;

pub const GPT_ENTRY_COUNT: usize = 128;
pub const GPT_ENTRY_SIZE: usize = 128;
/// UTF-16 code units in a partition name.
pub const GPT_NAME_LEN: usize = 36;
/// Bytes reserved for the entry array at each end of the disk.
pub const GPT_ENTRY_ARRAY_SIZE: u64 = (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as u64;

const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 92;

pub const GUID_EFI: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
pub const GUID_FVM: Uuid = Uuid::from_u128(0x41D0E340_57E3_954E_8C1E_17ECAC44CFF5);
pub const GUID_SYSTEM: Uuid = Uuid::from_u128(0x606B000B_B7C7_4653_A7D5_B737332C899D);
pub const GUID_DATA: Uuid = Uuid::from_u128(0x08185F0C_892D_428A_A789_DBEEC8F55E6A);
pub const GUID_BLOBFS: Uuid = Uuid::from_u128(0x2967380E_134C_4CBB_B6DA_17E7CE1CA45D);
pub const GUID_CROS_KERNEL: Uuid = Uuid::from_u128(0xFE3A2A5D_4F32_41A7_B725_ACCC3285A309);
pub const GUID_CROS_ROOTFS: Uuid = Uuid::from_u128(0x3CB8E202_3B7E_47DD_8A3C_7FF2A13CFCEC);
pub const GUID_BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);

bitflags! {
    /// Fields of a slot that differ from the last synced table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GptDiffs: u32 {
        const TYPE = 0x01;
        const GUID = 0x02;
        const FIRST = 0x04;
        const LAST = 0x08;
        const FLAGS = 0x10;
        const NAME = 0x20;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub instance_guid: Uuid,
    /// First block, inclusive.
    pub first: u64,
    /// Last block, inclusive.
    pub last: u64,
    pub flags: u64,
    /// UTF-16, NUL padded.
    pub name: [u16; GPT_NAME_LEN],
}

// arrays longer than 32 don't implement Default
impl Default for GptEntry {
    fn default() -> Self {
        Self {
            type_guid: Uuid::nil(),
            instance_guid: Uuid::nil(),
            first: 0,
            last: 0,
            flags: 0,
            name: [0; GPT_NAME_LEN],
        }
    }
}

impl GptEntry {
    pub fn name(&self) -> String {
        let len = self.name.iter().position(|c| *c == 0).unwrap_or(GPT_NAME_LEN);
        String::from_utf16_lossy(&self.name[..len])
    }

    pub fn blocks(&self) -> u64 {
        self.last - self.first + 1
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        let type_guid = read_guid(&buf[0..16]);
        if type_guid.is_nil() {
            return None;
        }
        let mut name = [0u16; GPT_NAME_LEN];
        for (i, c) in name.iter_mut().enumerate() {
            *c = u16::from_le_bytes([buf[56 + 2 * i], buf[57 + 2 * i]]);
        }
        Some(Self {
            type_guid,
            instance_guid: read_guid(&buf[16..32]),
            first: read_u64(&buf[32..40]),
            last: read_u64(&buf[40..48]),
            flags: read_u64(&buf[48..56]),
            name,
        })
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf[0..16].copy_from_slice(&self.type_guid.to_bytes_le());
        buf[16..32].copy_from_slice(&self.instance_guid.to_bytes_le());
        buf[32..40].copy_from_slice(&self.first.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last.to_le_bytes());
        buf[48..56].copy_from_slice(&self.flags.to_le_bytes());
        for (i, c) in self.name.iter().enumerate() {
            buf[56 + 2 * i..58 + 2 * i].copy_from_slice(&c.to_le_bytes());
        }
    }
}

/// Encode a partition name, failing if it doesn't fit.
pub fn encode_name(name: &str) -> Result<[u16; GPT_NAME_LEN]> {
    let mut out = [0u16; GPT_NAME_LEN];
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > GPT_NAME_LEN {
        return Err(PaveError::InvalidArgs(format!(
            "partition name \"{}\" is longer than {} characters",
            name, GPT_NAME_LEN
        )));
    }
    out[..units.len()].copy_from_slice(&units);
    Ok(out)
}

// GUIDs are mixed-endian on disk
fn read_guid(buf: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[..16]);
    Uuid::from_bytes_le(bytes)
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}

#[derive(Debug, Serialize, Deserialize)]
struct GptHeader {
    signature: [u8; 8],
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    reserved: u32,
    current_lba: u64,
    backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc32: u32,
}

impl GptHeader {
    fn encode(&self) -> Result<Vec<u8>> {
        bincoder()
            .serialize(self)
            .map_err(|e| PaveError::InvalidArgs(format!("encoding GPT header: {}", e)))
    }

    fn crc(&self) -> Result<u32> {
        let mut header = self.encode()?;
        header[16..20].fill(0);
        Ok(crc32fast::hash(&header))
    }
}

/// A GPT and the device it lives on.
pub struct GptDevice<D> {
    dev: D,
    block_size: u32,
    block_count: u64,
    valid: bool,
    disk_guid: Uuid,
    entries: Vec<Option<GptEntry>>,
    shadow: Vec<Option<GptEntry>>,
    entries_crc32: u32,
}

impl<D: BlockDevice> GptDevice<D> {
    /// Load the table using the device's own geometry.
    pub fn open(dev: D) -> Result<Self> {
        let info = dev.info()?;
        Self::load(dev, info.block_size, info.block_count)
    }

    /// Read the table from `dev`, preferring the primary copy.  If neither
    /// copy is intact the result is an empty table with `valid() == false`.
    pub fn load(dev: D, block_size: u32, block_count: u64) -> Result<Self> {
        if block_size < 512 || block_size > 16384 || !block_size.is_power_of_two() {
            return Err(PaveError::InvalidArgs(format!(
                "unsupported block size {}",
                block_size
            )));
        }
        let info = dev.info()?;
        if info.block_size != block_size || info.block_count < block_count {
            return Err(PaveError::GeometryMismatch(format!(
                "device has {} blocks of {} bytes, table expects {} blocks of {} bytes",
                info.block_count, info.block_size, block_count, block_size
            )));
        }
        let mut gpt = Self {
            dev,
            block_size,
            block_count,
            valid: false,
            disk_guid: Uuid::new_v4(),
            entries: vec![None; GPT_ENTRY_COUNT],
            shadow: vec![None; GPT_ENTRY_COUNT],
            entries_crc32: 0,
        };
        let (first_usable, last_usable) = gpt.range();
        if first_usable > last_usable {
            return Err(PaveError::InvalidArgs(format!(
                "device of {} blocks is too small for a partition table",
                block_count
            )));
        }

        let mut found = gpt.read_copy(1)?;
        if found.is_none() {
            found = gpt.read_copy(block_count - 1)?;
        }
        if let Some((disk_guid, entries)) = found {
            gpt.valid = true;
            gpt.disk_guid = disk_guid;
            gpt.shadow = entries.clone();
            gpt.entries = entries;
            gpt.check_entries().map_err(|e| match e {
                PaveError::InvalidArgs(msg) | PaveError::Overlap(msg) => {
                    PaveError::CorruptTable(msg)
                }
                e => e,
            })?;
        }
        Ok(gpt)
    }

    /// Read one copy of the header and its entries.  Returns None if the
    /// signature or either checksum is wrong.
    #[allow(clippy::type_complexity)]
    fn read_copy(&self, lba: u64) -> Result<Option<(Uuid, Vec<Option<GptEntry>>)>> {
        let bs = self.block_size as u64;
        let mut block = vec![0u8; self.block_size as usize];
        self.dev.read_at(lba * bs, &mut block)?;
        let header: GptHeader = match bincoder().deserialize(&block) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };
        if header.signature != GPT_SIGNATURE
            || header.header_size < GPT_HEADER_SIZE
            || header.header_size > self.block_size
        {
            return Ok(None);
        }
        let mut crc_region = block[..header.header_size as usize].to_vec();
        crc_region[16..20].fill(0);
        if crc32fast::hash(&crc_region) != header.header_crc32 || header.current_lba != lba {
            return Ok(None);
        }

        // checksummed, so anything odd from here on is a broken writer
        // rather than a torn write
        if header.entry_size as usize != GPT_ENTRY_SIZE
            || header.entry_count as usize > GPT_ENTRY_COUNT
        {
            return Err(PaveError::CorruptTable(format!(
                "unsupported entry array of {} x {} bytes",
                header.entry_count, header.entry_size
            )));
        }
        let array_len = header.entry_count as u64 * GPT_ENTRY_SIZE as u64;
        let array_blocks = (array_len + bs - 1) / bs;
        if header.entries_lba < 2
            || header
                .entries_lba
                .checked_add(array_blocks)
                .map(|end| end > self.block_count)
                .unwrap_or(true)
        {
            return Err(PaveError::CorruptTable(format!(
                "entry array at block {} is outside the device",
                header.entries_lba
            )));
        }
        if header.first_usable_lba > header.last_usable_lba
            || header.last_usable_lba >= self.block_count
        {
            return Err(PaveError::CorruptTable(format!(
                "usable range {}..={} is invalid",
                header.first_usable_lba, header.last_usable_lba
            )));
        }
        let mut array = vec![0u8; array_len as usize];
        self.dev.read_at(header.entries_lba * bs, &mut array)?;
        if crc32fast::hash(&array) != header.entries_crc32 {
            return Ok(None);
        }

        let mut entries = vec![None; GPT_ENTRY_COUNT];
        for (slot, chunk) in array.chunks_exact(GPT_ENTRY_SIZE).enumerate() {
            entries[slot] = GptEntry::from_bytes(chunk);
        }
        Ok(Some((read_guid(&header.disk_guid), entries)))
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn disk_guid(&self) -> Uuid {
        self.disk_guid
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    fn entry_array_blocks(&self) -> u64 {
        let bs = self.block_size as u64;
        (GPT_ENTRY_ARRAY_SIZE + bs - 1) / bs
    }

    /// First and last usable blocks, inclusive.
    pub fn range(&self) -> (u64, u64) {
        let array_blocks = self.entry_array_blocks();
        (
            2 + array_blocks,
            self.block_count.saturating_sub(2 + array_blocks),
        )
    }

    pub fn partition(&self, slot: usize) -> Option<&GptEntry> {
        self.entries.get(slot).and_then(Option::as_ref)
    }

    pub fn partition_mut(&mut self, slot: usize) -> Option<&mut GptEntry> {
        self.entries.get_mut(slot).and_then(Option::as_mut)
    }

    /// Occupied slots, in slot order.
    pub fn partitions(&self) -> impl Iterator<Item = (usize, &GptEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (slot, e)))
    }

    /// Insert a partition into the first free slot.  Memory only.
    pub fn add_partition(
        &mut self,
        name: &str,
        type_guid: Uuid,
        instance_guid: Uuid,
        first: u64,
        blocks: u64,
        flags: u64,
    ) -> Result<usize> {
        if type_guid.is_nil() || instance_guid.is_nil() {
            return Err(PaveError::InvalidArgs("nil partition GUID".into()));
        }
        if blocks == 0 {
            return Err(PaveError::InvalidArgs(format!(
                "partition \"{}\" has no blocks",
                name
            )));
        }
        let name = encode_name(name)?;
        let entry = GptEntry {
            type_guid,
            instance_guid,
            first,
            last: first
                .checked_add(blocks - 1)
                .ok_or_else(|| PaveError::InvalidArgs("partition end overflows".into()))?,
            flags,
            name,
        };
        self.check_entry(&entry)?;
        for (_, other) in self.partitions() {
            if other.instance_guid == instance_guid {
                return Err(PaveError::InvalidArgs(format!(
                    "instance GUID {} already in use",
                    instance_guid
                )));
            }
            if entry.first <= other.last && other.first <= entry.last {
                return Err(PaveError::Overlap(format!(
                    "blocks {}..={} overlap \"{}\" at {}..={}",
                    entry.first,
                    entry.last,
                    other.name(),
                    other.first,
                    other.last
                )));
            }
        }
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(PaveError::TableFull)?;
        self.entries[slot] = Some(entry);
        Ok(slot)
    }

    /// Clear the slot holding `instance_guid`.  Memory only.
    pub fn remove_partition(&mut self, instance_guid: Uuid) -> Result<()> {
        let slot = self
            .entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.instance_guid == instance_guid))
            .ok_or_else(|| PaveError::NotFound(format!("partition {}", instance_guid)))?;
        self.entries[slot] = None;
        Ok(())
    }

    pub fn remove_all_partitions(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    fn check_entry(&self, entry: &GptEntry) -> Result<()> {
        let (first_usable, last_usable) = self.range();
        if entry.first > entry.last || entry.first < first_usable || entry.last > last_usable {
            return Err(PaveError::InvalidArgs(format!(
                "blocks {}..={} outside usable range {}..={}",
                entry.first, entry.last, first_usable, last_usable
            )));
        }
        Ok(())
    }

    fn check_entries(&self) -> Result<()> {
        let mut ranges = Vec::new();
        for (_, entry) in self.partitions() {
            self.check_entry(entry)?;
            ranges.push((entry.first, entry.last));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 >= pair[1].0 {
                return Err(PaveError::Overlap(format!(
                    "blocks {}..={} and {}..={}",
                    pair[0].0, pair[0].1, pair[1].0, pair[1].1
                )));
            }
        }
        Ok(())
    }

    fn entry_array(&self) -> Vec<u8> {
        let mut array = vec![0u8; GPT_ENTRY_ARRAY_SIZE as usize];
        for (slot, entry) in self.partitions() {
            entry.write_bytes(&mut array[slot * GPT_ENTRY_SIZE..(slot + 1) * GPT_ENTRY_SIZE]);
        }
        array
    }

    /// Validate entries and recompute derived header fields.  No I/O.
    pub fn finalize(&mut self) -> Result<()> {
        self.check_entries()?;
        self.entries_crc32 = crc32fast::hash(&self.entry_array());
        Ok(())
    }

    fn header(&self, primary: bool) -> Result<GptHeader> {
        let array_blocks = self.entry_array_blocks();
        let (first_usable, last_usable) = self.range();
        let backup_lba = self.block_count - 1;
        let (current_lba, other_lba, entries_lba) = if primary {
            (1, backup_lba, 2)
        } else {
            (backup_lba, 1, backup_lba - array_blocks)
        };
        let mut header = GptHeader {
            signature: GPT_SIGNATURE,
            revision: GPT_REVISION,
            header_size: GPT_HEADER_SIZE,
            header_crc32: 0,
            reserved: 0,
            current_lba,
            backup_lba: other_lba,
            first_usable_lba: first_usable,
            last_usable_lba: last_usable,
            disk_guid: self.disk_guid.to_bytes_le(),
            entries_lba,
            entry_count: GPT_ENTRY_COUNT as u32,
            entry_size: GPT_ENTRY_SIZE as u32,
            entries_crc32: self.entries_crc32,
        };
        header.header_crc32 = header.crc()?;
        Ok(header)
    }

    fn write_header(&self, header: &GptHeader) -> Result<()> {
        let mut block = vec![0u8; self.block_size as usize];
        let encoded = header.encode()?;
        block[..encoded.len()].copy_from_slice(&encoded);
        self.dev
            .write_at(header.current_lba * self.block_size as u64, &block)?;
        Ok(())
    }

    fn ensure_protective_mbr(&self) -> Result<()> {
        let mut block = vec![0u8; self.block_size as usize];
        self.dev.read_at(0, &mut block)?;
        if block[510..512] == [0x55, 0xaa] && block[450] == 0xee {
            return Ok(());
        }
        // keep any boot code; replace the partition records
        block[446..512].fill(0);
        block[446 + 1..446 + 4].copy_from_slice(&[0x00, 0x02, 0x00]);
        block[446 + 4] = 0xee;
        block[446 + 5..446 + 8].copy_from_slice(&[0xff, 0xff, 0xff]);
        block[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
        let sectors: u32 = (self.block_count - 1).try_into().unwrap_or(u32::MAX);
        block[446 + 12..446 + 16].copy_from_slice(&sectors.to_le_bytes());
        block[510..512].copy_from_slice(&[0x55, 0xaa]);
        self.dev.write_at(0, &block)?;
        Ok(())
    }

    /// Write the table to disk.  The backup copy is completed and flushed
    /// before the primary is touched, so an interrupted sync always leaves
    /// one intact copy.
    pub fn sync(&mut self) -> Result<()> {
        self.finalize()?;
        let bs = self.block_size as u64;
        let array = self.entry_array();
        let primary = self.header(true)?;
        let backup = self.header(false)?;

        self.ensure_protective_mbr()?;
        self.dev.write_at(backup.entries_lba * bs, &array)?;
        self.write_header(&backup)?;
        self.dev.flush()?;
        self.dev.write_at(primary.entries_lba * bs, &array)?;
        self.write_header(&primary)?;
        self.dev.flush()?;

        self.shadow = self.entries.clone();
        self.valid = true;
        Ok(())
    }

    /// Which fields of `slot` differ from the last synced table.
    pub fn diffs(&self, slot: usize) -> Result<GptDiffs> {
        if slot >= GPT_ENTRY_COUNT {
            return Err(PaveError::InvalidArgs(format!("no slot {}", slot)));
        }
        let empty = GptEntry::default();
        let cur = self.entries[slot].as_ref().unwrap_or(&empty);
        let old = self.shadow[slot].as_ref().unwrap_or(&empty);
        let mut diffs = GptDiffs::empty();
        diffs.set(GptDiffs::TYPE, cur.type_guid != old.type_guid);
        diffs.set(GptDiffs::GUID, cur.instance_guid != old.instance_guid);
        diffs.set(GptDiffs::FIRST, cur.first != old.first);
        diffs.set(GptDiffs::LAST, cur.last != old.last);
        diffs.set(GptDiffs::FLAGS, cur.flags != old.flags);
        diffs.set(GptDiffs::NAME, cur.name != old.name);
        Ok(diffs)
    }

    /// Zero `blocks` blocks starting at `first`, so a new or removed
    /// partition can't be mistaken for whatever used to live there.
    pub fn clear_partition(&self, first: u64, blocks: u64) -> Result<()> {
        let (first_usable, last_usable) = self.range();
        if blocks == 0 || first < first_usable || first + blocks - 1 > last_usable {
            return Err(PaveError::InvalidArgs(format!(
                "can't clear blocks {}+{}",
                first, blocks
            )));
        }
        let bs = self.block_size as u64;
        crate::blockdev::zero_range(&self.dev, first * bs, blocks * bs)?;
        Ok(())
    }
}

impl<D: BlockDevice> fmt::Display for GptDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Partition table {} ({} blocks of {} bytes):",
            if self.valid { "valid" } else { "invalid" },
            self.block_count,
            self.block_size
        )?;
        for (slot, entry) in self.partitions() {
            writeln!(
                f,
                "  {:3}: {:<24} {} {:>10}..={:<10} flags {:#018x}",
                slot,
                entry.name(),
                entry.type_guid.hyphenated().to_string().to_uppercase(),
                entry.first,
                entry.last,
                entry.flags
            )?;
        }
        Ok(())
    }
}
