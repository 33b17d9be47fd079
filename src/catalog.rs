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

//! Finding, creating and finalizing the GPT partitions we pave into.

use std::fmt;
use uuid::Uuid;

use crate::blockdev::BlockDevice;
use crate::errors::{PaveError, Result};
use crate::gpt::{cros, find_first_fit, GptDevice, GptEntry, GUID_CROS_KERNEL, GUID_EFI};

const MIB: u64 = 1024 * 1024;

/// What to create when no suitable partition exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub type_guid: Uuid,
    pub min_bytes: u64,
    pub name: String,
}

/// Return the first slot accepted by `filter(slot, type, name)`.
pub fn partition_find<D, F>(gpt: &GptDevice<D>, filter: F) -> Result<usize>
where
    D: BlockDevice,
    F: Fn(usize, &Uuid, &str) -> bool,
{
    gpt.partitions()
        .find(|(slot, e)| filter(*slot, &e.type_guid, &e.name()))
        .map(|(slot, _)| slot)
        .ok_or_else(|| PaveError::NotFound("no matching partition in GPT".into()))
}

/// Allocate a partition described by `factory()` in the first gap that
/// fits it, and sync the table.  The partition gets exactly the requested
/// size even if the gap is larger.
pub fn partition_add<D, F>(gpt: &mut GptDevice<D>, factory: F) -> Result<usize>
where
    D: BlockDevice,
    F: FnOnce() -> PartitionSpec,
{
    let spec = factory();
    let bs = gpt.block_size() as u64;
    let fit = find_first_fit(gpt, gpt.block_size(), gpt.block_count(), spec.min_bytes)?;
    let blocks = (spec.min_bytes + bs - 1) / bs;
    let slot = gpt.add_partition(
        &spec.name,
        spec.type_guid,
        Uuid::new_v4(),
        fit.start,
        blocks,
        0,
    )?;
    gpt.sync()?;
    Ok(slot)
}

/// Let `finalizer` adjust the entry in `slot`, syncing only if it reports
/// a change.  Returns whether the table was written.
pub fn partition_finalize<D, F>(gpt: &mut GptDevice<D>, slot: usize, finalizer: F) -> Result<bool>
where
    D: BlockDevice,
    F: FnOnce(&mut GptEntry) -> Result<bool>,
{
    let entry = gpt
        .partition_mut(slot)
        .ok_or_else(|| PaveError::NotFound(format!("partition slot {}", slot)))?;
    if !finalizer(entry)? {
        return Ok(false);
    }
    gpt.sync()?;
    Ok(true)
}

/// Partitions paved directly from a raw image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// EFI system partition holding the bootloader.
    Efi,
    /// Third ChromeOS kernel slot.
    KernC,
}

impl PartitionKind {
    pub fn filter(&self, slot: usize, type_guid: &Uuid, name: &str) -> bool {
        match self {
            // slot 0 may be the disk's original ESP; leave it alone
            Self::Efi => slot != 0 && *type_guid == GUID_EFI,
            Self::KernC => *type_guid == GUID_CROS_KERNEL && name.starts_with(cros::KERNC_NAME),
        }
    }

    pub fn spec(&self) -> PartitionSpec {
        match self {
            Self::Efi => PartitionSpec {
                type_guid: GUID_EFI,
                min_bytes: 1024 * MIB,
                name: "EFI Gigaboot".into(),
            },
            Self::KernC => PartitionSpec {
                type_guid: GUID_CROS_KERNEL,
                min_bytes: 64 * MIB,
                name: cros::KERNC_NAME.into(),
            },
        }
    }

    /// Adjust attributes after the payload is written.  Returns whether
    /// anything changed.
    pub fn finalize(&self, entry: &mut GptEntry) -> Result<bool> {
        match self {
            Self::Efi => Ok(false),
            Self::KernC => {
                let before = entry.flags;
                // boot ahead of KERN-A and KERN-B, which use 1 and 2
                cros::set_priority(&mut entry.flags, 3)?;
                cros::set_successful(&mut entry.flags, true);
                cros::set_tries(&mut entry.flags, 15)?;
                Ok(entry.flags != before)
            }
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Efi => write!(f, "EFI"),
            Self::KernC => write!(f, "KERN-C"),
        }
    }
}
