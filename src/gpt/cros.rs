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

//! ChromeOS kernel attributes, and making room for our partitions on a
//! ChromeOS disk layout.

use super::{
    find_first_fit, GptDevice, GptEntry, GUID_BASIC_DATA, GUID_CROS_KERNEL, GUID_CROS_ROOTFS,
    GUID_FVM,
};
use crate::blockdev::BlockDevice;
use crate::errors::{PaveError, Result};

const PRIORITY_SHIFT: u32 = 48;
const TRIES_SHIFT: u32 = 52;
const SUCCESSFUL_SHIFT: u32 = 56;
const NIBBLE: u64 = 0xf;

pub const KERNC_NAME: &str = "KERN-C";
pub const STATE_NAME: &str = "STATE";
/// STATE is never shrunk below this.
pub const MIN_STATE_BYTES: u64 = 1024 * 1024 * 1024;

pub fn priority(flags: u64) -> u8 {
    ((flags >> PRIORITY_SHIFT) & NIBBLE) as u8
}

pub fn set_priority(flags: &mut u64, priority: u8) -> Result<()> {
    set_nibble(flags, PRIORITY_SHIFT, priority, "priority")
}

pub fn tries(flags: u64) -> u8 {
    ((flags >> TRIES_SHIFT) & NIBBLE) as u8
}

pub fn set_tries(flags: &mut u64, tries: u8) -> Result<()> {
    set_nibble(flags, TRIES_SHIFT, tries, "tries")
}

pub fn successful(flags: u64) -> bool {
    flags & (1 << SUCCESSFUL_SHIFT) != 0
}

pub fn set_successful(flags: &mut u64, successful: bool) {
    if successful {
        *flags |= 1 << SUCCESSFUL_SHIFT;
    } else {
        *flags &= !(1 << SUCCESSFUL_SHIFT);
    }
}

fn set_nibble(flags: &mut u64, shift: u32, value: u8, what: &str) -> Result<()> {
    if value as u64 > NIBBLE {
        return Err(PaveError::InvalidArgs(format!(
            "{} {} doesn't fit in 4 bits",
            what, value
        )));
    }
    *flags = (*flags & !(NIBBLE << shift)) | ((value as u64) << shift);
    Ok(())
}

pub fn is_kernc(entry: &GptEntry) -> bool {
    entry.type_guid == GUID_CROS_KERNEL && entry.name().starts_with(KERNC_NAME)
}

fn is_state(entry: &GptEntry) -> bool {
    entry.type_guid == GUID_BASIC_DATA && entry.name() == STATE_NAME
}

/// Whether the disk carries a ChromeOS layout.
pub fn is_cros<D: BlockDevice>(gpt: &GptDevice<D>) -> bool {
    let has = |f: &dyn Fn(&GptEntry) -> bool| gpt.partitions().any(|(_, e)| f(e));
    has(&|e| e.type_guid == GUID_CROS_KERNEL)
        && has(&|e| e.type_guid == GUID_CROS_ROOTFS)
        && has(&is_state)
}

/// Bytes still to be found for a KERN-C and an FVM partition.
fn missing_bytes<D: BlockDevice>(gpt: &GptDevice<D>, kernc_bytes: u64, fvm_bytes: u64) -> u64 {
    let mut missing = 0;
    if !gpt.partitions().any(|(_, e)| is_kernc(e)) {
        missing += kernc_bytes;
    }
    if !gpt.partitions().any(|(_, e)| e.type_guid == GUID_FVM) {
        missing += fvm_bytes;
    }
    missing
}

/// Whether KERN-C and FVM partitions exist or can be allocated without
/// moving anything.
pub fn is_ready_to_pave<D: BlockDevice>(
    gpt: &GptDevice<D>,
    kernc_bytes: u64,
    fvm_bytes: u64,
) -> Result<bool> {
    let missing = missing_bytes(gpt, kernc_bytes, fvm_bytes);
    if missing == 0 {
        return Ok(true);
    }
    match find_first_fit(gpt, gpt.block_size(), gpt.block_count(), missing) {
        Ok(_) => Ok(true),
        Err(PaveError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Shrink STATE so the partitions we need fit after it.  Memory only; a
/// no-op if the disk is already ready.
pub fn config_cros_for_fuchsia<D: BlockDevice>(
    gpt: &mut GptDevice<D>,
    kernc_bytes: u64,
    fvm_bytes: u64,
) -> Result<()> {
    if is_ready_to_pave(gpt, kernc_bytes, fvm_bytes)? {
        return Ok(());
    }
    let bs = gpt.block_size() as u64;
    let missing = (missing_bytes(gpt, kernc_bytes, fvm_bytes) + bs - 1) / bs;
    let min_state = MIN_STATE_BYTES / bs;
    let slot = gpt
        .partitions()
        .find(|(_, e)| is_state(e))
        .map(|(slot, _)| slot)
        .ok_or_else(|| PaveError::NotFound("ChromeOS STATE partition".into()))?;
    let state = gpt
        .partition_mut(slot)
        .ok_or_else(|| PaveError::NotFound("ChromeOS STATE partition".into()))?;
    if state.blocks() < missing + min_state {
        return Err(PaveError::NotFound(format!(
            "STATE has {} blocks; can't free {} and keep {}",
            state.blocks(),
            missing,
            min_state
        )));
    }
    state.last -= missing;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::{GUID_EFI, GUID_FVM};
    use crate::testing::MemDisk;
    use uuid::Uuid;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn attribute_bits() {
        let mut flags = 1u64 << 60;
        set_priority(&mut flags, 3).unwrap();
        set_tries(&mut flags, 15).unwrap();
        set_successful(&mut flags, true);
        assert_eq!(flags, (1 << 60) | (3 << 48) | (15 << 52) | (1 << 56));
        assert_eq!(priority(flags), 3);
        assert_eq!(tries(flags), 15);
        assert!(successful(flags));

        set_priority(&mut flags, 1).unwrap();
        set_successful(&mut flags, false);
        assert_eq!(priority(flags), 1);
        assert!(!successful(flags));
        assert_eq!(tries(flags), 15);
        set_tries(&mut flags, 16).unwrap_err();
        assert_eq!(tries(flags), 15);
    }

    /// 16 GiB disk with a ChromeOS layout whose STATE fills the disk up to
    /// the last usable block.
    fn cros_disk() -> GptDevice<MemDisk> {
        let blocks = 16 * 1024 * MIB / 512;
        let mut gpt = GptDevice::open(MemDisk::new(512, blocks)).unwrap();
        let last_usable = gpt.range().1;
        gpt.add_partition("KERN-A", GUID_CROS_KERNEL, Uuid::new_v4(), 64, 32768, 0)
            .unwrap();
        gpt.add_partition("ROOT-A", GUID_CROS_ROOTFS, Uuid::new_v4(), 32832, 32768, 0)
            .unwrap();
        gpt.add_partition(
            "STATE",
            GUID_BASIC_DATA,
            Uuid::new_v4(),
            65600,
            last_usable + 1 - 65600,
            0,
        )
        .unwrap();
        gpt
    }

    #[test]
    fn detects_cros() {
        let gpt = cros_disk();
        assert!(is_cros(&gpt));
        let mut gpt = GptDevice::open(MemDisk::new(512, 100_000)).unwrap();
        assert!(!is_cros(&gpt));
        gpt.add_partition("EFI", GUID_EFI, Uuid::new_v4(), 64, 100, 0)
            .unwrap();
        assert!(!is_cros(&gpt));
    }

    #[test]
    fn shrinks_state() {
        let mut gpt = cros_disk();
        assert_eq!(gpt.partition(2).unwrap().last, gpt.range().1);
        let kernc = 64 * MIB;
        let fvm = 8 * 1024 * MIB;
        assert!(!is_ready_to_pave(&gpt, kernc, fvm).unwrap());
        let before = gpt.partition(2).unwrap().clone();
        config_cros_for_fuchsia(&mut gpt, kernc, fvm).unwrap();
        let after = gpt.partition(2).unwrap().clone();
        assert_eq!(after.first, before.first);
        assert_eq!(before.last - after.last, (kernc + fvm) / 512);
        assert!(is_ready_to_pave(&gpt, kernc, fvm).unwrap());
        // exactly the freed space
        let fit = find_first_fit(&gpt, 512, gpt.block_count(), kernc + fvm).unwrap();
        assert_eq!(fit.start, after.last + 1);
        assert_eq!(fit.blocks, (kernc + fvm) / 512);

        // idempotent
        config_cros_for_fuchsia(&mut gpt, kernc, fvm).unwrap();
        assert_eq!(gpt.partition(2).unwrap(), &after);
    }

    #[test]
    fn ready_when_partitions_exist() {
        let mut gpt = cros_disk();
        gpt.partition_mut(2).unwrap().last -= 2 * 1024 * MIB / 512;
        let free_start = gpt.partition(2).unwrap().last + 1;
        gpt.add_partition("KERN-C", GUID_CROS_KERNEL, Uuid::new_v4(), free_start, 1, 0)
            .unwrap();
        gpt.add_partition("fvm", GUID_FVM, Uuid::new_v4(), free_start + 1, 1, 0)
            .unwrap();
        assert!(is_ready_to_pave(&gpt, 64 * MIB, 8 * 1024 * MIB).unwrap());
    }

    #[test]
    fn state_too_small() {
        let mut gpt = cros_disk();
        assert!(matches!(
            config_cros_for_fuchsia(&mut gpt, 64 * MIB, 15 * 1024 * MIB),
            Err(PaveError::NotFound(_))
        ));
    }
}
