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

use anyhow::{Context, Result};
use std::io::Read;
use uuid::Uuid;

use crate::catalog::{partition_add, partition_finalize, partition_find, PartitionKind};
use crate::errors::PaveError;
use crate::fvm::{format_bytes, fvm_stream_partitions};
use crate::gpt::{
    cros, find_first_fit, GptDevice, GptEntry, GUID_BLOBFS, GUID_DATA, GUID_FVM, GUID_SYSTEM,
};
use crate::io::{stream_partition, FifoClient, StagingBuffer};
use crate::platform::{DiskDevice, Devices, PartitionRef, Platform};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Space a ChromeOS disk must have for KERN-C.
pub const KERNC_BYTES: u64 = 64 * MIB;
pub const FVM_MIN_BYTES: u64 = 8 * GIB;
/// Left unallocated after the FVM partition when the disk has room, so
/// the table can grow later.
pub const FVM_RESERVE_BYTES: u64 = 4 * GIB;
/// Zeroed at the start of every wiped partition so nothing recognizes its
/// old contents.
pub const WIPE_BYTES: u64 = 4192;

/// Partition types removed by `wipe`.
const WIPED_TYPES: [(Uuid, &str); 4] = [
    (GUID_SYSTEM, "system"),
    (GUID_DATA, "data"),
    (GUID_BLOBFS, "blobfs"),
    (GUID_FVM, "fvm"),
];

/// Load the table of `disk`, writing an empty one if it has none.
pub fn initialize_gpt<P: Platform>(
    devices: &Devices<P>,
    disk: &str,
) -> Result<GptDevice<DiskDevice>> {
    let mut gpt = devices.open_gpt(disk)?;
    if !gpt.valid() {
        eprintln!("Partition table on {} is invalid; initializing", disk);
        gpt.remove_all_partitions();
        gpt.sync()
            .with_context(|| format!("writing empty partition table to {}", disk))?;
        devices.rescan(disk)?;
    }
    Ok(gpt)
}

/// Make room for our partitions on layouts that need it.  Currently
/// only ChromeOS disks, whose STATE partition fills the disk.
pub fn device_specific_disk_prep<P: Platform>(devices: &Devices<P>, disk: &str) -> Result<()> {
    let mut gpt = initialize_gpt(devices, disk)?;
    if !cros::is_cros(&gpt) || cros::is_ready_to_pave(&gpt, KERNC_BYTES, FVM_MIN_BYTES)? {
        return Ok(());
    }
    eprintln!("Shrinking ChromeOS STATE partition on {}", disk);
    cros::config_cros_for_fuchsia(&mut gpt, KERNC_BYTES, FVM_MIN_BYTES)
        .context("making room on ChromeOS disk")?;
    gpt.sync()
        .with_context(|| format!("writing partition table to {}", disk))?;
    devices.rescan(disk)
}

/// Write a raw image from `source` into the partition for `kind`,
/// creating the partition if needed.
pub fn install_partition<P: Platform>(
    devices: &Devices<P>,
    kind: PartitionKind,
    source: &mut (impl Read + ?Sized),
) -> Result<()> {
    let disk = devices.find_target_gpt().context("finding target disk")?;
    eprintln!("Installing {} partition on {}", kind, disk);
    device_specific_disk_prep(devices, &disk).context("preparing disk")?;

    let mut gpt = initialize_gpt(devices, &disk)?;
    let slot = match partition_find(&gpt, |s, t, n| kind.filter(s, t, n)) {
        Ok(slot) => slot,
        Err(PaveError::NotFound(_)) => {
            let spec = kind.spec();
            eprintln!("Creating {} partition of {}", kind, format_bytes(spec.min_bytes));
            let slot = partition_add(&mut gpt, || spec)
                .with_context(|| format!("adding {} partition", kind))?;
            devices.rescan(&disk)?;
            slot
        }
        Err(e) => return Err(e).with_context(|| format!("looking for {} partition", kind)),
    };
    let entry = gpt
        .partition(slot)
        .cloned()
        .ok_or_else(|| PaveError::NotFound(format!("partition slot {}", slot)))?;
    drop(gpt);

    let part = devices
        .wait_for_partition(Some(entry.instance_guid), Some(entry.type_guid))
        .with_context(|| format!("waiting for {} partition", kind))?;
    let written = stream_to_partition(devices, &part, source)
        .with_context(|| format!("writing {} partition", kind))?;
    eprintln!("Wrote {} to {}", format_bytes(written), part.topological_path);

    // the table may have been rewritten while we streamed
    let mut gpt = initialize_gpt(devices, &disk)?;
    let slot = partition_find(&gpt, |s, t, n| kind.filter(s, t, n))
        .with_context(|| format!("finding {} partition again", kind))?;
    if partition_finalize(&mut gpt, slot, |e| kind.finalize(e))
        .with_context(|| format!("finalizing {} partition", kind))?
    {
        eprintln!("Updated {} partition attributes", kind);
        devices.rescan(&disk)?;
    }
    Ok(())
}

fn stream_to_partition<P: Platform>(
    devices: &Devices<P>,
    part: &PartitionRef,
    source: &mut (impl Read + ?Sized),
) -> Result<u64> {
    let window = devices.open_partition(part)?;
    let mut staging = StagingBuffer::default();
    let mut client = FifoClient::register(&window, &staging)
        .with_context(|| format!("registering block I/O for {}", part.topological_path))?;
    let written = stream_partition(source, &mut client, &mut staging)?;
    client.flush(&mut staging)?;
    Ok(written)
}

/// Add an FVM partition to the table of `disk` unless it has one, and
/// wait for it to appear.
///
/// The partition takes the first gap of at least `FVM_MIN_BYTES`, less
/// `FVM_RESERVE_BYTES` if that still leaves more than the minimum.
pub fn fvm_add_to_gpt<P: Platform>(devices: &Devices<P>, disk: &str) -> Result<PartitionRef> {
    let mut gpt = initialize_gpt(devices, disk)?;
    let existing = gpt
        .partitions()
        .find(|(_, e)| e.type_guid == GUID_FVM)
        .map(|(_, e)| e.instance_guid);
    let instance = match existing {
        Some(instance) => {
            eprintln!("FVM partition already exists on {}", disk);
            instance
        }
        None => {
            let bs = gpt.block_size() as u64;
            let fit = find_first_fit(&gpt, gpt.block_size(), gpt.block_count(), FVM_MIN_BYTES)
                .context("finding space for FVM partition")?;
            let mut blocks = fit.blocks;
            if fit
                .blocks
                .checked_sub(FVM_RESERVE_BYTES / bs)
                .map_or(false, |b| b > FVM_MIN_BYTES / bs)
            {
                blocks -= FVM_RESERVE_BYTES / bs;
            }
            let instance = Uuid::new_v4();
            gpt.add_partition("fvm", GUID_FVM, instance, fit.start, blocks, 0)
                .context("adding FVM partition")?;
            gpt.sync()
                .with_context(|| format!("writing partition table to {}", disk))?;
            devices.rescan(disk)?;
            eprintln!(
                "Added FVM partition of {} at block {}",
                format_bytes(blocks * bs),
                fit.start
            );
            instance
        }
    };
    drop(gpt);
    devices
        .wait_for_partition(Some(instance), Some(GUID_FVM))
        .context("waiting for FVM partition")
}

/// Unpack a sparse image from `source` into the FVM partition, creating
/// the partition if needed.
pub fn install_fvm<P: Platform>(
    devices: &Devices<P>,
    source: &mut (impl Read + ?Sized),
) -> Result<()> {
    let disk = devices.find_target_gpt().context("finding target disk")?;
    eprintln!("Installing FVM on {}", disk);
    device_specific_disk_prep(devices, &disk).context("preparing disk")?;
    fvm_add_to_gpt(devices, &disk)?;
    fvm_stream_partitions(devices, source).context("streaming partitions")?;
    Ok(())
}

/// Remove system, data, blobfs and FVM partitions from the target disk.
pub fn wipe<P: Platform>(devices: &Devices<P>) -> Result<()> {
    let disk = devices.find_target_gpt().context("finding target disk")?;
    let mut gpt = initialize_gpt(devices, &disk)?;
    let bs = gpt.block_size() as u64;
    let victims: Vec<(GptEntry, &str)> = gpt
        .partitions()
        .filter_map(|(_, e)| {
            WIPED_TYPES
                .iter()
                .find(|(t, _)| *t == e.type_guid)
                .map(|(_, label)| (e.clone(), *label))
        })
        .collect();
    for (entry, label) in &victims {
        eprintln!("Removing {} partition {}", label, entry.name());
        let blocks = ((WIPE_BYTES + bs - 1) / bs).min(entry.blocks());
        gpt.clear_partition(entry.first, blocks)
            .with_context(|| format!("clearing {} partition", label))?;
        gpt.remove_partition(entry.instance_guid)
            .with_context(|| format!("removing {} partition", label))?;
    }
    if !victims.is_empty() {
        gpt.sync()
            .with_context(|| format!("writing partition table to {}", disk))?;
        eprintln!("Partition table updated; reboot strongly recommended");
    }
    drop(gpt);
    devices.rescan(&disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::BlockDevice;
    use crate::errors::pave_error;
    use crate::fvm::{Fvm, VolumeManager};
    use crate::gpt::{GUID_BASIC_DATA, GUID_CROS_KERNEL, GUID_CROS_ROOTFS, GUID_EFI};
    use crate::sparse::SparseImageBuilder;
    use crate::testing::{MemDisk, MemPlatform};
    use std::time::Duration;

    fn devices(disk: &MemDisk) -> Devices<MemPlatform> {
        let mut platform = MemPlatform::new();
        platform.add_disk(disk.clone(), true);
        Devices::new(platform, Duration::from_millis(250))
    }

    fn blocks(bytes: u64) -> u64 {
        bytes / 512
    }

    #[test]
    fn initialize_writes_empty_table() {
        let disk = MemDisk::new(512, 100_000);
        let devices = devices(&disk);
        let gpt = initialize_gpt(&devices, "/dev/mem0").unwrap();
        assert!(gpt.valid());
        assert_eq!(disk.rescans(), 1);
        assert!(GptDevice::open(disk.clone()).unwrap().valid());

        // nothing to do the second time
        let writes = disk.writes();
        initialize_gpt(&devices, "/dev/mem0").unwrap();
        assert_eq!(disk.writes(), writes);
    }

    #[test]
    fn install_efi_reuses_partition() {
        let disk = MemDisk::new(512, blocks(4 * GIB));
        let mut gpt = GptDevice::open(disk.clone()).unwrap();
        // the disk's own ESP, which is never overwritten
        gpt.add_partition("EFI System", GUID_EFI, Uuid::new_v4(), 2048, 2048, 0)
            .unwrap();
        gpt.sync().unwrap();
        disk.write_at(2048 * 512, b"vendor01").unwrap();
        let devices = devices(&disk);

        let image: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8 + 1).collect();
        install_partition(&devices, PartitionKind::Efi, &mut &image[..]).unwrap();
        let gpt = GptDevice::open(disk.clone()).unwrap();
        let entry = gpt.partition(1).unwrap().clone();
        assert_eq!(entry.name(), "EFI Gigaboot");
        assert_eq!(entry.blocks(), blocks(GIB));
        // the gap in front of the ESP is too small
        assert_eq!(entry.first, 4096);
        assert_eq!(entry.flags, 0);
        assert_eq!(disk.read_range(entry.first * 512, 3000), image);
        assert_eq!(disk.read_range(2048 * 512, 8), b"vendor01");
        assert!(disk.rescans() > 0);

        let image = vec![0x77u8; 512];
        install_partition(&devices, PartitionKind::Efi, &mut &image[..]).unwrap();
        let gpt = GptDevice::open(disk.clone()).unwrap();
        assert_eq!(gpt.partitions().count(), 2);
        assert_eq!(gpt.partition(1), Some(&entry));
        assert_eq!(disk.read_range(entry.first * 512, 512), image);
    }

    #[test]
    fn install_kernc_finalizes() {
        let disk = MemDisk::new(512, blocks(GIB));
        let devices = devices(&disk);
        let image = vec![0x42u8; 4096];
        install_partition(&devices, PartitionKind::KernC, &mut &image[..]).unwrap();

        let gpt = GptDevice::open(disk.clone()).unwrap();
        let (_, entry) = gpt.partitions().next().unwrap();
        assert_eq!(entry.name(), "KERN-C");
        assert_eq!(entry.type_guid, GUID_CROS_KERNEL);
        assert_eq!(entry.blocks(), blocks(KERNC_BYTES));
        assert_eq!(cros::priority(entry.flags), 3);
        assert_eq!(cros::tries(entry.flags), 15);
        assert!(cros::successful(entry.flags));
        assert_eq!(disk.read_range(entry.first * 512, 4096), image);
    }

    #[test]
    fn install_larger_than_partition() {
        let disk = MemDisk::new(512, blocks(GIB));
        let mut gpt = GptDevice::open(disk.clone()).unwrap();
        gpt.add_partition("KERN-C", GUID_CROS_KERNEL, Uuid::new_v4(), 34, 4, 0)
            .unwrap();
        gpt.sync().unwrap();
        let devices = devices(&disk);
        let image = vec![1u8; 4096];
        let err = install_partition(&devices, PartitionKind::KernC, &mut &image[..]).unwrap_err();
        assert!(matches!(pave_error(&err), Some(PaveError::Io(_))));
        // not finalized
        let gpt = GptDevice::open(disk).unwrap();
        assert_eq!(gpt.partition(0).unwrap().flags, 0);
    }

    #[test]
    fn fvm_partition_keeps_reserve() {
        let count = blocks(16 * GIB);
        let disk = MemDisk::new(512, count);
        let devices = devices(&disk);
        let part = fvm_add_to_gpt(&devices, "/dev/mem0").unwrap();
        assert_eq!(part.topological_path, "/dev/mem0/part-000");
        let gpt = GptDevice::open(disk.clone()).unwrap();
        let entry = gpt.partition(0).unwrap();
        assert_eq!(entry.name(), "fvm");
        assert_eq!(entry.instance_guid, part.instance_guid);
        assert_eq!(entry.first, 34);
        assert_eq!(entry.blocks(), count - 67 - blocks(FVM_RESERVE_BYTES));

        // already there
        let writes = disk.writes();
        assert_eq!(fvm_add_to_gpt(&devices, "/dev/mem0").unwrap(), part);
        assert_eq!(disk.writes(), writes);
    }

    #[test]
    fn fvm_partition_without_reserve() {
        let count = blocks(10 * GIB);
        let disk = MemDisk::new(512, count);
        fvm_add_to_gpt(&devices(&disk), "/dev/mem0").unwrap();
        let gpt = GptDevice::open(disk).unwrap();
        assert_eq!(gpt.partition(0).unwrap().blocks(), count - 67);

        let small = MemDisk::new(512, blocks(4 * GIB));
        let err = fvm_add_to_gpt(&devices(&small), "/dev/mem0").unwrap_err();
        assert!(matches!(pave_error(&err), Some(PaveError::NotFound(_))));
    }

    #[test]
    fn install_fvm_end_to_end() {
        let disk = MemDisk::new(512, blocks(16 * GIB));
        let devices = devices(&disk);
        let slice = MIB;
        let blob: Vec<u8> = (0..MIB + 100).map(|i| (i % 239) as u8 + 1).collect();
        let image = SparseImageBuilder::new(slice)
            .partition(GUID_BLOBFS, "blobfs", &[(0, 2, &blob[..])])
            .partition(GUID_DATA, "data", &[(0, 1, &[][..])])
            .build()
            .unwrap();
        install_fvm(&devices, &mut &image[..]).unwrap();

        let part = devices
            .find_partition(None, Some(GUID_FVM))
            .unwrap()
            .unwrap();
        let fvm = Fvm::open(devices.open_partition(&part).unwrap()).unwrap();
        assert_eq!(fvm.info().slice_size, slice);
        assert_eq!(fvm.info().allocated_slices, 3);
        let volumes = fvm.partitions();
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().all(|v| v.is_active()));
        let blobfs = volumes.iter().find(|v| v.type_guid == GUID_BLOBFS).unwrap();
        let volume = fvm.open_partition(blobfs.instance_guid).unwrap();
        let mut buf = vec![0u8; 2 * slice as usize];
        volume.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..blob.len()], &blob[..]);
        assert!(buf[blob.len()..].iter().all(|b| *b == 0));
        drop(volume);
        drop(fvm);

        // paving again replaces the volumes
        install_fvm(&devices, &mut &image[..]).unwrap();
        let gpt = GptDevice::open(disk.clone()).unwrap();
        assert_eq!(gpt.partitions().count(), 1);
        let fvm = Fvm::open(devices.open_partition(&part).unwrap()).unwrap();
        assert_eq!(fvm.partitions().len(), 2);
        assert!(fvm
            .partitions()
            .iter()
            .all(|v| v.instance_guid != blobfs.instance_guid));
    }

    /// 16 GiB ChromeOS layout whose STATE runs to the last usable block.
    fn cros_disk() -> MemDisk {
        let disk = MemDisk::new(512, blocks(16 * GIB));
        let mut gpt = GptDevice::open(disk.clone()).unwrap();
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
        gpt.sync().unwrap();
        disk
    }

    #[test]
    fn cros_prep_shrinks_state_once() {
        let disk = cros_disk();
        let devices = devices(&disk);
        let before = GptDevice::open(disk.clone()).unwrap().partition(2).unwrap().clone();
        assert_eq!(before.last, blocks(16 * GIB) - 34);
        device_specific_disk_prep(&devices, "/dev/mem0").unwrap();
        let after = GptDevice::open(disk.clone()).unwrap().partition(2).unwrap().clone();
        assert_eq!(
            before.last - after.last,
            blocks(KERNC_BYTES + FVM_MIN_BYTES)
        );
        assert_eq!(disk.rescans(), 1);

        let writes = disk.writes();
        device_specific_disk_prep(&devices, "/dev/mem0").unwrap();
        assert_eq!(disk.writes(), writes);
    }

    #[test]
    fn cros_disk_takes_kernc_and_fvm() {
        let disk = cros_disk();
        let devices = devices(&disk);
        install_partition(&devices, PartitionKind::KernC, &mut &[9u8; 512][..]).unwrap();
        let part = fvm_add_to_gpt(&devices, "/dev/mem0").unwrap();
        let gpt = GptDevice::open(disk).unwrap();
        let state = gpt.partition(2).unwrap();
        let kernc = gpt.partition(3).unwrap();
        let fvm = gpt.partition(4).unwrap();
        assert_eq!(kernc.first, state.last + 1);
        assert_eq!(fvm.first, kernc.last + 1);
        assert_eq!(fvm.instance_guid, part.instance_guid);
        // exactly the freed space, nothing to reserve
        assert_eq!(fvm.blocks(), blocks(FVM_MIN_BYTES));
        assert_eq!(fvm.last, gpt.range().1);
    }

    #[test]
    fn wipe_removes_managed_partitions() {
        let disk = MemDisk::new(512, blocks(GIB));
        let mut gpt = GptDevice::open(disk.clone()).unwrap();
        gpt.add_partition("EFI", GUID_EFI, Uuid::new_v4(), 34, 1000, 0)
            .unwrap();
        gpt.add_partition("data", GUID_DATA, Uuid::new_v4(), 2000, 100, 0)
            .unwrap();
        gpt.add_partition("fvm", GUID_FVM, Uuid::new_v4(), 3000, 5, 0)
            .unwrap();
        gpt.sync().unwrap();
        for first in [34, 2000, 3000] {
            disk.write_at(first * 512, &[0xaa; 5 * 512]).unwrap();
        }
        disk.write_at(2000 * 512 + 4608, &[0xbb; 16]).unwrap();
        let devices = devices(&disk);

        wipe(&devices).unwrap();
        let gpt = GptDevice::open(disk.clone()).unwrap();
        let left: Vec<String> = gpt.partitions().map(|(_, e)| e.name()).collect();
        assert_eq!(left, vec!["EFI".to_string()]);
        assert!(disk.read_range(2000 * 512, 4608).iter().all(|b| *b == 0));
        assert_eq!(disk.read_range(2000 * 512 + 4608, 16), vec![0xbb; 16]);
        // clamped to the partition
        assert!(disk.read_range(3000 * 512, 5 * 512).iter().all(|b| *b == 0));
        assert_eq!(disk.read_range(3005 * 512, 1), vec![0]);
        assert_eq!(disk.read_range(34 * 512, 5 * 512), vec![0xaa; 5 * 512]);
        assert_eq!(disk.rescans(), 1);

        // nothing left to remove
        let writes = disk.writes();
        wipe(&devices).unwrap();
        assert_eq!(disk.writes(), writes);
        assert_eq!(disk.rescans(), 2);
    }
}
