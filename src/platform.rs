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

//! Finding disks, partitions and volume managers.

use anyhow::{Context, Result};
use std::thread::sleep;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::blockdev::{list_block_devices, BlockDevice, FileDevice, Window};
use crate::errors::PaveError;
use crate::fvm::{Fvm, VolumeManager};
use crate::gpt::{GptDevice, GUID_FVM};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A disk the platform knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub path: String,
    pub removable: bool,
    pub whole_disk: bool,
}

/// Source of disks.
pub trait Platform {
    fn disks(&self) -> Result<Vec<DiskEntry>>;

    fn open(&self, path: &str) -> Result<Box<dyn BlockDevice>>;
}

/// Disks of the running system, or a single explicitly chosen device or
/// disk image.
#[derive(Debug, Default)]
pub struct HostPlatform {
    device: Option<String>,
}

impl HostPlatform {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

impl Platform for HostPlatform {
    fn disks(&self) -> Result<Vec<DiskEntry>> {
        if let Some(device) = &self.device {
            // an explicit choice is never skipped as removable
            return Ok(vec![DiskEntry {
                path: device.clone(),
                removable: false,
                whole_disk: true,
            }]);
        }
        Ok(list_block_devices()?
            .into_iter()
            .map(|d| DiskEntry {
                path: d.path,
                removable: d.removable,
                whole_disk: d.whole_disk,
            })
            .collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn BlockDevice>> {
        Ok(Box::new(FileDevice::open(path)?))
    }
}

/// Where a partition lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRef {
    /// Disk path as reported by the platform.
    pub disk: String,
    /// GPT slot of the partition, or of the volume manager holding it.
    pub slot: usize,
    /// Index within the volume manager, for volumes.
    pub volume: Option<u16>,
    pub type_guid: Uuid,
    pub instance_guid: Uuid,
    pub name: String,
    pub topological_path: String,
}

impl PartitionRef {
    pub fn is_volume(&self) -> bool {
        self.volume.is_some()
    }
}

pub type DiskDevice = Box<dyn BlockDevice>;
pub type PartitionDevice = Window<DiskDevice>;

pub fn partition_path(disk: &str, slot: usize) -> String {
    format!("{}/part-{:03}", disk, slot)
}

/// Device lookups on top of a `Platform`.
#[derive(Debug)]
pub struct Devices<P> {
    platform: P,
    timeout: Duration,
}

impl<P: Platform> Devices<P> {
    /// `timeout` bounds every wait for a partition or volume manager.
    pub fn new(platform: P, timeout: Duration) -> Self {
        Self { platform, timeout }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn open_disk(&self, disk: &str) -> Result<DiskDevice> {
        self.platform.open(disk)
    }

    pub fn open_gpt(&self, disk: &str) -> Result<GptDevice<DiskDevice>> {
        let dev = self.open_disk(disk)?;
        GptDevice::open(dev).with_context(|| format!("reading partition table of {}", disk))
    }

    /// The first fixed whole-disk device.
    pub fn find_target_gpt(&self) -> Result<String> {
        self.platform
            .disks()?
            .into_iter()
            .find(|d| d.whole_disk && !d.removable)
            .map(|d| d.path)
            .ok_or_else(|| PaveError::NotFound("no fixed disk to install to".into()).into())
    }

    /// Find a partition by instance and/or type, searching every disk's
    /// GPT first and then the active volumes of every volume manager.
    pub fn find_partition(
        &self,
        instance: Option<Uuid>,
        type_guid: Option<Uuid>,
    ) -> Result<Option<PartitionRef>> {
        let matches = |i: &Uuid, t: &Uuid| {
            instance.map_or(true, |want| want == *i) && type_guid.map_or(true, |want| want == *t)
        };
        let mut tables = Vec::new();
        for disk in self.platform.disks()? {
            if !disk.whole_disk {
                continue;
            }
            // unreadable disks can't hold our partitions
            let gpt = match self.open_gpt(&disk.path) {
                Ok(gpt) if gpt.valid() => gpt,
                _ => continue,
            };
            let topo = gpt.device().topological_path();
            if let Some((slot, entry)) = gpt
                .partitions()
                .find(|(_, e)| matches(&e.instance_guid, &e.type_guid))
            {
                return Ok(Some(PartitionRef {
                    disk: disk.path,
                    slot,
                    volume: None,
                    type_guid: entry.type_guid,
                    instance_guid: entry.instance_guid,
                    name: entry.name(),
                    topological_path: partition_path(&topo, slot),
                }));
            }
            tables.push((disk.path, gpt));
        }

        for (disk, gpt) in tables {
            for (slot, entry) in gpt.partitions().filter(|(_, e)| e.type_guid == GUID_FVM) {
                let window = self.open_partition_slot(&disk, slot, entry.first, entry.last)?;
                if !Fvm::detect(&window).unwrap_or(false) {
                    continue;
                }
                let fvm = match Fvm::open(window) {
                    Ok(fvm) => fvm,
                    Err(_) => continue,
                };
                if let Some(volume) = fvm
                    .partitions()
                    .into_iter()
                    .find(|v| v.is_active() && matches(&v.instance_guid, &v.type_guid))
                {
                    return Ok(Some(PartitionRef {
                        disk: disk.clone(),
                        slot,
                        volume: Some(volume.index),
                        type_guid: volume.type_guid,
                        instance_guid: volume.instance_guid,
                        topological_path: format!(
                            "{}/{}-p-{}",
                            fvm.topological_path(),
                            volume.name,
                            volume.index
                        ),
                        name: volume.name,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Poll `find_partition` until it succeeds or the timeout passes.
    pub fn wait_for_partition(
        &self,
        instance: Option<Uuid>,
        type_guid: Option<Uuid>,
    ) -> Result<PartitionRef> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(part) = self.find_partition(instance, type_guid)? {
                return Ok(part);
            }
            if Instant::now() >= deadline {
                let what = match (instance, type_guid) {
                    (Some(i), _) => format!("partition {}", i),
                    (None, Some(t)) => format!("partition of type {}", t),
                    (None, None) => "any partition".into(),
                };
                return Err(PaveError::NotFound(format!(
                    "{} didn't appear within {:?}",
                    what, self.timeout
                ))
                .into());
            }
            sleep(POLL_INTERVAL);
        }
    }

    fn open_partition_slot(
        &self,
        disk: &str,
        slot: usize,
        first: u64,
        last: u64,
    ) -> Result<PartitionDevice> {
        let dev = self.open_disk(disk)?;
        let path = partition_path(&dev.topological_path(), slot);
        Window::new(dev, first, last, path)
            .with_context(|| format!("opening partition {} of {}", slot, disk))
    }

    /// Open a GPT partition for reading and writing.
    pub fn open_partition(&self, part: &PartitionRef) -> Result<PartitionDevice> {
        if part.is_volume() {
            return Err(PaveError::InvalidArgs(format!(
                "{} is a volume; open it through its volume manager",
                part.topological_path
            ))
            .into());
        }
        let gpt = self.open_gpt(&part.disk)?;
        let entry = gpt
            .partition(part.slot)
            .filter(|e| e.instance_guid == part.instance_guid)
            .cloned()
            .ok_or_else(|| PaveError::NotFound(format!("partition {}", part.topological_path)))?;
        self.open_partition_slot(&part.disk, part.slot, entry.first, entry.last)
    }

    /// Open the volume manager in `part`, formatting it with `slice_size`
    /// first if it isn't one yet.  Inactive volumes are discarded.
    pub fn bind_fvm(&self, part: &PartitionRef, slice_size: u64) -> Result<Fvm<PartitionDevice>> {
        let window = self.open_partition(part)?;
        if !Fvm::detect(&window)? {
            eprintln!("Initializing {} as a volume manager", part.topological_path);
            Fvm::format(window, slice_size).with_context(|| {
                format!("formatting volume manager on {}", part.topological_path)
            })?;
        } else {
            drop(window);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let window = self.open_partition(part)?;
            match Fvm::bind(window) {
                Ok(fvm) => return Ok(fvm),
                Err(PaveError::NotFound(_) | PaveError::Io(_)) if Instant::now() < deadline => {
                    sleep(POLL_INTERVAL)
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("binding volume manager on {}", part.topological_path)
                    })
                }
            }
        }
    }

    /// Have the system reread the partition table of `disk`.
    pub fn rescan(&self, disk: &str) -> Result<()> {
        self.open_disk(disk)?
            .rescan_partitions()
            .with_context(|| format!("rescanning partitions of {}", disk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::pave_error;
    use crate::fvm::AllocRequest;
    use crate::gpt::{GUID_DATA, GUID_EFI};
    use crate::testing::{MemDisk, MemPlatform};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn timeout() -> Duration {
        Duration::from_millis(250)
    }

    #[test]
    fn target_is_first_fixed_disk() {
        let mut platform = MemPlatform::new();
        platform.add_disk(MemDisk::new(512, 1000).with_path("/dev/usb").removable(true), true);
        platform.add_disk(MemDisk::new(512, 1000).with_path("/dev/loop0"), false);
        let devices = Devices::new(platform, timeout());
        let err = devices.find_target_gpt().unwrap_err();
        assert!(matches!(pave_error(&err), Some(PaveError::NotFound(_))));

        let mut platform = MemPlatform::new();
        platform.add_disk(MemDisk::new(512, 1000).with_path("/dev/usb").removable(true), true);
        platform.add_disk(MemDisk::new(512, 1000).with_path("/dev/sda"), true);
        platform.add_disk(MemDisk::new(512, 1000).with_path("/dev/sdb"), true);
        let devices = Devices::new(platform, timeout());
        assert_eq!(devices.find_target_gpt().unwrap(), "/dev/sda");
    }

    #[test]
    fn finds_gpt_partitions_and_volumes() {
        let disk = MemDisk::new(512, 65536).with_path("/dev/sda");
        let mut gpt = GptDevice::open(disk.clone()).unwrap();
        let efi = Uuid::new_v4();
        gpt.add_partition("EFI", GUID_EFI, efi, 34, 100, 0).unwrap();
        gpt.add_partition("fvm", GUID_FVM, Uuid::new_v4(), 200, 8192, 0)
            .unwrap();
        gpt.sync().unwrap();
        let mut platform = MemPlatform::new();
        // no table at all
        platform.add_disk(MemDisk::new(512, 1000).with_path("/dev/sdz"), true);
        platform.add_disk(disk.clone(), true);
        let devices = Devices::new(platform, timeout());

        let part = devices.find_partition(None, Some(GUID_EFI)).unwrap().unwrap();
        assert_eq!(part.disk, "/dev/sda");
        assert_eq!(part.slot, 0);
        assert_eq!(part.instance_guid, efi);
        assert_eq!(part.topological_path, "/dev/sda/part-000");
        assert!(!part.is_volume());
        assert_eq!(
            devices.find_partition(Some(efi), None).unwrap(),
            Some(part.clone())
        );
        assert_eq!(
            devices.find_partition(Some(efi), Some(GUID_DATA)).unwrap(),
            None
        );
        let window = devices.open_partition(&part).unwrap();
        assert_eq!(window.info().unwrap().block_count, 100);
        window.write_at(0, b"efi").unwrap();
        assert_eq!(disk.read_range(34 * 512, 3), b"efi");

        // volumes are found once the volume manager exists
        assert_eq!(devices.find_partition(None, Some(GUID_DATA)).unwrap(), None);
        let fvm_part = devices.find_partition(None, Some(GUID_FVM)).unwrap().unwrap();
        let mut fvm = devices.bind_fvm(&fvm_part, 8192).unwrap();
        let data = Uuid::new_v4();
        let mut request = AllocRequest {
            type_guid: GUID_DATA,
            instance_guid: data,
            name: "data".into(),
            slice_count: 1,
            inactive: true,
        };
        fvm.allocate_partition(&request).unwrap();
        // inactive volumes are invisible
        assert_eq!(devices.find_partition(None, Some(GUID_DATA)).unwrap(), None);
        request.instance_guid = Uuid::new_v4();
        request.inactive = false;
        fvm.allocate_partition(&request).unwrap();
        let found = devices.find_partition(None, Some(GUID_DATA)).unwrap().unwrap();
        assert_eq!(found.instance_guid, request.instance_guid);
        assert_eq!(found.volume, Some(2));
        assert_eq!(found.slot, 1);
        assert_eq!(found.topological_path, "/dev/sda/part-001/fvm/data-p-2");
        assert!(devices.open_partition(&found).is_err());
    }

    #[test]
    fn wait_times_out() {
        let mut platform = MemPlatform::new();
        platform.add_disk(MemDisk::new(512, 1000), true);
        let devices = Devices::new(platform, Duration::from_millis(150));
        let start = Instant::now();
        let err = devices
            .wait_for_partition(Some(Uuid::new_v4()), None)
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(matches!(pave_error(&err), Some(PaveError::NotFound(_))));
    }

    #[test]
    fn bind_formats_and_purges() {
        let disk = MemDisk::new(512, 65536).with_path("/dev/sda");
        let mut gpt = GptDevice::open(disk.clone()).unwrap();
        gpt.add_partition("fvm", GUID_FVM, Uuid::new_v4(), 34, 8192, 0)
            .unwrap();
        gpt.sync().unwrap();
        let mut platform = MemPlatform::new();
        platform.add_disk(disk, true);
        let devices = Devices::new(platform, timeout());
        let part = devices.wait_for_partition(None, Some(GUID_FVM)).unwrap();

        let mut fvm = devices.bind_fvm(&part, 16384).unwrap();
        assert_eq!(fvm.info().slice_size, 16384);
        assert_eq!(fvm.topological_path(), "/dev/sda/part-000/fvm");
        fvm.allocate_partition(&AllocRequest {
            type_guid: GUID_DATA,
            instance_guid: Uuid::new_v4(),
            name: "data".into(),
            slice_count: 1,
            inactive: true,
        })
        .unwrap();
        drop(fvm);

        // slice size of an existing volume manager is kept
        let fvm = devices.bind_fvm(&part, 8192).unwrap();
        assert_eq!(fvm.info().slice_size, 16384);
        assert!(fvm.partitions().is_empty());
    }

    #[test]
    fn bind_keeps_volumes_behind_damaged_header() {
        let disk = MemDisk::new(512, 65536).with_path("/dev/sda");
        let mut gpt = GptDevice::open(disk.clone()).unwrap();
        gpt.add_partition("fvm", GUID_FVM, Uuid::new_v4(), 34, 8192, 0)
            .unwrap();
        gpt.sync().unwrap();
        let mut platform = MemPlatform::new();
        platform.add_disk(disk.clone(), true);
        let devices = Devices::new(platform, timeout());
        let part = devices.wait_for_partition(None, Some(GUID_FVM)).unwrap();

        let mut fvm = devices.bind_fvm(&part, 8192).unwrap();
        let data = Uuid::new_v4();
        fvm.allocate_partition(&AllocRequest {
            type_guid: GUID_DATA,
            instance_guid: data,
            name: "data".into(),
            slice_count: 1,
            inactive: false,
        })
        .unwrap();
        drop(fvm);

        // the newest metadata is the second copy
        disk.write_at(34 * 512, &[0u8; 512]).unwrap();
        let fvm = devices.bind_fvm(&part, 16384).unwrap();
        assert_eq!(fvm.info().slice_size, 8192);
        let partitions = fvm.partitions();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].instance_guid, data);
    }

    #[test]
    fn host_platform_explicit_device() {
        let mut f = NamedTempFile::new().unwrap();
        f.as_file_mut().set_len(1000 * 512).unwrap();
        f.as_file_mut().flush().unwrap();
        let path = f.path().to_str().unwrap().to_string();
        let platform = HostPlatform::new(Some(path.clone()));
        assert_eq!(
            platform.disks().unwrap(),
            vec![DiskEntry {
                path: path.clone(),
                removable: false,
                whole_disk: true,
            }]
        );
        let devices = Devices::new(platform, timeout());
        assert_eq!(devices.find_target_gpt().unwrap(), path);
        let gpt = devices.open_gpt(&path).unwrap();
        assert!(!gpt.valid());
        assert_eq!(gpt.block_count(), 1000);
        devices.rescan(&path).unwrap();
    }
}
