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

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::sys::stat::{major, minor};
use regex::Regex;
use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::{read_to_string, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::linux::fs::MetadataExt;
use std::os::raw::c_int;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use crate::io::{BlockFifo, DeviceFifo};

/// Sector size assumed for disk images stored in regular files.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_size: u32,
    pub block_count: u64,
    pub removable: bool,
}

impl BlockInfo {
    pub fn size_bytes(&self) -> u64 {
        self.block_count * self.block_size as u64
    }
}

/// A seekable, block-addressed device.  Offsets and lengths are in bytes.
pub trait BlockDevice {
    fn info(&self) -> io::Result<BlockInfo>;

    /// Fill `buf` from `offset`; reading past the end is an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush volatile caches to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Stable path naming where this device sits in the device hierarchy.
    fn topological_path(&self) -> String;

    /// Ask the system to pick up a rewritten partition table.
    fn rescan_partitions(&self) -> io::Result<()> {
        Ok(())
    }

    /// Open a request/response transport for bulk writes.
    fn attach_fifo(&self) -> io::Result<Box<dyn BlockFifo + '_>> {
        Ok(Box::new(DeviceFifo::new(self)))
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn info(&self) -> io::Result<BlockInfo> {
        (**self).info()
    }
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, buf)
    }
    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }
    fn topological_path(&self) -> String {
        (**self).topological_path()
    }
    fn rescan_partitions(&self) -> io::Result<()> {
        (**self).rescan_partitions()
    }
    fn attach_fifo(&self) -> io::Result<Box<dyn BlockFifo + '_>> {
        (**self).attach_fifo()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn info(&self) -> io::Result<BlockInfo> {
        (**self).info()
    }
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, buf)
    }
    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }
    fn topological_path(&self) -> String {
        (**self).topological_path()
    }
    fn rescan_partitions(&self) -> io::Result<()> {
        (**self).rescan_partitions()
    }
    fn attach_fifo(&self) -> io::Result<Box<dyn BlockFifo + '_>> {
        (**self).attach_fifo()
    }
}

/// Write zeroes over `len` bytes starting at `offset`.
pub fn zero_range(dev: &(impl BlockDevice + ?Sized), offset: u64, len: u64) -> io::Result<()> {
    let chunk = vec![0u8; len.min(crate::io::STAGING_BUFFER_SIZE as u64) as usize];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(chunk.len() as u64) as usize;
        dev.write_at(offset + done, &chunk[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// A whole disk: either a Linux block device or a disk image in a
/// regular file.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: String,
    info: BlockInfo,
    is_block_device: bool,
}

impl FileDevice {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening {}", path))?;
        let metadata = file
            .metadata()
            .with_context(|| format!("getting metadata for {}", path))?;
        let is_block_device = metadata.file_type().is_block_device();
        let info = if is_block_device {
            let block_size = get_sector_size(&file)
                .with_context(|| format!("getting sector size of {}", path))?;
            let size = get_block_device_size(&file)
                .with_context(|| format!("getting size of {}", path))?;
            let rdev = metadata.st_rdev();
            let removable = read_sysfs_dev_block_value(major(rdev), minor(rdev), "removable")
                .map(|v| v == "1")
                .unwrap_or(false);
            BlockInfo {
                block_size,
                block_count: size / block_size as u64,
                removable,
            }
        } else if metadata.is_file() {
            BlockInfo {
                block_size: DEFAULT_BLOCK_SIZE,
                block_count: metadata.len() / DEFAULT_BLOCK_SIZE as u64,
                removable: false,
            }
        } else {
            bail!("{} is neither a block device nor a disk image", path);
        };
        let path = Path::new(path)
            .canonicalize()
            .with_context(|| format!("canonicalizing {}", path))?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            file,
            path,
            info,
            is_block_device,
        })
    }
}

impl BlockDevice for FileDevice {
    fn info(&self) -> io::Result<BlockInfo> {
        Ok(self.info)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if offset + buf.len() as u64 > self.info.size_bytes() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("write past end of {}", self.path),
            ));
        }
        self.file.write_all_at(buf, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn topological_path(&self) -> String {
        self.path.clone()
    }

    fn rescan_partitions(&self) -> io::Result<()> {
        if self.is_block_device {
            reread_partition_table(&self.file)
        } else {
            Ok(())
        }
    }
}

/// A byte range of another device, such as a single GPT partition.
#[derive(Debug)]
pub struct Window<D> {
    dev: D,
    offset: u64,
    len: u64,
    block_size: u32,
    path: String,
}

impl<D: BlockDevice> Window<D> {
    /// Expose blocks `first..=last` of `dev`.
    pub fn new(dev: D, first: u64, last: u64, path: String) -> io::Result<Self> {
        let info = dev.info()?;
        if first > last || last >= info.block_count {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "blocks {}..={} outside device of {} blocks",
                    first, last, info.block_count
                ),
            ));
        }
        let bs = info.block_size as u64;
        Ok(Self {
            dev,
            offset: first * bs,
            len: (last - first + 1) * bs,
            block_size: info.block_size,
            path,
        })
    }

    fn check(&self, offset: u64, len: usize) -> io::Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("access beyond end of {}", self.path),
            )),
        }
    }
}

impl<D: BlockDevice> BlockDevice for Window<D> {
    fn info(&self) -> io::Result<BlockInfo> {
        Ok(BlockInfo {
            block_size: self.block_size,
            block_count: self.len / self.block_size as u64,
            removable: self.dev.info()?.removable,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check(offset, buf.len())?;
        self.dev.read_at(self.offset + offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.check(offset, buf.len())?;
        self.dev.write_at(self.offset + offset, buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.dev.flush()
    }

    fn topological_path(&self) -> String {
        self.path.clone()
    }
}

/// A disk as reported by lsblk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlkDev {
    pub path: String,
    pub removable: bool,
    pub whole_disk: bool,
}

/// Enumerate block devices known to the kernel.
pub fn list_block_devices() -> Result<Vec<BlkDev>> {
    // Older lsblk doesn't support PATH, but -p option
    let result = Command::new("lsblk")
        .arg("--pairs")
        .arg("--paths")
        .arg("--nodeps")
        .arg("--output")
        .arg("NAME,TYPE,RM")
        .output()
        .context("running lsblk")?;
    if !result.status.success() {
        // copy out its stderr
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("lsblk failed");
    }
    let output = String::from_utf8(result.stdout).context("decoding lsblk output")?;
    Ok(parse_lsblk(&output))
}

fn parse_lsblk(output: &str) -> Vec<BlkDev> {
    output
        .lines()
        .map(split_lsblk_line)
        .filter_map(|fields| {
            Some(BlkDev {
                path: fields.get("NAME")?.to_owned(),
                removable: fields.get("RM").map(|v| v == "1").unwrap_or(false),
                whole_disk: fields.get("TYPE").map(|v| v == "disk").unwrap_or(false),
            })
        })
        .collect()
}

/// Parse key-value pairs from lsblk --pairs.
/// Newer versions of lsblk support JSON but older ones don't.
fn split_lsblk_line(line: &str) -> HashMap<String, String> {
    lazy_static! {
        static ref LSBLK_PAIR: Regex = Regex::new(r#"([A-Z-]+)="([^"]+)""#)
            .expect("compiling lsblk regex");
    }
    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in LSBLK_PAIR.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

fn read_sysfs_dev_block_value(maj: u64, min: u64, field: &str) -> Result<String> {
    let path = format!("/sys/dev/block/{}:{}/{}", maj, min, field);
    Ok(read_to_string(&path)
        .with_context(|| format!("reading {}", path))?
        .trim_end()
        .into())
}

fn reread_partition_table(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // Reread sometimes fails inexplicably.  Retry several times before
    // giving up.
    for retries in (0..20).rev() {
        match unsafe { ioctl::blkrrpart(fd) } {
            Ok(_) => break,
            Err(err) if retries == 0 => {
                let msg = match err {
                    Errno::EINVAL => {
                        "couldn't reread partition table: device may not support partitions"
                    }
                    Errno::EBUSY => "couldn't reread partition table: device is in use",
                    _ => "couldn't reread partition table",
                };
                return Err(io::Error::new(
                    io::Error::from(err).kind(),
                    format!("{}: {}", msg, err),
                ));
            }
            Err(_) => sleep(Duration::from_millis(100)),
        }
    }
    Ok(())
}

/// Get the logical sector size of a block device.
fn get_sector_size(file: &File) -> Result<u32> {
    let fd = file.as_raw_fd();
    let mut size: c_int = 0;
    unsafe { ioctl::blksszget(fd, &mut size) }.context("getting sector size")?;
    let size: u32 = size
        .try_into()
        .with_context(|| format!("sector size {} doesn't fit in u32", size))?;
    if size == 0 {
        return Err(anyhow!("found sector size of zero"));
    }
    Ok(size)
}

/// Get the size of a block device.
fn get_block_device_size(file: &File) -> Result<u64> {
    let fd = file.as_raw_fd();
    let mut size: libc::size_t = 0;
    unsafe { ioctl::blkgetsize64(fd, &mut size) }.context("getting block device size")?;
    // just cast using `as`: there is no platform we care about today where size_t > 64bits
    Ok(size as u64)
}

// create unsafe ioctl wrappers
#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use super::c_int;
    use nix::{ioctl_none, ioctl_read, ioctl_read_bad, request_code_none};
    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn lsblk_split() {
        assert_eq!(
            split_lsblk_line(r#"NAME="/dev/sda" TYPE="disk" RM="0""#),
            hashmap! {
                String::from("NAME") => String::from("/dev/sda"),
                String::from("TYPE") => String::from("disk"),
                String::from("RM") => String::from("0"),
            }
        );
        assert_eq!(
            split_lsblk_line(r#"NAME="/dev/sr0" TYPE="" RM="1""#),
            hashmap! {
                String::from("NAME") => String::from("/dev/sr0"),
                String::from("RM") => String::from("1"),
            }
        );
    }

    #[test]
    fn lsblk_parse() {
        let output = concat!(
            "NAME=\"/dev/sda\" TYPE=\"disk\" RM=\"0\"\n",
            "NAME=\"/dev/sdb\" TYPE=\"disk\" RM=\"1\"\n",
            "NAME=\"/dev/loop0\" TYPE=\"loop\" RM=\"0\"\n",
            "garbage\n",
        );
        assert_eq!(
            parse_lsblk(output),
            vec![
                BlkDev {
                    path: "/dev/sda".into(),
                    removable: false,
                    whole_disk: true,
                },
                BlkDev {
                    path: "/dev/sdb".into(),
                    removable: true,
                    whole_disk: true,
                },
                BlkDev {
                    path: "/dev/loop0".into(),
                    removable: false,
                    whole_disk: false,
                },
            ]
        );
    }

    #[test]
    fn image_file_device() {
        let mut f = NamedTempFile::new().unwrap();
        f.as_file_mut().set_len(64 * 512).unwrap();
        f.as_file_mut().flush().unwrap();
        let dev = FileDevice::open(f.path().to_str().unwrap()).unwrap();
        assert_eq!(
            dev.info().unwrap(),
            BlockInfo {
                block_size: 512,
                block_count: 64,
                removable: false,
            }
        );

        dev.write_at(1000, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        dev.write_at(64 * 512 - 1, b"xy").unwrap_err();
        dev.rescan_partitions().unwrap();
    }

    #[test]
    fn window_bounds() {
        let mut f = NamedTempFile::new().unwrap();
        f.as_file_mut().set_len(16 * 512).unwrap();
        let dev = FileDevice::open(f.path().to_str().unwrap()).unwrap();
        let window = Window::new(&dev, 4, 5, "part".into()).unwrap();
        assert_eq!(window.info().unwrap().block_count, 2);
        assert_eq!(window.topological_path(), "part");

        window.write_at(0, &[7u8; 1024]).unwrap();
        window.write_at(1, &[7u8; 1024]).unwrap_err();
        let mut buf = [0u8; 512];
        dev.read_at(4 * 512, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
        dev.read_at(6 * 512, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 512]);

        zero_range(&window, 512, 512).unwrap();
        dev.read_at(5 * 512, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 512]);

        Window::new(&dev, 5, 4, "bad".into()).unwrap_err();
        Window::new(&dev, 10, 16, "bad".into()).unwrap_err();
    }
}
