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

//! In-memory disks and device discovery for tests.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::rc::Rc;

use crate::blockdev::{BlockDevice, BlockInfo};
use crate::platform::{DiskEntry, Platform};

const CHUNK: u64 = 64 * 1024;

#[derive(Debug, Default)]
struct State {
    chunks: HashMap<u64, Vec<u8>>,
    writes: usize,
    flushes: usize,
    rescans: usize,
}

/// Sparse in-memory disk.  Clones share contents, so a test can keep a
/// handle while the code under test owns another.
#[derive(Debug, Clone)]
pub struct MemDisk {
    info: BlockInfo,
    path: String,
    state: Rc<RefCell<State>>,
}

impl MemDisk {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            info: BlockInfo {
                block_size,
                block_count,
                removable: false,
            },
            path: "/dev/mem0".into(),
            state: Default::default(),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.into();
        self
    }

    pub fn removable(mut self, removable: bool) -> Self {
        self.info.removable = removable;
        self
    }

    /// Copy a whole file into a new disk.
    pub fn from_file(f: &mut File, block_size: u32) -> Self {
        let mut data = Vec::new();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut data).unwrap();
        let disk = Self::new(block_size, data.len() as u64 / block_size as u64);
        disk.write_at(0, &data).unwrap();
        disk.state.borrow_mut().writes = 0;
        disk
    }

    fn size(&self) -> u64 {
        self.info.size_bytes()
    }

    pub fn read_range(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf).unwrap();
        buf
    }

    pub fn contents(&self) -> Vec<u8> {
        self.read_range(0, self.size() as usize)
    }

    pub fn writes(&self) -> usize {
        self.state.borrow().writes
    }

    pub fn flushes(&self) -> usize {
        self.state.borrow().flushes
    }

    pub fn rescans(&self) -> usize {
        self.state.borrow().rescans
    }
}

fn bounds(offset: u64, len: usize, size: u64) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("access at {}+{} beyond {}", offset, len, size),
        )),
    }
}

impl BlockDevice for MemDisk {
    fn info(&self) -> io::Result<BlockInfo> {
        Ok(self.info)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        bounds(offset, buf.len(), self.size())?;
        let state = self.state.borrow();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let within = (pos % CHUNK) as usize;
            let n = (buf.len() - done).min(CHUNK as usize - within);
            match state.chunks.get(&(pos / CHUNK)) {
                Some(chunk) => buf[done..done + n].copy_from_slice(&chunk[within..within + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        bounds(offset, buf.len(), self.size())?;
        let mut state = self.state.borrow_mut();
        state.writes += 1;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let within = (pos % CHUNK) as usize;
            let n = (buf.len() - done).min(CHUNK as usize - within);
            let data = &buf[done..done + n];
            let chunk = state.chunks.entry(pos / CHUNK);
            // don't materialize chunks for zeroes
            if data.iter().any(|b| *b != 0) {
                chunk.or_insert_with(|| vec![0; CHUNK as usize])[within..within + n]
                    .copy_from_slice(data);
            } else if let std::collections::hash_map::Entry::Occupied(mut c) = chunk {
                c.get_mut()[within..within + n].fill(0);
            }
            done += n;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.state.borrow_mut().flushes += 1;
        Ok(())
    }

    fn topological_path(&self) -> String {
        self.path.clone()
    }

    fn rescan_partitions(&self) -> io::Result<()> {
        self.state.borrow_mut().rescans += 1;
        Ok(())
    }
}

/// A fixed set of in-memory disks.
#[derive(Debug, Default)]
pub struct MemPlatform {
    disks: Vec<(DiskEntry, MemDisk)>,
}

impl MemPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_disk(&mut self, disk: MemDisk, whole_disk: bool) {
        let entry = DiskEntry {
            path: disk.topological_path(),
            removable: disk.info.removable,
            whole_disk,
        };
        self.disks.push((entry, disk));
    }
}

impl Platform for MemPlatform {
    fn disks(&self) -> Result<Vec<DiskEntry>> {
        Ok(self.disks.iter().map(|(e, _)| e.clone()).collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn BlockDevice>> {
        match self.disks.iter().find(|(e, _)| e.path == path) {
            Some((_, disk)) => Ok(Box::new(disk.clone())),
            None => bail!("no such disk {}", path),
        }
    }
}
