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

//! Request/response block transport.  A client registers one buffer with
//! the device, allocates a transaction id, and then issues requests that
//! name the buffer by id.  Each request completes before the next is sent.

use std::io::{self, ErrorKind};

use super::StagingBuffer;
use crate::blockdev::BlockDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    Flush,
}

/// Offsets and lengths are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub opcode: Opcode,
    pub txn: TxnId,
    pub buffer: BufferId,
    pub length: u64,
    pub buffer_offset: u64,
    pub dev_offset: u64,
}

pub trait BlockFifo {
    /// Register a buffer of `len` bytes for use in later requests.
    fn attach_buffer(&mut self, len: usize) -> io::Result<BufferId>;
    fn detach_buffer(&mut self, buffer: BufferId) -> io::Result<()>;
    fn alloc_txn(&mut self) -> io::Result<TxnId>;
    fn free_txn(&mut self, txn: TxnId);
    /// Execute one request against `buffer`, the memory registered under
    /// `request.buffer`, and wait for its completion.
    fn transact(&mut self, request: &BlockRequest, buffer: &mut [u8]) -> io::Result<()>;
}

/// Transport that executes requests directly against a `BlockDevice`.
pub struct DeviceFifo<'a, D: ?Sized> {
    dev: &'a D,
    buffers: Vec<Option<usize>>,
    txns: Vec<bool>,
}

impl<'a, D: BlockDevice + ?Sized> DeviceFifo<'a, D> {
    pub fn new(dev: &'a D) -> Self {
        Self {
            dev,
            buffers: Vec::new(),
            txns: Vec::new(),
        }
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.to_string())
}

impl<D: BlockDevice + ?Sized> BlockFifo for DeviceFifo<'_, D> {
    fn attach_buffer(&mut self, len: usize) -> io::Result<BufferId> {
        let slot = match self.buffers.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.buffers.push(None);
                self.buffers.len() - 1
            }
        };
        let id = u16::try_from(slot).map_err(|_| invalid("too many attached buffers"))?;
        self.buffers[slot] = Some(len);
        Ok(BufferId(id))
    }

    fn detach_buffer(&mut self, buffer: BufferId) -> io::Result<()> {
        match self.buffers.get_mut(buffer.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(invalid("detaching unknown buffer")),
        }
    }

    fn alloc_txn(&mut self) -> io::Result<TxnId> {
        let slot = match self.txns.iter().position(|used| !used) {
            Some(slot) => slot,
            None => {
                self.txns.push(false);
                self.txns.len() - 1
            }
        };
        let id = u16::try_from(slot).map_err(|_| invalid("too many transactions"))?;
        self.txns[slot] = true;
        Ok(TxnId(id))
    }

    fn free_txn(&mut self, txn: TxnId) {
        if let Some(used) = self.txns.get_mut(txn.0 as usize) {
            *used = false;
        }
    }

    fn transact(&mut self, request: &BlockRequest, buffer: &mut [u8]) -> io::Result<()> {
        if !self.txns.get(request.txn.0 as usize).copied().unwrap_or(false) {
            return Err(invalid("request names an unallocated transaction"));
        }
        let registered = self
            .buffers
            .get(request.buffer.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| invalid("request names an unattached buffer"))?;
        if registered != buffer.len() {
            return Err(invalid("buffer doesn't match its registration"));
        }
        if request.opcode == Opcode::Flush {
            return self.dev.flush();
        }
        let start = request.buffer_offset as usize;
        let range = start
            .checked_add(request.length as usize)
            .filter(|end| *end <= buffer.len())
            .map(|end| start..end)
            .ok_or_else(|| invalid("request exceeds buffer"))?;
        match request.opcode {
            Opcode::Read => self.dev.read_at(request.dev_offset, &mut buffer[range]),
            Opcode::Write => self.dev.write_at(request.dev_offset, &buffer[range]),
            Opcode::Flush => unreachable!(),
        }
    }
}

/// A registered buffer and transaction on some device's transport.
/// Dropping the client detaches both.
pub struct FifoClient<'a> {
    fifo: Box<dyn BlockFifo + 'a>,
    buffer: BufferId,
    txn: TxnId,
}

impl<'a> FifoClient<'a> {
    pub fn register<D: BlockDevice + ?Sized>(
        dev: &'a D,
        staging: &StagingBuffer,
    ) -> io::Result<Self> {
        let mut fifo = dev.attach_fifo()?;
        let buffer = fifo.attach_buffer(staging.len())?;
        let txn = match fifo.alloc_txn() {
            Ok(txn) => txn,
            Err(e) => {
                // best effort; the original error is more useful
                let _ = fifo.detach_buffer(buffer);
                return Err(e);
            }
        };
        Ok(Self { fifo, buffer, txn })
    }

    /// Write the first `length` bytes of the staging buffer at `dev_offset`.
    pub fn write(
        &mut self,
        staging: &mut StagingBuffer,
        length: usize,
        dev_offset: u64,
    ) -> io::Result<()> {
        let request = BlockRequest {
            opcode: Opcode::Write,
            txn: self.txn,
            buffer: self.buffer,
            length: length as u64,
            buffer_offset: 0,
            dev_offset,
        };
        self.fifo.transact(&request, staging.as_mut_slice())
    }

    pub fn flush(&mut self, staging: &mut StagingBuffer) -> io::Result<()> {
        let request = BlockRequest {
            opcode: Opcode::Flush,
            txn: self.txn,
            buffer: self.buffer,
            length: 0,
            buffer_offset: 0,
            dev_offset: 0,
        };
        self.fifo.transact(&request, staging.as_mut_slice())
    }
}

impl Drop for FifoClient<'_> {
    fn drop(&mut self) {
        self.fifo.free_txn(self.txn);
        let _ = self.fifo.detach_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemDisk;

    #[test]
    fn client_writes_through_registered_buffer() {
        let disk = MemDisk::new(512, 16);
        let mut staging = StagingBuffer::new(2048);
        staging.as_mut_slice()[..4].copy_from_slice(b"abcd");
        {
            let mut client = FifoClient::register(&disk, &staging).unwrap();
            client.write(&mut staging, 4, 1024).unwrap();
            client.write(&mut staging, 4096, 0).unwrap_err();
            client.flush(&mut staging).unwrap();
        }
        assert_eq!(&disk.contents()[1024..1028], b"abcd");
        assert_eq!(disk.flushes(), 1);

        // mismatched buffer is refused
        let mut other = StagingBuffer::new(512);
        let mut client = FifoClient::register(&disk, &staging).unwrap();
        client.write(&mut other, 4, 0).unwrap_err();
    }

    #[test]
    fn ids_are_recycled() {
        let disk = MemDisk::new(512, 16);
        let mut fifo = DeviceFifo::new(&disk);
        let a = fifo.attach_buffer(16).unwrap();
        let b = fifo.attach_buffer(16).unwrap();
        assert_ne!(a, b);
        fifo.detach_buffer(a).unwrap();
        fifo.detach_buffer(a).unwrap_err();
        assert_eq!(fifo.attach_buffer(32).unwrap(), a);

        let t = fifo.alloc_txn().unwrap();
        fifo.free_txn(t);
        let request = BlockRequest {
            opcode: Opcode::Write,
            txn: t,
            buffer: b,
            length: 1,
            buffer_offset: 0,
            dev_offset: 0,
        };
        fifo.transact(&request, &mut [0u8; 16]).unwrap_err();
        assert_eq!(fifo.alloc_txn().unwrap(), t);
        fifo.transact(&request, &mut [0u8; 16]).unwrap();
    }
}
