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

use bincode::Options;
use std::io::{self, ErrorKind, Read};

mod fifo;
mod stream;

pub use self::fifo::*;
pub use self::stream::*;

/// Size of the buffer shared with the block transport while streaming.
pub const STAGING_BUFFER_SIZE: usize = 1024 * 1024;

/// Memory registered with a device's block transport.  One is created per
/// install and reused across partitions; it's released when dropped.
#[derive(Debug)]
pub struct StagingBuffer {
    data: Vec<u8>,
}

impl StagingBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for StagingBuffer {
    fn default() -> Self {
        Self::new(STAGING_BUFFER_SIZE)
    }
}

/// Read until `buf` is full or the reader is exhausted, returning the
/// number of bytes read.  Unlike `read_exact()`, a short count isn't an
/// error.
pub fn read_full(reader: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Provides uniform bincode options for all our on-disk structures.
pub fn bincoder() -> impl bincode::Options {
    bincode::options()
        .allow_trailing_bytes()
        .with_no_limit()
        .with_little_endian()
        .with_fixint_encoding()
}
