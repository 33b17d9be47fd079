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

use super::{GptDevice, GPT_ENTRY_ARRAY_SIZE};
use crate::blockdev::BlockDevice;
use crate::errors::{PaveError, Result};

/// Blocks at the front of the disk holding the protective MBR, the header
/// and the entry array.  The back of the disk holds one block less, since
/// the backup copy has no MBR.
pub fn reserved_blocks(block_size: u32) -> u64 {
    let bs = block_size as u64;
    (GPT_ENTRY_ARRAY_SIZE + 2 * bs) / bs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    pub start: u64,
    /// Size of the whole gap, which may exceed the request.
    pub blocks: u64,
}

/// Find the first gap of at least `bytes` in the table.  The whole gap is
/// returned; callers decide how much of it to use.
pub fn find_first_fit<D: BlockDevice>(
    gpt: &GptDevice<D>,
    block_size: u32,
    block_count: u64,
    bytes: u64,
) -> Result<FreeRange> {
    let bs = block_size as u64;
    let wanted = (bytes + bs - 1) / bs;
    let reserved = reserved_blocks(block_size);
    if block_count < 2 * reserved {
        return Err(PaveError::InvalidArgs(format!(
            "device of {} blocks has no room for partitions",
            block_count
        )));
    }

    // (start, length), with both reserved regions as pseudo-partitions
    let mut ranges = vec![
        (0, reserved),
        (block_count - (reserved - 1), reserved - 1),
    ];
    ranges.extend(gpt.partitions().map(|(_, e)| (e.first, e.blocks())));
    ranges.sort_unstable();

    for pair in ranges.windows(2) {
        let next = pair[0].0 + pair[0].1;
        let following = pair[1].0;
        if next > following {
            return Err(PaveError::CorruptTable(format!(
                "range ending at block {} overlaps range starting at {}",
                next, following
            )));
        }
        let free = following - next;
        if free >= wanted {
            return Ok(FreeRange {
                start: next,
                blocks: free,
            });
        }
    }
    Err(PaveError::NotFound(format!(
        "no gap of {} blocks in partition table",
        wanted
    )))
}
