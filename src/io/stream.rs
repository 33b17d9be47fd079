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

use std::io::Read;

use super::{read_full, FifoClient, StagingBuffer};
use crate::errors::{PaveError, Result};
use crate::sparse::Extent;

/// Copy `source` to the start of the device behind `client` until EOF.
/// Returns the number of bytes written.
pub fn stream_partition(
    source: &mut (impl Read + ?Sized),
    client: &mut FifoClient,
    staging: &mut StagingBuffer,
) -> Result<u64> {
    let mut offset = 0;
    loop {
        let len = read_full(source, staging.as_mut_slice())?;
        if len == 0 {
            return Ok(offset);
        }
        client.write(staging, len, offset)?;
        offset += len as u64;
    }
}

/// Copy one extent's payload from `source` to its slice offset, then fill
/// the rest of its slices with zeroes.
pub fn stream_extent(
    source: &mut (impl Read + ?Sized),
    extent: &Extent,
    slice_size: u64,
    client: &mut FifoClient,
    staging: &mut StagingBuffer,
) -> Result<()> {
    extent
        .slice_start
        .checked_add(extent.slice_count)
        .and_then(|end| end.checked_mul(slice_size))
        .ok_or_else(|| out_of_range(extent))?;
    let mut offset = extent.slice_start * slice_size;
    // slice tail omitted from the image
    let mut zeroes = extent
        .slice_count
        .checked_mul(slice_size)
        .and_then(|capacity| capacity.checked_sub(extent.length))
        .ok_or_else(|| out_of_range(extent))?;
    let mut left = extent.length;
    while left > 0 {
        let want = left.min(staging.len() as u64) as usize;
        let len = read_full(source, &mut staging.as_mut_slice()[..want])?;
        if len == 0 {
            return Err(PaveError::UnexpectedEof(format!(
                "image ended with {} bytes of extent at slice {} left",
                left, extent.slice_start
            )));
        }
        client.write(staging, len, offset)?;
        offset += len as u64;
        left -= len as u64;
    }

    if zeroes > 0 {
        staging.as_mut_slice().fill(0);
    }
    while zeroes > 0 {
        let len = zeroes.min(staging.len() as u64) as usize;
        client.write(staging, len, offset)?;
        offset += len as u64;
        zeroes -= len as u64;
    }
    Ok(())
}

fn out_of_range(extent: &Extent) -> PaveError {
    PaveError::Format(format!(
        "extent of {} bytes in {} slices at slice {} is out of range",
        extent.length, extent.slice_count, extent.slice_start
    ))
}
