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
use byte_unit::Byte;
use std::collections::HashSet;
use std::io::Read;
use uuid::Uuid;

use super::{AllocRequest, VolumeManager};
use crate::errors::PaveError;
use crate::gpt::GUID_FVM;
use crate::io::{stream_extent, FifoClient, StagingBuffer};
use crate::platform::{Devices, Platform};
use crate::sparse::{PartitionDescriptor, SparseHeader};

/// A partition from the image and the volumes it replaces.
struct Plan<'a> {
    descriptor: &'a PartitionDescriptor,
    old: Option<Uuid>,
    new: Uuid,
}

/// Unpack a sparse image from `source` into the volume manager on the
/// FVM partition, replacing volumes of the same types.
///
/// New volumes stay inactive until all of them are written, so an
/// interrupted unpack leaves the previous volumes in place.
pub fn fvm_stream_partitions<P: Platform>(
    devices: &Devices<P>,
    source: &mut (impl Read + ?Sized),
) -> Result<()> {
    let header = SparseHeader::read_from(source).context("reading image header")?;
    eprintln!(
        "Image header validated: {} partitions, {} slices",
        header.partition_count,
        format_bytes(header.slice_size)
    );

    let part = devices
        .find_partition(None, Some(GUID_FVM))?
        .filter(|p| !p.is_volume())
        .ok_or_else(|| PaveError::NotFound("no FVM partition in the partition table".into()))?;
    let mut fvm = devices.bind_fvm(&part, header.slice_size)?;
    let info = fvm.info();
    if info.slice_size != header.slice_size {
        return Err(PaveError::GeometryMismatch(format!(
            "volume manager has {}-byte slices, image has {}-byte slices",
            info.slice_size, header.slice_size
        ))
        .into());
    }

    let descriptors = header
        .read_partitions(source)
        .context("reading image metadata")?;

    // look for conflicts before allocating anything
    let fvm_path = format!("{}/", fvm.topological_path());
    let mut claimed = HashSet::new();
    let mut plans = Vec::with_capacity(descriptors.len());
    for descriptor in &descriptors {
        let old = match devices.find_partition(None, Some(descriptor.type_guid))? {
            Some(old) if !old.is_volume() => {
                return Err(PaveError::ConflictingPartition(format!(
                    "{} has the type of {} but lives in the partition table",
                    old.topological_path, descriptor.name
                ))
                .into())
            }
            Some(old) if !old.topological_path.starts_with(&fvm_path) => {
                return Err(PaveError::ConflictingPartition(format!(
                    "{} has the type of {} but lives outside {}",
                    old.topological_path,
                    descriptor.name,
                    fvm.topological_path()
                ))
                .into())
            }
            // two image partitions of one type replace it only once
            Some(old) if claimed.insert(old.instance_guid) => Some(old.instance_guid),
            _ => None,
        };
        plans.push(Plan {
            descriptor,
            old,
            new: Uuid::new_v4(),
        });
    }

    for plan in &plans {
        let descriptor = plan.descriptor;
        let first = &descriptor.extents[0];
        eprintln!(
            "Allocating partition {} consisting of {} slices",
            descriptor.name, first.slice_count
        );
        fvm.allocate_partition(&AllocRequest {
            type_guid: descriptor.type_guid,
            instance_guid: plan.new,
            name: descriptor.name.clone(),
            slice_count: first.slice_count,
            inactive: true,
        })
        .with_context(|| format!("allocating partition {}", descriptor.name))?;
        for extent in &descriptor.extents[1..] {
            eprintln!(
                "Extending partition {} at slice {} by {} slices",
                descriptor.name, extent.slice_start, extent.slice_count
            );
            fvm.extend_partition(plan.new, extent.slice_start, extent.slice_count)
                .with_context(|| format!("extending partition {}", descriptor.name))?;
        }
    }
    eprintln!("Partition space pre-allocated");

    let mut staging = StagingBuffer::default();
    for plan in &plans {
        let descriptor = plan.descriptor;
        eprintln!(
            "Streaming partition {} ({})",
            descriptor.name,
            format_bytes(descriptor.payload_length())
        );
        let volume = fvm.open_partition(plan.new)?;
        let mut client = FifoClient::register(&*volume, &staging)
            .with_context(|| format!("registering block I/O for {}", descriptor.name))?;
        for extent in &descriptor.extents {
            stream_extent(source, extent, header.slice_size, &mut client, &mut staging)
                .with_context(|| {
                    format!(
                        "streaming slice {} of partition {}",
                        extent.slice_start, descriptor.name
                    )
                })?;
        }
        client
            .flush(&mut staging)
            .with_context(|| format!("flushing partition {}", descriptor.name))?;
    }

    for plan in &plans {
        fvm.upgrade(plan.old, plan.new)
            .with_context(|| format!("activating partition {}", plan.descriptor.name))?;
        if let Some(old) = plan.old {
            fvm.destroy_partition(old)
                .with_context(|| format!("destroying old partition {}", plan.descriptor.name))?;
        }
    }
    eprintln!("Volume manager populated");
    Ok(())
}

/// Byte count in the largest binary unit that fits.
pub fn format_bytes(n: u64) -> String {
    Byte::from_bytes(n as u128)
        .get_appropriate_unit(true)
        .format(1)
}
