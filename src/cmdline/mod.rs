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

use clap::Parser;

mod config;

pub use self::config::*;

// Args are listed in --help in the order declared in these structs/enums.
// Please keep the entire help text to 80 columns.

/// Write boot and system images to the local disk
#[derive(Debug, Parser)]
#[command(name = "install-disk-image")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
#[command(disable_help_subcommand = true)]
#[command(help_expected = true)]
pub enum Cmd {
    /// Unpack a sparse FVM image into the FVM partition
    InstallFvm(InstallConfig),
    /// Write a bootloader image to the EFI partition
    InstallEfi(InstallConfig),
    /// Write a kernel image to the ChromeOS KERN-C partition
    InstallKernc(InstallConfig),
    /// Remove system, data, blobfs and FVM partitions
    Wipe(WipeConfig),
}
