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
use clap::Parser;
use std::fs::OpenOptions;
use std::io::{self, Read};

use libpaver::catalog::PartitionKind;
use libpaver::platform::{Devices, HostPlatform};
use libpaver::{cmdline, pave};

use cmdline::*;

fn main() -> Result<()> {
    match Cmd::parse() {
        Cmd::InstallFvm(c) => install(c, |d, r| pave::install_fvm(d, r)),
        Cmd::InstallEfi(c) => install(c, |d, r| {
            pave::install_partition(d, PartitionKind::Efi, r)
        }),
        Cmd::InstallKernc(c) => install(c, |d, r| {
            pave::install_partition(d, PartitionKind::KernC, r)
        }),
        Cmd::Wipe(c) => {
            let c = c.expand_config_files()?;
            let devices = Devices::new(HostPlatform::new(c.device.clone()), c.bind_timeout());
            pave::wipe(&devices)
        }
    }
}

fn install<F>(config: InstallConfig, f: F) -> Result<()>
where
    F: FnOnce(&Devices<HostPlatform>, &mut dyn Read) -> Result<()>,
{
    let config = config.expand_config_files()?;
    let devices = Devices::new(
        HostPlatform::new(config.device.clone()),
        config.bind_timeout(),
    );
    match &config.file {
        Some(path) => {
            let mut source = OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("opening {}", path))?;
            f(&devices, &mut source)
        }
        None => f(&devices, &mut io::stdin().lock()),
    }
}
