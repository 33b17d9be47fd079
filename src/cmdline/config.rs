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

//! Struct definitions and config file support for the subcommands.

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::time::Duration;

// Args are listed in --help in the order declared in these structs/enums.
// Please keep the entire help text to 80 columns.

/// How long to wait for partitions and volume managers by default.
pub const DEFAULT_BIND_TIMEOUT_SECS: u64 = 5;

// These structs also deserialize from YAML config files, with keys being
// the long option names.  Every field except config-file is an Option so
// config files and the command line can be layered: later files override
// earlier ones, and the command line overrides them all.
#[derive(Debug, Default, Parser, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
#[command(args_override_self = true)]
pub struct InstallConfig {
    /// YAML config file with options
    ///
    /// Load additional config options from the specified YAML config file.
    /// Later config files override earlier ones, and command-line options
    /// override config files.  Config file keys are long option names
    /// without the leading "--".
    #[serde(skip)]
    #[arg(short, long, value_name = "path")]
    pub config_file: Vec<String>,
    /// Image file to install
    ///
    /// Read the image from the specified file instead of standard input.
    #[arg(short, long, value_name = "path")]
    pub file: Option<String>,
    /// Install to this disk
    ///
    /// Use the specified block device or disk image instead of the first
    /// fixed disk on the system.
    #[arg(short, long, value_name = "path")]
    pub device: Option<String>,
    /// Seconds to wait for partitions to appear
    #[arg(long, value_name = "secs")]
    pub bind_timeout: Option<u64>,
}

#[derive(Debug, Default, Parser, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
#[command(args_override_self = true)]
pub struct WipeConfig {
    /// YAML config file with options
    ///
    /// Load additional config options from the specified YAML config file.
    /// Later config files override earlier ones, and command-line options
    /// override config files.
    #[serde(skip)]
    #[arg(short, long, value_name = "path")]
    pub config_file: Vec<String>,
    /// Wipe this disk
    ///
    /// Use the specified block device or disk image instead of the first
    /// fixed disk on the system.
    #[arg(short, long, value_name = "path")]
    pub device: Option<String>,
    /// Seconds to wait for partitions to appear
    #[arg(long, value_name = "secs")]
    pub bind_timeout: Option<u64>,
}

fn read_config_files<T: DeserializeOwned>(paths: &[String]) -> Result<Vec<T>> {
    paths
        .iter()
        .map(|path| {
            serde_yaml::from_reader(
                OpenOptions::new()
                    .read(true)
                    .open(path)
                    .with_context(|| format!("opening config file {path}"))?,
            )
            .with_context(|| format!("parsing config file {path}"))
        })
        .collect()
}

fn bind_timeout(secs: Option<u64>) -> Duration {
    Duration::from_secs(secs.unwrap_or(DEFAULT_BIND_TIMEOUT_SECS))
}

impl InstallConfig {
    /// Fold in the config files named on the command line.
    pub fn expand_config_files(self) -> Result<Self> {
        let files: Vec<Self> = read_config_files(&self.config_file)?;
        Ok(files
            .into_iter()
            .chain(std::iter::once(self))
            .fold(Self::default(), |base, over| base.merge(over)))
    }

    fn merge(self, over: Self) -> Self {
        Self {
            config_file: over.config_file,
            file: over.file.or(self.file),
            device: over.device.or(self.device),
            bind_timeout: over.bind_timeout.or(self.bind_timeout),
        }
    }

    pub fn bind_timeout(&self) -> Duration {
        bind_timeout(self.bind_timeout)
    }
}

impl WipeConfig {
    /// Fold in the config files named on the command line.
    pub fn expand_config_files(self) -> Result<Self> {
        let files: Vec<Self> = read_config_files(&self.config_file)?;
        Ok(files
            .into_iter()
            .chain(std::iter::once(self))
            .fold(Self::default(), |base, over| base.merge(over)))
    }

    fn merge(self, over: Self) -> Self {
        Self {
            config_file: over.config_file,
            device: over.device.or(self.device),
            bind_timeout: over.bind_timeout.or(self.bind_timeout),
        }
    }

    pub fn bind_timeout(&self) -> Duration {
        bind_timeout(self.bind_timeout)
    }
}
