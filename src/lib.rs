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

//! Paving boot and system images onto a local disk: GPT partitions,
//! the FVM volume manager and the sparse image format unpacked into it.

pub mod blockdev;
pub mod catalog;
pub mod cmdline;
pub mod errors;
pub mod fvm;
pub mod gpt;
pub mod io;
pub mod pave;
pub mod platform;
pub mod sparse;

#[cfg(test)]
mod testing;
