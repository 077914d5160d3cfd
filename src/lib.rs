// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
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

//! EPC page lifecycle and reclamation for SGX enclaves.
//!
//! The crate owns the enclave page cache: the physical sections and their free
//! lists, every enclave's page directory and address-space bindings, and the
//! background reclaimer that writes cold pages out to backing storage through
//! the block/track/write-back protocol.

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod logging;
#[macro_use]
pub mod error;

pub mod arch;
pub mod config;
pub mod consts;
pub mod cpumask;
pub mod enclave;
mod epc;
pub mod fault;
pub mod intervaltree;
pub mod memory;
pub mod mm;
pub mod reclaim;
pub mod signal;
pub mod stats;
mod workqueue;

#[cfg(test)]
mod testutil;

pub use config::{EpcConfig, EpcSectionConfig};
pub use enclave::{Enclave, EnclaveFlags, EnclaveRef};
pub use epc::{Epc, PmEvent};
pub use error::{EpcError, EpcErrorNum, EpcResult, ErrorClass};
pub use mm::AddressSpace;
pub use reclaim::swapd::Ksgxswapd;
