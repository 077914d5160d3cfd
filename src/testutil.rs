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


//! Fixtures shared by the unit tests: an EPC on the software backend and a
//! process to map enclaves into.

use alloc::sync::Arc;
use core::time::Duration;

use crate::arch::soft::SoftEncls;
use crate::config::{EpcConfig, EpcSectionConfig};
use crate::enclave::sgx::{
    SgxAttributeFlags, SgxEinitToken, SgxEnclPageFlags, SgxEnclPageType, SgxSecInfo, SgxSecs,
    Sha256Value, SigStruct,
};
use crate::enclave::{Enclave, EnclaveRef};
use crate::epc::Epc;
use crate::error::EpcResult;
use crate::memory::PAGE_SIZE;
use crate::mm::AddressSpace;
use crate::signal::Signal;

pub const BASE: usize = 0x10_0000;
const EPC_PHYS: u64 = 0x8000_0000;
const EPC_VIRT: u64 = 0xffff_8000_8000_0000;

pub fn config(pages: usize) -> EpcConfig {
    EpcConfig::new(vec![EpcSectionConfig::new(
        EPC_PHYS,
        EPC_VIRT,
        (pages * PAGE_SIZE) as u64,
    )])
    .with_alloc_retry(4, Duration::from_millis(1))
    .with_einit_retry(2, 2, Duration::from_millis(1))
}

pub fn reg_secinfo() -> SgxSecInfo {
    SgxSecInfo::new(SgxEnclPageFlags::R | SgxEnclPageFlags::W, SgxEnclPageType::REG)
}

pub struct Fixture {
    pub epc: Arc<Epc>,
    pub encls: Arc<SoftEncls>,
    pub mm: Arc<AddressSpace>,
}

impl Fixture {
    pub fn new(pages: usize) -> Self {
        Self::with_config(config(pages))
    }

    pub fn with_config(config: EpcConfig) -> Self {
        crate::logging::init();
        let encls = SoftEncls::new_arc();
        Self {
            epc: Epc::new(config, encls.clone()).unwrap(),
            encls,
            mm: AddressSpace::new(),
        }
    }

    /// Map `size` bytes at `base` and create an enclave there.
    pub fn create(&self, base: usize, size: usize) -> EnclaveRef {
        self.mm.mmap_enclave(base..base + size).unwrap();
        let secs = SgxSecs::new(base as u64, size as u64, SgxAttributeFlags::MODE64BIT, 0x3);
        Enclave::create(&self.epc, &self.mm, &secs).unwrap()
    }

    /// Queue a measured page filled with `fill` at `addr`.
    pub fn add(&self, encl: &EnclaveRef, addr: usize, fill: u8) {
        encl.add_page(addr, &[fill; PAGE_SIZE], &reg_secinfo(), 0xffff)
            .unwrap();
    }

    /// A SIGSTRUCT matching what was measured so far.
    pub fn sigstruct(&self, encl: &EnclaveRef) -> SigStruct {
        encl.work.flush();
        let mut sig = SigStruct::default();
        let secs_page = encl.secs_page().unwrap();
        sig.body.mr_enclave = Sha256Value(self.encls.measurement(secs_page).unwrap());
        sig
    }

    pub fn init(&self, encl: &EnclaveRef) -> EpcResult {
        let sig = self.sigstruct(encl);
        encl.init(&sig, &SgxEinitToken::default(), &Signal::new())
    }

    /// An initialized enclave of `size` bytes at `base` with `pages` pages
    /// added from the bottom.
    pub fn build(&self, base: usize, size: usize, pages: usize) -> EnclaveRef {
        let encl = self.create(base, size);
        for i in 0..pages {
            self.add(&encl, base + i * PAGE_SIZE, i as u8 + 1);
        }
        self.init(&encl).unwrap();
        encl
    }
}
