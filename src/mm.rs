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

//! Host address spaces that map enclaves.
//!
//! An `AddressSpace` stands in for a process: its VMAs, the translations
//! installed for enclave pages with their accessed bits, and the CPUs it ran
//! on. Enclave VMAs carry the enclave reference and the address-space binding
//! taken when the mapping was opened.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, RwLock, RwLockReadGuard};

use crate::cpumask::CpuMask;
use crate::enclave::mm_list::MmRef;
use crate::enclave::{Enclave, EnclaveRef};
use crate::error::EpcResult;
use crate::intervaltree::IntervalTree;
use crate::memory::addr::{align_down, is_aligned};

static NEXT_MM_ID: AtomicUsize = AtomicUsize::new(1);

/// An enclave mapping.
#[derive(Default)]
pub struct Vma {
    /// Dropped before `encl`: releasing a binding touches the enclave.
    pub(crate) binding: Option<MmRef>,
    pub(crate) encl: Option<EnclaveRef>,
}

impl Vma {
    pub fn enclave(&self) -> Option<&EnclaveRef> {
        self.encl.as_ref()
    }
}

#[derive(Debug, Clone, Copy)]
struct Pte {
    pfn: usize,
    young: bool,
}

pub struct AddressSpace {
    id: usize,
    /// Users of the address space. Zero once it started tearing down.
    mm_count: AtomicUsize,
    mmap: RwLock<IntervalTree<Vma>>,
    ptes: Mutex<BTreeMap<usize, Pte>>,
    cpumask: Mutex<CpuMask>,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MM_ID.fetch_add(1, Ordering::Relaxed),
            mm_count: AtomicUsize::new(1),
            mmap: RwLock::new(IntervalTree::new()),
            ptes: Mutex::new(BTreeMap::new()),
            cpumask: Mutex::new(CpuMask::default()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn mmgrab_unless_zero(&self) -> bool {
        let mut cnt = self.mm_count.load(Ordering::Acquire);
        loop {
            if cnt == 0 {
                return false;
            }
            match self.mm_count.compare_exchange_weak(
                cnt,
                cnt + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) => cnt = cur,
            }
        }
    }

    pub fn mmdrop(&self) {
        self.mm_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mm_count(&self) -> usize {
        self.mm_count.load(Ordering::Acquire)
    }

    pub(crate) fn mmap_read(&self) -> RwLockReadGuard<'_, IntervalTree<Vma>> {
        self.mmap.read()
    }

    /// Reserve `range` for an enclave that has not been created yet.
    pub fn mmap_enclave(&self, range: Range<usize>) -> EpcResult {
        if !is_aligned(range.start) || !is_aligned(range.end) {
            return epc_result_err!(EINVAL, format!("Unaligned mapping {:#x?}", range));
        }
        self.mmap.write().insert(range, Vma::default())
    }

    /// Hook the enclave up to the VMA at `base`, which must span exactly
    /// `range` and have no enclave yet.
    pub(crate) fn attach_enclave(
        &self,
        range: Range<usize>,
        encl: EnclaveRef,
        binding: MmRef,
    ) -> EpcResult {
        let mut mmap = self.mmap.write();
        match mmap.find_mut(range.start) {
            Some((r, vma)) if *r == range && vma.encl.is_none() => {
                vma.binding = Some(binding);
                vma.encl = Some(encl);
                Ok(())
            }
            Some((r, _)) => epc_result_err!(
                EINVAL,
                format!("VMA {:#x?} does not match enclave {:#x?}", r, range)
            ),
            None => epc_result_err!(EINVAL, format!("No VMA at {:#x}", range.start)),
        }
    }

    /// Copy the enclave VMA starting at `start` from `parent`, as fork does.
    pub fn dup_vma(self: &Arc<Self>, parent: &AddressSpace, start: usize) -> EpcResult {
        let (range, encl) = {
            let mmap = parent.mmap.read();
            match mmap.find(start) {
                Some((range, vma)) if range.start == start => (range.clone(), vma.encl.clone()),
                _ => return epc_result_err!(EINVAL, format!("No VMA at {:#x}", start)),
            }
        };
        let mut vma = Vma::default();
        if let Some(encl) = encl {
            match encl.vma_open(self) {
                Some(binding) => {
                    vma.binding = Some(binding);
                    vma.encl = Some(encl);
                }
                // Dead: the copy maps nothing.
                None => drop(encl),
            }
        }
        self.mmap.write().insert(range, vma)
    }

    /// Remove the VMA starting at `start` and its translations.
    pub fn munmap(&self, start: usize) -> EpcResult {
        let vma = {
            let mut mmap = self.mmap.write();
            match mmap.remove(start) {
                Some((range, vma)) => {
                    self.ptes.lock().retain(|addr, _| !range.contains(addr));
                    vma
                }
                None => return epc_result_err!(EINVAL, format!("No VMA at {:#x}", start)),
            }
        };
        Enclave::vma_close(vma);
        Ok(())
    }

    /// Process exit: stop new users, then unmap everything.
    pub fn exit(&self) {
        self.mmdrop();
        let vmas: Vec<_> = {
            let mut mmap = self.mmap.write();
            let starts = mmap.starts();
            starts.into_iter().filter_map(|s| mmap.remove(s)).collect()
        };
        self.ptes.lock().clear();
        for (_, vma) in vmas {
            Enclave::vma_close(vma);
        }
    }

    /// Enclave of the VMA covering `addr`. `Err` when no VMA covers it,
    /// `Ok(None)` when the VMA has no enclave yet.
    pub fn find_enclave(&self, addr: usize) -> EpcResult<Option<EnclaveRef>> {
        match self.mmap.read().find(addr) {
            Some((_, vma)) => Ok(vma.encl.clone()),
            None => epc_result_err!(EINVAL, format!("No VMA covers {:#x}", addr)),
        }
    }

    /// An access from `cpu`. Returns whether a translation was present.
    pub fn touch(&self, addr: usize, cpu: usize) -> bool {
        self.cpumask.lock().set_cpu(cpu);
        match self.ptes.lock().get_mut(&align_down(addr)) {
            Some(pte) => {
                pte.young = true;
                true
            }
            None => false,
        }
    }

    pub fn is_mapped(&self, addr: usize) -> bool {
        self.ptes.lock().contains_key(&align_down(addr))
    }

    pub fn pfn(&self, addr: usize) -> Option<usize> {
        self.ptes.lock().get(&align_down(addr)).map(|pte| pte.pfn)
    }

    pub fn test_and_clear_young(&self, addr: usize) -> bool {
        match self.ptes.lock().get_mut(&align_down(addr)) {
            Some(pte) => core::mem::replace(&mut pte.young, false),
            None => false,
        }
    }

    pub fn zap(&self, addr: usize) {
        self.ptes.lock().remove(&align_down(addr));
    }

    /// Map `addr` to `pfn`. An existing identical mapping is fine.
    pub fn insert_pfn(&self, addr: usize, pfn: usize) -> EpcResult {
        let mut ptes = self.ptes.lock();
        match ptes.get(&addr) {
            Some(pte) if pte.pfn != pfn => {
                epc_result_err!(EBUSY, format!("{:#x} already mapped", addr))
            }
            Some(_) => Ok(()),
            None => {
                ptes.insert(addr, Pte { pfn, young: true });
                Ok(())
            }
        }
    }

    pub fn cpumask(&self) -> CpuMask {
        self.cpumask.lock().clone()
    }
}
