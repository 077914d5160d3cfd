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

//! The eviction protocol for one candidate frame.
//!
//! `age` (Checked) aborts pages touched since the last pass, `block`
//! (Blocked) unmaps the page everywhere and issues EBLOCK, `write`
//! (Tracked and Reclaimed) writes it back through the EWB retry ladder or
//! discards it when the enclave is dead.

use alloc::sync::Arc;
use core::ops::ControlFlow;

use crate::arch::{EnclsError, SgxErrorCode};
use crate::cpumask::CpuMask;
use crate::enclave::sgx::SgxPcmd;
use crate::enclave::va::SwapSlot;
use crate::enclave::{Enclave, EnclaveFlags, EnclaveInner, EnclaveRef};
use crate::epc::Epc;
use crate::error::EpcResult;
use crate::memory::{AlignedPage, EpcPage, VirtAddr, PAGE_SIZE};

/// A frame taken off the active list, with a hold on its enclave.
pub(crate) struct Candidate {
    pub page: Arc<EpcPage>,
    encl: EnclaveRef,
    addr: usize,
    slot: Option<SwapSlot>,
}

impl Candidate {
    pub fn new(page: Arc<EpcPage>, encl: EnclaveRef, addr: usize) -> Self {
        Self {
            page,
            encl,
            addr,
            slot: None,
        }
    }

    /// Clear the accessed bit in every bound address space. Returns false
    /// if any of them used the page. A dead enclave skips the check.
    pub fn age(&mut self) -> bool {
        let encl = &self.encl;
        let addr = self.addr;
        let mut young = false;
        encl.for_each_mm(|mm| {
            let _mmap = mm.mmap_read();
            if encl.lock.lock().flags.contains(EnclaveFlags::DEAD) {
                return ControlFlow::Break(());
            }
            if mm.test_and_clear_young(addr) {
                young = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        let mut inner = encl.lock.lock();
        if young && !inner.flags.contains(EnclaveFlags::DEAD) {
            return false;
        }
        match inner.page_tree.lookup_mut(addr) {
            Some(page) => {
                page.reclaimed = true;
                true
            }
            None => {
                warn!("Enclave {:#x}: no page at {:#x} for EPC page {:?}", encl.id(), addr, self.page);
                false
            }
        }
    }

    /// Take the version slot the write-back will need.
    pub fn reserve_slot(&mut self) -> bool {
        let encl = self.encl.arc();
        let mut inner = encl.lock.lock();
        if inner.flags.contains(EnclaveFlags::DEAD) {
            return true;
        }
        match alloc_va_slot(encl, &mut inner) {
            Ok(slot) => {
                self.slot = Some(slot);
                true
            }
            Err(e) => {
                debug!("Enclave {:#x}: no VA slot: {:?}", encl.id(), e);
                false
            }
        }
    }

    /// Undo `age` and `reserve_slot` before the page goes back on the
    /// active list.
    pub fn cancel(&mut self) {
        let mut inner = self.encl.lock.lock();
        if let Some(page) = inner.page_tree.lookup_mut(self.addr) {
            page.reclaimed = false;
        }
        if let Some(slot) = self.slot.take() {
            inner.va_pages.free_slot(slot);
        }
    }

    /// Remove the page from every bound address space, then EBLOCK it.
    /// Returns false if the page should be retried in a later pass.
    pub fn block(&self) -> bool {
        let encl = &self.encl;
        let addr = self.addr;
        encl.for_each_mm(|mm| {
            let _mmap = mm.mmap_read();
            mm.zap(addr);
            ControlFlow::Continue(())
        });

        let mut inner = encl.lock.lock();
        if inner.flags.contains(EnclaveFlags::DEAD) {
            return true;
        }
        match encl.epc().encls().eblock(self.page.vaddr()) {
            Ok(()) => true,
            Err(e) if e.is_code(SgxErrorCode::BLKSTATE) => true,
            Err(e)
                if e.is_code(SgxErrorCode::LOCKFAIL)
                    || e.is_code(SgxErrorCode::ENTRYEPOCH_LOCKED) =>
            {
                debug!("EBLOCK returned {}, retrying {:#x} later", e.as_string(), addr);
                false
            }
            Err(e) => {
                error!(
                    "EBLOCK returned {}, killing enclave {:#x}",
                    e.as_string(),
                    encl.id()
                );
                encl.destroy(&mut inner);
                true
            }
        }
    }

    /// Write the page back, or discard it if the enclave is dead. Evicts the
    /// SECS after the last child. Returns whether the frame may be reused.
    pub fn write(&mut self) -> bool {
        let slot = self.slot.take();
        let encl = self.encl.arc();
        let epc = encl.epc();
        let addr = self.addr;
        let mut inner = encl.lock.lock();
        if let Some(page) = inner.page_tree.lookup_mut(addr) {
            page.reclaimed = false;
        }

        let mut killed = false;
        let freed = match slot {
            Some(slot) if !inner.flags.contains(EnclaveFlags::DEAD) => {
                match write_back(encl, &inner, &self.page, encl.backing_index(addr), slot) {
                    Ok(()) => {
                        if let Some(page) = inner.page_tree.lookup_mut(addr) {
                            page.epc_page = None;
                            page.swap = Some(slot);
                        }
                        true
                    }
                    Err(e) => {
                        error!(
                            "EWB of {:#x} failed: {:?}, killing enclave {:#x}",
                            addr,
                            e,
                            encl.id()
                        );
                        inner.va_pages.free_slot(slot);
                        inner.page_tree.remove(addr);
                        killed = true;
                        discard(epc, &self.page)
                    }
                }
            }
            slot => {
                if let Some(slot) = slot {
                    inner.va_pages.free_slot(slot);
                }
                inner.page_tree.remove(addr);
                discard(epc, &self.page)
            }
        };
        inner.secs_child_cnt = inner.secs_child_cnt.saturating_sub(1);
        if killed {
            encl.destroy(&mut inner);
        }

        if inner.secs_child_cnt == 0
            && inner
                .flags
                .intersects(EnclaveFlags::DEAD | EnclaveFlags::INITIALIZED)
        {
            evict_secs(encl, &mut inner);
        }
        freed
    }
}

impl Drop for Candidate {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.encl.lock.lock().va_pages.free_slot(slot);
        }
    }
}

/// A free version slot. `grow` keeps one per page, so running out means the
/// accounting is off.
fn alloc_va_slot(encl: &Enclave, inner: &mut EnclaveInner) -> EpcResult<SwapSlot> {
    match inner.va_pages.alloc_slot() {
        Some(slot) => Ok(slot),
        None => epc_result_err!(
            ENOSPC,
            format!("Enclave {:#x}: no free VA slot", encl.id())
        ),
    }
}

/// EREMOVE a frame whose contents are dropped. A failure leaks the frame.
fn discard(epc: &Epc, page: &EpcPage) -> bool {
    match epc.encls().eremove(page.vaddr()) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "EREMOVE returned {} for EPC page {:#x}",
                e.as_string(),
                page.paddr()
            );
            false
        }
    }
}

/// CPUs of every address space the enclave is mapped into.
fn ewb_cpumask(encl: &Enclave) -> CpuMask {
    let mut mask = CpuMask::default();
    encl.for_each_mm(|mm| {
        mask.or(&mm.cpumask());
        ControlFlow::Continue(())
    });
    mask
}

/// EWB with the tracking ladder: direct, after ETRACK, then after kicking
/// every CPU out of the enclave. The third attempt is final.
fn ewb(
    encl: &Enclave,
    secs_page: Option<VirtAddr>,
    epc: VirtAddr,
    slot: SwapSlot,
    contents: &mut [u8; PAGE_SIZE],
    pcmd: &mut SgxPcmd,
) -> Result<(), EnclsError> {
    let encls = encl.epc().encls();
    let not_tracked = |ret: &Result<(), EnclsError>| {
        matches!(ret, Err(e) if e.is_code(SgxErrorCode::NOT_TRACKED))
    };

    let mut ret = encls.ewb(epc, slot.addr(), contents, pcmd);
    if not_tracked(&ret) {
        if let Some(secs_page) = secs_page {
            if let Err(e) = encls.etrack(secs_page) {
                warn!("ETRACK returned {}", e.as_string());
            }
        }
        ret = encls.ewb(epc, slot.addr(), contents, pcmd);
        if not_tracked(&ret) {
            encls.flush_cpus(&ewb_cpumask(encl));
            ret = encls.ewb(epc, slot.addr(), contents, pcmd);
        }
    }
    ret
}

/// Write `page` back to backing slot `index`.
fn write_back(
    encl: &Enclave,
    inner: &EnclaveInner,
    page: &EpcPage,
    index: usize,
    slot: SwapSlot,
) -> EpcResult {
    let secs_page = inner.secs.epc_page.as_ref().map(|p| p.vaddr());
    let mut contents = AlignedPage::new();
    let mut pcmd = SgxPcmd::default();
    ewb(encl, secs_page, page.vaddr(), slot, &mut contents, &mut pcmd).map_err(|e| {
        warn!("EWB returned {}", e.as_string());
        encls_err!(e, "EWB failed")
    })?;

    let mut backing = encl.backing.lock();
    let backing = match backing.as_mut() {
        Some(backing) => backing,
        None => return epc_result_err!(EFAULT, "Backing store released"),
    };
    backing.write(index, &contents)?;
    backing.write_pcmd(index, &pcmd)
}

/// The last child is gone: write the SECS back, or drop it if the enclave
/// is dead. Without a free version slot it stays resident.
fn evict_secs(encl: &Arc<Enclave>, inner: &mut EnclaveInner) {
    let secs_page = match inner.secs.epc_page.clone() {
        Some(secs_page) => secs_page,
        None => return,
    };
    let epc = encl.epc();

    if inner.flags.contains(EnclaveFlags::DEAD) {
        match epc.free_page(secs_page) {
            Ok(()) => inner.secs.epc_page = None,
            Err(e) => warn!("Enclave {:#x}: SECS page lost: {:?}", encl.id(), e),
        }
        return;
    }

    let slot = match alloc_va_slot(encl, inner) {
        Ok(slot) => slot,
        Err(e) => {
            debug!("Enclave {:#x}: SECS stays resident: {:?}", encl.id(), e);
            return;
        }
    };
    let index = match encl.backing.lock().as_ref() {
        Some(backing) => backing.secs_index(),
        None => {
            inner.va_pages.free_slot(slot);
            return;
        }
    };
    match write_back(encl, inner, &secs_page, index, slot) {
        Ok(()) => {
            inner.secs.epc_page = None;
            inner.secs.swap = Some(slot);
            epc.put_page(secs_page);
            debug!("Enclave {:#x}: SECS written back", encl.id());
        }
        Err(e) => {
            warn!("Enclave {:#x}: SECS write-back failed: {:?}", encl.id(), e);
            inner.va_pages.free_slot(slot);
        }
    }
}
