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

//! Page admission: requests are queued by `add_page` and carried out in
//! order by the enclave's worker.

use alloc::sync::Arc;

use super::page::EnclavePage;
use super::sgx::{SgxEnclPageType, SgxSecInfo, SgxTcs};
use super::{Enclave, EnclaveFlags, EnclaveInner, EnclaveRef};
use crate::consts::SGX_EEXTEND_CHUNK_SIZE;
use crate::error::EpcResult;
use crate::memory::addr::is_aligned;
use crate::memory::{EpcPage, EpcPageOwner, PAGE_SIZE};

/// Chunks of a page EEXTEND can measure, one bit each in `mrmask`.
const EEXTEND_CHUNKS: usize = PAGE_SIZE / SGX_EEXTEND_CHUNK_SIZE;

pub(crate) struct AddPageReq {
    /// Held until the request is retired.
    _encl: EnclaveRef,
    addr: usize,
    secinfo: SgxSecInfo,
    mrmask: u16,
}

impl Enclave {
    /// Queue `data` to be added at `addr`. Measured 256-byte chunks are
    /// selected by `mrmask`.
    pub fn add_page(
        self: &Arc<Self>,
        addr: usize,
        data: &[u8; PAGE_SIZE],
        secinfo: &SgxSecInfo,
        mrmask: u16,
    ) -> EpcResult {
        secinfo.validate()?;
        let page_type = secinfo.page_type()?;
        if page_type == SgxEnclPageType::TCS {
            SgxTcs::from_page(data).validate(self.size() as u64)?;
        }
        if !is_aligned(addr) || !self.contains(addr) {
            return epc_result_err!(EINVAL, format!("Invalid page address {:#x}", addr));
        }

        let va_page = self.grow()?;
        let req = AddPageReq {
            _encl: self.get(),
            addr,
            secinfo: *secinfo,
            mrmask,
        };
        let mut inner = self.lock.lock();
        let res = if inner
            .flags
            .intersects(EnclaveFlags::INITIALIZED | EnclaveFlags::DEAD)
        {
            epc_result_err!(EINVAL, format!("Enclave {:#x} is sealed", self.id()))
        } else {
            inner
                .page_tree
                .insert(EnclavePage::new(addr, page_type))
                .map(|_| ())
        };
        let res = res.and_then(|()| {
            let res = match self.backing.lock().as_mut() {
                Some(backing) => backing.write(self.backing_index(addr), data),
                None => epc_result_err!(EFAULT, "Backing store released"),
            };
            if res.is_err() {
                inner.page_tree.remove(addr);
            }
            res
        });
        if let Err(e) = res {
            drop(inner);
            self.shrink(va_page);
            drop(req);
            return Err(e);
        }

        let new_va = va_page.map(|va_page| {
            let vaddr = va_page.epc_page().vaddr();
            inner.va_pages.push_front(va_page);
            vaddr
        });
        let was_empty = inner.add_page_reqs.is_empty();
        inner.add_page_reqs.push_back(req);
        drop(inner);
        if was_empty {
            let encl = self.clone();
            if let Err(e) = self.work.queue(move || encl.add_page_worker()) {
                let (req, va_page) = {
                    let mut inner = self.lock.lock();
                    inner.page_tree.remove(addr);
                    let va_page = new_va.and_then(|vaddr| inner.va_pages.remove(vaddr));
                    (inner.add_page_reqs.pop_back(), va_page)
                };
                self.shrink(va_page);
                drop(req);
                return Err(e);
            }
        }
        Ok(())
    }

    fn add_page_worker(self: &Arc<Self>) {
        let mut skip_rest = false;
        loop {
            std::thread::yield_now();
            let req = {
                let mut inner = self.lock.lock();
                if inner
                    .flags
                    .intersects(EnclaveFlags::DEAD | EnclaveFlags::SUSPEND)
                {
                    skip_rest = true;
                }
                match inner.add_page_reqs.pop_front() {
                    Some(req) => req,
                    None => return,
                }
            };

            if !skip_rest {
                let epc_page = self
                    .epc()
                    .alloc_page_retry(EpcPageOwner::page(self, req.addr));
                let mut inner = self.lock.lock();
                match epc_page {
                    Ok(epc_page) => {
                        if let Err(e) = self.process_add_page_req(&mut inner, &req, &epc_page) {
                            warn!("Enclave {:#x}: adding {:#x} failed: {:?}", self.id(), req.addr, e);
                            if let Err(e) = self.epc().free_page(epc_page) {
                                warn!("Failed to free EPC page: {:?}", e);
                            }
                            self.destroy(&mut inner);
                            skip_rest = true;
                        }
                    }
                    Err(e) => {
                        warn!("Enclave {:#x}: no EPC page for {:#x}: {:?}", self.id(), req.addr, e);
                        self.destroy(&mut inner);
                        skip_rest = true;
                    }
                }
            }
            // The request's reference goes outside the lock.
            drop(req);
        }
    }

    fn process_add_page_req(
        &self,
        inner: &mut EnclaveInner,
        req: &AddPageReq,
        epc_page: &Arc<EpcPage>,
    ) -> EpcResult {
        if inner
            .flags
            .intersects(EnclaveFlags::DEAD | EnclaveFlags::SUSPEND)
        {
            return epc_result_err!(EFAULT, "Enclave torn down");
        }
        let secs_page = match inner.secs.epc_page.as_ref() {
            Some(secs_page) => secs_page.vaddr(),
            None => return epc_result_err!(EFAULT, "SECS not resident"),
        };

        let mut data = [0_u8; PAGE_SIZE];
        match self.backing.lock().as_ref() {
            Some(backing) => backing.read(self.backing_index(req.addr), &mut data)?,
            None => return epc_result_err!(EFAULT, "Backing store released"),
        }

        let encls = self.epc().encls();
        encls
            .eadd(secs_page, req.addr, &req.secinfo, &data, epc_page.vaddr())
            .map_err(|e| {
                warn!("EADD returned {}", e.as_string());
                encls_err!(e, "EADD failed")
            })?;
        for i in 0..EEXTEND_CHUNKS {
            if req.mrmask & (1 << i) == 0 {
                continue;
            }
            encls
                .eextend(secs_page, epc_page.vaddr() + i * SGX_EEXTEND_CHUNK_SIZE)
                .map_err(|e| {
                    warn!("EEXTEND returned {}", e.as_string());
                    encls_err!(e, "EEXTEND failed")
                })?;
        }

        match inner.page_tree.lookup_mut(req.addr) {
            Some(page) => page.epc_page = Some(epc_page.clone()),
            None => return epc_result_err!(EFAULT, format!("Page {:#x} vanished", req.addr)),
        }
        inner.secs_child_cnt += 1;
        self.epc().mark_page_reclaimable(epc_page);
        trace!("Enclave {:#x}: added page {:#x}", self.id(), req.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    use crate::arch::soft::EnclsOp;
    use crate::arch::{EnclsError, X86_TRAP_GP};
    use crate::enclave::sgx::SgxEnclPageFlags;
    use crate::consts::SGX_VA_SLOT_COUNT;
    use crate::error::{EpcErrorNum, ErrorClass};
    use crate::testutil::{reg_secinfo, Fixture, BASE};

    fn rejected(f: &Fixture, encl: &Arc<Enclave>, addr: usize, secinfo: &SgxSecInfo) -> EpcErrorNum {
        rejected_page(f, encl, addr, &[0; PAGE_SIZE], secinfo)
    }

    fn rejected_page(
        f: &Fixture,
        encl: &Arc<Enclave>,
        addr: usize,
        data: &[u8; PAGE_SIZE],
        secinfo: &SgxSecInfo,
    ) -> EpcErrorNum {
        let err = encl.add_page(addr, data, secinfo, 0xffff).unwrap_err();
        assert_eq!(err.class(), ErrorClass::BenignRejected);
        encl.work.flush();
        assert_eq!(f.encls.count(EnclsOp::Eadd), 0);
        err.num().unwrap()
    }

    #[test]
    fn test_rejects_unaligned_address() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        let num = rejected(&f, &encl, BASE + 0x800, &reg_secinfo());
        assert_eq!(num, EpcErrorNum::EINVAL);
        assert_eq!(encl.page_count(), 0);
    }

    fn tcs() -> SgxTcs {
        let mut tcs = SgxTcs::default();
        tcs.ossa = PAGE_SIZE as u64;
        tcs.ofs_base = 2 * PAGE_SIZE as u64;
        tcs.ogs_base = 2 * PAGE_SIZE as u64;
        tcs.fs_limit = 0xfff;
        tcs.gs_limit = 0xfff;
        tcs
    }

    #[test]
    fn test_rejects_unaligned_tcs_offsets() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        let secinfo = SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::TCS);
        for bad in [
            SgxTcs { ossa: 0x1800, ..tcs() },
            SgxTcs { ofs_base: 0x2010, ..tcs() },
            SgxTcs { ogs_base: 0x80, ..tcs() },
        ] {
            let num = rejected_page(&f, &encl, BASE, bad.as_page(), &secinfo);
            assert_eq!(num, EpcErrorNum::EINVAL);
        }
        assert_eq!(encl.page_count(), 0);
        assert_eq!(f.epc.free_count(), 6);

        encl.add_page(BASE, tcs().as_page(), &secinfo, 0).unwrap();
        encl.work.flush();
        assert_eq!(f.encls.count(EnclsOp::Eadd), 1);
        assert!(encl.is_resident(BASE));
    }

    #[test]
    fn test_queue_failure_undoes_va_growth() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        // The next counted page brings a new VA page.
        encl.page_cnt.store(SGX_VA_SLOT_COUNT, Ordering::Release);
        encl.work.fail_next_spawn();
        let err = encl
            .add_page(BASE, &[1; PAGE_SIZE], &reg_secinfo(), 0xffff)
            .unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::ENOMEM));
        assert_eq!(f.encls.count(EnclsOp::Epa), 2);
        assert_eq!(encl.va_page_count(), 1);
        assert_eq!(encl.page_count(), 0);
        assert_eq!(encl.page_cnt.load(Ordering::Acquire), SGX_VA_SLOT_COUNT);
        assert_eq!(f.epc.free_count(), 6);

        f.add(&encl, BASE, 1);
        encl.work.flush();
        assert_eq!(f.encls.count(EnclsOp::Epa), 3);
        assert_eq!(encl.va_page_count(), 2);
        assert!(encl.is_resident(BASE));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        let write_only = SgxSecInfo::new(SgxEnclPageFlags::W, SgxEnclPageType::REG);
        assert_eq!(rejected(&f, &encl, BASE, &write_only), EpcErrorNum::EINVAL);
        let va = SgxSecInfo::new(SgxEnclPageFlags::R, SgxEnclPageType::VA);
        assert_eq!(rejected(&f, &encl, BASE, &va), EpcErrorNum::EINVAL);
        let outside = BASE + 4 * PAGE_SIZE;
        assert_eq!(rejected(&f, &encl, outside, &reg_secinfo()), EpcErrorNum::EINVAL);
        assert_eq!(encl.page_count(), 0);
        assert_eq!(f.epc.free_count(), 6);
    }

    #[test]
    fn test_rejects_duplicate_page() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        f.add(&encl, BASE, 1);
        let err = encl
            .add_page(BASE, &[2; PAGE_SIZE], &reg_secinfo(), 0xffff)
            .unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EEXIST));
        encl.work.flush();
        assert_eq!(f.encls.count(EnclsOp::Eadd), 1);
        assert_eq!(encl.page_count(), 1);
    }

    #[test]
    fn test_rejects_after_init() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 4 * PAGE_SIZE, 1);
        let err = encl
            .add_page(BASE + PAGE_SIZE, &[2; PAGE_SIZE], &reg_secinfo(), 0)
            .unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EINVAL));
        assert_eq!(encl.page_count(), 1);
        assert_eq!(f.encls.count(EnclsOp::Eadd), 1);
    }

    #[test]
    fn test_worker_adds_in_order() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        for i in 0..3 {
            f.add(&encl, BASE + i * PAGE_SIZE, i as u8);
        }
        encl.work.flush();
        assert_eq!(f.encls.count(EnclsOp::Eadd), 3);
        assert_eq!(f.encls.count(EnclsOp::Eextend), 3 * EEXTEND_CHUNKS);
        assert_eq!(encl.child_count(), 3);
        assert_eq!(f.epc.active_count(), 3);

        let frames: Vec<_> = {
            let inner = encl.lock.lock();
            (0..3)
                .map(|i| {
                    inner
                        .page_tree
                        .lookup(BASE + i * PAGE_SIZE)
                        .and_then(|p| p.epc_page())
                        .unwrap()
                        .vaddr()
                })
                .collect()
        };
        let added: Vec<_> = f
            .encls
            .ops()
            .iter()
            .filter(|r| r.op == EnclsOp::Eadd)
            .map(|r| r.addr)
            .collect();
        assert_eq!(added, frames);
    }

    #[test]
    fn test_partial_measurement() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        encl.add_page(BASE, &[7; PAGE_SIZE], &reg_secinfo(), 0b101)
            .unwrap();
        encl.work.flush();
        assert_eq!(f.encls.count(EnclsOp::Eextend), 2);
    }

    #[test]
    fn test_eadd_fault_kills_enclave() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        f.encls
            .inject(EnclsOp::Eadd, EnclsError::Faulted { trapnr: X86_TRAP_GP });
        f.add(&encl, BASE, 1);
        encl.work.flush();
        assert!(encl.is_dead());
        assert_eq!(encl.page_count(), 0);
        assert_eq!(f.epc.free_count(), 8);

        let err = encl
            .add_page(BASE + PAGE_SIZE, &[2; PAGE_SIZE], &reg_secinfo(), 0)
            .unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EINVAL));
    }
}
