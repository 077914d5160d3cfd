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

//! The enclave aggregate.
//!
//! An `Enclave` owns its page directory, SECS, version arrays, backing store
//! and address-space bindings. It is reference counted through `EnclaveRef`:
//! VMAs, queued admission requests and reclaim passes each hold one, and the
//! enclave is torn down when the last one goes.

mod add_page;
pub mod backing;
mod init;
pub mod mm_list;
pub mod page;
pub mod pm;
pub mod sgx;
pub mod va;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::{Debug, Formatter, Result};
use core::ops::{Deref, Range};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;
use spin::Mutex as SpinMutex;

use self::add_page::AddPageReq;
use self::backing::Backing;
use self::mm_list::EnclaveMm;
use self::page::{EnclavePage, PageDirectory};
use self::sgx::{SgxAttributeFlags, SgxEnclPageType, SgxSecs};
use self::va::{SwapSlot, VaPages};
use crate::epc::Epc;
use crate::error::{EpcErrorNum, EpcResult};
use crate::memory::{EpcPage, EpcPageOwner, VirtAddr, PAGE_SIZE};
use crate::mm::AddressSpace;
use crate::workqueue::Work;

bitflags! {
    pub struct EnclaveFlags: u32 {
        /// EINIT succeeded.
        const INITIALIZED   = 1 << 0;
        const DEBUG         = 1 << 1;
        /// Torn down by a power transition.
        const SUSPEND       = 1 << 2;
        /// Torn down. Overrides every other state.
        const DEAD          = 1 << 3;
    }
}

/// State protected by the enclave lock.
pub struct EnclaveInner {
    pub(crate) flags: EnclaveFlags,
    pub(crate) page_tree: PageDirectory,
    pub(crate) secs: EnclavePage,
    /// Resident child pages, the SECS excluded.
    pub(crate) secs_child_cnt: usize,
    pub(crate) va_pages: VaPages,
    pub(crate) add_page_reqs: VecDeque<AddPageReq>,
}

pub struct Enclave {
    epc: Arc<Epc>,
    id: usize,
    base: usize,
    size: usize,
    ssa_frame_size: u32,
    /// SECS.ATTRIBUTES as created.
    attributes: u64,
    /// Attributes `init` may grant.
    allowed_attributes: AtomicU64,
    refcount: AtomicUsize,
    /// Pages, SECS included, that were given a version slot.
    page_cnt: AtomicUsize,
    pub(crate) lock: Mutex<EnclaveInner>,
    pub(crate) mm_list: SpinMutex<Vec<Arc<EnclaveMm>>>,
    /// `None` once released.
    pub(crate) backing: SpinMutex<Option<Backing>>,
    pub(crate) work: Arc<Work>,
}

/// A counted reference to an enclave. Dropping the last one releases it.
pub struct EnclaveRef(Arc<Enclave>);

impl EnclaveRef {
    pub fn arc(&self) -> &Arc<Enclave> {
        &self.0
    }
}

impl Deref for EnclaveRef {
    type Target = Arc<Enclave>;

    fn deref(&self) -> &Arc<Enclave> {
        &self.0
    }
}

impl Clone for EnclaveRef {
    fn clone(&self) -> Self {
        self.0.get()
    }
}

impl Drop for EnclaveRef {
    fn drop(&mut self) {
        if self.0.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.release();
        }
    }
}

impl Debug for EnclaveRef {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "EnclaveRef({:#x})", self.0.id)
    }
}

impl Enclave {
    /// Validate `secs`, ECREATE it and attach the enclave to the VMA of `mm`
    /// at `secs.base_addr`.
    pub fn create(epc: &Arc<Epc>, mm: &Arc<AddressSpace>, secs: &SgxSecs) -> EpcResult<EnclaveRef> {
        secs.validate(epc.config())?;

        let base = secs.base_addr as usize;
        let size = secs.size as usize;
        let id = epc.alloc_enclave_id();
        let allowed = SgxAttributeFlags::all() - SgxAttributeFlags::PROVISIONKEY;
        let encl = Arc::new(Self {
            epc: epc.clone(),
            id,
            base,
            size,
            ssa_frame_size: secs.ssa_frame_size,
            attributes: secs.attributes,
            allowed_attributes: AtomicU64::new(allowed.bits()),
            refcount: AtomicUsize::new(1),
            page_cnt: AtomicUsize::new(0),
            lock: Mutex::new(EnclaveInner {
                flags: EnclaveFlags::empty(),
                page_tree: PageDirectory::new(),
                secs: EnclavePage::new(0, SgxEnclPageType::SECS),
                secs_child_cnt: 0,
                va_pages: VaPages::new(),
                add_page_reqs: VecDeque::new(),
            }),
            mm_list: SpinMutex::new(Vec::new()),
            backing: SpinMutex::new(Some(Backing::new(size + PAGE_SIZE))),
            work: Arc::new(Work::new(format!("sgx-add-page-{}", id))),
        });
        let initial = EnclaveRef(encl.clone());

        let va_page = encl.grow()?;
        let secs_page = match epc.alloc_page(EpcPageOwner::secs(&encl)) {
            Ok(secs_page) => secs_page,
            Err(e) => {
                encl.shrink(va_page);
                return Err(e);
            }
        };
        if let Err(e) = epc.encls().ecreate(secs, secs_page.vaddr()) {
            warn!("ECREATE returned {}", e.as_string());
            if let Err(e) = epc.free_page(secs_page) {
                warn!("Failed to free SECS page: {:?}", e);
            }
            encl.shrink(va_page);
            return Err(encls_err!(e, "ECREATE failed"));
        }
        {
            let mut inner = encl.lock.lock();
            inner.secs.epc_page = Some(secs_page);
            if let Some(va_page) = va_page {
                inner.va_pages.push_front(va_page);
            }
            if secs.attribute_flags().contains(SgxAttributeFlags::DEBUG) {
                inner.flags |= EnclaveFlags::DEBUG;
            }
        }
        epc.pm().register(&encl);

        let binding = encl.add_mm_locked(&mut encl.mm_list.lock(), mm);
        let caller = encl.get();
        mm.attach_enclave(base..base + size, initial, binding)?;
        info!("Enclave {:#x} created at {:#x?}", id, encl.range());
        Ok(caller)
    }

    pub fn get(self: &Arc<Self>) -> EnclaveRef {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        EnclaveRef(self.clone())
    }

    /// A reference unless the enclave is already being released.
    pub fn get_unless_zero(self: &Arc<Self>) -> Option<EnclaveRef> {
        let mut cnt = self.refcount.load(Ordering::Acquire);
        loop {
            if cnt == 0 {
                return None;
            }
            match self.refcount.compare_exchange_weak(
                cnt,
                cnt + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(EnclaveRef(self.clone())),
                Err(cur) => cnt = cur,
            }
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// The last reference went away.
    fn release(&self) {
        self.epc.pm().unregister(self.id);
        self.destroy_forced();
        self.backing.lock().take();
        let bindings = core::mem::take(&mut *self.mm_list.lock());
        drop(bindings);
        debug!("Enclave {:#x} released", self.id);
    }

    /// Mark the enclave dead and give back every frame it can. Frames owned
    /// by a reclaim pass are left to it. Called with the enclave lock held.
    pub(crate) fn destroy(&self, inner: &mut EnclaveInner) {
        inner.flags |= EnclaveFlags::DEAD;

        let addrs: Vec<_> = inner.page_tree.addrs().collect();
        for addr in addrs {
            let page = match inner.page_tree.lookup_mut(addr) {
                Some(page) => page,
                None => continue,
            };
            if let Some(epc_page) = page.epc_page.clone() {
                match self.epc.free_page(epc_page) {
                    Ok(()) => {}
                    Err(e) if e.num() == Some(EpcErrorNum::EBUSY) => continue,
                    Err(e) => warn!("Enclave {:#x}: page {:#x} lost: {:?}", self.id, addr, e),
                }
                page.epc_page = None;
                inner.secs_child_cnt = inner.secs_child_cnt.saturating_sub(1);
            }
            inner.page_tree.remove(addr);
        }

        for va_page in inner.va_pages.drain() {
            if let Err(e) = self.epc.free_page(va_page.epc_page().clone()) {
                warn!("Enclave {:#x}: VA page lost: {:?}", self.id, e);
            }
        }

        if inner.secs_child_cnt == 0 {
            if let Some(secs_page) = inner.secs.epc_page.take() {
                if let Err(e) = self.epc.free_page(secs_page) {
                    warn!("Enclave {:#x}: SECS page lost: {:?}", self.id, e);
                }
            }
        }
    }

    /// Tear the enclave down now, whoever still holds it.
    pub fn destroy_forced(&self) {
        let mut inner = self.lock.lock();
        self.destroy(&mut inner);
    }

    /// Resident frame for a fault at `addr`.
    pub(crate) fn load_page(&self, inner: &EnclaveInner, addr: usize) -> EpcResult<Arc<EpcPage>> {
        if !inner.flags.contains(EnclaveFlags::INITIALIZED) || inner.flags.contains(EnclaveFlags::DEAD)
        {
            return epc_result_err!(EFAULT, format!("Enclave {:#x} not usable", self.id));
        }
        let page = match inner.page_tree.lookup(addr) {
            Some(page) => page,
            None => return epc_result_err!(EFAULT, format!("No enclave page at {:#x}", addr)),
        };
        if page.reclaimed {
            return epc_result_err!(EBUSY, format!("Page {:#x} is being reclaimed", addr));
        }
        match page.epc_page.clone() {
            Some(epc_page) => Ok(epc_page),
            None => epc_result_err!(EFAULT, format!("Page {:#x} is not resident", addr)),
        }
    }

    /// Let `init` grant `attribute`.
    pub fn set_attribute(&self, attribute: SgxAttributeFlags) {
        self.allowed_attributes
            .fetch_or(attribute.bits(), Ordering::AcqRel);
    }

    pub fn allowed_attributes(&self) -> SgxAttributeFlags {
        SgxAttributeFlags::from_bits_truncate(self.allowed_attributes.load(Ordering::Acquire))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn epc(&self) -> &Arc<Epc> {
        &self.epc
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    pub fn ssa_frame_size(&self) -> u32 {
        self.ssa_frame_size
    }

    pub fn attributes(&self) -> u64 {
        self.attributes
    }

    pub fn flags(&self) -> EnclaveFlags {
        self.lock.lock().flags
    }

    pub fn is_dead(&self) -> bool {
        self.flags().contains(EnclaveFlags::DEAD)
    }

    /// Frame of the SECS while it is resident.
    pub fn secs_page(&self) -> Option<VirtAddr> {
        self.lock.lock().secs.epc_page.as_ref().map(|p| p.vaddr())
    }

    pub fn child_count(&self) -> usize {
        self.lock.lock().secs_child_cnt
    }

    pub fn page_count(&self) -> usize {
        self.lock.lock().page_tree.len()
    }

    pub fn va_page_count(&self) -> usize {
        self.lock.lock().va_pages.len()
    }

    pub fn is_resident(&self, addr: usize) -> bool {
        self.lock
            .lock()
            .page_tree
            .lookup(addr)
            .map_or(false, |p| p.is_resident())
    }

    pub fn swap_slot(&self, addr: usize) -> Option<SwapSlot> {
        self.lock
            .lock()
            .page_tree
            .lookup(addr)
            .and_then(|p| p.swap_slot())
    }

    /// Content slot of the page at `addr` in the backing store.
    pub(crate) fn backing_index(&self, addr: usize) -> usize {
        (addr - self.base) >> crate::consts::PAGE_SHIFT
    }
}

impl Debug for Enclave {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("Enclave")
            .field("id", &self.id)
            .field("range", &self.range())
            .field("refcount", &self.refcount())
            .field("mm_count", &self.mm_list.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::soft::EnclsOp;
    use crate::arch::{EnclsError, X86_TRAP_GP};
    use crate::error::ErrorClass;
    use crate::testutil::{Fixture, BASE};

    #[test]
    fn test_create() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        assert_eq!(encl.range(), BASE..BASE + 4 * PAGE_SIZE);
        assert!(encl.secs_page().is_some());
        assert_eq!(encl.va_page_count(), 1);
        assert_eq!(encl.flags(), EnclaveFlags::empty());
        assert_eq!(f.epc.free_count(), 6);
        assert_eq!(f.epc.pm().len(), 1);
        assert_eq!(f.encls.count(EnclsOp::Ecreate), 1);
        assert_eq!(f.encls.count(EnclsOp::Epa), 1);
    }

    #[test]
    fn test_create_rejects_bad_secs() {
        let f = Fixture::new(8);
        f.mm.mmap_enclave(BASE..BASE + 3 * PAGE_SIZE).unwrap();
        let secs = SgxSecs::new(
            BASE as u64,
            3 * PAGE_SIZE as u64,
            SgxAttributeFlags::MODE64BIT,
            0x3,
        );
        let err = Enclave::create(&f.epc, &f.mm, &secs).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EINVAL));
        assert_eq!(err.class(), ErrorClass::BenignRejected);
        assert!(f.encls.ops().is_empty());
        assert_eq!(f.epc.free_count(), 8);
    }

    #[test]
    fn test_create_ecreate_failure() {
        let f = Fixture::new(8);
        f.encls
            .inject(EnclsOp::Ecreate, EnclsError::Faulted { trapnr: X86_TRAP_GP });
        f.mm.mmap_enclave(BASE..BASE + 2 * PAGE_SIZE).unwrap();
        let secs = SgxSecs::new(
            BASE as u64,
            2 * PAGE_SIZE as u64,
            SgxAttributeFlags::MODE64BIT,
            0x3,
        );
        let err = Enclave::create(&f.epc, &f.mm, &secs).unwrap_err();
        assert_eq!(err.class(), ErrorClass::FatalHardware);
        assert_eq!(f.epc.free_count(), 8);
        assert!(f.epc.pm().is_empty());
        assert_eq!(f.encls.valid_count(), 0);
    }

    #[test]
    fn test_release_on_last_reference() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 2 * PAGE_SIZE, 1);
        let weak = Arc::downgrade(encl.arc());
        let extra = encl.clone();
        assert_eq!(encl.refcount(), 3);
        drop(encl);
        f.mm.munmap(BASE).unwrap();
        assert!(!extra.is_dead());
        assert_eq!(extra.refcount(), 1);

        drop(extra);
        assert!(weak.upgrade().is_none());
        assert!(f.epc.pm().is_empty());
        assert_eq!(f.epc.free_count(), 8);
        assert_eq!(f.epc.active_count(), 0);
        assert_eq!(f.encls.valid_count(), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 4 * PAGE_SIZE, 2);
        encl.destroy_forced();
        assert!(encl.is_dead());
        assert_eq!(encl.page_count(), 0);
        assert_eq!(encl.va_page_count(), 0);
        assert_eq!(encl.secs_page(), None);
        assert_eq!(f.epc.free_count(), 8);
        let removes = f.encls.count(EnclsOp::Eremove);
        assert_eq!(removes, 4);

        encl.destroy_forced();
        drop(encl);
        f.mm.exit();
        assert_eq!(f.encls.count(EnclsOp::Eremove), removes);
        assert_eq!(f.epc.free_count(), 8);
    }

    #[test]
    fn test_teardown_eremove_failure_leaks_frame() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 2 * PAGE_SIZE, 1);
        f.encls
            .inject(EnclsOp::Eremove, EnclsError::Faulted { trapnr: X86_TRAP_GP });
        encl.destroy_forced();
        assert!(encl.is_dead());
        assert_eq!(encl.page_count(), 0);
        // The SECS still counts the lost page as a child and is lost too.
        assert_eq!(encl.secs_page(), None);
        assert_eq!(f.epc.free_count(), 6);
    }
}
