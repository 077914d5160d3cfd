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


//! Entry points for the host's fault handler.
//!
//! There is no page-in path: a fault on a page that was written back is
//! fatal for the faulting thread.

use alloc::sync::Arc;

use crate::enclave::{Enclave, EnclaveFlags, EnclaveRef};
use crate::error::EpcResult;
use crate::memory::addr::align_down;
use crate::mm::AddressSpace;

/// The enclave mapped at `addr` in `mm`. `EINVAL` when no enclave VMA
/// covers `addr`, `ENOENT` when the VMA has no enclave yet.
pub fn find_owner(mm: &AddressSpace, addr: usize) -> EpcResult<EnclaveRef> {
    match mm.find_enclave(addr)? {
        Some(encl) => Ok(encl),
        None => epc_result_err!(ENOENT, format!("No enclave created at {:#x} yet", addr)),
    }
}

/// Map the resident frame of the page at `addr` into `mm` and return its
/// PFN. `EBUSY` while a reclaim pass owns the frame, `EFAULT` otherwise.
pub fn on_fault(mm: &Arc<AddressSpace>, addr: usize) -> EpcResult<usize> {
    let encl = find_owner(mm, addr)?;
    let _binding = match encl.get_mm(mm) {
        Some(binding) => binding,
        None => {
            return epc_result_err!(
                EFAULT,
                format!("Enclave {:#x} is not bound to mm {}", encl.id(), mm.id())
            )
        }
    };

    let addr = align_down(addr);
    let _mmap = mm.mmap_read();
    let inner = encl.lock.lock();
    let epc_page = encl.load_page(&inner, addr)?;
    mm.insert_pfn(addr, epc_page.pfn())?;
    trace!("mm {}: mapped {:#x} to pfn {:#x}", mm.id(), addr, epc_page.pfn());
    Ok(epc_page.pfn())
}

impl Enclave {
    /// `find_owner` for request paths: an enclave torn down by a power
    /// transition is reported as `EPOWERLOST`.
    pub fn encl_get(mm: &AddressSpace, addr: usize) -> EpcResult<EnclaveRef> {
        let encl = find_owner(mm, addr)?;
        if encl.flags().contains(EnclaveFlags::SUSPEND) {
            return epc_result_err!(
                EPOWERLOST,
                format!("Enclave {:#x} lost to a power transition", encl.id())
            );
        }
        Ok(encl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EpcErrorNum;
    use crate::memory::PAGE_SIZE;
    use crate::testutil::{Fixture, BASE};
    use crate::PmEvent;

    #[test]
    fn test_find_owner() {
        let f = Fixture::new(8);
        let err = find_owner(&f.mm, BASE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EINVAL));
        f.mm.mmap_enclave(BASE..BASE + 2 * PAGE_SIZE).unwrap();
        let err = find_owner(&f.mm, BASE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::ENOENT));
    }

    #[test]
    fn test_fault_maps_resident_page() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 4 * PAGE_SIZE);
        assert!(Arc::ptr_eq(find_owner(&f.mm, BASE).unwrap().arc(), encl.arc()));
        f.add(&encl, BASE, 1);
        encl.work.flush();
        let err = on_fault(&f.mm, BASE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EFAULT));

        f.init(&encl).unwrap();
        let pfn = on_fault(&f.mm, BASE + 0x123).unwrap();
        assert_eq!(f.mm.pfn(BASE), Some(pfn));
        assert_eq!(on_fault(&f.mm, BASE).unwrap(), pfn);
        let err = on_fault(&f.mm, BASE + PAGE_SIZE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EFAULT));
    }

    #[test]
    fn test_fault_during_reclaim_is_busy() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 2 * PAGE_SIZE, 1);
        encl.lock.lock().page_tree.lookup_mut(BASE).unwrap().reclaimed = true;
        let err = on_fault(&f.mm, BASE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EBUSY));
        assert!(!f.mm.is_mapped(BASE));

        encl.lock.lock().page_tree.lookup_mut(BASE).unwrap().reclaimed = false;
        on_fault(&f.mm, BASE).unwrap();
        assert!(f.mm.is_mapped(BASE));
    }

    #[test]
    fn test_encl_get_after_suspend() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 2 * PAGE_SIZE, 1);
        assert!(Enclave::encl_get(&f.mm, BASE).is_ok());

        f.epc.pm_notify(PmEvent::SuspendPrepare);
        assert!(encl.is_dead());
        let err = Enclave::encl_get(&f.mm, BASE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EPOWERLOST));
        let err = on_fault(&f.mm, BASE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EFAULT));
        assert_eq!(f.epc.free_count(), 8);
    }
}
