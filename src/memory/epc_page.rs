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

//! EPC frames.

use alloc::sync::{Arc, Weak};
use core::fmt::{Debug, Formatter, Result};
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bit_field::BitField;
use spin::Mutex;

use super::addr::{pfn_down, PhysAddr, VirtAddr};
use crate::consts::PAGE_SHIFT;
use crate::enclave::Enclave;

const DESC_SECTION_BITS: Range<usize> = 0..4;
const DESC_RECLAIMABLE_BIT: usize = 4;
const DESC_ADDR_BITS: Range<usize> = PAGE_SHIFT..64;

/// What currently occupies a frame.
#[derive(Clone)]
pub enum EpcPageOwner {
    /// A regular or TCS page of `encl` at linear address `addr`.
    Page { encl: Weak<Enclave>, addr: usize },
    /// The control page (SECS) of `encl`.
    Secs(Weak<Enclave>),
    /// A version-array page of `encl`.
    VersionArray(Weak<Enclave>),
}

impl EpcPageOwner {
    pub fn page(encl: &Arc<Enclave>, addr: usize) -> Self {
        Self::Page {
            encl: Arc::downgrade(encl),
            addr,
        }
    }

    pub fn secs(encl: &Arc<Enclave>) -> Self {
        Self::Secs(Arc::downgrade(encl))
    }

    pub fn version_array(encl: &Arc<Enclave>) -> Self {
        Self::VersionArray(Arc::downgrade(encl))
    }

    pub fn enclave(&self) -> Option<Arc<Enclave>> {
        match self {
            Self::Page { encl, .. } | Self::Secs(encl) | Self::VersionArray(encl) => encl.upgrade(),
        }
    }

    /// Linear address of the logical page, `None` for SECS and VA frames.
    pub fn addr(&self) -> Option<usize> {
        match self {
            Self::Page { addr, .. } => Some(*addr),
            _ => None,
        }
    }
}

impl Debug for EpcPageOwner {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            Self::Page { addr, .. } => write!(f, "Page({:#x})", addr),
            Self::Secs(_) => write!(f, "Secs"),
            Self::VersionArray(_) => write!(f, "VersionArray"),
        }
    }
}

/// A physical EPC page.
///
/// `desc` packs the section index (bits 0..4), the reclaimable flag (bit 4)
/// and the physical address (bits 12..). The reclaimable flag and `listed`
/// only change under the active-list lock.
pub struct EpcPage {
    desc: AtomicU64,
    vaddr: VirtAddr,
    owner: Mutex<Option<EpcPageOwner>>,
    listed: AtomicBool,
}

impl EpcPage {
    pub(crate) fn new(section: usize, paddr: PhysAddr, vaddr: VirtAddr) -> Self {
        let mut desc = 0_u64;
        desc.set_bits(DESC_SECTION_BITS, section as u64);
        desc.set_bits(DESC_ADDR_BITS, (paddr >> PAGE_SHIFT) as u64);
        Self {
            desc: AtomicU64::new(desc),
            vaddr,
            owner: Mutex::new(None),
            listed: AtomicBool::new(false),
        }
    }

    fn desc(&self) -> u64 {
        self.desc.load(Ordering::Acquire)
    }

    pub fn section(&self) -> usize {
        self.desc().get_bits(DESC_SECTION_BITS) as usize
    }

    pub fn paddr(&self) -> PhysAddr {
        (self.desc().get_bits(DESC_ADDR_BITS) as usize) << PAGE_SHIFT
    }

    pub fn pfn(&self) -> usize {
        pfn_down(self.paddr())
    }

    /// Address the frame is mapped at, which is how ENCLS leaves name it.
    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    pub fn is_reclaimable(&self) -> bool {
        self.desc().get_bit(DESC_RECLAIMABLE_BIT)
    }

    pub(crate) fn set_reclaimable(&self, reclaimable: bool) {
        let bit = 1 << DESC_RECLAIMABLE_BIT;
        if reclaimable {
            self.desc.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.desc.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Whether the frame currently sits on the active list.
    pub fn is_listed(&self) -> bool {
        self.listed.load(Ordering::Acquire)
    }

    pub(crate) fn set_listed(&self, listed: bool) {
        self.listed.store(listed, Ordering::Release);
    }

    pub fn owner(&self) -> Option<EpcPageOwner> {
        self.owner.lock().clone()
    }

    /// Replace the back-reference, returning the previous one.
    pub(crate) fn set_owner(&self, owner: Option<EpcPageOwner>) -> Option<EpcPageOwner> {
        core::mem::replace(&mut *self.owner.lock(), owner)
    }

    pub fn is_free(&self) -> bool {
        self.owner.lock().is_none()
    }
}

impl Debug for EpcPage {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("EpcPage")
            .field("paddr", &format_args!("{:#x}", self.paddr()))
            .field("section", &self.section())
            .field("reclaimable", &self.is_reclaimable())
            .field("owner", &*self.owner.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_bits() {
        let page = EpcPage::new(5, 0x8123_4000, 0xffff_0000_1234_4000);
        assert_eq!(page.section(), 5);
        assert_eq!(page.paddr(), 0x8123_4000);
        assert_eq!(page.pfn(), 0x81234);
        assert!(!page.is_reclaimable());

        page.set_reclaimable(true);
        assert!(page.is_reclaimable());
        assert_eq!(page.section(), 5);
        assert_eq!(page.paddr(), 0x8123_4000);
        page.set_reclaimable(false);
        assert!(!page.is_reclaimable());
    }

    #[test]
    fn test_owner() {
        let page = EpcPage::new(0, 0x1000, 0x1000);
        assert!(page.is_free());
        let old = page.set_owner(Some(EpcPageOwner::Page {
            encl: Weak::new(),
            addr: 0x7000,
        }));
        assert!(old.is_none());
        assert_eq!(page.owner().and_then(|o| o.addr()), Some(0x7000));
        assert!(page.owner().and_then(|o| o.enclave()).is_none());
        assert!(page.set_owner(None).is_some());
        assert!(page.is_free());
    }
}
