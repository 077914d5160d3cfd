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

//! Version arrays: the swap-slot tables of an enclave.
//!
//! Each VA page holds `SGX_VA_SLOT_COUNT` eight-byte slots. EWB stores the
//! version of the evicted page in the slot, which is what makes a written
//! out page replay-protected.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::Enclave;
use crate::consts::SGX_VA_SLOT_COUNT;
use crate::error::EpcResult;
use crate::memory::{EpcPage, EpcPageOwner, VirtAddr};

const SLOT_SIZE: usize = 8;
const BITMAP_LEN: usize = SGX_VA_SLOT_COUNT / 64;

/// A reserved version slot: the VA frame and the byte offset in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot {
    pub va_page: VirtAddr,
    pub offset: usize,
}

impl SwapSlot {
    /// Address handed to EWB.
    pub fn addr(&self) -> VirtAddr {
        self.va_page + self.offset
    }
}

#[derive(Debug)]
pub struct VaPage {
    epc_page: Arc<EpcPage>,
    slots: [u64; BITMAP_LEN],
}

impl VaPage {
    pub fn new(epc_page: Arc<EpcPage>) -> Self {
        Self {
            epc_page,
            slots: [0; BITMAP_LEN],
        }
    }

    pub fn epc_page(&self) -> &Arc<EpcPage> {
        &self.epc_page
    }

    pub fn alloc_slot(&mut self) -> Option<SwapSlot> {
        let (word, bits) = self.slots.iter_mut().enumerate().find(|(_, b)| **b != !0)?;
        let bit = bits.trailing_ones() as usize;
        *bits |= 1 << bit;
        Some(SwapSlot {
            va_page: self.epc_page.vaddr(),
            offset: (word * 64 + bit) * SLOT_SIZE,
        })
    }

    pub fn free_slot(&mut self, offset: usize) {
        let idx = offset / SLOT_SIZE;
        self.slots[idx / 64] &= !(1 << (idx % 64));
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|b| *b == !0)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|b| *b == 0)
    }
}

/// The VA pages of one enclave. The head is the one slots come from.
#[derive(Debug, Default)]
pub struct VaPages {
    pages: VecDeque<VaPage>,
}

impl VaPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot from the first page that has one; a page that fills up
    /// moves to the tail. `None` when every page is full.
    pub fn alloc_slot(&mut self) -> Option<SwapSlot> {
        let idx = self.pages.iter().position(|p| !p.is_full())?;
        let slot = self.pages[idx].alloc_slot();
        if self.pages[idx].is_full() {
            if let Some(page) = self.pages.remove(idx) {
                self.pages.push_back(page);
            }
        }
        slot
    }

    pub fn free_slot(&mut self, slot: SwapSlot) {
        if let Some(page) = self
            .pages
            .iter_mut()
            .find(|p| p.epc_page.vaddr() == slot.va_page)
        {
            page.free_slot(slot.offset);
        }
    }

    pub fn push_front(&mut self, page: VaPage) {
        self.pages.push_front(page);
    }

    /// Take out the page at `vaddr`.
    pub fn remove(&mut self, vaddr: VirtAddr) -> Option<VaPage> {
        let idx = self.pages.iter().position(|p| p.epc_page.vaddr() == vaddr)?;
        self.pages.remove(idx)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = VaPage> + '_ {
        self.pages.drain(..)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Enclave {
    /// Count one more page that will need a version slot. Every
    /// `SGX_VA_SLOT_COUNT`th page brings a new VA page, for the caller to
    /// link once the page is committed.
    pub(crate) fn grow(self: &Arc<Self>) -> EpcResult<Option<VaPage>> {
        if self.page_cnt.fetch_add(1, Ordering::AcqRel) % SGX_VA_SLOT_COUNT != 0 {
            return Ok(None);
        }
        let epc = self.epc();
        let epc_page = match epc.alloc_page_retry(EpcPageOwner::version_array(self)) {
            Ok(epc_page) => epc_page,
            Err(e) => {
                self.page_cnt.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        if let Err(e) = epc.encls().epa(epc_page.vaddr()) {
            warn!("EPA returned {}", e.as_string());
            self.page_cnt.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = epc.free_page(epc_page) {
                warn!("Failed to free VA page: {:?}", e);
            }
            return Err(encls_err!(e, "EPA failed"));
        }
        Ok(Some(VaPage::new(epc_page)))
    }

    /// Undo `grow` for a page that was not committed.
    pub(crate) fn shrink(&self, va_page: Option<VaPage>) {
        self.page_cnt.fetch_sub(1, Ordering::AcqRel);
        if let Some(va_page) = va_page {
            if let Err(e) = self.epc().free_page(va_page.epc_page) {
                warn!("Failed to free VA page: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va_page(vaddr: VirtAddr) -> VaPage {
        VaPage::new(Arc::new(EpcPage::new(0, vaddr, vaddr)))
    }

    #[test]
    fn test_slots() {
        let mut page = va_page(0x1000);
        assert!(page.is_empty());
        let a = page.alloc_slot().unwrap();
        let b = page.alloc_slot().unwrap();
        assert_eq!(a.addr(), 0x1000);
        assert_eq!(b.addr(), 0x1008);
        page.free_slot(a.offset);
        assert_eq!(page.alloc_slot().unwrap(), a);
        for _ in 2..SGX_VA_SLOT_COUNT {
            page.alloc_slot().unwrap();
        }
        assert!(page.is_full());
        assert!(page.alloc_slot().is_none());
    }

    #[test]
    fn test_full_page_rotates() {
        let mut pages = VaPages::new();
        assert!(pages.alloc_slot().is_none());
        pages.push_front(va_page(0x2000));
        pages.push_front(va_page(0x1000));
        for _ in 0..SGX_VA_SLOT_COUNT {
            assert_eq!(pages.alloc_slot().unwrap().va_page, 0x1000);
        }
        let slot = pages.alloc_slot().unwrap();
        assert_eq!(slot.va_page, 0x2000);

        pages.free_slot(SwapSlot {
            va_page: 0x1000,
            offset: 8,
        });
        assert_eq!(pages.alloc_slot().unwrap().va_page, 0x2000);
        assert_eq!(pages.len(), 2);
    }
}
