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

//! EPC sections and their free lists.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::addr::{PhysAddr, VirtAddr};
use super::epc_page::EpcPage;
use crate::config::{EpcConfig, EpcSectionConfig};
use crate::consts::PAGE_SIZE;
use crate::error::EpcResult;

/// One physically contiguous EPC region.
pub struct EpcSection {
    index: usize,
    paddr: PhysAddr,
    vaddr: VirtAddr,
    size: usize,
    pages: Vec<Arc<EpcPage>>,
    page_list: Mutex<Vec<Arc<EpcPage>>>,
    free_cnt: AtomicUsize,
}

impl EpcSection {
    fn new(index: usize, config: &EpcSectionConfig) -> Self {
        let paddr = config.phys_start as PhysAddr;
        let vaddr = config.virt_start as VirtAddr;
        let nr_pages = config.page_count();
        let pages: Vec<_> = (0..nr_pages)
            .map(|i| Arc::new(EpcPage::new(index, paddr + i * PAGE_SIZE, vaddr + i * PAGE_SIZE)))
            .collect();
        // Pop from the tail, so hand out low addresses first.
        let page_list = pages.iter().rev().cloned().collect();
        Self {
            index,
            paddr,
            vaddr,
            size: nr_pages * PAGE_SIZE,
            pages,
            page_list: Mutex::new(page_list),
            free_cnt: AtomicUsize::new(nr_pages),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn paddr_range(&self) -> Range<PhysAddr> {
        self.paddr..self.paddr + self.size
    }

    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Lock-free read, only good as a heuristic.
    pub fn free_count(&self) -> usize {
        self.free_cnt.load(Ordering::Acquire)
    }

    fn try_alloc(&self) -> Option<Arc<EpcPage>> {
        let mut list = self.page_list.lock();
        let page = list.pop()?;
        self.free_cnt.store(list.len(), Ordering::Release);
        Some(page)
    }

    fn put(&self, page: Arc<EpcPage>) {
        let mut list = self.page_list.lock();
        list.push(page);
        self.free_cnt.store(list.len(), Ordering::Release);
    }

    fn page(&self, paddr: PhysAddr) -> Option<&Arc<EpcPage>> {
        if !self.paddr_range().contains(&paddr) {
            return None;
        }
        self.pages.get((paddr - self.paddr) / PAGE_SIZE)
    }
}

/// The fixed set of sections, initialized once and never torn down.
pub struct EpcSections {
    sections: Vec<EpcSection>,
}

impl EpcSections {
    pub fn new(config: &EpcConfig) -> EpcResult<Self> {
        config.validate()?;
        let sections: Vec<_> = config
            .sections
            .iter()
            .enumerate()
            .map(|(i, s)| EpcSection::new(i, s))
            .collect();
        for s in &sections {
            info!(
                "EPC section {}: {:#x?}, {} pages",
                s.index,
                s.paddr_range(),
                s.page_count()
            );
        }
        Ok(Self { sections })
    }

    /// Take a frame from the first section that has one.
    pub fn try_alloc(&self) -> Option<Arc<EpcPage>> {
        let page = self.sections.iter().find_map(|s| s.try_alloc());
        trace!("Allocate EPC page: {:x?}", page.as_ref().map(|p| p.paddr()));
        page
    }

    /// Clear the frame's owner and return it to its section.
    pub fn put_page(&self, page: Arc<EpcPage>) {
        if page.set_owner(None).is_none() {
            error!("EPC page {:#x} freed twice", page.paddr());
            return;
        }
        trace!("Free EPC page: {:#x}", page.paddr());
        match self.sections.get(page.section()) {
            Some(section) => section.put(page),
            None => error!("EPC page {:#x} has no section", page.paddr()),
        }
    }

    pub fn free_count(&self) -> usize {
        self.sections.iter().map(|s| s.free_count()).sum()
    }

    pub fn total_pages(&self) -> usize {
        self.sections.iter().map(|s| s.page_count()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EpcSection> {
        self.sections.iter()
    }

    /// Every frame of every section.
    pub fn pages(&self) -> impl Iterator<Item = &Arc<EpcPage>> {
        self.sections.iter().flat_map(|s| s.pages.iter())
    }

    pub fn page_by_paddr(&self, paddr: PhysAddr) -> Option<&Arc<EpcPage>> {
        self.sections.iter().find_map(|s| s.page(paddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EpcPageOwner;
    use alloc::sync::Weak;

    fn sections() -> EpcSections {
        let config = EpcConfig::new(vec![
            EpcSectionConfig::new(0x8000_0000, 0x1_8000_0000, 2 * PAGE_SIZE as u64),
            EpcSectionConfig::new(0x9000_0000, 0x1_9000_0000, 3 * PAGE_SIZE as u64),
        ]);
        EpcSections::new(&config).unwrap()
    }

    fn owned(page: &Arc<EpcPage>) {
        page.set_owner(Some(EpcPageOwner::Secs(Weak::new())));
    }

    #[test]
    fn test_alloc_in_section_order() {
        let sections = sections();
        assert_eq!(sections.total_pages(), 5);
        assert_eq!(sections.free_count(), 5);

        let pages: Vec<_> = (0..5).map(|_| sections.try_alloc().unwrap()).collect();
        let addrs: Vec<_> = pages.iter().map(|p| p.paddr()).collect();
        assert_eq!(
            addrs,
            vec![0x8000_0000, 0x8000_1000, 0x9000_0000, 0x9000_1000, 0x9000_2000]
        );
        assert_eq!(pages[3].section(), 1);
        assert_eq!(pages[3].vaddr(), 0x1_9000_1000);
        assert!(sections.try_alloc().is_none());
        assert_eq!(sections.free_count(), 0);

        for page in pages {
            owned(&page);
            sections.put_page(page);
        }
        assert_eq!(sections.free_count(), 5);
    }

    #[test]
    fn test_put_clears_owner_and_ignores_double_free() {
        let sections = sections();
        let page = sections.try_alloc().unwrap();
        owned(&page);
        sections.put_page(page.clone());
        assert!(page.is_free());
        assert_eq!(sections.free_count(), 5);
        sections.put_page(page);
        assert_eq!(sections.free_count(), 5);
    }

    #[test]
    fn test_page_lookup() {
        let sections = sections();
        let page = sections.page_by_paddr(0x9000_2000).unwrap();
        assert_eq!(page.section(), 1);
        assert!(sections.page_by_paddr(0x9000_3000).is_none());
        assert_eq!(sections.pages().count(), 5);
    }
}
