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

//! Untrusted backing store of an enclave.
//!
//! Content slots, one page per enclave page plus one for the SECS, followed
//! by the PCMD region: one 128-byte record per content page, 32 per page.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use super::sgx::SgxPcmd;
use crate::consts::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::EpcResult;
use crate::memory::addr::{align_up, pfn_down};
use crate::memory::AlignedPage;

pub const PCMD_SIZE: usize = core::mem::size_of::<SgxPcmd>();
const PCMDS_PER_PAGE: usize = PAGE_SIZE / PCMD_SIZE;

/// Sparse, page-granular store. Untouched pages read as zero.
#[derive(Debug)]
pub struct Backing {
    /// Size of the content region: enclave size plus the SECS slot.
    encl_size: usize,
    size: usize,
    pages: BTreeMap<usize, Box<AlignedPage>>,
}

impl Backing {
    pub fn new(encl_size: usize) -> Self {
        Self {
            encl_size,
            size: encl_size + (encl_size >> 5),
            pages: BTreeMap::new(),
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nr_pages(&self) -> usize {
        align_up(self.size) >> PAGE_SHIFT
    }

    /// Index of the SECS content slot, after the last enclave page.
    pub fn secs_index(&self) -> usize {
        pfn_down(self.encl_size) - 1
    }

    /// Page offset and byte offset of the PCMD of content page `index`.
    pub fn pcmd_location(&self, index: usize) -> (usize, usize) {
        (
            pfn_down(self.encl_size) + index / PCMDS_PER_PAGE,
            (index % PCMDS_PER_PAGE) * PCMD_SIZE,
        )
    }

    fn check(&self, pgoff: usize) -> EpcResult {
        if pgoff >= self.nr_pages() {
            return epc_result_err!(
                EFAULT,
                format!("Backing page {} beyond {} pages", pgoff, self.nr_pages())
            );
        }
        Ok(())
    }

    fn get_page(&mut self, pgoff: usize) -> EpcResult<&mut AlignedPage> {
        self.check(pgoff)?;
        Ok(self.pages.entry(pgoff).or_insert_with(AlignedPage::boxed))
    }

    pub fn read(&self, pgoff: usize, buf: &mut [u8; PAGE_SIZE]) -> EpcResult {
        self.check(pgoff)?;
        match self.pages.get(&pgoff) {
            Some(page) => buf.copy_from_slice(&page[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    pub fn write(&mut self, pgoff: usize, data: &[u8; PAGE_SIZE]) -> EpcResult {
        self.get_page(pgoff)?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_pcmd(&self, index: usize) -> EpcResult<SgxPcmd> {
        let (pgoff, offset) = self.pcmd_location(index);
        self.check(pgoff)?;
        Ok(match self.pages.get(&pgoff) {
            Some(page) => SgxPcmd::from_bytes(&page[offset..offset + PCMD_SIZE]),
            None => SgxPcmd::default(),
        })
    }

    pub fn write_pcmd(&mut self, index: usize, pcmd: &SgxPcmd) -> EpcResult {
        let (pgoff, offset) = self.pcmd_location(index);
        let page = self.get_page(pgoff)?;
        page[offset..offset + PCMD_SIZE].copy_from_slice(pcmd.as_bytes());
        Ok(())
    }

    /// Pages actually materialized.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        // 4 enclave pages and the SECS.
        let backing = Backing::new(5 * PAGE_SIZE);
        assert_eq!(backing.size(), 5 * PAGE_SIZE + 5 * PAGE_SIZE / 32);
        assert_eq!(backing.nr_pages(), 6);
        assert_eq!(backing.secs_index(), 4);
        assert_eq!(backing.pcmd_location(0), (5, 0));
        assert_eq!(backing.pcmd_location(4), (5, 4 * 128));
    }

    #[test]
    fn test_read_write() {
        let mut backing = Backing::new(3 * PAGE_SIZE);
        let mut buf = [1_u8; PAGE_SIZE];
        backing.read(1, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(backing.resident_pages(), 0);

        backing.write(1, &[9; PAGE_SIZE]).unwrap();
        backing.read(1, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 9));

        let mut pcmd = SgxPcmd::default();
        pcmd.enclave_id = 0x1234;
        backing.write_pcmd(2, &pcmd).unwrap();
        assert_eq!(backing.read_pcmd(2).unwrap().enclave_id, 0x1234);
        assert_eq!(backing.read_pcmd(1).unwrap().enclave_id, 0);
        assert!(backing.write(4, &[0; PAGE_SIZE]).is_err());
    }

    proptest! {
        #[test]
        fn pcmd_records_never_overlap_content(pages in 2_usize..4096, index in 0_usize..4096) {
            let encl_size = (pages + 1) * PAGE_SIZE;
            let backing = Backing::new(encl_size);
            let index = index % (pages + 1);
            let (pgoff, offset) = backing.pcmd_location(index);
            prop_assert!(pgoff * PAGE_SIZE >= encl_size);
            prop_assert!(pgoff * PAGE_SIZE + offset + PCMD_SIZE <= align_up(backing.size()));
            prop_assert!(pgoff < backing.nr_pages());
        }
    }
}
