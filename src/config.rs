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

//! Runtime description of the EPC and the reclaimer tunables.

use alloc::vec::Vec;
use core::time::Duration;

use crate::consts::*;
use crate::error::EpcResult;
use crate::memory::addr::is_aligned;

/// XSAVE state offset + size per feature bit, as CPUID leaf 0xD reports them
/// on a typical AVX-512 capable part.
const DEFAULT_XSAVE_SIZE_TBL: [(usize, u32); 7] = [
    (2, 576 + 256),   // AVX
    (3, 960 + 64),    // BNDREGS
    (4, 1024 + 64),   // BNDCSR
    (5, 1088 + 64),   // opmask
    (6, 1152 + 512),  // ZMM_Hi256
    (7, 1664 + 1024), // Hi16_ZMM
    (9, 2688 + 8),    // PKRU
];

/// Attribute bits 3, 6 and 8..63 are reserved.
const SGX_ATTR_RESERVED_MASK: u64 = (1 << 3) | (1 << 6) | !0xff;
/// Only MISC_EXINFO is architecturally defined.
const SGX_MISC_RESERVED_MASK: u32 = !1;
/// x87, SSE, AVX, MPX, AVX-512 and PKRU.
const SGX_XFRM_SUPPORTED: u64 = 0x2ff;

/// One physical EPC region.
#[derive(Debug, Clone)]
pub struct EpcSectionConfig {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
}

impl EpcSectionConfig {
    pub fn new(phys_start: u64, virt_start: u64, size: u64) -> Self {
        Self {
            phys_start,
            virt_start,
            size,
        }
    }

    pub fn page_count(&self) -> usize {
        self.size as usize / PAGE_SIZE
    }
}

#[derive(Debug, Clone)]
pub struct EpcConfig {
    pub sections: Vec<EpcSectionConfig>,
    /// Candidates popped from the active list per reclaim pass.
    pub nr_to_scan: usize,
    /// Reclaim start threshold.
    pub nr_low_pages: usize,
    /// Reclaim stop threshold.
    pub nr_high_pages: usize,
    pub einit_spin_count: usize,
    pub einit_sleep_count: usize,
    pub einit_sleep_time: Duration,
    pub alloc_retry_count: usize,
    pub alloc_retry_sleep: Duration,
    pub encl_size_max_64: u64,
    pub encl_size_max_32: u64,
    pub misc_reserved_mask: u32,
    pub attributes_reserved_mask: u64,
    pub xfrm_reserved_mask: u64,
    pub xsave_size_tbl: [u32; 64],
}

impl EpcConfig {
    pub fn new(sections: Vec<EpcSectionConfig>) -> Self {
        let mut xsave_size_tbl = [0; 64];
        for &(bit, size) in DEFAULT_XSAVE_SIZE_TBL.iter() {
            xsave_size_tbl[bit] = size;
        }
        Self {
            sections,
            nr_to_scan: SGX_NR_TO_SCAN,
            nr_low_pages: SGX_NR_LOW_PAGES,
            nr_high_pages: SGX_NR_HIGH_PAGES,
            einit_spin_count: SGX_EINIT_SPIN_COUNT,
            einit_sleep_count: SGX_EINIT_SLEEP_COUNT,
            einit_sleep_time: Duration::from_millis(SGX_EINIT_SLEEP_TIME),
            alloc_retry_count: SGX_ALLOC_RETRY_COUNT,
            alloc_retry_sleep: Duration::from_millis(SGX_ALLOC_RETRY_SLEEP),
            encl_size_max_64: SGX_ENCL_SIZE_MAX_64,
            encl_size_max_32: SGX_ENCL_SIZE_MAX_32,
            misc_reserved_mask: SGX_MISC_RESERVED_MASK,
            attributes_reserved_mask: SGX_ATTR_RESERVED_MASK,
            xfrm_reserved_mask: !SGX_XFRM_SUPPORTED,
            xsave_size_tbl,
        }
    }

    pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
        self.nr_low_pages = low;
        self.nr_high_pages = high;
        self
    }

    pub fn with_scan_batch(mut self, nr_to_scan: usize) -> Self {
        self.nr_to_scan = nr_to_scan;
        self
    }

    pub fn with_einit_retry(mut self, spin: usize, sleep: usize, sleep_time: Duration) -> Self {
        self.einit_spin_count = spin;
        self.einit_sleep_count = sleep;
        self.einit_sleep_time = sleep_time;
        self
    }

    pub fn with_alloc_retry(mut self, count: usize, sleep: Duration) -> Self {
        self.alloc_retry_count = count;
        self.alloc_retry_sleep = sleep;
        self
    }

    pub fn total_pages(&self) -> usize {
        self.sections.iter().map(|s| s.page_count()).sum()
    }

    pub fn validate(&self) -> EpcResult {
        if self.sections.is_empty() {
            return epc_result_err!(EINVAL, "No EPC section");
        }
        if self.sections.len() > SGX_MAX_EPC_SECTIONS {
            return epc_result_err!(
                EINVAL,
                format!(
                    "{} EPC sections, at most {} supported",
                    self.sections.len(),
                    SGX_MAX_EPC_SECTIONS
                )
            );
        }
        for (i, s) in self.sections.iter().enumerate() {
            if s.size == 0
                || !is_aligned(s.phys_start as usize)
                || !is_aligned(s.virt_start as usize)
                || !is_aligned(s.size as usize)
            {
                return epc_result_err!(EINVAL, format!("Invalid EPC section {}: {:#x?}", i, s));
            }
            for other in &self.sections[i + 1..] {
                let overlap = s.phys_start < other.phys_start + other.size
                    && other.phys_start < s.phys_start + s.size;
                if overlap {
                    return epc_result_err!(
                        EINVAL,
                        format!("EPC sections overlap: {:#x?} {:#x?}", s, other)
                    );
                }
            }
        }
        if self.nr_to_scan == 0 {
            return epc_result_err!(EINVAL, "Reclaim batch size must not be zero");
        }
        if self.nr_low_pages > self.nr_high_pages {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Low watermark {} above high watermark {}",
                    self.nr_low_pages, self.nr_high_pages
                )
            );
        }
        Ok(())
    }
}
