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

//! The software enclave page cache map.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use super::measure::Measure;
use super::tlb_track::TlbTracker;
use crate::enclave::sgx::{SgxEnclPageFlags, SgxEnclPageType, SgxSecInfo};
use crate::memory::{AlignedPage, VirtAddr};

/// Control state kept for every valid SECS entry.
#[derive(Debug)]
pub struct SecsState {
    pub base: usize,
    pub size: usize,
    pub attributes: u64,
    /// Valid child pages, VA pages excluded.
    pub children: usize,
    pub initialized: bool,
    pub measure: Measure,
    pub tracker: TlbTracker,
}

impl SecsState {
    pub fn contains(&self, linaddr: usize) -> bool {
        linaddr >= self.base && linaddr - self.base < self.size
    }
}

/// Enclave Page Cache Map Entry
#[derive(Debug)]
pub struct EpcmEntry {
    /// R, W, X, BLOCKED and VALID fields.
    pub flags: SgxEnclPageFlags,
    pub page_type: SgxEnclPageType,
    /// Linear enclave address of the EPC page.
    pub linaddr: usize,
    /// Frame of the owning SECS, `0` for SECS and VA pages.
    pub secs: VirtAddr,
    pub contents: Box<AlignedPage>,
    pub secs_state: Option<SecsState>,
}

impl EpcmEntry {
    pub fn new(
        sec_info: &SgxSecInfo,
        page_type: SgxEnclPageType,
        linaddr: usize,
        secs: VirtAddr,
    ) -> Self {
        Self {
            flags: sec_info.perm() | SgxEnclPageFlags::VALID,
            page_type,
            linaddr,
            secs,
            contents: AlignedPage::boxed(),
            secs_state: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.flags.contains(SgxEnclPageFlags::BLOCKED)
    }

    pub fn sec_info(&self) -> SgxSecInfo {
        SgxSecInfo::new(self.flags & SgxEnclPageFlags::PERM_MASK, self.page_type)
    }

    /// VA pages hold 512 eight-byte slots.
    pub fn va_slot(&self, offset: usize) -> u64 {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&self.contents[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    pub fn set_va_slot(&mut self, offset: usize, val: u64) {
        self.contents[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
    }
}

/// Valid entries by frame address. Frames with no entry are invalid.
pub type Epcm = BTreeMap<VirtAddr, EpcmEntry>;
