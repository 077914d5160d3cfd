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

//! Logical enclave pages and the per-enclave page directory.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use super::sgx::SgxEnclPageType;
use super::va::SwapSlot;
use crate::error::EpcResult;
use crate::memory::addr::pfn_down;
use crate::memory::EpcPage;

/// A page of an enclave, resident or not.
#[derive(Debug)]
pub struct EnclavePage {
    addr: usize,
    page_type: SgxEnclPageType,
    /// Frame holding the page, `None` while swapped out or being written out.
    pub(crate) epc_page: Option<Arc<EpcPage>>,
    /// A reclaim pass owns the frame.
    pub(crate) reclaimed: bool,
    /// Where the last write-back put its version.
    pub(crate) swap: Option<SwapSlot>,
}

impl EnclavePage {
    pub fn new(addr: usize, page_type: SgxEnclPageType) -> Self {
        Self {
            addr,
            page_type,
            epc_page: None,
            reclaimed: false,
            swap: None,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn page_type(&self) -> SgxEnclPageType {
        self.page_type
    }

    pub fn epc_page(&self) -> Option<&Arc<EpcPage>> {
        self.epc_page.as_ref()
    }

    pub fn is_resident(&self) -> bool {
        self.epc_page.is_some()
    }

    pub fn is_reclaim_in_flight(&self) -> bool {
        self.reclaimed
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap
    }
}

/// Sparse map from page index to page. Pages are write-once by address.
#[derive(Debug, Default)]
pub struct PageDirectory {
    pages: BTreeMap<usize, EnclavePage>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, page: EnclavePage) -> EpcResult<&mut EnclavePage> {
        use alloc::collections::btree_map::Entry;
        match self.pages.entry(pfn_down(page.addr)) {
            Entry::Occupied(_) => {
                epc_result_err!(EEXIST, format!("Page {:#x} already added", page.addr))
            }
            Entry::Vacant(v) => Ok(v.insert(page)),
        }
    }

    pub fn lookup(&self, addr: usize) -> Option<&EnclavePage> {
        self.pages.get(&pfn_down(addr))
    }

    pub fn lookup_mut(&mut self, addr: usize) -> Option<&mut EnclavePage> {
        self.pages.get_mut(&pfn_down(addr))
    }

    pub fn remove(&mut self, addr: usize) -> Option<EnclavePage> {
        self.pages.remove(&pfn_down(addr))
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.pages.contains_key(&pfn_down(addr))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn addrs(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages.values().map(|p| p.addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnclavePage> {
        self.pages.values()
    }

    pub fn resident_count(&self) -> usize {
        self.pages.values().filter(|p| p.is_resident()).count()
    }
}
