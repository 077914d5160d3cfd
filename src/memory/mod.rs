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

pub mod addr;
pub mod epc_page;
pub mod section;

use alloc::boxed::Box;
use core::fmt::{Debug, Formatter, Result};
use core::ops::{Deref, DerefMut};

pub use crate::consts::PAGE_SIZE;
pub use addr::{PhysAddr, VirtAddr};
pub use epc_page::{EpcPage, EpcPageOwner};
pub use section::{EpcSection, EpcSections};

/// A page-sized, page-aligned byte buffer.
#[repr(align(4096))]
#[derive(Clone)]
pub struct AlignedPage([u8; PAGE_SIZE]);

impl AlignedPage {
    pub const fn new() -> Self {
        Self([0; PAGE_SIZE])
    }

    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    pub fn from_slice(data: &[u8]) -> Box<Self> {
        let mut page = Self::boxed();
        let len = data.len().min(PAGE_SIZE);
        page.0[..len].copy_from_slice(&data[..len]);
        page
    }
}

impl Default for AlignedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for AlignedPage {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "AlignedPage({:02x?}..)", &self.0[..8])
    }
}

impl Deref for AlignedPage {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AlignedPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
