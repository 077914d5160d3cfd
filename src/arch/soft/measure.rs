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

//! MRENCLAVE accumulation for the software ECREATE/EADD/EEXTEND leaves.

use core::mem::size_of;

use sha2::{Digest, Sha256};

use crate::consts::SGX_EEXTEND_CHUNK_SIZE;
use crate::enclave::sgx::SgxSecInfo;

const DATA_BLOCK_SIZE: usize = 64;
const SIZE_NAMED_VALUE: usize = 8;

#[derive(Clone, Debug)]
pub struct Measure {
    hasher: Sha256,
}

impl Measure {
    /// ECREATE block: tag, SSA frame size, enclave size.
    pub fn new(enclave_size: u64, ssa_frame_size: u32) -> Self {
        let mut block = [0_u8; DATA_BLOCK_SIZE];
        block[..7].copy_from_slice(b"ECREATE");
        let mut offset = SIZE_NAMED_VALUE;
        block[offset..offset + size_of::<u32>()].copy_from_slice(&ssa_frame_size.to_le_bytes());
        offset += size_of::<u32>();
        block[offset..offset + size_of::<u64>()].copy_from_slice(&enclave_size.to_le_bytes());

        let mut hasher = Sha256::new();
        hasher.update(block);
        Self { hasher }
    }

    /// EADD block: tag, page offset, SECINFO flags.
    pub fn add(&mut self, page_offset: u64, sec_info: &SgxSecInfo) {
        let mut block = [0_u8; DATA_BLOCK_SIZE];
        block[..4].copy_from_slice(b"EADD");
        let mut offset = SIZE_NAMED_VALUE;
        block[offset..offset + size_of::<u64>()].copy_from_slice(&page_offset.to_le_bytes());
        offset += size_of::<u64>();
        block[offset..offset + size_of::<u64>()].copy_from_slice(&sec_info.flags.to_le_bytes());
        self.hasher.update(block);
    }

    /// EEXTEND block: tag and chunk offset, followed by the 256 measured bytes.
    pub fn extend(&mut self, chunk_offset: u64, chunk: &[u8]) {
        let mut block = [0_u8; DATA_BLOCK_SIZE];
        block[..7].copy_from_slice(b"EEXTEND");
        block[SIZE_NAMED_VALUE..SIZE_NAMED_VALUE + size_of::<u64>()]
            .copy_from_slice(&chunk_offset.to_le_bytes());
        self.hasher.update(block);
        self.hasher.update(&chunk[..SGX_EEXTEND_CHUNK_SIZE]);
    }

    /// Digest so far, without closing the measurement.
    pub fn peek(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }
}
