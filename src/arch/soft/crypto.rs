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

//! Confidentiality and integrity for pages written back by the software EWB.

use core::hash::{BuildHasher, Hasher};
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::hash_map::RandomState;

use sha2::{Digest, Sha256};

use crate::enclave::sgx::SgxSecInfo;
use crate::error::EpcResult;
use crate::memory::PAGE_SIZE;

pub const RECLAIM_KEY_LEN: usize = 16;
pub const RECLAIM_MAC_LEN: usize = 16;

lazy_static! {
    static ref RECLAIM_KEY: [u8; RECLAIM_KEY_LEN] = {
        let mut key = [0_u8; RECLAIM_KEY_LEN];
        key[..8].copy_from_slice(&random_u64().to_ne_bytes());
        key[8..].copy_from_slice(&random_u64().to_ne_bytes());
        key
    };
    static ref NONCE_SEED: u64 = random_u64();
}

static NONCE_VAL: AtomicU64 = AtomicU64::new(0);

fn random_u64() -> u64 {
    RandomState::new().build_hasher().finish()
}

pub type NonceValue = u64;

/// Version stored in the VA slot. Never zero, zero marks a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce(NonceValue);

impl Nonce {
    pub fn new() -> Self {
        let _ = NONCE_VAL.compare_exchange(0, *NONCE_SEED | 1, Ordering::AcqRel, Ordering::Acquire);
        loop {
            let nonce = NONCE_VAL.fetch_add(1, Ordering::AcqRel);
            if nonce != 0 {
                return Self(nonce);
            }
        }
    }

    pub fn from_val(val: NonceValue) -> Self {
        Self(val)
    }

    pub fn get_val(&self) -> NonceValue {
        self.0
    }
}

/// Everything the MAC binds an evicted page to.
pub struct WriteBackInfo<'a> {
    /// Nonce used to guarantee the freshness.
    pub nonce: Nonce,
    /// Enclave identifier.
    pub enclave_id: u64,
    /// SecInfo of the write back page.
    pub sec_info: &'a SgxSecInfo,
    /// Linear address of the write back page.
    pub linaddr: usize,
}

impl WriteBackInfo<'_> {
    fn keystream_block(&self, index: usize) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&*RECLAIM_KEY);
        hasher.update(self.nonce.get_val().to_le_bytes());
        hasher.update((index as u64).to_le_bytes());
        hasher.finalize().into()
    }

    fn apply_keystream(&self, contents: &mut [u8; PAGE_SIZE]) {
        for (i, chunk) in contents.chunks_mut(32).enumerate() {
            let block = self.keystream_block(i);
            chunk.iter_mut().zip(block.iter()).for_each(|(b, k)| *b ^= k);
        }
    }

    fn mac(&self, ciphertext: &[u8; PAGE_SIZE]) -> [u8; RECLAIM_MAC_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&*RECLAIM_KEY);
        hasher.update(self.nonce.get_val().to_le_bytes());
        hasher.update(self.enclave_id.to_le_bytes());
        hasher.update(self.sec_info.flags.to_le_bytes());
        hasher.update((self.linaddr as u64).to_le_bytes());
        hasher.update(&ciphertext[..]);
        let digest = hasher.finalize();
        let mut mac = [0_u8; RECLAIM_MAC_LEN];
        mac.copy_from_slice(&digest[..RECLAIM_MAC_LEN]);
        mac
    }

    /// Encrypt `contents` in place and return its MAC.
    pub fn seal(&self, contents: &mut [u8; PAGE_SIZE]) -> [u8; RECLAIM_MAC_LEN] {
        self.apply_keystream(contents);
        self.mac(contents)
    }

    /// Check `mac` and decrypt `contents` in place.
    pub fn unseal(&self, contents: &mut [u8; PAGE_SIZE], mac: &[u8; RECLAIM_MAC_LEN]) -> EpcResult {
        if self.mac(contents) != *mac {
            return epc_result_err!(EINVAL, "Write-back MAC mismatch");
        }
        self.apply_keystream(contents);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::sgx::{SgxEnclPageFlags, SgxEnclPageType};

    #[test]
    fn test_nonce_unique_and_nonzero() {
        let a = Nonce::new();
        let b = Nonce::new();
        assert_ne!(a, b);
        assert_ne!(a.get_val(), 0);
    }

    #[test]
    fn test_seal_unseal() {
        let sec_info = SgxSecInfo::new(SgxEnclPageFlags::R, SgxEnclPageType::REG);
        let info = WriteBackInfo {
            nonce: Nonce::new(),
            enclave_id: 0x4000,
            sec_info: &sec_info,
            linaddr: 0x10_1000,
        };
        let mut page = [0x5a_u8; PAGE_SIZE];
        let mac = info.seal(&mut page);
        assert_ne!(page[0], 0x5a);

        let mut tampered = page;
        tampered[100] ^= 1;
        assert!(info.unseal(&mut tampered, &mac).is_err());

        let moved = WriteBackInfo {
            linaddr: 0x10_2000,
            ..info
        };
        assert!(moved.unseal(&mut page.clone(), &mac).is_err());
        assert!(moved.unseal(&mut page, &mac).is_err());

        let info = WriteBackInfo {
            linaddr: 0x10_1000,
            ..moved
        };
        info.unseal(&mut page, &mac).unwrap();
        assert!(page.iter().all(|b| *b == 0x5a));
    }
}
