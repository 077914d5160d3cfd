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

//! Page geometry and the reclaimer/EINIT tunables.

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Upper bound on the number of EPC sections reported by the platform.
pub const SGX_MAX_EPC_SECTIONS: usize = 8;

/// Pages reclaimed per reclaim pass.
pub const SGX_NR_TO_SCAN: usize = 16;
/// Free-frame count below which allocation wakes the reclaimer.
pub const SGX_NR_LOW_PAGES: usize = 32;
/// Free-frame count above which the reclaimer goes back to sleep.
pub const SGX_NR_HIGH_PAGES: usize = 64;

/// EINIT attempts per spin burst while it keeps reporting an unmasked event.
pub const SGX_EINIT_SPIN_COUNT: usize = 20;
/// Spin bursts before EINIT gives up.
pub const SGX_EINIT_SLEEP_COUNT: usize = 50;
/// Sleep between spin bursts, in milliseconds.
pub const SGX_EINIT_SLEEP_TIME: u64 = 20;

/// How many times the admission worker waits for the reclaimer before giving up.
pub const SGX_ALLOC_RETRY_COUNT: usize = 64;
/// Wait between admission allocation attempts, in milliseconds.
pub const SGX_ALLOC_RETRY_SLEEP: u64 = 10;

/// 8-byte version slots held by one version-array page.
pub const SGX_VA_SLOT_COUNT: usize = PAGE_SIZE / 8;

/// EEXTEND measures a page in chunks of this size.
pub const SGX_EEXTEND_CHUNK_SIZE: usize = 256;

pub const SGX_ENCL_SIZE_MAX_64: u64 = 1 << 36;
pub const SGX_ENCL_SIZE_MAX_32: u64 = 1 << 31;
