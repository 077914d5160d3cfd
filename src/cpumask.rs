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

use core::mem::size_of;

pub const NR_CPUS: usize = 512;
const BITS_PER_BYTE: usize = 8;
const BITS_PER_USIZE: usize = size_of::<usize>() * BITS_PER_BYTE;
pub const CPU_MASK_LEN: usize = (NR_CPUS + BITS_PER_USIZE - 1) / BITS_PER_USIZE;

/// Set of logical processors, e.g. the CPUs an address space has run on.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuMask([usize; CPU_MASK_LEN]);

impl Default for CpuMask {
    fn default() -> Self {
        Self([0; CPU_MASK_LEN])
    }
}

impl CpuMask {
    pub fn set_cpu(&mut self, cpuid: usize) {
        self.0[cpuid / BITS_PER_USIZE] |= 1 << (cpuid % BITS_PER_USIZE);
    }

    pub fn clear_cpu(&mut self, cpuid: usize) {
        self.0[cpuid / BITS_PER_USIZE] &= !(1 << (cpuid % BITS_PER_USIZE));
    }

    pub fn test_cpu(&self, cpuid: usize) -> bool {
        self.0[cpuid / BITS_PER_USIZE] & (1 << (cpuid % BITS_PER_USIZE)) != 0
    }

    pub fn clear(&mut self) {
        self.0 = [0; CPU_MASK_LEN];
    }

    /// `self |= other`
    pub fn or(&mut self, other: &CpuMask) {
        for (dst, src) in self.0.iter_mut().zip(other.0.iter()) {
            *dst |= *src;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn weight(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NR_CPUS).filter(move |cpu| self.test_cpu(*cpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let mut mask = CpuMask::default();
        assert!(mask.is_empty());
        mask.set_cpu(0);
        mask.set_cpu(65);
        mask.set_cpu(511);
        assert!(mask.test_cpu(65));
        assert_eq!(mask.weight(), 3);
        mask.clear_cpu(65);
        assert!(!mask.test_cpu(65));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 511]);
        mask.clear();
        assert!(mask.is_empty());
    }

    #[test]
    fn test_or() {
        let mut a = CpuMask::default();
        let mut b = CpuMask::default();
        a.set_cpu(1);
        b.set_cpu(2);
        b.set_cpu(1);
        a.or(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2]);
    }
}
