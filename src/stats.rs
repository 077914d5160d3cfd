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

#![allow(dead_code)]

#[cfg(feature = "stats")]
pub use _stats::*;

#[cfg(not(feature = "stats"))]
pub use _stats_empty::*;

use numeric_enum_macro::numeric_enum;

numeric_enum! {
    #[repr(usize)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    /// Timed phases of a reclaim pass.
    pub enum ReclaimStatsId {
        Pass = 0,
        Evict = 1,
        Block = 2,
        Write = 3,
    }
}

pub const RECLAIM_STATS_NUM: usize = 4;

/// Per-phase accumulators for the reclaimer.
#[derive(Default)]
pub struct ReclaimStats {
    values: [StatsValue; RECLAIM_STATS_NUM],
}

impl ReclaimStats {
    pub fn record(&self, id: ReclaimStatsId, start: &Instant) {
        self.values[id as usize].atomic_add(start.elapsed());
    }

    pub fn reset(&self) {
        self.values.iter().for_each(|v| v.atomic_reset());
    }

    #[cfg(feature = "stats")]
    pub fn as_string(&self) -> alloc::string::String {
        let mut s = alloc::string::String::new();
        for (i, v) in self.values.iter().enumerate() {
            if let Ok(id) = ReclaimStatsId::try_from(i) {
                s += &format!("{:?}: {}\n", id, v.as_string());
            }
        }
        s
    }

    #[cfg(not(feature = "stats"))]
    pub fn as_string(&self) -> alloc::string::String {
        alloc::string::String::from("stats disabled")
    }
}

mod _stats {
    use core::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub struct StatsValue {
        count: AtomicU64,
        sum: AtomicU64,
    }

    impl StatsValue {
        pub fn new() -> Self {
            Self {
                count: AtomicU64::new(0),
                sum: AtomicU64::new(0),
            }
        }

        pub fn add(&mut self, value: u64) {
            *self.count.get_mut() += 1;
            *self.sum.get_mut() += value;
        }

        pub fn atomic_add(&self, value: u64) {
            self.count.fetch_add(1, Ordering::Release);
            self.sum.fetch_add(value, Ordering::Release);
        }

        pub fn atomic_reset(&self) {
            self.count.store(0, Ordering::Release);
            self.sum.store(0, Ordering::Release);
        }

        pub fn count(&self) -> u64 {
            self.count.load(Ordering::Acquire)
        }

        /// Average in microseconds, with three decimals.
        pub fn as_string(&self) -> alloc::string::String {
            let sum = self.sum.load(Ordering::Acquire);
            let count = self.count.load(Ordering::Acquire);
            let ave = if count == 0 { 0 } else { sum * 1000 / count };
            format!(
                "count = {}, sum = {}us, average = {}.{:03}us",
                count,
                sum,
                ave / 1000,
                ave % 1000
            )
        }
    }

    pub struct Instant {
        start: std::time::Instant,
    }

    impl Instant {
        pub fn now() -> Self {
            Self {
                start: std::time::Instant::now(),
            }
        }

        /// Microseconds since `now()`.
        pub fn elapsed(&self) -> u64 {
            self.start.elapsed().as_micros() as u64
        }
    }
}

mod _stats_empty {
    #[derive(Default)]
    pub struct StatsValue;
    impl StatsValue {
        pub fn new() -> Self {
            Self
        }
        pub fn add(&mut self, _value: u64) {}
        pub fn atomic_add(&self, _value: u64) {}
        pub fn atomic_reset(&self) {}
        pub fn count(&self) -> u64 {
            0
        }
    }

    pub struct Instant;
    impl Instant {
        pub fn now() -> Self {
            Self
        }
        pub fn elapsed(&self) -> u64 {
            0
        }
    }
}

#[cfg(all(test, feature = "stats"))]
mod test {
    use super::*;

    #[test]
    fn test_reclaim_stats() {
        let stats = ReclaimStats::default();
        let now = Instant::now();
        std::thread::sleep(core::time::Duration::from_millis(2));
        stats.record(ReclaimStatsId::Write, &now);
        assert_eq!(stats.values[ReclaimStatsId::Write as usize].count(), 1);
        assert!(stats.as_string().contains("Write: count = 1"));
        stats.reset();
        assert_eq!(stats.values[ReclaimStatsId::Write as usize].count(), 0);
    }
}
