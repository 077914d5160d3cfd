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

use crate::cpumask::CpuMask;

/// Per-enclave view of which logical processors may still cache
/// translations for pages blocked since the last ETRACK.
#[derive(Debug)]
pub struct TlbTracker {
    /// An ETRACK epoch is open and waiting for tracked threads to exit.
    tracking: bool,
    /// No stale translation can exist for a blocked page, so EWB may proceed.
    write_back_ready: bool,
    /// Logical processors currently executing inside the enclave.
    active_threads: u16,
    /// Threads that were inside when ETRACK ran and have not exited since.
    tracked_threads: u16,
    /// Logical processors that exited after ETRACK.
    exited: CpuMask,
}

impl TlbTracker {
    pub fn active_threads(&self) -> u16 {
        self.active_threads
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn write_back_ready(&self) -> bool {
        self.write_back_ready
    }

    /// A page was blocked: EWB needs a new epoch.
    pub fn invalidate(&mut self) {
        self.tracking = false;
        self.write_back_ready = false;
    }

    /// ETRACK. Fails while a previous epoch is still open.
    pub fn begin(&mut self) -> bool {
        if self.tracking {
            return false;
        }
        if self.active_threads == 0 {
            self.write_back_ready = true;
            return true;
        }
        self.tracking = true;
        self.tracked_threads = self.active_threads;
        self.exited.clear();
        true
    }

    pub fn enter(&mut self, cpu: usize) {
        self.active_threads += 1;
        if self.tracking {
            // Entered after ETRACK: only sees the new epoch.
            self.exited.set_cpu(cpu);
        }
    }

    pub fn exit(&mut self, cpu: usize) {
        self.active_threads = self.active_threads.saturating_sub(1);
        if !self.tracking || self.exited.test_cpu(cpu) {
            return;
        }
        self.exited.set_cpu(cpu);
        self.tracked_threads -= 1;
        if self.tracked_threads == 0 {
            self.write_back_ready = true;
            self.tracking = false;
        }
    }
}

impl Default for TlbTracker {
    fn default() -> Self {
        Self {
            tracking: false,
            write_back_ready: true,
            active_threads: 0,
            tracked_threads: 0,
            exited: CpuMask::default(),
        }
    }
}
