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

//! External interruption for interruptible sleeps.

use core::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A pending-signal flag a sleeping caller can be woken by.
#[derive(Default)]
pub struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a signal pending and wake every sleeper.
    pub fn raise(&self) {
        *self.pending.lock() = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.pending.lock() = false;
    }

    pub fn is_pending(&self) -> bool {
        *self.pending.lock()
    }

    /// Sleep for `dur` unless a signal is or becomes pending. Returns `true`
    /// if the sleep was interrupted.
    pub fn sleep_interruptible(&self, dur: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.cond.wait_for(&mut pending, dur);
        }
        *pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_sleep_times_out() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.sleep_interruptible(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_raise_wakes_sleeper() {
        let signal = Arc::new(Signal::new());
        let s = signal.clone();
        let handle = std::thread::spawn(move || s.sleep_interruptible(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        signal.raise();
        assert!(handle.join().unwrap());
        assert!(signal.is_pending());
        signal.clear();
        assert!(!signal.is_pending());
    }
}
