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

//! A deferred work item backed by a named worker thread.
//!
//! Like a kernel work item: queuing is a no-op while the item is already
//! pending, runs of the same item never overlap, and `flush` waits for the
//! pending and running executions to finish.

use alloc::string::String;
#[cfg(test)]
use core::sync::atomic::{AtomicBool, Ordering};
use std::{io, thread};

use parking_lot::{Condvar, Mutex};

use crate::error::EpcResult;

#[derive(Default)]
struct WorkState {
    pending: bool,
    running: bool,
}

pub struct Work {
    name: String,
    state: Mutex<WorkState>,
    cond: Condvar,
    #[cfg(test)]
    fail_spawn: AtomicBool,
}

impl Work {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(WorkState::default()),
            cond: Condvar::new(),
            #[cfg(test)]
            fail_spawn: AtomicBool::new(false),
        }
    }

    /// Run `f` on a worker thread unless the item is already pending.
    /// Returns whether `f` was queued.
    pub fn queue<F>(self: &alloc::sync::Arc<Self>, f: F) -> EpcResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.pending {
                return Ok(false);
            }
            state.pending = true;
        }

        let work = self.clone();
        let res = if self.spawn_fails() {
            Err(io::Error::new(io::ErrorKind::Other, "spawn refused"))
        } else {
            thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || {
                    {
                        let mut state = work.state.lock();
                        while state.running {
                            work.cond.wait(&mut state);
                        }
                        state.pending = false;
                        state.running = true;
                    }
                    f();
                    work.state.lock().running = false;
                    work.cond.notify_all();
                })
                .map(drop)
        };
        if let Err(e) = res {
            self.state.lock().pending = false;
            self.cond.notify_all();
            return epc_result_err!(ENOMEM, format!("Failed to spawn {}: {}", self.name, e));
        }
        Ok(true)
    }

    #[cfg(not(test))]
    fn spawn_fails(&self) -> bool {
        false
    }

    #[cfg(test)]
    fn spawn_fails(&self) -> bool {
        self.fail_spawn.swap(false, Ordering::AcqRel)
    }

    /// Make the next `queue` fail as if no thread could be started.
    #[cfg(test)]
    pub(crate) fn fail_next_spawn(&self) {
        self.fail_spawn.store(true, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.pending || state.running
    }

    /// Wait until the item is neither pending nor running. Must not be called
    /// from the item itself.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        while state.pending || state.running {
            self.cond.wait(&mut state);
        }
    }
}
