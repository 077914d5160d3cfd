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


//! ksgxswapd: the background reclaimer.
//!
//! Sleeps on `Epc::swapd_wq` until the free count drops under the high
//! watermark with something on the active list, then runs passes until it
//! does not. Allocation wakes it below the low watermark.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::epc::Epc;
use crate::error::EpcResult;

/// Handle on the running reclaimer. Dropping it stops and joins the thread.
pub struct Ksgxswapd {
    epc: Arc<Epc>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ksgxswapd {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for Ksgxswapd {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.epc.swapd_wq.wake_up();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("ksgxswapd panicked");
            }
        }
        info!("ksgxswapd stopped");
    }
}

impl Epc {
    pub fn start_reclaimer(self: &Arc<Self>) -> EpcResult<Ksgxswapd> {
        let stop = Arc::new(AtomicBool::new(false));
        let epc = self.clone();
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name(String::from("ksgxswapd"))
            .spawn(move || epc.swapd(&flag))
            .map_err(|e| epc_err!(ENOMEM, format!("Failed to start ksgxswapd: {}", e)))?;
        info!("ksgxswapd started");
        Ok(Ksgxswapd {
            epc: self.clone(),
            stop,
            thread: Some(thread),
        })
    }

    fn swapd(self: &Arc<Self>, stop: &AtomicBool) {
        let high = self.config().nr_high_pages;
        loop {
            self.swapd_wq
                .wait_event(|| stop.load(Ordering::Acquire) || self.should_reclaim(high));
            if stop.load(Ordering::Acquire) {
                return;
            }
            self.reclaim_pages();
            thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::on_fault;
    use crate::memory::PAGE_SIZE;
    use crate::testutil::{config, Fixture, BASE};
    use core::sync::atomic::AtomicUsize;
    use core::time::Duration;
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_idle_above_high_watermark() {
        let f = Fixture::with_config(config(16).with_watermarks(2, 4));
        let _encl = f.build(BASE, 4 * PAGE_SIZE, 2);
        let swapd = f.epc.start_reclaimer().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(swapd.is_running());
        assert_eq!(f.epc.reclaim_passes(), 0);
        assert_eq!(f.epc.active_count(), 2);
        drop(swapd);
    }

    #[test]
    fn test_reclaims_below_high_watermark() {
        let f = Fixture::with_config(config(8).with_watermarks(4, 8));
        let encl = f.build(BASE, 4 * PAGE_SIZE, 3);
        let swapd = f.epc.start_reclaimer().unwrap();
        assert!(wait_for(|| f.epc.active_count() == 0));
        drop(swapd);
        assert_eq!(f.epc.pages_reclaimed(), 3);
        assert_eq!(encl.lock.lock().page_tree.resident_count(), 0);
    }

    #[test]
    fn test_admission_waits_for_reclaim() {
        // SECS, one VA page and two pages fill it up.
        let f = Fixture::with_config(
            config(4)
                .with_watermarks(1, 2)
                .with_alloc_retry(500, Duration::from_millis(2)),
        );
        let swapd = f.epc.start_reclaimer().unwrap();
        let encl = f.create(BASE, 8 * PAGE_SIZE);
        for i in 0..4 {
            f.add(&encl, BASE + i * PAGE_SIZE, i as u8);
        }
        f.init(&encl).unwrap();
        drop(swapd);
        assert!(!encl.is_dead());
        assert_eq!(encl.page_count(), 4);
        assert!(f.epc.pages_reclaimed() >= 2);
    }

    #[test]
    fn test_no_write_back_while_mapped() {
        let f = Fixture::with_config(config(32).with_watermarks(32, 32));
        let _encl = f.build(BASE, 16 * PAGE_SIZE, 8);
        let violations = Arc::new(AtomicUsize::new(0));
        {
            let mm = f.mm.clone();
            let violations = violations.clone();
            f.encls.set_ewb_probe(move |linaddr| {
                if linaddr != 0 && mm.is_mapped(linaddr) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let stop = Arc::new(AtomicBool::new(false));
        let faulter = {
            let mm = f.mm.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    for i in 0..8 {
                        let addr = BASE + i * PAGE_SIZE;
                        let _ = on_fault(&mm, addr);
                        mm.touch(addr, 1);
                    }
                }
            })
        };
        let swapd = f.epc.start_reclaimer().unwrap();
        thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Release);
        faulter.join().unwrap();

        assert!(wait_for(|| f.epc.active_count() == 0));
        drop(swapd);
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(f.epc.pages_reclaimed(), 8);
    }
}
