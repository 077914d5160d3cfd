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

//! The EPC context: sections, the active list, the hardware backend and the
//! wait queues shared by the allocator, the reclaimer and the enclaves.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::time::Instant;

use parking_lot::{Condvar, Mutex as SleepMutex};
use spin::Mutex;

use crate::arch::Encls;
use crate::config::EpcConfig;
use crate::enclave::pm::PmNotifierChain;
use crate::error::{EpcErrorNum, EpcResult};
use crate::memory::{EpcPage, EpcPageOwner, EpcSections};
use crate::stats::ReclaimStats;

pub use crate::enclave::pm::PmEvent;

/// Sleepers waiting for a condition that other threads make true.
#[derive(Default)]
pub(crate) struct WaitQueue {
    lock: SleepMutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn wake_up(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Sleep until `cond` holds.
    pub fn wait_event(&self, mut cond: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while !cond() {
            self.cond.wait(&mut guard);
        }
    }

    /// Sleep until `cond` holds or `timeout` passed. Returns the last `cond`.
    pub fn wait_event_timeout(&self, mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if cond() {
                return true;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return cond();
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct ReclaimCounters {
    pub pages_reclaimed: AtomicUsize,
    pub pages_aborted: AtomicUsize,
    pub passes: AtomicUsize,
    /// Frames a reclaim pass took off the active list and still holds.
    pub isolated: AtomicUsize,
}

pub struct Epc {
    config: EpcConfig,
    sections: EpcSections,
    encls: Arc<dyn Encls>,
    /// Frames that can be reclaimed, oldest first.
    pub(crate) active: Mutex<VecDeque<Arc<EpcPage>>>,
    pub(crate) swapd_wq: WaitQueue,
    free_wq: WaitQueue,
    pm: PmNotifierChain,
    next_enclave_id: AtomicUsize,
    pub(crate) counters: ReclaimCounters,
    pub(crate) stats: ReclaimStats,
}

impl Epc {
    pub fn new(config: EpcConfig, encls: Arc<dyn Encls>) -> EpcResult<Arc<Self>> {
        let sections = EpcSections::new(&config)?;
        info!(
            "EPC: {} sections, {} pages, watermarks {}/{}",
            config.sections.len(),
            sections.total_pages(),
            config.nr_low_pages,
            config.nr_high_pages
        );
        Ok(Arc::new(Self {
            config,
            sections,
            encls,
            active: Mutex::new(VecDeque::new()),
            swapd_wq: WaitQueue::default(),
            free_wq: WaitQueue::default(),
            pm: PmNotifierChain::new(),
            next_enclave_id: AtomicUsize::new(1),
            counters: ReclaimCounters::default(),
            stats: ReclaimStats::default(),
        }))
    }

    pub fn config(&self) -> &EpcConfig {
        &self.config
    }

    pub fn encls(&self) -> &dyn Encls {
        self.encls.as_ref()
    }

    pub fn sections(&self) -> &EpcSections {
        &self.sections
    }

    pub(crate) fn pm(&self) -> &PmNotifierChain {
        &self.pm
    }

    pub(crate) fn alloc_enclave_id(&self) -> usize {
        self.next_enclave_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.sections.free_count()
    }

    pub fn total_pages(&self) -> usize {
        self.sections.total_pages()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Free frames below `watermark` and something left to reclaim.
    pub(crate) fn should_reclaim(&self, watermark: usize) -> bool {
        self.free_count() < watermark && !self.active.lock().is_empty()
    }

    /// Take a free frame for `owner`. Fails with `ENOMEM` if nothing could
    /// ever be reclaimed, `EBUSY` if the caller may retry after reclaim.
    pub fn alloc_page(&self, owner: EpcPageOwner) -> EpcResult<Arc<EpcPage>> {
        let res = match self.sections.try_alloc() {
            Some(page) => Ok(page),
            None if !self.can_reclaim() => match self.sections.try_alloc() {
                // A pass finished between the two attempts.
                Some(page) => Ok(page),
                None => epc_result_err!(ENOMEM, "EPC exhausted, nothing to reclaim"),
            },
            None => epc_result_err!(EBUSY, "EPC exhausted"),
        };
        if self.free_count() < self.config.nr_low_pages {
            self.swapd_wq.wake_up();
        }
        let page = res?;
        page.set_owner(Some(owner));
        Ok(page)
    }

    /// Something is on the active list or in a reclaim pass.
    fn can_reclaim(&self) -> bool {
        let active = self.active.lock();
        !active.is_empty() || self.counters.isolated.load(Ordering::Acquire) != 0
    }

    /// `alloc_page` that waits for the reclaimer on `EBUSY`.
    pub fn alloc_page_retry(&self, owner: EpcPageOwner) -> EpcResult<Arc<EpcPage>> {
        for _ in 0..self.config.alloc_retry_count {
            match self.alloc_page(owner.clone()) {
                Err(e) if e.num() == Some(EpcErrorNum::EBUSY) => {
                    self.swapd_wq.wake_up();
                    self.free_wq.wait_event_timeout(
                        || self.free_count() > 0,
                        self.config.alloc_retry_sleep,
                    );
                }
                res => return res,
            }
        }
        self.alloc_page(owner)
    }

    /// Remove the frame from the enclave and give it back to its section.
    pub fn free_page(&self, page: Arc<EpcPage>) -> EpcResult {
        self.unmark_page_reclaimable(&page)?;
        if let Err(e) = self.encls.eremove(page.vaddr()) {
            warn!(
                "EREMOVE returned {} for EPC page {:#x}",
                e.as_string(),
                page.paddr()
            );
            return epc_result_err!(EIO, format!("EREMOVE failed: {}", e.as_string()));
        }
        self.put_page(page);
        Ok(())
    }

    /// Return a frame the hardware no longer holds: after EWB or a
    /// discarding EREMOVE.
    pub fn put_page(&self, page: Arc<EpcPage>) {
        self.sections.put_page(page);
        self.free_wq.wake_up();
    }

    pub fn pm_notify(&self, event: PmEvent) {
        self.pm.notify(event);
    }

    pub fn pages_reclaimed(&self) -> usize {
        self.counters.pages_reclaimed.load(Ordering::Acquire)
    }

    pub fn pages_aborted(&self) -> usize {
        self.counters.pages_aborted.load(Ordering::Acquire)
    }

    pub fn reclaim_passes(&self) -> usize {
        self.counters.passes.load(Ordering::Acquire)
    }

    pub fn reclaim_stats(&self) -> String {
        self.stats.as_string()
    }
}
