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

//! The active list and the reclaim pass.
//!
//! Frames of admitted pages sit on `Epc::active`, oldest first. A pass pops
//! a batch off the head, takes a liveness hold on each owner and walks the
//! survivors through `evict`: aging, blocking, then writing back.

mod evict;
pub mod swapd;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use self::evict::Candidate;
use crate::epc::Epc;
use crate::error::EpcResult;
use crate::memory::EpcPage;
use crate::stats::{Instant, ReclaimStatsId};

impl Epc {
    /// Put a frame at the tail of the active list.
    pub(crate) fn mark_page_reclaimable(&self, page: &Arc<EpcPage>) {
        let mut active = self.active.lock();
        page.set_reclaimable(true);
        page.set_listed(true);
        active.push_back(page.clone());
    }

    /// Take a frame off the active list before freeing it. `EBUSY` if a
    /// reclaim pass has it.
    pub(crate) fn unmark_page_reclaimable(&self, page: &Arc<EpcPage>) -> EpcResult {
        let mut active = self.active.lock();
        if page.is_reclaimable() {
            if !page.is_listed() {
                return epc_result_err!(EBUSY, format!("EPC page {:#x} is being reclaimed", page.paddr()));
            }
            active.retain(|p| !Arc::ptr_eq(p, page));
            page.set_listed(false);
            page.set_reclaimable(false);
        }
        Ok(())
    }

    /// Pop up to `nr_to_scan` frames whose enclave can still be held.
    fn isolate_candidates(&self) -> Vec<Candidate> {
        let mut cands = Vec::with_capacity(self.config().nr_to_scan);
        let mut active = self.active.lock();
        while cands.len() < self.config().nr_to_scan {
            let page = match active.pop_front() {
                Some(page) => page,
                None => break,
            };
            page.set_listed(false);
            let held = page.owner().and_then(|owner| {
                let addr = owner.addr()?;
                let encl = owner.enclave()?.get_unless_zero()?;
                Some((encl, addr))
            });
            match held {
                Some((encl, addr)) => {
                    self.counters.isolated.fetch_add(1, Ordering::AcqRel);
                    cands.push(Candidate::new(page, encl, addr));
                }
                // The owner is tearing itself down and frees the frame.
                None => page.set_reclaimable(false),
            }
        }
        cands
    }

    /// Run one reclaim pass and return the number of frames freed.
    pub fn reclaim_pages(self: &Arc<Self>) -> usize {
        let pass_start = Instant::now();
        let cands = self.isolate_candidates();
        if cands.is_empty() {
            return 0;
        }
        let reclaimed = self.reclaim_candidates(cands);
        self.counters.passes.fetch_add(1, Ordering::AcqRel);
        self.stats.record(ReclaimStatsId::Pass, &pass_start);
        trace!("Reclaim pass freed {} EPC pages", reclaimed);
        reclaimed
    }

    /// Age the batch, then block and write back what survived.
    fn reclaim_candidates(&self, cands: Vec<Candidate>) -> usize {
        let start = Instant::now();
        let mut batch = Vec::with_capacity(cands.len());
        for mut cand in cands {
            if cand.age() && cand.reserve_slot() {
                batch.push(cand);
            } else {
                self.abort_candidate(cand);
            }
        }
        self.stats.record(ReclaimStatsId::Evict, &start);

        let start = Instant::now();
        let mut blocked = Vec::with_capacity(batch.len());
        for cand in batch {
            if cand.block() {
                blocked.push(cand);
            } else {
                self.abort_candidate(cand);
            }
        }
        self.stats.record(ReclaimStatsId::Block, &start);

        let start = Instant::now();
        let mut reclaimed = 0;
        for mut cand in blocked {
            let freed = cand.write();
            cand.page.set_reclaimable(false);
            if freed {
                self.put_page(cand.page.clone());
                reclaimed += 1;
            }
            self.counters.isolated.fetch_sub(1, Ordering::AcqRel);
            // The hold is dropped here, after the frame went back.
            drop(cand);
        }
        self.stats.record(ReclaimStatsId::Write, &start);

        self.counters
            .pages_reclaimed
            .fetch_add(reclaimed, Ordering::AcqRel);
        reclaimed
    }

    /// Return a candidate to the active list, then let go of its enclave.
    fn abort_candidate(&self, mut cand: Candidate) {
        cand.cancel();
        self.mark_page_reclaimable(&cand.page);
        self.counters.isolated.fetch_sub(1, Ordering::AcqRel);
        self.counters.pages_aborted.fetch_add(1, Ordering::AcqRel);
        drop(cand);
    }
}
