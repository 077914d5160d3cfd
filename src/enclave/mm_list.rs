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

//! Address spaces an enclave is mapped into.
//!
//! Every address space with an enclave VMA has one `EnclaveMm` binding on the
//! enclave's `mm_list`, counted once per VMA. Walkers take a binding and a
//! hold on its address space one step at a time through `next_mm`, so the
//! list can change between steps.

use alloc::sync::{Arc, Weak};
use core::ops::{ControlFlow, Deref};
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{Enclave, EnclaveFlags};
use crate::mm::{AddressSpace, Vma};

pub struct EnclaveMm {
    encl: Weak<Enclave>,
    mm: Weak<AddressSpace>,
    mm_id: usize,
    refcount: AtomicUsize,
}

impl EnclaveMm {
    pub fn mm_id(&self) -> usize {
        self.mm_id
    }

    fn get_unless_zero(&self) -> bool {
        let mut cnt = self.refcount.load(Ordering::Acquire);
        loop {
            if cnt == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                cnt,
                cnt + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) => cnt = cur,
            }
        }
    }
}

/// One counted reference to a binding. The last one unlinks it.
pub struct MmRef(Arc<EnclaveMm>);

impl MmRef {
    pub fn binding(&self) -> &Arc<EnclaveMm> {
        &self.0
    }
}

impl Drop for MmRef {
    fn drop(&mut self) {
        if self.0.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(encl) = self.0.encl.upgrade() {
            encl.mm_list.lock().retain(|m| !Arc::ptr_eq(m, &self.0));
        }
        trace!("Released binding of mm {}", self.0.mm_id);
    }
}

/// A binding plus a hold on its address space, as handed out by `next_mm`.
pub struct MmHold {
    binding: MmRef,
    mm: Arc<AddressSpace>,
}

impl MmHold {
    pub fn mm(&self) -> &Arc<AddressSpace> {
        &self.mm
    }

    pub fn binding(&self) -> &Arc<EnclaveMm> {
        self.binding.binding()
    }
}

impl Deref for MmHold {
    type Target = AddressSpace;

    fn deref(&self) -> &AddressSpace {
        &self.mm
    }
}

impl Drop for MmHold {
    fn drop(&mut self) {
        self.mm.mmdrop();
    }
}

/// Result of one step over `mm_list`.
pub enum MmIter {
    Next(MmHold),
    /// The next binding or its address space is going away: try the same
    /// step again.
    Restart,
    Done,
}

impl Enclave {
    /// The binding after `prev` (or the first one), with both counts taken.
    pub fn next_mm(&self, prev: Option<&Arc<EnclaveMm>>) -> MmIter {
        // Counts dropped here may unlink, which takes `mm_list`.
        let (res, put) = {
            let list = self.mm_list.lock();
            let idx = match prev {
                None => 0,
                Some(prev) => match list.iter().position(|m| Arc::ptr_eq(m, prev)) {
                    Some(i) => i + 1,
                    None => return MmIter::Done,
                },
            };
            let next = match list.get(idx) {
                Some(next) => next.clone(),
                None => return MmIter::Done,
            };
            if !next.get_unless_zero() {
                return MmIter::Restart;
            }
            let binding = MmRef(next);
            match binding.0.mm.upgrade() {
                Some(mm) if mm.mmgrab_unless_zero() => (MmIter::Next(MmHold { binding, mm }), None),
                _ => (MmIter::Restart, Some(binding)),
            }
        };
        drop(put);
        res
    }

    /// Run `f` on every bound address space until it breaks.
    pub fn for_each_mm(&self, mut f: impl FnMut(&MmHold) -> ControlFlow<()>) {
        let mut prev: Option<MmHold> = None;
        loop {
            match self.next_mm(prev.as_ref().map(|h| h.binding())) {
                MmIter::Next(hold) => {
                    let hold = prev.insert(hold);
                    if f(hold).is_break() {
                        return;
                    }
                }
                MmIter::Restart => core::hint::spin_loop(),
                MmIter::Done => return,
            }
        }
    }

    /// This enclave's binding for `mm`, if it is still counted.
    pub fn get_mm(&self, mm: &AddressSpace) -> Option<MmRef> {
        let list = self.mm_list.lock();
        list.iter()
            .find(|m| m.mm_id == mm.id() && m.get_unless_zero())
            .map(|m| MmRef(m.clone()))
    }

    /// A new VMA of this enclave appeared in `mm`. Returns its binding
    /// reference, `None` once the enclave is dead.
    pub fn vma_open(self: &Arc<Self>, mm: &Arc<AddressSpace>) -> Option<MmRef> {
        if self.flags().contains(EnclaveFlags::DEAD) {
            return None;
        }
        let mut list = self.mm_list.lock();
        if let Some(m) = list
            .iter()
            .find(|m| m.mm_id == mm.id() && m.get_unless_zero())
        {
            return Some(MmRef(m.clone()));
        }
        Some(self.add_mm_locked(&mut list, mm))
    }

    pub(crate) fn add_mm_locked(
        self: &Arc<Self>,
        list: &mut alloc::vec::Vec<Arc<EnclaveMm>>,
        mm: &Arc<AddressSpace>,
    ) -> MmRef {
        let binding = Arc::new(EnclaveMm {
            encl: Arc::downgrade(self),
            mm: Arc::downgrade(mm),
            mm_id: mm.id(),
            refcount: AtomicUsize::new(1),
        });
        list.insert(0, binding.clone());
        debug!("Enclave {:#x} mapped into mm {}", self.id(), mm.id());
        MmRef(binding)
    }

    /// A VMA of an enclave went away: drop its binding reference, then the
    /// enclave reference.
    pub fn vma_close(vma: Vma) {
        let Vma { binding, encl } = vma;
        drop(binding);
        drop(encl);
    }

    pub fn mm_count(&self) -> usize {
        self.mm_list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::find_owner;
    use crate::memory::PAGE_SIZE;
    use crate::testutil::{Fixture, BASE};
    use crate::error::EpcErrorNum;
    use core::sync::atomic::AtomicBool;
    use std::collections::BTreeSet;
    use std::thread;

    #[test]
    fn test_binding_per_address_space() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        assert_eq!(encl.mm_count(), 1);

        let mm2 = AddressSpace::new();
        mm2.dup_vma(&f.mm, BASE).unwrap();
        assert_eq!(encl.mm_count(), 2);
        assert!(encl.get_mm(&mm2).is_some());

        let mut seen = alloc::vec::Vec::new();
        encl.for_each_mm(|mm| {
            seen.push(mm.id());
            ControlFlow::Continue(())
        });
        // Newest binding first.
        assert_eq!(seen, vec![mm2.id(), f.mm.id()]);

        mm2.munmap(BASE).unwrap();
        assert_eq!(encl.mm_count(), 1);
        assert!(encl.get_mm(&mm2).is_none());
        assert_eq!(mm2.mm_count(), 1);
    }

    #[test]
    fn test_walk_restarts_on_exiting_mm() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        let mm2 = AddressSpace::new();
        mm2.dup_vma(&f.mm, BASE).unwrap();

        // mm2 started exiting but its VMA is still there.
        mm2.mmdrop();
        assert!(matches!(encl.next_mm(None), MmIter::Restart));

        mm2.munmap(BASE).unwrap();
        match encl.next_mm(None) {
            MmIter::Next(hold) => {
                assert_eq!(hold.mm().id(), f.mm.id());
                assert_eq!(f.mm.mm_count(), 2);
                assert!(matches!(encl.next_mm(Some(hold.binding())), MmIter::Done));
            }
            _ => panic!("expected the first address space"),
        }
        assert_eq!(f.mm.mm_count(), 1);
    }

    #[test]
    fn test_break_stops_walk() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        let mm2 = AddressSpace::new();
        mm2.dup_vma(&f.mm, BASE).unwrap();
        let mut visits = 0;
        encl.for_each_mm(|_| {
            visits += 1;
            ControlFlow::Break(())
        });
        assert_eq!(visits, 1);
        assert_eq!(f.mm.mm_count(), 1);
        assert_eq!(mm2.mm_count(), 1);
    }

    #[test]
    fn test_dead_enclave_not_copied() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        encl.destroy_forced();
        let mm2 = AddressSpace::new();
        mm2.dup_vma(&f.mm, BASE).unwrap();
        assert_eq!(encl.mm_count(), 1);
        let err = find_owner(&mm2, BASE).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::ENOENT));
    }

    #[test]
    fn test_exit_releases_enclave() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        let weak = Arc::downgrade(encl.arc());
        assert_eq!(encl.refcount(), 2);
        drop(encl);
        f.mm.exit();
        assert!(weak.upgrade().is_none());
        assert_eq!(f.epc.free_count(), 8);
    }

    #[test]
    fn test_walk_with_concurrent_fork_and_exit() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        let stable: Vec<_> = (0..2)
            .map(|_| {
                let mm = AddressSpace::new();
                mm.dup_vma(&f.mm, BASE).unwrap();
                mm
            })
            .collect();
        let expected: BTreeSet<_> = stable
            .iter()
            .map(|mm| mm.id())
            .chain(Some(f.mm.id()))
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let churn = {
            let (parent, stop) = (f.mm.clone(), stop.clone());
            thread::spawn(move || {
                let mut live = Vec::new();
                while !stop.load(Ordering::Acquire) {
                    let child = AddressSpace::new();
                    child.dup_vma(&parent, BASE).unwrap();
                    live.push(child);
                    if live.len() > 3 {
                        live.remove(0).exit();
                    }
                    thread::yield_now();
                }
                for child in live {
                    child.exit();
                }
            })
        };

        for _ in 0..200 {
            let mut seen = BTreeSet::new();
            encl.for_each_mm(|hold| {
                assert!(hold.binding().refcount.load(Ordering::Acquire) > 0);
                assert!(hold.mm_count() > 0);
                // Each binding is visited at most once per walk.
                assert!(seen.insert(hold.mm().id()));
                ControlFlow::Continue(())
            });
            assert!(seen.is_superset(&expected));
        }
        stop.store(true, Ordering::Release);
        churn.join().unwrap();
        assert_eq!(encl.mm_count(), 3);
    }
}
