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

//! Power-state notifications: enclaves do not survive suspend, so they are
//! torn down before it.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::RwLock;

use super::{Enclave, EnclaveFlags, EnclaveRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmEvent {
    SuspendPrepare,
    HibernationPrepare,
    PostSuspend,
    PostHibernation,
    RestorePrepare,
}

/// Live enclaves, by id.
#[derive(Default)]
pub struct PmNotifierChain {
    enclaves: RwLock<Vec<(usize, Weak<Enclave>)>>,
}

impl PmNotifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, encl: &Arc<Enclave>) {
        self.enclaves
            .write()
            .push((encl.id(), Arc::downgrade(encl)));
    }

    pub fn unregister(&self, id: usize) {
        self.enclaves.write().retain(|(i, _)| *i != id);
    }

    pub fn len(&self) -> usize {
        self.enclaves.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.enclaves.read().is_empty()
    }

    pub fn notify(&self, event: PmEvent) {
        if event != PmEvent::SuspendPrepare && event != PmEvent::HibernationPrepare {
            return;
        }
        // Hold every enclave first: releasing one unregisters it.
        let enclaves: Vec<EnclaveRef> = self
            .enclaves
            .read()
            .iter()
            .filter_map(|(_, e)| e.upgrade())
            .filter_map(|e| e.get_unless_zero())
            .collect();
        for encl in enclaves.iter() {
            encl.suspend();
        }
        info!("{:?}: {} enclaves torn down", event, enclaves.len());
    }
}

impl Enclave {
    fn suspend(&self) {
        {
            let mut inner = self.lock.lock();
            self.destroy(&mut inner);
            inner.flags |= EnclaveFlags::SUSPEND;
        }
        self.work.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;
    use crate::testutil::{Fixture, BASE};

    #[test]
    fn test_suspend_tears_down_enclaves() {
        let f = Fixture::new(16);
        let a = f.build(BASE, 4 * PAGE_SIZE, 2);
        let b = f.build(2 * BASE, 4 * PAGE_SIZE, 2);
        assert_eq!(f.epc.pm().len(), 2);

        f.epc.pm_notify(PmEvent::SuspendPrepare);
        for encl in [&a, &b] {
            let flags = encl.flags();
            assert!(flags.contains(EnclaveFlags::DEAD | EnclaveFlags::SUSPEND));
            assert_eq!(encl.page_count(), 0);
        }
        assert_eq!(f.epc.free_count(), 16);
        assert!(f.epc.pm().len() == 2);
    }

    #[test]
    fn test_other_events_are_ignored() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 2 * PAGE_SIZE, 1);
        for event in [
            PmEvent::PostSuspend,
            PmEvent::PostHibernation,
            PmEvent::RestorePrepare,
        ] {
            f.epc.pm_notify(event);
        }
        assert!(!encl.is_dead());
        assert_eq!(encl.page_count(), 1);
    }

    #[test]
    fn test_released_enclave_unregisters() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 2 * PAGE_SIZE, 1);
        assert_eq!(f.epc.pm().len(), 1);
        drop(encl);
        f.mm.munmap(BASE).unwrap();
        assert!(f.epc.pm().is_empty());
        f.epc.pm_notify(PmEvent::HibernationPrepare);
        assert_eq!(f.epc.free_count(), 8);
    }
}
