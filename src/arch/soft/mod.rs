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

//! A software model of the ENCLS leaves.
//!
//! `SoftEncls` keeps an EPCM entry per frame, per-enclave child counts and
//! ETRACK state, and version-array slots, so the page-cache code can run on
//! hosts without SGX. It also records every operation and lets callers inject
//! results, which is how the reclaim paths are exercised in tests.

pub mod crypto;
pub mod epcm;
pub mod measure;
pub mod tlb_track;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use self::crypto::{Nonce, WriteBackInfo};
use self::epcm::{Epcm, EpcmEntry, SecsState};
use self::measure::Measure;
use super::{Encls, EnclsError, EnclsResult, SgxErrorCode, X86_TRAP_GP};
use crate::consts::SGX_EEXTEND_CHUNK_SIZE;
use crate::cpumask::CpuMask;
use crate::enclave::sgx::{
    SgxEinitToken, SgxEnclPageFlags, SgxEnclPageType, SgxPcmd, SgxSecInfo, SgxSecs, SigStruct,
};
use crate::memory::addr::{align_down, is_aligned, page_offset};
use crate::memory::{VirtAddr, PAGE_SIZE};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum EnclsOp {
    Ecreate,
    Eadd,
    Eextend,
    Einit,
    Eblock,
    Etrack,
    Ewb,
    Eremove,
    Epa,
    FlushCpus,
}

/// One entry of the operation log.
#[derive(Clone, Debug)]
pub struct EnclsRecord {
    pub op: EnclsOp,
    /// Frame (or chunk, for EEXTEND) the leaf was issued on.
    pub addr: VirtAddr,
    pub result: EnclsResult,
}

type EwbProbe = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct SoftState {
    epcm: Epcm,
    /// SECS frame of the enclave each CPU is executing.
    running: BTreeMap<usize, VirtAddr>,
    injected: BTreeMap<EnclsOp, VecDeque<EnclsError>>,
    log: Vec<EnclsRecord>,
}

fn gp() -> EnclsError {
    EnclsError::Faulted {
        trapnr: X86_TRAP_GP,
    }
}

fn code(code: SgxErrorCode) -> EnclsError {
    EnclsError::Code(code)
}

impl SoftState {
    fn secs(&self, secs_page: VirtAddr) -> Result<&SecsState, EnclsError> {
        self.epcm
            .get(&secs_page)
            .and_then(|e| e.secs_state.as_ref())
            .ok_or_else(gp)
    }

    fn secs_mut(&mut self, secs_page: VirtAddr) -> Result<&mut SecsState, EnclsError> {
        self.epcm
            .get_mut(&secs_page)
            .and_then(|e| e.secs_state.as_mut())
            .ok_or_else(gp)
    }

    fn add_child(&mut self, secs_page: VirtAddr, delta: isize) {
        if let Ok(secs) = self.secs_mut(secs_page) {
            secs.children = (secs.children as isize + delta).max(0) as usize;
        }
    }

    fn va_slot(&self, va_slot: VirtAddr) -> Result<(VirtAddr, usize), EnclsError> {
        let va_page = align_down(va_slot);
        let offset = page_offset(va_slot);
        match self.epcm.get(&va_page) {
            Some(e) if e.page_type == SgxEnclPageType::VA && offset % 8 == 0 => {
                Ok((va_page, offset))
            }
            _ => Err(gp()),
        }
    }
}

pub struct SoftEncls {
    state: Mutex<SoftState>,
    ewb_probe: RwLock<Option<EwbProbe>>,
}

impl SoftEncls {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftState::default()),
            ewb_probe: RwLock::new(None),
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `op` return `err` without touching the EPCM.
    pub fn inject(&self, op: EnclsOp, err: EnclsError) {
        self.state.lock().injected.entry(op).or_default().push_back(err);
    }

    /// Called with the page's linear address on every EWB that passed its
    /// checks, just before the page is written out. The EPCM is locked while
    /// it runs, so the probe must not call back into the model.
    pub fn set_ewb_probe(&self, probe: impl Fn(usize) + Send + Sync + 'static) {
        *self.ewb_probe.write() = Some(Box::new(probe));
    }

    /// A thread on `cpu` enters the enclave whose SECS is `secs_page`.
    pub fn enter(&self, secs_page: VirtAddr, cpu: usize) -> EnclsResult {
        let mut state = self.state.lock();
        if state.running.contains_key(&cpu) {
            return Err(gp());
        }
        let secs = state.secs_mut(secs_page)?;
        if !secs.initialized {
            return Err(gp());
        }
        secs.tracker.enter(cpu);
        state.running.insert(cpu, secs_page);
        Ok(())
    }

    /// The thread on `cpu` leaves its enclave (EEXIT or AEX).
    pub fn exit(&self, cpu: usize) {
        let mut state = self.state.lock();
        if let Some(secs_page) = state.running.remove(&cpu) {
            if let Ok(secs) = state.secs_mut(secs_page) {
                secs.tracker.exit(cpu);
            }
        }
    }

    pub fn ops(&self) -> Vec<EnclsRecord> {
        self.state.lock().log.clone()
    }

    pub fn count(&self, op: EnclsOp) -> usize {
        self.state.lock().log.iter().filter(|r| r.op == op).count()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn is_valid(&self, epc: VirtAddr) -> bool {
        self.state.lock().epcm.contains_key(&epc)
    }

    pub fn is_blocked(&self, epc: VirtAddr) -> bool {
        self.state
            .lock()
            .epcm
            .get(&epc)
            .map_or(false, |e| e.is_blocked())
    }

    /// Number of valid EPCM entries.
    pub fn valid_count(&self) -> usize {
        self.state.lock().epcm.len()
    }

    pub fn children(&self, secs_page: VirtAddr) -> Option<usize> {
        self.state.lock().secs(secs_page).ok().map(|s| s.children)
    }

    /// MRENCLAVE accumulated so far by ECREATE/EADD/EEXTEND.
    pub fn measurement(&self, secs_page: VirtAddr) -> Option<[u8; 32]> {
        self.state.lock().secs(secs_page).ok().map(|s| s.measure.peek())
    }

    fn run(
        &self,
        op: EnclsOp,
        addr: VirtAddr,
        f: impl FnOnce(&mut SoftState) -> EnclsResult,
    ) -> EnclsResult {
        let mut state = self.state.lock();
        let injected = state.injected.get_mut(&op).and_then(|q| q.pop_front());
        let result = match injected {
            Some(err) => Err(err),
            None => f(&mut state),
        };
        state.log.push(EnclsRecord { op, addr, result });
        result
    }
}

impl Default for SoftEncls {
    fn default() -> Self {
        Self::new()
    }
}

impl Encls for SoftEncls {
    fn ecreate(&self, secs: &SgxSecs, secs_page: VirtAddr) -> EnclsResult {
        self.run(EnclsOp::Ecreate, secs_page, |state| {
            if state.epcm.contains_key(&secs_page) {
                return Err(gp());
            }
            let sec_info = SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::SECS);
            let mut entry = EpcmEntry::new(&sec_info, SgxEnclPageType::SECS, 0, 0);
            entry.secs_state = Some(SecsState {
                base: secs.base_addr as usize,
                size: secs.size as usize,
                attributes: secs.attributes,
                children: 0,
                initialized: false,
                measure: Measure::new(secs.size, secs.ssa_frame_size),
                tracker: Default::default(),
            });
            state.epcm.insert(secs_page, entry);
            Ok(())
        })
    }

    fn eadd(
        &self,
        secs_page: VirtAddr,
        linaddr: usize,
        secinfo: &SgxSecInfo,
        contents: &[u8; PAGE_SIZE],
        epc: VirtAddr,
    ) -> EnclsResult {
        self.run(EnclsOp::Eadd, epc, |state| {
            let page_type = secinfo.page_type().map_err(|_| gp())?;
            if state.epcm.contains_key(&epc) || !is_aligned(linaddr) {
                return Err(gp());
            }
            let secs = state.secs_mut(secs_page)?;
            if secs.initialized || !secs.contains(linaddr) {
                return Err(gp());
            }
            secs.measure.add((linaddr - secs.base) as u64, secinfo);
            secs.children += 1;

            let mut entry = EpcmEntry::new(secinfo, page_type, linaddr, secs_page);
            entry.contents.copy_from_slice(contents);
            state.epcm.insert(epc, entry);
            Ok(())
        })
    }

    fn eextend(&self, secs_page: VirtAddr, chunk: VirtAddr) -> EnclsResult {
        self.run(EnclsOp::Eextend, chunk, |state| {
            let offset = page_offset(chunk);
            if offset % SGX_EEXTEND_CHUNK_SIZE != 0 {
                return Err(gp());
            }
            let entry = state.epcm.get(&align_down(chunk)).ok_or_else(gp)?;
            if entry.secs != secs_page {
                return Err(gp());
            }
            let linaddr = entry.linaddr + offset;
            let data = entry.contents[offset..offset + SGX_EEXTEND_CHUNK_SIZE].to_vec();
            let secs = state.secs_mut(secs_page)?;
            if secs.initialized {
                return Err(gp());
            }
            secs.measure.extend((linaddr - secs.base) as u64, &data);
            Ok(())
        })
    }

    fn einit(
        &self,
        sigstruct: &SigStruct,
        token: &SgxEinitToken,
        secs_page: VirtAddr,
        mrsigner: &[u8; 32],
    ) -> EnclsResult {
        self.run(EnclsOp::Einit, secs_page, |state| {
            let secs = state.secs_mut(secs_page)?;
            if secs.initialized {
                return Err(gp());
            }
            if *mrsigner != sigstruct.mr_signer() {
                return Err(code(SgxErrorCode::INVALID_SIGNATURE));
            }
            let mut raw = [0_u8; 8];
            raw.copy_from_slice(&sigstruct.body.attributes[..8]);
            let attributes = u64::from_le_bytes(raw);
            raw.copy_from_slice(&sigstruct.body.attributes_mask[..8]);
            let mask = u64::from_le_bytes(raw);
            if secs.attributes & mask != attributes & mask {
                return Err(code(SgxErrorCode::INVALID_ATTRIBUTE));
            }
            let mr_enclave = secs.measure.peek();
            if sigstruct.body.mr_enclave.0 != mr_enclave {
                return Err(code(SgxErrorCode::INVALID_MEASUREMENT));
            }
            if token.valid & 1 != 0 && token.mr_enclave.0 != mr_enclave {
                return Err(code(SgxErrorCode::INVALID_EINITTOKEN));
            }
            secs.initialized = true;
            Ok(())
        })
    }

    fn eblock(&self, epc: VirtAddr) -> EnclsResult {
        self.run(EnclsOp::Eblock, epc, |state| {
            let entry = state
                .epcm
                .get_mut(&epc)
                .ok_or(code(SgxErrorCode::PG_INVLD))?;
            match entry.page_type {
                SgxEnclPageType::REG | SgxEnclPageType::TCS | SgxEnclPageType::TRIM => {}
                _ => return Err(code(SgxErrorCode::NOTBLOCKABLE)),
            }
            if entry.is_blocked() {
                return Err(code(SgxErrorCode::BLKSTATE));
            }
            entry.flags |= SgxEnclPageFlags::BLOCKED;
            let secs_page = entry.secs;
            state.secs_mut(secs_page)?.tracker.invalidate();
            Ok(())
        })
    }

    fn etrack(&self, secs_page: VirtAddr) -> EnclsResult {
        self.run(EnclsOp::Etrack, secs_page, |state| {
            if state.secs_mut(secs_page)?.tracker.begin() {
                Ok(())
            } else {
                Err(code(SgxErrorCode::PREV_TRK_INCMPL))
            }
        })
    }

    fn ewb(
        &self,
        epc: VirtAddr,
        va_slot: VirtAddr,
        contents: &mut [u8; PAGE_SIZE],
        pcmd: &mut SgxPcmd,
    ) -> EnclsResult {
        let probe = self.ewb_probe.read();
        self.run(EnclsOp::Ewb, epc, |state| {
            let (va_page, va_offset) = state.va_slot(va_slot)?;
            let entry = state.epcm.get(&epc).ok_or_else(gp)?;
            match &entry.secs_state {
                Some(secs) if secs.children > 0 => {
                    return Err(code(SgxErrorCode::CHILD_PRESENT));
                }
                Some(_) => {}
                None if entry.page_type == SgxEnclPageType::VA => return Err(gp()),
                None => {
                    if !entry.is_blocked() {
                        return Err(code(SgxErrorCode::PAGE_NOT_BLOCKED));
                    }
                    if !state.secs(entry.secs)?.tracker.write_back_ready() {
                        return Err(code(SgxErrorCode::NOT_TRACKED));
                    }
                }
            }
            let va_entry = state.epcm.get(&va_page).ok_or_else(gp)?;
            if va_entry.va_slot(va_offset) != 0 {
                return Err(code(SgxErrorCode::VA_SLOT_OCCUPIED));
            }
            if let Some(probe) = probe.as_ref() {
                probe(entry.linaddr);
            }

            let nonce = Nonce::new();
            let sec_info = entry.sec_info();
            let info = WriteBackInfo {
                nonce,
                enclave_id: entry.secs as u64,
                sec_info: &sec_info,
                linaddr: entry.linaddr,
            };
            contents.copy_from_slice(&entry.contents[..]);
            let mac = info.seal(contents);
            *pcmd = SgxPcmd {
                sec_info,
                enclave_id: entry.secs as u64,
                mac,
                ..SgxPcmd::default()
            };

            let secs_page = entry.secs;
            if let Some(va_entry) = state.epcm.get_mut(&va_page) {
                va_entry.set_va_slot(va_offset, nonce.get_val());
            }
            state.epcm.remove(&epc);
            state.add_child(secs_page, -1);
            Ok(())
        })
    }

    fn eremove(&self, epc: VirtAddr) -> EnclsResult {
        self.run(EnclsOp::Eremove, epc, |state| {
            let entry = match state.epcm.get(&epc) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            if let Some(secs) = &entry.secs_state {
                if secs.children > 0 {
                    return Err(code(SgxErrorCode::CHILD_PRESENT));
                }
            }
            let counted = entry.page_type != SgxEnclPageType::VA && entry.secs_state.is_none();
            let secs_page = entry.secs;
            state.epcm.remove(&epc);
            if counted {
                state.add_child(secs_page, -1);
            }
            Ok(())
        })
    }

    fn epa(&self, epc: VirtAddr) -> EnclsResult {
        self.run(EnclsOp::Epa, epc, |state| {
            if state.epcm.contains_key(&epc) {
                return Err(gp());
            }
            let sec_info = SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::VA);
            state
                .epcm
                .insert(epc, EpcmEntry::new(&sec_info, SgxEnclPageType::VA, 0, 0));
            Ok(())
        })
    }

    fn flush_cpus(&self, mask: &CpuMask) {
        let _ = self.run(EnclsOp::FlushCpus, 0, |state| {
            let running: Vec<_> = state
                .running
                .iter()
                .filter(|(cpu, _)| mask.test_cpu(**cpu))
                .map(|(cpu, secs)| (*cpu, *secs))
                .collect();
            // AEX and resume: the thread re-enters in the current epoch.
            for (cpu, secs_page) in running {
                if let Ok(secs) = state.secs_mut(secs_page) {
                    secs.tracker.exit(cpu);
                    secs.tracker.enter(cpu);
                }
            }
            Ok(())
        });
    }
}
