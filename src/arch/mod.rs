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

//! The SGX instruction contract consumed by the engine.
//!
//! Every ENCLS leaf the engine needs is a method of [`Encls`]. Frames are
//! named by the address they are mapped at. [`soft::SoftEncls`] implements the
//! contract in software.

pub mod soft;

use alloc::string::String;

use numeric_enum_macro::numeric_enum;

use crate::cpumask::CpuMask;
use crate::enclave::sgx::{SgxEinitToken, SgxPcmd, SgxSecInfo, SgxSecs, SigStruct};
use crate::error::ErrorClass;
use crate::memory::{VirtAddr, PAGE_SIZE};

/// #GP
pub const X86_TRAP_GP: u8 = 13;
/// #PF
pub const X86_TRAP_PF: u8 = 14;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
    /// Architectural return codes of the ENCLS leaves.
    pub enum SgxErrorCode {
        INVALID_SIG_STRUCT = 1,
        INVALID_ATTRIBUTE = 2,
        BLKSTATE = 3,
        INVALID_MEASUREMENT = 4,
        NOTBLOCKABLE = 5,
        PG_INVLD = 6,
        LOCKFAIL = 7,
        INVALID_SIGNATURE = 8,
        MAC_COMPARE_FAIL = 9,
        PAGE_NOT_BLOCKED = 10,
        NOT_TRACKED = 11,
        VA_SLOT_OCCUPIED = 12,
        CHILD_PRESENT = 13,
        ENCLAVE_ACT = 14,
        ENTRYEPOCH_LOCKED = 15,
        INVALID_EINITTOKEN = 16,
        PREV_TRK_INCMPL = 17,
        PG_IS_SECS = 18,
        PAGE_ATTRIBUTES_MISMATCH = 19,
        PAGE_NOT_MODIFIABLE = 20,
        INVALID_CPUSVN = 32,
        INVALID_ISVSVN = 64,
        UNMASKED_EVENT = 128,
        INVALID_KEYNAME = 256,
    }
}

impl SgxErrorCode {
    pub fn as_str(&self) -> &'static str {
        use SgxErrorCode::*;
        match self {
            INVALID_SIG_STRUCT => "SIGSTRUCT contains an invalid value",
            INVALID_ATTRIBUTE => "Enclave is not authorized to run with the requested attributes",
            BLKSTATE => "Page is already in blocked state",
            INVALID_MEASUREMENT => "MRENCLAVE does not match SIGSTRUCT",
            NOTBLOCKABLE => "Page type cannot be blocked",
            PG_INVLD => "Page is not valid",
            LOCKFAIL => "EPCM entry is locked by another thread",
            INVALID_SIGNATURE => "SIGSTRUCT signature does not verify",
            MAC_COMPARE_FAIL => "MAC check failed",
            PAGE_NOT_BLOCKED => "Page is not marked as blocked",
            NOT_TRACKED => "Tracking cycle isn't done",
            VA_SLOT_OCCUPIED => "Version array slot is occupied",
            CHILD_PRESENT => "SECS still has child pages",
            ENCLAVE_ACT => "Exists logical processors executing inside the enclave",
            ENTRYEPOCH_LOCKED => "SECS locked for Entry Epoch update",
            INVALID_EINITTOKEN => "EINITTOKEN is invalid",
            PREV_TRK_INCMPL => "Previous tracking cycle isn't done",
            PG_IS_SECS => "Page is an SECS",
            PAGE_ATTRIBUTES_MISMATCH => "Page attribute mismatches",
            PAGE_NOT_MODIFIABLE => {
                "Page cannot be modified because it is in the PENDING or MODIFIED state"
            }
            INVALID_CPUSVN => "CPUSVN is beyond platform CPUSVN",
            INVALID_ISVSVN => "ISVSVN is greater than the enclave's ISVSVN",
            UNMASKED_EVENT => "An unmasked event arrived during EINIT",
            INVALID_KEYNAME => "Unsupported key name",
        }
    }

    /// A race with another core or a pending event; retrying may succeed.
    pub fn is_transient(&self) -> bool {
        use SgxErrorCode::*;
        matches!(
            self,
            UNMASKED_EVENT | NOT_TRACKED | LOCKFAIL | ENTRYEPOCH_LOCKED | PREV_TRK_INCMPL
        )
    }

    /// A verdict on the caller's input rather than on enclave state.
    pub fn is_benign(&self) -> bool {
        use SgxErrorCode::*;
        matches!(
            self,
            INVALID_SIG_STRUCT
                | INVALID_ATTRIBUTE
                | INVALID_MEASUREMENT
                | INVALID_SIGNATURE
                | INVALID_EINITTOKEN
                | INVALID_CPUSVN
                | INVALID_ISVSVN
                | INVALID_KEYNAME
        )
    }
}

/// Outcome of a failed ENCLS leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclsError {
    /// The leaf raised an exception. The page involved must be discarded.
    Faulted { trapnr: u8 },
    /// The leaf completed and reported an error code.
    Code(SgxErrorCode),
}

pub type EnclsResult = Result<(), EnclsError>;

impl EnclsError {
    pub fn as_string(&self) -> String {
        match self {
            EnclsError::Faulted { trapnr } => format!("ENCLS faulted, trap {}", trapnr),
            EnclsError::Code(code) => String::from(code.as_str()),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            EnclsError::Faulted { .. } => -14,
            EnclsError::Code(code) => *code as u32 as i32,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, EnclsError::Faulted { .. })
    }

    pub fn is_code(&self, code: SgxErrorCode) -> bool {
        *self == EnclsError::Code(code)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EnclsError::Faulted { .. } => ErrorClass::FatalHardware,
            EnclsError::Code(code) if code.is_transient() => ErrorClass::Transient,
            EnclsError::Code(code) if code.is_benign() => ErrorClass::BenignRejected,
            EnclsError::Code(_) => ErrorClass::OperationFailed,
        }
    }
}

/// The secure-memory instruction set, plus the cross-core barrier the
/// write-back path needs.
pub trait Encls: Send + Sync {
    /// Create the SECS of a new enclave in `secs_page`.
    fn ecreate(&self, secs: &SgxSecs, secs_page: VirtAddr) -> EnclsResult;

    /// Copy `contents` into `epc` as the page at `linaddr` of the enclave whose
    /// SECS lives in `secs_page`.
    fn eadd(
        &self,
        secs_page: VirtAddr,
        linaddr: usize,
        secinfo: &SgxSecInfo,
        contents: &[u8; PAGE_SIZE],
        epc: VirtAddr,
    ) -> EnclsResult;

    /// Measure the 256-byte chunk at `chunk`.
    fn eextend(&self, secs_page: VirtAddr, chunk: VirtAddr) -> EnclsResult;

    fn einit(
        &self,
        sigstruct: &SigStruct,
        token: &SgxEinitToken,
        secs_page: VirtAddr,
        mrsigner: &[u8; 32],
    ) -> EnclsResult;

    fn eblock(&self, epc: VirtAddr) -> EnclsResult;

    fn etrack(&self, secs_page: VirtAddr) -> EnclsResult;

    /// Evict a blocked page: encrypted contents go to `contents`, metadata to
    /// `pcmd`, the version to the slot at `va_slot`.
    fn ewb(
        &self,
        epc: VirtAddr,
        va_slot: VirtAddr,
        contents: &mut [u8; PAGE_SIZE],
        pcmd: &mut SgxPcmd,
    ) -> EnclsResult;

    fn eremove(&self, epc: VirtAddr) -> EnclsResult;

    /// Turn `epc` into a version-array page.
    fn epa(&self, epc: VirtAddr) -> EnclsResult;

    /// Kick every CPU in `mask` out of enclave mode and wait for it.
    fn flush_cpus(&self, mask: &CpuMask);
}
