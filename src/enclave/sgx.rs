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

//! Architectural SGX structures and the checks applied to them before any
//! hardware operation.

use core::convert::TryFrom;
use core::fmt::{Debug, Formatter, Result};
use core::mem::MaybeUninit;

use bitflags::bitflags;
use sha2::{Digest, Sha256};

use crate::config::EpcConfig;
use crate::consts::PAGE_SIZE;
use crate::error::{EpcError, EpcResult};
use crate::memory::addr::{is_aligned, page_count};

pub const SHA256_HASH_SIZE: usize = 32;

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Sha256Value(pub [u8; SHA256_HASH_SIZE]);

impl Sha256Value {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Sha256Value {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "Sha256Value(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct SigKey3072Value(pub [u8; 384]);

impl SigKey3072Value {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for SigKey3072Value {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "SigKey3072Value({:02x?}..)", &self.0[..8])
    }
}

bitflags! {
    /// The ATTRIBUTES data structure is comprised of bit-granular fields that are used in the SECS.
    pub struct SgxAttributeFlags: u64 {
        /// This bit indicates if the enclave has been initialized by EINIT.
        const INIT              = 1 << 0;
        /// If 1, the enclave permit debugger to read and write enclave data using EDBGRD and EDBGWR.
        const DEBUG             = 1 << 1;
        /// Enclave runs in 64-bit mode.
        const MODE64BIT         = 1 << 2;
        /// Provisioning Key is available from EGETKEY.
        const PROVISIONKEY      = 1 << 4;
        /// EINIT token key is available from EGETKEY.
        const EINITTOKEN_KEY    = 1 << 5;
        /// Key Separation and Sharing Enabled.
        const KSS               = 1 << 7;
    }
}

bitflags! {
    /// Flags describing the state of the enclave page.
    pub struct SgxEnclPageFlags: u8 {
        /// The page can be read from inside the enclave.
        const R         = 1 << 0;
        /// The page can be written from inside the enclave.
        const W         = 1 << 1;
        /// The page can be executed from inside the enclave.
        const X         = 1 << 2;
        /// The page is in the PENDING state.
        const PENDING   = 1 << 3;
        /// The page is in the MODIFIED state.
        const MODIFIED  = 1 << 4;
        /// A permission restriction operation on the page is in progress.
        const PR        = 1 << 5;
        /// The page is in the BLOCKED state.
        const BLOCKED   = 1 << 6;
        /// For EPCM entries, indicates whether the EPCM entry is valid.
        const VALID     = 1 << 7;
    }
}

impl SgxEnclPageFlags {
    pub const PERM_MASK: Self = Self {
        bits: Self::R.bits() | Self::W.bits() | Self::X.bits(),
    };
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum SgxEnclPageType {
    /// Page is an SECS.
    SECS = 0,
    /// Page is a TCS.
    TCS = 1,
    /// Page is a regular page.
    REG = 2,
    /// Page is a Version Array.
    VA = 3,
    /// Page is in trimmed state.
    TRIM = 4,
}

impl TryFrom<u8> for SgxEnclPageType {
    type Error = EpcError;

    fn try_from(page_type: u8) -> EpcResult<SgxEnclPageType> {
        match page_type {
            0 => Ok(SgxEnclPageType::SECS),
            1 => Ok(SgxEnclPageType::TCS),
            2 => Ok(SgxEnclPageType::REG),
            3 => Ok(SgxEnclPageType::VA),
            4 => Ok(SgxEnclPageType::TRIM),
            _ => epc_result_err!(EINVAL, format!("Invalid page_type={:#x}", page_type)),
        }
    }
}

/// MISCSELECT bit reporting page-fault and #GP information in the SSA.
pub const SGX_MISC_EXINFO: u32 = 1 << 0;
const SGX_SSA_GPRS_SIZE: u32 = 182;
const SGX_SSA_MISC_EXINFO_SIZE: u32 = 16;

const XFEATURE_FP: u64 = 1 << 0;
const XFEATURE_SSE: u64 = 1 << 1;
const XFEATURE_BNDREGS: usize = 3;
const XFEATURE_BNDCSR: usize = 4;

/// SGX Enclave Control Structure (SECS).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SgxSecs {
    /// (  0) Size of the enclave in bytes; must be power of 2.
    pub size: u64,
    /// (  8) Enclave Base Linear Address must be naturally aligned to size.
    pub base_addr: u64,
    /// ( 16) Size of 1 SSA frame in pages.
    pub ssa_frame_size: u32,
    /// ( 20) Bit vector specifying which extended features are saved to the MISC region of the SSA
    /// frame when an AEX occurs.
    pub misc_select: u32,
    /// ( 24) Reserved
    pub reserved1: [u8; 24],
    /// ( 48) Attributes of the Enclave.
    pub attributes: u64,
    /// ( 56) XSAVE Feature Request Mask.
    pub xfrm: u64,
    /// ( 64) Measurement Register of enclave build process.
    pub mr_enclave: Sha256Value,
    /// ( 96) Reserved
    pub reserved2: [u8; 32],
    /// (128) Measurement Register extended with the public key that verified the enclave.
    pub mr_signer: Sha256Value,
    /// (160) Reserved
    pub reserved3: [u8; 32],
    /// (192) Post EINIT configuration identity.
    pub config_id: [u8; 64],
    /// (256) Product ID of enclave.
    pub isv_prod_id: u16,
    /// (258) Security version number (SVN) of the enclave.
    pub isv_svn: u16,
    /// (260) Post EINIT configuration security version number (SVN).
    pub config_svn: u16,
    /// (262) Reserved
    pub reserved4: [u8; 3834],
}
static_assertions::const_assert_eq!(core::mem::size_of::<SgxSecs>(), 4096);

impl Default for SgxSecs {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl Debug for SgxSecs {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("SgxSecs")
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .field("size", &format_args!("{:#x}", self.size))
            .field("ssa_frame_size", &self.ssa_frame_size)
            .field("misc_select", &format_args!("{:#x}", self.misc_select))
            .field("attributes", &format_args!("{:#x}", self.attributes))
            .field("xfrm", &format_args!("{:#x}", self.xfrm))
            .finish()
    }
}

impl SgxSecs {
    pub fn new(base_addr: u64, size: u64, attributes: SgxAttributeFlags, xfrm: u64) -> Self {
        Self {
            base_addr,
            size,
            ssa_frame_size: 1,
            attributes: attributes.bits(),
            xfrm,
            ..Default::default()
        }
    }

    pub fn attribute_flags(&self) -> SgxAttributeFlags {
        SgxAttributeFlags::from_bits_truncate(self.attributes)
    }

    /// Smallest SSA frame, in pages, able to hold the state `misc_select`
    /// and `xfrm` ask to be saved.
    pub fn calc_ssa_frame_size(&self, config: &EpcConfig) -> u32 {
        let mut size_max = PAGE_SIZE as u32;
        for i in 2..64 {
            if self.xfrm & (1 << i) == 0 {
                continue;
            }
            let mut size = SGX_SSA_GPRS_SIZE + config.xsave_size_tbl[i];
            if self.misc_select & SGX_MISC_EXINFO != 0 {
                size += SGX_SSA_MISC_EXINFO_SIZE;
            }
            size_max = size_max.max(size);
        }
        page_count(size_max as usize) as u32
    }

    pub fn validate(&self, config: &EpcConfig) -> EpcResult {
        if self.size < 2 * PAGE_SIZE as u64 || !self.size.is_power_of_two() {
            return epc_result_err!(EINVAL, format!("Invalid enclave size {:#x}", self.size));
        }
        if self.base_addr & (self.size - 1) != 0 {
            return epc_result_err!(
                EINVAL,
                format!("Enclave base {:#x} not aligned to size", self.base_addr)
            );
        }
        if self.misc_select & config.misc_reserved_mask != 0
            || self.attributes & config.attributes_reserved_mask != 0
            || self.xfrm & config.xfrm_reserved_mask != 0
        {
            return epc_result_err!(EINVAL, "Reserved SECS bits set");
        }
        let size_max = if self.attribute_flags().contains(SgxAttributeFlags::MODE64BIT) {
            config.encl_size_max_64
        } else {
            config.encl_size_max_32
        };
        if self.size > size_max {
            return epc_result_err!(EINVAL, format!("Enclave size {:#x} too large", self.size));
        }
        let bndregs = (self.xfrm >> XFEATURE_BNDREGS) & 1;
        let bndcsr = (self.xfrm >> XFEATURE_BNDCSR) & 1;
        if self.xfrm & XFEATURE_FP == 0 || self.xfrm & XFEATURE_SSE == 0 || bndregs != bndcsr {
            return epc_result_err!(EINVAL, format!("Invalid xfrm {:#x}", self.xfrm));
        }
        if self.ssa_frame_size == 0 || self.calc_ssa_frame_size(config) > self.ssa_frame_size {
            return epc_result_err!(
                EINVAL,
                format!("SSA frame size {} too small", self.ssa_frame_size)
            );
        }
        let reserved_zero = self.reserved1.iter().all(|b| *b == 0)
            && self.reserved2.iter().all(|b| *b == 0)
            && self.reserved3.iter().all(|b| *b == 0)
            && self.reserved4.iter().all(|b| *b == 0);
        if !reserved_zero {
            return epc_result_err!(EINVAL, "Reserved SECS fields not zero");
        }
        Ok(())
    }
}

const SGX_SECINFO_PERM_MASK: u64 = 0x7;
const SGX_SECINFO_PAGE_TYPE_SHIFT: u64 = 8;
const SGX_SECINFO_PAGE_TYPE_MASK: u64 = 0xff << SGX_SECINFO_PAGE_TYPE_SHIFT;
const SGX_SECINFO_RESERVED_MASK: u64 = !(SGX_SECINFO_PERM_MASK | SGX_SECINFO_PAGE_TYPE_MASK);

/// Security Information (SECINFO).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SgxSecInfo {
    /// Permissions in bits 0..3, page type in bits 8..16.
    pub flags: u64,
    pub reserved: [u8; 56],
}
static_assertions::const_assert_eq!(core::mem::size_of::<SgxSecInfo>(), 64);

impl SgxSecInfo {
    pub fn new(flags: SgxEnclPageFlags, page_type: SgxEnclPageType) -> Self {
        Self {
            flags: ((page_type as u64) << SGX_SECINFO_PAGE_TYPE_SHIFT) | flags.bits() as u64,
            reserved: [0; 56],
        }
    }

    pub fn perm(&self) -> SgxEnclPageFlags {
        SgxEnclPageFlags::from_bits_truncate(self.flags as u8) & SgxEnclPageFlags::PERM_MASK
    }

    pub fn page_type(&self) -> EpcResult<SgxEnclPageType> {
        SgxEnclPageType::try_from((self.flags >> SGX_SECINFO_PAGE_TYPE_SHIFT) as u8)
    }

    pub fn validate(&self) -> EpcResult {
        if self.flags & SGX_SECINFO_RESERVED_MASK != 0 {
            return epc_result_err!(EINVAL, format!("Reserved SECINFO bits {:#x}", self.flags));
        }
        let perm = self.perm();
        if perm.contains(SgxEnclPageFlags::W) && !perm.contains(SgxEnclPageFlags::R) {
            return epc_result_err!(EINVAL, "Writable page must be readable");
        }
        match self.page_type() {
            Ok(SgxEnclPageType::TCS) | Ok(SgxEnclPageType::REG) | Ok(SgxEnclPageType::TRIM) => {}
            _ => {
                return epc_result_err!(
                    EINVAL,
                    format!("Page type {:#x} cannot be added", self.flags >> 8)
                )
            }
        }
        if self.reserved.iter().any(|b| *b != 0) {
            return epc_result_err!(EINVAL, "Reserved SECINFO fields not zero");
        }
        Ok(())
    }
}

impl Debug for SgxSecInfo {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "SgxSecInfo({:#x})", self.flags)
    }
}

const SGX_TCS_DBGOPTIN: u64 = 1 << 0;
const SGX_TCS_RESERVED_MASK: u64 = !SGX_TCS_DBGOPTIN;

/// Thread Control Structure (TCS).
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct SgxTcs {
    /// ( 0) Enclave execution state of the thread controlled by this TCS. Must be 0 at creation.
    pub stage: u64,
    /// ( 8) The thread's execution flags.
    pub flags: u64,
    /// (16) Offset of the base of the State Save Area stack, relative to the enclave base. Must be page
    /// aligned.
    pub ossa: u64,
    /// (24) Current slot index of an SSA frame.
    pub cssa: u32,
    /// (28) Number of available slots for SSA frames.
    pub nssa: u32,
    /// (32) Offset in enclave to which control is transferred on EENTER relative to the base of the
    /// enclave.
    pub oentry: u64,
    /// (40) The value of the Asynchronous Exit Pointer that was saved at EENTER time. Must be 0 at creation.
    pub aep: u64,
    /// (48) Offset to add to the base address of the enclave for producing the base address of FS
    /// segment inside the enclave. Must be page aligned.
    pub ofs_base: u64,
    /// (56) Offset to add to the base address of the enclave for producing the base address of GS
    /// segment inside the enclave. Must be page aligned.
    pub ogs_base: u64,
    /// (64) Size to become the new FS limit in 32-bit mode.
    pub fs_limit: u32,
    /// (68) Size to become the new GS limit in 32-bit mode.
    pub gs_limit: u32,
    /// (72) Rerserved field in TCS, must be 0 at creation.
    pub reserved: [u8; 4024],
}
static_assertions::const_assert_eq!(core::mem::size_of::<SgxTcs>(), 4096);

impl Default for SgxTcs {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl SgxTcs {
    /// Reinterpret a page of data as a TCS.
    pub fn from_page(data: &[u8; PAGE_SIZE]) -> Self {
        // Every bit pattern is a valid `SgxTcs`.
        unsafe { core::ptr::read_unaligned(data.as_ptr() as *const SgxTcs) }
    }

    pub fn as_page(&self) -> &[u8; PAGE_SIZE] {
        unsafe { &*(self as *const SgxTcs as *const [u8; PAGE_SIZE]) }
    }

    /// Check a TCS about to be added to an enclave of `encl_size` bytes.
    pub fn validate(&self, encl_size: u64) -> EpcResult {
        let valid_offset = |offset: u64| is_aligned(offset as usize) && offset < encl_size;

        if self.flags & SGX_TCS_RESERVED_MASK != 0 || self.flags & SGX_TCS_DBGOPTIN != 0 {
            return epc_result_err!(EINVAL, format!("Invalid TCS flags {:#x}", self.flags));
        }
        if !valid_offset(self.ossa) || !valid_offset(self.ofs_base) || !valid_offset(self.ogs_base)
        {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Invalid TCS offsets ossa={:#x} ofs={:#x} ogs={:#x}",
                    self.ossa, self.ofs_base, self.ogs_base
                )
            );
        }
        if self.fs_limit & 0xfff != 0xfff || self.gs_limit & 0xfff != 0xfff {
            return epc_result_err!(EINVAL, "Invalid TCS segment limits");
        }
        if self.reserved.iter().any(|b| *b != 0) {
            return epc_result_err!(EINVAL, "Reserved TCS fields not zero");
        }
        Ok(())
    }
}

/// Paging Crypto Metadata (PCMD).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SgxPcmd {
    /// SECINFO of the evicted page.
    pub sec_info: SgxSecInfo,
    /// Enclave identifier.
    pub enclave_id: u64,
    pub reserved: [u8; 40],
    /// MAC over PCMD, page contents and nonce.
    pub mac: [u8; 16],
}
static_assertions::const_assert_eq!(core::mem::size_of::<SgxPcmd>(), 128);

impl Default for SgxPcmd {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl SgxPcmd {
    pub fn as_bytes(&self) -> &[u8; 128] {
        unsafe { &*(self as *const SgxPcmd as *const [u8; 128]) }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut pcmd = Self::default();
        let len = bytes.len().min(128);
        let dst = unsafe { &mut *(&mut pcmd as *mut SgxPcmd as *mut [u8; 128]) };
        dst[..len].copy_from_slice(&bytes[..len]);
        pcmd
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigStructHeader {
    /// (0) must be (06000000E100000000000100H)
    pub header1: [u8; 12],
    /// (12) bit 31: 0 = prod, 1 = debug; Bit 30-0: Must be zero
    pub types: u32,
    /// (16) Intel=0x8086, ISV=0x0000
    pub module_vendor: u32,
    /// (20) build date as yyyymmdd
    pub date: u32,
    /// (24) must be (01010000600000006000000001000000H)
    pub header2: [u8; 16],
    /// (40) For Launch Enclaves: HWVERSION != 0. Others, HWVERSION = 0
    pub hw_version: u32,
    /// (44) Must be 0
    pub reserved: [u8; 84],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigStructKey {
    /// (128) Module Public Key (keylength=3072 bits)
    pub modulus: SigKey3072Value,
    /// (512) RSA Exponent = 3
    pub exponent: [u8; 4],
    /// (516) Signature over Header and Body
    pub signature: SigKey3072Value,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigStructBody {
    /// (900) The MISCSELECT that must be set
    pub misc_select: u32,
    /// (904) Mask of MISCSELECT to enforce
    pub misc_mask: u32,
    /// (908) Reserved. Must be 0.
    pub reserved: [u8; 4],
    /// (912) ISV assigned Family ID
    pub isv_family_id: [u8; 16],
    /// (928) Enclave Attributes that must be set
    pub attributes: [u8; 16],
    /// (944) Mask of Attributes to Enforce
    pub attributes_mask: [u8; 16],
    /// (960) MRENCLAVE - (32 bytes)
    pub mr_enclave: Sha256Value,
    /// (992) Must be 0
    pub reserved2: [u8; 16],
    /// (1008) ISV assigned Extended Product ID
    pub isvext_prod_id: [u8; 16],
    /// (1024) ISV assigned Product ID
    pub isv_prod_id: u16,
    /// (1026) ISV assigned SVN
    pub isv_svn: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigStructBuffer {
    /// (1028) Must be 0
    pub reserved: [u8; 12],
    /// (1040) Q1 value for RSA Signature Verification
    pub q1: SigKey3072Value,
    /// (1424) Q2 value for RSA Signature Verification
    pub q2: SigKey3072Value,
}

/// ENCLAVE SIGNATURE STRUCTURE
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigStruct {
    pub header: SigStructHeader,
    pub key: SigStructKey,
    pub body: SigStructBody,
    pub buffer: SigStructBuffer,
}
static_assertions::const_assert_eq!(core::mem::size_of::<SigStruct>(), 1808);

impl Default for SigStruct {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl SigStruct {
    /// MRSIGNER: SHA-256 of the signer's modulus.
    pub fn mr_signer(&self) -> [u8; SHA256_HASH_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(self.key.modulus.as_slice());
        hasher.finalize().into()
    }
}

/// EINIT token issued by the launch enclave.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SgxEinitToken {
    pub valid: u32,
    pub reserved1: [u8; 44],
    pub attributes: u64,
    pub xfrm: u64,
    pub mr_enclave: Sha256Value,
    pub reserved2: [u8; 32],
    pub mr_signer: Sha256Value,
    pub reserved3: [u8; 32],
    pub cpu_svn_le: [u8; 16],
    pub isv_prod_id_le: u16,
    pub isv_svn_le: u16,
    pub reserved4: [u8; 24],
    pub masked_misc_select_le: u32,
    pub masked_attributes_le: u64,
    pub masked_xfrm_le: u64,
    pub key_id: [u8; 32],
    pub mac: [u8; 16],
}
static_assertions::const_assert_eq!(core::mem::size_of::<SgxEinitToken>(), 304);

impl Default for SgxEinitToken {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EpcSectionConfig;
    use crate::error::EpcErrorNum;
    use memoffset::offset_of;

    fn config() -> EpcConfig {
        EpcConfig::new(vec![EpcSectionConfig::new(0x8000_0000, 0x8000_0000, 0x10000)])
    }

    fn secs() -> SgxSecs {
        SgxSecs::new(0x10_0000, 0x4000, SgxAttributeFlags::MODE64BIT, 0x3)
    }

    #[test]
    fn test_layout() {
        assert_eq!(offset_of!(SgxSecs, attributes), 48);
        assert_eq!(offset_of!(SgxSecs, mr_signer), 128);
        assert_eq!(offset_of!(SgxSecs, isv_prod_id), 256);
        assert_eq!(offset_of!(SgxTcs, fs_limit), 64);
        assert_eq!(offset_of!(SgxPcmd, enclave_id), 64);
        assert_eq!(offset_of!(SgxPcmd, mac), 112);
        assert_eq!(offset_of!(SigStruct, body), 900);
        assert_eq!(offset_of!(SgxEinitToken, masked_attributes_le), 240);
    }

    #[test]
    fn test_validate_secs() {
        let config = config();
        assert!(secs().validate(&config).is_ok());
        assert_eq!(secs().calc_ssa_frame_size(&config), 1);

        let mut bad = secs();
        bad.size = 0x3000;
        assert_eq!(bad.validate(&config).unwrap_err().num(), Some(EpcErrorNum::EINVAL));

        let mut bad = secs();
        bad.size = 0x1000;
        assert!(bad.validate(&config).is_err());

        let mut bad = secs();
        bad.base_addr = 0x10_2000;
        assert!(bad.validate(&config).is_err());

        let mut bad = secs();
        bad.attributes |= 1 << 3;
        assert!(bad.validate(&config).is_err());

        let mut bad = secs();
        bad.xfrm = 0x3 | (1 << 3);
        assert!(bad.validate(&config).is_err());
        bad.xfrm |= 1 << 4;
        assert!(bad.validate(&config).is_ok());

        let mut bad = secs();
        bad.xfrm = 0x1;
        assert!(bad.validate(&config).is_err());

        let mut bad = secs();
        bad.ssa_frame_size = 0;
        assert!(bad.validate(&config).is_err());

        let mut bad = secs();
        bad.reserved4[100] = 1;
        assert!(bad.validate(&config).is_err());

        let mut bad = secs();
        bad.attributes = 0;
        bad.size = 1 << 32;
        bad.base_addr = 0;
        assert!(bad.validate(&config).is_err());
    }

    #[test]
    fn test_validate_secinfo() {
        let rw = SgxEnclPageFlags::R | SgxEnclPageFlags::W;
        assert!(SgxSecInfo::new(rw, SgxEnclPageType::REG).validate().is_ok());
        assert!(SgxSecInfo::new(rw, SgxEnclPageType::TCS).validate().is_ok());
        assert!(SgxSecInfo::new(SgxEnclPageFlags::W, SgxEnclPageType::REG)
            .validate()
            .is_err());
        assert!(SgxSecInfo::new(rw, SgxEnclPageType::SECS).validate().is_err());
        assert!(SgxSecInfo::new(rw, SgxEnclPageType::VA).validate().is_err());
        assert!(SgxSecInfo::new(SgxEnclPageFlags::PENDING, SgxEnclPageType::REG)
            .validate()
            .is_err());

        let mut info = SgxSecInfo::new(rw, SgxEnclPageType::REG);
        info.reserved[3] = 1;
        assert!(info.validate().is_err());
        assert_eq!(info.perm(), rw);
    }

    #[test]
    fn test_validate_tcs() {
        let mut tcs = SgxTcs::default();
        tcs.ossa = 0x1000;
        tcs.ofs_base = 0x2000;
        tcs.ogs_base = 0x2000;
        tcs.fs_limit = 0xfff;
        tcs.gs_limit = 0x1fff;
        assert!(tcs.validate(0x4000).is_ok());

        let parsed = SgxTcs::from_page(tcs.as_page());
        assert_eq!(parsed.ossa, 0x1000);
        assert!(parsed.validate(0x4000).is_ok());

        let mut bad = tcs;
        bad.ossa = 0x1800;
        assert!(bad.validate(0x4000).is_err());

        let mut bad = tcs;
        bad.ofs_base = 0x4000;
        assert!(bad.validate(0x4000).is_err());

        let mut bad = tcs;
        bad.flags = SGX_TCS_DBGOPTIN;
        assert!(bad.validate(0x4000).is_err());

        let mut bad = tcs;
        bad.gs_limit = 0x1000;
        assert!(bad.validate(0x4000).is_err());
    }

    #[test]
    fn test_mr_signer() {
        let mut sig = SigStruct::default();
        sig.key.modulus.0[0] = 0xaa;
        let a = sig.mr_signer();
        sig.key.modulus.0[0] = 0xab;
        assert_ne!(a, sig.mr_signer());
    }
}
