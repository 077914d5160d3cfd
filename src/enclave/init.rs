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

use super::sgx::{SgxEinitToken, SigStruct};
use super::{Enclave, EnclaveFlags};
use crate::arch::{EnclsError, SgxErrorCode};
use crate::error::EpcResult;
use crate::signal::Signal;

impl Enclave {
    /// EINIT once every queued page was added. Retries while the hardware
    /// reports an unmasked event, sleeping between spin rounds; `signal`
    /// interrupts the sleep.
    pub fn init(&self, sigstruct: &SigStruct, token: &SgxEinitToken, signal: &Signal) -> EpcResult {
        let allowed = self.allowed_attributes().bits();
        if self.attributes() & !allowed != 0 {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Attributes {:#x} not allowed ({:#x})",
                    self.attributes(),
                    allowed
                )
            );
        }
        let mrsigner = sigstruct.mr_signer();

        self.work.flush();

        let config = self.epc().config();
        let encls = self.epc().encls();
        let mut inner = self.lock.lock();
        if inner.flags.contains(EnclaveFlags::INITIALIZED) {
            return Ok(());
        }
        if inner.flags.contains(EnclaveFlags::DEAD) {
            return epc_result_err!(EFAULT, format!("Enclave {:#x} is dead", self.id()));
        }

        let mut ret = Err(EnclsError::Code(SgxErrorCode::UNMASKED_EVENT));
        'retry: for i in 0..config.einit_sleep_count {
            let secs_page = match inner.secs.epc_page.as_ref() {
                Some(page) => page.vaddr(),
                None => return epc_result_err!(EFAULT, "SECS not resident"),
            };
            for _ in 0..config.einit_spin_count {
                ret = encls.einit(sigstruct, token, secs_page, &mrsigner);
                match ret {
                    Err(e) if e.is_code(SgxErrorCode::UNMASKED_EVENT) => continue,
                    _ => break 'retry,
                }
            }
            if i + 1 == config.einit_sleep_count {
                break;
            }
            let interrupted = parking_lot::MutexGuard::unlocked(&mut inner, || {
                signal.sleep_interruptible(config.einit_sleep_time)
            });
            if interrupted {
                return epc_result_err!(ERESTARTSYS, "EINIT interrupted");
            }
            if inner.flags.contains(EnclaveFlags::DEAD) {
                return epc_result_err!(EFAULT, format!("Enclave {:#x} died in EINIT", self.id()));
            }
        }

        match ret {
            Ok(()) => {
                inner.flags |= EnclaveFlags::INITIALIZED;
                info!("Enclave {:#x} initialized", self.id());
                Ok(())
            }
            Err(e) if e.is_fault() => {
                error!("Enclave {:#x} killed: EINIT {}", self.id(), e.as_string());
                self.destroy(&mut inner);
                Err(encls_err!(e, "EINIT faulted"))
            }
            Err(e) => {
                debug!("EINIT returned {}", e.as_string());
                Err(encls_err!(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::arch::soft::EnclsOp;
    use crate::arch::{EnclsError, SgxErrorCode, X86_TRAP_GP};
    use crate::enclave::sgx::{SgxAttributeFlags, SgxEinitToken, SgxSecs, SigStruct};
    use crate::enclave::{Enclave, EnclaveFlags};
    use crate::error::{EpcErrorNum, ErrorClass};
    use crate::memory::PAGE_SIZE;
    use crate::signal::Signal;
    use crate::testutil::{Fixture, BASE};

    fn unmasked(f: &Fixture, n: usize) {
        for _ in 0..n {
            f.encls
                .inject(EnclsOp::Einit, EnclsError::Code(SgxErrorCode::UNMASKED_EVENT));
        }
    }

    #[test]
    fn test_init_retries_unmasked_event() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        f.add(&encl, BASE, 1);
        unmasked(&f, 3);
        f.init(&encl).unwrap();
        assert_eq!(f.encls.count(EnclsOp::Einit), 4);
        assert!(encl.flags().contains(EnclaveFlags::INITIALIZED));
    }

    #[test]
    fn test_init_gives_up_after_retries() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        unmasked(&f, 4);
        let err = f.init(&encl).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(f.encls.count(EnclsOp::Einit), 4);
        assert_eq!(encl.flags(), EnclaveFlags::empty());

        f.init(&encl).unwrap();
    }

    #[test]
    fn test_init_interrupted() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        unmasked(&f, 2);
        let signal = Signal::new();
        signal.raise();
        let sig = f.sigstruct(&encl);
        let err = encl
            .init(&sig, &SgxEinitToken::default(), &signal)
            .unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::ERESTARTSYS));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(f.encls.count(EnclsOp::Einit), 2);
        assert!(!encl.is_dead());
    }

    #[test]
    fn test_init_bad_measurement() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        f.add(&encl, BASE, 1);
        let err = encl
            .init(&SigStruct::default(), &SgxEinitToken::default(), &Signal::new())
            .unwrap_err();
        assert!(err.encls().unwrap().is_code(SgxErrorCode::INVALID_MEASUREMENT));
        assert_eq!(err.class(), ErrorClass::BenignRejected);
        assert!(!encl.is_dead());
        assert_eq!(encl.page_count(), 1);

        f.init(&encl).unwrap();
    }

    #[test]
    fn test_init_fault_kills_enclave() {
        let f = Fixture::new(8);
        let encl = f.create(BASE, 2 * PAGE_SIZE);
        f.add(&encl, BASE, 1);
        f.encls
            .inject(EnclsOp::Einit, EnclsError::Faulted { trapnr: X86_TRAP_GP });
        let err = f.init(&encl).unwrap_err();
        assert_eq!(err.class(), ErrorClass::FatalHardware);
        assert!(encl.is_dead());
        assert_eq!(f.epc.free_count(), 8);

        let err = encl
            .init(&SigStruct::default(), &SgxEinitToken::default(), &Signal::new())
            .unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EFAULT));
        assert_eq!(f.encls.count(EnclsOp::Einit), 1);
    }

    #[test]
    fn test_init_is_idempotent() {
        let f = Fixture::new(8);
        let encl = f.build(BASE, 2 * PAGE_SIZE, 1);
        f.init(&encl).unwrap();
        assert_eq!(f.encls.count(EnclsOp::Einit), 1);
    }

    #[test]
    fn test_provision_key_needs_permission() {
        let f = Fixture::new(8);
        f.mm.mmap_enclave(BASE..BASE + 2 * PAGE_SIZE).unwrap();
        let attributes = SgxAttributeFlags::MODE64BIT | SgxAttributeFlags::PROVISIONKEY;
        let secs = SgxSecs::new(BASE as u64, 2 * PAGE_SIZE as u64, attributes, 0x3);
        let encl = Enclave::create(&f.epc, &f.mm, &secs).unwrap();

        let err = f.init(&encl).unwrap_err();
        assert_eq!(err.num(), Some(EpcErrorNum::EINVAL));
        assert_eq!(f.encls.count(EnclsOp::Einit), 0);

        encl.set_attribute(SgxAttributeFlags::PROVISIONKEY);
        f.init(&encl).unwrap();
    }
}
