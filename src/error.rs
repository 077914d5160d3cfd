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

use alloc::string::{String, ToString};
use core::fmt::{Debug, Display, Formatter, Result};

use crate::arch::EnclsError;

/// POSIX errno, plus the driver's power-lost status.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code, clippy::upper_case_acronyms)]
pub enum EpcErrorNum {
    EPERM = 1,
    ENOENT = 2,
    EINTR = 4,
    EIO = 5,
    ENOMEM = 12,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EINVAL = 22,
    ENOSPC = 28,
    ERANGE = 34,
    ENOSYS = 38,
    ERESTARTSYS = 512,
    /// The enclave was torn down by a power transition and must be rebuilt.
    EPOWERLOST = 0x4000_0000,
}

/// Coarse classification of every failure the engine can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// A secure-memory operation faulted. Never retried.
    FatalHardware,
    /// The hardware rejected an operation because of a state error.
    OperationFailed,
    /// The request itself was invalid; enclave state is untouched.
    BenignRejected,
    /// A race or busy condition; the caller may retry.
    Transient,
    /// No free frame or slot right now.
    ResourceExhaustion,
}

impl EpcErrorNum {
    pub fn as_str(&self) -> &'static str {
        use EpcErrorNum::*;
        match *self {
            EPERM => "Operation not permitted",
            ENOENT => "No such file or directory",
            EINTR => "Interrupted system call",
            EIO => "I/O error",
            ENOMEM => "Out of memory",
            EFAULT => "Bad address",
            EBUSY => "Device or resource busy",
            EEXIST => "File exists",
            EINVAL => "Invalid argument",
            ENOSPC => "No space left on device",
            ERANGE => "Math result not representable",
            ENOSYS => "Function not implemented",
            ERESTARTSYS => "Interrupted, restart the call",
            EPOWERLOST => "Enclave lost after power transition",
        }
    }

    pub fn code(&self) -> i32 {
        match *self {
            EpcErrorNum::EPOWERLOST => EpcErrorNum::EPOWERLOST as u32 as i32,
            _ => -(*self as u32 as i32),
        }
    }

    pub fn class(&self) -> ErrorClass {
        use EpcErrorNum::*;
        match *self {
            ENOMEM | EBUSY | ENOSPC => ErrorClass::ResourceExhaustion,
            EINTR | ERESTARTSYS => ErrorClass::Transient,
            EFAULT | EIO | EPOWERLOST => ErrorClass::OperationFailed,
            _ => ErrorClass::BenignRejected,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpcErrorType {
    Errno(EpcErrorNum),
    Encls(EnclsError),
}

impl EpcErrorType {
    fn as_string(&self) -> String {
        match self {
            EpcErrorType::Errno(num) => num.as_str().to_string(),
            EpcErrorType::Encls(err) => err.as_string(),
        }
    }
}

pub struct EpcError {
    error: EpcErrorType,
    loc_file: &'static str,
    loc_line: u32,
    loc_col: u32,
    msg: Option<String>,
}

pub type EpcResult<T = ()> = core::result::Result<T, EpcError>;

impl EpcError {
    pub fn new(
        num: EpcErrorNum,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<String>,
    ) -> Self {
        Self {
            error: EpcErrorType::Errno(num),
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn new_from_encls(
        err: EnclsError,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<String>,
    ) -> Self {
        Self {
            error: EpcErrorType::Encls(err),
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn error(&self) -> &EpcErrorType {
        &self.error
    }

    /// The errno, if this is not a hardware result.
    pub fn num(&self) -> Option<EpcErrorNum> {
        match self.error {
            EpcErrorType::Errno(num) => Some(num),
            EpcErrorType::Encls(_) => None,
        }
    }

    /// The hardware result, if this came from an ENCLS leaf.
    pub fn encls(&self) -> Option<EnclsError> {
        match self.error {
            EpcErrorType::Errno(_) => None,
            EpcErrorType::Encls(err) => Some(err),
        }
    }

    pub fn loc_line(&self) -> u32 {
        self.loc_line
    }

    pub fn loc_col(&self) -> u32 {
        self.loc_col
    }

    pub fn loc_file(&self) -> &'static str {
        self.loc_file
    }

    pub fn msg(&self) -> Option<String> {
        self.msg.as_ref().map(|string| string.into())
    }

    /// Negative errno, or the positive SGX return code for hardware results.
    pub fn code(&self) -> i32 {
        match self.error {
            EpcErrorType::Errno(num) => num.code(),
            EpcErrorType::Encls(err) => err.code(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.error {
            EpcErrorType::Errno(num) => num.class(),
            EpcErrorType::Encls(err) => err.class(),
        }
    }
}

impl Debug for EpcError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file,
            self.loc_line,
            self.loc_col,
            self.error.as_string()
        )?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl Display for EpcError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for EpcError {}

#[macro_export]
macro_rules! epc_err {
    ($num: ident) => {{
        use $crate::error::{EpcError, EpcErrorNum::*};
        EpcError::new($num, file!(), line!(), column!(), None)
    }};
    ($num: ident, $msg: expr) => {{
        use $crate::error::{EpcError, EpcErrorNum::*};
        EpcError::new($num, file!(), line!(), column!(), Some($msg.into()))
    }};
}

#[macro_export]
macro_rules! epc_result_err {
    ($num: ident) => {
        Err($crate::epc_err!($num))
    };
    ($num: ident, $msg: expr) => {
        Err($crate::epc_err!($num, $msg))
    };
}

#[macro_export]
macro_rules! encls_err {
    ($err: expr) => {{
        use $crate::error::EpcError;
        EpcError::new_from_encls($err, file!(), line!(), column!(), None)
    }};
    ($err: expr, $msg: expr) => {{
        use $crate::error::EpcError;
        EpcError::new_from_encls($err, file!(), line!(), column!(), Some($msg.into()))
    }};
}
