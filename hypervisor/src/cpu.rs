// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use thiserror::Error;
use vmm_sys_util::errno;

use crate::arch::x86::tdx::TdxExitDetails;

#[derive(Error, Debug)]
///
/// Enum for CPU error
pub enum HypervisorCpuError {
    ///
    /// Running Vcpu error
    ///
    #[error("Failed to run vcpu: {0}")]
    RunVcpu(#[source] anyhow::Error),
    ///
    /// Initialize TDX on vCPU error
    ///
    #[error("Failed to initialize TDX on vCPU: {0}")]
    InitializeTdx(#[source] errno::Error),
    ///
    /// Unknown TDX VM call
    ///
    #[error("Unknown TDX VM call")]
    UnknownTdxVmCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// The guest accessed memory whose private/shared attribute does not
    /// match the access.
    MemoryFault {
        gpa: u64,
        size: u64,
        private: bool,
    },
    Ignore,
    Reset,
    Shutdown,
    /// TDG.VP.VMCALL, details through `get_tdx_exit_details`.
    Tdx,
}

///
/// Result type for returning from a function
///
pub type Result<T> = anyhow::Result<T, HypervisorCpuError>;
///
/// Trait to represent a generic Vcpu
///
pub trait Vcpu: Send + Sync {
    ///
    /// Triggers the running of the current virtual CPU returning an exit reason.
    ///
    fn run(&self) -> std::result::Result<VmExit, HypervisorCpuError>;
    ///
    /// Initializes the vCPU of a TD, handing it the TD HOB address.
    ///
    fn tdx_init(&self, hob_address: u64) -> Result<()>;
    ///
    /// Returns the registers of the pending TDG.VP.VMCALL.
    ///
    fn get_tdx_exit_details(&self) -> Result<TdxExitDetails>;
    ///
    /// Sets the status code returned to the guest for the pending
    /// TDG.VP.VMCALL.
    ///
    fn set_tdx_status(&self, status: u64);
}
