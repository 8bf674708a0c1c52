// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! A generic abstraction around hypervisor functionality
//!
//! This crate offers a trait abstraction for the parts of the underlying
//! hypervisor a TDX host control plane relies on: trust domain creation,
//! the TDX control commands, memory attribute conversion, MSI injection
//! and the TDX vCPU exits.
//!
//! # Platform support
//!
//! - x86_64
//!

#[macro_use]
extern crate log;

/// Architecture specific definitions
#[macro_use]
pub mod arch;

#[cfg(feature = "kvm")]
/// KVM implementation module
pub mod kvm;

/// Hypevisor related module
pub mod hypervisor;

/// Vm related module
pub mod vm;

/// CPU related module
pub mod cpu;

use std::sync::Arc;

pub use crate::hypervisor::{Hypervisor, HypervisorError, HypervisorType};
pub use arch::x86::tdx::{
    TdxCapabilities, TdxCpuidConfig, TdxExitDetails, TdxInitParams, TdxMigrationInfo,
    TdxMigrationState, TdxServtdBinding, TdxServtdTarget, TDX_CPUID_NO_SUBLEAF,
    TDX_MEASUREMENT_SIZE,
};
pub use arch::x86::{CpuIdEntry, CPUID_FLAG_VALID_INDEX};
pub use cpu::{HypervisorCpuError, Vcpu, VmExit};
#[cfg(feature = "kvm")]
pub use kvm::*;
pub use vm::{HypervisorVmError, MsiMessage, Vm, VmType};

#[cfg(feature = "kvm")]
pub fn new() -> std::result::Result<Arc<dyn Hypervisor>, HypervisorError> {
    let hv = kvm::KvmHypervisor::new()?;
    Ok(Arc::new(hv))
}
