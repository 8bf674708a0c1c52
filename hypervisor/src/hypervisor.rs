// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use std::sync::Arc;

use thiserror::Error;
use vmm_sys_util::errno;

use crate::arch::x86::tdx::TdxCapabilities;
use crate::arch::x86::CpuIdEntry;
use crate::vm::{Vm, VmType};

#[derive(Error, Debug)]
///
///
pub enum HypervisorError {
    ///
    /// Hypervisor availability check error
    ///
    #[error("Failed to check availability of the hypervisor: {0}")]
    HypervisorAvailableCheck(#[source] anyhow::Error),
    ///
    /// Hypervisor creation error
    ///
    #[error("Failed to create the hypervisor: {0}")]
    HypervisorCreate(#[source] anyhow::Error),
    ///
    /// Vm creation failure
    ///
    #[error("Failed to create Vm: {0}")]
    VmCreate(#[source] anyhow::Error),
    ///
    /// CpuId error
    ///
    #[error("Failed to get cpuid: {0}")]
    GetCpuId(#[source] anyhow::Error),
    ///
    /// Querying the platform TDX capabilities failed
    ///
    #[error("Failed to get TDX capabilities: {0}")]
    TdxCapabilities(#[source] errno::Error),
    ///
    /// API version is not compatible
    ///
    #[error("Incompatible API version")]
    IncompatibleApiVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorType {
    Kvm,
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorError>;

///
/// Trait to represent a Hypervisor
///
/// This crate provides a hypervisor-agnostic interfaces
///
pub trait Hypervisor: Send + Sync {
    ///
    /// Returns the type of the hypervisor
    ///
    fn hypervisor_type(&self) -> HypervisorType;
    ///
    /// Create a Vm using the underlying hypervisor
    /// Return a hypervisor-agnostic Vm trait object
    ///
    fn create_vm(&self, vm_type: VmType) -> Result<Arc<dyn Vm>>;
    ///
    /// Get the supported CpuID
    ///
    fn get_supported_cpuid(&self) -> Result<Vec<CpuIdEntry>>;
    ///
    /// Query the TDX capabilities at platform scope, sized for
    /// `nr_cpuid_configs` entries. Kernels without the platform scope
    /// interface report EINVAL.
    ///
    fn tdx_capabilities(&self, nr_cpuid_configs: usize) -> Result<TdxCapabilities>;
}
