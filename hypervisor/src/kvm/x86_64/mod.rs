// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//
// Copyright © 2020, Microsoft  Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use kvm_bindings::{kvm_cpuid_entry2, CpuId};

use crate::arch::x86::CpuIdEntry;
use crate::kvm::{Cap, Kvm, KvmError, KvmResult};

pub mod tdx;

///
/// Check KVM extension for Linux
///
pub fn check_required_kvm_extensions(kvm: &Kvm) -> KvmResult<()> {
    if !kvm.check_extension(Cap::SignalMsi) {
        return Err(KvmError::CapabilityMissing(Cap::SignalMsi));
    }
    if !kvm.check_extension(Cap::SplitIrqchip) {
        return Err(KvmError::CapabilityMissing(Cap::SplitIrqchip));
    }
    Ok(())
}

impl From<&kvm_cpuid_entry2> for CpuIdEntry {
    fn from(e: &kvm_cpuid_entry2) -> Self {
        CpuIdEntry {
            function: e.function,
            index: e.index,
            flags: e.flags,
            eax: e.eax,
            ebx: e.ebx,
            ecx: e.ecx,
            edx: e.edx,
        }
    }
}

pub fn cpuid_entries(cpuid: &CpuId) -> Vec<CpuIdEntry> {
    cpuid.as_slice().iter().map(CpuIdEntry::from).collect()
}
