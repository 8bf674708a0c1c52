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

use crate::arch::x86::tdx::{
    TdxCapabilities, TdxInitParams, TdxMigrationInfo, TdxMigrationState, TdxServtdBinding,
};
use crate::cpu::Vcpu;

#[derive(Error, Debug)]
///
/// Enum for VM error
pub enum HypervisorVmError {
    ///
    /// Create Vcpu error
    ///
    #[error("Failed to create Vcpu: {0}")]
    CreateVcpu(#[source] anyhow::Error),
    ///
    /// Enable capability error
    ///
    #[error("Failed to enable VM capability: {0}")]
    EnableCap(#[source] anyhow::Error),
    ///
    /// Set TSC frequency error
    ///
    #[error("Failed to set TSC frequency: {0}")]
    SetTscKhz(#[source] anyhow::Error),
    ///
    /// Create guest memfd error
    ///
    #[error("Failed to create guest memfd: {0}")]
    CreateGuestMemfd(#[source] anyhow::Error),
    ///
    /// Set user memory error
    ///
    #[error("Failed to set user memory: {0}")]
    SetUserMemory(#[source] anyhow::Error),
    ///
    /// Set memory attributes error
    ///
    #[error("Failed to set memory attributes: {0}")]
    SetMemoryAttributes(#[source] anyhow::Error),
    ///
    /// Signal MSI error
    ///
    #[error("Failed to signal MSI: {0}")]
    SignalMsi(#[source] anyhow::Error),
    ///
    /// Querying the TDX capabilities failed. The errno is kept so the
    /// caller can grow the buffer on E2BIG.
    ///
    #[error("Failed to get TDX capabilities: {0}")]
    TdxCapabilities(#[source] errno::Error),
    ///
    /// Initialize TDX error
    ///
    #[error("Failed to initialize TDX: {0}")]
    InitializeTdx(#[source] errno::Error),
    ///
    /// Initialize memory region error
    ///
    #[error("Failed to initialize memory region TDX: {0}")]
    InitMemRegionTdx(#[source] errno::Error),
    ///
    /// Finalize TDX error
    ///
    #[error("Failed to finalize TDX: {0}")]
    FinalizeTdx(#[source] errno::Error),
    ///
    /// Bind or pre-bind a service TD error
    ///
    #[error("Failed to bind service TD: {0}")]
    BindServtd(#[source] errno::Error),
    ///
    /// Migration info exchange error
    ///
    #[error("Failed to exchange TDX migration info: {0}")]
    MigrationInfo(#[source] errno::Error),
    ///
    /// TD state export or import error
    ///
    #[error("Failed to migrate TD state: {0}")]
    TdxMigration(#[source] errno::Error),
}
///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

/// Kind of VM to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmType {
    Legacy,
    Tdx,
}

/// An MSI message as written by a device to the local APIC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsiMessage {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
}

impl MsiMessage {
    /// Fixed delivery, physical destination mode, edge triggered.
    pub fn fixed(apic_id: u32, vector: u8) -> Self {
        MsiMessage {
            address_lo: 0xfee0_0000 | ((apic_id & 0xff) << 12),
            address_hi: (apic_id >> 8) << 8,
            data: u32::from(vector),
        }
    }
}

fn not_supported() -> HypervisorVmError {
    HypervisorVmError::TdxMigration(errno::Error::new(libc::ENOTSUP))
}

///
/// Trait to represent a Vm
///
/// This crate provides a hypervisor-agnostic interfaces for Vm
///
pub trait Vm: Send + Sync {
    /// Creates a new vCPU whose APIC ID is `id`.
    fn create_vcpu(&self, id: u32) -> Result<Arc<dyn Vcpu>>;
    /// Raises the vCPU limit of the VM.
    fn enable_max_vcpus(&self, max_vcpus: u32) -> Result<()>;
    /// Sets the TSC frequency shared by every vCPU.
    fn set_tsc_khz(&self, tsc_khz: u32) -> Result<()>;
    /// Creates a guest physical memory slot. Private slots get a guest
    /// memfd backing the private view of the range.
    fn create_user_memory_region(
        &self,
        slot: u32,
        guest_phys_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
        private: bool,
    ) -> Result<()>;
    /// Converts a guest physical range between private and shared.
    fn set_memory_private(&self, gpa: u64, size: u64, private: bool) -> Result<()>;
    /// Injects an MSI into the guest.
    fn signal_msi(&self, msi: MsiMessage) -> Result<()>;
    /// Reads the TDX capabilities through the VM, sized for
    /// `nr_cpuid_configs` entries.
    fn tdx_capabilities(&self, nr_cpuid_configs: usize) -> Result<TdxCapabilities>;
    /// Initializes the TD with its attributes, measurements and CPUID.
    fn tdx_init(&self, params: &TdxInitParams) -> Result<()>;
    /// Copies `size` bytes from `host_address` into private memory at
    /// `guest_address`, optionally extending the TD measurement.
    fn tdx_init_memory_region(
        &self,
        host_address: u64,
        guest_address: u64,
        size: u64,
        measure: bool,
    ) -> Result<()>;
    /// Seals the TD measurement. No more private pages can be added.
    fn tdx_finalize(&self) -> Result<()>;
    /// Binds the TD to a running MigTD, or pre-binds it to a MigTD hash.
    fn tdx_bind_servtd(&self, binding: &TdxServtdBinding) -> Result<()>;
    /// Reads the pre-migration state.
    fn tdx_get_migration_info(&self) -> Result<TdxMigrationInfo>;
    /// Tells MigTD which side of a migration the TD is and where to connect.
    fn tdx_set_migration_info(&self, is_src: bool, vsock_port: u32) -> Result<()>;
    /// Exports a piece of TD state into `buf`, returning the bytes written.
    fn tdx_export_state(
        &self,
        _state: TdxMigrationState,
        _channel: u32,
        _gpas: &[u64],
        _buf: &mut [u8],
    ) -> Result<usize> {
        Err(not_supported())
    }
    /// Imports a piece of TD state previously exported by the source.
    fn tdx_import_state(
        &self,
        _state: TdxMigrationState,
        _channel: u32,
        _gpas: &[u64],
        _data: &[u8],
    ) -> Result<()> {
        Err(not_supported())
    }
    /// Cancels the export of private pages that became shared again.
    fn tdx_cancel_pages(&self, _channel: u32, _gpas: &[u64]) -> Result<()> {
        Err(not_supported())
    }
    /// Stops the TD for the final export.
    fn tdx_pause_export(&self) -> Result<()> {
        Err(not_supported())
    }
    /// Aborts an export, restoring pages up to `gfn_end`.
    fn tdx_abort_export(&self, _gfn_end: u64) -> Result<()> {
        Err(not_supported())
    }
    /// Commits an import. The TD can run afterwards.
    fn tdx_end_import(&self) -> Result<()> {
        Err(not_supported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_msi_address() {
        let msi = MsiMessage::fixed(3, 0x40);
        assert_eq!(msi.address_lo, 0xfee0_3000);
        assert_eq!(msi.address_hi, 0);
        assert_eq!(msi.data, 0x40);

        let msi = MsiMessage::fixed(0x1_05, 0x22);
        assert_eq!(msi.address_lo, 0xfee0_5000);
        assert_eq!(msi.address_hi, 0x100);
    }
}
