// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use std::fs::File;
use std::mem::size_of;
use std::os::raw::c_ulong;
use std::os::unix::io::FromRawFd;
use std::result;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use kvm_bindings::{
    kvm_create_guest_memfd, kvm_enable_cap, kvm_memory_attributes, kvm_msi, kvm_run,
    kvm_userspace_memory_region2, KVM_CAP_MAX_VCPUS, KVM_CAP_SPLIT_IRQCHIP,
    KVM_MEMORY_ATTRIBUTE_PRIVATE, KVM_MEMORY_EXIT_FLAG_PRIVATE, KVM_MEM_GUEST_MEMFD,
};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use vmm_sys_util::ioctl::ioctl_with_val;

use crate::arch::x86::tdx::{
    TdxCapabilities, TdxExitDetails, TdxInitParams, TdxMigrationInfo, TdxMigrationState,
    TdxServtdBinding,
};
use crate::arch::x86::CpuIdEntry;
use crate::vm::{self, MsiMessage, VmType};
use crate::{cpu, hypervisor};

// x86_64 dependencies
pub mod x86_64;

use x86_64::tdx::{self, KvmTdxExit, TdxCommand, KVM_EXIT_TDX, KVM_EXIT_TDX_VMCALL};
use x86_64::check_required_kvm_extensions;

pub use kvm_bindings;
pub use kvm_ioctls;
pub use kvm_ioctls::{Cap, Kvm};

/// Number of IOAPIC pins of the split irqchip.
const NUM_IOAPIC_PINS: u64 = 24;

/// Wrapper over KVM VM ioctls.
pub struct KvmVm {
    fd: Arc<VmFd>,
    vm_type: VmType,
    guest_memfds: Mutex<Vec<File>>,
}

// Returns a `Vec<T>` with a size in bytes at least as large as `size_in_bytes`.
fn vec_with_size_in_bytes<T: Default>(size_in_bytes: usize) -> Vec<T> {
    let rounded_size = size_in_bytes.div_ceil(size_of::<T>());
    let mut v = Vec::with_capacity(rounded_size);
    v.resize_with(rounded_size, T::default);
    v
}

// The kvm API has many structs that resemble the following `Foo` structure:
//
// ```
// #[repr(C)]
// struct Foo {
//    some_data: u32
//    entries: __IncompleteArrayField<__u32>,
// }
// ```
//
// In order to allocate such a structure, `size_of::<Foo>()` would be too small because it would not
// include any space for `entries`. To make the allocation large enough while still being aligned
// for `Foo`, a `Vec<Foo>` is created. Only the first element of `Vec<Foo>` would actually be used
// as a `Foo`. The remaining memory in the `Vec<Foo>` is for `entries`, which must be contiguous
// with `Foo`. This function is used to make the `Vec<Foo>` with enough space for `count` entries.
fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    vec_with_size_in_bytes(vec_size_bytes)
}

impl KvmVm {
    fn enable_cap(&self, cap: u32, arg: u64) -> vm::Result<()> {
        let mut enable_cap = kvm_enable_cap {
            cap,
            ..Default::default()
        };
        enable_cap.args[0] = arg;
        self.fd
            .enable_cap(&enable_cap)
            .map_err(|e| vm::HypervisorVmError::EnableCap(e.into()))
    }

    fn check_tdx(&self) -> vm::Result<()> {
        if self.vm_type != VmType::Tdx {
            return Err(vm::HypervisorVmError::InitializeTdx(
                vmm_sys_util::errno::Error::new(libc::ENOTTY),
            ));
        }
        Ok(())
    }
}

///
/// Implementation of Vm trait for KVM
///
impl vm::Vm for KvmVm {
    ///
    /// Creates a VcpuFd object from a vcpu RawFd.
    ///
    fn create_vcpu(&self, id: u32) -> vm::Result<Arc<dyn cpu::Vcpu>> {
        let fd = self
            .fd
            .create_vcpu(id as u64)
            .map_err(|e| vm::HypervisorVmError::CreateVcpu(e.into()))?;
        Ok(Arc::new(KvmVcpu {
            fd: Mutex::new(fd),
            id,
        }))
    }

    fn enable_max_vcpus(&self, max_vcpus: u32) -> vm::Result<()> {
        self.enable_cap(KVM_CAP_MAX_VCPUS, u64::from(max_vcpus))
    }

    fn set_tsc_khz(&self, tsc_khz: u32) -> vm::Result<()> {
        // SAFETY: FFI call with a plain integer argument.
        let ret = unsafe {
            ioctl_with_val(
                self.fd.as_ref(),
                x86_64::tdx::KVM_SET_TSC_KHZ(),
                tsc_khz as c_ulong,
            )
        };
        if ret < 0 {
            return Err(vm::HypervisorVmError::SetTscKhz(
                vmm_sys_util::errno::Error::last().into(),
            ));
        }
        Ok(())
    }

    fn create_user_memory_region(
        &self,
        slot: u32,
        guest_phys_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
        private: bool,
    ) -> vm::Result<()> {
        let mut region = kvm_userspace_memory_region2 {
            slot,
            flags: 0,
            guest_phys_addr,
            memory_size,
            userspace_addr,
            guest_memfd_offset: 0,
            guest_memfd: 0,
            pad1: 0,
            pad2: [0; 14],
        };

        if private {
            let guest_memfd = self
                .fd
                .create_guest_memfd(kvm_create_guest_memfd {
                    size: memory_size,
                    flags: 0,
                    reserved: [0; 6],
                })
                .map_err(|e| vm::HypervisorVmError::CreateGuestMemfd(e.into()))?;
            // SAFETY: the fd was just created and nothing else owns it.
            let file = unsafe { File::from_raw_fd(guest_memfd) };
            region.flags = KVM_MEM_GUEST_MEMFD;
            region.guest_memfd = guest_memfd as u32;
            self.guest_memfds.lock().unwrap().push(file);
        }

        // SAFETY: the caller owns the mapping at `userspace_addr` for the
        // lifetime of the VM and regions do not overlap.
        unsafe {
            self.fd
                .set_user_memory_region2(region)
                .map_err(|e| vm::HypervisorVmError::SetUserMemory(e.into()))?;
        }

        if private {
            self.set_memory_private(guest_phys_addr, memory_size, true)?;
        }
        Ok(())
    }

    fn set_memory_private(&self, gpa: u64, size: u64, private: bool) -> vm::Result<()> {
        let attributes = if private {
            KVM_MEMORY_ATTRIBUTE_PRIVATE as u64
        } else {
            0
        };
        self.fd
            .set_memory_attributes(kvm_memory_attributes {
                address: gpa,
                size,
                attributes,
                flags: 0,
            })
            .map_err(|e| vm::HypervisorVmError::SetMemoryAttributes(e.into()))
    }

    fn signal_msi(&self, msi: MsiMessage) -> vm::Result<()> {
        let msi = kvm_msi {
            address_lo: msi.address_lo,
            address_hi: msi.address_hi,
            data: msi.data,
            ..Default::default()
        };
        // A zero return means the guest blocked the interrupt.
        self.fd
            .signal_msi(msi)
            .map(|_| ())
            .map_err(|e| vm::HypervisorVmError::SignalMsi(e.into()))
    }

    fn tdx_capabilities(&self, nr_cpuid_configs: usize) -> vm::Result<TdxCapabilities> {
        tdx::get_capabilities(self.fd.as_ref(), nr_cpuid_configs)
            .map_err(vm::HypervisorVmError::TdxCapabilities)
    }

    fn tdx_init(&self, params: &TdxInitParams) -> vm::Result<()> {
        self.check_tdx()?;
        tdx::init_vm(self.fd.as_ref(), params).map_err(vm::HypervisorVmError::InitializeTdx)
    }

    fn tdx_init_memory_region(
        &self,
        host_address: u64,
        guest_address: u64,
        size: u64,
        measure: bool,
    ) -> vm::Result<()> {
        tdx::init_memory_region(self.fd.as_ref(), host_address, guest_address, size, measure)
            .map_err(vm::HypervisorVmError::InitMemRegionTdx)
    }

    fn tdx_finalize(&self) -> vm::Result<()> {
        tdx::tdx_command(self.fd.as_ref(), TdxCommand::FinalizeVm, 0, 0)
            .map_err(vm::HypervisorVmError::FinalizeTdx)
    }

    fn tdx_bind_servtd(&self, binding: &TdxServtdBinding) -> vm::Result<()> {
        tdx::bind_servtd(self.fd.as_ref(), binding).map_err(vm::HypervisorVmError::BindServtd)
    }

    fn tdx_get_migration_info(&self) -> vm::Result<TdxMigrationInfo> {
        let premig_done = tdx::get_migration_info(self.fd.as_ref())
            .map_err(vm::HypervisorVmError::MigrationInfo)?;
        Ok(TdxMigrationInfo { premig_done })
    }

    fn tdx_set_migration_info(&self, is_src: bool, vsock_port: u32) -> vm::Result<()> {
        tdx::set_migration_info(self.fd.as_ref(), is_src, vsock_port)
            .map_err(vm::HypervisorVmError::MigrationInfo)
    }

    fn tdx_export_state(
        &self,
        state: TdxMigrationState,
        channel: u32,
        gpas: &[u64],
        buf: &mut [u8],
    ) -> vm::Result<usize> {
        tdx::export_state(self.fd.as_ref(), state, channel, gpas, buf)
            .map_err(vm::HypervisorVmError::TdxMigration)
    }

    fn tdx_import_state(
        &self,
        state: TdxMigrationState,
        channel: u32,
        gpas: &[u64],
        data: &[u8],
    ) -> vm::Result<()> {
        tdx::import_state(self.fd.as_ref(), state, channel, gpas, data)
            .map_err(vm::HypervisorVmError::TdxMigration)
    }

    fn tdx_cancel_pages(&self, channel: u32, gpas: &[u64]) -> vm::Result<()> {
        tdx::cancel_pages(self.fd.as_ref(), channel, gpas)
            .map_err(vm::HypervisorVmError::TdxMigration)
    }

    fn tdx_pause_export(&self) -> vm::Result<()> {
        tdx::tdx_command(self.fd.as_ref(), TdxCommand::MigExportPause, 0, 0)
            .map_err(vm::HypervisorVmError::TdxMigration)
    }

    fn tdx_abort_export(&self, gfn_end: u64) -> vm::Result<()> {
        tdx::tdx_command(self.fd.as_ref(), TdxCommand::MigExportAbort, 0, gfn_end)
            .map_err(vm::HypervisorVmError::TdxMigration)
    }

    fn tdx_end_import(&self) -> vm::Result<()> {
        tdx::tdx_command(self.fd.as_ref(), TdxCommand::MigImportEnd, 0, 0)
            .map_err(vm::HypervisorVmError::TdxMigration)
    }
}

/// Wrapper over KVM system ioctls.
pub struct KvmHypervisor {
    kvm: Kvm,
}
/// Enum for KVM related error
#[derive(Debug)]
pub enum KvmError {
    CapabilityMissing(Cap),
}
pub type KvmResult<T> = result::Result<T, KvmError>;
impl KvmHypervisor {
    /// Create a hypervisor based on Kvm
    pub fn new() -> hypervisor::Result<KvmHypervisor> {
        let kvm_obj =
            Kvm::new().map_err(|e| hypervisor::HypervisorError::HypervisorCreate(e.into()))?;
        let api_version = kvm_obj.get_api_version();

        if api_version != kvm_bindings::KVM_API_VERSION as i32 {
            return Err(hypervisor::HypervisorError::IncompatibleApiVersion);
        }

        check_required_kvm_extensions(&kvm_obj).map_err(|e| {
            hypervisor::HypervisorError::HypervisorAvailableCheck(anyhow!(
                "Missing KVM capability: {:?}",
                e
            ))
        })?;

        Ok(KvmHypervisor { kvm: kvm_obj })
    }
}
/// Implementation of Hypervisor trait for KVM
impl hypervisor::Hypervisor for KvmHypervisor {
    fn hypervisor_type(&self) -> hypervisor::HypervisorType {
        hypervisor::HypervisorType::Kvm
    }

    /// Create a KVM vm object and return the object as Vm trait object
    fn create_vm(&self, vm_type: VmType) -> hypervisor::Result<Arc<dyn vm::Vm>> {
        let kvm_type = match vm_type {
            VmType::Legacy => 0,
            VmType::Tdx => tdx::KVM_X86_TDX_VM,
        };

        let fd: VmFd;
        loop {
            match self.kvm.create_vm_with_type(kvm_type) {
                Ok(res) => fd = res,
                Err(e) => {
                    if e.errno() == libc::EINTR {
                        // If the error returned is EINTR, which means the
                        // ioctl has been interrupted, we have to retry as
                        // this can't be considered as a regular error.
                        continue;
                    } else {
                        return Err(hypervisor::HypervisorError::VmCreate(e.into()));
                    }
                }
            }
            break;
        }

        let vm = KvmVm {
            fd: Arc::new(fd),
            vm_type,
            guest_memfds: Mutex::new(Vec::new()),
        };

        // A TD needs the IOAPIC in userspace.
        if vm_type == VmType::Tdx {
            vm.enable_cap(KVM_CAP_SPLIT_IRQCHIP, NUM_IOAPIC_PINS)
                .map_err(|e| hypervisor::HypervisorError::VmCreate(e.into()))?;
        }

        Ok(Arc::new(vm))
    }

    ///
    /// X86 specific call to get the system supported CPUID values.
    ///
    fn get_supported_cpuid(&self) -> hypervisor::Result<Vec<CpuIdEntry>> {
        let cpuid = self
            .kvm
            .get_supported_cpuid(kvm_bindings::KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| hypervisor::HypervisorError::GetCpuId(e.into()))?;
        Ok(x86_64::cpuid_entries(&cpuid))
    }

    fn tdx_capabilities(&self, nr_cpuid_configs: usize) -> hypervisor::Result<TdxCapabilities> {
        tdx::get_capabilities(&self.kvm, nr_cpuid_configs)
            .map_err(hypervisor::HypervisorError::TdxCapabilities)
    }
}

/// Vcpu struct for KVM
pub struct KvmVcpu {
    fd: Mutex<VcpuFd>,
    id: u32,
}

impl KvmVcpu {
    fn tdx_exit(kvm_run: &mut kvm_run) -> &mut KvmTdxExit {
        // SAFETY: the exit reason is KVM_EXIT_TDX, so the union holds a
        // `KvmTdxExit`.
        unsafe { &mut *(&mut kvm_run.__bindgen_anon_1 as *mut _ as *mut KvmTdxExit) }
    }
}

/// Implementation of Vcpu trait for KVM
impl cpu::Vcpu for KvmVcpu {
    ///
    /// Triggers the running of the current virtual CPU returning an exit reason.
    ///
    fn run(&self) -> std::result::Result<cpu::VmExit, cpu::HypervisorCpuError> {
        let mut fd = self.fd.lock().unwrap();
        match fd.run() {
            Ok(run) => match run {
                VcpuExit::Shutdown | VcpuExit::Hlt => Ok(cpu::VmExit::Reset),
                VcpuExit::SystemEvent(event_type, _) => {
                    if event_type == kvm_bindings::KVM_SYSTEM_EVENT_RESET {
                        Ok(cpu::VmExit::Reset)
                    } else {
                        Ok(cpu::VmExit::Shutdown)
                    }
                }
                VcpuExit::MemoryFault { gpa, size, flags } => Ok(cpu::VmExit::MemoryFault {
                    gpa,
                    size,
                    private: flags & (KVM_MEMORY_EXIT_FLAG_PRIVATE as u64) != 0,
                }),
                VcpuExit::Unsupported(KVM_EXIT_TDX) => Ok(cpu::VmExit::Tdx),
                r => Err(cpu::HypervisorCpuError::RunVcpu(anyhow!(
                    "Unexpected exit reason on vcpu {} run: {:?}",
                    self.id,
                    r
                ))),
            },

            Err(ref e) => match e.errno() {
                libc::EAGAIN | libc::EINTR => Ok(cpu::VmExit::Ignore),
                _ => Err(cpu::HypervisorCpuError::RunVcpu(anyhow!(
                    "VCPU error {:?}",
                    e
                ))),
            },
        }
    }

    fn tdx_init(&self, hob_address: u64) -> cpu::Result<()> {
        tdx::tdx_command(&*self.fd.lock().unwrap(), TdxCommand::InitVcpu, 0, hob_address)
            .map_err(cpu::HypervisorCpuError::InitializeTdx)
    }

    fn get_tdx_exit_details(&self) -> cpu::Result<TdxExitDetails> {
        let mut fd = self.fd.lock().unwrap();
        let exit = Self::tdx_exit(fd.get_kvm_run());
        if exit.type_ != KVM_EXIT_TDX_VMCALL {
            return Err(cpu::HypervisorCpuError::UnknownTdxVmCall);
        }
        Ok(TdxExitDetails::from(&exit.vmcall))
    }

    fn set_tdx_status(&self, status: u64) {
        let mut fd = self.fd.lock().unwrap();
        Self::tdx_exit(fd.get_kvm_run()).vmcall.status_code = status;
    }
}
