// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! KVM_MEMORY_ENCRYPT_OP sub-commands used to drive a trust domain.

use std::os::unix::io::AsRawFd;

use kvm_bindings::{kvm_cpuid_entry2, KVMIO};
use vmm_sys_util::errno;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_io_nr, ioctl_iowr_nr};

use crate::arch::x86::tdx::{
    TdxCapabilities, TdxCpuidConfig, TdxExitDetails, TdxInitParams, TdxMigrationState,
    TdxServtdBinding, TdxServtdTarget, TDX_MEASUREMENT_SIZE,
};
use crate::arch::x86::CpuIdEntry;

ioctl_iowr_nr!(KVM_MEMORY_ENCRYPT_OP, KVMIO, 0xba, std::os::raw::c_ulong);
ioctl_io_nr!(KVM_SET_TSC_KHZ, KVMIO, 0xa2);

pub const KVM_X86_TDX_VM: u64 = 5;
pub const KVM_EXIT_TDX: u32 = 50;
pub const KVM_EXIT_TDX_VMCALL: u32 = 1;

const KVM_TDX_INIT_VM_F_POST_INIT: u32 = 1;
const KVM_TDX_MEASURE_MEMORY_REGION: u32 = 1;
const KVM_TDX_SERVTD_TYPE_MIGTD: u16 = 0;
const KVM_TDX_MAX_CPUID_ENTRIES: usize = 256;

#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum TdxCommand {
    Capabilities = 0,
    InitVm,
    InitVcpu,
    InitMemRegion,
    FinalizeVm,
    ReleaseVm,
    ServtdPrebind,
    ServtdBind,
    GetMigrationInfo,
    SetMigrationInfo,
    MigExportState,
    MigImportState,
    MigCancelPages,
    MigExportPause,
    MigExportAbort,
    MigImportEnd,
}

#[repr(C)]
#[derive(Debug, Default)]
struct TdxIoctlCmd {
    command: u32,
    flags: u32,
    data: u64,
    error: u64,
    unused: u64,
}

/// Issues a TDX sub-command on a platform, VM or vCPU file descriptor.
pub fn tdx_command(
    fd: &impl AsRawFd,
    command: TdxCommand,
    flags: u32,
    data: u64,
) -> Result<(), errno::Error> {
    let mut cmd = TdxIoctlCmd {
        command: command as u32,
        flags,
        data,
        error: 0,
        unused: 0,
    };
    // SAFETY: FFI call. All input parameters are valid and the kernel only
    // accesses `data` according to `command`.
    let ret = unsafe { ioctl_with_mut_ref(fd, KVM_MEMORY_ENCRYPT_OP(), &mut cmd) };
    if ret < 0 {
        let err = errno::Error::last();
        debug!(
            "TDX command {:?} failed: {} (TDX error 0x{:x})",
            command, err, cmd.error
        );
        return Err(err);
    }
    Ok(())
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct KvmTdxCpuidConfig {
    leaf: u32,
    sub_leaf: u32,
    eax: u32,
    ebx: u32,
    ecx: u32,
    edx: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct KvmTdxCapabilities {
    attrs_fixed0: u64,
    attrs_fixed1: u64,
    xfam_fixed0: u64,
    xfam_fixed1: u64,
    supported_gpaw: u32,
    padding: u32,
    reserved: [u64; 251],
    nr_cpuid_configs: u32,
    cpuid_configs: [KvmTdxCpuidConfig; 0],
}

impl Default for KvmTdxCapabilities {
    fn default() -> Self {
        KvmTdxCapabilities {
            attrs_fixed0: 0,
            attrs_fixed1: 0,
            xfam_fixed0: 0,
            xfam_fixed1: 0,
            supported_gpaw: 0,
            padding: 0,
            reserved: [0; 251],
            nr_cpuid_configs: 0,
            cpuid_configs: [],
        }
    }
}

/// Reads the capabilities with room for `nr_cpuid_configs` entries. The
/// kernel fails with E2BIG when the buffer is too small.
pub fn get_capabilities(
    fd: &impl AsRawFd,
    nr_cpuid_configs: usize,
) -> Result<TdxCapabilities, errno::Error> {
    let mut buf = super::super::vec_with_array_field::<KvmTdxCapabilities, KvmTdxCpuidConfig>(
        nr_cpuid_configs,
    );
    buf[0].nr_cpuid_configs = nr_cpuid_configs as u32;
    tdx_command(
        fd,
        TdxCommand::Capabilities,
        0,
        buf.as_mut_ptr() as *mut KvmTdxCapabilities as u64,
    )?;

    let caps = &buf[0];
    let count = (caps.nr_cpuid_configs as usize).min(nr_cpuid_configs);
    // SAFETY: `buf` was sized for `nr_cpuid_configs` trailing entries and the
    // kernel filled `count` of them.
    let configs = unsafe { std::slice::from_raw_parts(caps.cpuid_configs.as_ptr(), count) };

    Ok(TdxCapabilities {
        attrs_fixed0: caps.attrs_fixed0,
        attrs_fixed1: caps.attrs_fixed1,
        xfam_fixed0: caps.xfam_fixed0,
        xfam_fixed1: caps.xfam_fixed1,
        supported_gpaw: caps.supported_gpaw,
        cpuid_configs: configs
            .iter()
            .map(|c| TdxCpuidConfig {
                leaf: c.leaf,
                sub_leaf: c.sub_leaf,
                eax: c.eax,
                ebx: c.ebx,
                ecx: c.ecx,
                edx: c.edx,
            })
            .collect(),
    })
}

#[repr(C)]
#[derive(Clone, Copy)]
struct KvmTdxInitVm {
    attributes: u64,
    mrconfigid: [u8; TDX_MEASUREMENT_SIZE],
    mrowner: [u8; TDX_MEASUREMENT_SIZE],
    mrownerconfig: [u8; TDX_MEASUREMENT_SIZE],
    reserved: [u64; 1004],
    nent: u32,
    padding: u32,
    entries: [kvm_cpuid_entry2; 0],
}

impl Default for KvmTdxInitVm {
    fn default() -> Self {
        KvmTdxInitVm {
            attributes: 0,
            mrconfigid: [0; TDX_MEASUREMENT_SIZE],
            mrowner: [0; TDX_MEASUREMENT_SIZE],
            mrownerconfig: [0; TDX_MEASUREMENT_SIZE],
            reserved: [0; 1004],
            nent: 0,
            padding: 0,
            entries: [],
        }
    }
}

fn cpuid_entry2(entry: &CpuIdEntry) -> kvm_cpuid_entry2 {
    kvm_cpuid_entry2 {
        function: entry.function,
        index: entry.index,
        flags: entry.flags,
        eax: entry.eax,
        ebx: entry.ebx,
        ecx: entry.ecx,
        edx: entry.edx,
        ..Default::default()
    }
}

pub fn init_vm(fd: &impl AsRawFd, params: &TdxInitParams) -> Result<(), errno::Error> {
    if params.cpuid.len() > KVM_TDX_MAX_CPUID_ENTRIES {
        return Err(errno::Error::new(libc::E2BIG));
    }
    let nent = params.cpuid.len();
    let mut buf = super::super::vec_with_array_field::<KvmTdxInitVm, kvm_cpuid_entry2>(nent);
    buf[0].attributes = params.attributes;
    buf[0].mrconfigid = params.mrconfigid;
    buf[0].mrowner = params.mrowner;
    buf[0].mrownerconfig = params.mrownerconfig;
    buf[0].nent = nent as u32;
    // SAFETY: `buf` holds room for `nent` trailing entries.
    let entries = unsafe { std::slice::from_raw_parts_mut(buf[0].entries.as_mut_ptr(), nent) };
    for (dst, src) in entries.iter_mut().zip(params.cpuid.iter()) {
        *dst = cpuid_entry2(src);
    }

    let flags = if params.post_init {
        KVM_TDX_INIT_VM_F_POST_INIT
    } else {
        0
    };
    tdx_command(
        fd,
        TdxCommand::InitVm,
        flags,
        buf.as_mut_ptr() as *mut KvmTdxInitVm as u64,
    )
}

#[repr(C)]
#[derive(Debug, Default)]
struct KvmTdxInitMemRegion {
    source_addr: u64,
    gpa: u64,
    nr_pages: u64,
}

pub fn init_memory_region(
    fd: &impl AsRawFd,
    host_address: u64,
    guest_address: u64,
    size: u64,
    measure: bool,
) -> Result<(), errno::Error> {
    let data = KvmTdxInitMemRegion {
        source_addr: host_address,
        gpa: guest_address,
        nr_pages: size / 4096,
    };
    let flags = if measure {
        KVM_TDX_MEASURE_MEMORY_REGION
    } else {
        0
    };
    tdx_command(
        fd,
        TdxCommand::InitMemRegion,
        flags,
        &data as *const KvmTdxInitMemRegion as u64,
    )
}

#[repr(C)]
#[derive(Debug)]
struct KvmTdxServtd {
    version: u8,
    pad: [u8; 5],
    type_: u16,
    attr: u64,
    pid_or_hash: [u8; TDX_MEASUREMENT_SIZE],
}

impl Default for KvmTdxServtd {
    fn default() -> Self {
        KvmTdxServtd {
            version: 0,
            pad: [0; 5],
            type_: 0,
            attr: 0,
            pid_or_hash: [0; TDX_MEASUREMENT_SIZE],
        }
    }
}

pub fn bind_servtd(fd: &impl AsRawFd, binding: &TdxServtdBinding) -> Result<(), errno::Error> {
    let mut servtd = KvmTdxServtd {
        type_: KVM_TDX_SERVTD_TYPE_MIGTD,
        attr: binding.attr,
        ..Default::default()
    };
    let command = match binding.target {
        TdxServtdTarget::Pid(pid) => {
            servtd.pid_or_hash[..4].copy_from_slice(&pid.to_le_bytes());
            TdxCommand::ServtdBind
        }
        TdxServtdTarget::Hash(hash) => {
            servtd.pid_or_hash = hash;
            TdxCommand::ServtdPrebind
        }
    };
    tdx_command(fd, command, 0, &servtd as *const KvmTdxServtd as u64)
}

#[repr(C)]
#[derive(Debug, Default)]
struct KvmTdxGetMigrationInfo {
    version: u8,
    premig_done: u8,
    pad: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Default)]
struct KvmTdxSetMigrationInfo {
    version: u8,
    is_src: u8,
    pad: [u8; 2],
    vsock_port: u32,
}

pub fn get_migration_info(fd: &impl AsRawFd) -> Result<bool, errno::Error> {
    let mut info = KvmTdxGetMigrationInfo::default();
    tdx_command(
        fd,
        TdxCommand::GetMigrationInfo,
        0,
        &mut info as *mut KvmTdxGetMigrationInfo as u64,
    )?;
    Ok(info.premig_done != 0)
}

pub fn set_migration_info(
    fd: &impl AsRawFd,
    is_src: bool,
    vsock_port: u32,
) -> Result<(), errno::Error> {
    let info = KvmTdxSetMigrationInfo {
        is_src: is_src as u8,
        vsock_port,
        ..Default::default()
    };
    tdx_command(
        fd,
        TdxCommand::SetMigrationInfo,
        0,
        &info as *const KvmTdxSetMigrationInfo as u64,
    )
}

const KVM_TDX_MIG_STATE_TD_IMMUTABLE: u32 = 0;
const KVM_TDX_MIG_STATE_TD_MUTABLE: u32 = 1;
const KVM_TDX_MIG_STATE_VCPU: u32 = 2;
const KVM_TDX_MIG_STATE_EPOCH_TOKEN: u32 = 3;
const KVM_TDX_MIG_STATE_PRIVATE_PAGES: u32 = 4;

/// Buffer descriptor of the migration export/import commands. On export,
/// the kernel updates `buf_len` with the number of bytes produced.
#[repr(C)]
#[derive(Debug, Default)]
struct KvmTdxMigState {
    kind: u32,
    stream: u32,
    vcpu: u32,
    pad: u32,
    gpa_list: u64,
    nr_gpas: u64,
    buf: u64,
    buf_len: u64,
}

fn mig_state(state: TdxMigrationState, stream: u32, gpas: &[u64]) -> KvmTdxMigState {
    let (kind, vcpu) = match state {
        TdxMigrationState::TdImmutable => (KVM_TDX_MIG_STATE_TD_IMMUTABLE, 0),
        TdxMigrationState::TdMutable => (KVM_TDX_MIG_STATE_TD_MUTABLE, 0),
        TdxMigrationState::Vcpu(id) => (KVM_TDX_MIG_STATE_VCPU, id),
        TdxMigrationState::EpochToken => (KVM_TDX_MIG_STATE_EPOCH_TOKEN, 0),
        TdxMigrationState::PrivatePages => (KVM_TDX_MIG_STATE_PRIVATE_PAGES, 0),
    };
    KvmTdxMigState {
        kind,
        stream,
        vcpu,
        gpa_list: gpas.as_ptr() as u64,
        nr_gpas: gpas.len() as u64,
        ..Default::default()
    }
}

pub fn export_state(
    fd: &impl AsRawFd,
    state: TdxMigrationState,
    stream: u32,
    gpas: &[u64],
    buf: &mut [u8],
) -> Result<usize, errno::Error> {
    let mut data = mig_state(state, stream, gpas);
    data.buf = buf.as_mut_ptr() as u64;
    data.buf_len = buf.len() as u64;
    tdx_command(
        fd,
        TdxCommand::MigExportState,
        0,
        &mut data as *mut KvmTdxMigState as u64,
    )?;
    Ok((data.buf_len as usize).min(buf.len()))
}

pub fn import_state(
    fd: &impl AsRawFd,
    state: TdxMigrationState,
    stream: u32,
    gpas: &[u64],
    buf: &[u8],
) -> Result<(), errno::Error> {
    let mut data = mig_state(state, stream, gpas);
    data.buf = buf.as_ptr() as u64;
    data.buf_len = buf.len() as u64;
    tdx_command(
        fd,
        TdxCommand::MigImportState,
        0,
        &mut data as *mut KvmTdxMigState as u64,
    )
}

pub fn cancel_pages(fd: &impl AsRawFd, stream: u32, gpas: &[u64]) -> Result<(), errno::Error> {
    let mut data = mig_state(TdxMigrationState::PrivatePages, stream, gpas);
    tdx_command(
        fd,
        TdxCommand::MigCancelPages,
        0,
        &mut data as *mut KvmTdxMigState as u64,
    )
}

/// Layout of the TDX exit within `kvm_run`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmTdxExit {
    pub type_: u32,
    pub pad: u32,
    pub vmcall: KvmTdxExitVmcall,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KvmTdxExitVmcall {
    pub type_: u64,
    pub subfunction: u64,
    pub reg_mask: u64,
    pub in_r12: u64,
    pub in_r13: u64,
    pub in_r14: u64,
    pub in_r15: u64,
    pub in_rbx: u64,
    pub in_rdi: u64,
    pub in_rsi: u64,
    pub in_r8: u64,
    pub in_r9: u64,
    pub in_rdx: u64,
    pub status_code: u64,
    pub out_r11: u64,
    pub out_r12: u64,
    pub out_r13: u64,
    pub out_r14: u64,
    pub out_r15: u64,
    pub out_rbx: u64,
    pub out_rdi: u64,
    pub out_rsi: u64,
    pub out_r8: u64,
    pub out_r9: u64,
    pub out_rdx: u64,
}

impl From<&KvmTdxExitVmcall> for TdxExitDetails {
    fn from(vmcall: &KvmTdxExitVmcall) -> Self {
        TdxExitDetails {
            r#type: vmcall.type_,
            subfunction: vmcall.subfunction,
            in_r12: vmcall.in_r12,
            in_r13: vmcall.in_r13,
            in_r14: vmcall.in_r14,
            in_r15: vmcall.in_r15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_sizes() {
        assert_eq!(std::mem::size_of::<TdxIoctlCmd>(), 32);
        assert_eq!(std::mem::size_of::<KvmTdxCpuidConfig>(), 24);
        assert_eq!(std::mem::size_of::<KvmTdxCapabilities>(), 2056);
        assert_eq!(std::mem::size_of::<KvmTdxInitVm>(), 8192);
        assert_eq!(std::mem::size_of::<KvmTdxServtd>(), 64);
        assert_eq!(std::mem::size_of::<KvmTdxSetMigrationInfo>(), 8);
    }
}
