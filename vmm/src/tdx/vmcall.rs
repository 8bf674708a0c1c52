// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! TDG.VP.VMCALL handling: the guest calls that reach userspace, and the
//! shared memory and interrupt plumbing their completions use.

use std::sync::Arc;

use hypervisor::{HypervisorCpuError, MsiMessage, TdxExitDetails, Vcpu, Vm};
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryError};
use zerocopy::{FromBytes, IntoBytes, Immutable};

use super::TdxGuest;
use crate::GuestMemoryMmap;

pub const TDG_VP_VMCALL_MAP_GPA: u64 = 0x10001;
pub const TDG_VP_VMCALL_GET_QUOTE: u64 = 0x10002;
pub const TDG_VP_VMCALL_SETUP_EVENT_NOTIFY_INTERRUPT: u64 = 0x10004;
pub const TDG_VP_VMCALL_SERVICE: u64 = 0x10005;

pub const TDG_VP_VMCALL_SUCCESS: u64 = 0;
pub const TDG_VP_VMCALL_RETRY: u64 = 1;
pub const TDG_VP_VMCALL_INVALID_OPERAND: u64 = 0x8000_0000_0000_0000;
pub const TDG_VP_VMCALL_ALIGN_ERROR: u64 = 0x8000_0000_0000_0002;

/// Vectors a guest may ask to be notified with.
pub const NOTIFY_VECTOR_MIN: u32 = 32;
pub const NOTIFY_VECTOR_MAX: u32 = 255;

pub const TDX_PAGE_SIZE: u64 = 4096;

pub fn valid_notify_vector(vector: u32) -> bool {
    (NOTIFY_VECTOR_MIN..=NOTIFY_VECTOR_MAX).contains(&vector)
}

pub fn page_aligned(v: u64) -> bool {
    v & (TDX_PAGE_SIZE - 1) == 0
}

/// Access to the guest shared memory and interrupt injection.
pub struct GuestChannel {
    vm: Arc<dyn Vm>,
    memory: GuestMemoryMmap,
    phys_bits: u8,
    shared_bit: u64,
}

impl GuestChannel {
    pub fn new(vm: Arc<dyn Vm>, memory: GuestMemoryMmap, phys_bits: u8) -> Self {
        GuestChannel {
            vm,
            memory,
            phys_bits,
            shared_bit: arch::tdx_shared_bit(phys_bits),
        }
    }

    pub fn vm(&self) -> &Arc<dyn Vm> {
        &self.vm
    }

    pub fn phys_bits(&self) -> u8 {
        self.phys_bits
    }

    pub fn shared_bit(&self) -> u64 {
        self.shared_bit
    }

    pub fn is_shared(&self, gpa: u64) -> bool {
        gpa & self.shared_bit != 0
    }

    pub fn strip_shared(&self, gpa: u64) -> u64 {
        gpa & !self.shared_bit
    }

    /// Whether `[gpa, gpa + len)` is backed by guest memory.
    pub fn check_range(&self, gpa: u64, len: usize) -> bool {
        len == 0 || self.memory.check_range(GuestAddress(self.strip_shared(gpa)), len)
    }

    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        self.memory
            .read_slice(buf, GuestAddress(self.strip_shared(gpa)))
    }

    pub fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), GuestMemoryError> {
        self.memory
            .write_slice(buf, GuestAddress(self.strip_shared(gpa)))
    }

    pub fn read_obj<T: FromBytes + IntoBytes>(&self, gpa: u64) -> Result<T, GuestMemoryError> {
        let mut obj = T::new_zeroed();
        self.read(gpa, obj.as_mut_bytes())?;
        Ok(obj)
    }

    pub fn write_obj<T: IntoBytes + Immutable>(
        &self,
        gpa: u64,
        obj: &T,
    ) -> Result<(), GuestMemoryError> {
        self.write(gpa, obj.as_bytes())
    }

    /// Raises `vector` on the vCPU with `apic_id`. Vectors outside of the
    /// notification range mean the guest asked not to be notified.
    pub fn notify(&self, apic_id: u32, vector: u32) {
        if !valid_notify_vector(vector) {
            return;
        }
        if let Err(e) = self.vm.signal_msi(MsiMessage::fixed(apic_id, vector as u8)) {
            warn!(
                "TDX: interrupt lost (vector {} APIC {}): {}",
                vector, apic_id, e
            );
        }
    }
}

impl TdxGuest {
    /// Handles a TDG.VP.VMCALL exit of the vCPU with `apic_id`.
    pub fn handle_vmcall(&self, vcpu: &dyn Vcpu, apic_id: u32) -> Result<(), HypervisorCpuError> {
        let details = vcpu.get_tdx_exit_details()?;
        let status = self.vmcall(&details, apic_id);
        vcpu.set_tdx_status(status);
        Ok(())
    }

    pub(crate) fn vmcall(&self, details: &TdxExitDetails, apic_id: u32) -> u64 {
        if details.r#type != 0 {
            warn!("TDX: unknown TDG.VP.VMCALL type {:#x}", details.r#type);
            return TDG_VP_VMCALL_INVALID_OPERAND;
        }

        match details.subfunction {
            TDG_VP_VMCALL_MAP_GPA => self.map_gpa(details.in_r12, details.in_r13),
            TDG_VP_VMCALL_GET_QUOTE => self.get_quote(details.in_r12, details.in_r13),
            TDG_VP_VMCALL_SETUP_EVENT_NOTIFY_INTERRUPT => {
                self.setup_event_notify(details.in_r12, apic_id)
            }
            // Completions go to the APIC registered for the TD, not the caller.
            TDG_VP_VMCALL_SERVICE => self.service().dispatch(
                details.in_r12,
                details.in_r13,
                details.in_r14,
                details.in_r15,
                self.event_notify().0,
            ),
            subfunction => {
                warn!("TDX: unknown TDG.VP.VMCALL subfunction {:#x}", subfunction);
                TDG_VP_VMCALL_INVALID_OPERAND
            }
        }
    }

    /// Converts `[gpa, gpa + size)` to private, or to shared when the shared
    /// bit of `gpa` is set.
    fn map_gpa(&self, gpa: u64, size: u64) -> u64 {
        let guest = self.guest();
        let private = !guest.is_shared(gpa);
        let gpa = guest.strip_shared(gpa);

        let limit = 1u64 << guest.phys_bits();
        if gpa.checked_add(size).is_none_or(|end| end > limit) {
            debug!("TDX: MapGPA {:#x}+{:#x} beyond the guest address width", gpa, size);
            return TDG_VP_VMCALL_INVALID_OPERAND;
        }
        if !page_aligned(gpa) || !page_aligned(size) {
            return TDG_VP_VMCALL_ALIGN_ERROR;
        }

        if size > 0 {
            if let Err(e) = guest.vm().set_memory_private(gpa, size, private) {
                warn!(
                    "TDX: MapGPA {:#x}+{:#x} to {} failed: {}",
                    gpa,
                    size,
                    if private { "private" } else { "shared" },
                    e
                );
                return TDG_VP_VMCALL_INVALID_OPERAND;
            }
        }

        TDG_VP_VMCALL_SUCCESS
    }

    fn setup_event_notify(&self, vector: u64, apic_id: u32) -> u64 {
        match u32::try_from(vector) {
            Ok(vector) if valid_notify_vector(vector) => {
                let mut td = self.state.lock().unwrap();
                td.event_notify_vector = vector;
                td.event_notify_apic_id = apic_id;
                TDG_VP_VMCALL_SUCCESS
            }
            _ => TDG_VP_VMCALL_INVALID_OPERAND,
        }
    }

    fn get_quote(&self, gpa: u64, size: u64) -> u64 {
        let (apic_id, vector) = self.event_notify();
        self.quote().get_quote(gpa, size, apic_id, vector)
    }
}
