// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ops::Deref;
use std::result;
use std::sync::Arc;

use arch::{GuestMemoryMmap, GuestRegionMmap, RegionType};
use hypervisor::{HypervisorVmError, Vm};
use libc::{MAP_ANONYMOUS, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use thiserror::Error;
use vm_memory::mmap::MmapRegionError;
use vm_memory::{
    Error as MmapError, GuestAddress, GuestMemory, GuestMemoryRegion, GuestUsize, MmapRegion,
};

use crate::tdx::TdMemory;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot create memory region: {0}")]
    GuestMemoryRegion(#[source] MmapRegionError),
    #[error("Cannot create guest memory: {0}")]
    GuestMemory(#[source] MmapError),
    #[error("Cannot create user memory region: {0}")]
    CreateUserMemoryRegion(#[source] HypervisorVmError),
    #[error("Region {0:#x}+{1:#x} overlaps guest memory")]
    Overlap(u64, u64),
}

pub type Result<T> = result::Result<T, Error>;

/// RAM `(address, length)` extents of a guest with `size` bytes of memory.
pub fn ram_extents_for(size: GuestUsize) -> Vec<(u64, u64)> {
    arch::arch_memory_regions(size)
        .into_iter()
        .filter(|r| r.2 == RegionType::Ram)
        .map(|r| (r.0 .0, r.1 as u64))
        .collect()
}

pub struct MemoryManager {
    vm: Arc<dyn Vm>,
    guest_memory: GuestMemoryMmap,
    // Private memory backing firmware sections that live outside of RAM.
    firmware_regions: Vec<Arc<GuestRegionMmap>>,
    private: bool,
    next_memory_slot: u32,
}

impl MemoryManager {
    /// Allocates `size` bytes of guest RAM. With `private`, every slot gets
    /// a private backing the guest can convert its pages into.
    pub fn new(vm: Arc<dyn Vm>, size: GuestUsize, private: bool) -> Result<Self> {
        let regions = ram_extents_for(size)
            .into_iter()
            .map(|(start, len)| Self::create_ram_region(GuestAddress(start), len as usize))
            .collect::<Result<Vec<_>>>()?;
        let guest_memory =
            GuestMemoryMmap::from_arc_regions(regions.clone()).map_err(Error::GuestMemory)?;

        let mut memory_manager = MemoryManager {
            vm,
            guest_memory,
            firmware_regions: Vec::new(),
            private,
            next_memory_slot: 0,
        };

        for region in regions {
            memory_manager.create_userspace_mapping(&region)?;
        }

        Ok(memory_manager)
    }

    fn create_ram_region(start_addr: GuestAddress, size: usize) -> Result<Arc<GuestRegionMmap>> {
        let region = GuestRegionMmap::new(
            MmapRegion::build(
                None,
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_PRIVATE | MAP_ANONYMOUS,
            )
            .map_err(Error::GuestMemoryRegion)?,
            start_addr,
        )
        .map_err(Error::GuestMemory)?;

        Ok(Arc::new(region))
    }

    fn allocate_memory_slot(&mut self) -> u32 {
        let slot = self.next_memory_slot;
        self.next_memory_slot += 1;
        slot
    }

    fn create_userspace_mapping(&mut self, region: &GuestRegionMmap) -> Result<u32> {
        let slot = self.allocate_memory_slot();
        let gpa = region.start_addr().0;
        let size = region.len();
        self.vm
            .create_user_memory_region(
                slot,
                gpa,
                size,
                region.deref().as_ptr() as u64,
                self.private,
            )
            .map_err(Error::CreateUserMemoryRegion)?;

        info!(
            "Created userspace mapping: {:#x} -> {:#x} {:x} (slot {})",
            region.deref().as_ptr() as u64,
            gpa,
            size,
            slot
        );
        Ok(slot)
    }

    pub fn guest_memory(&self) -> GuestMemoryMmap {
        self.guest_memory.clone()
    }

    pub fn add_region(&mut self, gpa: u64, size: u64) -> Result<()> {
        let end = gpa.saturating_add(size);
        let overlaps = self
            .guest_memory
            .iter()
            .any(|r| gpa < r.start_addr().0 + r.len() && r.start_addr().0 < end);
        if size == 0 || overlaps {
            return Err(Error::Overlap(gpa, size));
        }

        let region = Self::create_ram_region(GuestAddress(gpa), size as usize)?;
        self.create_userspace_mapping(&region)?;
        self.firmware_regions.push(region);
        Ok(())
    }

    pub fn memory_slots(&self) -> u32 {
        self.next_memory_slot
    }
}

impl TdMemory for MemoryManager {
    fn ram_extents(&self) -> Vec<(u64, u64)> {
        self.guest_memory
            .iter()
            .map(|r| (r.start_addr().0, r.len()))
            .collect()
    }

    fn add_private_region(&mut self, gpa: u64, size: u64) -> result::Result<(), anyhow::Error> {
        self.add_region(gpa, size).map_err(anyhow::Error::from)
    }
}
