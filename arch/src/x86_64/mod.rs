// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
use std::arch::x86_64;

use serde::{Deserialize, Serialize};
use vm_memory::{Address, GuestAddress, GuestUsize};

use crate::RegionType;

pub mod layout;
pub mod tdx;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuidReg {
    EAX,
    EBX,
    ECX,
    EDX,
}

impl CpuidReg {
    /// Picks this register out of a CPUID result.
    pub fn get(self, regs: [u32; 4]) -> u32 {
        match self {
            CpuidReg::EAX => regs[0],
            CpuidReg::EBX => regs[1],
            CpuidReg::ECX => regs[2],
            CpuidReg::EDX => regs[3],
        }
    }
}

/// Runs CPUID on the host, returning `[eax, ebx, ecx, edx]`.
pub fn host_cpuid(leaf: u32, sub_leaf: u32) -> [u32; 4] {
    // SAFETY: CPUID is always available on x86_64.
    let r = unsafe { x86_64::__cpuid_count(leaf, sub_leaf) };
    [r.eax, r.ebx, r.ecx, r.edx]
}

pub fn get_host_cpu_phys_bits() -> u8 {
    // SAFETY: call cpuid with valid leaves
    unsafe {
        let leaf = x86_64::__cpuid(0x8000_0000);

        if leaf.eax >= 0x8000_0008 {
            let leaf = x86_64::__cpuid(0x8000_0008);
            (leaf.eax & 0xff) as u8
        } else {
            36
        }
    }
}

/// Address bit telling a shared GPA from a private one. It is the top bit
/// of the guest physical address width, which is 52 bits with 5-level EPT
/// and 48 bits otherwise.
pub fn tdx_shared_bit(phys_bits: u8) -> u64 {
    if phys_bits > 48 {
        1 << 51
    } else {
        1 << 47
    }
}

/// Returns a Vec of the valid memory addresses.
/// These should be used to configure the GuestMemory structure for the platform.
/// For x86_64 all addresses are valid from the start of the kernel except a
/// carve out at the end of 32bit address space.
pub fn arch_memory_regions(size: GuestUsize) -> Vec<(GuestAddress, usize, RegionType)> {
    let reserved_memory_gap_start = layout::MEM_32BIT_RESERVED_START
        .unchecked_add(layout::MEM_32BIT_DEVICES_SIZE);

    let mut regions = Vec::new();

    // case1: guest memory fits before the gap
    if size <= layout::MEM_32BIT_RESERVED_START.raw_value() {
        regions.push((layout::LOW_RAM_START, size as usize, RegionType::Ram));
    // case2: guest memory extends beyond the gap
    } else {
        // push memory before the gap
        regions.push((
            layout::LOW_RAM_START,
            layout::MEM_32BIT_RESERVED_START.raw_value() as usize,
            RegionType::Ram,
        ));
        regions.push((
            layout::RAM_64BIT_START,
            (size - layout::MEM_32BIT_RESERVED_START.raw_value()) as usize,
            RegionType::Ram,
        ));
    }

    // Add the 32-bit device memory hole as a sub region.
    regions.push((
        layout::MEM_32BIT_RESERVED_START,
        layout::MEM_32BIT_DEVICES_SIZE as usize,
        RegionType::SubRegion,
    ));

    // Add the 32-bit reserved memory hole as a sub region.
    regions.push((
        reserved_memory_gap_start,
        (layout::MEM_32BIT_RESERVED_SIZE - layout::MEM_32BIT_DEVICES_SIZE) as usize,
        RegionType::Reserved,
    ));

    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_lt_4gb() {
        let regions = arch_memory_regions(1 << 29);
        assert_eq!(3, regions.len());
        assert_eq!(GuestAddress(0), regions[0].0);
        assert_eq!(1usize << 29, regions[0].1);
    }

    #[test]
    fn regions_gt_4gb() {
        let regions = arch_memory_regions((1 << 32) + 0x8000);
        assert_eq!(4, regions.len());
        assert_eq!(GuestAddress(0), regions[0].0);
        assert_eq!(layout::RAM_64BIT_START, regions[1].0);
        assert_eq!(
            regions[0].1 as u64 + regions[1].1 as u64,
            (1 << 32) + 0x8000
        );
    }

    #[test]
    fn shared_bit_follows_gpaw() {
        assert_eq!(tdx_shared_bit(46), 1 << 47);
        assert_eq!(tdx_shared_bit(48), 1 << 47);
        assert_eq!(tdx_shared_bit(52), 1 << 51);
    }

    #[test]
    fn cpuid_reg_selects() {
        let regs = [1, 2, 3, 4];
        assert_eq!(CpuidReg::EAX.get(regs), 1);
        assert_eq!(CpuidReg::EDX.get(regs), 4);
    }
}
