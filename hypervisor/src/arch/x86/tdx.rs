// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hypervisor agnostic TDX definitions.

use serde::{Deserialize, Serialize};

use crate::arch::x86::CpuIdEntry;

/// Size of the SHA384 based measurement registers and MigTD hashes.
pub const TDX_MEASUREMENT_SIZE: usize = 48;

/// Sub-leaf value of a CPUID configuration that applies to every sub-leaf.
pub const TDX_CPUID_NO_SUBLEAF: u32 = 0xffff_ffff;

/// Configurable bits of one CPUID leaf as reported by the TDX module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdxCpuidConfig {
    pub leaf: u32,
    pub sub_leaf: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl TdxCpuidConfig {
    pub fn matches(&self, leaf: u32, sub_leaf: u32) -> bool {
        self.leaf == leaf && (self.sub_leaf == TDX_CPUID_NO_SUBLEAF || self.sub_leaf == sub_leaf)
    }
}

/// Platform capabilities of the TDX module.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdxCapabilities {
    /// A zero bit must be zero in the TD attributes.
    pub attrs_fixed0: u64,
    /// A set bit must be set in the TD attributes.
    pub attrs_fixed1: u64,
    /// A zero bit must be zero in XFAM.
    pub xfam_fixed0: u64,
    /// A set bit must be set in XFAM.
    pub xfam_fixed1: u64,
    pub supported_gpaw: u32,
    pub cpuid_configs: Vec<TdxCpuidConfig>,
}

impl TdxCapabilities {
    /// Returns the configurable bits for `leaf`/`sub_leaf`. When several
    /// entries match, the last one reported wins.
    pub fn cpuid_config(&self, leaf: u32, sub_leaf: u32) -> Option<&TdxCpuidConfig> {
        self.cpuid_configs
            .iter()
            .rev()
            .find(|c| c.matches(leaf, sub_leaf))
    }

    pub fn attributes_valid(&self, attributes: u64) -> bool {
        ((attributes & self.attrs_fixed0) | self.attrs_fixed1) == attributes
    }
}

/// Everything carried by the "init VM" control command.
#[derive(Clone, Debug)]
pub struct TdxInitParams {
    pub attributes: u64,
    pub mrconfigid: [u8; TDX_MEASUREMENT_SIZE],
    pub mrowner: [u8; TDX_MEASUREMENT_SIZE],
    pub mrownerconfig: [u8; TDX_MEASUREMENT_SIZE],
    pub cpuid: Vec<CpuIdEntry>,
    /// The TD is a migration destination, its state gets imported later.
    pub post_init: bool,
}

/// How a service TD (MigTD) is identified when binding it to a TD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TdxServtdTarget {
    /// Bind a running MigTD by its process id.
    Pid(u32),
    /// Pre-bind by the MigTD's SERVTD_INFO_HASH.
    Hash([u8; TDX_MEASUREMENT_SIZE]),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TdxServtdBinding {
    pub attr: u64,
    pub target: TdxServtdTarget,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TdxMigrationInfo {
    /// MigTD finished the pre-migration session key exchange.
    pub premig_done: bool,
}

/// Register state of a TDG.VP.VMCALL exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TdxExitDetails {
    pub r#type: u64,
    pub subfunction: u64,
    pub in_r12: u64,
    pub in_r13: u64,
    pub in_r14: u64,
    pub in_r15: u64,
}

/// Kind of TD state moved by the TDX migration commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TdxMigrationState {
    TdImmutable,
    TdMutable,
    Vcpu(u32),
    EpochToken,
    PrivatePages,
}
