// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! CPUID feature reconciliation for trust domains.
//!
//! The TDX module decides most CPUID bits a TD sees. Some are fixed to 0 or
//! 1, some are configurable, some depend on XFAM and some are emulated by
//! the VMM through #VE. This module computes what a TD can actually be
//! given out of what KVM and the host report.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use hypervisor::{TdxCapabilities, TDX_CPUID_NO_SUBLEAF};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::x86_64::{host_cpuid, CpuidReg};

// CPUID.01H:EDX
const CPUID_1_EDX_MSR: u32 = 1 << 5;
const CPUID_1_EDX_PAE: u32 = 1 << 6;
const CPUID_1_EDX_MCE: u32 = 1 << 7;
const CPUID_1_EDX_APIC: u32 = 1 << 9;
const CPUID_1_EDX_MTRR: u32 = 1 << 12;
const CPUID_1_EDX_MCA: u32 = 1 << 14;
const CPUID_1_EDX_CLFLUSH: u32 = 1 << 19;
const CPUID_1_EDX_DTS: u32 = 1 << 21;
const CPUID_1_EDX_ACPI: u32 = 1 << 22;
const CPUID_1_EDX_HT: u32 = 1 << 28;
const CPUID_1_EDX_IA64: u32 = 1 << 30;
const CPUID_1_EDX_PBE: u32 = 1 << 31;

// CPUID.01H:ECX
const CPUID_1_ECX_DTES64: u32 = 1 << 2;
const CPUID_1_ECX_MONITOR: u32 = 1 << 3;
const CPUID_1_ECX_DSCPL: u32 = 1 << 4;
const CPUID_1_ECX_VMX: u32 = 1 << 5;
const CPUID_1_ECX_SMX: u32 = 1 << 6;
const CPUID_1_ECX_EST: u32 = 1 << 7;
const CPUID_1_ECX_TM2: u32 = 1 << 8;
const CPUID_1_ECX_FMA: u32 = 1 << 12;
const CPUID_1_ECX_CX16: u32 = 1 << 13;
const CPUID_1_ECX_XTPR: u32 = 1 << 14;
const CPUID_1_ECX_PDCM: u32 = 1 << 15;
const CPUID_1_ECX_DCA: u32 = 1 << 18;
const CPUID_1_ECX_X2APIC: u32 = 1 << 21;
const CPUID_1_ECX_AES: u32 = 1 << 25;
const CPUID_1_ECX_XSAVE: u32 = 1 << 26;
const CPUID_1_ECX_AVX: u32 = 1 << 28;
const CPUID_1_ECX_F16C: u32 = 1 << 29;
const CPUID_1_ECX_RDRAND: u32 = 1 << 30;
const CPUID_1_ECX_HYPERVISOR: u32 = 1 << 31;

// CPUID.80000001H:EDX
const CPUID_8000_0001_EDX_NX: u32 = 1 << 20;
const CPUID_8000_0001_EDX_PDPE1GB: u32 = 1 << 26;
const CPUID_8000_0001_EDX_RDTSCP: u32 = 1 << 27;
const CPUID_8000_0001_EDX_LM: u32 = 1 << 29;

// CPUID.07H.0H:EBX
const CPUID_7_0_EBX_FSGSBASE: u32 = 1 << 0;
const CPUID_7_0_EBX_TSC_ADJUST: u32 = 1 << 1;
const CPUID_7_0_EBX_SGX: u32 = 1 << 2;
const CPUID_7_0_EBX_HLE: u32 = 1 << 4;
const CPUID_7_0_EBX_AVX2: u32 = 1 << 5;
const CPUID_7_0_EBX_RTM: u32 = 1 << 11;
const CPUID_7_0_EBX_PQM: u32 = 1 << 12;
const CPUID_7_0_EBX_MPX: u32 = 1 << 14;
const CPUID_7_0_EBX_RDT_A: u32 = 1 << 15;
const CPUID_7_0_EBX_AVX512F: u32 = 1 << 16;
const CPUID_7_0_EBX_AVX512DQ: u32 = 1 << 17;
const CPUID_7_0_EBX_RDSEED: u32 = 1 << 18;
const CPUID_7_0_EBX_SMAP: u32 = 1 << 20;
const CPUID_7_0_EBX_AVX512IFMA: u32 = 1 << 21;
const CPUID_7_0_EBX_CLFLUSHOPT: u32 = 1 << 23;
const CPUID_7_0_EBX_CLWB: u32 = 1 << 24;
const CPUID_7_0_EBX_INTEL_PT: u32 = 1 << 25;
const CPUID_7_0_EBX_AVX512PF: u32 = 1 << 26;
const CPUID_7_0_EBX_AVX512ER: u32 = 1 << 27;
const CPUID_7_0_EBX_AVX512CD: u32 = 1 << 28;
const CPUID_7_0_EBX_SHA_NI: u32 = 1 << 29;
const CPUID_7_0_EBX_AVX512BW: u32 = 1 << 30;
const CPUID_7_0_EBX_AVX512VL: u32 = 1 << 31;

// CPUID.07H.0H:ECX
const CPUID_7_0_ECX_AVX512_VBMI: u32 = 1 << 1;
const CPUID_7_0_ECX_PKU: u32 = 1 << 3;
const CPUID_7_0_ECX_AVX512_VBMI2: u32 = 1 << 6;
const CPUID_7_0_ECX_CET_SHSTK: u32 = 1 << 7;
const CPUID_7_0_ECX_VAES: u32 = 1 << 9;
const CPUID_7_0_ECX_VPCLMULQDQ: u32 = 1 << 10;
const CPUID_7_0_ECX_AVX512_VNNI: u32 = 1 << 11;
const CPUID_7_0_ECX_AVX512_BITALG: u32 = 1 << 12;
const CPUID_7_0_ECX_TME: u32 = 1 << 13;
const CPUID_7_0_ECX_AVX512_VPOPCNTDQ: u32 = 1 << 14;
const CPUID_7_0_ECX_FZM: u32 = 1 << 15;
const CPUID_7_0_ECX_MAWAU: u32 = 0x1f << 17;
const CPUID_7_0_ECX_KEYLOCKER: u32 = 1 << 23;
const CPUID_7_0_ECX_BUS_LOCK_DETECT: u32 = 1 << 24;
const CPUID_7_0_ECX_MOVDIR64B: u32 = 1 << 28;
const CPUID_7_0_ECX_ENQCMD: u32 = 1 << 29;
const CPUID_7_0_ECX_SGX_LC: u32 = 1 << 30;
pub const CPUID_7_0_ECX_PKS: u32 = 1 << 31;

// CPUID.07H.0H:EDX
const CPUID_7_0_EDX_SGX_KEYS: u32 = 1 << 1;
const CPUID_7_0_EDX_AVX512_4VNNIW: u32 = 1 << 2;
const CPUID_7_0_EDX_AVX512_4FMAPS: u32 = 1 << 3;
const CPUID_7_0_EDX_UINTR: u32 = 1 << 5;
const CPUID_7_0_EDX_AVX512_VP2INTERSECT: u32 = 1 << 8;
const CPUID_7_0_EDX_PCONFIG: u32 = 1 << 18;
const CPUID_7_0_EDX_ARCH_LBR: u32 = 1 << 19;
const CPUID_7_0_EDX_CET_IBT: u32 = 1 << 20;
const CPUID_7_0_EDX_AMX_BF16: u32 = 1 << 22;
const CPUID_7_0_EDX_AVX512_FP16: u32 = 1 << 23;
const CPUID_7_0_EDX_AMX_TILE: u32 = 1 << 24;
const CPUID_7_0_EDX_AMX_INT8: u32 = 1 << 25;
const CPUID_7_0_EDX_SPEC_CTRL: u32 = 1 << 26;
const CPUID_7_0_EDX_L1D_FLUSH: u32 = 1 << 28;
const CPUID_7_0_EDX_ARCH_CAPABILITIES: u32 = 1 << 29;
const CPUID_7_0_EDX_CORE_CAPABILITY: u32 = 1 << 30;
const CPUID_7_0_EDX_SPEC_CTRL_SSBD: u32 = 1 << 31;

// CPUID.07H.1H:EAX
const CPUID_7_1_EAX_AVX_VNNI: u32 = 1 << 4;
const CPUID_7_1_EAX_AVX512_BF16: u32 = 1 << 5;

// CPUID.80000008H:EBX
const CPUID_8000_0008_EBX_WBNOINVD: u32 = 1 << 9;

// CPUID.0DH.1H:EAX
const CPUID_XSAVE_XSAVEOPT: u32 = 1 << 0;
const CPUID_XSAVE_XSAVEC: u32 = 1 << 1;
const CPUID_XSAVE_XSAVES: u32 = 1 << 3;

// CPUID.40000001H:EAX
const KVM_FEATURE_NOP_IO_DELAY: u32 = 1 << 1;
const KVM_FEATURE_PV_UNHALT: u32 = 1 << 7;
const KVM_FEATURE_PV_TLB_FLUSH: u32 = 1 << 9;
const KVM_FEATURE_PV_SEND_IPI: u32 = 1 << 11;
const KVM_FEATURE_POLL_CONTROL: u32 = 1 << 12;
const KVM_FEATURE_PV_SCHED_YIELD: u32 = 1 << 13;
const KVM_FEATURE_MSI_EXT_DEST_ID: u32 = 1 << 15;

/// Paravirtual features a TD can use, all of them handled through #VE.
pub const TDX_SUPPORTED_KVM_FEATURES: u32 = KVM_FEATURE_NOP_IO_DELAY
    | KVM_FEATURE_PV_UNHALT
    | KVM_FEATURE_PV_TLB_FLUSH
    | KVM_FEATURE_PV_SEND_IPI
    | KVM_FEATURE_POLL_CONTROL
    | KVM_FEATURE_PV_SCHED_YIELD
    | KVM_FEATURE_MSI_EXT_DEST_ID;

// XSAVE state components
const XSTATE_YMM_BIT: u32 = 2;
const XSTATE_OPMASK_BIT: u32 = 5;
const XSTATE_ZMM_HI256_BIT: u32 = 6;
const XSTATE_HI16_ZMM_BIT: u32 = 7;
const XSTATE_RTIT_BIT: u32 = 8;
const XSTATE_PKRU_BIT: u32 = 9;
const XSTATE_CET_U_BIT: u32 = 11;
const XSTATE_CET_S_BIT: u32 = 12;
const XSTATE_UINTR_BIT: u32 = 14;
const XSTATE_ARCH_LBR_BIT: u32 = 15;
const XSTATE_XTILE_CFG_BIT: u32 = 17;
const XSTATE_XTILE_DATA_BIT: u32 = 18;

const XSTATE_YMM_MASK: u64 = 1 << XSTATE_YMM_BIT;
const XSTATE_AVX_512_MASK: u64 =
    (1 << XSTATE_OPMASK_BIT) | (1 << XSTATE_ZMM_HI256_BIT) | (1 << XSTATE_HI16_ZMM_BIT);
const XSTATE_RTIT_MASK: u64 = 1 << XSTATE_RTIT_BIT;
const XSTATE_PKRU_MASK: u64 = 1 << XSTATE_PKRU_BIT;
const XSTATE_CET_MASK: u64 = (1 << XSTATE_CET_U_BIT) | (1 << XSTATE_CET_S_BIT);
const XSTATE_UINTR_MASK: u64 = 1 << XSTATE_UINTR_BIT;
const XSTATE_ARCH_LBR_MASK: u64 = 1 << XSTATE_ARCH_LBR_BIT;
const XSTATE_AMX_MASK: u64 = (1 << XSTATE_XTILE_CFG_BIT) | (1 << XSTATE_XTILE_DATA_BIT);

/// XFAM bits living in XCR0.
pub const XSTATE_XCR0_MASK: u64 = 0x602ff;
/// XFAM bits living in IA32_XSS.
pub const XSTATE_XSS_MASK: u64 = XSTATE_RTIT_MASK
    | XSTATE_CET_MASK
    | XSTATE_UINTR_MASK
    | XSTATE_ARCH_LBR_MASK;

/// TD attribute bits.
pub const TDX_TD_ATTRIBUTES_DEBUG: u64 = 1 << 0;
pub const TDX_TD_ATTRIBUTES_SEPT_VE_DISABLE: u64 = 1 << 28;
pub const TDX_TD_ATTRIBUTES_MIG: u64 = 1 << 29;
pub const TDX_TD_ATTRIBUTES_PKS: u64 = 1 << 30;
pub const TDX_TD_ATTRIBUTES_KL: u64 = 1 << 31;
pub const TDX_TD_ATTRIBUTES_PERFMON: u64 = 1 << 63;

/// Accepted TSC frequency range, in kHz.
pub const TDX_MIN_TSC_FREQUENCY_KHZ: u32 = 100_000;
pub const TDX_MAX_TSC_FREQUENCY_KHZ: u32 = 10_000_000;
/// The TSC frequency is programmed in units of 25 MHz.
pub const TDX_TSC_FREQUENCY_GRANULARITY_KHZ: u32 = 25_000;

/// A 32-bit CPUID register value the reconciler knows about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureWord {
    Leaf1Edx,
    Leaf1Ecx,
    Leaf7_0Ebx,
    Leaf7_0Ecx,
    Leaf7_0Edx,
    Leaf7_1Eax,
    Leaf8000_0001Edx,
    Leaf8000_0007Edx,
    Leaf8000_0008Ebx,
    Leaf6Eax,
    Xsave,
    Kvm,
    Sgx12_0Eax,
    Sgx12_0Ebx,
    Sgx12_1Eax,
    Leaf14_0Ecx,
    Xcr0Lo,
    Xcr0Hi,
    XssLo,
    XssHi,
}

pub const FEATURE_WORDS: usize = 20;

impl FeatureWord {
    pub const ALL: [FeatureWord; FEATURE_WORDS] = [
        FeatureWord::Leaf1Edx,
        FeatureWord::Leaf1Ecx,
        FeatureWord::Leaf7_0Ebx,
        FeatureWord::Leaf7_0Ecx,
        FeatureWord::Leaf7_0Edx,
        FeatureWord::Leaf7_1Eax,
        FeatureWord::Leaf8000_0001Edx,
        FeatureWord::Leaf8000_0007Edx,
        FeatureWord::Leaf8000_0008Ebx,
        FeatureWord::Leaf6Eax,
        FeatureWord::Xsave,
        FeatureWord::Kvm,
        FeatureWord::Sgx12_0Eax,
        FeatureWord::Sgx12_0Ebx,
        FeatureWord::Sgx12_1Eax,
        FeatureWord::Leaf14_0Ecx,
        FeatureWord::Xcr0Lo,
        FeatureWord::Xcr0Hi,
        FeatureWord::XssLo,
        FeatureWord::XssHi,
    ];

    /// Leaf, sub-leaf (`None` when the leaf has no sub-leaves) and register.
    pub fn cpuid(self) -> (u32, Option<u32>, CpuidReg) {
        use CpuidReg::*;
        match self {
            FeatureWord::Leaf1Edx => (0x1, None, EDX),
            FeatureWord::Leaf1Ecx => (0x1, None, ECX),
            FeatureWord::Leaf7_0Ebx => (0x7, Some(0), EBX),
            FeatureWord::Leaf7_0Ecx => (0x7, Some(0), ECX),
            FeatureWord::Leaf7_0Edx => (0x7, Some(0), EDX),
            FeatureWord::Leaf7_1Eax => (0x7, Some(1), EAX),
            FeatureWord::Leaf8000_0001Edx => (0x8000_0001, None, EDX),
            FeatureWord::Leaf8000_0007Edx => (0x8000_0007, None, EDX),
            FeatureWord::Leaf8000_0008Ebx => (0x8000_0008, None, EBX),
            FeatureWord::Leaf6Eax => (0x6, None, EAX),
            FeatureWord::Xsave => (0xd, Some(1), EAX),
            FeatureWord::Kvm => (0x4000_0001, None, EAX),
            FeatureWord::Sgx12_0Eax => (0x12, Some(0), EAX),
            FeatureWord::Sgx12_0Ebx => (0x12, Some(0), EBX),
            FeatureWord::Sgx12_1Eax => (0x12, Some(1), EAX),
            FeatureWord::Leaf14_0Ecx => (0x14, Some(0), ECX),
            FeatureWord::Xcr0Lo => (0xd, Some(0), EAX),
            FeatureWord::Xcr0Hi => (0xd, Some(0), EDX),
            FeatureWord::XssLo => (0xd, Some(1), ECX),
            FeatureWord::XssHi => (0xd, Some(1), EDX),
        }
    }

    pub fn from_cpuid(leaf: u32, sub_leaf: u32, reg: CpuidReg) -> Option<FeatureWord> {
        FeatureWord::ALL.into_iter().find(|w| {
            let (l, s, r) = w.cpuid();
            l == leaf && r == reg && s.is_none_or(|s| s == sub_leaf)
        })
    }

    /// Short name used in feature lists, e.g. `7_0_ecx`.
    pub fn name(self) -> &'static str {
        match self {
            FeatureWord::Leaf1Edx => "1_edx",
            FeatureWord::Leaf1Ecx => "1_ecx",
            FeatureWord::Leaf7_0Ebx => "7_0_ebx",
            FeatureWord::Leaf7_0Ecx => "7_0_ecx",
            FeatureWord::Leaf7_0Edx => "7_0_edx",
            FeatureWord::Leaf7_1Eax => "7_1_eax",
            FeatureWord::Leaf8000_0001Edx => "80000001_edx",
            FeatureWord::Leaf8000_0007Edx => "80000007_edx",
            FeatureWord::Leaf8000_0008Ebx => "80000008_ebx",
            FeatureWord::Leaf6Eax => "6_eax",
            FeatureWord::Xsave => "d_1_eax",
            FeatureWord::Kvm => "kvm",
            FeatureWord::Sgx12_0Eax => "12_0_eax",
            FeatureWord::Sgx12_0Ebx => "12_0_ebx",
            FeatureWord::Sgx12_1Eax => "12_1_eax",
            FeatureWord::Leaf14_0Ecx => "14_0_ecx",
            FeatureWord::Xcr0Lo => "xcr0_lo",
            FeatureWord::Xcr0Hi => "xcr0_hi",
            FeatureWord::XssLo => "xss_lo",
            FeatureWord::XssHi => "xss_hi",
        }
    }
}

impl fmt::Display for FeatureWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (leaf, sub_leaf, reg) = self.cpuid();
        match sub_leaf {
            Some(s) => write!(f, "CPUID.{leaf:02X}H_{s:X}H:{reg:?}"),
            None => write!(f, "CPUID.{leaf:02X}H:{reg:?}"),
        }
    }
}

/// One value per feature word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureWords(pub [u32; FEATURE_WORDS]);

impl Index<FeatureWord> for FeatureWords {
    type Output = u32;

    fn index(&self, word: FeatureWord) -> &u32 {
        &self.0[word as usize]
    }
}

impl IndexMut<FeatureWord> for FeatureWords {
    fn index_mut(&mut self, word: FeatureWord) -> &mut u32 {
        &mut self.0[word as usize]
    }
}

#[derive(Clone, Copy, Debug)]
struct FeatureMask {
    word: FeatureWord,
    mask: u32,
}

const fn fm(word: FeatureWord, mask: u32) -> FeatureMask {
    FeatureMask { word, mask }
}

#[derive(Clone, Copy, Debug)]
struct FeatureDep {
    from: FeatureMask,
    to: FeatureMask,
}

const fn dep(from: FeatureMask, to: FeatureMask) -> FeatureDep {
    FeatureDep { from, to }
}

// Features whose availability follows an XFAM state component.
const XFAM_DEPENDENCIES: &[FeatureDep] = &[
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_YMM_MASK as u32),
        fm(FeatureWord::Xcr0Lo, XSTATE_AVX_512_MASK as u32),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_YMM_MASK as u32),
        fm(
            FeatureWord::Leaf1Ecx,
            CPUID_1_ECX_FMA | CPUID_1_ECX_AVX | CPUID_1_ECX_F16C,
        ),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_YMM_MASK as u32),
        fm(FeatureWord::Leaf7_0Ebx, CPUID_7_0_EBX_AVX2),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_YMM_MASK as u32),
        fm(
            FeatureWord::Leaf7_0Ecx,
            CPUID_7_0_ECX_VAES | CPUID_7_0_ECX_VPCLMULQDQ,
        ),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_AVX_512_MASK as u32),
        fm(
            FeatureWord::Leaf7_0Ebx,
            CPUID_7_0_EBX_AVX512F
                | CPUID_7_0_EBX_AVX512DQ
                | CPUID_7_0_EBX_AVX512IFMA
                | CPUID_7_0_EBX_AVX512PF
                | CPUID_7_0_EBX_AVX512ER
                | CPUID_7_0_EBX_AVX512CD
                | CPUID_7_0_EBX_AVX512BW
                | CPUID_7_0_EBX_AVX512VL,
        ),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_AVX_512_MASK as u32),
        fm(
            FeatureWord::Leaf7_0Ecx,
            CPUID_7_0_ECX_AVX512_VBMI
                | CPUID_7_0_ECX_AVX512_VBMI2
                | CPUID_7_0_ECX_AVX512_VNNI
                | CPUID_7_0_ECX_AVX512_BITALG
                | CPUID_7_0_ECX_AVX512_VPOPCNTDQ,
        ),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_AVX_512_MASK as u32),
        fm(
            FeatureWord::Leaf7_0Edx,
            CPUID_7_0_EDX_AVX512_4VNNIW
                | CPUID_7_0_EDX_AVX512_4FMAPS
                | CPUID_7_0_EDX_AVX512_VP2INTERSECT
                | CPUID_7_0_EDX_AVX512_FP16,
        ),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_AVX_512_MASK as u32),
        fm(
            FeatureWord::Leaf7_1Eax,
            CPUID_7_1_EAX_AVX512_BF16 | CPUID_7_1_EAX_AVX_VNNI,
        ),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_PKRU_MASK as u32),
        fm(FeatureWord::Leaf7_0Ecx, CPUID_7_0_ECX_PKU),
    ),
    dep(
        fm(FeatureWord::Xcr0Lo, XSTATE_AMX_MASK as u32),
        fm(
            FeatureWord::Leaf7_0Edx,
            CPUID_7_0_EDX_AMX_BF16 | CPUID_7_0_EDX_AMX_TILE | CPUID_7_0_EDX_AMX_INT8,
        ),
    ),
    dep(
        fm(FeatureWord::XssLo, XSTATE_RTIT_MASK as u32),
        fm(FeatureWord::Leaf7_0Ebx, CPUID_7_0_EBX_INTEL_PT),
    ),
    dep(
        fm(FeatureWord::XssLo, XSTATE_RTIT_MASK as u32),
        fm(FeatureWord::Leaf14_0Ecx, !0),
    ),
    dep(
        fm(FeatureWord::XssLo, XSTATE_CET_MASK as u32),
        fm(FeatureWord::Leaf7_0Ecx, CPUID_7_0_ECX_CET_SHSTK),
    ),
    dep(
        fm(FeatureWord::XssLo, XSTATE_CET_MASK as u32),
        fm(FeatureWord::Leaf7_0Edx, CPUID_7_0_EDX_CET_IBT),
    ),
    dep(
        fm(FeatureWord::XssLo, XSTATE_UINTR_MASK as u32),
        fm(FeatureWord::Leaf7_0Edx, CPUID_7_0_EDX_UINTR),
    ),
    dep(
        fm(FeatureWord::XssLo, XSTATE_ARCH_LBR_MASK as u32),
        fm(FeatureWord::Leaf7_0Edx, CPUID_7_0_EDX_ARCH_LBR),
    ),
];

#[derive(Clone, Copy, Debug)]
struct XfamRepresentative {
    feature: FeatureMask,
    name: &'static str,
}

const fn rep(word: FeatureWord, mask: u32, name: &'static str) -> Option<XfamRepresentative> {
    Some(XfamRepresentative {
        feature: fm(word, mask),
        name,
    })
}

// The CPUID feature standing for each XSAVE state component, indexed by
// component number. Enabling the representative enables the component.
const XFAM_REPRESENTATIVES: [Option<XfamRepresentative>; 19] = [
    None,
    None,
    rep(FeatureWord::Leaf1Ecx, CPUID_1_ECX_AVX, "avx"),
    None,
    None,
    rep(FeatureWord::Leaf7_0Ebx, CPUID_7_0_EBX_AVX512F, "avx512f"),
    rep(FeatureWord::Leaf7_0Ebx, CPUID_7_0_EBX_AVX512F, "avx512f"),
    rep(FeatureWord::Leaf7_0Ebx, CPUID_7_0_EBX_AVX512F, "avx512f"),
    rep(FeatureWord::Leaf7_0Ebx, CPUID_7_0_EBX_INTEL_PT, "intel-pt"),
    rep(FeatureWord::Leaf7_0Ecx, CPUID_7_0_ECX_PKU, "pku"),
    None,
    rep(FeatureWord::Leaf7_0Ecx, CPUID_7_0_ECX_CET_SHSTK, "cet-ss"),
    rep(FeatureWord::Leaf7_0Ecx, CPUID_7_0_ECX_CET_SHSTK, "cet-ss"),
    None,
    None,
    rep(FeatureWord::Leaf7_0Edx, CPUID_7_0_EDX_ARCH_LBR, "arch-lbr"),
    None,
    rep(FeatureWord::Leaf7_0Edx, CPUID_7_0_EDX_AMX_TILE, "amx-tile"),
    rep(FeatureWord::Leaf7_0Edx, CPUID_7_0_EDX_AMX_TILE, "amx-tile"),
];

// CPUID bits following TD attribute bits, indexed by attribute bit.
const ATTRIBUTE_CONTROLLED: &[(u32, FeatureMask)] = &[
    (30, fm(FeatureWord::Leaf7_0Ecx, CPUID_7_0_ECX_PKS)),
    (31, fm(FeatureWord::Leaf7_0Ecx, CPUID_7_0_ECX_KEYLOCKER)),
];

/// How the TDX module treats the bits of one feature word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TdxCpuidLookup {
    /// Always 0 in a TD.
    pub fixed0: u32,
    /// Always 1 in a TD.
    pub fixed1: u32,
    /// Only available when the VMM can emulate them.
    pub vmm_fixup: u32,
    /// The whole word is emulated by the VMM through #VE.
    pub inducing_ve: bool,
    /// What the VMM may report for an `inducing_ve` word.
    pub supported_on_ve: u32,
    /// Bits the TDX module lets the VMM configure.
    pub configurable: u32,
}

fn base_lookup(word: FeatureWord) -> TdxCpuidLookup {
    let (fixed0, fixed1, vmm_fixup) = match word {
        FeatureWord::Leaf1Edx => (
            (1 << 10) | (1 << 20) | CPUID_1_EDX_IA64,
            CPUID_1_EDX_MSR
                | CPUID_1_EDX_PAE
                | CPUID_1_EDX_MCE
                | CPUID_1_EDX_APIC
                | CPUID_1_EDX_MTRR
                | CPUID_1_EDX_MCA
                | CPUID_1_EDX_CLFLUSH
                | CPUID_1_EDX_DTS,
            CPUID_1_EDX_ACPI | CPUID_1_EDX_PBE,
        ),
        FeatureWord::Leaf1Ecx => (
            CPUID_1_ECX_VMX | CPUID_1_ECX_SMX | (1 << 16),
            CPUID_1_ECX_DTES64
                | CPUID_1_ECX_DSCPL
                | CPUID_1_ECX_CX16
                | CPUID_1_ECX_PDCM
                | CPUID_1_ECX_X2APIC
                | CPUID_1_ECX_AES
                | CPUID_1_ECX_XSAVE
                | CPUID_1_ECX_RDRAND
                | CPUID_1_ECX_HYPERVISOR
                | CPUID_1_ECX_MONITOR,
            CPUID_1_ECX_EST | CPUID_1_ECX_TM2 | CPUID_1_ECX_XTPR | CPUID_1_ECX_DCA,
        ),
        FeatureWord::Leaf8000_0001Edx => (
            0,
            CPUID_8000_0001_EDX_NX
                | CPUID_8000_0001_EDX_PDPE1GB
                | CPUID_8000_0001_EDX_RDTSCP
                | CPUID_8000_0001_EDX_LM,
            0,
        ),
        FeatureWord::Leaf7_0Ebx => (
            CPUID_7_0_EBX_TSC_ADJUST | CPUID_7_0_EBX_SGX | CPUID_7_0_EBX_MPX,
            CPUID_7_0_EBX_FSGSBASE
                | CPUID_7_0_EBX_RTM
                | CPUID_7_0_EBX_RDSEED
                | CPUID_7_0_EBX_SMAP
                | CPUID_7_0_EBX_CLFLUSHOPT
                | CPUID_7_0_EBX_CLWB
                | CPUID_7_0_EBX_SHA_NI
                | CPUID_7_0_EBX_HLE,
            CPUID_7_0_EBX_PQM | CPUID_7_0_EBX_RDT_A,
        ),
        FeatureWord::Leaf7_0Ecx => (
            CPUID_7_0_ECX_FZM | CPUID_7_0_ECX_MAWAU | CPUID_7_0_ECX_ENQCMD | CPUID_7_0_ECX_SGX_LC,
            CPUID_7_0_ECX_MOVDIR64B | CPUID_7_0_ECX_BUS_LOCK_DETECT,
            CPUID_7_0_ECX_TME,
        ),
        FeatureWord::Leaf7_0Edx => (
            CPUID_7_0_EDX_SGX_KEYS,
            CPUID_7_0_EDX_SPEC_CTRL
                | CPUID_7_0_EDX_L1D_FLUSH
                | CPUID_7_0_EDX_ARCH_CAPABILITIES
                | CPUID_7_0_EDX_CORE_CAPABILITY
                | CPUID_7_0_EDX_SPEC_CTRL_SSBD,
            CPUID_7_0_EDX_PCONFIG,
        ),
        FeatureWord::Leaf8000_0008Ebx => (
            !CPUID_8000_0008_EBX_WBNOINVD,
            CPUID_8000_0008_EBX_WBNOINVD,
            0,
        ),
        FeatureWord::Xsave => (
            0,
            CPUID_XSAVE_XSAVEOPT | CPUID_XSAVE_XSAVEC | CPUID_XSAVE_XSAVES,
            0,
        ),
        FeatureWord::Leaf6Eax | FeatureWord::Leaf8000_0007Edx => {
            return TdxCpuidLookup {
                inducing_ve: true,
                supported_on_ve: !0,
                ..Default::default()
            }
        }
        FeatureWord::Kvm => {
            return TdxCpuidLookup {
                inducing_ve: true,
                supported_on_ve: TDX_SUPPORTED_KVM_FEATURES,
                ..Default::default()
            }
        }
        FeatureWord::Sgx12_0Eax | FeatureWord::Sgx12_0Ebx | FeatureWord::Sgx12_1Eax => (!0, 0, 0),
        FeatureWord::Leaf7_1Eax
        | FeatureWord::Leaf14_0Ecx
        | FeatureWord::Xcr0Lo
        | FeatureWord::Xcr0Hi
        | FeatureWord::XssLo
        | FeatureWord::XssHi => (0, 0, 0),
    };

    TdxCpuidLookup {
        fixed0,
        fixed1,
        vmm_fixup,
        ..Default::default()
    }
}

/// Host properties that bend the reconciled feature set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TdxCpuidQuirks {
    /// The host CPU has a broken TSX implementation. RTM and HLE are hidden.
    pub host_tsx_broken: bool,
    /// The guest owns power management. MONITOR/MWAIT stay visible.
    pub cpu_pm: bool,
}

pub struct TdxFeatureReconciler {
    lookup: [TdxCpuidLookup; FEATURE_WORDS],
    quirks: TdxCpuidQuirks,
}

impl TdxFeatureReconciler {
    pub fn new(quirks: TdxCpuidQuirks) -> Self {
        TdxFeatureReconciler {
            lookup: FeatureWord::ALL.map(base_lookup),
            quirks,
        }
    }

    pub fn lookup(&self, word: FeatureWord) -> &TdxCpuidLookup {
        &self.lookup[word as usize]
    }

    fn lookup_mut(&mut self, word: FeatureWord) -> &mut TdxCpuidLookup {
        &mut self.lookup[word as usize]
    }

    /// Folds what the TDX module reports into the lookup table. Configurable
    /// bits stop being fixed. Attribute and XFAM fixed bits become fixed
    /// CPUID bits.
    pub fn merge_capabilities(&mut self, caps: &TdxCapabilities) {
        for word in FeatureWord::ALL {
            let (leaf, sub_leaf, reg) = word.cpuid();
            let config = caps
                .cpuid_config(leaf, sub_leaf.unwrap_or(TDX_CPUID_NO_SUBLEAF))
                .map(|c| reg.get([c.eax, c.ebx, c.ecx, c.edx]))
                .unwrap_or(0);

            let entry = self.lookup_mut(word);
            entry.fixed0 &= !config;
            entry.fixed1 &= !config;
            entry.configurable = config;
        }

        for (bit, feature) in ATTRIBUTE_CONTROLLED {
            if caps.attrs_fixed0 & (1 << bit) != 0 {
                self.lookup_mut(feature.word).fixed0 |= feature.mask;
            }
            if caps.attrs_fixed1 & (1 << bit) != 0 {
                self.lookup_mut(feature.word).fixed1 |= feature.mask;
            }
        }

        for (lo, hi, mask) in [
            (FeatureWord::Xcr0Lo, FeatureWord::Xcr0Hi, XSTATE_XCR0_MASK),
            (FeatureWord::XssLo, FeatureWord::XssHi, XSTATE_XSS_MASK),
        ] {
            let fixed0 = !caps.xfam_fixed0 & mask;
            let fixed1 = caps.xfam_fixed1 & mask;
            let entry = self.lookup_mut(lo);
            entry.fixed0 = fixed0 as u32;
            entry.fixed1 = fixed1 as u32;
            let entry = self.lookup_mut(hi);
            entry.fixed0 = (fixed0 >> 32) as u32;
            entry.fixed1 = (fixed1 >> 32) as u32;
        }
    }

    /// Adjusts what KVM reports for a CPUID register (`vmm_cap`) to what a TD
    /// can actually get. Registers the reconciler does not know are
    /// returned as is.
    pub fn supported_cpuid(&self, leaf: u32, sub_leaf: u32, reg: CpuidReg, vmm_cap: u32) -> u32 {
        match FeatureWord::from_cpuid(leaf, sub_leaf, reg) {
            Some(word) => self.supported_word(word, vmm_cap, reg.get(host_cpuid(leaf, sub_leaf))),
            None => vmm_cap,
        }
    }

    /// Same as `supported_cpuid`, with the host value given.
    pub fn supported_word(&self, word: FeatureWord, vmm_cap: u32, native: u32) -> u32 {
        let entry = self.lookup(word);
        if entry.inducing_ve {
            return vmm_cap & entry.supported_on_ve;
        }

        // Native bits first. Unsupported ones are masked by fixed0 below.
        let mut ret = vmm_cap | native;
        ret |= entry.fixed1;
        ret &= !entry.fixed0;
        ret |= entry.configurable;
        ret &= !(!vmm_cap & entry.vmm_fixup);

        match word {
            FeatureWord::Leaf7_0Ebx if self.quirks.host_tsx_broken => {
                ret &= !(CPUID_7_0_EBX_RTM | CPUID_7_0_EBX_HLE);
            }
            FeatureWord::Leaf1Ecx if !self.quirks.cpu_pm => ret &= !CPUID_1_ECX_MONITOR,
            // Follows the vCPU topology, computed elsewhere.
            FeatureWord::Leaf1Edx => ret &= !CPUID_1_EDX_HT,
            _ => {}
        }

        ret
    }

    fn representatives(word: FeatureWord) -> u32 {
        XFAM_REPRESENTATIVES
            .iter()
            .flatten()
            .filter(|r| r.feature.word == word)
            .fold(0, |acc, r| acc | r.feature.mask)
    }

    fn xfam_controller(word: FeatureWord, bit: u32) -> Option<u32> {
        XFAM_DEPENDENCIES
            .iter()
            .find(|d| d.to.word == word && d.to.mask & bit != 0)
            .map(|d| d.from.mask)
    }

    fn representative_name(xfam_mask: u32) -> &'static str {
        XFAM_REPRESENTATIVES
            .get(xfam_mask.trailing_zeros() as usize)
            .copied()
            .flatten()
            .map(|r| r.name)
            .unwrap_or("unknown")
    }

    /// Bits of `word` the user is not allowed to remove.
    pub fn disallow_minus_bits(&self, word: FeatureWord) -> u32 {
        let entry = self.lookup(word);
        // Fully emulated, so anything can go.
        if entry.inducing_ve {
            return 0;
        }

        let dependents = XFAM_DEPENDENCIES
            .iter()
            .filter(|d| d.to.word == word)
            .fold(0, |acc, d| acc | d.to.mask);

        (entry.fixed1 | dependents) & !Self::representatives(word)
    }

    /// Puts back user removed bits that cannot be removed. Bits following an
    /// XFAM representative are left alone, the representative decides.
    /// Returns the warnings issued.
    pub fn check_minus_features(
        &self,
        features: &mut FeatureWords,
        user_minus: &FeatureWords,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        for word in FeatureWord::ALL {
            let disallowed = user_minus[word] & self.disallow_minus_bits(word);
            for i in 0..32 {
                let bit = 1u32 << i;
                if disallowed & bit == 0 {
                    continue;
                }

                let reason = match Self::xfam_controller(word, bit) {
                    Some(xfam) if Self::representatives(word) & bit == 0 => format!(
                        "it depends on XFAM representative feature ({})",
                        Self::representative_name(xfam)
                    ),
                    _ => {
                        features[word] |= bit;
                        "TDX limitation".to_string()
                    }
                };

                let warning =
                    format!("This feature cannot be removed because {reason}: {word} [bit {i}]");
                warn!("{}", warning);
                warnings.push(warning);
            }
        }

        warnings
    }

    /// Clears features whose XFAM controlling bits are off. Only clearing a
    /// feature the user asked for is worth a warning.
    pub fn apply_xfam_dependencies(
        &self,
        features: &mut FeatureWords,
        user_plus: &FeatureWords,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        for d in XFAM_DEPENDENCIES {
            if features[d.from.word] & d.from.mask != 0 {
                continue;
            }

            let unavailable = features[d.to.word] & d.to.mask;
            let requested = unavailable & user_plus[d.to.word];
            if requested != 0 {
                let warning = format!(
                    "This feature cannot be enabled because its XFAM controlling bit is not enabled: {} [mask {:#x}]",
                    d.to.word, requested
                );
                warn!("{}", warning);
                warnings.push(warning);
            }
            features[d.to.word] &= !unavailable;
        }

        warnings
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeatureListError {
    #[error("Feature must start with '+' or '-': {0}")]
    MissingSign(String),
    #[error("Unknown feature: {0}")]
    UnknownFeature(String),
}

/// User requested feature changes, `+avx512f,-pku,-7_0_ecx.3`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureAdjustments {
    pub plus: FeatureWords,
    pub minus: FeatureWords,
}

fn parse_feature(name: &str) -> Option<(FeatureWord, u32)> {
    if let Some(r) = XFAM_REPRESENTATIVES
        .iter()
        .flatten()
        .find(|r| r.name == name)
    {
        return Some((r.feature.word, r.feature.mask));
    }

    let (word, bit) = name.split_once('.')?;
    let word = FeatureWord::ALL.into_iter().find(|w| w.name() == word)?;
    let bit: u32 = bit.parse().ok()?;
    (bit < 32).then(|| (word, 1 << bit))
}

impl FromStr for FeatureAdjustments {
    type Err = FeatureListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut adjustments = FeatureAdjustments::default();
        for item in s.split(',').filter(|i| !i.is_empty()) {
            let (target, name) = match item.split_at_checked(1) {
                Some(("+", name)) => (&mut adjustments.plus, name),
                Some(("-", name)) => (&mut adjustments.minus, name),
                _ => return Err(FeatureListError::MissingSign(item.to_string())),
            };
            let (word, mask) = parse_feature(name)
                .ok_or_else(|| FeatureListError::UnknownFeature(name.to_string()))?;
            target[word] |= mask;
        }
        Ok(adjustments)
    }
}

impl fmt::Display for FeatureAdjustments {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut sep = "";
        for (sign, words) in [('+', &self.plus), ('-', &self.minus)] {
            for word in FeatureWord::ALL {
                let mut bits = words[word];
                while bits != 0 {
                    let bit = bits.trailing_zeros();
                    bits &= bits - 1;
                    write!(f, "{sep}{sign}{}.{bit}", word.name())?;
                    sep = ",";
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hypervisor::TdxCpuidConfig;
    use proptest::prelude::*;

    use super::*;

    fn no_quirks() -> TdxCpuidQuirks {
        TdxCpuidQuirks {
            host_tsx_broken: false,
            cpu_pm: true,
        }
    }

    #[test]
    fn feature_word_cpuid_mapping() {
        for word in FeatureWord::ALL {
            let (leaf, sub_leaf, reg) = word.cpuid();
            assert_eq!(
                FeatureWord::from_cpuid(leaf, sub_leaf.unwrap_or(0), reg),
                Some(word)
            );
        }
        assert_eq!(
            FeatureWord::from_cpuid(1, 5, CpuidReg::ECX),
            Some(FeatureWord::Leaf1Ecx)
        );
        assert_eq!(FeatureWord::from_cpuid(7, 2, CpuidReg::EBX), None);
        assert_eq!(FeatureWord::Leaf7_0Ecx.to_string(), "CPUID.07H_0H:ECX");
    }

    #[test]
    fn induced_words_are_masked() {
        let r = TdxFeatureReconciler::new(no_quirks());
        assert_eq!(
            r.supported_word(FeatureWord::Kvm, !0, 0),
            TDX_SUPPORTED_KVM_FEATURES
        );
        assert_eq!(r.supported_word(FeatureWord::Leaf6Eax, 0x1234, !0), 0x1234);
        assert_eq!(r.disallow_minus_bits(FeatureWord::Kvm), 0);
    }

    #[test]
    fn fixed_and_fixup_bits() {
        let r = TdxFeatureReconciler::new(no_quirks());
        let word = FeatureWord::Leaf7_0Ebx;
        let ret = r.supported_word(word, 0, CPUID_7_0_EBX_SGX | CPUID_7_0_EBX_PQM);
        assert_eq!(ret & CPUID_7_0_EBX_SGX, 0);
        // PQM needs emulation KVM did not report.
        assert_eq!(ret & CPUID_7_0_EBX_PQM, 0);
        assert_eq!(ret & CPUID_7_0_EBX_RTM, CPUID_7_0_EBX_RTM);

        let ret = r.supported_word(word, CPUID_7_0_EBX_PQM, 0);
        assert_eq!(ret & CPUID_7_0_EBX_PQM, CPUID_7_0_EBX_PQM);
    }

    #[test]
    fn tsx_broken_quirk() {
        let tsx = CPUID_7_0_EBX_RTM | CPUID_7_0_EBX_HLE;
        let word = FeatureWord::Leaf7_0Ebx;

        let r = TdxFeatureReconciler::new(TdxCpuidQuirks {
            host_tsx_broken: false,
            cpu_pm: true,
        });
        assert_eq!(r.supported_word(word, tsx, tsx) & tsx, tsx);

        let r = TdxFeatureReconciler::new(TdxCpuidQuirks {
            host_tsx_broken: true,
            cpu_pm: true,
        });
        let ret = r.supported_word(word, !0, !0);
        assert_eq!(ret & tsx, 0);
        // Other bits of the word are left alone.
        let unquirked = TdxFeatureReconciler::new(no_quirks()).supported_word(word, !0, !0);
        assert_eq!(ret, unquirked & !tsx);
    }

    #[test]
    fn cpu_pm_quirk() {
        let word = FeatureWord::Leaf1Ecx;
        // MONITOR is a must-be-one bit, only the quirk takes it out.
        assert_ne!(
            TdxFeatureReconciler::new(no_quirks()).lookup(word).fixed1 & CPUID_1_ECX_MONITOR,
            0
        );

        let r = TdxFeatureReconciler::new(TdxCpuidQuirks {
            host_tsx_broken: false,
            cpu_pm: true,
        });
        assert_eq!(r.supported_word(word, 0, 0) & CPUID_1_ECX_MONITOR, CPUID_1_ECX_MONITOR);

        let r = TdxFeatureReconciler::new(TdxCpuidQuirks {
            host_tsx_broken: false,
            cpu_pm: false,
        });
        assert_eq!(r.supported_word(word, !0, !0) & CPUID_1_ECX_MONITOR, 0);
    }

    #[test]
    fn ht_is_always_cleared() {
        for r in [
            TdxFeatureReconciler::new(no_quirks()),
            TdxFeatureReconciler::new(TdxCpuidQuirks {
                host_tsx_broken: true,
                cpu_pm: false,
            }),
        ] {
            let edx = r.supported_word(FeatureWord::Leaf1Edx, !0, !0);
            assert_eq!(edx & CPUID_1_EDX_HT, 0);
        }
    }

    #[test]
    fn merge_capabilities_updates_lookup() {
        let mut r = TdxFeatureReconciler::new(no_quirks());
        let caps = TdxCapabilities {
            attrs_fixed0: TDX_TD_ATTRIBUTES_PKS,
            attrs_fixed1: TDX_TD_ATTRIBUTES_KL,
            xfam_fixed0: XSTATE_YMM_MASK | 0x3,
            xfam_fixed1: 0x3,
            cpuid_configs: vec![TdxCpuidConfig {
                leaf: 7,
                sub_leaf: 0,
                ebx: CPUID_7_0_EBX_RTM,
                ..Default::default()
            }],
            ..Default::default()
        };
        r.merge_capabilities(&caps);

        let ebx = r.lookup(FeatureWord::Leaf7_0Ebx);
        assert_eq!(ebx.fixed1 & CPUID_7_0_EBX_RTM, 0);
        assert_eq!(ebx.configurable, CPUID_7_0_EBX_RTM);

        let ecx = r.lookup(FeatureWord::Leaf7_0Ecx);
        assert_ne!(ecx.fixed0 & CPUID_7_0_ECX_PKS, 0);
        assert_ne!(ecx.fixed1 & CPUID_7_0_ECX_KEYLOCKER, 0);

        let xcr0 = r.lookup(FeatureWord::Xcr0Lo);
        assert_eq!(xcr0.fixed1, 0x3);
        assert_eq!(xcr0.fixed0, (XSTATE_XCR0_MASK as u32) & !(0x7));
        assert_eq!(r.lookup(FeatureWord::Xcr0Hi).fixed0, 0);
    }

    #[test]
    fn minus_features() {
        let r = TdxFeatureReconciler::new(no_quirks());
        let mut features = FeatureWords::default();
        let mut minus = FeatureWords::default();
        minus[FeatureWord::Leaf7_0Ebx] = CPUID_7_0_EBX_RTM | CPUID_7_0_EBX_AVX2;
        // Representatives can be removed.
        minus[FeatureWord::Leaf1Ecx] = CPUID_1_ECX_AVX;

        let warnings = r.check_minus_features(&mut features, &minus);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("representative feature (avx)"));
        assert!(warnings[1].contains("TDX limitation"));
        assert_eq!(features[FeatureWord::Leaf7_0Ebx], CPUID_7_0_EBX_RTM);
        assert_eq!(features[FeatureWord::Leaf1Ecx], 0);
    }

    #[test]
    fn xfam_dependencies() {
        let r = TdxFeatureReconciler::new(no_quirks());
        let mut features = FeatureWords::default();
        features[FeatureWord::Leaf7_0Ebx] = CPUID_7_0_EBX_AVX2 | CPUID_7_0_EBX_AVX512F;
        features[FeatureWord::Leaf7_0Ecx] = CPUID_7_0_ECX_PKU;
        features[FeatureWord::Xcr0Lo] = (XSTATE_YMM_MASK | XSTATE_PKRU_MASK) as u32;
        let mut plus = FeatureWords::default();
        plus[FeatureWord::Leaf7_0Ebx] = CPUID_7_0_EBX_AVX512F;

        let warnings = r.apply_xfam_dependencies(&mut features, &plus);
        assert_eq!(warnings.len(), 1);
        assert_eq!(features[FeatureWord::Leaf7_0Ebx], CPUID_7_0_EBX_AVX2);
        assert_eq!(features[FeatureWord::Leaf7_0Ecx], CPUID_7_0_ECX_PKU);

        features[FeatureWord::Xcr0Lo] = 0;
        let warnings = r.apply_xfam_dependencies(&mut features, &FeatureWords::default());
        assert!(warnings.is_empty());
        assert_eq!(features[FeatureWord::Leaf7_0Ebx], 0);
        assert_eq!(features[FeatureWord::Leaf7_0Ecx], 0);
    }

    #[test]
    fn feature_list_parsing() {
        let adj: FeatureAdjustments = "+avx512f,-pku,-7_0_edx.19".parse().unwrap();
        assert_eq!(adj.plus[FeatureWord::Leaf7_0Ebx], CPUID_7_0_EBX_AVX512F);
        assert_eq!(adj.minus[FeatureWord::Leaf7_0Ecx], CPUID_7_0_ECX_PKU);
        assert_eq!(adj.minus[FeatureWord::Leaf7_0Edx], 1 << 19);

        assert_eq!(
            "avx".parse::<FeatureAdjustments>(),
            Err(FeatureListError::MissingSign("avx".to_string()))
        );
        let again: FeatureAdjustments = adj.to_string().parse().unwrap();
        assert_eq!(again, adj);

        assert_eq!(
            "+7_0_edx.32".parse::<FeatureAdjustments>(),
            Err(FeatureListError::UnknownFeature("7_0_edx.32".to_string()))
        );
    }

    fn arb_caps() -> impl Strategy<Value = TdxCapabilities> {
        let config = (
            prop::sample::select(vec![0x1u32, 0x7, 0x8000_0001, 0x8000_0008, 0x14]),
            prop_oneof![Just(TDX_CPUID_NO_SUBLEAF), Just(0u32)],
            any::<[u32; 4]>(),
        )
            .prop_map(|(leaf, sub_leaf, regs)| TdxCpuidConfig {
                leaf,
                sub_leaf,
                eax: regs[0],
                ebx: regs[1],
                // Attribute controlled bits are never configurable.
                ecx: if leaf == 7 {
                    regs[2] & !(CPUID_7_0_ECX_PKS | CPUID_7_0_ECX_KEYLOCKER)
                } else {
                    regs[2]
                },
                edx: regs[3],
            });

        (
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            prop::collection::vec(config, 0..8),
        )
            .prop_map(|(attrs0, attrs1, xfam0, xfam1, cpuid_configs)| {
                let attrs_fixed1 = attrs1;
                // An attribute can't be both forced to 0 and to 1.
                let attrs_fixed0 = attrs0 & !attrs1;
                TdxCapabilities {
                    attrs_fixed0,
                    attrs_fixed1,
                    xfam_fixed0: xfam0 | xfam1,
                    xfam_fixed1: xfam1,
                    supported_gpaw: 0,
                    cpuid_configs,
                }
            })
    }

    proptest! {
        #[test]
        fn induced_words_stay_within_supported_mask(caps in arb_caps(), vmm in any::<u32>(), native in any::<u32>()) {
            let mut r = TdxFeatureReconciler::new(no_quirks());
            r.merge_capabilities(&caps);
            for word in FeatureWord::ALL {
                let entry = *r.lookup(word);
                if entry.inducing_ve {
                    let ret = r.supported_word(word, vmm, native);
                    prop_assert_eq!(ret & !entry.supported_on_ve, 0);
                }
            }
        }

        #[test]
        fn fixed_bits_are_enforced(caps in arb_caps(), vmm in any::<u32>(), native in any::<u32>()) {
            let mut r = TdxFeatureReconciler::new(no_quirks());
            r.merge_capabilities(&caps);
            for word in FeatureWord::ALL {
                let entry = *r.lookup(word);
                if entry.inducing_ve {
                    continue;
                }
                let ret = r.supported_word(word, vmm, native);
                prop_assert_eq!(ret & entry.fixed0, 0, "{:?}", word);
                prop_assert_eq!(ret & entry.fixed1, entry.fixed1, "{:?}", word);
            }
        }
    }
}
