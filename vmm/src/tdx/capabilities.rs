// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use arch::x86_64::tdx::cpuid::{
    FeatureAdjustments, FeatureWord, FeatureWords, TdxCpuidLookup, TdxFeatureReconciler,
};
use hypervisor::{
    CpuIdEntry, Hypervisor, HypervisorError, HypervisorVmError, TdxCapabilities, Vm,
    CPUID_FLAG_VALID_INDEX,
};
use serde::Serialize;
use vmm_sys_util::errno;

use super::TdxError;

/// First guess of the number of CPUID configurations.
pub const TDX_CPUID_CONFIGS_START: usize = 6;
/// Bound of the number of CPUID configurations, KVM's maximum CPUID entries.
pub const TDX_CPUID_CONFIGS_MAX: usize = 256;

/// Reads the capabilities with a buffer grown until it fits. Kernels
/// without the platform scope query reject it with EINVAL, the VM scope
/// query is used instead.
pub fn fetch_capabilities<P, V>(mut platform: P, mut vm: V) -> Result<TdxCapabilities, TdxError>
where
    P: FnMut(usize) -> Result<TdxCapabilities, errno::Error>,
    V: FnMut(usize) -> Result<TdxCapabilities, errno::Error>,
{
    let mut vm_scope = false;
    let mut nr_cpuid_configs = TDX_CPUID_CONFIGS_START;

    loop {
        let r = if vm_scope {
            vm(nr_cpuid_configs)
        } else {
            platform(nr_cpuid_configs)
        };

        match r {
            Ok(caps) => {
                debug!(
                    "TDX capabilities with {} CPUID configurations ({} scope)",
                    caps.cpuid_configs.len(),
                    if vm_scope { "VM" } else { "platform" }
                );
                return Ok(caps);
            }
            Err(e) if e.errno() == libc::E2BIG => {
                nr_cpuid_configs *= 2;
                if nr_cpuid_configs > TDX_CPUID_CONFIGS_MAX {
                    error!(
                        "TDX capabilities need more than {} CPUID configurations",
                        TDX_CPUID_CONFIGS_MAX
                    );
                    return Err(TdxError::Capabilities(e));
                }
            }
            Err(e) if e.errno() == libc::EINVAL && !vm_scope => {
                debug!("Platform scope TDX capabilities unsupported, asking the VM");
                vm_scope = true;
                nr_cpuid_configs = TDX_CPUID_CONFIGS_START;
            }
            Err(e) => return Err(TdxError::Capabilities(e)),
        }
    }
}

fn platform_errno(e: HypervisorError) -> errno::Error {
    match e {
        HypervisorError::TdxCapabilities(e) => e,
        e => {
            error!("TDX capabilities query failed: {}", e);
            errno::Error::new(libc::EIO)
        }
    }
}

fn vm_errno(e: HypervisorVmError) -> errno::Error {
    match e {
        HypervisorVmError::TdxCapabilities(e) => e,
        e => {
            error!("TDX capabilities query failed: {}", e);
            errno::Error::new(libc::EIO)
        }
    }
}

/// Capabilities of the TDX module, fetched once.
pub struct CapabilityStore {
    hypervisor: Arc<dyn Hypervisor>,
    vm: Arc<dyn Vm>,
    capabilities: OnceLock<TdxCapabilities>,
}

impl CapabilityStore {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, vm: Arc<dyn Vm>) -> Self {
        CapabilityStore {
            hypervisor,
            vm,
            capabilities: OnceLock::new(),
        }
    }

    pub fn get(&self) -> Result<&TdxCapabilities, TdxError> {
        if let Some(caps) = self.capabilities.get() {
            return Ok(caps);
        }

        let caps = fetch_capabilities(
            |nr| self.hypervisor.tdx_capabilities(nr).map_err(platform_errno),
            |nr| self.vm.tdx_capabilities(nr).map_err(vm_errno),
        )?;
        Ok(self.capabilities.get_or_init(|| caps))
    }

    pub fn supported_cpuid(&self) -> Result<Vec<CpuIdEntry>, TdxError> {
        self.hypervisor
            .get_supported_cpuid()
            .map_err(TdxError::SupportedCpuid)
    }
}

fn find_entry(entries: &[CpuIdEntry], leaf: u32, sub_leaf: Option<u32>) -> Option<usize> {
    entries.iter().position(|e| {
        e.function == leaf
            && match sub_leaf {
                Some(s) => e.flags & CPUID_FLAG_VALID_INDEX == 0 || e.index == s,
                None => true,
            }
    })
}

fn entry_regs(e: &CpuIdEntry) -> [u32; 4] {
    [e.eax, e.ebx, e.ecx, e.edx]
}

/// The value of every feature word in `entries`, 0 when absent.
pub fn feature_words(entries: &[CpuIdEntry]) -> FeatureWords {
    let mut words = FeatureWords::default();
    for word in FeatureWord::ALL {
        let (leaf, sub_leaf, reg) = word.cpuid();
        if let Some(i) = find_entry(entries, leaf, sub_leaf) {
            words[word] = reg.get(entry_regs(&entries[i]));
        }
    }
    words
}

fn set_feature_words(entries: &mut Vec<CpuIdEntry>, words: &FeatureWords) {
    for word in FeatureWord::ALL {
        let (leaf, sub_leaf, reg) = word.cpuid();
        let i = match find_entry(entries, leaf, sub_leaf) {
            Some(i) => i,
            None if words[word] == 0 => continue,
            None => {
                entries.push(CpuIdEntry {
                    function: leaf,
                    index: sub_leaf.unwrap_or(0),
                    flags: if sub_leaf.is_some() {
                        CPUID_FLAG_VALID_INDEX
                    } else {
                        0
                    },
                    ..Default::default()
                });
                entries.len() - 1
            }
        };

        let e = &mut entries[i];
        let r = match reg {
            arch::CpuidReg::EAX => &mut e.eax,
            arch::CpuidReg::EBX => &mut e.ebx,
            arch::CpuidReg::ECX => &mut e.ecx,
            arch::CpuidReg::EDX => &mut e.edx,
        };
        *r = words[word];
    }
}

/// Feature words a TD gets: supported bits, then the user's additions and
/// removals, then the removals put back and the XFAM dependencies.
/// Returns the words and the warnings issued on the way.
pub fn reconcile_feature_words(
    reconciler: &TdxFeatureReconciler,
    vmm: &FeatureWords,
    native: &FeatureWords,
    adjustments: &FeatureAdjustments,
) -> (FeatureWords, Vec<String>) {
    let mut words = FeatureWords::default();
    let mut warnings = Vec::new();

    for word in FeatureWord::ALL {
        let supported = reconciler.supported_word(word, vmm[word], native[word]);
        let unsupported = adjustments.plus[word] & !supported;
        if unsupported != 0 {
            let warning = format!(
                "TDX does not support the requested feature: {word} [mask {unsupported:#x}]"
            );
            warn!("{}", warning);
            warnings.push(warning);
        }
        words[word] = (supported | adjustments.plus[word]) & !unsupported & !adjustments.minus[word];
    }

    warnings.extend(reconciler.check_minus_features(&mut words, &adjustments.minus));
    warnings.extend(reconciler.apply_xfam_dependencies(&mut words, &adjustments.plus));

    (words, warnings)
}

fn host_feature_words() -> FeatureWords {
    let mut words = FeatureWords::default();
    for word in FeatureWord::ALL {
        let (leaf, sub_leaf, reg) = word.cpuid();
        words[word] = reg.get(arch::host_cpuid(leaf, sub_leaf.unwrap_or(0)));
    }
    words
}

/// The CPUID handed to the TD at init time, built from what KVM supports.
pub fn td_cpuid(
    reconciler: &TdxFeatureReconciler,
    supported: &[CpuIdEntry],
    adjustments: &FeatureAdjustments,
) -> Vec<CpuIdEntry> {
    let (words, _) = reconcile_feature_words(
        reconciler,
        &feature_words(supported),
        &host_feature_words(),
        adjustments,
    );
    let mut entries = supported.to_vec();
    set_feature_words(&mut entries, &words);
    entries
}

#[derive(Debug, Serialize)]
pub struct FeatureReport {
    pub word: String,
    pub lookup: TdxCpuidLookup,
    pub supported: u32,
}

/// What `--capabilities` prints.
#[derive(Debug, Serialize)]
pub struct CapabilityReport {
    pub capabilities: TdxCapabilities,
    pub features: BTreeMap<&'static str, FeatureReport>,
    pub warnings: Vec<String>,
}

impl CapabilityReport {
    pub fn new(
        capabilities: &TdxCapabilities,
        reconciler: &TdxFeatureReconciler,
        supported: &[CpuIdEntry],
        adjustments: &FeatureAdjustments,
    ) -> Self {
        let (words, warnings) = reconcile_feature_words(
            reconciler,
            &feature_words(supported),
            &host_feature_words(),
            adjustments,
        );
        let features = FeatureWord::ALL
            .into_iter()
            .map(|word| {
                (
                    word.name(),
                    FeatureReport {
                        word: word.to_string(),
                        lookup: *reconciler.lookup(word),
                        supported: words[word],
                    },
                )
            })
            .collect();

        CapabilityReport {
            capabilities: capabilities.clone(),
            features,
            warnings,
        }
    }
}
