// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host side of a TDX trust domain.
//!
//! `TdxGuest` owns the trust domain state. It walks the TD through its
//! lifecycle: capabilities, TD initialization, per vCPU initialization and
//! finalization of the initial measurement. It also answers the
//! TDG.VP.VMCALLs the guest makes once running.

pub mod capabilities;
pub mod migration;
pub mod quote;
pub mod ram;
pub mod service;
pub mod vmcall;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use arch::x86_64::tdx::cpuid::{
    TdxCpuidQuirks, TdxFeatureReconciler, CPUID_7_0_ECX_PKS, TDX_MAX_TSC_FREQUENCY_KHZ,
    TDX_MIN_TSC_FREQUENCY_KHZ, TDX_TD_ATTRIBUTES_DEBUG, TDX_TD_ATTRIBUTES_MIG,
    TDX_TD_ATTRIBUTES_PERFMON, TDX_TD_ATTRIBUTES_PKS, TDX_TD_ATTRIBUTES_SEPT_VE_DISABLE,
    TDX_TSC_FREQUENCY_GRANULARITY_KHZ,
};
use arch::x86_64::tdx::{parse_tdvf_sections, TdHob, TdvfError, TdvfSection, TdvfSectionType};
use hypervisor::{
    CpuIdEntry, Hypervisor, HypervisorCpuError, HypervisorError, HypervisorVmError,
    TdxInitParams, TdxServtdBinding, TdxServtdTarget, Vcpu, Vm,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryError};
use vm_migration::{MigratableError, Snapshot, Snapshottable};
use vmm_sys_util::errno;

use self::capabilities::{td_cpuid, CapabilityReport, CapabilityStore};
use self::quote::{QuoteRelay, QuoteState};
use self::ram::{RamRegions, RamState};
use self::service::VmcallService;
use self::vmcall::GuestChannel;
use crate::config::{TdxConfig, VmConfig};
use crate::event_loop::EventLoop;
use crate::run_state::RunState;
use crate::GuestMemoryMmap;

pub const TDX_SNAPSHOT_ID: &str = "tdx";

#[derive(Error, Debug)]
pub enum TdxError {
    #[error("TDX is not configured")]
    NotConfigured,
    #[error("Failed to get TDX capabilities: {0}")]
    Capabilities(#[source] errno::Error),
    #[error("Failed to get the supported CPUID: {0}")]
    SupportedCpuid(#[source] HypervisorError),
    #[error("Failed to set the maximum number of vCPUs: {0}")]
    MaxVcpus(#[source] HypervisorVmError),
    #[error("Invalid TSC frequency {0} kHz, it must be a multiple of {TDX_TSC_FREQUENCY_GRANULARITY_KHZ} kHz between {TDX_MIN_TSC_FREQUENCY_KHZ} and {TDX_MAX_TSC_FREQUENCY_KHZ} kHz")]
    InvalidTscFrequency(u32),
    #[error("Failed to set the TSC frequency: {0}")]
    SetTscKhz(#[source] HypervisorVmError),
    #[error("Invalid TD attributes {attributes:#x} (fixed0 {fixed0:#x}, fixed1 {fixed1:#x})")]
    InvalidAttributes {
        attributes: u64,
        fixed0: u64,
        fixed1: u64,
    },
    #[error("Failed to initialize the TD: {0}")]
    InitVm(#[source] HypervisorVmError),
    #[error("The TD is not initialized")]
    NotInitialized,
    #[error("Failed to initialize the TD vCPU: {0}")]
    InitVcpu(#[source] HypervisorCpuError),
    #[error("Failed to read the firmware {0}: {1}")]
    ReadFirmware(PathBuf, #[source] io::Error),
    #[error("Invalid TDVF firmware: {0}")]
    Firmware(#[source] TdvfError),
    #[error("Unsupported TDVF section type {0}")]
    UnsupportedSection(u32),
    #[error("TDVF has no TD HOB section")]
    MissingHob,
    #[error("Range {0:#x}+{1:#x} does not lie in unaccepted RAM")]
    RangeConflict(u64, u64),
    #[error("Permanent memory section {0:#x}+{1:#x} is outside of RAM")]
    PermMemOutsideRam(u64, u64),
    #[error("Failed to create firmware memory: {0}")]
    FirmwareMemory(#[source] vm_memory::Error),
    #[error("Failed to access firmware memory: {0}")]
    GuestMemory(#[source] GuestMemoryError),
    #[error("Failed to map firmware memory: {0}")]
    Memory(#[source] anyhow::Error),
    #[error("Failed to make initial memory private: {0}")]
    ConvertMemory(#[source] HypervisorVmError),
    #[error("Failed to add initial memory to the TD: {0}")]
    InitMemRegion(#[source] HypervisorVmError),
    #[error("Failed to finalize the TD: {0}")]
    Finalize(#[source] HypervisorVmError),
    #[error("Failed to complete the TD import: {0}")]
    EndImport(#[source] HypervisorVmError),
}

pub type Result<T> = std::result::Result<T, TdxError>;

/// A zero frequency leaves the host TSC frequency in place.
pub fn check_tsc_frequency(tsc_khz: u32) -> Result<()> {
    if tsc_khz == 0 {
        return Ok(());
    }
    if !(TDX_MIN_TSC_FREQUENCY_KHZ..=TDX_MAX_TSC_FREQUENCY_KHZ).contains(&tsc_khz)
        || tsc_khz % TDX_TSC_FREQUENCY_GRANULARITY_KHZ != 0
    {
        return Err(TdxError::InvalidTscFrequency(tsc_khz));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum TdLifecycle {
    Unconfigured,
    CapabilitiesLoaded,
    VmInitialized,
    VcpusCreated,
    Finalized,
}

/// Guest memory a TD is built in.
pub trait TdMemory {
    /// Guest RAM, as `(address, length)` pairs.
    fn ram_extents(&self) -> Vec<(u64, u64)>;
    /// Backs `[gpa, gpa + size)` with private memory. Used for firmware
    /// sections outside of RAM.
    fn add_private_region(&mut self, gpa: u64, size: u64) -> std::result::Result<(), anyhow::Error>;
}

pub(crate) struct TrustDomain {
    lifecycle: TdLifecycle,
    attributes: u64,
    ram: RamRegions,
    hob_address: Option<u64>,
    pub(crate) event_notify_vector: u32,
    pub(crate) event_notify_apic_id: u32,
}

pub struct TdxGuest {
    config: TdxConfig,
    boot_vcpus: u32,
    pmu: bool,
    cpu_features: arch::x86_64::tdx::cpuid::FeatureAdjustments,
    tsc_khz: Option<u32>,
    incoming: bool,
    vm: Arc<dyn Vm>,
    capabilities: CapabilityStore,
    reconciler: Mutex<TdxFeatureReconciler>,
    guest: Arc<GuestChannel>,
    pub(crate) state: Mutex<TrustDomain>,
    quote: Arc<QuoteRelay>,
    service: Arc<VmcallService>,
}

impl TdxGuest {
    pub fn new(
        vm_config: &VmConfig,
        hypervisor: Arc<dyn Hypervisor>,
        vm: Arc<dyn Vm>,
        memory: GuestMemoryMmap,
        phys_bits: u8,
        event_loop: Arc<EventLoop>,
        run_state: Arc<RunState>,
    ) -> Result<Self> {
        let config = vm_config.tdx.clone().ok_or(TdxError::NotConfigured)?;
        let guest = Arc::new(GuestChannel::new(vm.clone(), memory, phys_bits));
        let quote = Arc::new(QuoteRelay::new(
            guest.clone(),
            event_loop.clone(),
            config.quote_generation_service.clone(),
            config.legacy_quote_abi,
        ));
        let service = VmcallService::new(guest.clone(), event_loop, run_state);
        let reconciler = TdxFeatureReconciler::new(TdxCpuidQuirks {
            host_tsx_broken: vm_config.cpus.host_tsx_broken,
            cpu_pm: vm_config.cpus.cpu_pm,
        });

        Ok(TdxGuest {
            boot_vcpus: vm_config.cpus.boot_vcpus,
            pmu: vm_config.cpus.pmu,
            cpu_features: vm_config.cpus.features.0,
            tsc_khz: vm_config.tsc_khz,
            incoming: vm_config.incoming,
            capabilities: CapabilityStore::new(hypervisor, vm.clone()),
            vm,
            reconciler: Mutex::new(reconciler),
            guest,
            state: Mutex::new(TrustDomain {
                lifecycle: TdLifecycle::Unconfigured,
                attributes: 0,
                ram: RamRegions::default(),
                hob_address: None,
                event_notify_vector: 0,
                event_notify_apic_id: 0,
            }),
            quote,
            service,
            config,
        })
    }

    pub fn guest(&self) -> &Arc<GuestChannel> {
        &self.guest
    }

    pub fn quote(&self) -> &Arc<QuoteRelay> {
        &self.quote
    }

    pub fn service(&self) -> &Arc<VmcallService> {
        &self.service
    }

    pub fn vm(&self) -> &Arc<dyn Vm> {
        &self.vm
    }

    pub fn boot_vcpus(&self) -> u32 {
        self.boot_vcpus
    }

    /// APIC id and vector of the TD wide event notification.
    pub fn event_notify(&self) -> (u32, u32) {
        let td = self.state.lock().unwrap();
        (td.event_notify_apic_id, td.event_notify_vector)
    }

    pub fn lifecycle(&self) -> TdLifecycle {
        self.state.lock().unwrap().lifecycle
    }

    pub fn attributes(&self) -> u64 {
        self.state.lock().unwrap().attributes
    }

    pub fn ram_regions(&self) -> RamRegions {
        self.state.lock().unwrap().ram.clone()
    }

    /// Reconciled capabilities, as printed by `--capabilities`.
    pub fn capability_report(&self) -> Result<CapabilityReport> {
        let caps = self.capabilities.get()?;
        let supported = self.capabilities.supported_cpuid()?;
        let mut td = self.state.lock().unwrap();
        let mut reconciler = self.reconciler.lock().unwrap();
        if td.lifecycle < TdLifecycle::CapabilitiesLoaded {
            reconciler.merge_capabilities(caps);
            td.lifecycle = TdLifecycle::CapabilitiesLoaded;
        }
        drop(td);
        Ok(CapabilityReport::new(
            caps,
            &reconciler,
            &supported,
            &self.cpu_features,
        ))
    }

    fn td_attributes(&self, cpuid: &[CpuIdEntry]) -> u64 {
        let mut attributes = 0;
        if self.config.debug {
            attributes |= TDX_TD_ATTRIBUTES_DEBUG;
        }
        if self.config.sept_ve_disable {
            attributes |= TDX_TD_ATTRIBUTES_SEPT_VE_DISABLE;
        }
        if self.config.migtd_configured() {
            attributes |= TDX_TD_ATTRIBUTES_MIG;
        }
        if cpuid
            .iter()
            .any(|e| e.function == 7 && e.index == 0 && e.ecx & CPUID_7_0_ECX_PKS != 0)
        {
            attributes |= TDX_TD_ATTRIBUTES_PKS;
        }
        if self.pmu {
            attributes |= TDX_TD_ATTRIBUTES_PERFMON;
        }
        attributes
    }

    /// Initializes the TD. Calling it again once done has no effect.
    pub fn init_vm(&self) -> Result<()> {
        // Fetched before taking the lock, the query may take a while.
        let caps = self.capabilities.get()?;
        let supported = self.capabilities.supported_cpuid()?;

        let mut td = self.state.lock().unwrap();
        if td.lifecycle >= TdLifecycle::VmInitialized {
            return Ok(());
        }

        let mut reconciler = self.reconciler.lock().unwrap();
        if td.lifecycle < TdLifecycle::CapabilitiesLoaded {
            reconciler.merge_capabilities(caps);
            td.lifecycle = TdLifecycle::CapabilitiesLoaded;
        }

        self.vm
            .enable_max_vcpus(self.boot_vcpus)
            .map_err(TdxError::MaxVcpus)?;

        if let Some(tsc_khz) = self.tsc_khz.filter(|&f| f != 0) {
            check_tsc_frequency(tsc_khz)?;
            self.vm.set_tsc_khz(tsc_khz).map_err(TdxError::SetTscKhz)?;
        }

        let cpuid = td_cpuid(&reconciler, &supported, &self.cpu_features);
        let attributes = self.td_attributes(&cpuid);
        if !caps.attributes_valid(attributes) {
            return Err(TdxError::InvalidAttributes {
                attributes,
                fixed0: caps.attrs_fixed0,
                fixed1: caps.attrs_fixed1,
            });
        }

        self.vm
            .tdx_init(&TdxInitParams {
                attributes,
                mrconfigid: self.config.mrconfigid.0,
                mrowner: self.config.mrowner.0,
                mrownerconfig: self.config.mrownerconfig.0,
                cpuid,
                post_init: self.incoming,
            })
            .map_err(TdxError::InitVm)?;

        info!("TD initialized with attributes {:#x}", attributes);
        td.attributes = attributes;
        td.lifecycle = TdLifecycle::VmInitialized;
        Ok(())
    }

    /// Loads the firmware, initializes the vCPUs and seals the initial
    /// measurement. A migration destination stops before the seal.
    pub fn finalize(&self, vcpus: &[Arc<dyn Vcpu>], memory: &mut dyn TdMemory) -> Result<()> {
        let image = std::fs::read(&self.config.firmware)
            .map_err(|e| TdxError::ReadFirmware(self.config.firmware.clone(), e))?;
        self.finalize_with_image(vcpus, memory, &image)
    }

    fn accept_sections(
        sections: &[TdvfSection],
        ram: &mut RamRegions,
        memory: &mut dyn TdMemory,
    ) -> Result<()> {
        for section in sections {
            match section.section_type() {
                Some(TdvfSectionType::Bfv | TdvfSectionType::Cfv | TdvfSectionType::Payload) => {
                    if ram.find(section.address, section.size).is_none() {
                        memory
                            .add_private_region(section.address, section.size)
                            .map_err(TdxError::Memory)?;
                    }
                }
                Some(TdvfSectionType::TdHob | TdvfSectionType::TempMem) => {
                    ram.accept(section.address, section.size)?;
                }
                // Left for the guest to accept.
                Some(TdvfSectionType::PermMem) => {
                    if ram.find(section.address, section.size).is_none() {
                        return Err(TdxError::PermMemOutsideRam(section.address, section.size));
                    }
                }
                _ => return Err(TdxError::UnsupportedSection(section.r#type)),
            }
        }
        ram.sort();
        Ok(())
    }

    // Host memory holding the initial content of every section but the
    // permanent memory ones, until it is copied into the TD.
    fn stage_sections(sections: &[&TdvfSection], image: &[u8]) -> Result<GuestMemoryMmap> {
        let mut ranges: Vec<(GuestAddress, usize)> = sections
            .iter()
            .map(|s| (GuestAddress(s.address), s.size as usize))
            .collect();
        ranges.sort_by_key(|(address, _)| *address);
        let staging = GuestMemoryMmap::from_ranges(&ranges).map_err(TdxError::FirmwareMemory)?;

        for section in sections {
            if let Some(data) = section.data(image).filter(|d| !d.is_empty()) {
                staging
                    .write_slice(data, GuestAddress(section.address))
                    .map_err(TdxError::GuestMemory)?;
            }
        }
        Ok(staging)
    }

    fn bind_migtd(&self) {
        let target = if self.config.migtd_pid != 0 {
            TdxServtdTarget::Pid(self.config.migtd_pid)
        } else if !self.config.migtd_hash.is_zero() {
            TdxServtdTarget::Hash(self.config.migtd_hash.0)
        } else {
            return;
        };

        let binding = TdxServtdBinding {
            attr: self.config.migtd_attr,
            target,
        };
        match self.vm.tdx_bind_servtd(&binding) {
            Ok(()) => info!("MigTD bound: {:?}", target),
            Err(e) => error!("Failed to bind MigTD: {}", e),
        }
    }

    pub(crate) fn finalize_with_image(
        &self,
        vcpus: &[Arc<dyn Vcpu>],
        memory: &mut dyn TdMemory,
        image: &[u8],
    ) -> Result<()> {
        let sections = parse_tdvf_sections(image).map_err(TdxError::Firmware)?;

        let mut td = self.state.lock().unwrap();
        if td.lifecycle < TdLifecycle::VmInitialized {
            return Err(TdxError::NotInitialized);
        }

        let mut ram = RamRegions::from_extents(&memory.ram_extents());
        Self::accept_sections(&sections, &mut ram, memory)?;

        let initial: Vec<&TdvfSection> = sections
            .iter()
            .filter(|s| s.section_type() != Some(TdvfSectionType::PermMem))
            .collect();
        let staging = Self::stage_sections(&initial, image)?;

        let hob_section = sections
            .iter()
            .find(|s| s.section_type() == Some(TdvfSectionType::TdHob))
            .ok_or(TdxError::MissingHob)?;
        let mut hob = TdHob::start(hob_section.address, hob_section.size);
        for region in ram.iter() {
            hob.add_memory_resource(
                &staging,
                region.address,
                region.length,
                region.state == RamState::Added,
            )
            .map_err(TdxError::Firmware)?;
        }
        hob.finish(&staging).map_err(TdxError::Firmware)?;

        for vcpu in vcpus {
            vcpu.tdx_init(hob_section.address)
                .map_err(TdxError::InitVcpu)?;
        }
        td.ram = ram;
        td.hob_address = Some(hob_section.address);
        td.lifecycle = TdLifecycle::VcpusCreated;

        // Binding must happen before the TD is finalized.
        self.bind_migtd();
        if let Some(port) = self.config.vsockport {
            if let Err(e) = self.vm.tdx_set_migration_info(!self.incoming, port) {
                error!("Failed to set the MigTD vsock port: {}", e);
            }
        }

        if self.incoming {
            info!("TD finalization deferred until its state is imported");
            return Ok(());
        }

        for section in &sections {
            self.vm
                .set_memory_private(section.address, section.size, true)
                .map_err(TdxError::ConvertMemory)?;
            if section.section_type() == Some(TdvfSectionType::PermMem) {
                continue;
            }

            let host_address = staging
                .get_host_address(GuestAddress(section.address))
                .map_err(TdxError::GuestMemory)?;
            debug!(
                "TD memory region {:#x}+{:#x} type {} from {:p}",
                section.address, section.size, section.r#type, host_address
            );
            self.vm
                .tdx_init_memory_region(
                    host_address as u64,
                    section.address,
                    section.size,
                    section.measured(),
                )
                .map_err(TdxError::InitMemRegion)?;
        }
        // The content now lives in private memory.
        drop(staging);

        self.vm.tdx_finalize().map_err(TdxError::Finalize)?;
        td.lifecycle = TdLifecycle::Finalized;
        info!("TD finalized");
        Ok(())
    }

    /// Called once a migration destination imported the whole TD state.
    pub fn migration_import_done(&self) -> Result<()> {
        self.vm.tdx_end_import().map_err(TdxError::EndImport)?;
        self.state.lock().unwrap().lifecycle = TdLifecycle::Finalized;
        info!("TD state imported");
        Ok(())
    }

    /// MigTD is done with the pre-migration key exchange.
    pub fn premig_done(&self) -> bool {
        match self.vm.tdx_get_migration_info() {
            Ok(info) => info.premig_done,
            Err(e) => {
                debug!("Failed to get TDX migration info: {}", e);
                false
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TdxGuestState {
    pub event_notify_vector: u32,
    pub event_notify_apic_id: u32,
    /// GetQuote requests in flight when the snapshot was taken.
    pub quotes: Vec<QuoteState>,
}

impl Snapshottable for TdxGuest {
    fn id(&self) -> String {
        TDX_SNAPSHOT_ID.to_string()
    }

    fn snapshot(&self) -> std::result::Result<Snapshot, MigratableError> {
        let (event_notify_apic_id, event_notify_vector) = self.event_notify();
        Snapshot::new_from_state(&TdxGuestState {
            event_notify_vector,
            event_notify_apic_id,
            quotes: self.quote.snapshot_tasks(),
        })
    }

    fn restore(&self, snapshot: &Snapshot) -> std::result::Result<(), MigratableError> {
        let state: TdxGuestState = snapshot.to_state()?;
        {
            let mut td = self.state.lock().unwrap();
            td.event_notify_vector = state.event_notify_vector;
            td.event_notify_apic_id = state.event_notify_apic_id;
        }
        // In flight work is not carried over, the local service redoes it.
        self.quote.restart(&state.quotes);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use arch::x86_64::tdx::TDVF_SECTION_ATTRIBUTES_MR_EXTEND;
    use hypervisor::{
        HypervisorType, MsiMessage, TdxCapabilities, TdxExitDetails, TdxMigrationInfo,
        TdxMigrationState, VmExit, VmType,
    };
    use zerocopy::IntoBytes;

    use super::*;
    use crate::config::{Sha384, DEFAULT_MIGTD_ATTR};
    use crate::run_state::VmRunState;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum Call {
        EnableMaxVcpus(u32),
        SetTscKhz(u32),
        UserMemoryRegion { slot: u32, gpa: u64, size: u64, private: bool },
        SetMemoryPrivate(u64, u64, bool),
        SignalMsi(MsiMessage),
        TdxInit { attributes: u64, post_init: bool },
        InitMemRegion { gpa: u64, size: u64, measure: bool },
        Finalize,
        BindServtd(TdxServtdBinding),
        SetMigrationInfo(bool, u32),
        VcpuInit(u32, u64),
        SetTdxStatus(u32, u64),
        Export(TdxMigrationState, Vec<u64>),
        Import(TdxMigrationState, Vec<u64>, Vec<u8>),
        CancelPages(Vec<u64>),
        PauseExport,
        AbortExport(u64),
        EndImport,
    }

    type Calls = Arc<Mutex<Vec<Call>>>;

    pub(crate) struct MockVcpu {
        id: u32,
        calls: Calls,
        pub(crate) exits: Mutex<Vec<VmExit>>,
        pub(crate) details: Mutex<TdxExitDetails>,
    }

    impl Vcpu for MockVcpu {
        fn run(&self) -> std::result::Result<VmExit, HypervisorCpuError> {
            Ok(self.exits.lock().unwrap().pop().unwrap_or(VmExit::Shutdown))
        }

        fn tdx_init(&self, hob_address: u64) -> hypervisor::cpu::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::VcpuInit(self.id, hob_address));
            Ok(())
        }

        fn get_tdx_exit_details(&self) -> hypervisor::cpu::Result<TdxExitDetails> {
            Ok(*self.details.lock().unwrap())
        }

        fn set_tdx_status(&self, status: u64) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::SetTdxStatus(self.id, status));
        }
    }

    pub(crate) struct MockVm {
        calls: Calls,
        pub(crate) caps: Mutex<TdxCapabilities>,
        pub(crate) premig_done: AtomicBool,
        pub(crate) vcpus: Mutex<Vec<Arc<MockVcpu>>>,
    }

    impl MockVm {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(MockVm {
                calls: Arc::new(Mutex::new(Vec::new())),
                caps: Mutex::new(TdxCapabilities {
                    attrs_fixed0: TDX_TD_ATTRIBUTES_DEBUG
                        | TDX_TD_ATTRIBUTES_SEPT_VE_DISABLE
                        | TDX_TD_ATTRIBUTES_MIG
                        | TDX_TD_ATTRIBUTES_PKS
                        | TDX_TD_ATTRIBUTES_PERFMON,
                    attrs_fixed1: 0,
                    xfam_fixed0: 0x6_02ff,
                    xfam_fixed1: 0x3,
                    supported_gpaw: 1,
                    cpuid_configs: Vec::new(),
                }),
                premig_done: AtomicBool::new(false),
                vcpus: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn take_calls(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn record(&self, call: Call) -> hypervisor::vm::Result<()> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }

        // Stands for the encrypted form of the exported state.
        pub(crate) fn exported(state: TdxMigrationState, gpas: &[u64]) -> Vec<u8> {
            format!("{state:?}{gpas:x?}").into_bytes()
        }
    }

    impl Vm for MockVm {
        fn create_vcpu(&self, id: u32) -> hypervisor::vm::Result<Arc<dyn Vcpu>> {
            let vcpu = Arc::new(MockVcpu {
                id,
                calls: self.calls.clone(),
                exits: Mutex::new(Vec::new()),
                details: Mutex::new(TdxExitDetails::default()),
            });
            self.vcpus.lock().unwrap().push(vcpu.clone());
            Ok(vcpu)
        }

        fn enable_max_vcpus(&self, max_vcpus: u32) -> hypervisor::vm::Result<()> {
            self.record(Call::EnableMaxVcpus(max_vcpus))
        }

        fn set_tsc_khz(&self, tsc_khz: u32) -> hypervisor::vm::Result<()> {
            self.record(Call::SetTscKhz(tsc_khz))
        }

        fn create_user_memory_region(
            &self,
            slot: u32,
            gpa: u64,
            size: u64,
            _userspace_addr: u64,
            private: bool,
        ) -> hypervisor::vm::Result<()> {
            self.record(Call::UserMemoryRegion {
                slot,
                gpa,
                size,
                private,
            })
        }

        fn set_memory_private(&self, gpa: u64, size: u64, private: bool) -> hypervisor::vm::Result<()> {
            self.record(Call::SetMemoryPrivate(gpa, size, private))
        }

        fn signal_msi(&self, msi: MsiMessage) -> hypervisor::vm::Result<()> {
            self.record(Call::SignalMsi(msi))
        }

        fn tdx_capabilities(&self, _nr: usize) -> hypervisor::vm::Result<TdxCapabilities> {
            Ok(self.caps.lock().unwrap().clone())
        }

        fn tdx_init(&self, params: &TdxInitParams) -> hypervisor::vm::Result<()> {
            self.record(Call::TdxInit {
                attributes: params.attributes,
                post_init: params.post_init,
            })
        }

        fn tdx_init_memory_region(
            &self,
            _host_address: u64,
            gpa: u64,
            size: u64,
            measure: bool,
        ) -> hypervisor::vm::Result<()> {
            self.record(Call::InitMemRegion { gpa, size, measure })
        }

        fn tdx_finalize(&self) -> hypervisor::vm::Result<()> {
            self.record(Call::Finalize)
        }

        fn tdx_bind_servtd(&self, binding: &TdxServtdBinding) -> hypervisor::vm::Result<()> {
            self.record(Call::BindServtd(*binding))
        }

        fn tdx_get_migration_info(&self) -> hypervisor::vm::Result<TdxMigrationInfo> {
            Ok(TdxMigrationInfo {
                premig_done: self.premig_done.load(Ordering::SeqCst),
            })
        }

        fn tdx_set_migration_info(&self, is_src: bool, vsock_port: u32) -> hypervisor::vm::Result<()> {
            self.record(Call::SetMigrationInfo(is_src, vsock_port))
        }

        fn tdx_export_state(
            &self,
            state: TdxMigrationState,
            _channel: u32,
            gpas: &[u64],
            buf: &mut [u8],
        ) -> hypervisor::vm::Result<usize> {
            let data = Self::exported(state, gpas);
            buf[..data.len()].copy_from_slice(&data);
            self.record(Call::Export(state, gpas.to_vec()))?;
            Ok(data.len())
        }

        fn tdx_import_state(
            &self,
            state: TdxMigrationState,
            _channel: u32,
            gpas: &[u64],
            data: &[u8],
        ) -> hypervisor::vm::Result<()> {
            self.record(Call::Import(state, gpas.to_vec(), data.to_vec()))
        }

        fn tdx_cancel_pages(&self, _channel: u32, gpas: &[u64]) -> hypervisor::vm::Result<()> {
            self.record(Call::CancelPages(gpas.to_vec()))
        }

        fn tdx_pause_export(&self) -> hypervisor::vm::Result<()> {
            self.record(Call::PauseExport)
        }

        fn tdx_abort_export(&self, gfn_end: u64) -> hypervisor::vm::Result<()> {
            self.record(Call::AbortExport(gfn_end))
        }

        fn tdx_end_import(&self) -> hypervisor::vm::Result<()> {
            self.record(Call::EndImport)
        }
    }

    pub(crate) struct MockHypervisor {
        vm: Arc<MockVm>,
        pub(crate) supported_cpuid: Vec<CpuIdEntry>,
    }

    impl Hypervisor for MockHypervisor {
        fn hypervisor_type(&self) -> HypervisorType {
            HypervisorType::Kvm
        }

        fn create_vm(&self, _vm_type: VmType) -> hypervisor::hypervisor::Result<Arc<dyn Vm>> {
            Ok(self.vm.clone())
        }

        fn get_supported_cpuid(&self) -> hypervisor::hypervisor::Result<Vec<CpuIdEntry>> {
            Ok(self.supported_cpuid.clone())
        }

        fn tdx_capabilities(&self, nr: usize) -> hypervisor::hypervisor::Result<TdxCapabilities> {
            self.vm
                .tdx_capabilities(nr)
                .map_err(|e| HypervisorError::HypervisorCreate(e.into()))
        }
    }

    pub(crate) const TEST_MEMORY_SIZE: usize = 4 << 20;
    pub(crate) const TEST_PHYS_BITS: u8 = 48;

    pub(crate) fn test_memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), TEST_MEMORY_SIZE)]).unwrap()
    }

    pub(crate) fn test_channel() -> (Arc<GuestChannel>, Arc<MockVm>) {
        let vm = MockVm::new();
        let guest = Arc::new(GuestChannel::new(vm.clone(), test_memory(), TEST_PHYS_BITS));
        (guest, vm)
    }

    pub(crate) fn hypervisor_for(vm: &Arc<MockVm>) -> Arc<dyn Hypervisor> {
        Arc::new(MockHypervisor {
            vm: vm.clone(),
            supported_cpuid: vec![CpuIdEntry {
                function: 7,
                index: 0,
                flags: hypervisor::CPUID_FLAG_VALID_INDEX,
                ..Default::default()
            }],
        })
    }

    pub(crate) fn guest_with(vm_config: &VmConfig) -> (Arc<TdxGuest>, Arc<MockVm>) {
        let vm = MockVm::new();
        let run_state = Arc::new(RunState::new());
        run_state.set(VmRunState::Running).unwrap();
        let guest = TdxGuest::new(
            vm_config,
            hypervisor_for(&vm),
            vm.clone(),
            test_memory(),
            TEST_PHYS_BITS,
            Arc::new(EventLoop::new().unwrap()),
            run_state,
        )
        .unwrap();
        (Arc::new(guest), vm)
    }

    pub(crate) fn test_config() -> VmConfig {
        VmConfig {
            tdx: Some(TdxConfig::new(PathBuf::from("/nonexistent/tdvf.fd"))),
            ..Default::default()
        }
    }

    pub(crate) fn test_guest() -> (Arc<TdxGuest>, Arc<MockVm>) {
        guest_with(&test_config())
    }

    #[derive(Default)]
    struct TestMemory {
        extents: Vec<(u64, u64)>,
        added: Vec<(u64, u64)>,
    }

    impl TdMemory for TestMemory {
        fn ram_extents(&self) -> Vec<(u64, u64)> {
            self.extents.clone()
        }

        fn add_private_region(&mut self, gpa: u64, size: u64) -> std::result::Result<(), anyhow::Error> {
            self.added.push((gpa, size));
            Ok(())
        }
    }

    fn section(r#type: TdvfSectionType, address: u64, size: u64, data: (u32, u32)) -> TdvfSection {
        TdvfSection {
            data_offset: data.0,
            data_size: data.1,
            address,
            size,
            r#type: r#type as u32,
            attributes: 0,
        }
    }

    const BFV: u64 = 0xffc0_0000;
    const HOB: u64 = 0x80_0000;
    const TEMP: u64 = 0x90_0000;

    pub(crate) fn test_sections() -> Vec<TdvfSection> {
        let mut bfv = section(TdvfSectionType::Bfv, BFV, 0x1000, (0, 0x1000));
        bfv.attributes = TDVF_SECTION_ATTRIBUTES_MR_EXTEND;
        vec![
            bfv,
            section(TdvfSectionType::TdHob, HOB, 0x2000, (0, 0)),
            section(TdvfSectionType::TempMem, TEMP, 0x10_0000, (0, 0)),
            section(TdvfSectionType::PermMem, 0x100_0000, 0x1000, (0, 0)),
        ]
    }

    // [code page][metadata][padding], with the metadata found through
    // the pointer 0x20 bytes before the end.
    pub(crate) fn tdvf_image(sections: &[TdvfSection]) -> Vec<u8> {
        let mut image = vec![0u8; 0x4000];
        image[..4].copy_from_slice(b"CODE");

        let mut metadata = Vec::new();
        metadata.extend_from_slice(b"TDVF");
        metadata.extend_from_slice(&((16 + 32 * sections.len()) as u32).to_le_bytes());
        metadata.extend_from_slice(&1u32.to_le_bytes());
        metadata.extend_from_slice(&(sections.len() as u32).to_le_bytes());
        for s in sections {
            metadata.extend_from_slice(s.as_bytes());
        }
        image[0x2000..0x2000 + metadata.len()].copy_from_slice(&metadata);

        let location = image.len() - 0x20;
        image[location..location + 4].copy_from_slice(&0x2000u32.to_le_bytes());
        image
    }

    fn test_ram() -> TestMemory {
        TestMemory {
            extents: vec![(0, 0x8000_0000)],
            ..Default::default()
        }
    }

    fn vcpus(vm: &MockVm, n: u32) -> Vec<Arc<dyn Vcpu>> {
        (0..n).map(|id| vm.create_vcpu(id).unwrap()).collect()
    }

    #[test]
    fn tsc_frequency_bounds() {
        assert!(check_tsc_frequency(0).is_ok());
        assert!(check_tsc_frequency(2_000_000).is_ok());
        assert!(check_tsc_frequency(TDX_MIN_TSC_FREQUENCY_KHZ).is_ok());
        assert!(check_tsc_frequency(TDX_MAX_TSC_FREQUENCY_KHZ).is_ok());
        for khz in [2_010_000, 75_000, 10_025_000] {
            assert!(matches!(
                check_tsc_frequency(khz),
                Err(TdxError::InvalidTscFrequency(f)) if f == khz
            ));
        }
    }

    #[test]
    fn init_vm_once() {
        let mut config = test_config();
        config.cpus.boot_vcpus = 4;
        config.tsc_khz = Some(2_000_000);
        let (guest, vm) = guest_with(&config);
        assert_eq!(guest.lifecycle(), TdLifecycle::Unconfigured);

        guest.init_vm().unwrap();
        let calls = vm.take_calls();
        assert_eq!(calls[0], Call::EnableMaxVcpus(4));
        assert_eq!(calls[1], Call::SetTscKhz(2_000_000));
        let Call::TdxInit {
            attributes,
            post_init,
        } = calls[2]
        else {
            panic!("unexpected call {:?}", calls[2]);
        };
        assert!(!post_init);
        assert_ne!(attributes & TDX_TD_ATTRIBUTES_SEPT_VE_DISABLE, 0);
        assert_eq!(attributes & (TDX_TD_ATTRIBUTES_DEBUG | TDX_TD_ATTRIBUTES_MIG), 0);
        assert_eq!(guest.attributes(), attributes);
        assert_eq!(guest.lifecycle(), TdLifecycle::VmInitialized);

        guest.init_vm().unwrap();
        assert!(vm.take_calls().is_empty());
    }

    #[test]
    fn init_vm_rejects_attributes() {
        let mut config = test_config();
        let tdx = config.tdx.as_mut().unwrap();
        tdx.debug = true;
        tdx.migtd_pid = 7;
        config.cpus.pmu = true;
        let (guest, vm) = guest_with(&config);
        vm.caps.lock().unwrap().attrs_fixed0 &= !TDX_TD_ATTRIBUTES_DEBUG;

        assert!(matches!(
            guest.init_vm(),
            Err(TdxError::InvalidAttributes { attributes, .. })
                if attributes & (TDX_TD_ATTRIBUTES_DEBUG | TDX_TD_ATTRIBUTES_MIG | TDX_TD_ATTRIBUTES_PERFMON)
                    == TDX_TD_ATTRIBUTES_DEBUG | TDX_TD_ATTRIBUTES_MIG | TDX_TD_ATTRIBUTES_PERFMON
        ));
        assert!(!vm
            .take_calls()
            .iter()
            .any(|c| matches!(c, Call::TdxInit { .. })));
        assert_eq!(guest.lifecycle(), TdLifecycle::CapabilitiesLoaded);
    }

    #[test]
    fn init_vm_rejects_tsc_frequency() {
        let mut config = test_config();
        config.tsc_khz = Some(1_234_567);
        let (guest, _vm) = guest_with(&config);
        assert!(matches!(
            guest.init_vm(),
            Err(TdxError::InvalidTscFrequency(1_234_567))
        ));
    }

    #[test]
    fn finalize_before_init_fails() {
        let (guest, vm) = test_guest();
        let image = tdvf_image(&test_sections());
        assert!(matches!(
            guest.finalize_with_image(&vcpus(&vm, 1), &mut test_ram(), &image),
            Err(TdxError::NotInitialized)
        ));
    }

    #[test]
    fn finalize_measures_firmware() {
        let (guest, vm) = test_guest();
        guest.init_vm().unwrap();
        let vcpus = vcpus(&vm, 2);
        vm.take_calls();

        let mut memory = test_ram();
        let image = tdvf_image(&test_sections());
        guest
            .finalize_with_image(&vcpus, &mut memory, &image)
            .unwrap();

        assert_eq!(memory.added, vec![(BFV, 0x1000)]);
        assert_eq!(
            vm.take_calls(),
            vec![
                Call::VcpuInit(0, HOB),
                Call::VcpuInit(1, HOB),
                Call::SetMemoryPrivate(BFV, 0x1000, true),
                Call::InitMemRegion {
                    gpa: BFV,
                    size: 0x1000,
                    measure: true
                },
                Call::SetMemoryPrivate(HOB, 0x2000, true),
                Call::InitMemRegion {
                    gpa: HOB,
                    size: 0x2000,
                    measure: false
                },
                Call::SetMemoryPrivate(TEMP, 0x10_0000, true),
                Call::InitMemRegion {
                    gpa: TEMP,
                    size: 0x10_0000,
                    measure: false
                },
                Call::SetMemoryPrivate(0x100_0000, 0x1000, true),
                Call::Finalize,
            ]
        );
        assert_eq!(guest.lifecycle(), TdLifecycle::Finalized);

        let ram: Vec<_> = guest
            .ram_regions()
            .iter()
            .map(|r| (r.address, r.state))
            .collect();
        assert_eq!(
            ram,
            vec![
                (0, RamState::Unaccepted),
                (HOB, RamState::Added),
                (HOB + 0x2000, RamState::Unaccepted),
                (TEMP, RamState::Added),
                (TEMP + 0x10_0000, RamState::Unaccepted),
            ]
        );
    }

    #[test]
    fn incoming_td_defers_finalization() {
        let mut config = test_config();
        config.incoming = true;
        let tdx = config.tdx.as_mut().unwrap();
        tdx.migtd_hash = Sha384([0xab; 48]);
        tdx.vsockport = Some(1234);
        let (guest, vm) = guest_with(&config);

        guest.init_vm().unwrap();
        let calls = vm.take_calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            Call::TdxInit { attributes, post_init: true } if attributes & TDX_TD_ATTRIBUTES_MIG != 0
        )));

        let image = tdvf_image(&test_sections());
        guest
            .finalize_with_image(&vcpus(&vm, 1), &mut test_ram(), &image)
            .unwrap();
        assert_eq!(
            vm.take_calls(),
            vec![
                Call::VcpuInit(0, HOB),
                Call::BindServtd(TdxServtdBinding {
                    attr: DEFAULT_MIGTD_ATTR,
                    target: TdxServtdTarget::Hash([0xab; 48]),
                }),
                Call::SetMigrationInfo(false, 1234),
            ]
        );
        assert_eq!(guest.lifecycle(), TdLifecycle::VcpusCreated);

        guest.migration_import_done().unwrap();
        assert_eq!(vm.take_calls(), vec![Call::EndImport]);
        assert_eq!(guest.lifecycle(), TdLifecycle::Finalized);
    }

    #[test]
    fn migtd_bound_by_pid() {
        let mut config = test_config();
        config.tdx.as_mut().unwrap().migtd_pid = 42;
        let (guest, vm) = guest_with(&config);
        guest.init_vm().unwrap();
        vm.take_calls();

        let image = tdvf_image(&test_sections());
        guest
            .finalize_with_image(&[], &mut test_ram(), &image)
            .unwrap();
        assert_eq!(
            vm.take_calls()[0],
            Call::BindServtd(TdxServtdBinding {
                attr: DEFAULT_MIGTD_ATTR,
                target: TdxServtdTarget::Pid(42),
            })
        );
    }

    #[test]
    fn bad_firmware_layouts() {
        let (guest, _vm) = test_guest();
        guest.init_vm().unwrap();

        let mut sections = test_sections();
        sections[3].address = 0x1_0000_0000;
        assert!(matches!(
            guest.finalize_with_image(&[], &mut test_ram(), &tdvf_image(&sections)),
            Err(TdxError::PermMemOutsideRam(0x1_0000_0000, 0x1000))
        ));

        let mut sections = test_sections();
        sections[2].address = HOB;
        assert!(matches!(
            guest.finalize_with_image(&[], &mut test_ram(), &tdvf_image(&sections)),
            Err(TdxError::RangeConflict(HOB, 0x10_0000))
        ));

        let mut sections = test_sections();
        sections.push(section(TdvfSectionType::PayloadParam, 0x200_0000, 0x1000, (0, 0)));
        assert!(matches!(
            guest.finalize_with_image(&[], &mut test_ram(), &tdvf_image(&sections)),
            Err(TdxError::UnsupportedSection(6))
        ));

        let sections: Vec<_> = test_sections()
            .into_iter()
            .filter(|s| s.section_type() != Some(TdvfSectionType::TdHob))
            .collect();
        assert!(matches!(
            guest.finalize_with_image(&[], &mut test_ram(), &tdvf_image(&sections)),
            Err(TdxError::MissingHob)
        ));
        assert_eq!(guest.lifecycle(), TdLifecycle::VmInitialized);
    }

    #[test]
    fn snapshot_carries_event_notification() {
        let (source, _vm) = test_guest();
        {
            let mut td = source.state.lock().unwrap();
            td.event_notify_vector = 0x40;
            td.event_notify_apic_id = 3;
        }
        assert_eq!(source.id(), TDX_SNAPSHOT_ID);
        let snapshot = source.snapshot().unwrap();
        let state: TdxGuestState = snapshot.to_state().unwrap();
        assert_eq!(state.event_notify_vector, 0x40);
        assert!(state.quotes.is_empty());

        let (destination, _vm) = test_guest();
        destination.restore(&snapshot).unwrap();
        assert_eq!(destination.event_notify(), (3, 0x40));
    }

    #[test]
    fn capability_report_lists_every_word() {
        let (guest, _vm) = test_guest();
        let report = guest.capability_report().unwrap();
        assert_eq!(
            report.features.len(),
            arch::x86_64::tdx::cpuid::FeatureWord::ALL.len()
        );
        assert_eq!(guest.lifecycle(), TdLifecycle::CapabilitiesLoaded);
        serde_json::to_string(&report).unwrap();
    }

    #[test]
    fn premig_state() {
        let (guest, vm) = test_guest();
        assert!(!guest.premig_done());
        vm.premig_done.store(true, Ordering::SeqCst);
        assert!(guest.premig_done());
    }
}
