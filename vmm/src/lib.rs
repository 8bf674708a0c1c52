// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::io;
use std::sync::Arc;

use hypervisor::{Hypervisor, HypervisorError, VmType};
use thiserror::Error;
use vm_migration::cgs::CgsMigrationBridge;
use vm_migration::stream::MigrationStream;
use vm_migration::MigratableError;

use crate::config::{TdxConfig, ValidationError, VmConfig};
use crate::cpu::CpuManager;
use crate::event_loop::EventLoop;
use crate::memory_manager::MemoryManager;
use crate::run_state::{InvalidTransition, RunState, VmRunState};
use crate::tdx::capabilities::CapabilityReport;
use crate::tdx::{TdLifecycle, TdxError, TdxGuest};

pub mod config;
pub mod cpu;
pub mod event_loop;
pub mod memory_manager;
pub mod migration;
pub mod run_state;
pub mod sync_utils;
pub mod tdx;

pub use arch::GuestMemoryMmap;

/// Errors associated with VMM management
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid VM configuration: {0}")]
    Validation(#[source] ValidationError),
    #[error("Error creating the VM: {0}")]
    VmCreate(#[source] HypervisorError),
    #[error("Error creating the event loop: {0}")]
    EventLoop(#[source] io::Error),
    #[error("Error creating guest memory: {0}")]
    Memory(#[source] memory_manager::Error),
    #[error("TDX error: {0}")]
    Tdx(#[source] TdxError),
    #[error("vCPU error: {0}")]
    Cpu(#[source] cpu::Error),
    #[error("Invalid VM state change: {0}")]
    RunState(#[source] InvalidTransition),
    #[error("Error importing the TD: {0}")]
    Import(#[source] MigratableError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reconciled TDX capabilities of the host for `config`, without building a
/// guest.
pub fn capabilities_report(
    config: &VmConfig,
    hypervisor: Arc<dyn Hypervisor>,
) -> Result<CapabilityReport> {
    let vm = hypervisor.create_vm(VmType::Tdx).map_err(Error::VmCreate)?;
    let mut config = config.clone();
    config
        .tdx
        .get_or_insert_with(|| TdxConfig::new(Default::default()));
    let tdx = TdxGuest::new(
        &config,
        hypervisor,
        vm,
        GuestMemoryMmap::default(),
        arch::get_host_cpu_phys_bits(),
        Arc::new(EventLoop::new().map_err(Error::EventLoop)?),
        Arc::new(RunState::new()),
    )
    .map_err(Error::Tdx)?;
    tdx.capability_report().map_err(Error::Tdx)
}

pub struct Vmm {
    config: VmConfig,
    run_state: Arc<RunState>,
    event_loop: Arc<EventLoop>,
    memory_manager: MemoryManager,
    tdx: Arc<TdxGuest>,
    cpu_manager: CpuManager,
}

impl Vmm {
    pub fn new(config: VmConfig, hypervisor: Arc<dyn Hypervisor>) -> Result<Self> {
        config.validate().map_err(Error::Validation)?;

        let vm = hypervisor.create_vm(VmType::Tdx).map_err(Error::VmCreate)?;
        let memory_manager =
            MemoryManager::new(vm.clone(), config.memory.size, true).map_err(Error::Memory)?;
        let event_loop = Arc::new(EventLoop::new().map_err(Error::EventLoop)?);
        let run_state = Arc::new(RunState::new());

        let tdx = Arc::new(
            TdxGuest::new(
                &config,
                hypervisor,
                vm,
                memory_manager.guest_memory(),
                arch::get_host_cpu_phys_bits(),
                event_loop.clone(),
                run_state.clone(),
            )
            .map_err(Error::Tdx)?,
        );
        let cpu_manager = CpuManager::new(tdx.clone(), run_state.clone(), event_loop.clone());

        Ok(Vmm {
            config,
            run_state,
            event_loop,
            memory_manager,
            tdx,
            cpu_manager,
        })
    }

    pub fn tdx(&self) -> &Arc<TdxGuest> {
        &self.tdx
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn run_state(&self) -> VmRunState {
        self.run_state.get()
    }

    /// Builds the TD and starts its vCPUs. A migration destination is left
    /// waiting for its state instead.
    pub fn boot(&mut self) -> Result<()> {
        self.tdx.init_vm().map_err(Error::Tdx)?;
        let vcpus = self
            .cpu_manager
            .create_boot_vcpus()
            .map_err(Error::Cpu)?
            .to_vec();
        self.tdx
            .finalize(&vcpus, &mut self.memory_manager)
            .map_err(Error::Tdx)?;

        if self.config.incoming {
            self.run_state
                .set(VmRunState::InMigrate)
                .map_err(Error::RunState)?;
            info!("Waiting for the TD state");
            return Ok(());
        }

        self.start()
    }

    fn start(&mut self) -> Result<()> {
        self.run_state
            .set(VmRunState::Running)
            .map_err(Error::RunState)?;
        self.cpu_manager.start_boot_vcpus().map_err(Error::Cpu)
    }

    /// Migration support for this VM.
    pub fn cgs_bridge(&self) -> std::result::Result<CgsMigrationBridge, MigratableError> {
        migration::cgs_bridge_for(
            migration::technology_for(VmType::Tdx),
            Some(&self.tdx),
        )
    }

    /// Imports the TD state from `stream` and starts the vCPUs.
    pub fn receive_migration(&mut self, stream: &mut dyn MigrationStream) -> Result<()> {
        let mut bridge = self.cgs_bridge().map_err(Error::Import)?;
        let nr_vcpus = self.cpu_manager.boot_vcpus();
        bridge
            .load_setup(stream, nr_vcpus, 0)
            .map_err(Error::Import)?;
        let mut r = Ok(());
        while r.is_ok() && self.tdx.lifecycle() != TdLifecycle::Finalized {
            r = bridge.load(stream, 0);
        }
        bridge.load_cleanup();
        r.map_err(Error::Import)?;

        self.start()
    }

    /// Runs the event loop until the guest shuts down.
    pub fn run(&mut self) -> Result<()> {
        let r = self.event_loop.run().map_err(Error::EventLoop);
        if let Err(e) = self.run_state.set(VmRunState::Shutdown) {
            debug!("{}", e);
        }
        self.cpu_manager.shutdown().map_err(Error::Cpu)?;
        r
    }
}
