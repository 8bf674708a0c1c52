// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::io;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use hypervisor::{HypervisorCpuError, HypervisorVmError, VmExit};
use libc::{c_void, siginfo_t};
use thiserror::Error;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use crate::event_loop::EventLoop;
use crate::run_state::{RunState, VmRunState};
use crate::tdx::TdxGuest;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error creating vCPU {0}: {1}")]
    VcpuCreate(u32, #[source] HypervisorVmError),
    #[error("Error running vCPU: {0}")]
    VcpuRun(#[source] HypervisorCpuError),
    #[error("Error handling TDG.VP.VMCALL: {0}")]
    VmCall(#[source] HypervisorCpuError),
    #[error("Error converting memory on a fault: {0}")]
    ConvertMemory(#[source] HypervisorVmError),
    #[error("Error spawning vCPU thread: {0}")]
    VcpuSpawn(#[source] io::Error),
    #[error("Error joining vCPU thread")]
    ThreadCleanup,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A vCPU of the TD and the state its exits are handled against.
pub struct Vcpu {
    vcpu: Arc<dyn hypervisor::Vcpu>,
    id: u32,
    tdx: Arc<TdxGuest>,
}

impl Vcpu {
    pub fn new(id: u32, vcpu: Arc<dyn hypervisor::Vcpu>, tdx: Arc<TdxGuest>) -> Self {
        Vcpu { vcpu, id, tdx }
    }

    /// Runs the vCPU until it exits. Returns false when the guest asked to
    /// shut down or reset.
    pub fn run(&self) -> Result<bool> {
        match self.vcpu.run().map_err(Error::VcpuRun)? {
            VmExit::Ignore => Ok(true),
            VmExit::Tdx => {
                self.tdx
                    .handle_vmcall(self.vcpu.as_ref(), self.id)
                    .map_err(Error::VmCall)?;
                Ok(true)
            }
            VmExit::MemoryFault { gpa, size, private } => {
                debug!(
                    "vCPU {} memory fault {:#x}+{:#x} private {}",
                    self.id, gpa, size, private
                );
                self.tdx
                    .vm()
                    .set_memory_private(gpa, size, private)
                    .map_err(Error::ConvertMemory)?;
                Ok(true)
            }
            // A TD can't be reset in place, both end the VM.
            VmExit::Reset | VmExit::Shutdown => Ok(false),
        }
    }
}

#[derive(Default)]
struct VcpuState {
    handle: Option<thread::JoinHandle<()>>,
}

impl VcpuState {
    fn signal_thread(&self) {
        if let Some(handle) = self.handle.as_ref() {
            // SAFETY: the thread is alive until joined, and SIGRTMIN has a
            // no-op handler installed by the thread itself.
            unsafe {
                libc::pthread_kill(handle.as_pthread_t(), SIGRTMIN());
            }
        }
    }

    fn join_thread(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| Error::ThreadCleanup)?
        }

        Ok(())
    }

    fn unpark_thread(&self) {
        if let Some(handle) = self.handle.as_ref() {
            handle.thread().unpark()
        }
    }
}

pub struct CpuManager {
    tdx: Arc<TdxGuest>,
    boot_vcpus: u32,
    vcpus: Vec<Arc<dyn hypervisor::Vcpu>>,
    vcpus_kill_signalled: Arc<AtomicBool>,
    vcpus_pause_signalled: Arc<AtomicBool>,
    vcpu_states: Vec<VcpuState>,
    run_state: Arc<RunState>,
    event_loop: Arc<EventLoop>,
}

impl CpuManager {
    pub fn new(tdx: Arc<TdxGuest>, run_state: Arc<RunState>, event_loop: Arc<EventLoop>) -> Self {
        CpuManager {
            boot_vcpus: tdx.boot_vcpus(),
            tdx,
            vcpus: Vec::new(),
            vcpus_kill_signalled: Arc::new(AtomicBool::new(false)),
            vcpus_pause_signalled: Arc::new(AtomicBool::new(false)),
            vcpu_states: Vec::new(),
            run_state,
            event_loop,
        }
    }

    /// Creates the boot vCPUs. Their APIC ids are their indices.
    pub fn create_boot_vcpus(&mut self) -> Result<&[Arc<dyn hypervisor::Vcpu>]> {
        for id in self.vcpus.len() as u32..self.boot_vcpus {
            let vcpu = self
                .tdx
                .vm()
                .create_vcpu(id)
                .map_err(|e| Error::VcpuCreate(id, e))?;
            self.vcpus.push(vcpu);
        }
        Ok(&self.vcpus)
    }

    pub fn vcpus(&self) -> &[Arc<dyn hypervisor::Vcpu>] {
        &self.vcpus
    }

    // Shutdown is the only way out of a running TD.
    fn vcpu_exited(run_state: &RunState, event_loop: &EventLoop) {
        if let Err(e) = run_state.set(VmRunState::Shutdown) {
            debug!("{}", e);
        }
        event_loop.exit();
    }

    /// Starts a thread per vCPU. Blocks until all of them are running.
    pub fn start_boot_vcpus(&mut self) -> Result<()> {
        let vcpu_thread_barrier = Arc::new(Barrier::new(self.vcpus.len() + 1));

        for (id, hypervisor_vcpu) in self.vcpus.iter().enumerate() {
            let vcpu = Vcpu::new(id as u32, hypervisor_vcpu.clone(), self.tdx.clone());
            let vcpu_thread_barrier = vcpu_thread_barrier.clone();
            let vcpu_kill_signalled = self.vcpus_kill_signalled.clone();
            let vcpu_pause_signalled = self.vcpus_pause_signalled.clone();
            let run_state = self.run_state.clone();
            let event_loop = self.event_loop.clone();

            let handle = thread::Builder::new()
                .name(format!("vcpu{id}"))
                .spawn(move || {
                    extern "C" fn handle_signal(_: i32, _: *mut siginfo_t, _: *mut c_void) {}
                    // This uses an async signal safe handler to kick the vCPU out of KVM_RUN.
                    let registered = register_signal_handler(SIGRTMIN(), handle_signal);

                    // Block until all CPUs are ready.
                    vcpu_thread_barrier.wait();

                    if let Err(e) = registered {
                        error!("Failed to register vCPU signal handler: {}", e);
                        Self::vcpu_exited(&run_state, &event_loop);
                        return;
                    }

                    loop {
                        match vcpu.run() {
                            Err(e) => {
                                error!("vCPU {} generated error: {}", id, e);
                                Self::vcpu_exited(&run_state, &event_loop);
                                break;
                            }
                            Ok(true) => {}
                            Ok(false) => {
                                info!("vCPU {} requested shutdown", id);
                                Self::vcpu_exited(&run_state, &event_loop);
                                break;
                            }
                        }

                        // We've been told to terminate
                        if vcpu_kill_signalled.load(Ordering::SeqCst) {
                            break;
                        }

                        // park() may return spuriously.
                        while vcpu_pause_signalled.load(Ordering::SeqCst) {
                            thread::park();
                        }
                    }
                })
                .map_err(Error::VcpuSpawn)?;

            self.vcpu_states.push(VcpuState {
                handle: Some(handle),
            });
        }

        // Unblock all CPU threads.
        vcpu_thread_barrier.wait();
        Ok(())
    }

    pub fn pause(&self) {
        self.vcpus_pause_signalled.store(true, Ordering::SeqCst);
        for state in self.vcpu_states.iter() {
            state.signal_thread();
        }
    }

    pub fn resume(&self) {
        self.vcpus_pause_signalled.store(false, Ordering::SeqCst);
        for state in self.vcpu_states.iter() {
            state.unpark_thread();
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        // Tell the vCPUs to stop themselves next time they go through the loop
        self.vcpus_kill_signalled.store(true, Ordering::SeqCst);
        self.vcpus_pause_signalled.store(false, Ordering::SeqCst);

        for state in self.vcpu_states.iter() {
            state.signal_thread();
            state.unpark_thread();
        }

        for mut state in self.vcpu_states.drain(..) {
            state.join_thread()?;
        }

        Ok(())
    }

    pub fn boot_vcpus(&self) -> u32 {
        self.boot_vcpus
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use hypervisor::{TdxExitDetails, Vm};

    use super::*;
    use crate::tdx::tests::{guest_with, test_config, test_guest, Call};
    use crate::tdx::vmcall::{TDG_VP_VMCALL_SETUP_EVENT_NOTIFY_INTERRUPT, TDG_VP_VMCALL_SUCCESS};

    #[test]
    fn vcpu_exits() {
        let (guest, vm) = test_guest();
        let hypervisor_vcpu = vm.create_vcpu(2).unwrap();
        let mock = vm.vcpus.lock().unwrap()[0].clone();
        let vcpu = Vcpu::new(2, hypervisor_vcpu, guest.clone());

        // Exits pop from the back.
        *mock.exits.lock().unwrap() = vec![
            VmExit::Reset,
            VmExit::Tdx,
            VmExit::MemoryFault {
                gpa: 0x20_0000,
                size: 0x1000,
                private: false,
            },
            VmExit::Ignore,
        ];
        *mock.details.lock().unwrap() = TdxExitDetails {
            subfunction: TDG_VP_VMCALL_SETUP_EVENT_NOTIFY_INTERRUPT,
            in_r12: 0x30,
            ..Default::default()
        };

        assert!(vcpu.run().unwrap());
        assert!(vcpu.run().unwrap());
        assert!(vcpu.run().unwrap());
        assert!(!vcpu.run().unwrap());
        assert_eq!(
            vm.take_calls(),
            vec![
                Call::SetMemoryPrivate(0x20_0000, 0x1000, false),
                Call::SetTdxStatus(2, TDG_VP_VMCALL_SUCCESS),
            ]
        );
        assert_eq!(guest.event_notify(), (2, 0x30));
    }

    #[test]
    fn shutdown_stops_the_vm() {
        let mut config = test_config();
        config.cpus.boot_vcpus = 2;
        let (guest, vm) = guest_with(&config);
        let run_state = Arc::new(RunState::new());
        run_state.set(VmRunState::Running).unwrap();
        let event_loop = Arc::new(EventLoop::new().unwrap());

        let mut cpu_manager = CpuManager::new(guest, run_state.clone(), event_loop.clone());
        assert_eq!(cpu_manager.create_boot_vcpus().unwrap().len(), 2);
        assert_eq!(vm.vcpus.lock().unwrap().len(), 2);

        // Mock vCPUs shut down on their first run.
        cpu_manager.start_boot_vcpus().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !event_loop.exiting() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(event_loop.exiting());
        cpu_manager.shutdown().unwrap();
        assert_eq!(run_state.get(), VmRunState::Shutdown);
    }

    #[test]
    fn paused_vcpus_resume() {
        let (guest, vm) = test_guest();
        let run_state = Arc::new(RunState::new());
        run_state.set(VmRunState::Running).unwrap();
        let event_loop = Arc::new(EventLoop::new().unwrap());

        let mut cpu_manager = CpuManager::new(guest, run_state.clone(), event_loop.clone());
        cpu_manager.create_boot_vcpus().unwrap();
        let mock = vm.vcpus.lock().unwrap()[0].clone();
        *mock.exits.lock().unwrap() = vec![VmExit::Ignore; 3];

        // Paused vCPUs park after their first exit.
        cpu_manager.pause();
        cpu_manager.start_boot_vcpus().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mock.exits.lock().unwrap().len(), 2);
        assert!(!event_loop.exiting());

        cpu_manager.resume();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !event_loop.exiting() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(mock.exits.lock().unwrap().is_empty());
        assert_eq!(run_state.get(), VmRunState::Shutdown);
        cpu_manager.shutdown().unwrap();
    }
}
