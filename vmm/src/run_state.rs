// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum VmRunState {
    Created,
    Running,
    Paused,
    /// Waiting for the state sent by a migration source.
    InMigrate,
    Shutdown,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid VM state transition: {0:?} to {1:?}")]
pub struct InvalidTransition(pub VmRunState, pub VmRunState);

impl VmRunState {
    fn valid_transition(self, new_state: VmRunState) -> Result<(), InvalidTransition> {
        use VmRunState::*;
        match (self, new_state) {
            (Created, Running | InMigrate | Shutdown)
            | (InMigrate, Running | Shutdown)
            | (Running, Paused | Shutdown)
            | (Paused, Running | Shutdown) => Ok(()),
            _ => Err(InvalidTransition(self, new_state)),
        }
    }
}

/// Shared run state, read by asynchronous requests that must give up when
/// the VM stops.
#[derive(Debug)]
pub struct RunState(Mutex<VmRunState>);

impl RunState {
    pub fn new() -> Self {
        RunState(Mutex::new(VmRunState::Created))
    }

    pub fn get(&self) -> VmRunState {
        *self.0.lock().unwrap()
    }

    pub fn set(&self, new_state: VmRunState) -> Result<(), InvalidTransition> {
        let mut state = self.0.lock().unwrap();
        if *state == new_state {
            return Ok(());
        }
        state.valid_transition(new_state)?;
        info!("VM state {:?} -> {:?}", *state, new_state);
        *state = new_state;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.get() == VmRunState::Running
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
