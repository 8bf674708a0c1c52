// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

#[macro_use]
extern crate log;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cgs;
pub mod stream;

#[derive(Error, Debug)]
pub enum MigratableError {
    #[error("Failed to snapshot migratable component: {0}")]
    Snapshot(#[source] anyhow::Error),

    #[error("Failed to restore migratable component: {0}")]
    Restore(#[source] anyhow::Error),

    #[error("Failed to send migratable component snapshot: {0}")]
    MigrateSend(#[source] anyhow::Error),

    #[error("Failed to receive migratable component snapshot: {0}")]
    MigrateReceive(#[source] anyhow::Error),

    #[error("Migration stream error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Confidential guest migration failed: {0}")]
    Cgs(#[source] anyhow::Error),
}

/// A Snapshottable component snapshot section.
///
/// Migratable component can split their migration snapshot into
/// separate sections.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SnapshotData {
    state: String,
}

impl SnapshotData {
    /// Generate the state data from the snapshot data
    pub fn to_state<'a, T>(&'a self) -> Result<T, MigratableError>
    where
        T: Deserialize<'a>,
    {
        serde_json::from_str(&self.state)
            .map_err(|e| MigratableError::Restore(anyhow!("Error deserialising: {}", e)))
    }

    /// Create from state that can be serialized
    pub fn new_from_state<T>(state: &T) -> Result<Self, MigratableError>
    where
        T: Serialize,
    {
        let state = serde_json::to_string(state)
            .map_err(|e| MigratableError::Snapshot(anyhow!("Error serialising: {}", e)))?;

        Ok(SnapshotData { state })
    }
}

/// Data structure to describe snapshot data
///
/// A Snapshottable component's snapshot is a tree of snapshots, where leafs
/// contain the snapshot data. Nodes of this tree track all their children
/// through the snapshots field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Snapshot {
    /// The Snapshottable component snapshots.
    pub snapshots: std::collections::BTreeMap<String, Snapshot>,

    /// The Snapshottable component's snapshot data.
    pub snapshot_data: Option<SnapshotData>,
}

impl Snapshot {
    pub fn from_data(data: SnapshotData) -> Self {
        Snapshot {
            snapshot_data: Some(data),
            ..Default::default()
        }
    }

    /// Create from state that can be serialized
    pub fn new_from_state<T>(state: &T) -> Result<Self, MigratableError>
    where
        T: Serialize,
    {
        Ok(Snapshot::from_data(SnapshotData::new_from_state(state)?))
    }

    /// Add a sub-component's Snapshot to the Snapshot.
    pub fn add_snapshot(&mut self, id: String, snapshot: Snapshot) {
        self.snapshots.insert(id, snapshot);
    }

    /// Generate the state data from the snapshot
    pub fn to_state<'a, T>(&'a self) -> Result<T, MigratableError>
    where
        T: Deserialize<'a>,
    {
        self.snapshot_data
            .as_ref()
            .ok_or_else(|| MigratableError::Restore(anyhow!("Missing snapshot data")))?
            .to_state()
    }
}

/// A snapshottable component can be snapshotted and restored.
///
/// Components are shared with the threads running the guest, so both
/// operations go through `&self`.
pub trait Snapshottable {
    /// The snapshottable component id.
    fn id(&self) -> String {
        String::new()
    }

    /// Take a component snapshot.
    fn snapshot(&self) -> std::result::Result<Snapshot, MigratableError> {
        Ok(Snapshot::default())
    }

    /// Bring the component back to the state of `snapshot`.
    fn restore(&self, _snapshot: &Snapshot) -> std::result::Result<(), MigratableError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct State {
        vector: u8,
        pending: Vec<(u64, u64)>,
    }

    #[test]
    fn snapshot_state_roundtrip() {
        let state = State {
            vector: 0x40,
            pending: vec![(0x1000, 0x2000)],
        };
        let mut root = Snapshot::default();
        root.add_snapshot("tdx".to_string(), Snapshot::new_from_state(&state).unwrap());

        let restored: State = root.snapshots["tdx"].to_state().unwrap();
        assert_eq!(restored, state);
        assert!(matches!(
            root.to_state::<State>(),
            Err(MigratableError::Restore(_))
        ));
    }
}
