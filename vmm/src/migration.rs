// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use hypervisor::VmType;
use vm_migration::cgs::{CgsMig, CgsMigrationBridge, CgsTechnology};
use vm_migration::{MigratableError, Snapshot, Snapshottable};

use crate::config::VmConfig;
use crate::tdx::migration::TdxCgsMig;
use crate::tdx::TdxGuest;

pub const SNAPSHOT_STATE_FILE: &str = "state.json";
pub const SNAPSHOT_CONFIG_FILE: &str = "config.json";

pub fn technology_for(vm_type: VmType) -> CgsTechnology {
    match vm_type {
        VmType::Legacy => CgsTechnology::None,
        VmType::Tdx => CgsTechnology::Tdx,
    }
}

/// Bridge between RAM migration and the vendor of `technology`.
pub fn cgs_bridge_for(
    technology: CgsTechnology,
    tdx: Option<&Arc<TdxGuest>>,
) -> Result<CgsMigrationBridge, MigratableError> {
    let vendor: Option<Box<dyn CgsMig>> = match technology {
        CgsTechnology::None => None,
        CgsTechnology::Tdx => {
            let tdx = tdx.ok_or_else(|| MigratableError::Cgs(anyhow!("TD is not created")))?;
            Some(Box::new(TdxCgsMig::new(tdx.clone())))
        }
    };
    Ok(CgsMigrationBridge::new(vendor))
}

pub fn url_to_path(url: &str) -> std::result::Result<PathBuf, MigratableError> {
    let path: PathBuf = url
        .strip_prefix("file://")
        .ok_or_else(|| {
            MigratableError::MigrateSend(anyhow!("Could not extract path from URL: {}", url))
        })
        .map(|s| s.into())?;

    if !path.is_dir() {
        return Err(MigratableError::MigrateSend(anyhow!(
            "Destination is not a directory"
        )));
    }

    Ok(path)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), MigratableError> {
    let file = File::create(path).map_err(|e| MigratableError::MigrateSend(e.into()))?;
    serde_json::to_writer(BufWriter::new(file), value)
        .map_err(|e| MigratableError::MigrateSend(e.into()))
}

/// Writes the configuration and the state of `components` under the
/// `file://` directory `destination_url`.
pub fn send_vm_snapshot(
    destination_url: &str,
    vm_config: &VmConfig,
    components: &[&dyn Snapshottable],
) -> std::result::Result<(), MigratableError> {
    let path = url_to_path(destination_url)?;

    let mut snapshot = Snapshot::default();
    for component in components {
        snapshot.add_snapshot(component.id(), component.snapshot()?);
    }

    write_json(&path.join(SNAPSHOT_CONFIG_FILE), vm_config)?;
    write_json(&path.join(SNAPSHOT_STATE_FILE), &snapshot)
}

pub fn recv_vm_config(source_url: &str) -> std::result::Result<VmConfig, MigratableError> {
    let mut vm_config_path = url_to_path(source_url)?;

    vm_config_path.push(SNAPSHOT_CONFIG_FILE);

    // Try opening the snapshot file
    let vm_config_file =
        File::open(vm_config_path).map_err(|e| MigratableError::MigrateSend(e.into()))?;
    let vm_config_reader = BufReader::new(vm_config_file);
    serde_json::from_reader(vm_config_reader).map_err(|e| MigratableError::MigrateReceive(e.into()))
}

pub fn recv_vm_state(source_url: &str) -> std::result::Result<Snapshot, MigratableError> {
    let mut vm_state_path = url_to_path(source_url)?;

    vm_state_path.push(SNAPSHOT_STATE_FILE);

    // Try opening the snapshot file
    let vm_state_file =
        File::open(vm_state_path).map_err(|e| MigratableError::MigrateSend(e.into()))?;
    let vm_state_reader = BufReader::new(vm_state_file);
    serde_json::from_reader(vm_state_reader).map_err(|e| MigratableError::MigrateReceive(e.into()))
}

/// Restores every component from its section of `snapshot`.
pub fn restore_components(
    snapshot: &Snapshot,
    components: &[&dyn Snapshottable],
) -> std::result::Result<(), MigratableError> {
    for component in components {
        let id = component.id();
        let section = snapshot.snapshots.get(&id).ok_or_else(|| {
            MigratableError::Restore(anyhow!("Could not find {} snapshot section", id))
        })?;
        component.restore(section)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::tdx::tests::{test_config, test_guest};

    #[test]
    fn technology_follows_vm_type() {
        assert_eq!(technology_for(VmType::Legacy), CgsTechnology::None);
        assert_eq!(technology_for(VmType::Tdx), CgsTechnology::Tdx);

        assert!(!cgs_bridge_for(CgsTechnology::None, None)
            .unwrap()
            .technology_enabled());
        assert!(cgs_bridge_for(CgsTechnology::Tdx, None).is_err());
        let (guest, _vm) = test_guest();
        assert!(cgs_bridge_for(CgsTechnology::Tdx, Some(&guest))
            .unwrap()
            .technology_enabled());
    }

    #[test]
    fn snapshot_through_a_directory() {
        let dir = TempDir::new_with_prefix("/tmp/tdx-snapshot").unwrap();
        let url = format!("file://{}", dir.as_path().display());

        let (source, _vm) = test_guest();
        {
            let mut td = source.state.lock().unwrap();
            td.event_notify_vector = 0x41;
            td.event_notify_apic_id = 1;
        }
        let config = test_config();
        send_vm_snapshot(&url, &config, &[source.as_ref()]).unwrap();

        assert_eq!(recv_vm_config(&url).unwrap(), config);
        let snapshot = recv_vm_state(&url).unwrap();

        let (destination, _vm) = test_guest();
        restore_components(&snapshot, &[destination.as_ref()]).unwrap();
        assert_eq!(destination.event_notify(), (1, 0x41));

        assert!(restore_components(&Snapshot::default(), &[destination.as_ref()]).is_err());
        assert!(url_to_path("/tmp").is_err());
        assert!(url_to_path("file:///nonexistent/dir").is_err());
    }
}
