// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! TDX backend of confidential guest migration.
//!
//! Every piece of TD state crosses the stream as a record:
//!
//! ```text
//! kind (u8) | index (be32) | nr_gpas (be32) | gpa (be64) * nr_gpas | len (be32) | data
//! ```
//!
//! The data is the encrypted blob produced by the TDX module, which the
//! destination hands back to its own TDX module untouched.

use std::sync::Arc;

use anyhow::anyhow;
use hypervisor::{HypervisorVmError, TdxMigrationState, Vm};
use vm_migration::cgs::{CgsHooks, CgsMig, CgsResult, MultifdPages};
use vm_migration::stream::MigrationStream;
use vm_migration::MigratableError;

use super::vmcall::TDX_PAGE_SIZE;
use super::TdxGuest;

/// Room for the non memory state: TD scope metadata and one vCPU.
const TDX_MIG_STATE_BUF_SIZE: usize = 64 << 10;
/// Per page room: the page and its MAC/GPA list entry.
const TDX_MIG_PAGE_RECORD_SIZE: usize = TDX_PAGE_SIZE as usize + 64;
/// Largest page batch accepted from the wire.
const TDX_MIG_MAX_BATCH_PAGES: u32 = 512;
const TDX_MIG_MAX_RECORD_SIZE: u32 = 16 << 20;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordKind {
    TdImmutable = 0,
    TdMutable = 1,
    Vcpu = 2,
    Epoch = 3,
    Pages = 4,
    Cancel = 5,
    End = 6,
}

impl TryFrom<u8> for RecordKind {
    type Error = MigratableError;

    fn try_from(v: u8) -> CgsResult<Self> {
        Ok(match v {
            0 => RecordKind::TdImmutable,
            1 => RecordKind::TdMutable,
            2 => RecordKind::Vcpu,
            3 => RecordKind::Epoch,
            4 => RecordKind::Pages,
            5 => RecordKind::Cancel,
            6 => RecordKind::End,
            _ => return Err(MigratableError::Cgs(anyhow!("Unknown TDX record {}", v))),
        })
    }
}

struct Record {
    kind: RecordKind,
    index: u32,
    gpas: Vec<u64>,
    data: Vec<u8>,
}

fn tdx_error(what: &str, e: HypervisorVmError) -> MigratableError {
    MigratableError::Cgs(anyhow::Error::new(e).context(format!("TDX {what} failed")))
}

fn write_record(
    stream: &mut dyn MigrationStream,
    kind: RecordKind,
    index: u32,
    gpas: &[u64],
    data: &[u8],
) -> usize {
    stream.put_byte(kind as u8);
    stream.put_be32(index);
    stream.put_be32(gpas.len() as u32);
    for gpa in gpas {
        stream.put_be64(*gpa);
    }
    stream.put_be32(data.len() as u32);
    stream.put_buffer(data);
    1 + 4 + 4 + 8 * gpas.len() + 4 + data.len()
}

fn read_record(stream: &mut dyn MigrationStream) -> CgsResult<Record> {
    let kind = stream.get_byte();
    let index = stream.get_be32();
    let nr_gpas = stream.get_be32();
    stream.check()?;
    let kind = RecordKind::try_from(kind)?;
    if nr_gpas > TDX_MIG_MAX_BATCH_PAGES {
        return Err(MigratableError::Cgs(anyhow!(
            "TDX record with {} pages",
            nr_gpas
        )));
    }

    let gpas = (0..nr_gpas).map(|_| stream.get_be64()).collect();
    let len = stream.get_be32();
    stream.check()?;
    if len > TDX_MIG_MAX_RECORD_SIZE {
        return Err(MigratableError::Cgs(anyhow!(
            "TDX record of {} bytes",
            len
        )));
    }
    let mut data = vec![0u8; len as usize];
    stream.get_buffer(&mut data);
    stream.check()?;

    Ok(Record {
        kind,
        index,
        gpas,
        data,
    })
}

pub struct TdxCgsMig {
    guest: Arc<TdxGuest>,
    vm: Arc<dyn Vm>,
    nr_vcpus: u32,
    buf: Vec<u8>,
}

impl TdxCgsMig {
    pub fn new(guest: Arc<TdxGuest>) -> Self {
        TdxCgsMig {
            vm: guest.vm().clone(),
            nr_vcpus: guest.boot_vcpus(),
            guest,
            buf: Vec::new(),
        }
    }

    fn export(&mut self, state: TdxMigrationState, channel: u32, gpas: &[u64]) -> CgsResult<&[u8]> {
        let needed = TDX_MIG_STATE_BUF_SIZE.max(gpas.len() * TDX_MIG_PAGE_RECORD_SIZE);
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }
        let n = self
            .vm
            .tdx_export_state(state, channel, gpas, &mut self.buf)
            .map_err(|e| tdx_error("export", e))?;
        Ok(&self.buf[..n])
    }

    fn export_record(
        &mut self,
        stream: &mut dyn MigrationStream,
        kind: RecordKind,
        state: TdxMigrationState,
        channel: u32,
        gpas: &[u64],
    ) -> CgsResult<usize> {
        let index = match state {
            TdxMigrationState::Vcpu(index) => index,
            _ => 0,
        };
        let data = self.export(state, channel, gpas)?;
        let n = write_record(stream, kind, index, gpas, data);
        stream.check()?;
        Ok(n)
    }

    fn import(
        &self,
        state: TdxMigrationState,
        channel: u32,
        gpas: &[u64],
        data: &[u8],
    ) -> CgsResult<()> {
        self.vm
            .tdx_import_state(state, channel, gpas, data)
            .map_err(|e| tdx_error("import", e))
    }
}

impl CgsMig for TdxCgsMig {
    fn hooks(&self) -> CgsHooks {
        CgsHooks::all()
    }

    fn is_ready(&self) -> bool {
        let ready = self.guest.premig_done();
        if !ready {
            debug!("MigTD pre-migration not done yet");
        }
        ready
    }

    fn save_setup(&mut self, nr_channels: u32, nr_pages: u32) -> CgsResult<()> {
        info!(
            "TDX export with {} channels of {} pages",
            nr_channels, nr_pages
        );
        let size = TDX_MIG_STATE_BUF_SIZE.max(nr_pages as usize * TDX_MIG_PAGE_RECORD_SIZE);
        self.buf = vec![0u8; size];
        Ok(())
    }

    fn save_start(&mut self, stream: &mut dyn MigrationStream) -> CgsResult<()> {
        self.export_record(
            stream,
            RecordKind::TdImmutable,
            TdxMigrationState::TdImmutable,
            0,
            &[],
        )?;
        Ok(())
    }

    fn save_ram_start_epoch(&mut self, stream: &mut dyn MigrationStream) -> CgsResult<usize> {
        self.export_record(
            stream,
            RecordKind::Epoch,
            TdxMigrationState::EpochToken,
            0,
            &[],
        )
    }

    fn save_ram(
        &mut self,
        stream: &mut dyn MigrationStream,
        channel: u32,
        gpa: u64,
    ) -> CgsResult<usize> {
        self.export_record(
            stream,
            RecordKind::Pages,
            TdxMigrationState::PrivatePages,
            channel,
            &[gpa],
        )
    }

    fn save_pause(&mut self) -> CgsResult<()> {
        self.vm
            .tdx_pause_export()
            .map_err(|e| tdx_error("pause", e))
    }

    fn save_end(&mut self, stream: &mut dyn MigrationStream) -> CgsResult<()> {
        self.export_record(
            stream,
            RecordKind::TdMutable,
            TdxMigrationState::TdMutable,
            0,
            &[],
        )?;
        for index in 0..self.nr_vcpus {
            self.export_record(
                stream,
                RecordKind::Vcpu,
                TdxMigrationState::Vcpu(index),
                0,
                &[],
            )?;
        }
        write_record(stream, RecordKind::End, 0, &[], &[]);
        stream.check()
    }

    fn save_ram_abort(&mut self, gfn_end: u64) -> CgsResult<()> {
        warn!("TDX export aborted at gfn {:#x}", gfn_end);
        self.vm
            .tdx_abort_export(gfn_end)
            .map_err(|e| tdx_error("abort", e))
    }

    fn save_ram_cancel(
        &mut self,
        stream: &mut dyn MigrationStream,
        gpa: u64,
    ) -> CgsResult<usize> {
        self.vm
            .tdx_cancel_pages(0, &[gpa])
            .map_err(|e| tdx_error("cancel", e))?;
        let n = write_record(stream, RecordKind::Cancel, 0, &[gpa], &[]);
        stream.check()?;
        Ok(n)
    }

    fn save_cleanup(&mut self) {
        self.buf = Vec::new();
    }

    fn load_setup(&mut self, nr_channels: u32, nr_pages: u32) -> CgsResult<()> {
        info!(
            "TDX import with {} channels of {} pages",
            nr_channels, nr_pages
        );
        Ok(())
    }

    fn load(&mut self, stream: &mut dyn MigrationStream, channel: u32) -> CgsResult<()> {
        let record = read_record(stream)?;
        let state = match record.kind {
            RecordKind::TdImmutable => TdxMigrationState::TdImmutable,
            RecordKind::TdMutable => TdxMigrationState::TdMutable,
            RecordKind::Vcpu => TdxMigrationState::Vcpu(record.index),
            RecordKind::Epoch => TdxMigrationState::EpochToken,
            RecordKind::Pages => TdxMigrationState::PrivatePages,
            RecordKind::Cancel => {
                return self
                    .vm
                    .tdx_cancel_pages(channel, &record.gpas)
                    .map_err(|e| tdx_error("cancel", e));
            }
            RecordKind::End => {
                return self
                    .guest
                    .migration_import_done()
                    .map_err(|e| MigratableError::Cgs(e.into()));
            }
        };
        self.import(state, channel, &record.gpas, &record.data)
    }

    fn load_cleanup(&mut self) {}

    fn multifd_send_prepare(&mut self, pages: &mut MultifdPages) -> CgsResult<()> {
        let gpas = std::mem::take(&mut pages.gpas);
        let r = self
            .export(TdxMigrationState::PrivatePages, pages.channel, &gpas)
            .map(|data| data.to_vec());
        pages.gpas = gpas;
        pages.data = r?;
        Ok(())
    }

    fn multifd_recv_pages(&mut self, pages: &MultifdPages) -> CgsResult<()> {
        self.import(
            TdxMigrationState::PrivatePages,
            pages.channel,
            &pages.gpas,
            &pages.data,
        )
    }

    // The page content plus one vector for the module metadata.
    fn iov_num(&self, page_batch_num: u32) -> u32 {
        page_batch_num + 1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use vm_migration::cgs::CgsMigrationBridge;
    use vm_migration::stream::BufferStream;

    use super::*;
    use crate::tdx::tests::{guest_with, test_config, test_guest, Call, MockVm};
    use crate::tdx::TdLifecycle;

    #[test]
    fn export_import() {
        let mut config = test_config();
        config.cpus.boot_vcpus = 2;
        let (source, src_vm) = guest_with(&config);
        let mut mig = TdxCgsMig::new(source);
        let mut s = BufferStream::buffer();

        mig.save_setup(1, 64).unwrap();
        mig.save_start(&mut s).unwrap();
        assert!(mig.save_ram_start_epoch(&mut s).unwrap() > 0);
        assert!(mig.save_ram(&mut s, 0, 0x10_0000).unwrap() > 0);
        mig.save_ram_cancel(&mut s, 0x10_0000).unwrap();
        mig.save_pause().unwrap();
        mig.save_end(&mut s).unwrap();
        mig.save_cleanup();

        assert_eq!(
            src_vm.take_calls(),
            vec![
                Call::Export(TdxMigrationState::TdImmutable, vec![]),
                Call::Export(TdxMigrationState::EpochToken, vec![]),
                Call::Export(TdxMigrationState::PrivatePages, vec![0x10_0000]),
                Call::CancelPages(vec![0x10_0000]),
                Call::PauseExport,
                Call::Export(TdxMigrationState::TdMutable, vec![]),
                Call::Export(TdxMigrationState::Vcpu(0), vec![]),
                Call::Export(TdxMigrationState::Vcpu(1), vec![]),
            ]
        );

        let mut config = test_config();
        config.incoming = true;
        let (destination, dst_vm) = guest_with(&config);
        let mut mig = TdxCgsMig::new(destination.clone());
        let mut s = BufferStream::reader(s.data().to_vec());
        mig.load_setup(1, 64).unwrap();
        for _ in 0..8 {
            mig.load(&mut s, 0).unwrap();
        }
        mig.load_cleanup();

        let blob = MockVm::exported;
        assert_eq!(
            dst_vm.take_calls(),
            vec![
                Call::Import(
                    TdxMigrationState::TdImmutable,
                    vec![],
                    blob(TdxMigrationState::TdImmutable, &[])
                ),
                Call::Import(
                    TdxMigrationState::EpochToken,
                    vec![],
                    blob(TdxMigrationState::EpochToken, &[])
                ),
                Call::Import(
                    TdxMigrationState::PrivatePages,
                    vec![0x10_0000],
                    blob(TdxMigrationState::PrivatePages, &[0x10_0000])
                ),
                Call::CancelPages(vec![0x10_0000]),
                Call::Import(
                    TdxMigrationState::TdMutable,
                    vec![],
                    blob(TdxMigrationState::TdMutable, &[])
                ),
                Call::Import(
                    TdxMigrationState::Vcpu(0),
                    vec![],
                    blob(TdxMigrationState::Vcpu(0), &[])
                ),
                Call::Import(
                    TdxMigrationState::Vcpu(1),
                    vec![],
                    blob(TdxMigrationState::Vcpu(1), &[])
                ),
                Call::EndImport,
            ]
        );
        assert_eq!(destination.lifecycle(), TdLifecycle::Finalized);
    }

    #[test]
    fn through_the_bridge() {
        let (source, src_vm) = test_guest();
        let mut bridge = CgsMigrationBridge::new(Some(Box::new(TdxCgsMig::new(source))));
        assert!(!bridge.is_ready());
        src_vm.premig_done.store(true, Ordering::SeqCst);
        assert!(bridge.is_ready());
        assert!(bridge.supports_ram_cancel());
        assert_eq!(bridge.iov_num(16), 17);

        let mut s = BufferStream::buffer();
        bridge.save_setup(&mut s, 1, 16).unwrap();
        bridge.save_start(&mut s).unwrap();
        bridge.save_end(&mut s).unwrap();
        assert!(s.error().is_none());
        assert_eq!(src_vm.take_calls().len(), 3);
    }

    #[test]
    fn multifd_pages() {
        let (source, src_vm) = test_guest();
        let mut mig = TdxCgsMig::new(source);
        let mut pages = MultifdPages {
            channel: 2,
            gpas: vec![0x1000, 0x2000],
            data: Vec::new(),
        };
        mig.multifd_send_prepare(&mut pages).unwrap();
        assert_eq!(pages.gpas, vec![0x1000, 0x2000]);
        assert_eq!(
            pages.data,
            MockVm::exported(TdxMigrationState::PrivatePages, &[0x1000, 0x2000])
        );
        src_vm.take_calls();

        let (destination, dst_vm) = test_guest();
        let mut mig = TdxCgsMig::new(destination);
        mig.multifd_recv_pages(&pages).unwrap();
        assert_eq!(
            dst_vm.take_calls(),
            vec![Call::Import(
                TdxMigrationState::PrivatePages,
                vec![0x1000, 0x2000],
                pages.data.clone()
            )]
        );
    }

    #[test]
    fn corrupt_records() {
        let (guest, vm) = test_guest();
        let mut mig = TdxCgsMig::new(guest);

        let mut s = BufferStream::reader(vec![9, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(mig.load(&mut s, 0).is_err());

        let mut s = BufferStream::buffer();
        s.put_byte(RecordKind::Pages as u8);
        s.put_be32(0);
        s.put_be32(TDX_MIG_MAX_BATCH_PAGES + 1);
        let mut s = BufferStream::reader(s.data().to_vec());
        assert!(mig.load(&mut s, 0).is_err());

        let mut s = BufferStream::buffer();
        s.put_byte(RecordKind::TdMutable as u8);
        s.put_be32(0);
        s.put_be32(0);
        s.put_be32(100);
        s.put_buffer(&[1, 2, 3]);
        let mut s = BufferStream::reader(s.data().to_vec());
        assert!(mig.load(&mut s, 0).is_err());

        assert!(vm.take_calls().is_empty());
    }
}
