// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Confidential guest support (CGS) migration.
//!
//! The private memory and state of a confidential guest can't be read by
//! the VMM. The vendor technology exports it in an encrypted form instead.
//! `CgsMigrationBridge` sits between the generic RAM migration code and a
//! vendor implementation of [`CgsMig`], and frames the vendor data so the
//! destination can tell it apart from plain RAM pages.

use std::io;

use anyhow::anyhow;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::stream::MigrationStream;
use crate::MigratableError;

/// Section markers around the vendor state.
pub const CGS_SECTION_START: u8 = 0x20;
pub const CGS_SECTION_END: u8 = 0x21;

/// RAM stream flags carried in the low bits of the page offset word.
pub const RAM_SAVE_FLAG_CONTINUE: u64 = 0x20;
pub const RAM_SAVE_FLAG_CGS_EPOCH: u64 = 0x400;
pub const RAM_SAVE_FLAG_CGS_STATE: u64 = 0x800;
const RAM_SAVE_FLAG_MASK: u64 = 0xfff;

/// Size of the epoch header, a single flag word.
pub const CGS_EPOCH_HEADER_SIZE: usize = 8;

pub type CgsResult<T> = std::result::Result<T, MigratableError>;

/// Confidential computing technology of a VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CgsTechnology {
    #[default]
    None,
    Tdx,
}

bitflags! {
    /// Hooks a vendor actually implements. Any other hook is skipped
    /// without touching the stream.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CgsHooks: u32 {
        const IS_READY = 1 << 0;
        const SAVE_SETUP = 1 << 1;
        const SAVE_START = 1 << 2;
        const SAVE_RAM_START_EPOCH = 1 << 3;
        const SAVE_RAM = 1 << 4;
        const SAVE_PAUSE = 1 << 5;
        const SAVE_END = 1 << 6;
        const SAVE_RAM_ABORT = 1 << 7;
        const SAVE_RAM_CANCEL = 1 << 8;
        const SAVE_CLEANUP = 1 << 9;
        const LOAD_SETUP = 1 << 10;
        const LOAD = 1 << 11;
        const LOAD_CLEANUP = 1 << 12;
        const MULTIFD_SEND_PREPARE = 1 << 13;
        const MULTIFD_RECV_PAGES = 1 << 14;
        const IOV_NUM = 1 << 15;
    }
}

/// A batch of private pages moved through a multifd channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultifdPages {
    pub channel: u32,
    pub gpas: Vec<u64>,
    /// Encrypted page content and the vendor metadata describing it.
    pub data: Vec<u8>,
}

/// Vendor side of confidential guest migration.
///
/// Hooks returning a byte count report how much they wrote to the stream.
/// Every hook defaults to a no-op, `hooks()` tells the bridge which ones are
/// real.
pub trait CgsMig: Send {
    fn hooks(&self) -> CgsHooks;

    /// The vendor is ready for a migration to start.
    fn is_ready(&self) -> bool {
        true
    }

    fn save_setup(&mut self, _nr_channels: u32, _nr_pages: u32) -> CgsResult<()> {
        Ok(())
    }

    fn save_start(&mut self, _stream: &mut dyn MigrationStream) -> CgsResult<()> {
        Ok(())
    }

    fn save_ram_start_epoch(&mut self, _stream: &mut dyn MigrationStream) -> CgsResult<usize> {
        Ok(0)
    }

    fn save_ram(
        &mut self,
        _stream: &mut dyn MigrationStream,
        _channel: u32,
        _gpa: u64,
    ) -> CgsResult<usize> {
        Ok(0)
    }

    fn save_pause(&mut self) -> CgsResult<()> {
        Ok(())
    }

    fn save_end(&mut self, _stream: &mut dyn MigrationStream) -> CgsResult<()> {
        Ok(())
    }

    /// `gfn_end` is the first guest frame that was not migrated yet.
    fn save_ram_abort(&mut self, _gfn_end: u64) -> CgsResult<()> {
        Ok(())
    }

    fn save_ram_cancel(
        &mut self,
        _stream: &mut dyn MigrationStream,
        _gpa: u64,
    ) -> CgsResult<usize> {
        Ok(0)
    }

    fn save_cleanup(&mut self) {}

    fn load_setup(&mut self, _nr_channels: u32, _nr_pages: u32) -> CgsResult<()> {
        Ok(())
    }

    /// Consumes one vendor record from the stream.
    fn load(&mut self, _stream: &mut dyn MigrationStream, _channel: u32) -> CgsResult<()> {
        Ok(())
    }

    fn load_cleanup(&mut self) {}

    fn multifd_send_prepare(&mut self, _pages: &mut MultifdPages) -> CgsResult<()> {
        Ok(())
    }

    fn multifd_recv_pages(&mut self, _pages: &MultifdPages) -> CgsResult<()> {
        Ok(())
    }

    /// Number of I/O vectors needed to send `page_batch_num` pages.
    fn iov_num(&self, page_batch_num: u32) -> u32 {
        page_batch_num
    }
}

/// Header of a private page record in the RAM stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgsPageHeader {
    pub block: String,
    pub offset: u64,
    pub cancel: bool,
}

impl CgsPageHeader {
    /// Reads a page header whose flag word was already consumed. The block
    /// name is only on the wire when it changes.
    pub fn read_after_flags(
        stream: &mut dyn MigrationStream,
        flags_word: u64,
        last_block: Option<&str>,
    ) -> CgsResult<Self> {
        let block = if flags_word & RAM_SAVE_FLAG_CONTINUE != 0 {
            last_block
                .ok_or_else(|| MigratableError::Cgs(anyhow!("Page continues an unknown block")))?
                .to_string()
        } else {
            let len = stream.get_byte() as usize;
            let mut name = vec![0u8; len];
            stream.get_buffer(&mut name);
            String::from_utf8(name)
                .map_err(|e| MigratableError::Cgs(anyhow!("Invalid block name: {}", e)))?
        };
        let cancel = stream.get_byte() != 0;
        stream.check()?;

        Ok(CgsPageHeader {
            block,
            offset: flags_word & !RAM_SAVE_FLAG_MASK,
            cancel,
        })
    }
}

/// Entry points of confidential guest migration used by the RAM migration
/// code. Without a vendor every entry point is a successful no-op.
#[derive(Default)]
pub struct CgsMigrationBridge {
    vendor: Option<Box<dyn CgsMig>>,
    last_block: Option<String>,
}

impl CgsMigrationBridge {
    pub fn new(vendor: Option<Box<dyn CgsMig>>) -> Self {
        CgsMigrationBridge {
            vendor,
            last_block: None,
        }
    }

    pub fn technology_enabled(&self) -> bool {
        self.vendor.is_some()
    }

    fn vendor(&mut self, hook: CgsHooks) -> Option<&mut Box<dyn CgsMig>> {
        self.vendor.as_mut().filter(|v| v.hooks().contains(hook))
    }

    // Vendor failures poison the stream, a half migrated confidential guest
    // can't be resumed on the destination.
    fn check<T>(
        stream: &mut dyn MigrationStream,
        hook: &str,
        r: CgsResult<T>,
    ) -> CgsResult<T> {
        r.map_err(|e| {
            error!("CGS {} failed: {}", hook, e);
            stream.set_error(io::Error::other(format!("CGS {hook} failed")));
            e
        })
    }

    pub fn is_ready(&mut self) -> bool {
        self.vendor(CgsHooks::IS_READY)
            .map(|v| v.is_ready())
            .unwrap_or(true)
    }

    pub fn save_setup(
        &mut self,
        stream: &mut dyn MigrationStream,
        nr_channels: u32,
        nr_pages: u32,
    ) -> CgsResult<()> {
        let Some(v) = self.vendor(CgsHooks::SAVE_SETUP) else {
            return Ok(());
        };
        let r = v.save_setup(nr_channels, nr_pages);
        Self::check(stream, "save_setup", r)
    }

    pub fn save_start(&mut self, stream: &mut dyn MigrationStream) -> CgsResult<()> {
        let Some(v) = self.vendor(CgsHooks::SAVE_START) else {
            return Ok(());
        };
        stream.put_byte(CGS_SECTION_START);
        let r = v.save_start(stream);
        Self::check(stream, "save_start", r)?;
        // Lets the destination start importing right away.
        stream.flush();
        stream.check()
    }

    /// Returns the bytes written, header included.
    pub fn save_ram_start_epoch(&mut self, stream: &mut dyn MigrationStream) -> CgsResult<usize> {
        let Some(v) = self.vendor(CgsHooks::SAVE_RAM_START_EPOCH) else {
            return Ok(0);
        };
        stream.put_be64(RAM_SAVE_FLAG_CGS_EPOCH);
        let r = v.save_ram_start_epoch(stream);
        let n = Self::check(stream, "save_ram_start_epoch", r)?;
        Ok(n + CGS_EPOCH_HEADER_SIZE)
    }

    fn put_page_header(&mut self, stream: &mut dyn MigrationStream, block: &str, offset: u64, cancel: bool) -> usize {
        let mut flags = offset | RAM_SAVE_FLAG_CGS_STATE;
        let same_block = self.last_block.as_deref() == Some(block);
        if same_block {
            flags |= RAM_SAVE_FLAG_CONTINUE;
        }
        stream.put_be64(flags);
        let mut size = 8;
        if !same_block {
            let name = &block.as_bytes()[..block.len().min(u8::MAX as usize)];
            stream.put_byte(name.len() as u8);
            stream.put_buffer(name);
            size += 1 + name.len();
            self.last_block = Some(block.to_string());
        }
        stream.put_byte(cancel as u8);
        size + 1
    }

    /// Sends the private page at `gpa`, found at `offset` in RAM block
    /// `block`. Returns the bytes written, header included.
    pub fn save_ram(
        &mut self,
        stream: &mut dyn MigrationStream,
        channel: u32,
        block: &str,
        offset: u64,
        gpa: u64,
    ) -> CgsResult<usize> {
        if self.vendor(CgsHooks::SAVE_RAM).is_none() {
            return Ok(0);
        }
        let header = self.put_page_header(stream, block, offset, false);
        let r = match self.vendor(CgsHooks::SAVE_RAM) {
            Some(v) => v.save_ram(stream, channel, gpa),
            None => Ok(0),
        };
        let n = Self::check(stream, "save_ram", r)?;
        if n == 0 {
            return Self::check(
                stream,
                "save_ram",
                Err(MigratableError::Cgs(anyhow!("No data exported for {:#x}", gpa))),
            );
        }
        Ok(header + n)
    }

    pub fn save_pause(&mut self, stream: &mut dyn MigrationStream) -> CgsResult<()> {
        let Some(v) = self.vendor(CgsHooks::SAVE_PAUSE) else {
            return Ok(());
        };
        let r = v.save_pause();
        Self::check(stream, "save_pause", r)
    }

    pub fn save_end(&mut self, stream: &mut dyn MigrationStream) -> CgsResult<()> {
        let Some(v) = self.vendor(CgsHooks::SAVE_END) else {
            return Ok(());
        };
        stream.put_byte(CGS_SECTION_END);
        let r = v.save_end(stream);
        Self::check(stream, "save_end", r)
    }

    pub fn save_ram_abort(&mut self, stream: &mut dyn MigrationStream, gfn_end: u64) -> CgsResult<()> {
        let Some(v) = self.vendor(CgsHooks::SAVE_RAM_ABORT) else {
            return Ok(());
        };
        let r = v.save_ram_abort(gfn_end);
        Self::check(stream, "save_ram_abort", r)
    }

    /// Whether pages turned shared after being sent must be cancelled.
    pub fn supports_ram_cancel(&self) -> bool {
        self.vendor
            .as_ref()
            .is_some_and(|v| v.hooks().contains(CgsHooks::SAVE_RAM_CANCEL))
    }

    pub fn save_ram_cancel(
        &mut self,
        stream: &mut dyn MigrationStream,
        block: &str,
        offset: u64,
        gpa: u64,
    ) -> CgsResult<usize> {
        if !self.supports_ram_cancel() {
            return Ok(0);
        }
        let header = self.put_page_header(stream, block, offset, true);
        let r = match self.vendor(CgsHooks::SAVE_RAM_CANCEL) {
            Some(v) => v.save_ram_cancel(stream, gpa),
            None => Ok(0),
        };
        let n = Self::check(stream, "save_ram_cancel", r)?;
        Ok(header + n)
    }

    pub fn save_cleanup(&mut self) {
        self.last_block = None;
        if let Some(v) = self.vendor(CgsHooks::SAVE_CLEANUP) {
            v.save_cleanup();
        }
    }

    pub fn load_setup(
        &mut self,
        stream: &mut dyn MigrationStream,
        nr_channels: u32,
        nr_pages: u32,
    ) -> CgsResult<()> {
        let Some(v) = self.vendor(CgsHooks::LOAD_SETUP) else {
            return Ok(());
        };
        let r = v.load_setup(nr_channels, nr_pages);
        Self::check(stream, "load_setup", r)
    }

    pub fn load(&mut self, stream: &mut dyn MigrationStream, channel: u32) -> CgsResult<()> {
        let Some(v) = self.vendor(CgsHooks::LOAD) else {
            return Ok(());
        };
        let r = v.load(stream, channel);
        Self::check(stream, "load", r)
    }

    pub fn load_cleanup(&mut self) {
        if let Some(v) = self.vendor(CgsHooks::LOAD_CLEANUP) {
            v.load_cleanup();
        }
    }

    pub fn multifd_send_prepare(&mut self, pages: &mut MultifdPages) -> CgsResult<()> {
        match self.vendor(CgsHooks::MULTIFD_SEND_PREPARE) {
            Some(v) => v.multifd_send_prepare(pages),
            None => Ok(()),
        }
    }

    pub fn multifd_recv_pages(&mut self, pages: &MultifdPages) -> CgsResult<()> {
        match self.vendor(CgsHooks::MULTIFD_RECV_PAGES) {
            Some(v) => v.multifd_recv_pages(pages),
            None => Ok(()),
        }
    }

    pub fn iov_num(&mut self, page_batch_num: u32) -> u32 {
        self.vendor(CgsHooks::IOV_NUM)
            .map(|v| v.iov_num(page_batch_num))
            .unwrap_or(page_batch_num)
    }
}
