// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The TDG.VP.VMCALL<Service> dispatcher.
//!
//! A request is a pair of shared buffers, each starting with a
//! `ServiceHeader`. Requests are routed by GUID to a registered handler,
//! which completes them synchronously or later from the event loop. The
//! request records live in a slab and are addressed through generation
//! checked handles, so a late timer or socket callback can't reach a
//! recycled record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::vmcall::{
    page_aligned, valid_notify_vector, GuestChannel, TDG_VP_VMCALL_INVALID_OPERAND,
    TDG_VP_VMCALL_SUCCESS,
};
use crate::event_loop::{EventLoop, TimerId};
use crate::run_state::RunState;
use crate::sync_utils::Gate;

pub const VMCALL_SERVICE_SUCCESS: u32 = 0;
pub const VMCALL_SERVICE_DEVICE_ERROR: u32 = 1;
pub const VMCALL_SERVICE_TIME_OUT: u32 = 2;
pub const VMCALL_SERVICE_RSP_BUF_TOO_SMALL: u32 = 3;
pub const VMCALL_SERVICE_BAD_CMD_BUF_SIZE: u32 = 4;
pub const VMCALL_SERVICE_BAD_RSP_BUF_SIZE: u32 = 5;
pub const VMCALL_SERVICE_BUSY: u32 = 6;
pub const VMCALL_SERVICE_INVALID_OPERAND: u32 = 7;
pub const VMCALL_SERVICE_OUT_OF_RESOURCE: u32 = 8;
pub const VMCALL_SERVICE_NOT_SUPPORT: u32 = 0xffff_fffe;

/// Answers whether a service GUID is handled by this host.
pub const VMCALL_SERVICE_QUERY_GUID: Uuid = Uuid::from_u128(0xfb6fc5e1_3378_4acb_8964_fa5ee43b9c8a);

// Slice of the blocking wait, between two checks of the VM state.
const BLOCKING_WAIT_SLICE: Duration = Duration::from_millis(100);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ServiceHeader {
    /// Buffer length, header included.
    pub length: u32,
    pub guid: [u8; 16],
    pub status: u32,
}

pub const SERVICE_HEADER_SIZE: usize = std::mem::size_of::<ServiceHeader>();

impl ServiceHeader {
    pub fn guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.guid)
    }

    fn data_len(&self) -> usize {
        self.length as usize - SERVICE_HEADER_SIZE
    }
}

/// A service implementation. `handle` runs on the calling vCPU thread; the
/// request can be completed there or kept and completed later.
pub trait VmcallServiceHandler: Send + Sync {
    fn handle(&self, service: &Arc<VmcallService>, item: ItemHandle);
}

pub type TimeoutHandler = Arc<dyn Fn(&Arc<VmcallService>, ItemHandle) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ItemHandle {
    index: usize,
    generation: u64,
}

struct DataCache {
    gpa: u64,
    header: ServiceHeader,
    /// Never shrinks, reused by the next request of the slot.
    buf: Vec<u8>,
    len: usize,
}

impl DataCache {
    fn new(gpa: u64, header: ServiceHeader, mut buf: Vec<u8>, len: usize) -> Self {
        if buf.len() < len {
            buf.resize(len, 0);
        }
        DataCache {
            gpa,
            header,
            buf,
            len,
        }
    }

    fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

struct ServiceItem {
    refs: u32,
    cmd: DataCache,
    rsp: DataCache,
    /// Response buffer capacity, as given by the guest.
    rsp_capacity: usize,
    apic_id: u32,
    vector: u32,
    timeout_ms: u64,
    completed: bool,
    gate: Arc<Gate>,
    timer: Option<TimerId>,
    timeout_handler: Option<TimeoutHandler>,
    extra: Vec<u8>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    item: Option<ServiceItem>,
    spare: (Vec<u8>, Vec<u8>),
}

#[derive(Default)]
struct Slab {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Slab {
    fn insert(&mut self, make: impl FnOnce(Vec<u8>, Vec<u8>) -> ServiceItem) -> ItemHandle {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        });
        let slot = &mut self.slots[index];
        let (cmd, rsp) = std::mem::take(&mut slot.spare);
        slot.item = Some(make(cmd, rsp));
        ItemHandle {
            index,
            generation: slot.generation,
        }
    }

    fn get_mut(&mut self, h: ItemHandle) -> Option<&mut ServiceItem> {
        self.slots
            .get_mut(h.index)
            .filter(|s| s.generation == h.generation)
            .and_then(|s| s.item.as_mut())
    }

    /// Drops one reference, freeing the record with the last one.
    fn release(&mut self, h: ItemHandle) {
        let Some(item) = self.get_mut(h) else {
            return;
        };
        item.refs -= 1;
        if item.refs > 0 {
            return;
        }

        let slot = &mut self.slots[h.index];
        if let Some(item) = slot.item.take() {
            debug_assert!(item.timer.is_none());
            slot.spare = (item.cmd.buf, item.rsp.buf);
        }
        slot.generation += 1;
        self.free.push(h.index);
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.item.is_some()).count()
    }
}

struct HandlerEntry {
    handler: Arc<dyn VmcallServiceHandler>,
    extra_size: usize,
}

pub struct VmcallService {
    guest: Arc<GuestChannel>,
    event_loop: Arc<EventLoop>,
    run_state: Arc<RunState>,
    handlers: Mutex<HashMap<Uuid, HandlerEntry>>,
    items: Mutex<Slab>,
}

impl VmcallService {
    pub fn new(
        guest: Arc<GuestChannel>,
        event_loop: Arc<EventLoop>,
        run_state: Arc<RunState>,
    ) -> Arc<Self> {
        let service = Arc::new(VmcallService {
            guest,
            event_loop,
            run_state,
            handlers: Mutex::new(HashMap::new()),
            items: Mutex::new(Slab::default()),
        });
        service.register(VMCALL_SERVICE_QUERY_GUID, Arc::new(QueryHandler), 0);
        service
    }

    /// Routes requests for `guid` to `handler`. Every request record gets
    /// `extra_size` bytes of handler private storage.
    pub fn register(
        &self,
        guid: Uuid,
        handler: Arc<dyn VmcallServiceHandler>,
        extra_size: usize,
    ) {
        debug!("TDX: registering vmcall service {}", guid);
        self.handlers
            .lock()
            .unwrap()
            .insert(guid, HandlerEntry { handler, extra_size });
    }

    pub fn unregister(&self, guid: &Uuid) -> bool {
        self.handlers.lock().unwrap().remove(guid).is_some()
    }

    pub fn is_registered(&self, guid: &Uuid) -> bool {
        self.handlers.lock().unwrap().contains_key(guid)
    }

    fn read_header(&self, gpa: u64) -> Option<ServiceHeader> {
        self.guest.read_obj::<ServiceHeader>(gpa).ok()
    }

    fn sane_request(&self, cmd: u64, rsp: u64, vector: u64) -> Option<(ServiceHeader, ServiceHeader)> {
        if !self.guest.is_shared(cmd) || !self.guest.is_shared(rsp) {
            debug!("TDX: service buffers {:#x} {:#x} are not shared", cmd, rsp);
            return None;
        }
        if !page_aligned(cmd) || !page_aligned(rsp) {
            debug!("TDX: service buffers {:#x} {:#x} are not aligned", cmd, rsp);
            return None;
        }

        let cmd_header = self.read_header(cmd)?;
        let rsp_header = self.read_header(rsp)?;
        if (cmd_header.length as usize) < SERVICE_HEADER_SIZE
            || (rsp_header.length as usize) < SERVICE_HEADER_SIZE
        {
            debug!(
                "TDX: service buffer lengths {} {} below the header size",
                cmd_header.length, rsp_header.length
            );
            return None;
        }
        if cmd_header.guid != rsp_header.guid {
            debug!(
                "TDX: service GUID mismatch {} {}",
                cmd_header.guid(),
                rsp_header.guid()
            );
            return None;
        }
        if vector != 0 && !u32::try_from(vector).is_ok_and(valid_notify_vector) {
            debug!("TDX: invalid service notification vector {}", vector);
            return None;
        }

        Some((cmd_header, rsp_header))
    }

    // Answers without creating a record.
    fn respond_header(&self, rsp: u64, mut header: ServiceHeader, status: u32, apic_id: u32, vector: u32) {
        header.length = SERVICE_HEADER_SIZE as u32;
        header.status = status;
        if let Err(e) = self.guest.write_obj(rsp, &header) {
            debug!("TDX: failed to write service response header: {}", e);
        }
        self.guest.notify(apic_id, vector);
    }

    fn read_data(&self, gpa: u64, len: usize) -> Option<Vec<u8>> {
        let start = gpa + SERVICE_HEADER_SIZE as u64;
        if !self.guest.check_range(start, len) {
            return None;
        }
        let mut data = vec![0u8; len];
        self.guest.read(start, &mut data).ok()?;
        Some(data)
    }

    /// Handles TDG.VP.VMCALL<Service>. `cmd` and `rsp` are the buffer
    /// addresses, `vector` the completion notification (0 to block the
    /// vCPU until completion) and `timeout` in milliseconds.
    pub fn dispatch(
        self: &Arc<Self>,
        cmd: u64,
        rsp: u64,
        vector: u64,
        timeout: u64,
        apic_id: u32,
    ) -> u64 {
        let Some((cmd_header, rsp_header)) = self.sane_request(cmd, rsp, vector) else {
            return TDG_VP_VMCALL_INVALID_OPERAND;
        };
        let vector = vector as u32;

        let entry = self
            .handlers
            .lock()
            .unwrap()
            .get(&cmd_header.guid())
            .map(|e| (e.handler.clone(), e.extra_size));
        let Some((handler, extra_size)) = entry else {
            debug!("TDX: unsupported vmcall service {}", cmd_header.guid());
            self.respond_header(rsp, rsp_header, VMCALL_SERVICE_NOT_SUPPORT, apic_id, vector);
            return TDG_VP_VMCALL_SUCCESS;
        };

        let cmd_len = cmd_header.data_len();
        let rsp_len = rsp_header.data_len();
        let (Some(cmd_data), Some(rsp_data)) =
            (self.read_data(cmd, cmd_len), self.read_data(rsp, rsp_len))
        else {
            self.respond_header(rsp, rsp_header, VMCALL_SERVICE_OUT_OF_RESOURCE, apic_id, vector);
            return TDG_VP_VMCALL_SUCCESS;
        };

        let gate = Arc::new(Gate::new());
        let h = self.items.lock().unwrap().insert(|cmd_buf, rsp_buf| {
            let mut cmd_cache = DataCache::new(cmd, cmd_header, cmd_buf, cmd_len);
            cmd_cache.buf[..cmd_len].copy_from_slice(&cmd_data);
            let mut rsp_cache = DataCache::new(rsp, rsp_header, rsp_buf, rsp_len);
            rsp_cache.buf[..rsp_len].copy_from_slice(&rsp_data);
            // Nothing to send back until the handler says so.
            rsp_cache.len = 0;
            ServiceItem {
                refs: 1,
                cmd: cmd_cache,
                rsp: rsp_cache,
                rsp_capacity: rsp_len,
                apic_id,
                vector,
                timeout_ms: timeout,
                completed: false,
                gate: gate.clone(),
                timer: None,
                timeout_handler: None,
                extra: vec![0; extra_size],
            }
        });

        handler.handle(self, h);

        if vector == 0 {
            while !gate.wait_timeout(BLOCKING_WAIT_SLICE) {
                if !self.run_state.is_running() {
                    debug!("TDX: VM stopped, giving up on vmcall service request");
                    self.set_status(h, VMCALL_SERVICE_BUSY);
                    self.complete(h);
                    break;
                }
            }
        }

        self.items.lock().unwrap().release(h);
        TDG_VP_VMCALL_SUCCESS
    }

    fn with_item<R>(&self, h: ItemHandle, f: impl FnOnce(&mut ServiceItem) -> R) -> Option<R> {
        self.items.lock().unwrap().get_mut(h).map(f)
    }

    pub fn cmd_data(&self, h: ItemHandle) -> Option<Vec<u8>> {
        self.with_item(h, |item| item.cmd.data().to_vec())
    }

    pub fn cmd_size(&self, h: ItemHandle) -> usize {
        self.with_item(h, |item| item.cmd.len).unwrap_or(0)
    }

    /// Capacity of the response buffer.
    pub fn rsp_size(&self, h: ItemHandle) -> usize {
        self.with_item(h, |item| item.rsp_capacity).unwrap_or(0)
    }

    /// Sets the response. A response larger than the guest buffer turns
    /// into RSP_BUF_TOO_SMALL carrying the needed size.
    pub fn set_rsp_data(&self, h: ItemHandle, data: &[u8]) -> bool {
        self.with_item(h, |item| {
            if data.len() > item.rsp_capacity {
                item.rsp.header.status = VMCALL_SERVICE_RSP_BUF_TOO_SMALL;
                item.rsp.len = data.len();
                return false;
            }
            item.rsp.buf[..data.len()].copy_from_slice(data);
            item.rsp.len = data.len();
            true
        })
        .unwrap_or(false)
    }

    pub fn set_rsp_size(&self, h: ItemHandle, len: usize) {
        self.with_item(h, |item| item.rsp.len = len);
    }

    pub fn set_status(&self, h: ItemHandle, status: u32) {
        self.with_item(h, |item| item.rsp.header.status = status);
    }

    pub fn with_extra<R>(&self, h: ItemHandle, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.with_item(h, |item| f(&mut item.extra))
    }

    /// Takes a reference, for handlers completing later.
    pub fn hold(&self, h: ItemHandle) -> bool {
        self.with_item(h, |item| item.refs += 1).is_some()
    }

    pub fn release(&self, h: ItemHandle) {
        self.items.lock().unwrap().release(h)
    }

    /// Arms (or re-arms) the request timeout with `handler`, or disarms it
    /// with `None`. Nothing happens when the guest gave no timeout. The
    /// armed timer holds a reference on the record.
    pub fn set_timeout_handler(self: &Arc<Self>, h: ItemHandle, handler: Option<TimeoutHandler>) {
        let mut items = self.items.lock().unwrap();
        let Some(item) = items.get_mut(h) else {
            return;
        };
        if item.timeout_ms == 0 {
            return;
        }

        match handler {
            Some(handler) => {
                if item.completed {
                    return;
                }
                // A timer already popped by the loop releases its own
                // reference, the new one needs another.
                let reused = item
                    .timer
                    .take()
                    .is_some_and(|id| self.event_loop.cancel_timer(id));
                if !reused {
                    item.refs += 1;
                }
                item.timeout_handler = Some(handler);

                let service = self.clone();
                let id = self.event_loop.add_timer(
                    Duration::from_millis(item.timeout_ms),
                    Box::new(move |id| service.timeout_fired(h, id)),
                );
                item.timer = Some(id);
            }
            None => {
                item.timeout_handler = None;
                if let Some(id) = item.timer.take() {
                    if self.event_loop.cancel_timer(id) {
                        items.release(h);
                    }
                }
            }
        }
    }

    fn timeout_fired(self: &Arc<Self>, h: ItemHandle, id: TimerId) {
        let handler = {
            let mut items = self.items.lock().unwrap();
            let Some(item) = items.get_mut(h) else {
                return;
            };
            // Disarmed or re-armed while the loop was popping it. A re-armed
            // timer holds its own reference.
            if item.timer != Some(id) {
                items.release(h);
                return;
            }
            item.timer = None;
            item.timeout_handler.take()
        };

        debug!("TDX: vmcall service request timed out");
        if let Some(handler) = handler {
            handler(self, h);
        }
        self.set_status(h, VMCALL_SERVICE_TIME_OUT);
        self.complete(h);
        self.items.lock().unwrap().release(h);
    }

    /// Writes the response back, notifies the guest and wakes a blocked
    /// vCPU. Only the first call on a request has an effect.
    pub fn complete(self: &Arc<Self>, h: ItemHandle) {
        let (rsp_gpa, header, data, apic_id, vector, gate) = {
            let mut items = self.items.lock().unwrap();
            let Some(item) = items.get_mut(h) else {
                return;
            };
            if item.completed {
                return;
            }
            item.completed = true;

            let mut header = item.rsp.header;
            if item.rsp.len > item.rsp_capacity {
                header.status = VMCALL_SERVICE_RSP_BUF_TOO_SMALL;
            }
            header.length = (SERVICE_HEADER_SIZE + item.rsp.len) as u32;
            let data = (header.status != VMCALL_SERVICE_RSP_BUF_TOO_SMALL)
                .then(|| item.rsp.data().to_vec());
            (
                item.rsp.gpa,
                header,
                data,
                item.apic_id,
                item.vector,
                item.gate.clone(),
            )
        };

        if let Err(e) = self.guest.write_obj(rsp_gpa, &header) {
            debug!("TDX: failed to write service response header: {}", e);
        }
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            if let Err(e) = self
                .guest
                .write(rsp_gpa + SERVICE_HEADER_SIZE as u64, &data)
            {
                debug!("TDX: failed to write service response: {}", e);
            }
        }
        self.guest.notify(apic_id, vector);
        gate.open();

        self.set_timeout_handler(h, None);
    }

    /// Requests currently alive.
    pub fn live_items(&self) -> usize {
        self.items.lock().unwrap().live()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct QueryCommand {
    version: u8,
    command: u8,
    reserved: u16,
    guid: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct QueryResponse {
    version: u8,
    command: u8,
    reserved: u16,
    guid: [u8; 16],
    status: u32,
}

const QUERY_VERSION: u8 = 0;
const QUERY_COMMAND: u8 = 0;
const QUERY_SUPPORTED: u32 = 0;
const QUERY_UNSUPPORTED: u32 = 1;

struct QueryHandler;

impl VmcallServiceHandler for QueryHandler {
    fn handle(&self, service: &Arc<VmcallService>, item: ItemHandle) {
        let data = service.cmd_data(item).unwrap_or_default();
        let query = match QueryCommand::read_from_prefix(&data) {
            Ok((query, _)) if query.version == QUERY_VERSION && query.command == QUERY_COMMAND => {
                query
            }
            Ok(_) => {
                service.set_status(item, VMCALL_SERVICE_INVALID_OPERAND);
                service.complete(item);
                return;
            }
            Err(_) => {
                service.set_status(item, VMCALL_SERVICE_BAD_CMD_BUF_SIZE);
                service.complete(item);
                return;
            }
        };

        let supported = service.is_registered(&Uuid::from_bytes_le(query.guid));
        let response = QueryResponse {
            version: QUERY_VERSION,
            command: QUERY_COMMAND,
            reserved: 0,
            guid: query.guid,
            status: if supported {
                QUERY_SUPPORTED
            } else {
                QUERY_UNSUPPORTED
            },
        };
        if service.set_rsp_data(item, response.as_bytes()) {
            service.set_status(item, VMCALL_SERVICE_SUCCESS);
        }
        service.complete(item);
    }
}
