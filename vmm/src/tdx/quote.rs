// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! TDG.VP.VMCALL<GetQuote>: the TD report found in a shared guest buffer is
//! relayed to the quote generation service, and the quote it returns is
//! written back in place. Requests complete asynchronously from the event
//! loop, the guest learns about it through the buffer header and an
//! optional notification interrupt.

use std::collections::HashMap;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, Socket, Type};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::vmcall::{
    page_aligned, GuestChannel, TDG_VP_VMCALL_ALIGN_ERROR, TDG_VP_VMCALL_INVALID_OPERAND,
    TDG_VP_VMCALL_RETRY, TDG_VP_VMCALL_SUCCESS,
};
use crate::config::QuoteEndpoint;
use crate::event_loop::{EventLoop, TimerId};

pub const TDX_GET_QUOTE_STRUCTURE_VERSION: u64 = 1;

pub const TDX_VP_GET_QUOTE_SUCCESS: u64 = 0;
pub const TDX_VP_GET_QUOTE_IN_FLIGHT: u64 = 0xffff_ffff_ffff_ffff;
pub const TDX_VP_GET_QUOTE_ERROR: u64 = 0x8000_0000_0000_0000;
pub const TDX_VP_GET_QUOTE_QGS_UNAVAILABLE: u64 = 0x8000_0000_0000_0001;

/// Upper bound of the guest buffer and of the request it carries.
pub const TDX_GET_QUOTE_MAX_BUF_LEN: u64 = 128 * 1024;
pub const TDX_MAX_GET_QUOTE_REQUEST: usize = 16;
pub const TDX_GET_QUOTE_TIMEOUT: Duration = Duration::from_secs(30);

// Buffer size assumed for guests passing a zero size.
const LEGACY_GET_QUOTE_BUF_LEN: u64 = 8 * 1024;

const READ_CHUNK: usize = 4096;

/// Header of the shared GetQuote buffer, followed by the message.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct QuoteHeader {
    pub version: u64,
    pub error_code: u64,
    pub in_len: u32,
    pub out_len: u32,
}

pub const QUOTE_HEADER_SIZE: u64 = std::mem::size_of::<QuoteHeader>() as u64;

/// An in-flight request as carried in a snapshot, enough to issue it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct QuoteState {
    pub gpa: u64,
    pub buf_len: u64,
    pub apic_id: u32,
    pub vector: u32,
}

/// Reply bytes that fit in the guest buffer, plus the count of everything
/// the service sent.
#[derive(Debug, Default)]
struct ReplyBuffer {
    data: Vec<u8>,
    capacity: usize,
    total: usize,
}

impl ReplyBuffer {
    fn new(capacity: usize) -> Self {
        ReplyBuffer {
            capacity,
            ..Default::default()
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.capacity.saturating_sub(self.data.len());
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
        self.total += bytes.len();
    }

    fn overflowed(&self) -> bool {
        self.total > self.capacity
    }
}

struct QuoteTask {
    state: QuoteState,
    header: QuoteHeader,
    socket: Socket,
    token: u64,
    timer: Option<TimerId>,
    connected: bool,
    request: Vec<u8>,
    sent: usize,
    reading: bool,
    reply: ReplyBuffer,
}

enum Finish {
    Reply,
    Failed(u64),
    TimedOut,
}

#[derive(Default)]
struct QuoteTasks {
    next_id: u64,
    tasks: HashMap<u64, QuoteTask>,
}

fn connect(endpoint: &QuoteEndpoint) -> io::Result<Socket> {
    let (domain, addr) = match endpoint {
        QuoteEndpoint::Unix(path) => (Domain::UNIX, SockAddr::unix(path)?),
        QuoteEndpoint::Inet(addr) => (Domain::for_address(*addr), SockAddr::from(*addr)),
        QuoteEndpoint::Vsock { cid, port } => (Domain::VSOCK, SockAddr::vsock(*cid, *port)),
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr) {
        Ok(()) => Ok(socket),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(socket),
        Err(e) => Err(e),
    }
}

pub struct QuoteRelay {
    guest: Arc<GuestChannel>,
    event_loop: Arc<EventLoop>,
    endpoint: Option<QuoteEndpoint>,
    legacy_abi: bool,
    timeout: Duration,
    tasks: Mutex<QuoteTasks>,
}

impl QuoteRelay {
    pub fn new(
        guest: Arc<GuestChannel>,
        event_loop: Arc<EventLoop>,
        endpoint: Option<QuoteEndpoint>,
        legacy_abi: bool,
    ) -> Self {
        QuoteRelay {
            guest,
            event_loop,
            endpoint,
            legacy_abi,
            timeout: TDX_GET_QUOTE_TIMEOUT,
            tasks: Mutex::new(QuoteTasks::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.lock().unwrap().tasks.len()
    }

    /// Handles TDG.VP.VMCALL<GetQuote> for the shared buffer at `gpa` of
    /// `size` bytes. Completion is signaled with `vector` on `apic_id`.
    pub fn get_quote(self: &Arc<Self>, gpa: u64, size: u64, apic_id: u32, vector: u32) -> u64 {
        if !self.guest.is_shared(gpa) {
            debug!("TDX: GetQuote buffer {:#x} is not shared", gpa);
            return TDG_VP_VMCALL_INVALID_OPERAND;
        }
        if !page_aligned(gpa) || !page_aligned(size) {
            return TDG_VP_VMCALL_ALIGN_ERROR;
        }

        let buf_len = match size {
            0 if self.legacy_abi => {
                warn!("TDX: guest attestation driver uses the old GetQuote ABI (R13 == 0), please upgrade it");
                LEGACY_GET_QUOTE_BUF_LEN
            }
            0 => return TDG_VP_VMCALL_INVALID_OPERAND,
            size => size,
        };

        self.submit(self.guest.strip_shared(gpa), buf_len, apic_id, vector)
    }

    fn submit(self: &Arc<Self>, gpa: u64, buf_len: u64, apic_id: u32, vector: u32) -> u64 {
        let Ok(mut header) = self.guest.read_obj::<QuoteHeader>(gpa) else {
            return TDG_VP_VMCALL_INVALID_OPERAND;
        };
        if header.version != TDX_GET_QUOTE_STRUCTURE_VERSION {
            debug!("TDX: unsupported GetQuote version {}", header.version);
            return TDG_VP_VMCALL_INVALID_OPERAND;
        }
        // The guest clears it, anything else might be a replay.
        if header.error_code != TDX_VP_GET_QUOTE_SUCCESS
            && header.error_code != TDX_VP_GET_QUOTE_IN_FLIGHT
        {
            debug!("TDX: GetQuote error code {:#x} set by the guest", header.error_code);
            return TDG_VP_VMCALL_INVALID_OPERAND;
        }
        if header.out_len > 0 {
            if !self.legacy_abi {
                return TDG_VP_VMCALL_INVALID_OPERAND;
            }
            warn!("TDX: guest attestation driver uses the old GetQuote format (out_len > 0), please upgrade it");
            if u64::from(header.out_len) + QUOTE_HEADER_SIZE > buf_len {
                return TDG_VP_VMCALL_INVALID_OPERAND;
            }
            header.out_len = 0;
        }

        let in_len = u64::from(header.in_len);
        if buf_len > TDX_GET_QUOTE_MAX_BUF_LEN
            || in_len > TDX_GET_QUOTE_MAX_BUF_LEN
            || in_len + QUOTE_HEADER_SIZE > buf_len
        {
            debug!(
                "TDX: GetQuote sizes out of bounds: buffer {:#x} request {:#x}",
                buf_len, in_len
            );
            return TDG_VP_VMCALL_INVALID_OPERAND;
        }

        header.error_code = TDX_VP_GET_QUOTE_IN_FLIGHT;
        if self.guest.write_obj(gpa, &header).is_err() {
            return TDG_VP_VMCALL_INVALID_OPERAND;
        }

        let state = QuoteState {
            gpa,
            buf_len,
            apic_id,
            vector,
        };
        let mut tasks = self.tasks.lock().unwrap();
        let Some(endpoint) = self.endpoint.as_ref() else {
            return TDG_VP_VMCALL_RETRY;
        };
        if tasks.tasks.len() >= TDX_MAX_GET_QUOTE_REQUEST {
            debug!("TDX: too many GetQuote requests in flight");
            return TDG_VP_VMCALL_RETRY;
        }

        let id = tasks.next_id;
        tasks.next_id += 1;
        match self.start(id, endpoint, state, header) {
            Ok(task) => {
                tasks.tasks.insert(id, task);
            }
            Err(code) => {
                drop(tasks);
                header.error_code = code;
                self.respond(&state, &header);
            }
        }

        TDG_VP_VMCALL_SUCCESS
    }

    fn start(
        self: &Arc<Self>,
        id: u64,
        endpoint: &QuoteEndpoint,
        state: QuoteState,
        header: QuoteHeader,
    ) -> Result<QuoteTask, u64> {
        let mut request = vec![0u8; header.in_len as usize];
        self.guest
            .read(state.gpa + QUOTE_HEADER_SIZE, &mut request)
            .map_err(|_| TDX_VP_GET_QUOTE_ERROR)?;

        let socket = connect(endpoint).map_err(|e| {
            debug!("TDX: failed to connect to {}: {}", endpoint, e);
            TDX_VP_GET_QUOTE_QGS_UNAVAILABLE
        })?;

        let relay = self.clone();
        let token = self
            .event_loop
            .add(
                socket.as_raw_fd(),
                epoll::Events::EPOLLOUT,
                Arc::new(move |events| relay.on_event(id, events)),
            )
            .map_err(|e| {
                error!("TDX: failed to watch the quote generation socket: {}", e);
                TDX_VP_GET_QUOTE_ERROR
            })?;

        let relay = self.clone();
        let timer = self.event_loop.add_timer(
            self.timeout,
            Box::new(move |_| relay.finish(id, Finish::TimedOut)),
        );

        Ok(QuoteTask {
            state,
            // Reported if the service never answers.
            header: QuoteHeader {
                error_code: TDX_VP_GET_QUOTE_ERROR,
                ..header
            },
            socket,
            token,
            timer: Some(timer),
            connected: false,
            request,
            sent: 0,
            reading: false,
            reply: ReplyBuffer::new((state.buf_len - QUOTE_HEADER_SIZE) as usize),
        })
    }

    fn on_event(self: &Arc<Self>, id: u64, events: epoll::Events) {
        let finish = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.tasks.get_mut(&id) else {
                return;
            };
            match self.advance(task, events) {
                Ok(false) => return,
                Ok(true) => Finish::Reply,
                Err(code) => Finish::Failed(code),
            }
        };
        self.finish(id, finish);
    }

    /// Moves the transaction forward, returning true once the whole reply
    /// has been received.
    fn advance(&self, task: &mut QuoteTask, events: epoll::Events) -> Result<bool, u64> {
        let unavailable = |e: io::Error| {
            debug!("TDX: quote generation service failure: {}", e);
            TDX_VP_GET_QUOTE_QGS_UNAVAILABLE
        };

        if !task.connected {
            match task.socket.take_error() {
                Ok(None) => task.connected = true,
                Ok(Some(e)) | Err(e) => return Err(unavailable(e)),
            }
        }

        if !task.reading {
            if !events.intersects(epoll::Events::EPOLLOUT | epoll::Events::EPOLLERR) {
                return Ok(false);
            }
            while task.sent < task.request.len() {
                match task
                    .socket
                    .send_with_flags(&task.request[task.sent..], libc::MSG_NOSIGNAL)
                {
                    Ok(n) => task.sent += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(unavailable(e)),
                }
            }

            task.reading = true;
            task.request = Vec::new();
            self.event_loop
                .modify(task.socket.as_raw_fd(), task.token, epoll::Events::EPOLLIN)
                .map_err(unavailable)?;
            return Ok(false);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match (&task.socket).read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => task.reply.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(unavailable(e)),
            }
        }
    }

    /// Tears the task down and reports to the guest. Only the first caller
    /// for a task finds it.
    fn finish(&self, id: u64, finish: Finish) {
        let Some(mut task) = self.tasks.lock().unwrap().tasks.remove(&id) else {
            return;
        };

        if let Err(e) = self
            .event_loop
            .remove(task.socket.as_raw_fd(), task.token)
        {
            debug!("TDX: failed to stop watching the quote socket: {}", e);
        }
        if let Some(timer) = task.timer.take() {
            self.event_loop.cancel_timer(timer);
        }

        let header = &mut task.header;
        let mut overflow = false;
        match finish {
            Finish::Reply if task.reply.overflowed() => {
                debug!(
                    "TDX: quote of {} bytes does not fit in {} bytes",
                    task.reply.total, task.reply.capacity
                );
                header.error_code = TDX_VP_GET_QUOTE_ERROR;
                header.out_len = u32::try_from(task.reply.total).unwrap_or(u32::MAX);
                overflow = true;
            }
            Finish::Reply => {
                match self
                    .guest
                    .write(task.state.gpa + QUOTE_HEADER_SIZE, &task.reply.data)
                {
                    Ok(()) => {
                        header.error_code = TDX_VP_GET_QUOTE_SUCCESS;
                        header.out_len = task.reply.data.len() as u32;
                    }
                    Err(e) => debug!("TDX: failed to write the quote: {}", e),
                }
            }
            Finish::Failed(code) => header.error_code = code,
            Finish::TimedOut => warn!("TDX: quote generation timed out"),
        }
        if header.error_code != TDX_VP_GET_QUOTE_SUCCESS && !overflow {
            header.out_len = 0;
        }

        self.respond(&task.state, &task.header);
    }

    fn respond(&self, state: &QuoteState, header: &QuoteHeader) {
        if self.guest.write_obj(state.gpa, header).is_err() {
            error!("TDX: failed to update GetQuote header");
        }
        self.guest.notify(state.apic_id, state.vector);
    }

    /// The requests in flight, to be issued again after a migration.
    pub fn snapshot_tasks(&self) -> Vec<QuoteState> {
        let tasks = self.tasks.lock().unwrap();
        let mut states: Vec<QuoteState> = tasks.tasks.values().map(|t| t.state).collect();
        states.sort_by_key(|s| s.gpa);
        states
    }

    /// Issues migrated requests against the local quote generation service.
    pub fn restart(self: &Arc<Self>, states: &[QuoteState]) {
        for state in states {
            let status = self.submit(state.gpa, state.buf_len, state.apic_id, state.vector);
            if status != TDG_VP_VMCALL_SUCCESS {
                warn!(
                    "TDX: failed to restart GetQuote at {:#x}: status {:#x}",
                    state.gpa, status
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::time::Instant;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::tdx::tests::{test_channel, Call, MockVm};

    const BUF: u64 = 0x10_0000;
    const PAGE: u64 = 0x1000;

    struct Fixture {
        vm: Arc<MockVm>,
        guest: Arc<GuestChannel>,
        event_loop: Arc<EventLoop>,
        relay: Arc<QuoteRelay>,
        _dir: TempDir,
        path: PathBuf,
    }

    fn fixture_with(endpoint: Option<bool>, legacy_abi: bool, timeout: Duration) -> Fixture {
        let (guest, vm) = test_channel();
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let dir = TempDir::new_with_prefix("/tmp/quote").unwrap();
        let path = dir.as_path().join("qgs.sock");
        // Some(false) points to a socket nobody listens on.
        let endpoint = endpoint.map(|_| QuoteEndpoint::Unix(path.clone()));
        let relay = Arc::new(
            QuoteRelay::new(guest.clone(), event_loop.clone(), endpoint, legacy_abi)
                .with_timeout(timeout),
        );
        Fixture {
            vm,
            guest,
            event_loop,
            relay,
            _dir: dir,
            path,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Some(true), true, TDX_GET_QUOTE_TIMEOUT)
    }

    impl Fixture {
        fn write_request(&self, gpa: u64, message: &[u8]) {
            let header = QuoteHeader {
                version: TDX_GET_QUOTE_STRUCTURE_VERSION,
                error_code: 0,
                in_len: message.len() as u32,
                out_len: 0,
            };
            self.guest.write_obj(gpa, &header).unwrap();
            self.guest.write(gpa + QUOTE_HEADER_SIZE, message).unwrap();
        }

        fn get_quote(&self, gpa: u64, size: u64) -> u64 {
            self.relay
                .get_quote(gpa | self.guest.shared_bit(), size, 2, 0x30)
        }

        fn header(&self, gpa: u64) -> QuoteHeader {
            self.guest.read_obj(gpa).unwrap()
        }

        fn run_until_idle(&self) {
            let start = Instant::now();
            while self.relay.in_flight() > 0 && start.elapsed() < Duration::from_secs(10) {
                self.event_loop
                    .run_once(Some(Duration::from_millis(10)))
                    .unwrap();
            }
            assert_eq!(self.relay.in_flight(), 0);
        }
    }

    // Answers one request with `reply` and returns what it received.
    fn serve_once(listener: UnixListener, expected: usize, reply: Vec<u8>) -> std::thread::JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = vec![0u8; expected];
            stream.read_exact(&mut request).unwrap();
            stream.write_all(&reply).unwrap();
            request
        })
    }

    #[test]
    fn quote_round_trip() {
        let f = fixture();
        let listener = UnixListener::bind(&f.path).unwrap();
        let server = serve_once(listener, 5, b"signed quote".to_vec());

        f.write_request(BUF, b"hello");
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_SUCCESS);
        assert_eq!(f.header(BUF).error_code, TDX_VP_GET_QUOTE_IN_FLIGHT);
        f.run_until_idle();

        assert_eq!(server.join().unwrap(), b"hello");
        let header = f.header(BUF);
        assert_eq!(header.error_code, TDX_VP_GET_QUOTE_SUCCESS);
        assert_eq!(header.out_len, 12);
        let mut quote = [0u8; 12];
        f.guest.read(BUF + QUOTE_HEADER_SIZE, &mut quote).unwrap();
        assert_eq!(&quote, b"signed quote");
        assert_eq!(
            f.vm.take_calls(),
            vec![Call::SignalMsi(hypervisor::MsiMessage::fixed(2, 0x30))]
        );
    }

    #[test]
    fn oversized_reply_reports_its_size() {
        let f = fixture();
        let listener = UnixListener::bind(&f.path).unwrap();
        let capacity = (PAGE - QUOTE_HEADER_SIZE) as usize;
        let server = serve_once(listener, 4, vec![0x5a; capacity + 300]);

        f.write_request(BUF, b"ping");
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_SUCCESS);
        f.run_until_idle();
        server.join().unwrap();

        let header = f.header(BUF);
        assert_eq!(header.error_code, TDX_VP_GET_QUOTE_ERROR);
        assert_eq!(header.out_len as usize, capacity + 300);
        // Nothing was copied.
        let mut message = [0u8; 4];
        f.guest.read(BUF + QUOTE_HEADER_SIZE, &mut message).unwrap();
        assert_eq!(&message, b"ping");
    }

    #[test]
    fn admission_is_bounded() {
        let f = fixture();
        // Connections queue up in the backlog, nobody answers.
        let _listener = UnixListener::bind(&f.path).unwrap();

        for i in 0..TDX_MAX_GET_QUOTE_REQUEST as u64 {
            f.write_request(BUF + i * PAGE, b"report");
            assert_eq!(f.get_quote(BUF + i * PAGE, PAGE), TDG_VP_VMCALL_SUCCESS);
        }
        let last = BUF + TDX_MAX_GET_QUOTE_REQUEST as u64 * PAGE;
        f.write_request(last, b"report");
        assert_eq!(f.get_quote(last, PAGE), TDG_VP_VMCALL_RETRY);
        assert_eq!(f.relay.in_flight(), TDX_MAX_GET_QUOTE_REQUEST);
        // The guest may retry with the buffer as it is.
        assert_eq!(f.header(last).error_code, TDX_VP_GET_QUOTE_IN_FLIGHT);

        let states = f.relay.snapshot_tasks();
        assert_eq!(states.len(), TDX_MAX_GET_QUOTE_REQUEST);
        assert_eq!(
            states[0],
            QuoteState {
                gpa: BUF,
                buf_len: PAGE,
                apic_id: 2,
                vector: 0x30
            }
        );
    }

    #[test]
    fn unavailable_service() {
        let f = fixture_with(Some(false), true, TDX_GET_QUOTE_TIMEOUT);
        f.write_request(BUF, b"report");
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_SUCCESS);
        f.run_until_idle();

        let header = f.header(BUF);
        assert_eq!(header.error_code, TDX_VP_GET_QUOTE_QGS_UNAVAILABLE);
        assert_eq!(header.out_len, 0);
        assert_eq!(f.vm.take_calls().len(), 1);
    }

    #[test]
    fn stalled_service_times_out() {
        let f = fixture_with(Some(true), true, Duration::from_millis(50));
        let _listener = UnixListener::bind(&f.path).unwrap();

        f.write_request(BUF, b"report");
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_SUCCESS);
        f.run_until_idle();

        let header = f.header(BUF);
        assert_eq!(header.error_code, TDX_VP_GET_QUOTE_ERROR);
        assert_eq!(header.out_len, 0);
        assert_eq!(f.vm.take_calls().len(), 1);
    }

    #[test]
    fn request_validation() {
        let f = fixture_with(None, true, TDX_GET_QUOTE_TIMEOUT);
        f.write_request(BUF, b"report");

        // Private buffer.
        assert_eq!(f.relay.get_quote(BUF, PAGE, 0, 0), TDG_VP_VMCALL_INVALID_OPERAND);
        assert_eq!(f.get_quote(BUF + 0x10, PAGE), TDG_VP_VMCALL_ALIGN_ERROR);
        assert_eq!(f.get_quote(BUF, 0x800), TDG_VP_VMCALL_ALIGN_ERROR);
        assert_eq!(
            f.get_quote(BUF, TDX_GET_QUOTE_MAX_BUF_LEN + PAGE),
            TDG_VP_VMCALL_INVALID_OPERAND
        );

        let mut header = f.header(BUF);
        header.version = 2;
        f.guest.write_obj(BUF, &header).unwrap();
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_INVALID_OPERAND);

        header.version = TDX_GET_QUOTE_STRUCTURE_VERSION;
        header.error_code = TDX_VP_GET_QUOTE_ERROR;
        f.guest.write_obj(BUF, &header).unwrap();
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_INVALID_OPERAND);

        header.error_code = 0;
        header.in_len = PAGE as u32;
        f.guest.write_obj(BUF, &header).unwrap();
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_INVALID_OPERAND);

        // Valid, but there is no service to relay to.
        f.write_request(BUF, b"report");
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_RETRY);
        assert_eq!(f.relay.in_flight(), 0);
        assert!(f.vm.take_calls().is_empty());
    }

    #[test]
    fn legacy_guest_abi() {
        let f = fixture_with(None, true, TDX_GET_QUOTE_TIMEOUT);
        f.write_request(BUF, b"report");
        // A zero size stands for two pages.
        assert_eq!(f.get_quote(BUF, 0), TDG_VP_VMCALL_RETRY);

        let mut header = f.header(BUF);
        header.out_len = 0x100;
        f.guest.write_obj(BUF, &header).unwrap();
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_RETRY);
        assert_eq!(f.header(BUF).out_len, 0);

        header.out_len = PAGE as u32;
        f.guest.write_obj(BUF, &header).unwrap();
        assert_eq!(f.get_quote(BUF, PAGE), TDG_VP_VMCALL_INVALID_OPERAND);

        let strict = fixture_with(None, false, TDX_GET_QUOTE_TIMEOUT);
        strict.write_request(BUF, b"report");
        assert_eq!(strict.get_quote(BUF, 0), TDG_VP_VMCALL_INVALID_OPERAND);
        let mut header = strict.header(BUF);
        header.out_len = 0x100;
        strict.guest.write_obj(BUF, &header).unwrap();
        assert_eq!(strict.get_quote(BUF, PAGE), TDG_VP_VMCALL_INVALID_OPERAND);
    }

    #[test]
    fn restart_reissues_requests() {
        let f = fixture();
        let listener = UnixListener::bind(&f.path).unwrap();
        let server = serve_once(listener, 6, b"quote".to_vec());

        // Left in flight by the migration source.
        f.write_request(BUF, b"report");
        let mut header = f.header(BUF);
        header.error_code = TDX_VP_GET_QUOTE_IN_FLIGHT;
        f.guest.write_obj(BUF, &header).unwrap();

        f.relay.restart(&[QuoteState {
            gpa: BUF,
            buf_len: PAGE,
            apic_id: 2,
            vector: 0x30,
        }]);
        assert_eq!(f.relay.in_flight(), 1);
        f.run_until_idle();

        assert_eq!(server.join().unwrap(), b"report");
        assert_eq!(f.header(BUF).error_code, TDX_VP_GET_QUOTE_SUCCESS);
        assert_eq!(f.header(BUF).out_len, 5);
    }

    #[test]
    fn reply_buffer_counts_discarded_bytes() {
        let mut reply = ReplyBuffer::new(8);
        reply.push(b"12345");
        reply.push(b"67890");
        assert_eq!(reply.data, b"12345678");
        assert_eq!(reply.total, 10);
        assert!(reply.overflowed());
    }
}
