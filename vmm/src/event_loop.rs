// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The control plane's single event loop: file descriptor readiness
//! handlers and one shot timers, dispatched from one thread.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

pub type EventHandler = Arc<dyn Fn(epoll::Events) + Send + Sync>;
/// Timer callbacks get the id `add_timer` returned for them.
pub type TimerCallback = Box<dyn FnOnce(TimerId) + Send>;

const WAKE_TOKEN: u64 = 0;
const EXIT_TOKEN: u64 = 1;
const FIRST_HANDLER_TOKEN: u64 = 2;
const MAX_EVENTS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
struct Timers {
    next_id: u64,
    pending: BTreeMap<(Instant, u64), TimerCallback>,
    deadlines: HashMap<u64, Instant>,
}

impl Timers {
    fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, TimerCallback)> {
        let key = *self.pending.keys().next().filter(|(d, _)| *d <= now)?;
        self.deadlines.remove(&key.1);
        self.pending.remove(&key).map(|callback| (TimerId(key.1), callback))
    }
}

pub struct EventLoop {
    epoll_fd: RawFd,
    handlers: Mutex<HashMap<u64, EventHandler>>,
    next_token: AtomicU64,
    timers: Mutex<Timers>,
    wake_evt: EventFd,
    exit_evt: EventFd,
    exiting: AtomicBool,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = epoll::create(true)?;
        let event_loop = EventLoop {
            epoll_fd,
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(FIRST_HANDLER_TOKEN),
            timers: Mutex::new(Timers::default()),
            wake_evt: EventFd::new(EFD_NONBLOCK)?,
            exit_evt: EventFd::new(EFD_NONBLOCK)?,
            exiting: AtomicBool::new(false),
        };

        event_loop.ctl(
            epoll::ControlOptions::EPOLL_CTL_ADD,
            event_loop.wake_evt.as_raw_fd(),
            epoll::Events::EPOLLIN,
            WAKE_TOKEN,
        )?;
        event_loop.ctl(
            epoll::ControlOptions::EPOLL_CTL_ADD,
            event_loop.exit_evt.as_raw_fd(),
            epoll::Events::EPOLLIN,
            EXIT_TOKEN,
        )?;

        Ok(event_loop)
    }

    fn ctl(
        &self,
        op: epoll::ControlOptions,
        fd: RawFd,
        events: epoll::Events,
        token: u64,
    ) -> io::Result<()> {
        epoll::ctl(self.epoll_fd, op, fd, epoll::Event::new(events, token))
    }

    /// Starts watching `fd`. The returned token identifies the registration.
    pub fn add(&self, fd: RawFd, events: epoll::Events, handler: EventHandler) -> io::Result<u64> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap().insert(token, handler);
        if let Err(e) = self.ctl(epoll::ControlOptions::EPOLL_CTL_ADD, fd, events, token) {
            self.handlers.lock().unwrap().remove(&token);
            return Err(e);
        }
        Ok(token)
    }

    pub fn modify(&self, fd: RawFd, token: u64, events: epoll::Events) -> io::Result<()> {
        self.ctl(epoll::ControlOptions::EPOLL_CTL_MOD, fd, events, token)
    }

    pub fn remove(&self, fd: RawFd, token: u64) -> io::Result<()> {
        self.handlers.lock().unwrap().remove(&token);
        self.ctl(
            epoll::ControlOptions::EPOLL_CTL_DEL,
            fd,
            epoll::Events::empty(),
            token,
        )
    }

    /// Runs `callback` once, `after` from now, on the loop thread.
    pub fn add_timer(&self, after: Duration, callback: TimerCallback) -> TimerId {
        let deadline = Instant::now() + after;
        let mut timers = self.timers.lock().unwrap();
        let id = timers.next_id;
        timers.next_id += 1;
        timers.pending.insert((deadline, id), callback);
        timers.deadlines.insert(id, deadline);
        drop(timers);

        if let Err(e) = self.wake_evt.write(1) {
            warn!("Failed to wake up the event loop: {}", e);
        }
        TimerId(id)
    }

    /// Returns false if the timer already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let mut timers = self.timers.lock().unwrap();
        match timers.deadlines.remove(&id.0) {
            Some(deadline) => timers.pending.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    /// Makes `run` return.
    pub fn exit(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        if let Err(e) = self.exit_evt.write(1) {
            error!("Failed to signal the event loop exit: {}", e);
        }
    }

    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn timeout_ms(&self, max_wait: Option<Duration>) -> i32 {
        let until_timer = self
            .timers
            .lock()
            .unwrap()
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()));
        let wait = match (until_timer, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match wait {
            // Round up, a timer must not be polled for before its deadline.
            Some(w) => w.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32,
            None => -1,
        }
    }

    /// Waits for at most `max_wait` (forever with `None`, unless a timer is
    /// pending) and dispatches what is ready. Returns false once the loop
    /// has been asked to exit.
    pub fn run_once(&self, max_wait: Option<Duration>) -> io::Result<bool> {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); MAX_EVENTS];
        let num_events = match epoll::wait(self.epoll_fd, self.timeout_ms(max_wait), &mut events) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        for event in events.iter().take(num_events) {
            let token = event.data;
            let flags = epoll::Events::from_bits_truncate(event.events);
            match token {
                WAKE_TOKEN => {
                    let _ = self.wake_evt.read();
                }
                EXIT_TOKEN => {
                    let _ = self.exit_evt.read();
                }
                _ => {
                    let handler = self.handlers.lock().unwrap().get(&token).cloned();
                    // The handler may have been removed by an earlier one.
                    if let Some(handler) = handler {
                        handler(flags);
                    }
                }
            }
        }

        let now = Instant::now();
        loop {
            let expired = self.timers.lock().unwrap().pop_expired(now);
            match expired {
                Some((id, callback)) => callback(id),
                None => break,
            }
        }

        Ok(!self.exiting())
    }

    pub fn run(&self) -> io::Result<()> {
        while self.run_once(None)? {}
        debug!("Event loop exited");
        Ok(())
    }
}

impl AsRawFd for EventLoop {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // SAFETY: the fd is owned by the loop and closed once.
        unsafe { libc::close(self.epoll_fd) };
    }
}
