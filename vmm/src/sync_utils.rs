// Copyright © 2026 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A single use gate. A vCPU thread waiting for an asynchronous request to
/// finish parks here, whoever completes the request opens it.
#[derive(Debug, Default)]
pub struct Gate {
    /// True if the gate is open, false otherwise.
    open: Mutex<bool>,
    /// Used to notify waiting threads.
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait at the gate. Only blocks if the gate is not opened.
    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    /// Wait at most `timeout`. Returns whether the gate is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let open = self.open.lock().unwrap();
        let (open, _) = self
            .cv
            .wait_timeout_while(open, timeout, |open| !*open)
            .unwrap();
        *open
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    /// Open the gate, releasing all waiting threads.
    pub fn open(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn wait_timeout_expires_when_closed() {
        let gate = Gate::new();
        assert!(!gate.wait_timeout(Duration::from_millis(10)));
        assert!(!gate.is_open());
    }

    #[test]
    fn open_releases_waiter() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_timeout(Duration::from_secs(10)))
        };
        gate.open();
        assert!(waiter.join().unwrap());
        // Already open, returns straight away.
        gate.wait();
    }
}
