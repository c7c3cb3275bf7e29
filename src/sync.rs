// Library for event-driven inter-thread and inter-process communication.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Synchronization objects used by dispatch loops: a composite "wait for any" object and a
//! manual-reset gate.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::queue::QueueListener;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Object which has woken up a dispatch loop.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Wakeup {
    /// Exit was requested.
    #[display("exit")]
    Exit,

    /// Completion object was set (used by the timer manager).
    #[display("completion")]
    Completion,

    /// Event queue is not empty.
    #[display("queue")]
    Queue,

    /// Wait has timed out with no object signalled.
    #[display("timeout")]
    Timeout,
}

#[derive(Copy, Clone, Default, Debug)]
struct SignalState {
    exit: bool,
    completion: bool,
    queued: bool,
}

/// Composite wait object of a dispatcher: exit signal, queue-not-empty signal and an optional
/// auto-reset completion signal. Objects are checked in this order, so exit always wins.
#[derive(Debug, Default)]
pub struct Signals {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Signals {
    pub fn new() -> Self { Self::default() }

    pub fn set_exit(&self) {
        lock(&self.state).exit = true;
        self.cond.notify_all();
    }

    pub fn reset_exit(&self) { lock(&self.state).exit = false }

    pub fn is_exit(&self) -> bool { lock(&self.state).exit }

    pub fn set_completion(&self) {
        lock(&self.state).completion = true;
        self.cond.notify_all();
    }

    pub fn is_queued(&self) -> bool { lock(&self.state).queued }

    /// Blocks until one of the objects gets signalled or until the timeout elapses. `None` for a
    /// timeout means waiting infinitely; zero timeout polls the objects without blocking.
    ///
    /// The completion object is only considered when `completion` is set; it is reset once
    /// reported.
    pub fn wait(&self, timeout: Option<Duration>, completion: bool) -> Wakeup {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = lock(&self.state);
        loop {
            if state.exit {
                return Wakeup::Exit;
            }
            if completion && state.completion {
                state.completion = false;
                return Wakeup::Completion;
            }
            if state.queued {
                return Wakeup::Queue;
            }
            state = match deadline {
                None => self.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wakeup::Timeout;
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

impl QueueListener for Signals {
    fn queue_signal(&self, count: usize) {
        let mut state = lock(&self.state);
        let queued = count > 0;
        if state.queued != queued {
            state.queued = queued;
            if queued {
                self.cond.notify_all();
            }
        }
    }
}

/// Manual-reset event.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self { Self::default() }

    pub fn open(&self) {
        *lock(&self.open) = true;
        self.cond.notify_all();
    }

    pub fn close(&self) { *lock(&self.open) = false }

    pub fn is_open(&self) -> bool { *lock(&self.open) }

    /// Waits for the gate to open. Returns `false` if the timeout has elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let open = lock(&self.open);
        match timeout {
            None => *self
                .cond
                .wait_while(open, |open| !*open)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                *self
                    .cond
                    .wait_timeout_while(open, timeout, |open| !*open)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn exit_wins() {
        let signals = Signals::new();
        signals.queue_signal(3);
        signals.set_completion();
        signals.set_exit();
        assert_eq!(signals.wait(None, true), Wakeup::Exit);
        signals.reset_exit();
        assert_eq!(signals.wait(None, true), Wakeup::Completion);
        // completion is auto-reset
        assert_eq!(signals.wait(None, true), Wakeup::Queue);
        signals.queue_signal(0);
        assert_eq!(signals.wait(Some(Duration::ZERO), true), Wakeup::Timeout);
    }

    #[test]
    fn completion_ignored_when_not_awaited() {
        let signals = Signals::new();
        signals.set_completion();
        assert_eq!(signals.wait(Some(Duration::from_millis(10)), false), Wakeup::Timeout);
    }

    #[test]
    fn cross_thread_wakeup() {
        let signals = Arc::new(Signals::new());
        let remote = signals.clone();
        let handle = thread::spawn(move || remote.wait(None, false));
        thread::sleep(Duration::from_millis(20));
        signals.queue_signal(1);
        assert_eq!(handle.join().unwrap(), Wakeup::Queue);
    }

    #[test]
    fn gate() {
        let gate = Arc::new(Gate::new());
        assert!(!gate.wait(Some(Duration::from_millis(5))));
        let remote = gate.clone();
        let handle = thread::spawn(move || remote.wait(None));
        gate.open();
        assert!(handle.join().unwrap());
        gate.close();
        assert!(!gate.is_open());
    }
}
