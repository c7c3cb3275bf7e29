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

//! Waitable timer emulation: a dedicated thread sleeping until the earliest armed deadline and
//! reporting the expired handles through a callback.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::io;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::sync::lock;
use crate::timeouts::{Deadlines, TimerHandle, Timestamp};

pub(crate) enum Ctl<C> {
    Cmd(C),
    Shutdown,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum TickerCmd {
    Arm {
        handle: TimerHandle,
        due: Instant,
        period: Option<Duration>,
    },
    Cancel(TimerHandle),
}

pub(crate) type ExpiryFn = Box<dyn Fn(TimerHandle, Timestamp) + Send>;

/// Control API to the ticker thread.
pub(crate) struct Ticker {
    ctl_send: chan::Sender<Ctl<TickerCmd>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub fn spawn(name: impl Into<String>, on_expired: ExpiryFn) -> io::Result<Self> {
        let (ctl_send, ctl_recv) = chan::unbounded();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || Self::run(ctl_recv, on_expired))?;
        Ok(Self {
            ctl_send,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn arm(&self, handle: TimerHandle, due: Instant, period: Option<Duration>) -> bool {
        self.send(TickerCmd::Arm {
            handle,
            due,
            period,
        })
    }

    pub fn cancel(&self, handle: TimerHandle) -> bool { self.send(TickerCmd::Cancel(handle)) }

    fn send(&self, cmd: TickerCmd) -> bool {
        #[cfg(feature = "log")]
        log::trace!(target: "ticker", "Sending {cmd:?}");
        self.ctl_send.send(Ctl::Cmd(cmd)).is_ok()
    }

    /// Stops the ticker thread and waits for it to complete, unless called from the ticker
    /// thread itself.
    pub fn shutdown(&self) {
        let _ = self.ctl_send.send(Ctl::Shutdown);
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        if thread.thread().id() != thread::current().id() {
            let _ = thread.join();
        }
    }

    fn run(ctl_recv: chan::Receiver<Ctl<TickerCmd>>, on_expired: ExpiryFn) {
        #[cfg(feature = "log")]
        log::debug!(target: "ticker", "Ticker thread started");

        let mut deadlines = Deadlines::new();
        loop {
            let res = match deadlines.next_due() {
                Some(due) => ctl_recv.recv_deadline(due),
                None => ctl_recv.recv().map_err(|_| chan::RecvTimeoutError::Disconnected),
            };
            match res {
                Ok(Ctl::Cmd(TickerCmd::Arm {
                    handle,
                    due,
                    period,
                })) => deadlines.arm(handle, due, period),
                Ok(Ctl::Cmd(TickerCmd::Cancel(handle))) => {
                    deadlines.cancel(handle);
                }
                Ok(Ctl::Shutdown) | Err(chan::RecvTimeoutError::Disconnected) => break,
                Err(chan::RecvTimeoutError::Timeout) => {}
            }

            let fired = deadlines.expire(Instant::now());
            if fired.is_empty() {
                continue;
            }
            let fired_at = Timestamp::now();
            for handle in fired {
                #[cfg(feature = "log")]
                log::trace!(target: "ticker", "Timer {handle} has expired");
                on_expired(handle, fired_at);
            }
        }

        #[cfg(feature = "log")]
        log::debug!(target: "ticker", "Ticker thread stopped with {} armed timer(s)", deadlines.len());
    }
}

impl Drop for Ticker {
    fn drop(&mut self) { self.shutdown() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fires_once_and_periodically() {
        let (send, recv) = chan::unbounded();
        let ticker = Ticker::spawn("ticker-test", Box::new(move |handle, _| {
            let _ = send.send(handle);
        }))
        .unwrap();

        let now = Instant::now();
        assert!(ticker.arm(TimerHandle::from(1), now + Duration::from_millis(10), None));
        assert_eq!(recv.recv_timeout(Duration::from_secs(5)), Ok(TimerHandle::from(1)));

        let period = Duration::from_millis(5);
        assert!(ticker.arm(TimerHandle::from(2), now, Some(period)));
        for _ in 0..3 {
            assert_eq!(recv.recv_timeout(Duration::from_secs(5)), Ok(TimerHandle::from(2)));
        }
        assert!(ticker.cancel(TimerHandle::from(2)));
        // drain expiries which raced with the cancellation
        thread::sleep(Duration::from_millis(20));
        while recv.try_recv().is_ok() {}
        assert!(recv.recv_timeout(Duration::from_millis(50)).is_err());

        ticker.shutdown();
        assert!(!ticker.arm(TimerHandle::from(3), now, None));
    }
}
