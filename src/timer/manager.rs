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

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::ticker::Ticker;
use super::{Expiry, Timer, TimerInner};
use crate::dispatcher::{DispatchContext, DispatchHandler, Dispatcher};
use crate::event::{Event, EventConsumer, EventKind, EventTag};
use crate::sync::lock;
use crate::thread::{DispatcherThread, WaitMode};
use crate::timeouts::{TimerHandle, Timestamp};

const TIMER_START: EventTag = EventTag::new("timer-start");

/// State of a registered timer.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum TimerStatus {
    /// Registered, waiting for the manager thread to arm the waitable timer.
    #[display("idle")]
    Idle,

    /// Waitable timer is armed.
    #[display("pending")]
    Pending,

    /// Expiration is being delivered to the owner.
    #[display("active")]
    Active,
}

struct Entry {
    timer: Weak<TimerInner>,
    handle: TimerHandle,
    owner: Dispatcher,
    status: TimerStatus,
}

#[derive(Default)]
struct Table {
    entries: HashMap<usize, Entry>,
    handles: HashMap<TimerHandle, usize>,
    last_handle: u64,
}

impl Table {
    /// Removes the entry of the timer. If `handle` is given, the entry is removed only if it
    /// was registered under that handle.
    fn remove(&mut self, key: usize, handle: Option<TimerHandle>) -> Option<Entry> {
        let current = self.entries.get(&key)?.handle;
        if handle.map(|handle| handle != current).unwrap_or_default() {
            return None;
        }
        self.handles.remove(&current);
        self.entries.remove(&key)
    }
}

struct StartRequest {
    key: usize,
    handle: TimerHandle,
    due: Instant,
    period: Option<Duration>,
}

struct ManagerShared {
    dispatcher: Dispatcher,
    thread: OnceLock<DispatcherThread>,
    ticker: OnceLock<Ticker>,
    table: Mutex<Table>,
    expired: Mutex<VecDeque<(TimerHandle, Timestamp)>>,
}

impl ManagerShared {
    fn start_timer(&self, timer: &Timer, owner: &Dispatcher) -> bool {
        let key = timer.key();
        let due = Instant::now() + timer.period();
        let period = timer.rearm_period();

        let (handle, replaced) = {
            let mut table = lock(&self.table);
            let replaced = table.remove(key, None);
            table.last_handle += 1;
            let handle = TimerHandle::from(table.last_handle);
            table.entries.insert(key, Entry {
                timer: Arc::downgrade(&timer.inner),
                handle,
                owner: owner.clone(),
                status: TimerStatus::Idle,
            });
            table.handles.insert(handle, key);
            (handle, replaced)
        };
        if let Some(replaced) = replaced {
            self.cancel(replaced.handle);
        }

        let request = StartRequest {
            key,
            handle,
            due,
            period,
        };
        let event = Event::new(
            TIMER_START,
            EventKind::EXTERNAL | EventKind::LOCAL | EventKind::REQUEST,
            request,
        );
        if !self.dispatcher.post_event(event) {
            lock(&self.table).remove(key, Some(handle));
            return false;
        }

        #[cfg(feature = "log")]
        log::debug!(target: "timer", "Timer {} registered with handle {handle} for {}", timer.name(), owner.name());
        true
    }

    fn unregister(&self, key: usize, handle: Option<TimerHandle>) -> bool {
        let entry = lock(&self.table).remove(key, handle);
        match entry {
            Some(entry) => {
                self.cancel(entry.handle);
                true
            }
            None => false,
        }
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(ticker) = self.ticker.get() {
            ticker.cancel(handle);
        }
    }

    /// Arms the waitable timer. Runs on the manager thread.
    fn arm(&self, request: &StartRequest) {
        let mut table = lock(&self.table);
        let Some(entry) = table.entries.get_mut(&request.key) else {
            return;
        };
        if entry.handle != request.handle || entry.status != TimerStatus::Idle {
            return;
        }
        let Some(ticker) = self.ticker.get() else {
            return;
        };
        if ticker.arm(request.handle, request.due, request.period) {
            entry.status = TimerStatus::Pending;
        }
    }

    /// Records the expiration reported by the ticker thread.
    fn timer_is_expired(&self, handle: TimerHandle, fired_at: Timestamp) {
        lock(&self.expired).push_back((handle, fired_at));
        self.dispatcher.signal_completion();
    }

    /// Delivers recorded expirations. Runs on the manager thread.
    fn process_expired(&self) {
        let records = lock(&self.expired).drain(..).collect::<Vec<_>>();
        for (handle, fired_at) in records {
            self.timer_expired(handle, fired_at);
        }
    }

    fn timer_expired(&self, handle: TimerHandle, fired_at: Timestamp) {
        let found = {
            let mut table = lock(&self.table);
            let key = table.handles.get(&handle).copied();
            key.and_then(|key| {
                let entry = table.entries.get_mut(&key)?;
                entry.status = TimerStatus::Active;
                Some((key, entry.timer.clone(), entry.owner.clone()))
            })
        };
        // the timer was stopped or restarted after the expiration
        let Some((key, timer, owner)) = found else {
            return;
        };
        let Some(timer) = timer.upgrade().map(Timer::from_inner) else {
            self.unregister(key, Some(handle));
            return;
        };

        match timer.expire(fired_at) {
            Expiry::Inactive => {
                self.unregister(key, Some(handle));
            }
            Expiry::Fire { last } => {
                if last {
                    self.unregister(key, Some(handle));
                } else if let Some(entry) = lock(&self.table).entries.get_mut(&key) {
                    if entry.handle == handle {
                        entry.status = TimerStatus::Pending;
                    }
                }

                #[cfg(feature = "log")]
                log::trace!(target: "timer", "Timer {} fired at {fired_at}", timer.name());

                if !owner.post_event(timer.fired_event(fired_at)) {
                    #[cfg(feature = "log")]
                    log::warn!(target: "timer", "Owner {} of timer {} is not running, stopping the timer", owner.name(), timer.name());
                    timer.stop();
                } else if timer.throttle() {
                    self.unregister(key, Some(handle));
                }
            }
        }
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.get() {
            thread.destroy_thread(WaitMode::Timeout(Duration::from_secs(1)));
        }
        if let Some(ticker) = self.ticker.get() {
            ticker.shutdown();
        }
    }
}

struct Arming {
    shared: Weak<ManagerShared>,
}

impl EventConsumer for Arming {
    fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>) {
        let (Some(request), Some(shared)) =
            (event.payload::<StartRequest>(), self.shared.upgrade())
        else {
            return;
        };
        shared.arm(request);
    }
}

struct ManagerLoop {
    shared: Weak<ManagerShared>,
}

impl DispatchHandler for ManagerLoop {
    fn waits_completion(&self) -> bool { true }

    fn handle_started(&mut self, dispatcher: &Dispatcher) {
        dispatcher.register_consumer(
            TIMER_START,
            Arc::new(Arming {
                shared: self.shared.clone(),
            }),
        );
    }

    fn handle_completion(&mut self, ctx: &DispatchContext<'_>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.process_expired();
        }
    }
}

/// Timer manager: a dispatcher thread multiplexing logical [`Timer`]s onto waitable timers and
/// delivering their expirations to the owning dispatchers.
///
/// The handle is cheap to clone. The manager threads stop once the last handle, including the
/// ones held by timers, is dropped.
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<ManagerShared>,
}

impl TimerManager {
    /// Spawns the manager dispatcher thread and its ticker thread.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to spawn a thread.
    pub fn new() -> io::Result<Self> {
        let dispatcher = Dispatcher::new("timer-manager");
        let shared = Arc::new(ManagerShared {
            dispatcher: dispatcher.clone(),
            thread: OnceLock::new(),
            ticker: OnceLock::new(),
            table: Mutex::default(),
            expired: Mutex::default(),
        });

        let weak = Arc::downgrade(&shared);
        let ticker = Ticker::spawn(
            "timer-ticker",
            Box::new(move |handle, fired_at| {
                if let Some(shared) = weak.upgrade() {
                    shared.timer_is_expired(handle, fired_at);
                }
            }),
        )?;
        let _ = shared.ticker.set(ticker);

        let handler = ManagerLoop {
            shared: Arc::downgrade(&shared),
        };
        let builder = thread::Builder::new().name(s!("timer-manager"));
        let thread = DispatcherThread::with(dispatcher, handler, builder)?;
        thread.wait_for_dispatcher_start(None);
        let _ = shared.thread.set(thread);

        #[cfg(feature = "log")]
        log::debug!(target: "timer", "Timer manager started");

        Ok(Self { shared })
    }

    /// Process-wide timer manager, spawned on the first use.
    pub fn global() -> io::Result<Self> {
        static GLOBAL: Mutex<Option<TimerManager>> = Mutex::new(None);

        let mut global = lock(&GLOBAL);
        if let Some(manager) = &*global {
            return Ok(manager.clone());
        }
        let manager = Self::new()?;
        *global = Some(manager.clone());
        Ok(manager)
    }

    pub fn dispatcher(&self) -> &Dispatcher { &self.shared.dispatcher }

    pub fn is_running(&self) -> bool { self.shared.dispatcher.is_running() }

    /// Registers a started timer, replacing its previous registration, and requests the manager
    /// thread to arm a waitable timer for it.
    ///
    /// # Returns
    ///
    /// `false` if the timer was not started or the manager thread does not run.
    pub fn start_timer(&self, timer: &Timer, owner: &Dispatcher) -> bool {
        if !timer.is_started() {
            return false;
        }
        self.shared.start_timer(timer, owner)
    }

    /// Unregisters the timer and disarms its waitable timer. Returns `false` if the timer was
    /// not registered.
    pub fn stop_timer(&self, timer: &Timer) -> bool { self.shared.unregister(timer.key(), None) }

    /// Status of the timer, or `None` if it is not registered.
    pub fn timer_status(&self, timer: &Timer) -> Option<TimerStatus> {
        lock(&self.shared.table).entries.get(&timer.key()).map(|entry| entry.status)
    }

    /// Number of registered timers.
    pub fn registered_count(&self) -> usize { lock(&self.shared.table).entries.len() }

    pub(super) fn unregister(&self, key: usize, handle: Option<TimerHandle>) -> bool {
        self.shared.unregister(key, handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn global_is_shared() {
        let manager = TimerManager::global().unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.dispatcher(), TimerManager::global().unwrap().dispatcher());
    }

    #[test]
    fn status_transitions() {
        let manager = TimerManager::new().unwrap();
        let owner = Dispatcher::new("status");
        assert!(owner.start());
        let timer = Timer::new(&manager, "slow", Arc::new(|_: &Timer, _: &DispatchContext<'_>| {}));
        assert!(!manager.start_timer(&timer, &owner));

        assert!(timer.start_on(Duration::from_secs(60), 1, &owner));
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.timer_status(&timer) != Some(TimerStatus::Pending) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(manager.stop_timer(&timer));
        assert!(!manager.stop_timer(&timer));
        assert_eq!(manager.timer_status(&timer), None);
    }
}
