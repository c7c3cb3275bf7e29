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

//! Logical timers delivering [`TimerFired`] events into the queue of their owning dispatcher.
//!
//! Timers are multiplexed by the [`TimerManager`] onto the waitable timers of a ticker thread.
//! A timer whose events are not consumed fast enough is suspended once the number of its queued
//! events exceeds [`Timer::max_queued`] and is resumed automatically when the consumer catches
//! up.

#![allow(unused_variables)] // because we need them for feature-gated logger

mod manager;
mod ticker;

use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub use manager::{TimerManager, TimerStatus};

use crate::dispatcher::{DispatchContext, Dispatcher};
use crate::event::{Event, EventConsumer, EventKind, EventTag};
use crate::sync::lock;
use crate::timeouts::Timestamp;

/// Fire count of a timer which runs until stopped.
pub const CONTINUOUSLY: u32 = u32::MAX;

/// Default maximum number of queued events of a timer.
pub const DEFAULT_MAX_QUEUED: u32 = 10;

/// Tag of the events delivering timer expirations.
pub const TIMER_EVENT: EventTag = EventTag::new("timer");

/// Object processing expirations of a timer.
pub trait TimerConsumer: Send + Sync {
    /// Called in the context of the timer's owning dispatcher thread.
    fn process_timer(&self, timer: &Timer, ctx: &DispatchContext<'_>);
}

impl<F> TimerConsumer for F
where F: Fn(&Timer, &DispatchContext<'_>) + Send + Sync
{
    fn process_timer(&self, timer: &Timer, ctx: &DispatchContext<'_>) { self(timer, ctx) }
}

struct TimerState {
    period: Duration,
    count: u32,
    remaining: u32,
    next_deadline: Option<Timestamp>,
    last_fired: Option<Timestamp>,
    max_queued: u32,
    queued: u32,
    owner: Dispatcher,
    started: bool,
    suspended: bool,
}

/// Outcome of a timer expiration processed by the manager.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Expiry {
    /// The timer was stopped or suspended after the expiration was reported.
    Inactive,
    Fire { last: bool },
}

pub(crate) struct TimerInner {
    name: String,
    consumer: Arc<dyn TimerConsumer>,
    manager: TimerManager,
    state: Mutex<TimerState>,
}

impl TimerInner {
    pub(crate) fn key(&self) -> usize { self as *const TimerInner as usize }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        let key = self.key();
        self.manager.unregister(key, None);
    }
}

/// Named, repeatable countdown.
///
/// The handle is cheap to clone. Dropping the last handle stops the timer; queued events of a
/// dropped timer are discarded without reaching the consumer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Timer")
            .field("name", &self.inner.name)
            .field("period", &state.period)
            .field("remaining", &state.remaining)
            .field("queued", &state.queued)
            .field("started", &state.started)
            .field("suspended", &state.suspended)
            .finish()
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }
}

impl Eq for Timer {}

impl Timer {
    pub fn new(
        manager: &TimerManager,
        name: impl Into<String>,
        consumer: Arc<dyn TimerConsumer>,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                name: name.into(),
                consumer,
                manager: manager.clone(),
                state: Mutex::new(TimerState {
                    period: Duration::ZERO,
                    count: 0,
                    remaining: 0,
                    next_deadline: None,
                    last_fired: None,
                    max_queued: DEFAULT_MAX_QUEUED,
                    queued: 0,
                    owner: Dispatcher::null(),
                    started: false,
                    suspended: false,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<TimerInner>) -> Self { Self { inner } }

    pub(crate) fn key(&self) -> usize { self.inner.key() }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn period(&self) -> Duration { lock(&self.inner.state).period }

    /// Number of expirations requested by the last start, or [`CONTINUOUSLY`].
    pub fn event_count(&self) -> u32 { lock(&self.inner.state).count }

    /// Number of expirations left to deliver, or [`CONTINUOUSLY`].
    pub fn remaining(&self) -> u32 { lock(&self.inner.state).remaining }

    pub fn next_deadline(&self) -> Option<Timestamp> { lock(&self.inner.state).next_deadline }

    pub fn last_fired(&self) -> Option<Timestamp> { lock(&self.inner.state).last_fired }

    pub fn max_queued(&self) -> u32 { lock(&self.inner.state).max_queued }

    /// Sets the bound of queued events above which the timer gets suspended.
    pub fn set_max_queued(&self, max_queued: u32) {
        lock(&self.inner.state).max_queued = max_queued.max(1);
    }

    /// Number of events of this timer waiting in the queue of the owner.
    pub fn queued_count(&self) -> u32 { lock(&self.inner.state).queued }

    /// Dispatcher receiving the events of the timer.
    pub fn owner(&self) -> Dispatcher { lock(&self.inner.state).owner.clone() }

    /// Whether the timer was started and has not stopped yet, including the time it is
    /// suspended.
    pub fn is_started(&self) -> bool { lock(&self.inner.state).started }

    pub fn is_suspended(&self) -> bool { lock(&self.inner.state).suspended }

    /// Whether the timer is started and is not suspended.
    pub fn is_active(&self) -> bool {
        let state = lock(&self.inner.state);
        state.started && !state.suspended
    }

    /// Starts the timer delivering events to the dispatcher of the calling thread.
    ///
    /// Fails if the calling thread does not run a dispatcher.
    pub fn start(&self, period: Duration, count: u32) -> bool {
        self.start_on(period, count, &Dispatcher::current())
    }

    /// Starts the timer delivering `count` events (or [`CONTINUOUSLY`]) with the given period
    /// to the `owner` dispatcher. Restarting a started timer rebinds it to the new owner.
    pub fn start_on(&self, period: Duration, count: u32, owner: &Dispatcher) -> bool {
        if period.is_zero() || count == 0 || !owner.is_valid() {
            #[cfg(feature = "log")]
            log::warn!(target: "timer", "Rejecting invalid start of timer {}", self.name());
            return false;
        }
        let previous = {
            let mut state = lock(&self.inner.state);
            state.period = period;
            state.count = count;
            state.remaining = count;
            state.started = true;
            state.suspended = false;
            state.next_deadline = Some(Timestamp::now() + period);
            mem::replace(&mut state.owner, owner.clone())
        };
        drop(previous);
        if !self.inner.manager.start_timer(self, owner) {
            lock(&self.inner.state).started = false;
            return false;
        }
        true
    }

    /// Stops the timer. Events which are already queued are still delivered.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.started = false;
            state.suspended = false;
            state.next_deadline = None;
        }
        self.inner.manager.stop_timer(self);
    }

    /// Accounts an expiration.
    pub(crate) fn expire(&self, fired_at: Timestamp) -> Expiry {
        let mut state = lock(&self.inner.state);
        if !state.started || state.suspended || state.remaining == 0 {
            return Expiry::Inactive;
        }
        if state.remaining != CONTINUOUSLY {
            state.remaining -= 1;
        }
        state.last_fired = Some(fired_at);
        let last = state.remaining == 0;
        if last {
            state.started = false;
            state.next_deadline = None;
        } else {
            state.next_deadline = Some(fired_at + state.period);
        }
        Expiry::Fire { last }
    }

    /// Period to arm the waitable timer with, or `None` for a single remaining expiration.
    pub(crate) fn rearm_period(&self) -> Option<Duration> {
        let state = lock(&self.inner.state);
        (state.remaining != 1).then_some(state.period)
    }

    /// Constructs the event reporting an expiration, accounting it as queued.
    pub(crate) fn fired_event(&self, fired_at: Timestamp) -> Event {
        lock(&self.inner.state).queued += 1;
        let fired = TimerFired {
            fired_at,
            guard: InFlight {
                timer: Arc::downgrade(&self.inner),
            },
        };
        Event::new(TIMER_EVENT, EventKind::EXTERNAL | EventKind::LOCAL | EventKind::NOTIFY, fired)
            .with_consumer(Arc::new(TimerDelivery))
    }

    /// Suspends the timer if it has more events queued than allowed. Returns whether the timer
    /// was suspended by this call.
    pub(crate) fn throttle(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.started && !state.suspended && state.queued > state.max_queued {
            #[cfg(feature = "log")]
            log::debug!(target: "timer", "Suspending timer {} with {} queued event(s)", self.inner.name, state.queued);
            state.suspended = true;
            return true;
        }
        false
    }

    fn unqueue(&self) {
        let owner = {
            let mut state = lock(&self.inner.state);
            state.queued = state.queued.saturating_sub(1);
            if !(state.started && state.suspended && state.queued < state.max_queued) {
                return;
            }
            state.suspended = false;
            state.next_deadline = Some(Timestamp::now() + state.period);
            state.owner.clone()
        };
        #[cfg(feature = "log")]
        log::debug!(target: "timer", "Resuming timer {} on {}", self.name(), owner.name());
        if !self.inner.manager.start_timer(self, &owner) {
            lock(&self.inner.state).started = false;
        }
    }
}

/// Keeps the queued-events count of a timer while its event is alive.
struct InFlight {
    timer: Weak<TimerInner>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(inner) = self.timer.upgrade() {
            Timer::from_inner(inner).unqueue();
        }
    }
}

/// Payload of [`TIMER_EVENT`] events.
pub struct TimerFired {
    fired_at: Timestamp,
    guard: InFlight,
}

impl TimerFired {
    pub fn fired_at(&self) -> Timestamp { self.fired_at }

    /// The timer, unless it was already destroyed.
    pub fn timer(&self) -> Option<Timer> { self.guard.timer.upgrade().map(Timer::from_inner) }
}

struct TimerDelivery;

impl EventConsumer for TimerDelivery {
    fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>) {
        let Some(timer) = event.payload::<TimerFired>().and_then(TimerFired::timer) else {
            return;
        };
        timer.inner.consumer.process_timer(&timer, ctx);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::thread::{DispatcherThread, WaitMode};

    fn wait_until(f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn TimerConsumer>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let fired = counter.clone();
        let consumer: Arc<dyn TimerConsumer> = Arc::new(move |_: &Timer, _: &DispatchContext<'_>| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        (counter, consumer)
    }

    #[test]
    fn invalid_start() {
        let manager = TimerManager::new().unwrap();
        let (_, consumer) = counting();
        let timer = Timer::new(&manager, "invalid", consumer);
        // the test thread does not run a dispatcher
        assert!(!timer.start(Duration::from_millis(10), 1));
        assert!(!timer.start_on(Duration::ZERO, 1, &Dispatcher::new("owner")));
        assert!(!timer.is_started());
        timer.stop();
    }

    #[test]
    fn fires_exact_count() {
        let manager = TimerManager::new().unwrap();
        let owner = DispatcherThread::spawn("timer-owner", ()).unwrap();
        assert!(owner.wait_for_dispatcher_start(Some(Duration::from_secs(5))));

        let (counter, consumer) = counting();
        let timer = Timer::new(&manager, "three", consumer);
        assert!(timer.start_on(Duration::from_millis(5), 3, owner.dispatcher()));
        assert_eq!(timer.owner(), *owner.dispatcher());
        assert!(wait_until(|| counter.load(Ordering::SeqCst) == 3));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!timer.is_started());
        assert!(timer.last_fired().is_some());
        assert_eq!(manager.timer_status(&timer), None);

        assert!(owner.destroy_thread(WaitMode::Infinite));
    }

    #[test]
    fn stop_disarms() {
        let manager = TimerManager::new().unwrap();
        let owner = DispatcherThread::spawn("timer-stop", ()).unwrap();
        assert!(owner.wait_for_dispatcher_start(Some(Duration::from_secs(5))));

        let (counter, consumer) = counting();
        let timer = Timer::new(&manager, "periodic", consumer);
        assert!(timer.start_on(Duration::from_millis(5), CONTINUOUSLY, owner.dispatcher()));
        assert!(wait_until(|| counter.load(Ordering::SeqCst) >= 2));
        timer.stop();
        assert_eq!(manager.timer_status(&timer), None);

        thread::sleep(Duration::from_millis(50));
        let stopped = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), stopped);

        assert!(owner.destroy_thread(WaitMode::Infinite));
    }

    #[test]
    fn throttling_round_trip() {
        let manager = TimerManager::new().unwrap();
        // the owner accepts events but nobody consumes them
        let owner = Dispatcher::new("stalled");
        assert!(owner.start());

        let (counter, consumer) = counting();
        let timer = Timer::new(&manager, "flood", consumer);
        timer.set_max_queued(3);
        assert!(timer.start_on(Duration::from_millis(2), CONTINUOUSLY, &owner));

        assert!(wait_until(|| timer.is_suspended()));
        assert!(timer.is_started());
        assert_eq!(timer.queued_count(), 4);
        assert!(wait_until(|| manager.timer_status(&timer).is_none()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(owner.pending_events(), 4);

        // dropping the queued events lets the timer resume on the same owner
        assert_eq!(owner.remove_events(TIMER_EVENT), 4);
        assert!(wait_until(|| owner.pending_events() > 0));
        assert!(wait_until(|| timer.is_suspended()));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        timer.stop();
        assert!(owner.stop());
        owner.run(&mut ()).unwrap();
    }

    #[test]
    fn dropped_timer_is_unregistered() {
        let manager = TimerManager::new().unwrap();
        let owner = Dispatcher::new("dropped");
        assert!(owner.start());
        let (_, consumer) = counting();
        let timer = Timer::new(&manager, "short-lived", consumer);
        assert!(timer.start_on(Duration::from_secs(60), 1, &owner));
        assert_eq!(manager.registered_count(), 1);
        drop(timer);
        assert_eq!(manager.registered_count(), 0);
    }
}
