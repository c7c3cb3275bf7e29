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

use std::collections::{BTreeSet, HashMap};
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::{Duration, Instant, SystemTime};

/// UNIX timestamp with millisecond precision which helps working with absolute time.
#[derive(Wrapper, WrapperMut, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default, From)]
#[wrapper(Display, LowerHex, UpperHex, Octal, Add, Sub)]
#[wrapper_mut(AddAssign, SubAssign)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates timestamp matching the current moment.
    pub fn now() -> Self {
        let duration = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Converts into number of milliseconds since UNIX epoch.
    pub fn into_millis(self) -> u64 { self.0 }

    /// Converts into number of whole seconds since UNIX epoch.
    pub fn into_secs(self) -> u64 { self.0 / 1000 }

    /// Time passed since the `earlier` timestamp; zero if `earlier` is in the future.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output { Timestamp(self.0 + rhs.as_millis() as u64) }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) { self.0 += rhs.as_millis() as u64 }
}

impl SubAssign<Duration> for Timestamp {
    fn sub_assign(&mut self, rhs: Duration) { self.0 = self.0.saturating_sub(rhs.as_millis() as u64) }
}

/// Handle of an armed waitable timer.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From)]
#[wrapper(Display, LowerHex)]
pub struct TimerHandle(u64);

#[derive(Copy, Clone, Debug)]
struct Armed {
    due: Instant,
    period: Option<Duration>,
}

/// Table of armed deadlines emulating a set of OS waitable timers.
///
/// Each handle has at most one deadline. A periodic deadline is re-armed by [`Deadlines::expire`]
/// one period after it has fired; ticks which were missed entirely are skipped.
#[derive(Debug, Default)]
pub struct Deadlines {
    queue: BTreeSet<(Instant, TimerHandle)>,
    armed: HashMap<TimerHandle, Armed>,
}

impl Deadlines {
    pub fn new() -> Self {
        Self {
            queue: bset! {},
            armed: empty!(),
        }
    }

    /// Return the number of armed deadlines.
    pub fn len(&self) -> usize { self.armed.len() }

    /// Check whether there are deadlines being tracked.
    pub fn is_empty(&self) -> bool { self.armed.is_empty() }

    pub fn is_armed(&self, handle: TimerHandle) -> bool { self.armed.contains_key(&handle) }

    /// Arms the deadline for the handle, replacing the previous one.
    pub fn arm(&mut self, handle: TimerHandle, due: Instant, period: Option<Duration>) {
        self.cancel(handle);
        self.queue.insert((due, handle));
        self.armed.insert(handle, Armed { due, period });
    }

    /// Disarms the deadline. Returns `false` if the handle was not armed.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.armed.remove(&handle) {
            Some(armed) => {
                self.queue.remove(&(armed.due, handle));
                true
            }
            None => false,
        }
    }

    /// Moment of the earliest deadline.
    pub fn next_due(&self) -> Option<Instant> { self.queue.first().map(|(due, _)| *due) }

    /// Get the minimum time duration we should wait for at least one deadline to be reached.
    /// Returns `None` if there are no deadlines and zero if some deadline is overdue.
    pub fn next(&self, now: Instant) -> Option<Duration> {
        self.next_due().map(|due| due.saturating_duration_since(now))
    }

    /// Returns handles which have fired at or before the given moment, in the order of their
    /// deadlines.
    pub fn expire(&mut self, now: Instant) -> Vec<TimerHandle> {
        let mut fired = vec![];
        while let Some(&(due, handle)) = self.queue.first() {
            if due > now {
                break;
            }
            self.queue.pop_first();
            fired.push(handle);
            match self.armed.get(&handle).and_then(|armed| armed.period) {
                Some(period) => {
                    let mut next = due + period;
                    if next <= now {
                        next = now + period;
                    }
                    self.queue.insert((next, handle));
                    self.armed.insert(handle, Armed {
                        due: next,
                        period: Some(period),
                    });
                }
                None => {
                    self.armed.remove(&handle);
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_millis() {
        let ts = Timestamp::from(1_500);
        assert_eq!(ts.into_secs(), 1);
        assert_eq!((ts + Duration::from_millis(250)).into_millis(), 1_750);
        assert_eq!(ts.duration_since(Timestamp::from(1_000)), Duration::from_millis(500));
        assert_eq!(Timestamp::from(1_000).duration_since(ts), Duration::ZERO);
        assert_eq!((ts - Duration::from_secs(2)).into_millis(), 0);
        let mut earlier = ts;
        earlier -= Duration::from_millis(500);
        assert_eq!(earlier.into_millis(), 1_000);
        earlier -= Duration::from_secs(5);
        assert_eq!(earlier.into_millis(), 0);
    }

    #[test]
    fn test_wake_exact() {
        let mut tm = Deadlines::new();

        let now = Instant::now();
        tm.arm(TimerHandle(1), now + Duration::from_secs(8), None);
        tm.arm(TimerHandle(2), now + Duration::from_secs(9), None);
        tm.arm(TimerHandle(3), now + Duration::from_secs(10), None);

        assert_eq!(tm.expire(now + Duration::from_secs(9)), vec![TimerHandle(1), TimerHandle(2)]);
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn test_wake() {
        let mut tm = Deadlines::new();

        let now = Instant::now();
        tm.arm(TimerHandle(1), now + Duration::from_secs(8), None);
        tm.arm(TimerHandle(2), now + Duration::from_secs(16), None);
        tm.arm(TimerHandle(3), now + Duration::from_secs(64), None);
        tm.arm(TimerHandle(4), now + Duration::from_secs(72), None);

        assert!(tm.expire(now).is_empty());
        assert_eq!(tm.len(), 4);
        assert_eq!(tm.next(now), Some(Duration::from_secs(8)));

        assert_eq!(tm.expire(now + Duration::from_secs(9)).len(), 1);
        assert_eq!(tm.len(), 3, "one timeout has expired");

        assert_eq!(tm.expire(now + Duration::from_secs(66)).len(), 2);
        assert_eq!(tm.len(), 1, "another two timeouts have expired");

        assert_eq!(tm.expire(now + Duration::from_secs(96)).len(), 1);
        assert!(tm.is_empty(), "all timeouts have expired");
        assert_eq!(tm.next(now), None);
    }

    #[test]
    fn periodic_rearm() {
        let mut tm = Deadlines::new();
        let now = Instant::now();
        let period = Duration::from_millis(100);
        tm.arm(TimerHandle(7), now + period, Some(period));

        assert_eq!(tm.expire(now + period), vec![TimerHandle(7)]);
        assert!(tm.is_armed(TimerHandle(7)));
        assert_eq!(tm.next_due(), Some(now + period * 2));

        // missed ticks are skipped
        assert_eq!(tm.expire(now + period * 10), vec![TimerHandle(7)]);
        assert_eq!(tm.next_due(), Some(now + period * 11));
    }

    #[test]
    fn cancel_and_replace() {
        let mut tm = Deadlines::new();
        let now = Instant::now();
        tm.arm(TimerHandle(1), now + Duration::from_secs(1), None);
        tm.arm(TimerHandle(1), now + Duration::from_secs(5), None);
        assert_eq!(tm.len(), 1);
        assert!(tm.expire(now + Duration::from_secs(2)).is_empty());

        assert!(tm.cancel(TimerHandle(1)));
        assert!(!tm.cancel(TimerHandle(1)));
        assert!(tm.expire(now + Duration::from_secs(10)).is_empty());
    }
}
