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

//! Event queues of a dispatcher.
//!
//! Each dispatcher owns two queues: an [`ExternalQueue`], which is safe for producers running in
//! any thread, and an internal [`EventQueue`], which lives inside the dispatch loop and is touched
//! only by the dispatching thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::event::{Event, EventTag};
use crate::sync::lock;

/// Entry of an event queue.
#[derive(Debug)]
pub enum Queued {
    Event(Event),

    /// Exit marker. Popping it terminates the dispatch loop. The marker carries no data and is
    /// never handed to consumers.
    Exit,
}

impl Queued {
    pub fn is_exit(&self) -> bool { matches!(self, Queued::Exit) }

    pub fn is_special(&self) -> bool {
        match self {
            Queued::Event(event) => event.kind().is_special(),
            Queued::Exit => false,
        }
    }

    pub fn tag(&self) -> Option<EventTag> {
        match self {
            Queued::Event(event) => Some(event.tag()),
            Queued::Exit => None,
        }
    }
}

/// Receives the number of queued entries after every operation changing the queue. Operations
/// which leave the queue untouched are not signalled.
pub trait QueueListener {
    fn queue_signal(&self, count: usize);
}

impl QueueListener for () {
    fn queue_signal(&self, _count: usize) {}
}

impl<L: QueueListener + ?Sized> QueueListener for Arc<L> {
    fn queue_signal(&self, count: usize) { L::queue_signal(self, count) }
}

/// Non-locking FIFO event queue.
///
/// Removal operations return the removed entries instead of dropping them, so callers holding a
/// lock around the queue can release it before the event payloads get destroyed.
#[derive(Debug)]
pub struct EventQueue<L: QueueListener = ()> {
    queue: VecDeque<Queued>,
    listener: L,
}

impl Default for EventQueue<()> {
    fn default() -> Self { Self::new() }
}

impl EventQueue<()> {
    pub fn new() -> Self { Self::with_listener(()) }
}

impl<L: QueueListener> EventQueue<L> {
    pub fn with_listener(listener: L) -> Self {
        Self {
            queue: empty!(),
            listener,
        }
    }

    pub fn len(&self) -> usize { self.queue.len() }

    pub fn is_empty(&self) -> bool { self.queue.is_empty() }

    pub fn push(&mut self, entry: Queued) {
        self.queue.push_back(entry);
        self.listener.queue_signal(self.queue.len());
    }

    /// Removes and returns the oldest entry.
    pub fn pop(&mut self) -> Option<Queued> {
        let entry = self.queue.pop_front();
        if entry.is_some() {
            self.listener.queue_signal(self.queue.len());
        }
        entry
    }

    /// Removes every entry, including exit markers.
    pub fn remove_all(&mut self) -> Vec<Queued> {
        let removed: Vec<_> = self.queue.drain(..).collect();
        if !removed.is_empty() {
            self.listener.queue_signal(0);
        }
        removed
    }

    /// Removes all entries, except special events (connection status notifications) if
    /// `keep_specials` is set.
    pub fn remove_events(&mut self, keep_specials: bool) -> Vec<Queued> {
        if !keep_specials {
            return self.remove_all();
        }
        let (kept, removed) = self.queue.drain(..).partition::<VecDeque<_>, _>(Queued::is_special);
        self.queue = kept;
        if !removed.is_empty() {
            self.listener.queue_signal(self.queue.len());
        }
        removed.into()
    }

    /// Removes events with the given tag. Exit markers are never removed.
    pub fn remove_by_tag(&mut self, tag: EventTag) -> Vec<Queued> {
        let (removed, kept) = self
            .queue
            .drain(..)
            .partition::<VecDeque<_>, _>(|entry| entry.tag() == Some(tag));
        self.queue = kept;
        if !removed.is_empty() {
            self.listener.queue_signal(self.queue.len());
        }
        removed.into()
    }

    pub fn contains_exit(&self) -> bool { self.queue.iter().any(Queued::is_exit) }
}

/// Thread-safe event queue used for events posted from arbitrary threads.
#[derive(Debug)]
pub struct ExternalQueue<L: QueueListener> {
    inner: Mutex<EventQueue<L>>,
}

impl<L: QueueListener> ExternalQueue<L> {
    pub fn with_listener(listener: L) -> Self {
        Self {
            inner: Mutex::new(EventQueue::with_listener(listener)),
        }
    }

    pub fn len(&self) -> usize { lock(&self.inner).len() }

    pub fn is_empty(&self) -> bool { lock(&self.inner).is_empty() }

    pub fn push(&self, entry: Queued) { lock(&self.inner).push(entry) }

    pub fn pop(&self) -> Option<Queued> { lock(&self.inner).pop() }

    pub fn remove_all(&self) -> usize {
        let removed = lock(&self.inner).remove_all();
        removed.len()
    }

    pub fn remove_events(&self, keep_specials: bool) -> usize {
        let removed = lock(&self.inner).remove_events(keep_specials);
        removed.len()
    }

    pub fn remove_by_tag(&self, tag: EventTag) -> usize {
        let removed = lock(&self.inner).remove_by_tag(tag);
        removed.len()
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::event::EventKind;

    const TAG_A: EventTag = EventTag::new("a");
    const TAG_B: EventTag = EventTag::new("b");

    #[derive(Default)]
    struct Recorder(RefCell<Vec<usize>>);
    impl QueueListener for &Recorder {
        fn queue_signal(&self, count: usize) { self.0.borrow_mut().push(count) }
    }

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    fn event(tag: EventTag, n: u32) -> Queued { Queued::Event(Event::notify(tag, n)) }

    fn payload(entry: Option<Queued>) -> Option<u32> {
        match entry? {
            Queued::Event(event) => event.payload::<u32>().copied(),
            Queued::Exit => None,
        }
    }

    #[test]
    fn fifo_and_signals() {
        let recorder = Recorder::default();
        let mut queue = EventQueue::with_listener(&recorder);
        queue.push(event(TAG_A, 1));
        queue.push(event(TAG_A, 2));
        assert_eq!(payload(queue.pop()), Some(1));
        assert_eq!(payload(queue.pop()), Some(2));
        assert!(queue.pop().is_none());
        assert_eq!(*recorder.0.borrow(), vec![1, 2, 1, 0]);
    }

    #[test]
    fn empty_queue_is_silent() {
        let recorder = Recorder::default();
        let mut queue = EventQueue::with_listener(&recorder);
        assert!(queue.pop().is_none());
        assert!(queue.remove_all().is_empty());
        assert!(queue.remove_events(true).is_empty());
        assert!(queue.remove_by_tag(TAG_A).is_empty());
        assert!(recorder.0.borrow().is_empty());

        queue.push(Queued::Event(Event::new(TAG_B, EventKind::EXTERNAL | EventKind::CONNECT, 1u32)));
        assert!(queue.remove_events(true).is_empty());
        assert_eq!(*recorder.0.borrow(), vec![1]);
    }

    #[test]
    fn remove_keeps_specials() {
        let mut queue = EventQueue::new();
        queue.push(event(TAG_A, 1));
        queue.push(Queued::Event(Event::new(
            TAG_B,
            EventKind::EXTERNAL | EventKind::CONNECT,
            2u32,
        )));
        queue.push(Queued::Exit);
        let removed = queue.remove_events(true);
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(payload(queue.pop()), Some(2));

        queue.push(event(TAG_B, 3));
        queue.push(Queued::Exit);
        assert_eq!(queue.remove_events(false).len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_by_tag_spares_exit() {
        let mut queue = EventQueue::new();
        queue.push(event(TAG_A, 1));
        queue.push(Queued::Exit);
        queue.push(event(TAG_B, 2));
        queue.push(event(TAG_A, 3));
        assert_eq!(queue.remove_by_tag(TAG_A).len(), 2);
        assert!(queue.contains_exit());
        assert!(queue.pop().unwrap().is_exit());
        assert_eq!(payload(queue.pop()), Some(2));
    }

    #[test]
    fn drained_events_are_destroyed() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let queue = ExternalQueue::with_listener(());
        for _ in 0..3 {
            queue.push(Queued::Event(Event::notify(TAG_A, Tracked(dropped.clone()))));
        }
        queue.push(Queued::Exit);
        assert_eq!(queue.remove_all(), 4);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());
    }
}
