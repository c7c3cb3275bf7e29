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

//! Dispatcher threads: OS threads hosting exactly one [`Dispatcher`] each.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dispatcher::{DispatchHandler, Dispatcher};
use crate::event::{Event, EventConsumer, EventTag};
use crate::sync::{lock, Gate};

/// Numeric identifier of a dispatcher thread, unique within the process.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From)]
#[wrapper(Display, LowerHex)]
pub struct DispatcherId(u64);

impl DispatcherId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn value(self) -> u64 { self.0 }
}

/// How long [`DispatcherThread::destroy_thread`] waits for the thread to complete.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitMode {
    /// Wait until the thread completes.
    Infinite,
    /// Wait up to the given time; after that the thread is detached.
    Timeout(Duration),
    /// Request the exit and detach the thread immediately.
    NoWait,
}

struct ThreadInner {
    id: DispatcherId,
    dispatcher: Dispatcher,
    handle: Mutex<Option<JoinHandle<()>>>,
    exit_requested: AtomicBool,
    started: Gate,
    finished: Gate,
}

impl ThreadInner {
    fn run_loop<H: DispatchHandler>(&self, mut handler: H) {
        if !self.dispatcher.start() {
            #[cfg(feature = "log")]
            log::error!(target: "thread", "Dispatcher {} is already running", self.dispatcher.name());
            self.finished.open();
            return;
        }
        handler.handle_started(&self.dispatcher);
        self.started.open();
        if self.exit_requested.load(Ordering::SeqCst) {
            self.dispatcher.post_exit();
        }

        #[cfg(feature = "log")]
        log::debug!(target: "thread", "Thread {} ({}) entered dispatch loop", self.dispatcher.name(), self.id);

        let res = self.dispatcher.run(&mut handler);

        #[cfg(feature = "log")]
        {
            match res {
                Ok(()) => log::debug!(target: "thread", "Thread {} ({}) exited cleanly", self.dispatcher.name(), self.id),
                Err(err) => log::error!(target: "thread", "Thread {} ({}) failed: {err}", self.dispatcher.name(), self.id),
            }
        }

        self.started.close();
        self.finished.open();
    }
}

/// OS thread running the dispatch loop of its [`Dispatcher`].
///
/// The handle is cheap to clone; the thread keeps running until it is requested to exit.
#[derive(Clone)]
pub struct DispatcherThread {
    inner: Arc<ThreadInner>,
}

impl DispatcherThread {
    /// Spawns a new named thread running a plain dispatch loop extended with the `handler`
    /// hooks.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to spawn a thread.
    pub fn spawn<H>(name: impl Into<String>, handler: H) -> io::Result<Self>
    where H: DispatchHandler + 'static {
        let name = name.into();
        let builder = thread::Builder::new().name(name.clone());
        Self::with(Dispatcher::new(name), handler, builder)
    }

    /// Spawns a thread running the loop of an already constructed dispatcher.
    ///
    /// Similar to the [`DispatcherThread::spawn`], but allows to fully customize how the thread
    /// is constructed.
    pub fn with<H>(
        dispatcher: Dispatcher,
        handler: H,
        builder: thread::Builder,
    ) -> io::Result<Self>
    where
        H: DispatchHandler + 'static,
    {
        let inner = Arc::new(ThreadInner {
            id: DispatcherId::next(),
            dispatcher,
            handle: Mutex::new(None),
            exit_requested: AtomicBool::new(false),
            started: Gate::new(),
            finished: Gate::new(),
        });

        #[cfg(feature = "log")]
        log::debug!(target: "thread", "Spawning dispatcher thread {} ({})", inner.dispatcher.name(), inner.id);

        let runtime = inner.clone();
        let handle = builder.spawn(move || runtime.run_loop(handler))?;
        *lock(&inner.handle) = Some(handle);
        Ok(Self { inner })
    }

    pub fn id(&self) -> DispatcherId { self.inner.id }

    pub fn name(&self) -> &str { self.inner.dispatcher.name() }

    pub fn dispatcher(&self) -> &Dispatcher { &self.inner.dispatcher }

    /// Address of the thread object.
    pub fn addr(&self) -> usize { Arc::as_ptr(&self.inner) as usize }

    pub fn is_running(&self) -> bool { self.inner.started.is_open() }

    pub fn post_event(&self, event: Event) -> bool { self.inner.dispatcher.post_event(event) }

    pub fn register_consumer(&self, tag: EventTag, consumer: Arc<dyn EventConsumer>) -> bool {
        self.inner.dispatcher.register_consumer(tag, consumer)
    }

    /// Blocks until the dispatch loop of the thread has started. `None` waits infinitely.
    ///
    /// # Returns
    ///
    /// Whether the loop is running.
    pub fn wait_for_dispatcher_start(&self, timeout: Option<Duration>) -> bool {
        self.inner.started.wait(timeout)
    }

    /// Requests the thread to exit after dispatching the events which are already queued.
    ///
    /// Has no effect if the thread has not started its loop.
    pub fn set_exit_event(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inner.dispatcher.post_exit()
    }

    /// Requests the thread to exit and waits for it to complete.
    ///
    /// # Returns
    ///
    /// `true` if the thread has completed, `false` if it was detached before completing.
    pub fn destroy_thread(&self, wait: WaitMode) -> bool {
        // a loop which has not started yet picks up the request right after the start
        self.inner.exit_requested.store(true, Ordering::SeqCst);
        self.set_exit_event();

        let own = lock(&self.inner.handle)
            .as_ref()
            .map(|handle| handle.thread().id() == thread::current().id())
            .unwrap_or_default();
        if own {
            return false;
        }

        let completed = match wait {
            WaitMode::Infinite => self.inner.finished.wait(None),
            WaitMode::Timeout(timeout) => self.inner.finished.wait(Some(timeout)),
            WaitMode::NoWait => self.inner.finished.is_open(),
        };

        let handle = lock(&self.inner.handle).take();
        match handle {
            Some(handle) if completed => {
                let _ = handle.join();
            }
            Some(_) => {
                #[cfg(feature = "log")]
                log::warn!(target: "thread", "Detaching thread {} which has not completed", self.name());
            }
            None => {}
        }
        completed
    }
}

/// Directory of dispatcher threads supporting lookups by name, id and address.
///
/// The directory keeps weak references, so registered threads are not kept alive by it.
#[derive(Clone, Default)]
pub struct ThreadDirectory {
    threads: Arc<Mutex<Vec<Weak<ThreadInner>>>>,
}

impl ThreadDirectory {
    pub fn new() -> Self { Self::default() }

    /// Adds the thread to the directory. Fails if another live thread with the same name is
    /// already present.
    pub fn register(&self, thread: &DispatcherThread) -> bool {
        let mut threads = lock(&self.threads);
        threads.retain(|weak| weak.strong_count() > 0);
        let duplicate = threads
            .iter()
            .filter_map(Weak::upgrade)
            .any(|inner| inner.dispatcher.name() == thread.name());
        if duplicate {
            return false;
        }
        threads.push(Arc::downgrade(&thread.inner));
        true
    }

    pub fn unregister(&self, thread: &DispatcherThread) -> bool {
        let mut threads = lock(&self.threads);
        let before = threads.len();
        threads.retain(|weak| weak.strong_count() > 0 && !Weak::ptr_eq(weak, &Arc::downgrade(&thread.inner)));
        threads.len() != before
    }

    fn find(&self, f: impl Fn(&ThreadInner) -> bool) -> Option<DispatcherThread> {
        lock(&self.threads)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|inner| inner.started.is_open())
            .find(|inner| f(inner))
            .map(|inner| DispatcherThread { inner })
    }

    /// Finds a running thread by its name.
    pub fn find_by_name(&self, name: &str) -> Option<DispatcherThread> {
        self.find(|inner| inner.dispatcher.name() == name)
    }

    pub fn find_by_id(&self, id: DispatcherId) -> Option<DispatcherThread> {
        self.find(|inner| inner.id == id)
    }

    pub fn find_by_address(&self, addr: usize) -> Option<DispatcherThread> {
        self.find(|inner| inner as *const ThreadInner as usize == addr)
    }

    /// Dispatcher of the running thread with the given name, or the null dispatcher.
    pub fn dispatcher_or_null(&self, name: &str) -> Dispatcher {
        self.find_by_name(name)
            .map(|thread| thread.dispatcher().clone())
            .unwrap_or_else(Dispatcher::null)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::dispatcher::DispatchContext;

    const TAG: EventTag = EventTag::new("count");
    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    struct Counter(AtomicUsize);
    impl EventConsumer for Counter {
        fn process_event(&self, _event: &Event, _ctx: &DispatchContext<'_>) {
            thread::sleep(Duration::from_millis(1));
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lifecycle() {
        let thread = DispatcherThread::spawn("worker", ()).unwrap();
        assert!(thread.wait_for_dispatcher_start(WAIT));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        assert!(thread.register_consumer(TAG, counter.clone()));
        for _ in 0..10 {
            assert!(thread.post_event(Event::notify(TAG, ())));
        }
        assert!(thread.destroy_thread(WaitMode::Infinite));
        // already queued events are dispatched before the exit
        assert_eq!(counter.0.load(Ordering::SeqCst), 10);
        assert!(!thread.is_running());
        assert!(!thread.post_event(Event::notify(TAG, ())));
    }

    #[test]
    fn directory_lookup() {
        let directory = ThreadDirectory::new();
        let thread = DispatcherThread::spawn("lookup", ()).unwrap();
        assert!(thread.wait_for_dispatcher_start(WAIT));
        assert!(directory.register(&thread));
        assert!(!directory.register(&thread));

        assert_eq!(directory.find_by_name("lookup").unwrap().id(), thread.id());
        assert_eq!(directory.find_by_id(thread.id()).unwrap().name(), "lookup");
        assert!(directory.find_by_address(thread.addr()).is_some());
        assert!(directory.find_by_name("missing").is_none());
        assert_eq!(directory.dispatcher_or_null("missing"), Dispatcher::null());

        assert!(thread.destroy_thread(WaitMode::Timeout(Duration::from_secs(5))));
        assert!(directory.find_by_name("lookup").is_none());
        assert!(!directory.dispatcher_or_null("lookup").post_event(Event::notify(TAG, ())));
        assert!(directory.unregister(&thread));
    }
}
