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

//! Event dispatcher: a pair of event queues and a consumer registry served by a dispatch loop
//! running in the owning thread.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::cell::RefCell;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::consumers::ConsumerRegistry;
use crate::event::{Event, EventConsumer, EventTag};
use crate::queue::{EventQueue, ExternalQueue, Queued};
use crate::sync::{lock, Signals, Wakeup};

/// Dispatcher errors
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// dispatcher {0} was not started before running its dispatch loop.
    NotStarted(String),

    /// an attempt to run the dispatch loop of the null dispatcher.
    Invalid,
}

/// Hooks of a dispatch loop, allowing a thread hosting the dispatcher to extend the loop with
/// additional sources of work.
///
/// All methods are called in the context of the dispatching thread.
pub trait DispatchHandler: Send {
    /// Maximum time to block waiting for events. `None` blocks until an event or the exit
    /// signal arrives; zero timeout turns the wait into a poll, after which
    /// [`Self::handle_idle`] is called.
    fn wait_timeout(&self) -> Option<Duration> { None }

    /// Whether the loop waits on the completion object of the dispatcher in addition to the exit
    /// and queue signals.
    fn waits_completion(&self) -> bool { false }

    /// Called once the dispatch loop is about to start.
    fn handle_started(&mut self, dispatcher: &Dispatcher) {}

    /// Filter applied to each event before the dispatch. Returning `false` skips the dispatch;
    /// the event still goes through [`Self::postprocess`].
    fn prefilter(&mut self, event: &Event) -> bool { true }

    /// Cleanup after the event was dispatched. Dropping the event destroys it.
    fn postprocess(&mut self, event: Event) {}

    /// Called when the completion object was signalled.
    fn handle_completion(&mut self, ctx: &DispatchContext<'_>) {}

    /// Called when waiting has timed out with no event.
    fn handle_idle(&mut self, ctx: &DispatchContext<'_>) {}

    /// Called after the dispatch loop has exited and the queues were drained.
    fn handle_exit(&mut self, dispatcher: &Dispatcher) {}
}

impl DispatchHandler for () {}

/// Context of a running dispatch loop passed to the consumers.
pub struct DispatchContext<'a> {
    dispatcher: &'a Dispatcher,
    internal: &'a RefCell<EventQueue>,
}

impl<'a> DispatchContext<'a> {
    /// Dispatcher running the loop.
    pub fn dispatcher(&self) -> &'a Dispatcher { self.dispatcher }

    /// Queues an internal event. Internal events produced while processing an event are all
    /// dispatched before the next external event is taken from the external queue.
    pub fn post_internal(&self, mut event: Event) {
        event.set_kind(event.kind().into_internal());
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher", "Queueing internal event {} in {}", event.tag(), self.dispatcher.name());
        self.internal.borrow_mut().push(Queued::Event(event));
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Dispatcher>> = const { RefCell::new(None) };
}

struct Shared {
    name: String,
    valid: bool,
    running: AtomicBool,
    signals: Arc<Signals>,
    external: ExternalQueue<Arc<Signals>>,
    consumers: Mutex<ConsumerRegistry>,
}

/// Event dispatcher.
///
/// The dispatcher is a cheaply clonable handle; all clones refer to the same queues. Events may
/// be posted from any thread, but the dispatch loop ([`Dispatcher::run`]) must be executed by a
/// single thread owning the dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.shared.name)
            .field("valid", &self.shared.valid)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PartialEq for Dispatcher {
    fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.shared, &other.shared) }
}

impl Eq for Dispatcher {}

impl Dispatcher {
    pub fn new(name: impl Into<String>) -> Self { Self::with(name.into(), true) }

    /// Shared sentinel dispatcher which is never running: all events posted to it are destroyed
    /// and all registrations fail.
    pub fn null() -> Self {
        static NULL: OnceLock<Dispatcher> = OnceLock::new();
        NULL.get_or_init(|| Self::with(s!("null"), false)).clone()
    }

    fn with(name: String, valid: bool) -> Self {
        let signals = Arc::new(Signals::new());
        Self {
            shared: Arc::new(Shared {
                name,
                valid,
                running: AtomicBool::new(false),
                external: ExternalQueue::with_listener(signals.clone()),
                signals,
                consumers: Mutex::new(ConsumerRegistry::new()),
            }),
        }
    }

    /// Dispatcher whose loop is run by the calling thread, or the null dispatcher.
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone()).unwrap_or_else(Self::null)
    }

    pub fn name(&self) -> &str { &self.shared.name }

    pub fn is_valid(&self) -> bool { self.shared.valid }

    pub fn is_running(&self) -> bool { self.shared.running.load(Ordering::SeqCst) }

    /// Address of the dispatcher, unique among live dispatchers.
    pub fn addr(&self) -> usize { Arc::as_ptr(&self.shared) as usize }

    /// Number of events waiting in the external queue.
    pub fn pending_events(&self) -> usize { self.shared.external.len() }

    /// Marks the dispatcher as running, so it starts accepting events. Returns `false` if the
    /// dispatcher is already running or is the null dispatcher.
    pub fn start(&self) -> bool {
        if !self.shared.valid {
            return false;
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.signals.reset_exit();
        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher", "Dispatcher {} started", self.name());
        true
    }

    /// Posts an event to the external queue.
    ///
    /// Events posted to a dispatcher which is not running are destroyed immediately and
    /// `false` is returned.
    pub fn post_event(&self, event: Event) -> bool {
        if !self.shared.valid || !self.is_running() {
            #[cfg(feature = "log")]
            log::warn!(target: "dispatcher", "Dropping event {} posted to inactive dispatcher {}", event.tag(), self.name());
            return false;
        }
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher", "Queueing event {} ({:?}) in {}", event.tag(), event.kind(), self.name());
        self.shared.external.push(Queued::Event(event));
        true
    }

    /// Appends the exit marker to the external queue without removing already queued events,
    /// which are dispatched before the loop exits.
    pub fn post_exit(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.shared.external.push(Queued::Exit);
        true
    }

    /// Drops all pending external events and queues the exit marker.
    pub fn stop(&self) -> bool { self.exit(false) }

    /// Drops pending external events except connection status notifications and queues the exit
    /// marker.
    pub fn shutdown(&self) -> bool { self.exit(true) }

    fn exit(&self, keep_specials: bool) -> bool {
        if !self.is_running() {
            return false;
        }
        let removed = self.shared.external.remove_events(keep_specials);
        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher", "Stopping dispatcher {}, {removed} pending event(s) dropped", self.name());
        self.shared.external.push(Queued::Exit);
        true
    }

    /// Sets the exit signal, making the loop exit right after the event being currently
    /// dispatched.
    pub fn signal_exit(&self) { self.shared.signals.set_exit() }

    /// Sets the completion object, waking up loops which wait for it.
    pub fn signal_completion(&self) { self.shared.signals.set_completion() }

    pub fn register_consumer(&self, tag: EventTag, consumer: Arc<dyn EventConsumer>) -> bool {
        if !self.shared.valid {
            return false;
        }
        let registered = lock(&self.shared.consumers).register(tag, consumer);
        #[cfg(feature = "log")]
        {
            if !registered {
                log::warn!(target: "dispatcher", "Consumer is already registered for {tag} in {}", self.name());
            }
        }
        registered
    }

    pub fn unregister_consumer(&self, tag: EventTag, consumer: &Arc<dyn EventConsumer>) -> bool {
        lock(&self.shared.consumers).unregister(tag, consumer)
    }

    /// Unregisters the consumer from all tags.
    pub fn remove_consumer(&self, consumer: &Arc<dyn EventConsumer>) -> usize {
        lock(&self.shared.consumers).remove_consumer(consumer)
    }

    pub fn has_consumer(&self, tag: EventTag) -> bool {
        lock(&self.shared.consumers).has_consumer(tag)
    }

    pub fn consumer_count(&self, tag: EventTag) -> usize {
        lock(&self.shared.consumers).consumer_count(tag)
    }

    /// Removes pending external events with the given tag, returning their number.
    pub fn remove_events(&self, tag: EventTag) -> usize { self.shared.external.remove_by_tag(tag) }

    /// Runs the dispatch loop until the exit marker is popped or the exit signal is set.
    ///
    /// # Blocking
    ///
    /// Blocks the calling thread, which becomes the owner of the dispatcher for the time of the
    /// call.
    pub fn run<H: DispatchHandler + ?Sized>(&self, handler: &mut H) -> Result<(), Error> {
        if !self.shared.valid {
            return Err(Error::Invalid);
        }
        if !self.is_running() {
            return Err(Error::NotStarted(self.name().to_owned()));
        }

        let internal = RefCell::new(EventQueue::new());
        let outer = CURRENT.with(|current| current.replace(Some(self.clone())));
        let ctx = DispatchContext {
            dispatcher: self,
            internal: &internal,
        };

        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher", "Entering dispatch loop of {}", self.name());

        loop {
            let wakeup =
                self.shared.signals.wait(handler.wait_timeout(), handler.waits_completion());
            let proceed = match wakeup {
                Wakeup::Exit => false,
                Wakeup::Completion => {
                    handler.handle_completion(&ctx);
                    true
                }
                Wakeup::Timeout => {
                    handler.handle_idle(&ctx);
                    true
                }
                Wakeup::Queue => match self.shared.external.pop() {
                    // spurious wakeup
                    None => true,
                    Some(Queued::Exit) => false,
                    Some(Queued::Event(event)) => {
                        self.dispatch(event, handler, &ctx);
                        true
                    }
                },
            };
            if !proceed || !self.drain_internal(handler, &ctx) {
                break;
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        CURRENT.with(|current| *current.borrow_mut() = outer);
        let removed = self.shared.external.remove_all();
        let residue = internal.borrow_mut().remove_all();
        lock(&self.shared.consumers).clear();

        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher", "Dispatcher {} exited, {} external and {} internal event(s) dropped",
            self.name(), removed, residue.len());

        drop(residue);
        handler.handle_exit(self);
        Ok(())
    }

    /// Dispatches all internal events. Returns `false` if the loop must exit.
    fn drain_internal<H: DispatchHandler + ?Sized>(
        &self,
        handler: &mut H,
        ctx: &DispatchContext<'_>,
    ) -> bool {
        loop {
            if self.shared.signals.is_exit() {
                return false;
            }
            let next = ctx.internal.borrow_mut().pop();
            match next {
                None => return true,
                Some(Queued::Exit) => return false,
                Some(Queued::Event(event)) => self.dispatch(event, handler, ctx),
            }
        }
    }

    fn dispatch<H: DispatchHandler + ?Sized>(
        &self,
        event: Event,
        handler: &mut H,
        ctx: &DispatchContext<'_>,
    ) {
        if handler.prefilter(&event) {
            if let Some(consumer) = event.consumer().cloned() {
                consumer.process_event(&event, ctx);
            } else {
                let consumers = lock(&self.shared.consumers).consumers(event.tag());
                #[cfg(feature = "log")]
                {
                    if consumers.is_empty() {
                        log::warn!(target: "dispatcher", "No consumer for event {} in {}", event.tag(), self.name());
                    }
                }
                for consumer in consumers {
                    consumer.process_event(&event, ctx);
                }
            }
        }
        handler.postprocess(event);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;
    use crate::event::EventKind;

    const EXTERNAL: EventTag = EventTag::new("external");
    const INTERNAL: EventTag = EventTag::new("internal");

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);
    impl Journal {
        fn log(&self, s: String) { lock(&self.0).push(s) }
        fn entries(&self) -> Vec<String> { lock(&self.0).clone() }
    }

    struct Fanout(Arc<Journal>);
    impl EventConsumer for Fanout {
        fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>) {
            let name = event.payload::<&'static str>().copied().unwrap_or("?");
            self.0.log(name.to_owned());
            if event.tag() == EXTERNAL && name == "E1" {
                ctx.post_internal(Event::notify(INTERNAL, "I1"));
                ctx.post_internal(Event::notify(INTERNAL, "I2"));
            }
        }
    }

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    #[test]
    fn internal_events_drain_first() {
        let journal = Arc::new(Journal::default());
        let dispatcher = Dispatcher::new("ordering");
        let consumer: Arc<dyn EventConsumer> = Arc::new(Fanout(journal.clone()));
        assert!(dispatcher.register_consumer(EXTERNAL, consumer.clone()));
        assert!(dispatcher.register_consumer(INTERNAL, consumer));
        assert!(dispatcher.start());

        assert!(dispatcher.post_event(Event::notify(EXTERNAL, "E1")));
        assert!(dispatcher.post_event(Event::notify(EXTERNAL, "E2")));
        assert!(dispatcher.post_exit());
        dispatcher.run(&mut ()).unwrap();

        assert_eq!(journal.entries(), vec!["E1", "I1", "I2", "E2"]);
        assert!(!dispatcher.is_running());
        assert!(!dispatcher.has_consumer(EXTERNAL));
    }

    #[test]
    fn current_dispatcher() {
        let dispatcher = Dispatcher::new("current");
        assert_eq!(Dispatcher::current(), Dispatcher::null());
        let seen = Arc::new(Mutex::new(None));
        let observed = seen.clone();
        dispatcher.register_consumer(
            EXTERNAL,
            Arc::new(move |_: &Event, _: &DispatchContext<'_>| {
                *lock(&observed) = Some(Dispatcher::current());
            }),
        );
        assert!(dispatcher.start());
        dispatcher.post_event(Event::notify(EXTERNAL, ()));
        dispatcher.post_exit();
        dispatcher.run(&mut ()).unwrap();
        assert_eq!(lock(&seen).take(), Some(dispatcher));
        assert_eq!(Dispatcher::current(), Dispatcher::null());
    }

    #[test]
    fn rejects_when_not_started() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new("idle");
        assert!(!dispatcher.post_event(Event::notify(EXTERNAL, Tracked(dropped.clone()))));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.run(&mut ()), Err(Error::NotStarted(s!("idle"))));
    }

    #[test]
    fn exit_marker_consumed_once() {
        let journal = Arc::new(Journal::default());
        let dispatcher = Dispatcher::new("exit");
        dispatcher.register_consumer(EXTERNAL, Arc::new(Fanout(journal.clone())));
        assert!(dispatcher.start());
        dispatcher.post_event(Event::notify(EXTERNAL, "A"));
        dispatcher.post_exit();
        dispatcher.post_exit();
        dispatcher.post_exit();
        dispatcher.run(&mut ()).unwrap();
        assert_eq!(journal.entries(), vec!["A"]);
        assert_eq!(dispatcher.pending_events(), 0);

        // the dispatcher can be restarted
        dispatcher.register_consumer(EXTERNAL, Arc::new(Fanout(journal.clone())));
        assert!(dispatcher.start());
        dispatcher.post_event(Event::notify(EXTERNAL, "B"));
        dispatcher.post_exit();
        dispatcher.run(&mut ()).unwrap();
        assert_eq!(journal.entries(), vec!["A", "B"]);
    }

    #[test]
    fn stop_drops_pending_events() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new("stop");
        assert!(dispatcher.start());
        dispatcher.post_event(Event::notify(EXTERNAL, Tracked(dropped.clone())));
        dispatcher.post_event(Event::new(
            EXTERNAL,
            EventKind::EXTERNAL | EventKind::CONNECT,
            Tracked(dropped.clone()),
        ));
        assert!(dispatcher.shutdown());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_events(), 2);
        assert!(dispatcher.stop());
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        dispatcher.run(&mut ()).unwrap();
    }

    #[test]
    fn bound_consumer_bypasses_registry() {
        let journal = Arc::new(Journal::default());
        let registered = Arc::new(Journal::default());
        let dispatcher = Dispatcher::new("bound");
        dispatcher.register_consumer(EXTERNAL, Arc::new(Fanout(registered.clone())));
        assert!(dispatcher.start());
        dispatcher.post_event(
            Event::notify(EXTERNAL, "direct").with_consumer(Arc::new(Fanout(journal.clone()))),
        );
        dispatcher.post_exit();
        dispatcher.run(&mut ()).unwrap();
        assert_eq!(journal.entries(), vec!["direct"]);
        assert!(registered.entries().is_empty());
    }

    #[test]
    fn prefilter_skips_dispatch() {
        struct SkipAll(usize);
        impl DispatchHandler for SkipAll {
            fn prefilter(&mut self, _event: &Event) -> bool { false }
            fn postprocess(&mut self, _event: Event) { self.0 += 1 }
        }

        let journal = Arc::new(Journal::default());
        let dispatcher = Dispatcher::new("filter");
        dispatcher.register_consumer(EXTERNAL, Arc::new(Fanout(journal.clone())));
        assert!(dispatcher.start());
        dispatcher.post_event(Event::notify(EXTERNAL, "E1"));
        dispatcher.post_exit();
        let mut handler = SkipAll(0);
        dispatcher.run(&mut handler).unwrap();
        assert_eq!(handler.0, 1);
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn exit_signal_interrupts_cross_thread() {
        let dispatcher = Dispatcher::new("signal");
        assert!(dispatcher.start());
        let remote = dispatcher.clone();
        let handle = thread::spawn(move || remote.run(&mut ()));
        thread::sleep(Duration::from_millis(20));
        dispatcher.signal_exit();
        handle.join().unwrap().unwrap();
        assert!(!dispatcher.is_running());
    }

    #[test]
    fn null_dispatcher() {
        let null = Dispatcher::null();
        assert_eq!(null, Dispatcher::null());
        assert!(!null.start());
        assert!(!null.post_event(Event::notify(EXTERNAL, ())));
        assert!(!null.register_consumer(EXTERNAL, Arc::new(Fanout(Arc::default()))));
        assert_eq!(null.run(&mut ()), Err(Error::Invalid));
    }
}
