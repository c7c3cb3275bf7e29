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

//! Events: tagged, type-erased payloads travelling through dispatcher queues.

use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::dispatcher::DispatchContext;

/// Tag identifying a class of events. Consumers are registered per tag and the dispatcher routes
/// every event to the consumers registered for its tag.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EventTag(&'static str);

impl EventTag {
    pub const fn new(name: &'static str) -> Self { Self(name) }

    pub const fn name(self) -> &'static str { self.0 }
}

impl Display for EventTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { f.write_str(self.0) }
}

/// Event classification bits used for routing decisions.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct EventKind(u16);

impl EventKind {
    /// Produced and consumed by the dispatching thread itself.
    pub const INTERNAL: Self = Self(0x0001);
    /// May be produced by any thread.
    pub const EXTERNAL: Self = Self(0x0002);
    pub const LOCAL: Self = Self(0x0010);
    pub const REMOTE: Self = Self(0x0020);
    pub const NOTIFY: Self = Self(0x0100);
    pub const REQUEST: Self = Self(0x0200);
    pub const RESPONSE: Self = Self(0x0400);
    /// Connection status and version notifications. These survive a queue drain which keeps
    /// specials.
    pub const CONNECT: Self = Self(0x0800);
    pub const CUSTOM: Self = Self(0x8000);

    pub const fn bits(self) -> u16 { self.0 }

    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    pub const fn union(self, other: Self) -> Self { Self(self.0 | other.0) }

    pub const fn is_internal(self) -> bool { self.contains(Self::INTERNAL) }
    pub const fn is_external(self) -> bool { !self.is_internal() }
    pub const fn is_remote(self) -> bool { self.contains(Self::REMOTE) }
    pub const fn is_special(self) -> bool { self.contains(Self::CONNECT) }

    pub(crate) fn into_internal(self) -> Self {
        Self((self.0 & !Self::EXTERNAL.0) | Self::INTERNAL.0)
    }
}

impl BitOr for EventKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output { self.union(rhs) }
}

impl BitOrAssign for EventKind {
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

impl Debug for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventKind, &str); 9] = [
            (EventKind::INTERNAL, "internal"),
            (EventKind::EXTERNAL, "external"),
            (EventKind::LOCAL, "local"),
            (EventKind::REMOTE, "remote"),
            (EventKind::NOTIFY, "notify"),
            (EventKind::REQUEST, "request"),
            (EventKind::RESPONSE, "response"),
            (EventKind::CONNECT, "connect"),
            (EventKind::CUSTOM, "custom"),
        ];
        let mut first = true;
        for (kind, name) in NAMES {
            if self.contains(kind) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Object receiving events from a dispatcher.
///
/// Consumers are shared between threads: they may be registered from any thread, while
/// [`EventConsumer::process_event`] is always called in the context of the dispatching thread.
pub trait EventConsumer: Send + Sync {
    fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>);
}

impl<F> EventConsumer for F
where F: Fn(&Event, &DispatchContext<'_>) + Send + Sync
{
    fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>) { self(event, ctx) }
}

/// Address of a consumer object, used as its identity inside registries.
pub(crate) fn consumer_addr(consumer: &Arc<dyn EventConsumer>) -> usize {
    Arc::as_ptr(consumer) as *const () as usize
}

/// A single event.
///
/// The event owns its payload; it is moved into a queue on posting and dropped right after it
/// was dispatched (or when a queue holding it is drained). Payload types may rely on `Drop` to
/// detect this.
pub struct Event {
    tag: EventTag,
    kind: EventKind,
    payload: Box<dyn Any + Send>,
    consumer: Option<Arc<dyn EventConsumer>>,
}

impl Event {
    pub fn new<T: Any + Send>(tag: EventTag, kind: EventKind, payload: T) -> Self {
        Self {
            tag,
            kind,
            payload: Box::new(payload),
            consumer: None,
        }
    }

    /// Constructs an external, local notification event.
    pub fn notify<T: Any + Send>(tag: EventTag, payload: T) -> Self {
        Self::new(tag, EventKind::EXTERNAL | EventKind::LOCAL | EventKind::NOTIFY, payload)
    }

    /// Binds the event to a single consumer, bypassing the consumer registry of the dispatcher.
    pub fn with_consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn tag(&self) -> EventTag { self.tag }

    pub fn kind(&self) -> EventKind { self.kind }

    pub fn consumer(&self) -> Option<&Arc<dyn EventConsumer>> { self.consumer.as_ref() }

    pub fn payload<T: Any>(&self) -> Option<&T> { self.payload.downcast_ref() }

    pub fn into_payload<T: Any>(self) -> Result<T, Self> {
        let Self {
            tag,
            kind,
            payload,
            consumer,
        } = self;
        match payload.downcast::<T>() {
            Ok(payload) => Ok(*payload),
            Err(payload) => Err(Self {
                tag,
                kind,
                payload,
                consumer,
            }),
        }
    }

    pub(crate) fn set_kind(&mut self, kind: EventKind) { self.kind = kind }
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("bound", &self.consumer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TAG: EventTag = EventTag::new("test");

    #[test]
    fn kind_bits() {
        let kind = EventKind::EXTERNAL | EventKind::REMOTE | EventKind::CONNECT;
        assert!(kind.is_external());
        assert!(kind.is_remote());
        assert!(kind.is_special());
        assert!(!kind.is_internal());

        let internal = kind.into_internal();
        assert!(internal.is_internal());
        assert!(!internal.contains(EventKind::EXTERNAL));
        assert!(internal.is_remote());
        assert_eq!(format!("{internal:?}"), "internal|remote|connect");
    }

    #[test]
    fn payload_access() {
        let event = Event::notify(TAG, 42u32);
        assert_eq!(event.tag(), TAG);
        assert_eq!(event.payload::<u32>(), Some(&42));
        assert_eq!(event.payload::<u64>(), None);

        let event = event.into_payload::<String>().unwrap_err();
        assert_eq!(event.into_payload::<u32>().unwrap(), 42);
    }
}
