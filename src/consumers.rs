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

//! Registry of the event consumers subscribed to a dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{consumer_addr, EventConsumer, EventTag};

/// Mapping of event tags to the set of consumers registered for them.
///
/// A consumer is identified by its address, so the same object can be registered only once per
/// tag. A tag without consumers has no entry in the registry.
#[derive(Default)]
pub struct ConsumerRegistry {
    map: HashMap<EventTag, Vec<Arc<dyn EventConsumer>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self { Self::default() }

    /// Number of tags having at least one consumer.
    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Registers a consumer for the tag. Returns `false` if the consumer was already registered.
    pub fn register(&mut self, tag: EventTag, consumer: Arc<dyn EventConsumer>) -> bool {
        let list = self.map.entry(tag).or_default();
        let addr = consumer_addr(&consumer);
        if list.iter().any(|c| consumer_addr(c) == addr) {
            return false;
        }
        list.push(consumer);
        true
    }

    /// Unregisters the consumer from the tag. Repeated unregistration is a no-op returning
    /// `false`.
    pub fn unregister(&mut self, tag: EventTag, consumer: &Arc<dyn EventConsumer>) -> bool {
        let Some(list) = self.map.get_mut(&tag) else {
            return false;
        };
        let addr = consumer_addr(consumer);
        let before = list.len();
        list.retain(|c| consumer_addr(c) != addr);
        let removed = list.len() != before;
        if list.is_empty() {
            self.map.remove(&tag);
        }
        removed
    }

    /// Removes the consumer from all tags, returning the number of tags it was registered for.
    pub fn remove_consumer(&mut self, consumer: &Arc<dyn EventConsumer>) -> usize {
        let addr = consumer_addr(consumer);
        let mut count = 0;
        self.map.retain(|_, list| {
            let before = list.len();
            list.retain(|c| consumer_addr(c) != addr);
            count += before - list.len();
            !list.is_empty()
        });
        count
    }

    pub fn has_consumer(&self, tag: EventTag) -> bool { self.map.contains_key(&tag) }

    pub fn is_registered(&self, tag: EventTag, consumer: &Arc<dyn EventConsumer>) -> bool {
        let addr = consumer_addr(consumer);
        self.map
            .get(&tag)
            .map(|list| list.iter().any(|c| consumer_addr(c) == addr))
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, tag: EventTag) -> usize {
        self.map.get(&tag).map(Vec::len).unwrap_or_default()
    }

    /// Snapshot of the consumers registered for the tag.
    pub fn consumers(&self, tag: EventTag) -> Vec<Arc<dyn EventConsumer>> {
        self.map.get(&tag).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self) { self.map.clear() }
}
