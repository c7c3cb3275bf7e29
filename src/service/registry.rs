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

//! Server-side registry matching service stubs with the proxies waiting for them.

use std::collections::BTreeMap;

use super::address::{ProxyAddress, ServiceKey, StubAddress};
use crate::remote::{Cookie, MessageId, RemoteMessage};

/// Connection status of the stub side of a registry entry.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum ServiceStatus {
    #[display("disconnected")]
    Disconnected,
    #[display("connected")]
    Connected,
}

#[derive(Clone, Default, Debug)]
struct ServiceEntry {
    stub: Option<StubAddress>,
    proxies: Vec<ProxyAddress>,
}

impl ServiceEntry {
    fn is_empty(&self) -> bool { self.stub.is_none() && self.proxies.is_empty() }
}

fn notice(message_id: MessageId, target: Cookie, payload: Vec<u8>) -> RemoteMessage {
    RemoteMessage::control(message_id, Cookie::ROUTER, target).with_payload(payload)
}

/// Stubs and proxies registered by the connected clients.
///
/// Every registry change returns the notifications to be sent to the affected clients. Stubs
/// and proxies of the same connection are never notified about each other: the client resolves
/// them locally.
#[derive(Clone, Default, Debug)]
pub struct ServiceRegistry {
    entries: BTreeMap<ServiceKey, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn stub(&self, key: &ServiceKey) -> Option<&StubAddress> {
        self.entries.get(key).and_then(|entry| entry.stub.as_ref())
    }

    pub fn proxies(&self, key: &ServiceKey) -> &[ProxyAddress] {
        self.entries.get(key).map(|entry| entry.proxies.as_slice()).unwrap_or_default()
    }

    pub fn status(&self, key: &ServiceKey) -> ServiceStatus {
        match self.stub(key) {
            Some(_) => ServiceStatus::Connected,
            None => ServiceStatus::Disconnected,
        }
    }

    /// Stubs registered through the connection.
    pub fn stubs_of(&self, cookie: Cookie) -> Vec<StubAddress> {
        self.entries
            .values()
            .filter_map(|entry| entry.stub.as_ref())
            .filter(|stub| stub.cookie == cookie)
            .cloned()
            .collect()
    }

    /// Proxies registered through the connection.
    pub fn proxies_of(&self, cookie: Cookie) -> Vec<ProxyAddress> {
        self.entries
            .values()
            .flat_map(|entry| entry.proxies.iter())
            .filter(|proxy| proxy.cookie == cookie)
            .cloned()
            .collect()
    }

    /// Registers the stub, notifying every waiting proxy of another connection about it and the
    /// stub about each of these proxies. Registering a stub for a service which is already
    /// connected does nothing, the connected stub keeps serving it.
    pub fn register_stub(&mut self, stub: StubAddress) -> Vec<RemoteMessage> {
        let entry = self.entries.entry(stub.key.clone()).or_default();
        if entry.stub.is_some() {
            #[cfg(feature = "log")]
            {
                if let Some(connected) = entry.stub.as_ref().filter(|connected| *connected != &stub) {
                    log::warn!(target: "server-service", "Ignoring {stub}: the service is served by {connected}");
                }
            }
            return vec![];
        }
        let mut notices = vec![];
        for proxy in entry.proxies.iter().filter(|proxy| proxy.cookie != stub.cookie) {
            notices.push(notice(MessageId::SERVICE_REGISTERED, proxy.cookie, stub.encode()));
            notices.push(notice(MessageId::CLIENT_REGISTERED, stub.cookie, proxy.encode()));
        }
        entry.stub = Some(stub);
        notices
    }

    /// Registers the proxy, connecting it with the stub if one is already registered.
    pub fn register_proxy(&mut self, proxy: ProxyAddress) -> Vec<RemoteMessage> {
        let entry = self.entries.entry(proxy.key.clone()).or_default();
        if entry.proxies.contains(&proxy) {
            return vec![];
        }
        let mut notices = vec![];
        if let Some(stub) = entry.stub.as_ref().filter(|stub| stub.cookie != proxy.cookie) {
            notices.push(notice(MessageId::SERVICE_REGISTERED, proxy.cookie, stub.encode()));
            notices.push(notice(MessageId::CLIENT_REGISTERED, stub.cookie, proxy.encode()));
        }
        entry.proxies.push(proxy);
        notices
    }

    /// Removes the stub, notifying the proxies of other connections which stay waiting for it.
    pub fn unregister_stub(&mut self, stub: &StubAddress) -> Vec<RemoteMessage> {
        let Some(entry) = self.entries.get_mut(&stub.key) else {
            return vec![];
        };
        if entry.stub.as_ref() != Some(stub) {
            return vec![];
        }
        entry.stub = None;
        let notices = entry
            .proxies
            .iter()
            .filter(|proxy| proxy.cookie != stub.cookie)
            .map(|proxy| notice(MessageId::SERVICE_UNREGISTERED, proxy.cookie, stub.encode()))
            .collect();
        if entry.is_empty() {
            self.entries.remove(&stub.key);
        }
        notices
    }

    /// Removes the proxy, notifying the stub of another connection serving it.
    pub fn unregister_proxy(&mut self, proxy: &ProxyAddress) -> Vec<RemoteMessage> {
        let Some(entry) = self.entries.get_mut(&proxy.key) else {
            return vec![];
        };
        let before = entry.proxies.len();
        entry.proxies.retain(|registered| registered != proxy);
        if entry.proxies.len() == before {
            return vec![];
        }
        let notices = entry
            .stub
            .iter()
            .filter(|stub| stub.cookie != proxy.cookie)
            .map(|stub| notice(MessageId::CLIENT_UNREGISTERED, stub.cookie, proxy.encode()))
            .collect();
        if entry.is_empty() {
            self.entries.remove(&proxy.key);
        }
        notices
    }

    /// Removes everything registered through the connection.
    pub fn unregister_connection(&mut self, cookie: Cookie) -> Vec<RemoteMessage> {
        let mut notices = vec![];
        for proxy in self.proxies_of(cookie) {
            notices.extend(self.unregister_proxy(&proxy));
        }
        for stub in self.stubs_of(cookie) {
            notices.extend(self.unregister_stub(&stub));
        }
        notices
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::remote::PayloadReader;

    fn stub(cookie: u64) -> StubAddress { StubAddress::new("X", "main").with_cookie(Cookie::from(cookie)) }

    fn proxy(cookie: u64) -> ProxyAddress { ProxyAddress::new("X", "main").with_cookie(Cookie::from(cookie)) }

    #[test]
    fn fan_out() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.register_proxy(proxy(101)).is_empty());
        assert_eq!(registry.status(&stub(102).key), ServiceStatus::Disconnected);

        let notices = registry.register_stub(stub(102));
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].message_id(), MessageId::SERVICE_REGISTERED);
        assert_eq!(notices[0].target(), Cookie::from(101));
        assert_eq!(StubAddress::decode(&mut PayloadReader::new(notices[0].payload())).unwrap(), stub(102));
        assert_eq!(notices[1].message_id(), MessageId::CLIENT_REGISTERED);
        assert_eq!(notices[1].target(), Cookie::from(102));
        assert_eq!(ProxyAddress::decode(&mut PayloadReader::new(notices[1].payload())).unwrap(), proxy(101));
        assert_eq!(registry.status(&stub(102).key), ServiceStatus::Connected);

        // already connected
        assert!(registry.register_stub(stub(102)).is_empty());
        assert!(registry.register_proxy(proxy(101)).is_empty());
    }

    #[test]
    fn connected_stub_is_kept() {
        let mut registry = ServiceRegistry::new();
        registry.register_stub(stub(101));
        registry.register_proxy(proxy(103));

        assert!(registry.register_stub(stub(102)).is_empty());
        assert_eq!(registry.stub(&stub(101).key), Some(&stub(101)));
        assert!(registry.stubs_of(Cookie::from(102)).is_empty());
        assert!(registry.unregister_connection(Cookie::from(102)).is_empty());
        assert_eq!(registry.status(&stub(101).key), ServiceStatus::Connected);

        let notices = registry.unregister_stub(&stub(101));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message_id(), MessageId::SERVICE_UNREGISTERED);
        assert_eq!(notices[0].target(), Cookie::from(103));
        assert_eq!(registry.status(&stub(101).key), ServiceStatus::Disconnected);
    }

    #[test]
    fn same_connection_is_silent() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.register_stub(stub(101)).is_empty());
        assert!(registry.register_proxy(proxy(101)).is_empty());
        assert!(registry.unregister_proxy(&proxy(101)).is_empty());
        assert!(registry.register_proxy(proxy(101)).is_empty());
        assert!(registry.unregister_stub(&stub(101)).is_empty());
    }

    #[test]
    fn unregistration() {
        let mut registry = ServiceRegistry::new();
        registry.register_stub(stub(102));
        registry.register_proxy(proxy(101));
        registry.register_proxy(proxy(103));

        let notices = registry.unregister_proxy(&proxy(103));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message_id(), MessageId::CLIENT_UNREGISTERED);
        assert_eq!(notices[0].target(), Cookie::from(102));
        assert!(registry.unregister_proxy(&proxy(103)).is_empty());

        let notices = registry.unregister_connection(Cookie::from(102));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message_id(), MessageId::SERVICE_UNREGISTERED);
        assert_eq!(notices[0].target(), Cookie::from(101));
        assert_eq!(registry.proxies(&proxy(101).key), &[proxy(101)]);

        assert!(registry.unregister_connection(Cookie::from(101)).is_empty());
        assert!(registry.is_empty());
    }
}
