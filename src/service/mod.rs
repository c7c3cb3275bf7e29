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

//! Client and server services managing a remote connection from their own dispatcher threads.

#![allow(unused_variables)] // because we need them for feature-gated logger

mod address;
mod client;
mod policy;
mod registry;
mod server;

use std::sync::Arc;
use std::time::Duration;

pub use address::{Channel, ProxyAddress, ServiceKey, StubAddress};
pub use client::ClientService;
pub use policy::AcceptPolicy;
pub use registry::{ServiceRegistry, ServiceStatus};
pub use server::ServerService;

use crate::dispatcher::{DispatchHandler, Dispatcher};
use crate::event::{Event, EventConsumer, EventKind, EventTag};
use crate::remote::{RemoteMessage, SendThread, TRANSPORT_EVENT};
use crate::thread::{DispatcherThread, WaitMode};

/// Tag of the commands driving the service state machine.
pub const SERVICE_COMMAND: EventTag = EventTag::new("service-command");

/// Time given to a send or receive thread to complete after a connection is lost.
const LINK_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection state of a service.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
pub enum ServiceState {
    #[default]
    #[display("stopped")]
    Stopped,
    #[display("starting")]
    Starting,
    #[display("started")]
    Started,
    #[display("stopping")]
    Stopping,
}

/// Commands processed by the service thread.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) enum ServiceCommand {
    StartService,
    StopService,
    ServiceStarted,
    ServiceStopped,
    ServiceLost,
}

impl ServiceCommand {
    pub(crate) fn into_event(self) -> Event {
        Event::new(SERVICE_COMMAND, EventKind::EXTERNAL | EventKind::LOCAL | EventKind::NOTIFY, self)
    }
}

/// Callbacks of the application using a remote connection. All methods are called from the
/// service thread.
pub trait RemoteServiceConsumer: Send + Sync {
    /// The connection is established and the server has assigned the channel cookie.
    fn remote_service_started(&self, channel: &Channel);

    /// The established connection was stopped or lost.
    fn remote_service_stopped(&self, channel: &Channel);

    /// A stub of another connection became available for a registered proxy.
    fn register_remote_stub(&self, stub: &StubAddress) {}

    fn unregister_remote_stub(&self, stub: &StubAddress) {}

    /// A proxy of another connection has connected to a registered stub.
    fn register_remote_proxy(&self, proxy: &ProxyAddress) {}

    fn unregister_remote_proxy(&self, proxy: &ProxyAddress) {}

    /// Application message received from the server.
    fn process_remote_message(&self, message: &RemoteMessage) {
        #[cfg(feature = "log")]
        log::debug!(target: "client-service", "Ignoring remote message {message:?}");
    }
}

/// Loop of a service thread feeding commands and transport events to the service.
struct ServiceLoop<C: EventConsumer + 'static>(Arc<C>);

impl<C: EventConsumer + 'static> DispatchHandler for ServiceLoop<C> {
    fn handle_started(&mut self, dispatcher: &Dispatcher) {
        dispatcher.register_consumer(SERVICE_COMMAND, self.0.clone());
        dispatcher.register_consumer(TRANSPORT_EVENT, self.0.clone());
    }
}

/// Send and receive threads serving an open connection.
struct Link {
    send: SendThread,
    receive: DispatcherThread,
}

impl Link {
    /// Stops both threads. Returns whether both have completed within the wait.
    fn destroy(self, wait: WaitMode) -> bool {
        let sent = self.send.thread().destroy_thread(wait);
        let received = self.receive.destroy_thread(wait);
        sent && received
    }
}

/// Waits for a freshly spawned thread to enter its loop.
fn confirm_started(thread: &DispatcherThread) -> bool {
    thread.wait_for_dispatcher_start(Some(LINK_TEARDOWN_TIMEOUT))
}
