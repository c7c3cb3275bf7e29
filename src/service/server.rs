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

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use super::{
    confirm_started, AcceptPolicy, Link, ProxyAddress, ServiceCommand, ServiceLoop,
    ServiceRegistry, ServiceState, StubAddress, LINK_TEARDOWN_TIMEOUT,
};
use crate::config::ConnectionConfig;
use crate::dispatcher::{DispatchContext, Dispatcher};
use crate::event::{Event, EventConsumer};
use crate::remote::{
    self, spawn_server_receiver, AcceptFilter, ConnectionStatus, Cookie, DecodeError, MessageId,
    RemoteMessage, ResultCode, SendThread, ServerConnection, TransportEvent,
};
use crate::sync::lock;
use crate::thread::{DispatcherThread, WaitMode};
use crate::timer::{Timer, TimerConsumer, TimerManager};

struct ServerCore {
    name: String,
    connection: Arc<ServerConnection>,
    policy: Arc<AcceptPolicy>,
    registry: Mutex<ServiceRegistry>,
    retry: Timer,
    state: Mutex<ServiceState>,
    link: Mutex<Option<Link>>,
}

impl ServerCore {
    fn state(&self) -> ServiceState { *lock(&self.state) }

    fn set_state(&self, state: ServiceState) {
        #[cfg(feature = "log")]
        log::debug!(target: "server-service", "Service {} is {state}", self.name);
        *lock(&self.state) = state;
    }

    fn send(&self, message: RemoteMessage) {
        let sender = lock(&self.link).as_ref().map(|link| link.send.clone());
        match sender {
            Some(sender) => {
                sender.send(message);
            }
            None => {
                #[cfg(feature = "log")]
                log::warn!(target: "server-service", "Dropping {message:?}: the service is not started");
            }
        }
    }

    fn send_all(&self, messages: Vec<RemoteMessage>) {
        for message in messages {
            self.send(message);
        }
    }

    fn process_command(&self, command: ServiceCommand, ctx: &DispatchContext<'_>) {
        #[cfg(feature = "log")]
        log::trace!(target: "server-service", "Service {} processes {command:?}", self.name);

        match command {
            ServiceCommand::StartService => {
                if self.state() != ServiceState::Stopped {
                    return;
                }
                self.set_state(ServiceState::Starting);
                self.start_connection(ctx.dispatcher());
            }
            ServiceCommand::StopService => {
                if matches!(self.state(), ServiceState::Stopped | ServiceState::Stopping) {
                    return;
                }
                self.set_state(ServiceState::Stopping);
                self.retry.stop();
                self.stop_connection(WaitMode::Infinite);
                self.set_state(ServiceState::Stopped);
                ctx.post_internal(ServiceCommand::ServiceStopped.into_event());
            }
            ServiceCommand::ServiceStarted => {
                if self.state() == ServiceState::Starting {
                    self.set_state(ServiceState::Started);
                }
            }
            ServiceCommand::ServiceStopped => {
                let mut registry = lock(&self.registry);
                #[cfg(feature = "log")]
                {
                    if !registry.is_empty() {
                        log::debug!(target: "server-service", "Service {} drops its service registry", self.name);
                    }
                }
                *registry = ServiceRegistry::new();
            }
            ServiceCommand::ServiceLost => {
                if !matches!(self.state(), ServiceState::Starting | ServiceState::Started) {
                    return;
                }
                #[cfg(feature = "log")]
                log::warn!(target: "server-service", "Service {} has lost the listening socket", self.name);
                self.stop_connection(WaitMode::Timeout(LINK_TEARDOWN_TIMEOUT));
                *lock(&self.registry) = ServiceRegistry::new();
                self.set_state(ServiceState::Starting);
                self.arm_retry(ctx.dispatcher());
            }
        }
    }

    /// Opens the listening socket, arming the retry timer on failure.
    fn start_connection(&self, dispatcher: &Dispatcher) {
        self.retry.stop();
        if self.state() != ServiceState::Starting {
            return;
        }
        match self.open_link(dispatcher) {
            Ok(addr) => {
                #[cfg(feature = "log")]
                log::info!(target: "server-service", "Service {} is listening on {addr}", self.name);
                dispatcher.post_event(ServiceCommand::ServiceStarted.into_event());
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "server-service", "Service {} is unable to listen: {err}", self.name);
                self.stop_connection(WaitMode::Timeout(LINK_TEARDOWN_TIMEOUT));
                self.arm_retry(dispatcher);
            }
        }
    }

    fn open_link(&self, dispatcher: &Dispatcher) -> Result<SocketAddr, remote::Error> {
        self.connection.create_socket()?;
        let send = SendThread::spawn(
            format!("{}-send", self.name),
            self.connection.clone(),
            dispatcher.clone(),
        )?;
        let filter: Arc<dyn AcceptFilter> = self.policy.clone();
        let receive = match spawn_server_receiver(
            format!("{}-receive", self.name),
            self.connection.clone(),
            filter,
            dispatcher.clone(),
        ) {
            Ok(receive) => receive,
            Err(err) => {
                send.thread().destroy_thread(WaitMode::NoWait);
                return Err(err.into());
            }
        };
        let link = Link { send, receive };
        let started = confirm_started(link.send.thread()) && confirm_started(&link.receive);
        *lock(&self.link) = Some(link);
        if !started {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connection threads have not started").into());
        }
        self.connection.local_addr().ok_or(remote::Error::NotConnected)
    }

    /// Says "bye" to all clients, closes the listening socket and stops the connection threads.
    fn stop_connection(&self, wait: WaitMode) {
        self.connection.close_socket();
        let link = lock(&self.link).take();
        if let Some(link) = link {
            if !link.destroy(wait) {
                #[cfg(feature = "log")]
                log::warn!(target: "server-service", "Connection threads of {} have not completed", self.name);
            }
        }
    }

    fn arm_retry(&self, dispatcher: &Dispatcher) {
        let interval = self.connection.config().retry_interval;
        #[cfg(feature = "log")]
        log::debug!(target: "server-service", "Service {} retries in {interval:?}", self.name);
        self.retry.start_on(interval, 1, dispatcher);
    }

    fn process_transport(&self, event: &TransportEvent, ctx: &DispatchContext<'_>) {
        match event {
            TransportEvent::Received { from, message } => self.process_message(*from, message),
            TransportEvent::ConnectionLost(cookie) => self.connection_lost(*cookie, ctx),
            TransportEvent::ListenerFailed => {
                ctx.post_internal(ServiceCommand::ServiceLost.into_event())
            }
            TransportEvent::FailedSend(message) => {
                #[cfg(feature = "log")]
                log::warn!(target: "server-service", "Message {message:?} was not delivered");
            }
            TransportEvent::FailedReceive(_) => {}
        }
    }

    /// Closes the connection and runs the ordinary disconnect processing for it.
    fn connection_lost(&self, cookie: Cookie, ctx: &DispatchContext<'_>) {
        if !self.connection.close_connection(cookie) || !cookie.is_valid() {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "server-service", "Client {cookie} of {} is lost", self.name);
        let message = RemoteMessage::disconnect_request(cookie);
        ctx.post_internal(TransportEvent::Received { from: cookie, message }.into_event());
    }

    fn process_message(&self, from: Cookie, message: &RemoteMessage) {
        // messages queued behind the loss of their connection must not touch the registry
        if message.message_id() != MessageId::DISCONNECT && self.connection.handle_of(from).is_none() {
            #[cfg(feature = "log")]
            log::debug!(target: "server-service", "Dropping {message:?}: client {from} is gone");
            return;
        }
        let result = match message.message_id() {
            MessageId::CONNECT => {
                self.send(RemoteMessage::connect_notify(from, ConnectionStatus::Connected));
                Ok(())
            }
            MessageId::DISCONNECT => {
                let notices = lock(&self.registry).unregister_connection(from);
                self.send_all(notices);
                self.connection.close_connection(from);
                Ok(())
            }
            MessageId::REGISTER_STUB => StubAddress::decode(&mut message.reader()).map(|stub| {
                let notices = lock(&self.registry).register_stub(stub.with_cookie(from));
                self.send_all(notices);
            }),
            MessageId::UNREGISTER_STUB => StubAddress::decode(&mut message.reader()).map(|stub| {
                let notices = lock(&self.registry).unregister_stub(&stub.with_cookie(from));
                self.send_all(notices);
            }),
            MessageId::REGISTER_PROXY => ProxyAddress::decode(&mut message.reader()).map(|proxy| {
                let notices = lock(&self.registry).register_proxy(proxy.with_cookie(from));
                self.send_all(notices);
            }),
            MessageId::UNREGISTER_PROXY => ProxyAddress::decode(&mut message.reader()).map(|proxy| {
                let notices = lock(&self.registry).unregister_proxy(&proxy.with_cookie(from));
                self.send_all(notices);
            }),
            id if id.is_executable() && message.target() != Cookie::UNKNOWN => {
                self.route(from, message);
                Ok(())
            }
            _ => {
                #[cfg(feature = "log")]
                log::warn!(target: "server-service", "Unexpected message {message:?} from {from}");
                Ok(())
            }
        };
        if let Err(err) = result {
            self.malformed(from, message, err);
        }
    }

    /// Forwards the message to its target connection. Undeliverable requests are answered with
    /// a failure response.
    fn route(&self, from: Cookie, message: &RemoteMessage) {
        if self.connection.connection(message.target()).is_some() {
            self.send(message.clone());
        } else if message.message_id().is_request() {
            #[cfg(feature = "log")]
            log::debug!(target: "server-service", "No target {} for the request from {from}", message.target());
            let mut response = RemoteMessage::failure_response(message, ResultCode::ServiceUnavailable);
            response.set_target(from);
            self.send(response);
        } else {
            #[cfg(feature = "log")]
            log::debug!(target: "server-service", "Dropping {message:?}: no target {}", message.target());
        }
    }

    fn malformed(&self, from: Cookie, message: &RemoteMessage, err: DecodeError) {
        #[cfg(feature = "log")]
        log::warn!(target: "server-service", "Malformed message {message:?} from {from}: {err}");
    }
}

impl EventConsumer for ServerCore {
    fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>) {
        if let Some(command) = event.payload::<ServiceCommand>() {
            self.process_command(*command, ctx);
        } else if let Some(transport) = event.payload::<TransportEvent>() {
            self.process_transport(transport, ctx);
        }
    }
}

/// Server side of remote connections: the message router.
///
/// The service accepts the clients admitted by its [`AcceptPolicy`], assigns them cookies,
/// matches their stubs and proxies in the [`ServiceRegistry`] and routes application messages
/// between them.
pub struct ServerService {
    core: Arc<ServerCore>,
    thread: DispatcherThread,
}

impl ServerService {
    /// Spawns the service thread. The socket starts listening after
    /// [`ServerService::start_service`].
    pub fn new(name: impl Into<String>, config: ConnectionConfig) -> io::Result<Self> {
        let name = name.into();
        let manager = TimerManager::global()?;
        let core = Arc::new_cyclic(|weak: &Weak<ServerCore>| {
            let weak = weak.clone();
            let retry: Arc<dyn TimerConsumer> =
                Arc::new(move |_: &Timer, ctx: &DispatchContext<'_>| {
                    if let Some(core) = weak.upgrade() {
                        core.start_connection(ctx.dispatcher());
                    }
                });
            ServerCore {
                name: name.clone(),
                connection: Arc::new(ServerConnection::new(config)),
                policy: Arc::new(AcceptPolicy::new()),
                registry: Mutex::new(ServiceRegistry::new()),
                retry: Timer::new(&manager, format!("{name}-retry"), retry),
                state: Mutex::new(ServiceState::Stopped),
                link: Mutex::new(None),
            }
        });
        let thread = DispatcherThread::spawn(name, ServiceLoop(core.clone()))?;
        thread.wait_for_dispatcher_start(None);
        Ok(Self { core, thread })
    }

    pub fn name(&self) -> &str { &self.core.name }

    pub fn thread(&self) -> &DispatcherThread { &self.thread }

    pub fn state(&self) -> ServiceState { self.core.state() }

    pub fn is_started(&self) -> bool { self.state() == ServiceState::Started }

    pub fn config(&self) -> &ConnectionConfig { self.core.connection.config() }

    /// Address the service listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> { self.core.connection.local_addr() }

    pub fn accept_policy(&self) -> &AcceptPolicy { &self.core.policy }

    /// Number of accepted client connections.
    pub fn client_count(&self) -> usize { self.core.connection.connection_count() }

    /// Whether the client with the given cookie is connected.
    pub fn has_client(&self, cookie: Cookie) -> bool { self.core.connection.handle_of(cookie).is_some() }

    /// Gives access to the registry of the stubs and proxies of the connected clients.
    pub fn with_registry<R>(&self, f: impl FnOnce(&ServiceRegistry) -> R) -> R {
        f(&lock(&self.core.registry))
    }

    pub fn start_service(&self) -> bool {
        self.thread.post_event(ServiceCommand::StartService.into_event())
    }

    pub fn stop_service(&self) -> bool {
        self.thread.post_event(ServiceCommand::StopService.into_event())
    }

    /// Stops the service and waits for its thread to complete.
    pub fn shutdown(&self) -> bool {
        self.stop_service();
        self.thread.destroy_thread(WaitMode::Infinite)
    }

    /// Drops the connection of a client as if it was lost.
    pub fn close_client(&self, cookie: Cookie) -> bool {
        if !self.has_client(cookie) {
            return false;
        }
        self.thread.post_event(TransportEvent::ConnectionLost(cookie).into_event())
    }
}

impl Drop for ServerService {
    fn drop(&mut self) {
        if self.thread.is_running() {
            self.shutdown();
        }
    }
}
