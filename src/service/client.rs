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
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use super::{
    confirm_started, Channel, Link, ProxyAddress, RemoteServiceConsumer, ServiceCommand,
    ServiceLoop, ServiceState, StubAddress, LINK_TEARDOWN_TIMEOUT,
};
use crate::config::ConnectionConfig;
use crate::dispatcher::{DispatchContext, Dispatcher};
use crate::event::{Event, EventConsumer};
use crate::remote::{
    self, spawn_client_receiver, ClientConnection, ConnectionStatus, Cookie, MessageId,
    RemoteMessage, SendThread, SocketId, TransportEvent,
};
use crate::sync::lock;
use crate::thread::{DispatcherId, DispatcherThread, WaitMode};
use crate::timer::{Timer, TimerConsumer, TimerManager};

struct ClientCore {
    name: String,
    connection: Arc<ClientConnection>,
    consumer: Arc<dyn RemoteServiceConsumer>,
    retry: Timer,
    state: Mutex<ServiceState>,
    link: Mutex<Option<(Link, SocketId)>>,
    channel: Mutex<Channel>,
    thread_id: OnceLock<DispatcherId>,
    attempts: AtomicU32,
}

impl ClientCore {
    fn state(&self) -> ServiceState { *lock(&self.state) }

    fn set_state(&self, state: ServiceState) {
        #[cfg(feature = "log")]
        log::debug!(target: "client-service", "Service {} is {state}", self.name);
        *lock(&self.state) = state;
    }

    fn thread_id(&self) -> DispatcherId {
        self.thread_id.get().copied().unwrap_or_else(|| DispatcherId::from(0))
    }

    fn sender(&self) -> Option<SendThread> {
        if self.state() != ServiceState::Started {
            return None;
        }
        lock(&self.link).as_ref().map(|(link, _)| link.send.clone())
    }

    fn process_command(&self, command: ServiceCommand, ctx: &DispatchContext<'_>) {
        #[cfg(feature = "log")]
        log::trace!(target: "client-service", "Service {} processes {command:?}", self.name);

        match command {
            ServiceCommand::StartService => {
                if self.state() != ServiceState::Stopped {
                    return;
                }
                self.set_state(ServiceState::Starting);
                self.attempts.store(0, Ordering::Relaxed);
                self.connection.set_cookie(Cookie::UNKNOWN);
                *lock(&self.channel) = Channel::new(Cookie::UNKNOWN, self.thread_id());
                self.start_connection(ctx.dispatcher());
            }
            ServiceCommand::StopService => {
                let prior = self.state();
                if matches!(prior, ServiceState::Stopped | ServiceState::Stopping) {
                    return;
                }
                self.set_state(ServiceState::Stopping);
                self.retry.stop();
                if let Err(err) = self.connection.request_disconnect_server() {
                    #[cfg(feature = "log")]
                    log::warn!(target: "client-service", "Unable to notify the server about disconnect: {err}");
                }
                self.stop_connection(WaitMode::Infinite);
                self.set_state(ServiceState::Stopped);
                if prior == ServiceState::Started {
                    ctx.post_internal(ServiceCommand::ServiceStopped.into_event());
                }
            }
            ServiceCommand::ServiceStarted => {
                if self.state() != ServiceState::Starting {
                    return;
                }
                self.set_state(ServiceState::Started);
                let channel = Channel::new(self.connection.cookie(), self.thread_id());
                *lock(&self.channel) = channel;
                self.consumer.remote_service_started(&channel);
            }
            ServiceCommand::ServiceStopped => {
                let reset = Channel::new(Cookie::UNKNOWN, self.thread_id());
                let channel = mem::replace(&mut *lock(&self.channel), reset);
                self.consumer.remote_service_stopped(&channel);
            }
            ServiceCommand::ServiceLost => {
                let prior = self.state();
                if !matches!(prior, ServiceState::Starting | ServiceState::Started) {
                    return;
                }
                #[cfg(feature = "log")]
                log::warn!(target: "client-service", "Service {} has lost the connection", self.name);
                self.stop_connection(WaitMode::Timeout(LINK_TEARDOWN_TIMEOUT));
                self.set_state(ServiceState::Starting);
                if prior == ServiceState::Started {
                    ctx.post_internal(ServiceCommand::ServiceStopped.into_event());
                }
                self.arm_retry(ctx.dispatcher());
            }
        }
    }

    /// Opens the connection, arming the retry timer on failure.
    fn start_connection(&self, dispatcher: &Dispatcher) {
        self.retry.stop();
        if self.state() != ServiceState::Starting {
            return;
        }
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.open_link(dispatcher) {
            #[cfg(feature = "log")]
            log::warn!(target: "client-service", "Service {} is unable to connect: {err}", self.name);
            self.stop_connection(WaitMode::Timeout(LINK_TEARDOWN_TIMEOUT));
            self.arm_retry(dispatcher);
        }
    }

    fn open_link(&self, dispatcher: &Dispatcher) -> Result<(), remote::Error> {
        let socket = self.connection.create_socket()?;
        let send =
            SendThread::spawn(format!("{}-send", self.name), self.connection.clone(), dispatcher.clone())?;
        let receive = match spawn_client_receiver(
            format!("{}-receive", self.name),
            socket.clone(),
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
        *lock(&self.link) = Some((link, socket.id()));
        if !started {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connection threads have not started").into());
        }
        self.connection.request_connect_server()
    }

    fn stop_connection(&self, wait: WaitMode) {
        self.connection.close_socket();
        let link = lock(&self.link).take();
        if let Some((link, _)) = link {
            if !link.destroy(wait) {
                #[cfg(feature = "log")]
                log::warn!(target: "client-service", "Connection threads of {} have not completed", self.name);
            }
        }
    }

    fn arm_retry(&self, dispatcher: &Dispatcher) {
        let interval = self.connection.config().retry_interval;
        #[cfg(feature = "log")]
        log::debug!(target: "client-service", "Service {} retries in {interval:?}", self.name);
        self.retry.start_on(interval, 1, dispatcher);
    }

    fn process_transport(&self, event: &TransportEvent, ctx: &DispatchContext<'_>) {
        match event {
            TransportEvent::Received { message, .. } => self.process_message(message, ctx),
            TransportEvent::FailedReceive(id) => {
                let current = lock(&self.link).as_ref().map(|(_, socket)| *socket);
                if current == Some(*id) {
                    ctx.post_internal(ServiceCommand::ServiceLost.into_event());
                }
            }
            TransportEvent::FailedSend(message) => {
                #[cfg(feature = "log")]
                log::warn!(target: "client-service", "Message {message:?} was not delivered");
            }
            TransportEvent::ConnectionLost(_) | TransportEvent::ListenerFailed => {}
        }
    }

    fn process_message(&self, message: &RemoteMessage, ctx: &DispatchContext<'_>) {
        let mut reader = message.reader();
        match message.message_id() {
            MessageId::CONNECT_NOTIFY => match message.connection_status() {
                Ok((cookie, ConnectionStatus::Connected)) if cookie.is_valid() => {
                    self.connection.set_cookie(cookie);
                    ctx.post_internal(ServiceCommand::ServiceStarted.into_event());
                }
                _ => ctx.post_internal(ServiceCommand::ServiceLost.into_event()),
            },
            MessageId::REJECT_NOTIFY | MessageId::BYE => {
                ctx.post_internal(ServiceCommand::ServiceLost.into_event())
            }
            MessageId::SERVICE_REGISTERED => match StubAddress::decode(&mut reader) {
                Ok(stub) => self.consumer.register_remote_stub(&stub),
                Err(err) => self.malformed(message, err),
            },
            MessageId::SERVICE_UNREGISTERED => match StubAddress::decode(&mut reader) {
                Ok(stub) => self.consumer.unregister_remote_stub(&stub),
                Err(err) => self.malformed(message, err),
            },
            MessageId::CLIENT_REGISTERED => match ProxyAddress::decode(&mut reader) {
                Ok(proxy) => self.consumer.register_remote_proxy(&proxy),
                Err(err) => self.malformed(message, err),
            },
            MessageId::CLIENT_UNREGISTERED => match ProxyAddress::decode(&mut reader) {
                Ok(proxy) => self.consumer.unregister_remote_proxy(&proxy),
                Err(err) => self.malformed(message, err),
            },
            id if id.is_executable() => self.consumer.process_remote_message(message),
            _ => {
                #[cfg(feature = "log")]
                log::warn!(target: "client-service", "Unexpected message {message:?}");
            }
        }
    }

    fn malformed(&self, message: &RemoteMessage, err: remote::DecodeError) {
        #[cfg(feature = "log")]
        log::warn!(target: "client-service", "Malformed message {message:?}: {err}");
    }
}

impl EventConsumer for ClientCore {
    fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>) {
        if let Some(command) = event.payload::<ServiceCommand>() {
            self.process_command(*command, ctx);
        } else if let Some(transport) = event.payload::<TransportEvent>() {
            self.process_transport(transport, ctx);
        }
    }
}

/// Client side of a remote connection.
///
/// The service runs its own dispatcher thread, which opens the connection, spawns the send and
/// receive threads and keeps reconnecting with the configured retry interval until the service
/// is stopped.
pub struct ClientService {
    core: Arc<ClientCore>,
    thread: DispatcherThread,
}

impl ClientService {
    /// Spawns the service thread. The connection is opened by [`ClientService::start_service`].
    pub fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        consumer: Arc<dyn RemoteServiceConsumer>,
    ) -> io::Result<Self> {
        let name = name.into();
        let manager = TimerManager::global()?;
        let core = Arc::new_cyclic(|weak: &Weak<ClientCore>| {
            let weak = weak.clone();
            let retry: Arc<dyn TimerConsumer> =
                Arc::new(move |_: &Timer, ctx: &DispatchContext<'_>| {
                    if let Some(core) = weak.upgrade() {
                        core.start_connection(ctx.dispatcher());
                    }
                });
            ClientCore {
                name: name.clone(),
                connection: Arc::new(ClientConnection::new(config)),
                consumer,
                retry: Timer::new(&manager, format!("{name}-retry"), retry),
                state: Mutex::new(ServiceState::Stopped),
                link: Mutex::new(None),
                channel: Mutex::new(Channel::new(Cookie::UNKNOWN, DispatcherId::from(0))),
                thread_id: OnceLock::new(),
                attempts: AtomicU32::new(0),
            }
        });
        let thread = DispatcherThread::spawn(name, ServiceLoop(core.clone()))?;
        let _ = core.thread_id.set(thread.id());
        thread.wait_for_dispatcher_start(None);
        Ok(Self { core, thread })
    }

    pub fn name(&self) -> &str { &self.core.name }

    pub fn thread(&self) -> &DispatcherThread { &self.thread }

    pub fn state(&self) -> ServiceState { self.core.state() }

    pub fn is_started(&self) -> bool { self.state() == ServiceState::Started }

    /// Cookie assigned by the server.
    pub fn cookie(&self) -> Cookie { self.core.connection.cookie() }

    pub fn channel(&self) -> Channel { *lock(&self.core.channel) }

    pub fn config(&self) -> &ConnectionConfig { self.core.connection.config() }

    /// Number of connection attempts since the service was last started.
    pub fn connect_attempts(&self) -> u32 { self.core.attempts.load(Ordering::Relaxed) }

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

    fn send_control(&self, message_id: MessageId, payload: Vec<u8>) -> bool {
        self.send_message(RemoteMessage::control(message_id, Cookie::UNKNOWN, Cookie::ROUTER).with_payload(payload))
    }

    /// Announces a local stub to the server. Does nothing unless the service is started.
    pub fn register_service(&self, stub: &StubAddress) -> bool {
        let stub = stub.clone().with_cookie(self.cookie());
        self.send_control(MessageId::REGISTER_STUB, stub.encode())
    }

    pub fn unregister_service(&self, stub: &StubAddress) -> bool {
        let stub = stub.clone().with_cookie(self.cookie());
        self.send_control(MessageId::UNREGISTER_STUB, stub.encode())
    }

    /// Announces a local proxy waiting for a remote stub. Does nothing unless the service is
    /// started.
    pub fn register_service_client(&self, proxy: &ProxyAddress) -> bool {
        let proxy = proxy.clone().with_cookie(self.cookie());
        self.send_control(MessageId::REGISTER_PROXY, proxy.encode())
    }

    pub fn unregister_service_client(&self, proxy: &ProxyAddress) -> bool {
        let proxy = proxy.clone().with_cookie(self.cookie());
        self.send_control(MessageId::UNREGISTER_PROXY, proxy.encode())
    }

    /// Queues the message for sending, stamping the cookie of the connection as its source.
    pub fn send_message(&self, mut message: RemoteMessage) -> bool {
        let Some(sender) = self.core.sender() else {
            return false;
        };
        message.set_source(self.cookie());
        message.set_sequence(self.core.connection.next_sequence());
        sender.send(message)
    }
}

impl Drop for ClientService {
    fn drop(&mut self) {
        if self.thread.is_running() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver, Sender};

    use super::*;
    use crate::remote::SocketConnection;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    enum Callback {
        Started(Channel),
        Stopped(Channel),
        Message(RemoteMessage),
    }

    struct Recorder(Sender<Callback>);

    impl RemoteServiceConsumer for Recorder {
        fn remote_service_started(&self, channel: &Channel) {
            let _ = self.0.send(Callback::Started(*channel));
        }
        fn remote_service_stopped(&self, channel: &Channel) {
            let _ = self.0.send(Callback::Stopped(*channel));
        }
        fn process_remote_message(&self, message: &RemoteMessage) {
            let _ = self.0.send(Callback::Message(message.clone()));
        }
    }

    fn client(port: u16) -> (ClientService, Receiver<Callback>) {
        let (send, recv) = unbounded();
        let config =
            ConnectionConfig::new("127.0.0.1", port).retry_interval(Duration::from_millis(50));
        let service = ClientService::new("client", config, Arc::new(Recorder(send))).unwrap();
        (service, recv)
    }

    /// Accepts the client and completes the handshake assigning the cookie.
    fn handshake(listener: &TcpListener, cookie: Cookie) -> SocketConnection {
        let (stream, _) = listener.accept().unwrap();
        let server = SocketConnection::new(stream).unwrap();
        let request = server.receive_message().unwrap().unwrap();
        assert_eq!(request.message_id(), MessageId::CONNECT);
        let mut notify = RemoteMessage::connect_notify(cookie, ConnectionStatus::Connected);
        notify.seal();
        server.send_message(&notify).unwrap();
        server
    }

    #[test]
    fn disabled_connection_keeps_retrying() {
        let (send, _recv) = unbounded();
        let config = ConnectionConfig::default().enabled(false);
        let service = ClientService::new("disabled", config, Arc::new(Recorder(send))).unwrap();
        assert!(service.start_service());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(service.state(), ServiceState::Starting);
        assert!(!service.register_service(&StubAddress::new("X", "main")));
        assert!(service.shutdown());
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn handshake_and_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (service, callbacks) = client(listener.local_addr().unwrap().port());
        assert!(service.start_service());
        let server = handshake(&listener, Cookie::FIRST_VALID);

        match callbacks.recv_timeout(WAIT).unwrap() {
            Callback::Started(channel) => {
                assert_eq!(channel.cookie, Cookie::FIRST_VALID);
                assert_eq!(channel.source, service.thread().id());
                assert_eq!(channel.target, Cookie::LOCAL);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(service.is_started());
        assert_eq!(service.cookie(), Cookie::FIRST_VALID);

        assert!(service.send_message(RemoteMessage::new(MessageId::from(7), Cookie::UNKNOWN, Cookie::from(200))));
        let sent = server.receive_message().unwrap().unwrap();
        assert_eq!(sent.source(), Cookie::FIRST_VALID);
        assert_eq!(sent.target(), Cookie::from(200));

        let mut incoming = RemoteMessage::new(MessageId::FIRST_RESPONSE, Cookie::from(200), Cookie::FIRST_VALID);
        incoming.seal();
        server.send_message(&incoming).unwrap();
        match callbacks.recv_timeout(WAIT).unwrap() {
            Callback::Message(message) => assert_eq!(message, incoming),
            other => panic!("unexpected {other:?}"),
        }

        assert!(service.stop_service());
        match callbacks.recv_timeout(WAIT).unwrap() {
            Callback::Stopped(channel) => assert_eq!(channel.cookie, Cookie::FIRST_VALID),
            other => panic!("unexpected {other:?}"),
        }
        let request = server.receive_message().unwrap().unwrap();
        assert_eq!(request.message_id(), MessageId::DISCONNECT);
        assert_eq!(request.source(), Cookie::FIRST_VALID);
        assert_eq!(service.cookie(), Cookie::UNKNOWN);
        assert!(service.shutdown());
    }

    #[test]
    fn reconnects_after_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (service, callbacks) = client(listener.local_addr().unwrap().port());
        assert!(service.start_service());
        let server = handshake(&listener, Cookie::FIRST_VALID);
        assert!(matches!(callbacks.recv_timeout(WAIT).unwrap(), Callback::Started(_)));

        server.close();
        match callbacks.recv_timeout(WAIT).unwrap() {
            Callback::Stopped(channel) => assert_eq!(channel.cookie, Cookie::FIRST_VALID),
            other => panic!("unexpected {other:?}"),
        }
        let _server = handshake(&listener, Cookie::from(101));
        match callbacks.recv_timeout(WAIT).unwrap() {
            Callback::Started(channel) => assert_eq!(channel.cookie, Cookie::from(101)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!service.core.retry.is_started());
        assert!(service.shutdown());
    }

    #[test]
    fn one_attempt_per_retry_interval() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (service, callbacks) = client(port);
        assert!(service.start_service());
        std::thread::sleep(Duration::from_millis(500));
        // the first attempt plus at most one per 50 ms interval
        let attempts = service.connect_attempts();
        assert!((4..=12).contains(&attempts), "{attempts} connection attempts");
        assert_eq!(service.state(), ServiceState::Starting);

        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        let _server = handshake(&listener, Cookie::FIRST_VALID);
        assert!(matches!(callbacks.recv_timeout(WAIT).unwrap(), Callback::Started(_)));
        let connected_after = service.connect_attempts();
        assert!(connected_after > attempts);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(service.connect_attempts(), connected_after);
        assert!(!service.core.retry.is_started());
        assert!(service.shutdown());
    }
}
