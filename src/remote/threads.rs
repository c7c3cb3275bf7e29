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

//! Send and receive threads serving a connection on behalf of a service dispatcher.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use super::connection::SocketConnection;
use super::message::{Cookie, MessageId, RemoteMessage};
use super::server::ServerConnection;
use super::{Error, TransportEvent};
use crate::dispatcher::{DispatchContext, DispatchHandler, Dispatcher};
use crate::event::{Event, EventConsumer, EventKind, EventTag};
use crate::poller::popol::Poller;
use crate::poller::{IoType, Poll};
use crate::thread::DispatcherThread;

/// Tag of the events carrying messages to be written by a [`SendThread`].
pub const SEND_MESSAGE: EventTag = EventTag::new("send-message");

/// Maximum time a receive thread blocks in a socket poll before checking its event queue.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Object writing messages to a connection.
pub trait MessageSender: Send + Sync {
    fn send_message(&self, message: &RemoteMessage) -> Result<(), Error>;
}

/// Decides whether a connection from the given peer is accepted by a server.
pub trait AcceptFilter: Send + Sync {
    fn can_accept(&self, peer: &SocketAddr) -> bool;
}

impl<F> AcceptFilter for F
where F: Fn(&SocketAddr) -> bool + Send + Sync
{
    fn can_accept(&self, peer: &SocketAddr) -> bool { self(peer) }
}

fn message_kind(id: MessageId) -> EventKind {
    let kind = if id.is_request() {
        EventKind::REQUEST
    } else if id.is_response() {
        EventKind::RESPONSE
    } else {
        EventKind::NOTIFY
    };
    EventKind::EXTERNAL | EventKind::REMOTE | kind
}

struct SendWorker {
    sender: Arc<dyn MessageSender>,
    service: Dispatcher,
}

impl EventConsumer for SendWorker {
    fn process_event(&self, event: &Event, ctx: &DispatchContext<'_>) {
        let Some(message) = event.payload::<RemoteMessage>() else {
            return;
        };
        if let Err(err) = self.sender.send_message(message) {
            #[cfg(feature = "log")]
            log::error!(target: "connection", "Failed to send {message:?}: {err}");
            self.service.post_event(TransportEvent::FailedSend(message.clone()).into_event());
        }
    }
}

struct SendHandler(Arc<SendWorker>);

impl DispatchHandler for SendHandler {
    fn handle_started(&mut self, dispatcher: &Dispatcher) {
        dispatcher.register_consumer(SEND_MESSAGE, self.0.clone());
    }
}

/// Thread writing queued messages to a connection. Write failures are reported to the service
/// dispatcher as [`TransportEvent::FailedSend`].
#[derive(Clone)]
pub struct SendThread {
    thread: DispatcherThread,
}

impl SendThread {
    pub fn spawn(
        name: impl Into<String>,
        sender: Arc<dyn MessageSender>,
        service: Dispatcher,
    ) -> io::Result<Self> {
        let worker = Arc::new(SendWorker { sender, service });
        let thread = DispatcherThread::spawn(name, SendHandler(worker))?;
        Ok(Self { thread })
    }

    /// Seals the message and queues it for sending. Returns `false` if the thread is not
    /// running.
    pub fn send(&self, mut message: RemoteMessage) -> bool {
        message.seal();
        let kind = message_kind(message.message_id());
        self.thread.post_event(Event::new(SEND_MESSAGE, kind, message))
    }

    pub fn thread(&self) -> &DispatcherThread { &self.thread }
}

fn post_received(service: &Dispatcher, from: Cookie, message: RemoteMessage) {
    #[cfg(feature = "log")]
    log::trace!(target: "connection", "Received {message:?} from {from}");
    service.post_event(TransportEvent::Received { from, message }.into_event());
}

fn interrupted(err: &io::Error) -> bool { err.kind() == io::ErrorKind::Interrupted }

/// Receive loop of a client connection: a single socket polled between checks of the event
/// queue.
struct ClientReceiver {
    socket: Arc<SocketConnection>,
    service: Dispatcher,
    poller: Poller,
    failed: bool,
}

impl ClientReceiver {
    fn fail(&mut self, err: io::Error) {
        #[cfg(feature = "log")]
        log::error!(target: "connection", "Receiving from {} failed: {err}", self.socket.peer_addr());
        self.failed = true;
        self.poller.unregister(&*self.socket);
        self.service.post_event(TransportEvent::FailedReceive(self.socket.id()).into_event());
    }
}

impl DispatchHandler for ClientReceiver {
    fn wait_timeout(&self) -> Option<Duration> {
        if self.failed {
            None
        } else {
            Some(Duration::ZERO)
        }
    }

    fn handle_started(&mut self, dispatcher: &Dispatcher) {
        self.poller.register(&*self.socket, IoType::read_only());
    }

    fn handle_idle(&mut self, ctx: &DispatchContext<'_>) {
        if self.failed {
            return;
        }
        match self.poller.poll(Some(POLL_TIMEOUT)) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) if interrupted(&err) => return,
            Err(err) => return self.fail(err),
        }
        // a hangup still leaves the data sent before it readable
        if self.poller.by_ref().count() == 0 {
            return;
        }
        match self.socket.receive_message() {
            Ok(Some(message)) => post_received(&self.service, message.source(), message),
            Ok(None) => {}
            Err(err) => self.fail(err),
        }
    }
}

/// Spawns the receive thread of a client connection, posting [`TransportEvent`]s to `service`.
pub fn spawn_client_receiver(
    name: impl Into<String>,
    socket: Arc<SocketConnection>,
    service: Dispatcher,
) -> io::Result<DispatcherThread> {
    let handler = ClientReceiver {
        socket,
        service,
        poller: Poller::new(),
        failed: false,
    };
    DispatcherThread::spawn(name, handler)
}

/// Receive loop of a server: the listening socket and all accepted connections.
struct ServerReceiver {
    connection: Arc<ServerConnection>,
    listener: Arc<TcpListener>,
    filter: Arc<dyn AcceptFilter>,
    service: Dispatcher,
    poller: Poller,
    registered: HashSet<RawFd>,
    lost: HashSet<RawFd>,
    listener_failed: bool,
}

impl ServerReceiver {
    /// Aligns the poller registrations with the wait list of the server connection.
    fn sync_wait_list(&mut self) {
        let waiting = self.connection.wait_list().into_iter().collect::<HashSet<_>>();
        let closed = self.registered.difference(&waiting).copied().collect::<Vec<_>>();
        for fd in closed {
            self.poller.unregister(&fd);
            self.registered.remove(&fd);
        }
        self.lost.retain(|fd| waiting.contains(fd));
        for fd in waiting {
            if !self.registered.contains(&fd) && !self.lost.contains(&fd) {
                self.poller.register(&fd, IoType::read_only());
                self.registered.insert(fd);
            }
        }
    }

    fn fail_listener(&mut self, reason: String) {
        if self.listener_failed {
            return;
        }
        #[cfg(feature = "log")]
        log::error!(target: "connection", "Listening socket failed: {reason}");
        self.listener_failed = true;
        self.poller.unregister(&*self.listener);
        self.service.post_event(TransportEvent::ListenerFailed.into_event());
    }

    fn accept(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if interrupted(&err) || err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => return self.fail_listener(err.to_string()),
        };
        let socket = match SocketConnection::new(stream) {
            Ok(socket) => socket,
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "connection", "Unable to set up connection from {peer}: {err}");
                return;
            }
        };
        if !self.filter.can_accept(&peer) {
            #[cfg(feature = "log")]
            log::warn!(target: "connection", "Rejecting connection from {peer}");
            let mut reject = RemoteMessage::reject_notify(Cookie::UNKNOWN);
            reject.seal();
            let _ = socket.send_message(&reject);
            socket.close();
            return;
        }

        let fd = socket.as_raw_fd();
        let cookie = self.connection.accept_connection(Arc::new(socket));
        // the handle may be a reused one of an already closed connection
        if self.registered.remove(&fd) {
            self.poller.unregister(&fd);
        }
        self.lost.remove(&fd);
        self.poller.register(&fd, IoType::read_only());
        self.registered.insert(fd);

        #[cfg(feature = "log")]
        log::debug!(target: "connection", "Accepted connection from {peer} as {cookie}");
    }

    fn receive(&mut self, fd: RawFd) {
        if self.lost.contains(&fd) {
            return;
        }
        let Some((socket, cookie)) = self.connection.connection_by_handle(fd) else {
            self.poller.unregister(&fd);
            self.registered.remove(&fd);
            return;
        };
        match socket.receive_message() {
            Ok(Some(message)) => post_received(&self.service, cookie, message),
            Ok(None) => {}
            Err(err) => {
                #[cfg(feature = "log")]
                log::debug!(target: "connection", "Connection {cookie} from {} is lost: {err}", socket.peer_addr());
                self.lost.insert(fd);
                self.registered.remove(&fd);
                self.poller.unregister(&fd);
                self.service.post_event(TransportEvent::ConnectionLost(cookie).into_event());
            }
        }
    }
}

impl DispatchHandler for ServerReceiver {
    fn wait_timeout(&self) -> Option<Duration> {
        if self.listener_failed && self.connection.connection_count() == 0 {
            None
        } else {
            Some(Duration::ZERO)
        }
    }

    fn handle_started(&mut self, dispatcher: &Dispatcher) {
        self.poller.register(&*self.listener, IoType::read_only());
    }

    fn handle_idle(&mut self, ctx: &DispatchContext<'_>) {
        self.sync_wait_list();
        match self.poller.poll(Some(POLL_TIMEOUT)) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) if interrupted(&err) => return,
            Err(err) => return self.fail_listener(err.to_string()),
        }
        let listener_fd = self.listener.as_raw_fd();
        let ready = self.poller.by_ref().collect::<Vec<_>>();
        for (fd, res) in ready {
            match res {
                Ok(_) if fd == listener_fd => self.accept(),
                Err(fail) if fd == listener_fd => self.fail_listener(fail.to_string()),
                _ => self.receive(fd),
            }
        }
    }
}

/// Spawns the receive thread of a server, accepting the connections which pass the `filter`
/// and posting [`TransportEvent`]s to `service`.
pub fn spawn_server_receiver(
    name: impl Into<String>,
    connection: Arc<ServerConnection>,
    filter: Arc<dyn AcceptFilter>,
    service: Dispatcher,
) -> io::Result<DispatcherThread> {
    let listener = connection
        .listener()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server socket is not created"))?;
    let handler = ServerReceiver {
        connection,
        listener,
        filter,
        service,
        poller: Poller::new(),
        registered: empty!(),
        lost: empty!(),
        listener_failed: false,
    };
    DispatcherThread::spawn(name, handler)
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use crossbeam_channel::{unbounded, Receiver};

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::remote::{ConnectionStatus, TRANSPORT_EVENT};
    use crate::thread::WaitMode;

    const WAIT: Duration = Duration::from_secs(5);

    fn service() -> (DispatcherThread, Receiver<TransportEvent>) {
        let (send, recv) = unbounded();
        let thread = DispatcherThread::spawn("service", ()).unwrap();
        assert!(thread.wait_for_dispatcher_start(Some(WAIT)));
        let consumer: Arc<dyn EventConsumer> =
            Arc::new(move |event: &Event, _ctx: &DispatchContext<'_>| {
                if let Some(transport) = event.payload::<TransportEvent>() {
                    let _ = send.send(transport.clone());
                }
            });
        assert!(thread.register_consumer(TRANSPORT_EVENT, consumer));
        (thread, recv)
    }

    struct Recorder(Mutex<Vec<RemoteMessage>>, bool);

    impl MessageSender for Recorder {
        fn send_message(&self, message: &RemoteMessage) -> Result<(), Error> {
            if self.1 {
                return Err(Error::NotConnected);
            }
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[test]
    fn send_thread() {
        let (service, events) = service();
        let recorder = Arc::new(Recorder(Mutex::new(vec![]), false));
        let sender = SendThread::spawn("send", recorder.clone(), service.dispatcher().clone()).unwrap();
        assert!(sender.thread().wait_for_dispatcher_start(Some(WAIT)));
        assert!(sender.send(RemoteMessage::connect_request()));
        assert!(sender.send(RemoteMessage::bye(Cookie::FIRST_VALID)));
        assert!(sender.thread().destroy_thread(WaitMode::Timeout(WAIT)));

        let sent = recorder.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(RemoteMessage::is_valid));
        assert_eq!(sent[1].message_id(), MessageId::BYE);

        let failing = Arc::new(Recorder(Mutex::new(vec![]), true));
        let sender = SendThread::spawn("send-failing", failing, service.dispatcher().clone()).unwrap();
        assert!(sender.thread().wait_for_dispatcher_start(Some(WAIT)));
        assert!(sender.send(RemoteMessage::connect_request()));
        match events.recv_timeout(WAIT).unwrap() {
            TransportEvent::FailedSend(message) => assert_eq!(message.message_id(), MessageId::CONNECT),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sender.thread().destroy_thread(WaitMode::Timeout(WAIT)));
        assert!(service.destroy_thread(WaitMode::Timeout(WAIT)));
    }

    #[test]
    fn client_receiver() {
        let (service, events) = service();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = Arc::new(SocketConnection::connect(&[addr], WAIT).unwrap());
        let (stream, _) = listener.accept().unwrap();
        let server = SocketConnection::new(stream).unwrap();

        let receiver =
            spawn_client_receiver("receive", socket.clone(), service.dispatcher().clone()).unwrap();
        assert!(receiver.wait_for_dispatcher_start(Some(WAIT)));

        let mut notify = RemoteMessage::connect_notify(Cookie::FIRST_VALID, ConnectionStatus::Connected);
        notify.seal();
        server.send_message(&notify).unwrap();
        match events.recv_timeout(WAIT).unwrap() {
            TransportEvent::Received { from, message } => {
                assert_eq!(from, Cookie::ROUTER);
                assert_eq!(message, notify);
            }
            other => panic!("unexpected {other:?}"),
        }

        server.close();
        match events.recv_timeout(WAIT).unwrap() {
            TransportEvent::FailedReceive(id) => assert_eq!(id, socket.id()),
            other => panic!("unexpected {other:?}"),
        }
        // the failure is reported once
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(receiver.destroy_thread(WaitMode::Timeout(WAIT)));
        assert!(service.destroy_thread(WaitMode::Timeout(WAIT)));
    }

    #[test]
    fn server_receiver() {
        let (service, events) = service();
        let connection = Arc::new(ServerConnection::new(ConnectionConfig::new("127.0.0.1", 0)));
        connection.create_socket().unwrap();
        let addr = connection.local_addr().unwrap();
        let filter: Arc<dyn AcceptFilter> = Arc::new(|_: &SocketAddr| true);
        let receiver =
            spawn_server_receiver("receive", connection.clone(), filter, service.dispatcher().clone())
                .unwrap();
        assert!(receiver.wait_for_dispatcher_start(Some(WAIT)));

        let client = SocketConnection::connect(&[addr], WAIT).unwrap();
        let mut request = RemoteMessage::connect_request();
        request.seal();
        client.send_message(&request).unwrap();
        match events.recv_timeout(WAIT).unwrap() {
            TransportEvent::Received { from, message } => {
                assert_eq!(from, Cookie::FIRST_VALID);
                assert_eq!(message.message_id(), MessageId::CONNECT);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connection.connection_count(), 1);

        client.close();
        match events.recv_timeout(WAIT).unwrap() {
            TransportEvent::ConnectionLost(cookie) => assert_eq!(cookie, Cookie::FIRST_VALID),
            other => panic!("unexpected {other:?}"),
        }
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());

        assert!(receiver.destroy_thread(WaitMode::Timeout(WAIT)));
        assert!(service.destroy_thread(WaitMode::Timeout(WAIT)));
    }

    #[test]
    fn rejected_connection() {
        let (service, events) = service();
        let connection = Arc::new(ServerConnection::new(ConnectionConfig::new("127.0.0.1", 0)));
        connection.create_socket().unwrap();
        let addr = connection.local_addr().unwrap();
        let filter: Arc<dyn AcceptFilter> = Arc::new(|_: &SocketAddr| false);
        let receiver =
            spawn_server_receiver("receive", connection.clone(), filter, service.dispatcher().clone())
                .unwrap();
        assert!(receiver.wait_for_dispatcher_start(Some(WAIT)));

        let client = SocketConnection::connect(&[addr], WAIT).unwrap();
        let reject = client.receive_message().unwrap().unwrap();
        assert_eq!(reject.message_id(), MessageId::REJECT_NOTIFY);
        assert!(client.receive_message().is_err());
        assert_eq!(connection.connection_count(), 0);
        assert!(events.try_recv().is_err());

        assert!(receiver.destroy_thread(WaitMode::Timeout(WAIT)));
        assert!(service.destroy_thread(WaitMode::Timeout(WAIT)));
    }
}
