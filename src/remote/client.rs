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

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::connection::SocketConnection;
use super::message::{Cookie, RemoteMessage};
use super::threads::MessageSender;
use super::Error;
use crate::config::ConnectionConfig;
use crate::sync::lock;

/// Client side of a remote connection: a connection socket and the cookie assigned by the
/// server.
#[derive(Debug)]
pub struct ClientConnection {
    config: ConnectionConfig,
    socket: Mutex<Option<Arc<SocketConnection>>>,
    cookie: AtomicU64,
    sequence: AtomicU32,
}

impl ClientConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            socket: Mutex::new(None),
            cookie: AtomicU64::new(Cookie::UNKNOWN.value()),
            sequence: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ConnectionConfig { &self.config }

    pub fn cookie(&self) -> Cookie { Cookie::from(self.cookie.load(Ordering::SeqCst)) }

    pub fn set_cookie(&self, cookie: Cookie) { self.cookie.store(cookie.value(), Ordering::SeqCst) }

    /// Sequence number for the next outgoing message.
    pub fn next_sequence(&self) -> u32 { self.sequence.fetch_add(1, Ordering::Relaxed) + 1 }

    pub fn socket(&self) -> Option<Arc<SocketConnection>> { lock(&self.socket).clone() }

    pub fn is_connected(&self) -> bool { lock(&self.socket).is_some() }

    /// Connects a new socket to the configured server, closing the previous one. The cookie is
    /// reset to [`Cookie::LOCAL`] until the server assigns a new one.
    pub fn create_socket(&self) -> Result<Arc<SocketConnection>, Error> {
        if !self.config.enabled {
            return Err(Error::Disabled);
        }
        let addrs = self.config.socket_addrs()?;
        let socket = Arc::new(SocketConnection::connect(&addrs, self.config.connect_timeout)?);

        #[cfg(feature = "log")]
        log::debug!(target: "connection", "Connected socket {} to {}", socket.id(), socket.peer_addr());

        let previous = lock(&self.socket).replace(socket.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        self.set_cookie(Cookie::LOCAL);
        Ok(socket)
    }

    /// Sends the connect request unless the server has already assigned a cookie.
    pub fn request_connect_server(&self) -> Result<(), Error> {
        if self.cookie() != Cookie::LOCAL {
            return Ok(());
        }
        let mut request = RemoteMessage::connect_request();
        request.set_sequence(self.next_sequence());
        request.seal();
        self.send_message(&request)
    }

    /// Sends the disconnect request and closes the socket regardless of the sending result.
    pub fn request_disconnect_server(&self) -> Result<(), Error> {
        let Some(socket) = lock(&self.socket).take() else {
            return Ok(());
        };
        let mut request = RemoteMessage::disconnect_request(self.cookie());
        request.set_sequence(self.next_sequence());
        request.seal();
        let res = socket.send_message(&request);
        socket.close();
        self.set_cookie(Cookie::UNKNOWN);
        Ok(res?)
    }

    /// Closes the socket without notifying the server.
    pub fn close_socket(&self) {
        if let Some(socket) = lock(&self.socket).take() {
            socket.close();
        }
        self.set_cookie(Cookie::UNKNOWN);
    }
}

impl MessageSender for ClientConnection {
    fn send_message(&self, message: &RemoteMessage) -> Result<(), Error> {
        let socket = self.socket().ok_or(Error::NotConnected)?;
        socket.send_message(message)?;
        Ok(())
    }
}
