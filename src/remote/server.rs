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

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use super::connection::SocketConnection;
use super::message::{Cookie, RemoteMessage};
use super::threads::MessageSender;
use super::Error;
use crate::config::ConnectionConfig;
use crate::sync::lock;

#[derive(Debug)]
struct Tables {
    accepted: HashMap<RawFd, Arc<SocketConnection>>,
    cookies: HashMap<Cookie, RawFd>,
    handles: HashMap<RawFd, Cookie>,
    wait_list: Vec<RawFd>,
    next_cookie: Cookie,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            accepted: empty!(),
            cookies: empty!(),
            handles: empty!(),
            wait_list: empty!(),
            next_cookie: Cookie::FIRST_VALID,
        }
    }
}

impl Tables {
    fn remove(&mut self, fd: RawFd) -> Option<Arc<SocketConnection>> {
        let connection = self.accepted.remove(&fd)?;
        if let Some(cookie) = self.handles.remove(&fd) {
            self.cookies.remove(&cookie);
        }
        self.wait_list.retain(|waiting| *waiting != fd);
        Some(connection)
    }
}

/// Server side of remote connections: a listening socket and the table of accepted connections
/// identified by the cookies assigned to them.
#[derive(Debug)]
pub struct ServerConnection {
    config: ConnectionConfig,
    listener: Mutex<Option<Arc<TcpListener>>>,
    tables: Mutex<Tables>,
}

impl ServerConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            listener: Mutex::new(None),
            tables: Mutex::default(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig { &self.config }

    /// Binds the listening socket.
    pub fn create_socket(&self) -> Result<Arc<TcpListener>, Error> {
        if !self.config.enabled {
            return Err(Error::Disabled);
        }
        let addrs = self.config.socket_addrs()?;
        let listener = Arc::new(TcpListener::bind(&addrs[..])?);

        #[cfg(feature = "log")]
        log::debug!(target: "connection", "Listening on {:?}", listener.local_addr());

        *lock(&self.listener) = Some(listener.clone());
        Ok(listener)
    }

    pub fn listener(&self) -> Option<Arc<TcpListener>> { lock(&self.listener).clone() }

    /// Address the server listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.listener).as_ref().and_then(|listener| listener.local_addr().ok())
    }

    pub fn is_listening(&self) -> bool { lock(&self.listener).is_some() }

    /// Adds the connection to the tables, assigning it a new cookie. Accepting an already known
    /// connection returns its existing cookie.
    pub fn accept_connection(&self, connection: Arc<SocketConnection>) -> Cookie {
        let fd = connection.as_raw_fd();
        let mut tables = lock(&self.tables);
        if let Some(cookie) = tables.handles.get(&fd) {
            return *cookie;
        }
        let cookie = tables.next_cookie;
        tables.next_cookie = cookie.next();
        tables.accepted.insert(fd, connection);
        tables.cookies.insert(cookie, fd);
        tables.handles.insert(fd, cookie);
        tables.wait_list.push(fd);

        #[cfg(feature = "log")]
        log::debug!(target: "connection", "Accepted connection {fd} with cookie {cookie}");

        cookie
    }

    /// Removes the connection from the tables and closes its socket.
    pub fn close_connection(&self, cookie: Cookie) -> bool {
        let Some(fd) = self.handle_of(cookie) else {
            return false;
        };
        self.close_handle(fd)
    }

    pub fn close_handle(&self, fd: RawFd) -> bool {
        let connection = lock(&self.tables).remove(fd);
        match connection {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Sends a "bye" to every accepted connection, then closes all of them.
    pub fn close_all_connections(&self) {
        let connections = {
            let mut tables = lock(&self.tables);
            let connections = tables
                .accepted
                .iter()
                .map(|(fd, connection)| {
                    let cookie = tables.handles.get(fd).copied().unwrap_or_default();
                    (cookie, connection.clone())
                })
                .collect::<Vec<_>>();
            tables.accepted.clear();
            tables.cookies.clear();
            tables.handles.clear();
            tables.wait_list.clear();
            connections
        };
        for (cookie, connection) in connections {
            let mut bye = RemoteMessage::bye(cookie);
            bye.seal();
            let _ = connection.send_message(&bye);
            connection.close();
        }
    }

    /// Closes all connections and the listening socket.
    pub fn close_socket(&self) {
        self.close_all_connections();
        *lock(&self.listener) = None;
    }

    pub fn cookie_of(&self, fd: RawFd) -> Option<Cookie> {
        lock(&self.tables).handles.get(&fd).copied()
    }

    pub fn handle_of(&self, cookie: Cookie) -> Option<RawFd> {
        lock(&self.tables).cookies.get(&cookie).copied()
    }

    pub fn connection(&self, cookie: Cookie) -> Option<Arc<SocketConnection>> {
        let tables = lock(&self.tables);
        let fd = tables.cookies.get(&cookie)?;
        tables.accepted.get(fd).cloned()
    }

    pub fn connection_by_handle(&self, fd: RawFd) -> Option<(Arc<SocketConnection>, Cookie)> {
        let tables = lock(&self.tables);
        let connection = tables.accepted.get(&fd)?.clone();
        let cookie = tables.handles.get(&fd).copied()?;
        Some((connection, cookie))
    }

    /// Handles of the accepted connections to be polled for incoming messages.
    pub fn wait_list(&self) -> Vec<RawFd> { lock(&self.tables).wait_list.clone() }

    pub fn connection_count(&self) -> usize { lock(&self.tables).accepted.len() }
}

impl MessageSender for ServerConnection {
    /// Sends the message to the connection identified by the message target.
    fn send_message(&self, message: &RemoteMessage) -> Result<(), Error> {
        let connection =
            self.connection(message.target()).ok_or(Error::UnknownTarget(message.target()))?;
        connection.send_message(message)?;
        Ok(())
    }
}
