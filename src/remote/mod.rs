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

//! Cross-process transport: checksummed message envelope, client and server connections and the
//! send and receive threads serving them.

mod client;
mod connection;
pub mod message;
mod server;
mod threads;

use std::io;

pub use client::ClientConnection;
pub use connection::{SocketConnection, SocketId};
pub use message::{
    ConnectionStatus, Cookie, DecodeError, MessageHeader, MessageId, PayloadReader, PayloadWriter,
    RemoteMessage, ResultCode,
};
pub use server::ServerConnection;
pub use threads::{
    spawn_client_receiver, spawn_server_receiver, AcceptFilter, MessageSender, SendThread,
    SEND_MESSAGE,
};

use crate::event::{Event, EventKind, EventTag};

/// Transport errors
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// connection is disabled by the configuration.
    Disabled,

    /// connection socket is not created.
    NotConnected,

    /// there is no connection for the target {0}.
    UnknownTarget(Cookie),

    /// I/O error. Details: {0}
    #[from]
    Io(io::Error),
}

/// Tag of the events reporting transport activity to the service owning the connection.
pub const TRANSPORT_EVENT: EventTag = EventTag::new("transport");

/// Payload of [`TRANSPORT_EVENT`] events.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Valid message received from the connection identified by the cookie.
    Received { from: Cookie, message: RemoteMessage },

    /// Message which could not be written to the connection.
    FailedSend(RemoteMessage),

    /// Client connection socket got broken.
    FailedReceive(SocketId),

    /// Accepted connection identified by the cookie got broken.
    ConnectionLost(Cookie),

    /// Listening socket got broken.
    ListenerFailed,
}

impl TransportEvent {
    pub fn into_event(self) -> Event {
        let kind = match self {
            TransportEvent::Received { ref message, .. } if message.message_id().is_request() => {
                EventKind::REQUEST
            }
            TransportEvent::Received { .. } => EventKind::NOTIFY,
            _ => EventKind::CONNECT,
        };
        Event::new(TRANSPORT_EVENT, EventKind::EXTERNAL | EventKind::REMOTE | kind, self)
    }
}
