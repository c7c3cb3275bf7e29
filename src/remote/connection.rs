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

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::message::{MessageHeader, RemoteMessage, HEADER_SIZE, MAX_PAYLOAD};
use crate::sync::lock;

/// Process-unique identifier of a connection socket.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From)]
#[wrapper(Display)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Connected socket exchanging [`RemoteMessage`]s.
///
/// Sending and receiving are blocking and may happen concurrently from two different threads;
/// concurrent senders are serialized.
#[derive(Debug)]
pub struct SocketConnection {
    id: SocketId,
    stream: TcpStream,
    peer: SocketAddr,
    write_lock: Mutex<()>,
}

impl AsRawFd for SocketConnection {
    fn as_raw_fd(&self) -> RawFd { self.stream.as_raw_fd() }
}

impl SocketConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(false)?;
        Ok(Self {
            id: SocketId::next(),
            stream,
            peer,
            write_lock: Mutex::new(()),
        })
    }

    /// Connects to the first reachable address from the list.
    pub fn connect(addrs: &[SocketAddr], timeout: Duration) -> io::Result<Self> {
        let mut last_err = io::Error::from(io::ErrorKind::AddrNotAvailable);
        for addr in addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => return Self::new(stream),
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "connection", "Unable to connect {addr}: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    pub fn id(&self) -> SocketId { self.id }

    pub fn peer_addr(&self) -> SocketAddr { self.peer }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.stream.local_addr() }

    /// Writes the header and the payload of a sealed message.
    pub fn send_message(&self, message: &RemoteMessage) -> io::Result<()> {
        let _guard = lock(&self.write_lock);
        let mut stream = &self.stream;
        stream.write_all(&message.sealed_header())?;
        if !message.payload().is_empty() {
            stream.write_all(message.payload())?;
        }
        #[cfg(feature = "log")]
        log::trace!(target: "connection", "Sent {message:?} to {}", self.peer);
        Ok(())
    }

    /// Reads a single message.
    ///
    /// # Returns
    ///
    /// `None` if the message has failed the validation and was dropped.
    ///
    /// # Errors
    ///
    /// I/O errors, including the end of the stream, and payloads exceeding [`MAX_PAYLOAD`].
    pub fn receive_message(&self) -> io::Result<Option<RemoteMessage>> {
        let mut stream = &self.stream;
        let mut buf = [0u8; HEADER_SIZE];
        stream.read_exact(&mut buf)?;
        let header = MessageHeader::decode(&buf[..])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let len = header.used_size as usize;
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message payload of {len} bytes exceeds the limit"),
            ));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload)?;

        let message = RemoteMessage::from_parts(header, payload);
        if !message.is_valid() {
            #[cfg(feature = "log")]
            log::warn!(target: "connection", "Dropping message {message:?} with invalid checksum from {}", self.peer);
            return Ok(None);
        }
        #[cfg(feature = "log")]
        log::trace!(target: "connection", "Received {message:?} from {}", self.peer);
        Ok(Some(message))
    }

    /// Shuts the socket down, interrupting blocked reads of other threads.
    pub fn close(&self) {
        #[cfg(feature = "log")]
        log::debug!(target: "connection", "Closing connection {} to {}", self.id, self.peer);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use super::*;
    use crate::remote::message::{Cookie, MessageId};

    fn pair() -> (SocketConnection, SocketConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = SocketConnection::connect(&[addr], Duration::from_secs(5)).unwrap();
        let (stream, _) = listener.accept().unwrap();
        (client, SocketConnection::new(stream).unwrap())
    }

    #[test]
    fn framing() {
        let (client, server) = pair();
        assert_ne!(client.id(), server.id());

        let mut first = RemoteMessage::new(MessageId::from(1), Cookie::from(100), Cookie::ROUTER)
            .with_payload(b"hello".to_vec());
        first.seal();
        let mut empty = RemoteMessage::connect_request();
        empty.seal();
        client.send_message(&first).unwrap();
        client.send_message(&empty).unwrap();

        assert_eq!(server.receive_message().unwrap(), Some(first));
        assert_eq!(server.receive_message().unwrap(), Some(empty));
    }

    #[test]
    fn invalid_checksum_is_dropped() {
        let (client, server) = pair();
        let mut message = RemoteMessage::connect_request().with_payload(vec![1, 2, 3]);
        message.seal();
        let mut header = *message.header();
        header.checksum ^= 0xFFFF;
        let mut raw = header.encode().to_vec();
        raw.extend_from_slice(message.payload());
        (&client.stream).write_all(&raw).unwrap();
        client.send_message(&message).unwrap();

        assert_eq!(server.receive_message().unwrap(), None);
        // the stream stays in sync after the dropped message
        assert_eq!(server.receive_message().unwrap(), Some(message));
    }

    #[test]
    fn closed_peer() {
        let (client, server) = pair();
        client.close();
        assert!(server.receive_message().is_err());
    }
}
