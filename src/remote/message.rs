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

//! Remote message envelope: a fixed-size checksummed header followed by the payload.

use std::fmt::{self, Debug, Formatter};

use amplify::hex::ToHex;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the encoded message header.
pub const HEADER_SIZE: usize = 40;

/// Largest payload accepted from the wire.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Connection identity assigned by the server.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default, From)]
#[wrapper(Display, LowerHex)]
pub struct Cookie(u64);

impl Cookie {
    /// Identity is not known, the connection is not established.
    pub const UNKNOWN: Cookie = Cookie(0);
    /// Connection socket exists, but the server has not assigned the identity yet.
    pub const LOCAL: Cookie = Cookie(1);
    /// The server (message router) itself.
    pub const ROUTER: Cookie = Cookie(2);
    /// First cookie assigned to a client.
    pub const FIRST_VALID: Cookie = Cookie(100);

    pub const fn value(self) -> u64 { self.0 }

    /// Whether the cookie was assigned to a client by the server.
    pub const fn is_valid(self) -> bool { self.0 >= Self::FIRST_VALID.0 }

    pub(crate) const fn next(self) -> Self { Self(self.0 + 1) }
}

/// Message identifier.
///
/// Identifiers below [`MessageId::FIRST_RESPONSE`] are requests, up to
/// [`MessageId::FIRST_CONTROL`] are responses and broadcasts; both are executable messages routed
/// between clients. The rest are control messages of the connection protocol.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default, From)]
#[wrapper(Display, LowerHex)]
pub struct MessageId(u32);

impl MessageId {
    pub const UNDEFINED: MessageId = MessageId(0);
    pub const FIRST_REQUEST: MessageId = MessageId(1);
    pub const FIRST_RESPONSE: MessageId = MessageId(0x4000_0000);
    pub const FIRST_CONTROL: MessageId = MessageId(0xF000_0000);

    pub const CONNECT: MessageId = MessageId(0xF000_0001);
    pub const CONNECT_NOTIFY: MessageId = MessageId(0xF000_0002);
    pub const DISCONNECT: MessageId = MessageId(0xF000_0003);
    pub const REJECT_NOTIFY: MessageId = MessageId(0xF000_0004);
    pub const BYE: MessageId = MessageId(0xF000_0005);

    pub const REGISTER_STUB: MessageId = MessageId(0xF000_0010);
    pub const UNREGISTER_STUB: MessageId = MessageId(0xF000_0011);
    pub const REGISTER_PROXY: MessageId = MessageId(0xF000_0012);
    pub const UNREGISTER_PROXY: MessageId = MessageId(0xF000_0013);

    /// Sent to a proxy when the stub of its service becomes available.
    pub const SERVICE_REGISTERED: MessageId = MessageId(0xF000_0020);
    /// Sent to a proxy when the stub of its service goes away.
    pub const SERVICE_UNREGISTERED: MessageId = MessageId(0xF000_0021);
    /// Sent to a stub when a proxy of another process connects to it.
    pub const CLIENT_REGISTERED: MessageId = MessageId(0xF000_0022);
    /// Sent to a stub when a proxy of another process disconnects from it.
    pub const CLIENT_UNREGISTERED: MessageId = MessageId(0xF000_0023);

    pub const fn value(self) -> u32 { self.0 }

    pub const fn is_request(self) -> bool {
        self.0 >= Self::FIRST_REQUEST.0 && self.0 < Self::FIRST_RESPONSE.0
    }

    pub const fn is_response(self) -> bool {
        self.0 >= Self::FIRST_RESPONSE.0 && self.0 < Self::FIRST_CONTROL.0
    }

    /// Requests, responses and broadcasts exchanged by application services.
    pub const fn is_executable(self) -> bool {
        self.0 >= Self::FIRST_REQUEST.0 && self.0 < Self::FIRST_CONTROL.0
    }

    pub const fn is_control(self) -> bool { self.0 >= Self::FIRST_CONTROL.0 }

    /// Identifier of the response answering this request.
    pub const fn response(self) -> MessageId {
        if self.is_request() {
            MessageId(self.0 | Self::FIRST_RESPONSE.0)
        } else {
            self
        }
    }
}

/// Result of message processing reported in the message header.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
#[repr(u32)]
pub enum ResultCode {
    #[default]
    #[display("undefined")]
    Undefined = 0,

    #[display("ok")]
    Ok = 1,

    /// The target of the message is not connected.
    #[display("service-unavailable")]
    ServiceUnavailable = 2,

    #[display("invalid")]
    Invalid = 3,
}

impl ResultCode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ResultCode::Ok,
            2 => ResultCode::ServiceUnavailable,
            3 => ResultCode::Invalid,
            _ => ResultCode::Undefined,
        }
    }
}

/// Connection status reported by the server to a client.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[repr(u32)]
pub enum ConnectionStatus {
    #[display("disconnected")]
    Disconnected = 0,

    #[display("connected")]
    Connected = 1,

    #[display("rejected")]
    Rejected = 2,
}

impl ConnectionStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ConnectionStatus::Connected,
            2 => ConnectionStatus::Rejected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// CRC-32 (IEEE 802.3) digest.
#[derive(Copy, Clone, Debug)]
pub struct Crc32(u32);

impl Default for Crc32 {
    fn default() -> Self { Self::new() }
}

impl Crc32 {
    pub const fn new() -> Self { Self(!0) }

    pub fn update(&mut self, data: &[u8]) {
        for byte in data {
            self.0 = CRC_TABLE[((self.0 ^ *byte as u32) & 0xFF) as usize] ^ (self.0 >> 8);
        }
    }

    pub fn finish(self) -> u32 { !self.0 }

    pub fn digest(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finish()
    }
}

/// Fixed-size message header.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct MessageHeader {
    pub checksum: u32,
    pub source: Cookie,
    pub target: Cookie,
    pub message_id: MessageId,
    pub result: u32,
    pub sequence: u32,
    pub total_size: u32,
    pub used_size: u32,
}

impl MessageHeader {
    /// Little-endian encoding of the header.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32_le(self.checksum);
        buf.put_u64_le(self.source.value());
        buf.put_u64_le(self.target.value());
        buf.put_u32_le(self.message_id.value());
        buf.put_u32_le(self.result);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.total_size);
        buf.put_u32_le(self.used_size);
        buf.freeze()
    }

    /// Decodes the header from the first [`HEADER_SIZE`] bytes of the buffer.
    ///
    /// # Errors
    ///
    /// [`DecodeError::UnexpectedEnd`] if the buffer is shorter than the header.
    pub fn decode(mut buf: impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(DecodeError::UnexpectedEnd(buf.remaining()));
        }
        Ok(Self {
            checksum: buf.get_u32_le(),
            source: Cookie(buf.get_u64_le()),
            target: Cookie(buf.get_u64_le()),
            message_id: MessageId(buf.get_u32_le()),
            result: buf.get_u32_le(),
            sequence: buf.get_u32_le(),
            total_size: buf.get_u32_le(),
            used_size: buf.get_u32_le(),
        })
    }
}

/// Checksummed envelope of all cross-process traffic.
#[derive(Clone, Eq, PartialEq)]
pub struct RemoteMessage {
    header: MessageHeader,
    payload: Vec<u8>,
}

impl Debug for RemoteMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 32;
        let preview = &self.payload[..self.payload.len().min(PREVIEW)];
        f.debug_struct("RemoteMessage")
            .field("id", &format_args!("{:#x}", self.header.message_id))
            .field("source", &self.header.source)
            .field("target", &self.header.target)
            .field("sequence", &self.header.sequence)
            .field("payload", &preview.to_hex())
            .finish()
    }
}

impl RemoteMessage {
    pub fn new(message_id: MessageId, source: Cookie, target: Cookie) -> Self {
        Self {
            header: MessageHeader {
                source,
                target,
                message_id,
                ..default!()
            },
            payload: empty!(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn from_parts(header: MessageHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &MessageHeader { &self.header }

    pub fn message_id(&self) -> MessageId { self.header.message_id }

    pub fn source(&self) -> Cookie { self.header.source }

    pub fn target(&self) -> Cookie { self.header.target }

    pub fn sequence(&self) -> u32 { self.header.sequence }

    pub fn result(&self) -> ResultCode { ResultCode::from_raw(self.header.result) }

    pub fn payload(&self) -> &[u8] { &self.payload }

    pub fn reader(&self) -> PayloadReader<'_> { PayloadReader::new(&self.payload) }

    pub fn set_source(&mut self, source: Cookie) { self.header.source = source }

    pub fn set_target(&mut self, target: Cookie) { self.header.target = target }

    pub fn set_sequence(&mut self, sequence: u32) { self.header.sequence = sequence }

    pub fn set_result(&mut self, result: ResultCode) { self.header.result = result as u32 }

    /// Checksum over the header without the checksum field, followed by the payload.
    pub fn checksum(&self) -> u32 {
        let mut crc = Crc32::new();
        crc.update(&self.header.encode()[4..]);
        crc.update(&self.payload);
        crc.finish()
    }

    /// Updates the buffer sizes and the checksum of the header. Must be called after the last
    /// modification and before the message is sent.
    pub fn seal(&mut self) {
        let len = self.payload.len() as u32;
        self.header.used_size = len;
        self.header.total_size = len;
        self.header.checksum = self.checksum();
    }

    /// Header of the sealed message ready to be written to the wire.
    pub fn sealed_header(&self) -> Bytes { self.header.encode() }

    /// Whether the buffer sizes and the checksum match the content.
    pub fn is_valid(&self) -> bool {
        self.header.used_size as usize == self.payload.len()
            && self.header.total_size >= self.header.used_size
            && self.header.checksum == self.checksum()
    }

    /// Message with no payload passed between the client and the server.
    pub fn control(message_id: MessageId, source: Cookie, target: Cookie) -> Self {
        Self::new(message_id, source, target)
    }

    /// Request of a client to get connected and receive a cookie.
    pub fn connect_request() -> Self {
        Self::control(MessageId::CONNECT, Cookie::LOCAL, Cookie::ROUTER)
    }

    /// Reply of the server to a connect request carrying the assigned cookie.
    pub fn connect_notify(cookie: Cookie, status: ConnectionStatus) -> Self {
        let payload = PayloadWriter::new().cookie(cookie).u32(status as u32).finish();
        Self::control(MessageId::CONNECT_NOTIFY, Cookie::ROUTER, cookie).with_payload(payload)
    }

    pub fn disconnect_request(cookie: Cookie) -> Self {
        let payload = PayloadWriter::new().cookie(cookie).finish();
        Self::control(MessageId::DISCONNECT, cookie, Cookie::ROUTER).with_payload(payload)
    }

    /// Sent by the server to a connection refused by the accept policy.
    pub fn reject_notify(cookie: Cookie) -> Self {
        let payload =
            PayloadWriter::new().cookie(cookie).u32(ConnectionStatus::Rejected as u32).finish();
        Self::control(MessageId::REJECT_NOTIFY, Cookie::ROUTER, cookie).with_payload(payload)
    }

    /// Broadcast by a server which is shutting down.
    pub fn bye(cookie: Cookie) -> Self { Self::control(MessageId::BYE, Cookie::ROUTER, cookie) }

    /// Response reporting that the request could not be delivered.
    pub fn failure_response(request: &RemoteMessage, result: ResultCode) -> Self {
        let mut response =
            Self::new(request.message_id().response(), Cookie::ROUTER, request.source());
        response.set_sequence(request.sequence());
        response.set_result(result);
        response
    }

    /// Decodes the cookie and the status carried by connect and reject notifications.
    pub fn connection_status(&self) -> Result<(Cookie, ConnectionStatus), DecodeError> {
        let mut reader = self.reader();
        let cookie = reader.cookie()?;
        let status = ConnectionStatus::from_raw(reader.u32()?);
        Ok((cookie, status))
    }
}

/// Payload decoding errors
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum DecodeError {
    /// unexpected end of the message payload at position {0}.
    UnexpectedEnd(usize),

    /// payload contains a string which is not a valid UTF-8.
    NonUtf8,
}

/// Builder of message payloads using little-endian integers and length-prefixed strings.
#[derive(Clone, Default, Debug)]
pub struct PayloadWriter(BytesMut);

impl PayloadWriter {
    pub fn new() -> Self { Self::default() }

    pub fn u32(mut self, value: u32) -> Self {
        self.0.put_u32_le(value);
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.0.put_u64_le(value);
        self
    }

    pub fn cookie(self, cookie: Cookie) -> Self { self.u64(cookie.value()) }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.0.put_u32_le(data.len() as u32);
        self.0.put_slice(data);
        self
    }

    pub fn str(self, s: &str) -> Self { self.bytes(s.as_bytes()) }

    pub fn finish(self) -> Vec<u8> { self.0.to_vec() }
}

/// Reader of payloads produced by [`PayloadWriter`].
#[derive(Clone, Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    len: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self { Self { data, len: data.len() } }

    pub fn is_empty(&self) -> bool { !self.data.has_remaining() }

    fn pos(&self) -> usize { self.len - self.data.remaining() }

    fn ensure(&self, len: usize) -> Result<(), DecodeError> {
        if self.data.remaining() < len {
            return Err(DecodeError::UnexpectedEnd(self.pos()));
        }
        Ok(())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.data.get_u64_le())
    }

    pub fn cookie(&mut self) -> Result<Cookie, DecodeError> { self.u64().map(Cookie) }

    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let start = self.pos();
        let len = self.u32()? as usize;
        if self.data.remaining() < len {
            return Err(DecodeError::UnexpectedEnd(start));
        }
        let data: &'a [u8] = self.data;
        self.data.advance(len);
        Ok(&data[..len])
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::NonUtf8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crc_check_value() {
        assert_eq!(Crc32::digest(b"123456789"), 0xCBF4_3926);
        assert_eq!(Crc32::digest(b""), 0);
    }

    #[test]
    fn checksum_round_trip() {
        let payload = PayloadWriter::new().str("service").u32(7).finish();
        let mut message = RemoteMessage::new(MessageId::from(42), Cookie::from(100), Cookie::ROUTER)
            .with_payload(payload);
        message.set_sequence(3);
        assert!(!message.is_valid());
        message.seal();
        assert!(message.is_valid());

        let sealed = message.sealed_header();
        assert_eq!(sealed.len(), HEADER_SIZE);
        let decoded = MessageHeader::decode(sealed.clone()).unwrap();
        assert_eq!(&decoded, message.header());
        assert_eq!(
            MessageHeader::decode(&sealed[..HEADER_SIZE - 1]),
            Err(DecodeError::UnexpectedEnd(HEADER_SIZE - 1))
        );
        let received = RemoteMessage::from_parts(decoded, message.payload().to_vec());
        assert!(received.is_valid());

        for pos in 0..message.payload().len() {
            let mut payload = message.payload().to_vec();
            payload[pos] ^= 0x01;
            let corrupted = RemoteMessage::from_parts(*message.header(), payload);
            assert!(!corrupted.is_valid(), "corruption at {pos} is not detected");
        }

        let mut header = *message.header();
        header.target = Cookie::from(101);
        assert!(!RemoteMessage::from_parts(header, message.payload().to_vec()).is_valid());
    }

    #[test]
    fn message_ranges() {
        let request = MessageId::from(5);
        assert!(request.is_request());
        assert!(request.is_executable());
        assert!(request.response().is_response());
        assert!(request.response().is_executable());
        assert!(MessageId::CONNECT.is_control());
        assert!(!MessageId::CONNECT.is_executable());
        assert!(!MessageId::UNDEFINED.is_executable());
    }

    #[test]
    fn connection_notifications() {
        let notify = RemoteMessage::connect_notify(Cookie::FIRST_VALID, ConnectionStatus::Connected);
        assert_eq!(notify.target(), Cookie::FIRST_VALID);
        assert_eq!(
            notify.connection_status(),
            Ok((Cookie::FIRST_VALID, ConnectionStatus::Connected))
        );
        let reject = RemoteMessage::reject_notify(Cookie::UNKNOWN);
        assert_eq!(reject.connection_status(), Ok((Cookie::UNKNOWN, ConnectionStatus::Rejected)));
        assert_eq!(
            RemoteMessage::connect_request().connection_status(),
            Err(DecodeError::UnexpectedEnd(0))
        );
    }

    #[test]
    fn payload_reader() {
        let payload = PayloadWriter::new().cookie(Cookie::from(101)).str("role").finish();
        let mut reader = PayloadReader::new(&payload);
        assert_eq!(reader.cookie(), Ok(Cookie::from(101)));
        assert_eq!(reader.string().as_deref(), Ok("role"));
        assert!(reader.is_empty());
        assert_eq!(reader.u32(), Err(DecodeError::UnexpectedEnd(16)));
    }
}
