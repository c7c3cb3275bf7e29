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

use std::fmt::{self, Display, Formatter};

use crate::remote::{Cookie, DecodeError, PayloadReader, PayloadWriter};
use crate::thread::DispatcherId;

/// Name of a service interface together with the role name of its instance.
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct ServiceKey {
    pub service: String,
    pub role: String,
}

impl ServiceKey {
    pub fn new(service: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            role: role.into(),
        }
    }
}

impl Display for ServiceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.role)
    }
}

fn encode(key: &ServiceKey, cookie: Cookie) -> Vec<u8> {
    PayloadWriter::new().str(&key.service).str(&key.role).cookie(cookie).finish()
}

fn decode(reader: &mut PayloadReader<'_>) -> Result<(ServiceKey, Cookie), DecodeError> {
    let service = reader.string()?;
    let role = reader.string()?;
    let cookie = reader.cookie()?;
    Ok((ServiceKey { service, role }, cookie))
}

/// Address of a service provider: the service instance and the connection it is reachable
/// through.
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct StubAddress {
    pub key: ServiceKey,
    pub cookie: Cookie,
}

impl StubAddress {
    pub fn new(service: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            key: ServiceKey::new(service, role),
            cookie: Cookie::UNKNOWN,
        }
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn encode(&self) -> Vec<u8> { encode(&self.key, self.cookie) }

    pub fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        decode(reader).map(|(key, cookie)| Self { key, cookie })
    }
}

impl Display for StubAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "stub {}@{}", self.key, self.cookie) }
}

/// Address of a service client waiting for the stub with the same [`ServiceKey`].
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct ProxyAddress {
    pub key: ServiceKey,
    pub cookie: Cookie,
}

impl ProxyAddress {
    pub fn new(service: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            key: ServiceKey::new(service, role),
            cookie: Cookie::UNKNOWN,
        }
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn encode(&self) -> Vec<u8> { encode(&self.key, self.cookie) }

    pub fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        decode(reader).map(|(key, cookie)| Self { key, cookie })
    }
}

impl Display for ProxyAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "proxy {}@{}", self.key, self.cookie) }
}

/// Established link to a remote router as seen by the local process.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Channel {
    /// Cookie assigned by the server.
    pub cookie: Cookie,
    /// Thread of the service owning the link.
    pub source: DispatcherId,
    pub target: Cookie,
}

impl Channel {
    pub fn new(cookie: Cookie, source: DispatcherId) -> Self {
        Self {
            cookie,
            source,
            target: Cookie::LOCAL,
        }
    }

    pub fn is_valid(&self) -> bool { self.cookie.is_valid() }
}
