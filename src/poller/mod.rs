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

//! Readiness polling of sockets used by the receive threads.

pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct IoType {
    /// Specifies whether I/O source has data to read (or a pending connection to accept).
    pub read: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self { Self::default() }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_readable(self) -> bool { self.read }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("none"),
            (true, true) => f.write_str("read-write"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
        }
    }
}

#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (POSIX events {0:#b})
    Connectivity(i16),
    /// OS-level error (POSIX events {0:#b})
    Os(i16),
}

/// Multi-source readiness poll.
///
/// After a successful [`Poll::poll`] call the ready sources are obtained by iterating the
/// poller.
pub trait Poll
where Self: Send + Iterator<Item = (RawFd, Result<IoType, IoFail>)>
{
    fn register(&mut self, fd: &impl AsRawFd, interest: IoType);
    fn unregister(&mut self, fd: &impl AsRawFd);

    /// Number of registered sources.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }

    /// Blocks until some of the sources become ready or the timeout elapses. `None` waits
    /// infinitely.
    ///
    /// # Returns
    ///
    /// Number of new events; zero if the poll has timed out.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}
