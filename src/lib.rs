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

#![deny(non_upper_case_globals, non_camel_case_types, non_snake_case, unused_mut)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Event-driven communication between dispatcher threads and, over TCP, between processes.
//!
//! Every logical role runs in its own [`DispatcherThread`]: an OS thread blocked in the dispatch
//! loop of its [`Dispatcher`]. Events posted from any thread are queued into the external queue
//! of the dispatcher and delivered in FIFO order to the consumers registered for the event tag;
//! internal events produced while processing an event are delivered before the next external
//! one.
//!
//! [`Timer`]s turn waitable timer expirations into events queued to their owning dispatcher.
//! The [`TimerManager`] suspends a timer whose events are not consumed fast enough and resumes
//! it once the consumer catches up.
//!
//! Across processes, [`ClientService`] and [`ServerService`] exchange checksummed
//! [`RemoteMessage`]s. The server assigns every client a [`Cookie`], routes the messages between
//! the clients and matches the service stubs with the proxies waiting for them in its
//! [`ServiceRegistry`]. Lost connections are re-established by the client automatically.

#[macro_use]
extern crate amplify;

pub mod config;
mod consumers;
pub mod dispatcher;
pub mod event;
pub mod poller;
mod queue;
pub mod remote;
pub mod service;
mod sync;
pub mod thread;
pub mod timeouts;
pub mod timer;

pub use config::ConnectionConfig;
pub use consumers::ConsumerRegistry;
pub use dispatcher::{DispatchContext, DispatchHandler, Dispatcher};
pub use event::{Event, EventConsumer, EventKind, EventTag};
pub use queue::{EventQueue, ExternalQueue, QueueListener, Queued};
pub use remote::{Cookie, MessageId, RemoteMessage, ResultCode};
pub use service::{
    AcceptPolicy, Channel, ClientService, ProxyAddress, RemoteServiceConsumer, ServerService,
    ServiceKey, ServiceRegistry, ServiceState, StubAddress,
};
pub use sync::{Gate, Signals, Wakeup};
pub use thread::{DispatcherId, DispatcherThread, ThreadDirectory, WaitMode};
pub use timeouts::{Deadlines, Timestamp};
pub use timer::{Timer, TimerConsumer, TimerFired, TimerManager, TimerStatus, CONTINUOUSLY};
