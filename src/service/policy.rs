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

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::remote::AcceptFilter;
use crate::sync::lock;

#[derive(Default, Debug)]
struct Lists {
    white: BTreeSet<String>,
    black: BTreeSet<String>,
}

/// Host-based admission of incoming connections.
///
/// A non-empty white list admits only the listed hosts and the black list is ignored; otherwise
/// the hosts from the black list are rejected. With both lists empty every connection is
/// accepted. The policy may be changed from any thread while the server is running.
#[derive(Default, Debug)]
pub struct AcceptPolicy {
    lists: Mutex<Lists>,
}

impl AcceptPolicy {
    pub fn new() -> Self { Self::default() }

    pub fn add_white_list(&self, host: impl Into<String>) -> bool {
        lock(&self.lists).white.insert(host.into())
    }

    pub fn remove_white_list(&self, host: &str) -> bool { lock(&self.lists).white.remove(host) }

    pub fn add_black_list(&self, host: impl Into<String>) -> bool {
        lock(&self.lists).black.insert(host.into())
    }

    pub fn remove_black_list(&self, host: &str) -> bool { lock(&self.lists).black.remove(host) }

    pub fn can_accept_connection(&self, host: &str) -> bool {
        let lists = lock(&self.lists);
        if !lists.white.is_empty() {
            lists.white.contains(host)
        } else {
            !lists.black.contains(host)
        }
    }
}

impl AcceptFilter for AcceptPolicy {
    fn can_accept(&self, peer: &SocketAddr) -> bool {
        self.can_accept_connection(&peer.ip().to_string())
    }
}
