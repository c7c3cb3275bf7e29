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

//! Connection configuration consumed by the client and server services.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8181;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters of a remote connection.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionConfig {
    /// Whether the connection may be established at all.
    pub enabled: bool,
    /// Host name or IP address; for a server the address to listen on.
    pub host: String,
    /// Port number; a server given zero listens on a port assigned by the system.
    pub port: u16,
    /// Delay before a failed connection is retried.
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..default!()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolves the host and the port into socket addresses.
    pub fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs = (self.host.as_str(), self.port).to_socket_addrs()?.collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("host {} has no addresses", self.host),
            ));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = ConnectionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.socket_addrs().unwrap(), vec![SocketAddr::from(([127, 0, 0, 1], 8181))]);
        assert_eq!(config.retry_interval, Duration::from_millis(500));
    }

    #[test]
    fn builder() {
        let config = ConnectionConfig::new("localhost", 0)
            .enabled(false)
            .retry_interval(Duration::from_millis(20))
            .connect_timeout(Duration::from_millis(100));
        assert!(!config.enabled);
        assert_eq!(config.port, 0);
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
    }
}
