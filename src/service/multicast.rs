// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::{IpAddr, SocketAddr};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::network::{encode, Protocol, DATA_TAG};
use crate::reactor::socket;
use crate::AppError::{InvalidValue, NodeClosed};
use crate::AppResult;

use super::NetConfig;

/// Sends framed datagrams to a multicast group. Blocking, no engine thread.
#[derive(Debug)]
pub struct MulticastSender {
    group: SocketAddr,
    socket: Mutex<Option<std::net::UdpSocket>>,
}

impl MulticastSender {
    pub fn new(config: &NetConfig) -> AppResult<MulticastSender> {
        if config.network.protocol != Protocol::UdpMulticast {
            return Err(InvalidValue(format!(
                "multicast sender needs protocol udp_multicast, got {}",
                config.network.protocol
            )));
        }
        config.validate()?;
        let group = socket::parse_ipv4(&config.network.host)?;
        let socket = socket::multicast_sender(&config.network, &config.multicast)?;
        debug!("multicast sender ready for {}:{}", group, config.network.port);
        Ok(MulticastSender {
            group: SocketAddr::new(IpAddr::V4(group), config.network.port),
            socket: Mutex::new(Some(socket)),
        })
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        let socket = self.socket.lock();
        let socket = socket.as_ref().ok_or_else(|| self.released())?;
        Ok(socket.local_addr()?)
    }

    /// Sends `payload` as one data frame, returning the datagram size.
    pub fn send(&self, payload: &[u8]) -> AppResult<usize> {
        let frame = encode(payload, DATA_TAG);
        let socket = self.socket.lock();
        let socket = socket.as_ref().ok_or_else(|| self.released())?;
        let sent = socket.send_to(&frame, self.group)?;
        trace!("sent {} bytes to {}", sent, self.group);
        Ok(sent)
    }

    /// Closes the socket. Later sends fail with `NodeClosed`.
    pub fn release(&self) {
        if self.socket.lock().take().is_some() {
            debug!("multicast sender for {} released", self.group);
        }
    }

    pub fn is_released(&self) -> bool {
        self.socket.lock().is_none()
    }

    fn released(&self) -> crate::AppError {
        NodeClosed(format!("multicast sender for {} was released", self.group))
    }
}
