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

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::network::addr::SockAddrBytes;
use crate::network::frame::{ControlKind, Frame, HeartBeat};
use crate::network::node::{Node, Protocol};
use crate::service::{HeartbeatState, NetEvent, Sinks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
    /// multicast receivers take data only
    Receiver,
}

/// Outcome of handing one complete frame to the control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// application data, delivered to the data sink
    Forward,
    /// a control frame, fully handled
    Consumed,
    /// the peer announced it is leaving; the caller tears the node down
    Quit,
}

/// The Hello/Heart/Quit sublayer of one engine.
///
/// All handling is per frame and stateless except for the client's heartbeat counters
/// and the address the server reported in its Hello reply.
pub struct ControlProtocol {
    role: Role,
    sinks: Sinks,
    heartbeat: Option<Arc<HeartbeatState>>,
    reported_addr: Mutex<Option<SocketAddr>>,
}

impl ControlProtocol {
    pub fn new(role: Role, sinks: Sinks, heartbeat: Option<Arc<HeartbeatState>>) -> Self {
        ControlProtocol {
            role,
            sinks,
            heartbeat,
            reported_addr: Mutex::new(None),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sinks(&self) -> &Sinks {
        &self.sinks
    }

    /// The address the server says it sees us at, once a Hello reply arrived.
    pub fn reported_addr(&self) -> Option<SocketAddr> {
        *self.reported_addr.lock()
    }

    /// Routes a complete frame: control frames are handled here, everything else goes to
    /// the data sink.
    pub fn dispatch(&self, node: &Node, frame: Frame) -> Disposition {
        let disposition = self.intercept(node, &frame);
        if disposition == Disposition::Forward {
            self.sinks.data(node, frame.payload);
        }
        disposition
    }

    pub fn intercept(&self, node: &Node, frame: &Frame) -> Disposition {
        let Some(kind) = frame.control_kind() else {
            return Disposition::Forward;
        };
        if self.role == Role::Receiver {
            trace!("receiver ignores {:?} from {}", kind, node);
            return Disposition::Consumed;
        }
        match kind {
            ControlKind::Hello => self.on_hello(node, frame),
            ControlKind::Heart => self.on_heart(node, frame),
            ControlKind::Quit => {
                if node.protocol() == Protocol::Tcp {
                    // TCP peers leave by closing the stream
                    return Disposition::Consumed;
                }
                debug!("{} sent quit", node);
                Disposition::Quit
            }
        }
    }

    fn on_hello(&self, node: &Node, frame: &Frame) -> Disposition {
        match self.role {
            Role::Server => {
                let peer = node.peer_addr();
                self.sinks.event(node, NetEvent::Hello(peer));
                let payload = match SockAddrBytes::from_socket_addr(&peer) {
                    Ok(addr) => addr.to_bytes(),
                    Err(e) => {
                        debug!("hello reply to {} without address: {}", node, e);
                        Default::default()
                    }
                };
                if let Err(e) = node.send_control(ControlKind::Hello, &payload) {
                    debug!("hello reply to {} failed: {}", node, e);
                }
            }
            Role::Client => {
                match SockAddrBytes::parse(&frame.payload).and_then(|raw| raw.to_socket_addr()) {
                    Ok(addr) => {
                        *self.reported_addr.lock() = Some(addr);
                        self.sinks.event(node, NetEvent::Hello(addr));
                    }
                    Err(e) => warn!("bad hello reply from {}: {}", node, e),
                }
            }
            Role::Receiver => {}
        }
        Disposition::Consumed
    }

    fn on_heart(&self, node: &Node, frame: &Frame) -> Disposition {
        let beat = match HeartBeat::decode(&frame.payload) {
            Ok(beat) => beat,
            Err(e) => {
                warn!("dropping heart from {}: {}", node, e);
                return Disposition::Consumed;
            }
        };
        if beat.sender == node.handle() {
            // our own ping came back
            if let Some(heartbeat) = &self.heartbeat {
                heartbeat.acknowledge(beat.sequence);
            }
            return Disposition::Consumed;
        }
        self.sinks.event(
            node,
            NetEvent::Heart {
                sequence: beat.sequence,
                fail_count: beat.fail_count,
            },
        );
        if let Err(e) = node.send_control(ControlKind::Heart, &beat.echo().encode()) {
            debug!("heart echo to {} failed: {}", node, e);
        }
        Disposition::Consumed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::network::frame::decode;
    use crate::service::NetMessage;

    async fn udp_pair() -> crate::AppResult<(Node, UdpSocket)> {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let remote = UdpSocket::bind("127.0.0.1:0").await?;
        let node = Node::udp(1, 77, Protocol::Udp, remote.local_addr()?, local);
        Ok((node, remote))
    }

    #[tokio::test]
    async fn test_server_answers_hello_with_peer_address() -> crate::AppResult<()> {
        let (node, remote) = udp_pair().await?;
        let (sinks, rx) = Sinks::channel(8);
        let control = ControlProtocol::new(Role::Server, sinks, None);

        let hello = Frame::control(ControlKind::Hello, Bytes::new());
        assert_eq!(control.dispatch(&node, hello), Disposition::Consumed);
        assert!(matches!(
            rx.try_recv().unwrap(),
            NetMessage::Event(_, NetEvent::Hello(addr)) if addr == remote.local_addr()?
        ));

        let mut buf = [0u8; 64];
        let (n, _) = remote.recv_from(&mut buf).await?;
        let reply = decode(&buf[..n]);
        assert_eq!(reply.tag, ControlKind::HELLO_TAG);
        let reported = SockAddrBytes::parse(reply.payload)?.to_socket_addr()?;
        assert_eq!(reported, remote.local_addr()?);
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_heart_is_echoed_and_own_heart_acknowledged() -> crate::AppResult<()> {
        let (node, remote) = udp_pair().await?;
        let (sinks, rx) = Sinks::channel(8);
        let heartbeat = Arc::new(HeartbeatState::new(Duration::from_secs(1), 2));
        let control = ControlProtocol::new(Role::Client, sinks, Some(heartbeat.clone()));

        let from_peer = HeartBeat {
            sender: 5,
            sequence: 41,
            fail_count: 1,
        };
        let frame = Frame::control(ControlKind::Heart, from_peer.encode());
        assert_eq!(control.dispatch(&node, frame), Disposition::Consumed);
        assert!(matches!(
            rx.try_recv().unwrap(),
            NetMessage::Event(_, NetEvent::Heart { sequence: 41, fail_count: 1 })
        ));
        let mut buf = [0u8; 64];
        let (n, _) = remote.recv_from(&mut buf).await?;
        let echo = HeartBeat::decode(decode(&buf[..n]).payload)?;
        assert_eq!(echo, from_peer.echo());

        let own = HeartBeat {
            sender: node.handle(),
            sequence: 9,
            fail_count: 0,
        };
        control.dispatch(&node, Frame::control(ControlKind::Heart, own.encode()));
        assert_eq!(heartbeat.last_acked(), 9);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_quit_data_and_unknown_tags() -> crate::AppResult<()> {
        let (node, _remote) = udp_pair().await?;
        let (sinks, rx) = Sinks::channel(8);
        let control = ControlProtocol::new(Role::Server, sinks, None);

        let quit = Frame::control(ControlKind::Quit, Bytes::new());
        assert_eq!(control.dispatch(&node, quit), Disposition::Quit);

        let unknown = Frame {
            tag: 0x1234,
            payload: Bytes::from_static(b"opaque"),
        };
        assert_eq!(control.dispatch(&node, unknown), Disposition::Forward);
        assert_eq!(
            control.dispatch(&node, Frame::data(&b"data"[..])),
            Disposition::Forward
        );
        let delivered: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|message| match message {
                NetMessage::Data(_, data) => data,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(delivered, vec![&b"opaque"[..], &b"data"[..]]);
        Ok(())
    }

    #[tokio::test]
    async fn test_receiver_ignores_control() -> crate::AppResult<()> {
        let (node, _remote) = udp_pair().await?;
        let (sinks, rx) = Sinks::channel(8);
        let control = ControlProtocol::new(Role::Receiver, sinks, None);
        let hello = Frame::control(ControlKind::Hello, Bytes::new());
        assert_eq!(control.dispatch(&node, hello), Disposition::Consumed);
        let quit = Frame::control(ControlKind::Quit, Bytes::new());
        assert_eq!(control.dispatch(&node, quit), Disposition::Consumed);
        assert!(rx.try_recv().is_err());
        Ok(())
    }
}
