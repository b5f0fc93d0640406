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

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::network::frame::{encode, ControlKind, DATA_TAG};
use crate::AppError::{NodeClosed, Unsupported};
use crate::AppResult;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    UdpMulticast,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::UdpMulticast => "MULTICAST",
        };
        f.write_str(name)
    }
}

struct TcpLink {
    stream: Arc<TcpStream>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

enum Link {
    /// a listening socket; UDP listeners may still address arbitrary peers
    Listener(Option<Arc<UdpSocket>>),
    /// released on close so the socket goes away with the reactor's session
    Tcp(Mutex<Option<TcpLink>>),
    Udp(Arc<UdpSocket>),
}

struct NodeInner {
    id: NodeId,
    protocol: Protocol,
    peer: SocketAddr,
    handle: AtomicU32,
    link: Link,
}

/// One transport endpoint: an accepted or connected TCP stream, a UDP peer, or an
/// engine's own listening socket.
///
/// `Node` is a cheap handle; clones refer to the same endpoint. The handle value is a
/// random non-zero number while the node is open and 0 afterwards. It doubles as the
/// sender id carried in heart frames.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub(crate) fn listener(
        id: NodeId,
        handle: u32,
        protocol: Protocol,
        local_addr: SocketAddr,
        udp: Option<Arc<UdpSocket>>,
    ) -> Node {
        Node::with_link(id, handle, protocol, local_addr, Link::Listener(udp))
    }

    /// Wraps an established stream and spawns its writer task on the current runtime.
    pub(crate) fn tcp(id: NodeId, handle: u32, peer: SocketAddr, stream: Arc<TcpStream>) -> Node {
        Node::tcp_with_writer(id, handle, peer, stream).0
    }

    /// Like [`Node::tcp`], also returning the writer task. The task ends once the node is
    /// closed and every queued frame has been written.
    pub(crate) fn tcp_with_writer(
        id: NodeId,
        handle: u32,
        peer: SocketAddr,
        stream: Arc<TcpStream>,
    ) -> (Node, JoinHandle<()>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(id, stream.clone(), outbound_rx));
        let node = Node::with_link(
            id,
            handle,
            Protocol::Tcp,
            peer,
            Link::Tcp(Mutex::new(Some(TcpLink { stream, outbound }))),
        );
        (node, writer)
    }

    pub(crate) fn udp(
        id: NodeId,
        handle: u32,
        protocol: Protocol,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
    ) -> Node {
        Node::with_link(id, handle, protocol, peer, Link::Udp(socket))
    }

    fn with_link(
        id: NodeId,
        handle: u32,
        protocol: Protocol,
        peer: SocketAddr,
        link: Link,
    ) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                id,
                protocol,
                peer,
                handle: AtomicU32::new(handle),
                link,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn handle(&self) -> u32 {
        self.inner.handle.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.handle() != 0
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Remote address for connections and UDP peers, local address for listeners.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.peer.ip()
    }

    pub fn port(&self) -> u16 {
        self.inner.peer.port()
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.inner.link, Link::Listener(_))
    }

    /// Sends `payload` as one application data frame, returning the encoded frame size.
    pub fn send(&self, payload: &[u8]) -> AppResult<usize> {
        self.send_frame(DATA_TAG, payload)
    }

    /// Sends a data frame to an arbitrary address over this node's UDP socket.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> AppResult<usize> {
        self.ensure_open()?;
        let socket = match &self.inner.link {
            Link::Udp(socket) if self.inner.protocol == Protocol::Udp => socket,
            Link::Listener(Some(socket)) => socket,
            _ => {
                return Err(Unsupported(format!(
                    "send_to on {} node {}",
                    self.inner.protocol, self.inner.id
                )))
            }
        };
        let frame = encode(payload, DATA_TAG);
        send_datagram(socket, &frame, addr)
    }

    pub(crate) fn send_control(&self, kind: ControlKind, payload: &[u8]) -> AppResult<usize> {
        self.send_frame(kind.tag(), payload)
    }

    pub(crate) fn send_frame(&self, tag: u32, payload: &[u8]) -> AppResult<usize> {
        self.ensure_open()?;
        let frame = encode(payload, tag);
        match &self.inner.link {
            Link::Tcp(link) => {
                let len = frame.len();
                let guard = link.lock();
                let link = guard.as_ref().ok_or_else(|| self.closed_error())?;
                link.outbound
                    .send(frame.freeze())
                    .map_err(|_| self.closed_error())?;
                Ok(len)
            }
            Link::Udp(socket) if self.inner.protocol == Protocol::Udp => {
                send_datagram(socket, &frame, self.inner.peer)
            }
            _ => Err(Unsupported(format!(
                "send on {} {} node {}",
                if self.is_listener() { "listening" } else { "receive-only" },
                self.inner.protocol,
                self.inner.id
            ))),
        }
    }

    /// Shuts the underlying stream down in both directions so the receive path sees EOF.
    pub(crate) fn shutdown_stream(&self) -> AppResult<()> {
        if let Link::Tcp(link) = &self.inner.link {
            if let Some(link) = link.lock().as_ref() {
                SockRef::from(link.stream.as_ref()).shutdown(Shutdown::Both)?;
                return Ok(());
            }
        }
        Err(self.closed_error())
    }

    /// Marks the node closed and releases its send path. Returns true only for the call
    /// that actually closed it.
    pub(crate) fn close(&self) -> bool {
        if self.inner.handle.swap(0, Ordering::AcqRel) == 0 {
            return false;
        }
        if let Link::Tcp(link) = &self.inner.link {
            link.lock().take();
        }
        trace!("node {} closed", self);
        true
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> crate::AppError {
        NodeClosed(format!("{}(id {})", self, self.inner.id))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inner.protocol, self.inner.peer)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("protocol", &self.inner.protocol)
            .field("peer", &self.inner.peer)
            .field("handle", &self.handle())
            .finish()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Node {}

async fn write_loop(
    node_id: NodeId,
    stream: Arc<TcpStream>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_all(&stream, &frame).await {
            debug!("write to node {} failed: {}", node_id, e);
            break;
        }
    }
    trace!("writer of node {} exited", node_id);
}

async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket wrote zero bytes")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                continue
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// Goes straight to the OS socket; tokio's readiness cache is empty until the driver polls it.
fn send_datagram(socket: &UdpSocket, frame: &[u8], addr: SocketAddr) -> AppResult<usize> {
    let sent = SockRef::from(socket).send_to(frame, &addr.into())?;
    trace!("sent {} byte datagram to {}", sent, addr);
    Ok(sent)
}
