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

//! OS Integration
//!
//! A reactor turns "bytes are available on this socket" into calls into the shared
//! [`ServerContext`], which owns everything that does not depend on the I/O model:
//! node creation, registration, reassembly and control dispatch.
//!
//! Two models implement the same [`Reactor`] contract:
//!
//! - [`CompletionReactor`]: one receive is posted per node; each completion travels
//!   through a shared queue to a pool of worker threads, and the node's next receive is
//!   posted only after a worker hands the session back.
//! - [`ReadinessReactor`]: a single thread waits on the readiness of every socket and
//!   reads inline, either draining a socket until it would block (edge) or performing
//!   one read per wakeup (level).
//!
//! Either way a node has at most one read in flight, and once a node's Quit has been
//! emitted no further data for it is delivered.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, trace, warn};

use crate::network::{
    decode, ControlKind, ControlProtocol, Disposition, Frame, Node, NodeId, Protocol,
    StreamReassembler,
};
use crate::service::{NetConfig, NetEvent, NetSystem, Registry, ShutdownSignal, Sinks};
use crate::AppError::{ChannelSendError, IllegalStateError};
use crate::AppResult;

pub use completion::CompletionReactor;
pub use readiness::ReadinessReactor;

mod completion;
mod readiness;
pub mod socket;

/// largest payload a single UDP datagram can carry
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactorKind {
    Completion,
    Readiness,
}

impl Default for ReactorKind {
    fn default() -> Self {
        if cfg!(windows) {
            ReactorKind::Completion
        } else {
            ReactorKind::Readiness
        }
    }
}

/// The listening socket a server engine runs on, still in std form.
#[derive(Debug)]
pub(crate) enum Endpoint {
    Tcp(std::net::TcpListener),
    Udp(std::net::UdpSocket),
}

impl Endpoint {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Endpoint::Tcp(listener) => listener.local_addr(),
            Endpoint::Udp(socket) => socket.local_addr(),
        }
    }
}

/// Endpoint after conversion into the reactor's runtime.
pub(crate) enum Listening {
    Tcp(TcpListener),
    Udp(UdpSession),
}

pub(crate) trait Reactor: Send + Sync {
    fn kind(&self) -> ReactorKind;

    /// Starts servicing an accepted stream. Must be called from the reactor's runtime.
    fn register(&self, session: TcpSession) -> AppResult<()>;

    /// Stops servicing a node; its teardown happens on the reactor's side.
    fn deregister(&self, node: &Node) -> AppResult<()>;

    /// Serves `endpoint` until the engine's shutdown signal fires. Blocks the caller.
    ///
    /// Returns only after every reactor thread has finished, so no callback for this
    /// engine runs once `run` has returned.
    fn run(&self, endpoint: Endpoint) -> AppResult<()>;
}

pub(crate) fn new_reactor(ctx: Arc<ServerContext>) -> Arc<dyn Reactor> {
    match ctx.config.reactor.kind {
        ReactorKind::Completion => Arc::new(CompletionReactor::new(ctx)),
        ReactorKind::Readiness => Arc::new(ReadinessReactor::new(ctx)),
    }
}

/// Read side state of one TCP node, owned by whoever performs its next read.
pub(crate) struct TcpSession {
    pub node: Node,
    pub stream: Arc<TcpStream>,
    pub reassembler: StreamReassembler,
    pub read_buf: BytesMut,
    /// upper bound of a single read
    pub chunk: usize,
}

impl TcpSession {
    pub fn id(&self) -> NodeId {
        self.node.id()
    }
}

/// The single UDP socket of a server and the peers seen on it.
pub(crate) struct UdpSession {
    pub socket: Arc<UdpSocket>,
    pub peers: HashMap<SocketAddr, Node>,
    pub recv_buf: Vec<u8>,
}

/// What a single read produced.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Data,
    Closed,
    Failed(io::Error),
}

/// State shared by the reactor threads of one server engine.
pub(crate) struct ServerContext {
    pub engine_id: u64,
    pub system: NetSystem,
    pub config: NetConfig,
    pub registry: Arc<Registry>,
    pub control: ControlProtocol,
    pub shutdown: ShutdownSignal,
    ready: Mutex<Option<async_channel::Sender<AppResult<Node>>>>,
    listener: Mutex<Option<Node>>,
}

impl ServerContext {
    pub fn new(
        engine_id: u64,
        system: NetSystem,
        config: NetConfig,
        registry: Arc<Registry>,
        control: ControlProtocol,
        shutdown: ShutdownSignal,
        ready: async_channel::Sender<AppResult<Node>>,
    ) -> ServerContext {
        ServerContext {
            engine_id,
            system,
            config,
            registry,
            control,
            shutdown,
            ready: Mutex::new(Some(ready)),
            listener: Mutex::new(None),
        }
    }

    pub fn sinks(&self) -> &Sinks {
        self.control.sinks()
    }

    pub fn listener(&self) -> Option<Node> {
        self.listener.lock().clone()
    }

    /// Converts the endpoint inside the current runtime, creates the engine's own node
    /// and reports it to the thread blocked in `start()`.
    pub fn open(&self, endpoint: Endpoint) -> AppResult<Listening> {
        let local_addr = endpoint.local_addr()?;
        let (listening, udp) = match endpoint {
            Endpoint::Tcp(listener) => (Listening::Tcp(TcpListener::from_std(listener)?), None),
            Endpoint::Udp(socket) => {
                let socket = Arc::new(UdpSocket::from_std(socket)?);
                let session = UdpSession {
                    socket: socket.clone(),
                    peers: HashMap::new(),
                    recv_buf: vec![0u8; self.config.network.recv_buffer_size.max(MAX_DATAGRAM)],
                };
                (Listening::Udp(session), Some(socket))
            }
        };
        let node = Node::listener(
            self.system.next_node_id(),
            self.system.next_handle(),
            self.config.network.protocol,
            local_addr,
            udp,
        );
        *self.listener.lock() = Some(node.clone());
        self.sinks().event(&node, NetEvent::Ready(node.to_string()));
        self.report_ready(Ok(node))?;
        Ok(listening)
    }

    fn report_ready(&self, result: AppResult<Node>) -> AppResult<()> {
        let Some(ready) = self.take_ready() else {
            return Err(IllegalStateError("server start already reported".into()));
        };
        ready
            .send_blocking(result)
            .map_err(|e| ChannelSendError(format!("nobody waits for server start: {}", e)))
    }

    /// The channel `start()` waits on, present until the start outcome was reported.
    pub fn take_ready(&self) -> Option<async_channel::Sender<AppResult<Node>>> {
        self.ready.lock().take()
    }

    /// Creates, registers and announces the node for an accepted stream.
    pub fn admit_tcp(&self, stream: TcpStream, peer: SocketAddr) -> TcpSession {
        if let Err(e) = socket::tune_accepted(&stream, &self.config.network) {
            debug!("could not tune socket of {}: {}", peer, e);
        }
        let stream = Arc::new(stream);
        let node = Node::tcp(
            self.system.next_node_id(),
            self.system.next_handle(),
            peer,
            stream.clone(),
        );
        self.registry.add(node.clone());
        self.sinks().event(&node, NetEvent::Accept(node.to_string()));
        TcpSession {
            node,
            stream,
            reassembler: StreamReassembler::new(self.config.network.max_cache_size),
            read_buf: BytesMut::with_capacity(self.config.network.recv_buffer_size),
            chunk: self.config.network.recv_buffer_size,
        }
    }

    /// Feeds one read into the node's reassembler and dispatches every complete frame.
    pub fn on_stream_bytes(&self, session: &mut TcpSession) {
        let TcpSession {
            node,
            reassembler,
            read_buf,
            ..
        } = session;
        let result = reassembler.feed(&read_buf[..], |frame| {
            self.control.dispatch(node, frame);
        });
        if let Err(e) = result {
            warn!("{} sent a corrupt frame header, cache dropped: {}", node, e);
        }
    }

    /// Tears a node down exactly once.
    pub fn close(&self, node: &Node) {
        if self.registry.remove(node.id()) {
            trace!("{} closed", node);
        }
    }

    pub fn on_read_outcome(&self, session: &mut TcpSession, outcome: ReadOutcome) -> bool {
        match outcome {
            ReadOutcome::Data => {
                self.on_stream_bytes(session);
                true
            }
            ReadOutcome::Closed => {
                debug!("{} closed by peer", session.node);
                self.close(&session.node);
                false
            }
            ReadOutcome::Failed(e) => {
                debug!("{} read failed: {}", session.node, e);
                self.close(&session.node);
                false
            }
        }
    }

    /// Handles one datagram. Each datagram carries exactly one frame; trailing bytes are
    /// ignored and truncated frames dropped.
    pub fn on_datagram(&self, session: &mut UdpSession, len: usize, from: SocketAddr) {
        let decoded = decode(&session.recv_buf[..len]);
        if !decoded.complete {
            debug!("dropping incomplete datagram of {} bytes from {}", len, from);
            return;
        }
        if decoded.total_len as usize > self.config.network.max_cache_size {
            debug!("dropping oversized datagram from {}", from);
            return;
        }
        let frame = Frame {
            tag: decoded.tag,
            payload: Bytes::copy_from_slice(decoded.payload),
        };
        let node = match session.peers.get(&from) {
            Some(node) if node.is_open() => node.clone(),
            // unknown, or disconnected by the application
            _ => {
                if frame.control_kind() == Some(ControlKind::Quit) {
                    session.peers.remove(&from);
                    return;
                }
                let node = Node::udp(
                    self.system.next_node_id(),
                    self.system.next_handle(),
                    Protocol::Udp,
                    from,
                    session.socket.clone(),
                );
                trace!("new udp peer {}", node);
                self.registry.add(node.clone());
                session.peers.insert(from, node.clone());
                node
            }
        };
        if self.control.dispatch(&node, frame) == Disposition::Quit {
            session.peers.remove(&from);
            self.close(&node);
        }
    }

    /// Best-effort Quit to every UDP peer still registered, sent before sockets close.
    pub fn farewell(&self) {
        if self.config.network.protocol != Protocol::Udp {
            return;
        }
        for node in self.registry.snapshot() {
            if let Err(e) = node.send_control(ControlKind::Quit, &[]) {
                trace!("quit to {} not sent: {}", node, e);
            }
        }
    }
}

/// Accepts with an exponential backoff on transient failures.
pub(crate) async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
    let mut backoff = 1;
    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(err) => {
                if backoff > 64 {
                    error!("accept failed too many times: {}", err);
                    return Err(err.into());
                }
                warn!("accept failed: {}, retry in {}ms", err, backoff);
            }
        }
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        backoff *= 2;
    }
}

/// One non-blocking read of at most `session.chunk` bytes into the session's buffer.
/// `None` means the socket has nothing to read right now.
pub(crate) fn try_read_chunk(session: &mut TcpSession) -> Option<ReadOutcome> {
    let chunk = session.chunk;
    session.read_buf.clear();
    session.read_buf.reserve(chunk);
    loop {
        match session
            .stream
            .try_read_buf(&mut (&mut session.read_buf).limit(chunk))
        {
            Ok(0) => return Some(ReadOutcome::Closed),
            Ok(_) => return Some(ReadOutcome::Data),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => return Some(ReadOutcome::Failed(e)),
        }
    }
}
