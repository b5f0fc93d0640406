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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::network::{
    decode, ControlKind, ControlProtocol, Disposition, Frame, HeartBeat, Node, Protocol, Role,
    StreamReassembler,
};
use crate::reactor::{socket, try_read_chunk, ReadOutcome, TcpSession, MAX_DATAGRAM};
use crate::AppError::{AlreadyRunning, ChannelRecvError, InvalidValue, NotRunning, Unsupported};
use crate::AppResult;

use super::heartbeat::{self, HeartbeatExit, HeartbeatState};
use super::state::{EngineState, StateCell};
use super::system::on_engine_thread;
use super::{enter_engine, NetConfig, NetEvent, NetSystem, Shutdown, ShutdownSignal, Sinks};

/// Why the client's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    PeerClosed,
    PeerQuit,
}

enum ClientSocket {
    Tcp(std::net::TcpStream),
    Udp(std::net::UdpSocket),
    Multicast {
        socket: std::net::UdpSocket,
        group: Ipv4Addr,
        interface: Ipv4Addr,
    },
}

struct Running {
    shutdown: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
    node: Node,
    control: Arc<ControlProtocol>,
    heartbeat: Option<Arc<HeartbeatState>>,
}

struct ClientContext {
    engine_id: u64,
    system: NetSystem,
    config: NetConfig,
    remote: SocketAddr,
    control: Arc<ControlProtocol>,
    heartbeat: Option<Arc<HeartbeatState>>,
    shutdown: ShutdownSignal,
    state: Arc<StateCell>,
}

impl ClientContext {
    fn sinks(&self) -> &Sinks {
        self.control.sinks()
    }
}

/// A connecting engine: one TCP connection, one UDP association with a server, or a
/// multicast group membership.
///
/// All reads happen on a dedicated `framenet-client` thread; the heartbeat driver, when
/// enabled, runs beside the read loop on the same thread.
pub struct NetClient {
    system: NetSystem,
    config: Mutex<NetConfig>,
    sinks: Sinks,
    engine_id: u64,
    state: Arc<StateCell>,
    running: Mutex<Option<Running>>,
    last_reported: Mutex<Option<SocketAddr>>,
}

impl NetClient {
    pub fn new(system: NetSystem, config: NetConfig, sinks: Sinks) -> NetClient {
        NetClient {
            engine_id: system.next_engine_id(),
            system,
            config: Mutex::new(config),
            sinks,
            state: Arc::new(StateCell::new()),
            running: Mutex::new(None),
            last_reported: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn protocol(&self) -> Protocol {
        self.config.lock().network.protocol
    }

    /// Turns on the heartbeat driver for the next `start`.
    pub fn enable_heart(&self, period: Duration, max_failures: u32) -> AppResult<()> {
        if self.state.get().is_active() {
            return Err(AlreadyRunning);
        }
        let mut config = self.config.lock();
        config.heartbeat.period_ms = period.as_millis() as u64;
        config.heartbeat.max_failures = max_failures;
        Ok(())
    }

    pub fn start(&self) -> AppResult<Node> {
        if !self.state.begin_start() {
            return Err(AlreadyRunning);
        }
        match self.launch() {
            Ok(node) => {
                if self.state.transition(EngineState::Starting, EngineState::Ready) {
                    self.state.transition(EngineState::Ready, EngineState::Running);
                }
                info!("client {} started", node);
                Ok(node)
            }
            Err(e) => {
                self.state.set(EngineState::Idle);
                Err(e)
            }
        }
    }

    fn launch(&self) -> AppResult<Node> {
        self.reap_previous();
        self.sinks.engine_starting();
        let config = self.config.lock().clone();
        config.validate()?;
        let network = &config.network;
        if network.port == 0 {
            return Err(InvalidValue("a client needs a non-zero remote port".into()));
        }
        let (remote, socket) = match network.protocol {
            Protocol::Tcp => {
                let remote = socket::resolve(&network.host, network.port)?;
                (remote, ClientSocket::Tcp(socket::tcp_connect(remote, network)?))
            }
            Protocol::Udp => {
                let remote = socket::resolve(&network.host, network.port)?;
                (remote, ClientSocket::Udp(socket::udp_client(remote, network)?))
            }
            Protocol::UdpMulticast => {
                let group = socket::parse_ipv4(&network.host)?;
                let interface = socket::parse_ipv4(&config.multicast.interface)?;
                let socket =
                    socket::multicast_receiver(group, network.port, network, &config.multicast)?;
                let remote = SocketAddr::new(IpAddr::V4(group), network.port);
                (
                    remote,
                    ClientSocket::Multicast {
                        socket,
                        group,
                        interface,
                    },
                )
            }
        };

        let heartbeat = (config.heartbeat_enabled() && network.protocol != Protocol::UdpMulticast)
            .then(|| {
                Arc::new(HeartbeatState::new(
                    config.heartbeat_period(),
                    config.heartbeat.max_failures,
                ))
            });
        let role = if network.protocol == Protocol::UdpMulticast {
            Role::Receiver
        } else {
            Role::Client
        };
        let control = Arc::new(ControlProtocol::new(
            role,
            self.sinks.clone(),
            heartbeat.clone(),
        ));
        let shutdown = ShutdownSignal::new();
        let ctx = ClientContext {
            engine_id: self.engine_id,
            system: self.system.clone(),
            config,
            remote,
            control: control.clone(),
            heartbeat: heartbeat.clone(),
            shutdown: shutdown.clone(),
            state: self.state.clone(),
        };

        let (ready_tx, ready_rx) = async_channel::bounded(1);
        let thread = thread::Builder::new()
            .name("framenet-client".to_string())
            .spawn(move || run_client(ctx, socket, ready_tx))?;
        let outcome = ready_rx
            .recv_blocking()
            .map_err(|e| ChannelRecvError(format!("client thread exited during start: {}", e)))
            .and_then(|reported| reported);
        match outcome {
            Ok(node) => {
                *self.running.lock() = Some(Running {
                    shutdown,
                    thread: Some(thread),
                    node: node.clone(),
                    control,
                    heartbeat,
                });
                Ok(node)
            }
            Err(e) => {
                shutdown.trigger();
                if thread.join().is_err() {
                    error!("client thread panicked during start");
                }
                Err(e)
            }
        }
    }

    fn reap_previous(&self) {
        if let Some(previous) = self.running.lock().take() {
            *self.last_reported.lock() = previous.control.reported_addr();
            self.sinks.engine_stopping();
            if let Some(thread) = previous.thread {
                if thread.join().is_err() {
                    error!("previous client thread panicked");
                }
            }
        }
    }

    /// Stops the client. UDP clients tell the server they are leaving first.
    pub fn stop(&self) -> AppResult<()> {
        let mut running = self.running.lock();
        let Some(current) = running.as_mut() else {
            return Err(NotRunning);
        };
        if self.state.get().is_active() {
            self.state.set(EngineState::Stopping);
        }
        current.shutdown.trigger();
        self.sinks.engine_stopping();
        if on_engine_thread(self.engine_id) {
            debug!("client stop requested from its own thread");
            return Ok(());
        }
        let Some(current) = running.take() else {
            return Ok(());
        };
        drop(running);
        *self.last_reported.lock() = current.control.reported_addr();
        if let Some(thread) = current.thread {
            if thread.join().is_err() {
                error!("client thread panicked");
            }
        }
        Ok(())
    }

    /// The client's node while it is open.
    pub fn node(&self) -> Option<Node> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.node.clone())
            .filter(Node::is_open)
    }

    fn open_node(&self) -> AppResult<Node> {
        self.node().ok_or(NotRunning)
    }

    pub fn send(&self, payload: &[u8]) -> AppResult<usize> {
        self.open_node()?.send(payload)
    }

    /// UDP only: sends to an address other than the server.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> AppResult<usize> {
        self.open_node()?.send_to(payload, addr)
    }

    /// Sends a Hello; the server answers with the address it sees us at.
    pub fn hello(&self) -> AppResult<usize> {
        let node = self.open_node()?;
        if node.protocol() == Protocol::UdpMulticast {
            return Err(Unsupported("hello on a multicast receiver".into()));
        }
        node.send_control(ControlKind::Hello, &[])
    }

    /// Sends a single ping outside the heartbeat driver.
    pub fn send_heart(&self) -> AppResult<usize> {
        let node = self.open_node()?;
        if node.protocol() == Protocol::UdpMulticast {
            return Err(Unsupported("heart on a multicast receiver".into()));
        }
        let (sequence, fail_count) = self
            .heartbeat_state()
            .map(|state| (state.last_acked(), state.failures()))
            .unwrap_or((0, 0));
        let beat = HeartBeat {
            sender: node.handle(),
            sequence,
            fail_count,
        };
        node.send_control(ControlKind::Heart, &beat.encode())
    }

    pub fn heartbeat_state(&self) -> Option<Arc<HeartbeatState>> {
        self.running
            .lock()
            .as_ref()
            .and_then(|running| running.heartbeat.clone())
    }

    /// The address the server reported in its Hello reply.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        let current = self
            .running
            .lock()
            .as_ref()
            .and_then(|running| running.control.reported_addr());
        current.or(*self.last_reported.lock())
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr().map(|addr| addr.ip())
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_addr().map(|addr| addr.port())
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        if self.running.get_mut().is_some() {
            if let Err(e) = self.stop() {
                warn!("stopping client on drop: {}", e);
            }
        }
    }
}

fn run_client(
    ctx: ClientContext,
    socket: ClientSocket,
    ready: async_channel::Sender<AppResult<Node>>,
) {
    enter_engine(ctx.engine_id);
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send_blocking(Err(e.into()));
            ctx.state.set(EngineState::Stopped);
            return;
        }
    };
    let state = ctx.state.clone();
    runtime.block_on(async move {
        match socket {
            ClientSocket::Tcp(stream) => {
                let stream = match TcpStream::from_std(stream) {
                    Ok(stream) => Arc::new(stream),
                    Err(e) => {
                        let _ = ready.send_blocking(Err(e.into()));
                        return;
                    }
                };
                let peer = ctx.remote;
                let (node, writer) = Node::tcp_with_writer(
                    ctx.system.next_node_id(),
                    ctx.system.next_handle(),
                    peer,
                    stream.clone(),
                );
                announce(&ctx, &node, ready);
                let session = TcpSession {
                    node: node.clone(),
                    stream,
                    reassembler: StreamReassembler::new(ctx.config.network.max_cache_size),
                    read_buf: BytesMut::with_capacity(ctx.config.network.recv_buffer_size),
                    chunk: ctx.config.network.recv_buffer_size,
                };
                let driver = spawn_heartbeat(&ctx, &node);
                let reason = read_stream(&ctx, session).await;
                finish(&ctx, &node, reason, driver).await;
                // let queued frames reach the socket before the runtime goes away
                if tokio::time::timeout(flush_timeout(&ctx), writer).await.is_err() {
                    debug!("{} closed with unsent frames", node);
                }
            }
            ClientSocket::Udp(socket) => {
                let socket = match UdpSocket::from_std(socket) {
                    Ok(socket) => Arc::new(socket),
                    Err(e) => {
                        let _ = ready.send_blocking(Err(e.into()));
                        return;
                    }
                };
                let node = Node::udp(
                    ctx.system.next_node_id(),
                    ctx.system.next_handle(),
                    Protocol::Udp,
                    ctx.remote,
                    socket.clone(),
                );
                announce(&ctx, &node, ready);
                if let Err(e) = node.send_control(ControlKind::Hello, &[]) {
                    warn!("hello to {} failed: {}", ctx.remote, e);
                }
                let driver = spawn_heartbeat(&ctx, &node);
                let reason = read_datagrams(&ctx, &node, &socket, true).await;
                finish(&ctx, &node, reason, driver).await;
            }
            ClientSocket::Multicast {
                socket,
                group,
                interface,
            } => {
                let socket = match UdpSocket::from_std(socket) {
                    Ok(socket) => Arc::new(socket),
                    Err(e) => {
                        let _ = ready.send_blocking(Err(e.into()));
                        return;
                    }
                };
                let node = Node::udp(
                    ctx.system.next_node_id(),
                    ctx.system.next_handle(),
                    Protocol::UdpMulticast,
                    ctx.remote,
                    socket.clone(),
                );
                announce(&ctx, &node, ready);
                let reason = read_datagrams(&ctx, &node, &socket, false).await;
                if let Err(e) = socket.leave_multicast_v4(group, interface) {
                    debug!("leaving group {} failed: {}", group, e);
                }
                finish(&ctx, &node, reason, None).await;
            }
        }
    });
    drop(runtime);
    state.set(EngineState::Stopped);
}

fn flush_timeout(ctx: &ClientContext) -> Duration {
    ctx.config.timeout().unwrap_or(Duration::from_secs(1))
}

fn announce(ctx: &ClientContext, node: &Node, ready: async_channel::Sender<AppResult<Node>>) {
    ctx.sinks().event(node, NetEvent::Ready(node.to_string()));
    if ready.send_blocking(Ok(node.clone())).is_err() {
        // start() gave up waiting
        ctx.shutdown.trigger();
    }
}

/// The heartbeat runs on its own thread so a slow sink on the read path cannot delay
/// pings or the timeout.
struct HeartbeatDriver {
    exit: oneshot::Receiver<HeartbeatExit>,
    thread: JoinHandle<()>,
}

fn spawn_heartbeat(ctx: &ClientContext, node: &Node) -> Option<HeartbeatDriver> {
    let state = ctx.heartbeat.clone()?;
    let node = node.clone();
    let control = ctx.control.clone();
    let signal = ctx.shutdown.clone();
    let shutdown = ctx.shutdown.subscribe();
    let slice = ctx.config.heartbeat_slice();
    let engine_id = ctx.engine_id;
    let (exit_tx, exit) = oneshot::channel();
    let spawned = thread::Builder::new()
        .name("framenet-heartbeat".to_string())
        .spawn(move || {
            enter_engine(engine_id);
            let runtime = match Builder::new_current_thread().enable_time().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("heartbeat runtime for {} failed: {}", node, e);
                    return;
                }
            };
            let exit = runtime.block_on(heartbeat::drive(&state, &node, slice, shutdown, |beat| {
                control.sinks().event(
                    &node,
                    NetEvent::Heart {
                        sequence: beat.sequence,
                        fail_count: beat.fail_count,
                    },
                )
            }));
            if exit != HeartbeatExit::Shutdown {
                signal.trigger();
            }
            let _ = exit_tx.send(exit);
        });
    match spawned {
        Ok(thread) => Some(HeartbeatDriver { exit, thread }),
        Err(e) => {
            error!("heartbeat thread for {} not started: {}", ctx.remote, e);
            None
        }
    }
}

async fn read_stream(ctx: &ClientContext, mut session: TcpSession) -> StopReason {
    let mut shutdown: Shutdown = ctx.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return StopReason::Requested,
            readable = session.stream.readable() => {
                if let Err(e) = readable {
                    debug!("{} read failed: {}", session.node, e);
                    return StopReason::PeerClosed;
                }
            }
        }
        match try_read_chunk(&mut session) {
            None => continue,
            Some(ReadOutcome::Data) => {
                let TcpSession {
                    node,
                    reassembler,
                    read_buf,
                    ..
                } = &mut session;
                if let Err(e) = reassembler.feed(&read_buf[..], |frame| {
                    ctx.control.dispatch(node, frame);
                }) {
                    warn!("{} sent a corrupt frame header, cache dropped: {}", node, e);
                }
            }
            Some(ReadOutcome::Closed) => {
                debug!("{} closed by peer", session.node);
                return StopReason::PeerClosed;
            }
            Some(ReadOutcome::Failed(e)) => {
                debug!("{} read failed: {}", session.node, e);
                return StopReason::PeerClosed;
            }
        }
    }
}

/// `from_server_only` drops datagrams whose source is not the configured server.
async fn read_datagrams(
    ctx: &ClientContext,
    node: &Node,
    socket: &UdpSocket,
    from_server_only: bool,
) -> StopReason {
    let mut shutdown = ctx.shutdown.subscribe();
    let mut buf = vec![0u8; ctx.config.network.recv_buffer_size.max(MAX_DATAGRAM)];
    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => return StopReason::Requested,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                // an ICMP error from an earlier send; the socket itself is fine
                debug!("{} receive failed: {}", node, e);
                continue;
            }
        };
        if from_server_only && from != ctx.remote {
            trace!("ignoring datagram from {}", from);
            continue;
        }
        let decoded = decode(&buf[..len]);
        if !decoded.complete {
            debug!("dropping incomplete datagram of {} bytes from {}", len, from);
            continue;
        }
        let frame = Frame {
            tag: decoded.tag,
            payload: Bytes::copy_from_slice(decoded.payload),
        };
        if ctx.control.dispatch(node, frame) == Disposition::Quit {
            info!("server {} sent quit", from);
            return StopReason::PeerQuit;
        }
    }
}

async fn finish(
    ctx: &ClientContext,
    node: &Node,
    reason: StopReason,
    driver: Option<HeartbeatDriver>,
) {
    ctx.state.set(EngineState::Stopping);
    ctx.shutdown.trigger();
    let mut timed_out = false;
    if let Some(driver) = driver {
        match driver.exit.await {
            Ok(HeartbeatExit::TimedOut) => {
                info!("{} stopped after heartbeat timeout", node);
                timed_out = true;
            }
            Ok(exit) => trace!("heartbeat driver exited: {:?}", exit),
            Err(_) => error!("heartbeat driver for {} ended without a result", node),
        }
        if driver.thread.join().is_err() {
            error!("heartbeat thread panicked");
        }
    }
    // only a voluntary stop is announced
    if reason == StopReason::Requested && !timed_out && node.protocol() == Protocol::Udp {
        if let Err(e) = node.send_control(ControlKind::Quit, &[]) {
            debug!("quit to {} not sent: {}", node, e);
        }
    }
    if node.close() {
        ctx.sinks().event(node, NetEvent::Quit(node.to_string()));
    }
    debug!("{} finished: {:?}", node, reason);
}
