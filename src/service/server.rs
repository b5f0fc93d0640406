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
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::network::{ControlProtocol, Node, NodeId, Protocol, Role};
use crate::reactor::socket;
use crate::reactor::{new_reactor, Endpoint, Reactor, ReactorKind, ServerContext};
use crate::AppError::{AlreadyRunning, ChannelRecvError, NotRunning, Unsupported};
use crate::AppResult;

use super::registry::UserData;
use super::state::{EngineState, StateCell};
use super::system::on_engine_thread;
use super::{enter_engine, NetConfig, NetEvent, NetSystem, Registry, ShutdownSignal, Sinks};

struct Running {
    shutdown: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
    ctx: Arc<ServerContext>,
    reactor: Arc<dyn Reactor>,
}

/// A listening engine: a TCP acceptor or a UDP socket plus the reactor servicing it.
///
/// `start` blocks until the socket is bound and the Ready event has been emitted, and
/// `stop` blocks until every reactor thread has exited, the registry has been drained
/// (one Quit per node) and the final Quit for the server itself has been emitted.
pub struct NetServer {
    system: NetSystem,
    config: NetConfig,
    sinks: Sinks,
    engine_id: u64,
    state: Arc<StateCell>,
    registry: Arc<Registry>,
    running: Mutex<Option<Running>>,
}

impl NetServer {
    pub fn new(system: NetSystem, config: NetConfig, sinks: Sinks) -> NetServer {
        let registry = Arc::new(Registry::new(sinks.events.clone()));
        NetServer {
            engine_id: system.next_engine_id(),
            system,
            config,
            sinks,
            state: Arc::new(StateCell::new()),
            registry,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn reactor_kind(&self) -> ReactorKind {
        self.config.reactor.kind
    }

    /// Binds and starts serving. Returns the server's own node.
    pub fn start(&self) -> AppResult<Node> {
        if !self.state.begin_start() {
            return Err(AlreadyRunning);
        }
        match self.launch() {
            Ok(node) => {
                if self.state.transition(EngineState::Starting, EngineState::Ready) {
                    self.state.transition(EngineState::Ready, EngineState::Running);
                }
                info!("{} server started on {}", self.config.network.protocol, node.peer_addr());
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
        self.config.validate()?;
        let network = &self.config.network;
        let addr = socket::resolve(&network.host, network.port)?;
        let endpoint = match network.protocol {
            Protocol::Tcp => Endpoint::Tcp(socket::tcp_listener(addr, network)?),
            Protocol::Udp => Endpoint::Udp(socket::udp_bind(addr, network)?),
            Protocol::UdpMulticast => {
                return Err(Unsupported(
                    "a multicast group has no server, use MulticastSender".into(),
                ))
            }
        };

        let shutdown = ShutdownSignal::new();
        let (ready_tx, ready_rx) = async_channel::bounded(1);
        let ctx = Arc::new(ServerContext::new(
            self.engine_id,
            self.system.clone(),
            self.config.clone(),
            self.registry.clone(),
            ControlProtocol::new(Role::Server, self.sinks.clone(), None),
            shutdown.clone(),
            ready_tx,
        ));
        let reactor = new_reactor(ctx.clone());
        *self.running.lock() = Some(Running {
            shutdown: shutdown.clone(),
            thread: None,
            ctx: ctx.clone(),
            reactor: reactor.clone(),
        });

        let state = self.state.clone();
        let engine_id = self.engine_id;
        let spawned = thread::Builder::new()
            .name("framenet-server".to_string())
            .spawn(move || serve(engine_id, ctx, reactor, endpoint, state));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.running.lock().take();
                return Err(e.into());
            }
        };

        let outcome = ready_rx
            .recv_blocking()
            .map_err(|e| ChannelRecvError(format!("server thread exited during start: {}", e)))
            .and_then(|reported| reported);
        match outcome {
            Ok(node) => {
                if let Some(running) = self.running.lock().as_mut() {
                    running.thread = Some(thread);
                }
                Ok(node)
            }
            Err(e) => {
                shutdown.trigger();
                if thread.join().is_err() {
                    error!("server thread panicked during start");
                }
                self.running.lock().take();
                Err(e)
            }
        }
    }

    /// Joins the thread of a run that stopped on its own.
    fn reap_previous(&self) {
        if let Some(previous) = self.running.lock().take() {
            self.sinks.engine_stopping();
            if let Some(thread) = previous.thread {
                if thread.join().is_err() {
                    error!("previous server thread panicked");
                }
            }
        }
    }

    /// Stops serving and waits for teardown, unless called from one of this server's
    /// own threads, in which case the teardown completes after the callback returns.
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
            debug!("server stop requested from its own thread");
            return Ok(());
        }
        let thread = running.take().and_then(|current| current.thread);
        drop(running);
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("server thread panicked");
            }
        }
        Ok(())
    }

    /// The server's own listening node while running.
    pub fn local_node(&self) -> Option<Node> {
        self.running
            .lock()
            .as_ref()
            .and_then(|running| running.ctx.listener())
            .filter(Node::is_open)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_node().map(|node| node.peer_addr())
    }

    pub fn clients(&self) -> Vec<Node> {
        self.registry.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn client(&self, id: NodeId) -> Option<Node> {
        self.registry.get(id)
    }

    /// Sends `payload` to every connected node, returning how many accepted it.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|node| match node.send(payload) {
                Ok(_) => true,
                Err(e) => {
                    debug!("broadcast to {} failed: {}", node, e);
                    false
                }
            })
            .count()
    }

    /// Sends from the server's UDP socket to an arbitrary address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> AppResult<usize> {
        self.local_node().ok_or(NotRunning)?.send_to(payload, addr)
    }

    /// Drops a connection. TCP nodes are shut down and torn down by the reactor; UDP
    /// peers, which have no connection to close, are removed right away.
    pub fn disconnect(&self, id: NodeId) -> AppResult<()> {
        let node = self
            .registry
            .get(id)
            .ok_or_else(|| crate::AppError::NodeClosed(format!("node {} is not connected", id)))?;
        match node.protocol() {
            Protocol::Tcp => {
                let reactor = self
                    .running
                    .lock()
                    .as_ref()
                    .map(|running| running.reactor.clone())
                    .ok_or(NotRunning)?;
                reactor.deregister(&node)
            }
            _ => {
                self.registry.remove(id);
                Ok(())
            }
        }
    }

    pub fn set_user_data(&self, id: NodeId, data: UserData) -> AppResult<()> {
        self.registry.set_user_data(id, data)
    }

    pub fn user_data(&self, id: NodeId) -> Option<UserData> {
        self.registry.user_data(id)
    }
}

impl Drop for NetServer {
    fn drop(&mut self) {
        if self.running.get_mut().is_some() {
            if let Err(e) = self.stop() {
                warn!("stopping server on drop: {}", e);
            }
        }
    }
}

fn serve(
    engine_id: u64,
    ctx: Arc<ServerContext>,
    reactor: Arc<dyn Reactor>,
    endpoint: Endpoint,
    state: Arc<StateCell>,
) {
    enter_engine(engine_id);
    debug!("{:?} reactor starting", reactor.kind());
    if let Err(e) = reactor.run(endpoint) {
        match ctx.take_ready() {
            Some(ready) => {
                let _ = ready.send_blocking(Err(e));
            }
            None => error!("server stopped with error: {}", e),
        }
    }
    state.set(EngineState::Stopping);

    let drained = ctx.registry.remove_all();
    if let Some(node) = ctx.listener() {
        if node.close() {
            ctx.sinks().event(&node, NetEvent::Quit(node.to_string()));
        }
    }
    state.set(EngineState::Stopped);
    info!("server stopped, {} connections closed", drained);
}
