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

use std::collections::BTreeMap;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::network::{Node, NodeId};
use crate::AppError::IllegalStateError;
use crate::AppResult;

use super::{
    try_read_chunk, Endpoint, Listening, ReadOutcome, Reactor, ReactorKind, ServerContext,
    TcpSession, UdpSession,
};

enum Command {
    Register(TcpSession),
    Deregister(NodeId),
}

enum Readiness {
    Command(Option<Command>),
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Readable(NodeId),
    ReadFailed(NodeId, io::Error),
    Datagram,
}

/// Readiness-polling reactor: one thread, one multiplexed wait over the listener, every
/// registered stream and the command queue.
///
/// In edge-triggered mode a readable socket is drained until it would block; in level
/// mode it gets a single read and the remaining data is picked up on a later round.
/// Streams are polled round robin starting after the last one served.
pub struct ReadinessReactor {
    ctx: Arc<ServerContext>,
    edge_triggered: bool,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl ReadinessReactor {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        ReadinessReactor {
            edge_triggered: ctx.config.reactor.edge_triggered,
            ctx,
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
        }
    }

    async fn serve(
        &self,
        endpoint: Endpoint,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> AppResult<()> {
        let mut shutdown = self.ctx.shutdown.subscribe();
        let (listener, mut udp) = match self.ctx.open(endpoint)? {
            Listening::Tcp(listener) => (Some(listener), None),
            Listening::Udp(session) => (None, Some(session)),
        };
        let mut sessions: BTreeMap<NodeId, TcpSession> = BTreeMap::new();
        let mut cursor: NodeId = 0;
        debug!(
            "readiness reactor running, {} triggered",
            if self.edge_triggered { "edge" } else { "level" }
        );

        loop {
            let readiness = tokio::select! {
                _ = shutdown.recv() => break,
                readiness = poll_fn(|cx| {
                    poll_readiness(cx, commands, listener.as_ref(), udp.as_ref(), &sessions, cursor)
                }) => readiness,
            };
            match readiness {
                Readiness::Command(Some(Command::Register(session))) => {
                    sessions.insert(session.id(), session);
                }
                Readiness::Command(Some(Command::Deregister(id))) => {
                    if let Some(session) = sessions.remove(&id) {
                        self.ctx.close(&session.node);
                    }
                }
                Readiness::Command(None) => break,
                Readiness::Accept(Ok((stream, peer))) => {
                    let session = self.ctx.admit_tcp(stream, peer);
                    self.register(session)?;
                }
                Readiness::Accept(Err(e)) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Readiness::Readable(id) => {
                    cursor = id;
                    self.service_stream(&mut sessions, id);
                }
                Readiness::ReadFailed(id, e) => {
                    if let Some(mut session) = sessions.remove(&id) {
                        self.ctx.on_read_outcome(&mut session, ReadOutcome::Failed(e));
                    }
                }
                Readiness::Datagram => {
                    if let Some(session) = udp.as_mut() {
                        self.service_datagrams(session);
                    }
                }
            }
        }
        self.ctx.farewell();
        Ok(())
    }

    fn service_stream(&self, sessions: &mut BTreeMap<NodeId, TcpSession>, id: NodeId) {
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        let finished = loop {
            match try_read_chunk(session) {
                None => break None,
                Some(ReadOutcome::Data) => {
                    self.ctx.on_stream_bytes(session);
                    if !self.edge_triggered {
                        break None;
                    }
                }
                Some(outcome) => break Some(outcome),
            }
        };
        if let Some(outcome) = finished {
            if let Some(mut session) = sessions.remove(&id) {
                self.ctx.on_read_outcome(&mut session, outcome);
            }
        }
    }

    fn service_datagrams(&self, session: &mut UdpSession) {
        loop {
            let socket = session.socket.clone();
            match socket.try_recv_from(&mut session.recv_buf) {
                Ok((len, from)) => {
                    self.ctx.on_datagram(session, len, from);
                    if !self.edge_triggered {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("udp receive failed: {}", e);
                    return;
                }
            }
        }
    }
}

fn poll_readiness(
    cx: &mut Context<'_>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    listener: Option<&TcpListener>,
    udp: Option<&UdpSession>,
    sessions: &BTreeMap<NodeId, TcpSession>,
    cursor: NodeId,
) -> Poll<Readiness> {
    if let Poll::Ready(command) = commands.poll_recv(cx) {
        return Poll::Ready(Readiness::Command(command));
    }
    if let Some(listener) = listener {
        if let Poll::Ready(accepted) = listener.poll_accept(cx) {
            return Poll::Ready(Readiness::Accept(accepted));
        }
    }
    if let Some(udp) = udp {
        // errors surface on the following receive
        if udp.socket.poll_recv_ready(cx).is_ready() {
            return Poll::Ready(Readiness::Datagram);
        }
    }
    let after = sessions.range((Bound::Excluded(cursor), Bound::Unbounded));
    let up_to = sessions.range(..=cursor);
    for (id, session) in after.chain(up_to) {
        match session.stream.poll_read_ready(cx) {
            Poll::Ready(Ok(())) => return Poll::Ready(Readiness::Readable(*id)),
            Poll::Ready(Err(e)) => return Poll::Ready(Readiness::ReadFailed(*id, e)),
            Poll::Pending => {}
        }
    }
    Poll::Pending
}

impl Reactor for ReadinessReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Readiness
    }

    fn register(&self, session: TcpSession) -> AppResult<()> {
        trace!("register {}", session.node);
        self.commands_tx
            .send(Command::Register(session))
            .map_err(|_| IllegalStateError("readiness reactor is not running".into()))
    }

    fn deregister(&self, node: &Node) -> AppResult<()> {
        self.commands_tx
            .send(Command::Deregister(node.id()))
            .map_err(|_| IllegalStateError("readiness reactor is not running".into()))
    }

    fn run(&self, endpoint: Endpoint) -> AppResult<()> {
        let mut commands = self
            .commands_rx
            .lock()
            .take()
            .ok_or_else(|| IllegalStateError("readiness reactor already ran".into()))?;
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let result = runtime.block_on(self.serve(endpoint, &mut commands));
        // sessions still queued for registration are dropped with the runtime
        commands.close();
        drop(runtime);
        result
    }
}
