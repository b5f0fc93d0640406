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

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::network::Node;
use crate::service::enter_engine;
use crate::AppError::IllegalStateError;
use crate::AppResult;

use super::{
    accept, try_read_chunk, Endpoint, Listening, ReadOutcome, Reactor, ReactorKind,
    ServerContext, TcpSession, UdpSession,
};

/// pending completions per worker before receive tasks wait
const QUEUE_DEPTH_PER_WORKER: usize = 64;

enum Completion {
    Stream {
        session: TcpSession,
        outcome: ReadOutcome,
        repost: oneshot::Sender<TcpSession>,
    },
    Datagram {
        session: UdpSession,
        received: io::Result<(usize, SocketAddr)>,
        repost: oneshot::Sender<UdpSession>,
    },
    Wakeup,
}

struct IoState {
    handle: Handle,
    queue: async_channel::Sender<Completion>,
}

/// Completion-queue reactor.
///
/// The engine thread runs a single threaded I/O runtime with one receive task per node.
/// A receive task performs one read, posts the result together with the session to the
/// shared queue and waits until a worker hands the session back before reading again.
/// Ownership of the session is what serializes processing per node.
pub struct CompletionReactor {
    ctx: Arc<ServerContext>,
    io: Mutex<Option<IoState>>,
}

impl CompletionReactor {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        CompletionReactor {
            ctx,
            io: Mutex::new(None),
        }
    }

    async fn serve(
        &self,
        endpoint: Endpoint,
        queue: async_channel::Sender<Completion>,
    ) -> AppResult<()> {
        let mut shutdown = self.ctx.shutdown.subscribe();
        match self.ctx.open(endpoint)? {
            Listening::Tcp(listener) => loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = accept(&listener) => {
                        let (stream, peer) = accepted?;
                        let session = self.ctx.admit_tcp(stream, peer);
                        self.register(session)?;
                    }
                }
            },
            Listening::Udp(session) => {
                tokio::spawn(receive_datagrams(session, queue));
                shutdown.recv().await;
            }
        }
        self.ctx.farewell();
        Ok(())
    }

    fn spawn_workers(
        &self,
        count: usize,
        queue_tx: &async_channel::Sender<Completion>,
        queue_rx: &async_channel::Receiver<Completion>,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let ctx = self.ctx.clone();
            let queue = queue_rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("framenet-worker-{}", index))
                .spawn(move || worker_loop(index, ctx, queue));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    stop_workers(queue_tx, workers);
                    return Err(e);
                }
            }
        }
        Ok(workers)
    }
}

impl Reactor for CompletionReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Completion
    }

    fn register(&self, session: TcpSession) -> AppResult<()> {
        let io = self.io.lock();
        let io = io
            .as_ref()
            .ok_or_else(|| IllegalStateError("completion reactor is not running".into()))?;
        io.handle.spawn(receive_stream(session, io.queue.clone()));
        Ok(())
    }

    /// The pending receive completes with end of stream and the worker handling it
    /// performs the teardown.
    fn deregister(&self, node: &Node) -> AppResult<()> {
        node.shutdown_stream()
    }

    fn run(&self, endpoint: Endpoint) -> AppResult<()> {
        let worker_count = self.ctx.system.completion_workers();
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (queue_tx, queue_rx) = async_channel::bounded(worker_count * QUEUE_DEPTH_PER_WORKER);
        let workers = self.spawn_workers(worker_count, &queue_tx, &queue_rx)?;
        debug!("completion reactor running with {} workers", worker_count);

        *self.io.lock() = Some(IoState {
            handle: runtime.handle().clone(),
            queue: queue_tx.clone(),
        });
        let result = runtime.block_on(self.serve(endpoint, queue_tx.clone()));
        self.io.lock().take();

        // cancels every receive task; sessions held by workers are dropped when their
        // repost finds no receiver
        drop(runtime);
        stop_workers(&queue_tx, workers);
        result
    }
}

async fn receive_stream(mut session: TcpSession, queue: async_channel::Sender<Completion>) {
    loop {
        let outcome = loop {
            if let Err(e) = session.stream.readable().await {
                break ReadOutcome::Failed(e);
            }
            if let Some(outcome) = try_read_chunk(&mut session) {
                break outcome;
            }
        };
        let (repost, reposted) = oneshot::channel();
        let completion = Completion::Stream {
            session,
            outcome,
            repost,
        };
        if queue.send(completion).await.is_err() {
            return;
        }
        match reposted.await {
            Ok(returned) => session = returned,
            Err(_) => return,
        }
    }
}

async fn receive_datagrams(mut session: UdpSession, queue: async_channel::Sender<Completion>) {
    loop {
        let socket = session.socket.clone();
        let received = socket.recv_from(&mut session.recv_buf).await;
        let (repost, reposted) = oneshot::channel();
        let completion = Completion::Datagram {
            session,
            received,
            repost,
        };
        if queue.send(completion).await.is_err() {
            return;
        }
        match reposted.await {
            Ok(returned) => session = returned,
            Err(_) => return,
        }
    }
}

fn worker_loop(index: usize, ctx: Arc<ServerContext>, queue: async_channel::Receiver<Completion>) {
    enter_engine(ctx.engine_id);
    trace!("completion worker {} started", index);
    while let Ok(completion) = queue.recv_blocking() {
        match completion {
            Completion::Wakeup => break,
            Completion::Stream {
                mut session,
                outcome,
                repost,
            } => {
                if ctx.on_read_outcome(&mut session, outcome) && repost.send(session).is_err() {
                    trace!("receive task gone, dropping session");
                }
            }
            Completion::Datagram {
                mut session,
                received,
                repost,
            } => {
                match received {
                    Ok((len, from)) => ctx.on_datagram(&mut session, len, from),
                    // e.g. an ICMP port unreachable reported on the next receive
                    Err(e) => debug!("udp receive failed: {}", e),
                }
                let _ = repost.send(session);
            }
        }
    }
    trace!("completion worker {} exited", index);
}

/// Posts one wakeup per worker behind any pending completions, then joins them all.
fn stop_workers(queue: &async_channel::Sender<Completion>, workers: Vec<JoinHandle<()>>) {
    for _ in 0..workers.len() {
        if queue.send_blocking(Completion::Wakeup).is_err() {
            break;
        }
    }
    for worker in workers {
        if worker.join().is_err() {
            error!("completion worker panicked");
        }
    }
}
